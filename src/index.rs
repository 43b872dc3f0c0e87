// 🧭 Title Index - Embeddings of distinct titles + nearest-neighbour search
// Exact flat search (cosine or L2). Two files per index, loaded together:
// titles.index.json (header + row vectors) and titles.mapping.csv
// (row,title,member_ids in the same row order).
//
// The index remembers the store's title version at build time; any merge
// bumps that version and the index is stale until rebuilt.

use crate::db;
use crate::error::{PipelineError, PipelineResult, UpstreamError};
use crate::retry::RetryPolicy;
use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{debug, info};

pub const INDEX_FILE: &str = "titles.index.json";
pub const MAPPING_FILE: &str = "titles.mapping.csv";
const FORMAT_VERSION: u32 = 1;

// ============================================================================
// EMBEDDING PROVIDER SEAM
// ============================================================================

/// External embedding API. `Sync` so build can fan requests out over threads.
pub trait EmbeddingProvider: Sync {
    /// One vector per input, same order
    fn embed(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, UpstreamError>;

    /// Max inputs per request
    fn batch_size(&self) -> usize {
        32
    }
}

impl<T: EmbeddingProvider + ?Sized> EmbeddingProvider for &T {
    fn embed(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, UpstreamError> {
        (**self).embed(inputs)
    }

    fn batch_size(&self) -> usize {
        (**self).batch_size()
    }
}

// ============================================================================
// TYPES
// ============================================================================

/// Similarity metric for retrieval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// dot(a,b) / (||a|| * ||b||)
    Cosine,
    /// Reported as 1 / (1 + ||a - b||) so higher is always closer
    L2,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TitleIndexEntry {
    pub title: String,
    pub embedding: Vec<f32>,
    pub member_entry_ids: BTreeSet<i64>,
}

/// One query hit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarTitle {
    pub title: String,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub metric: Metric,

    /// Parallel embedding requests during build
    pub concurrency: usize,

    pub retry: RetryPolicy,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            metric: Metric::Cosine,
            concurrency: 1,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct TitleIndex {
    dim: usize,
    metric: Metric,
    title_version: i64,
    built_at: DateTime<Utc>,

    /// Ordered by title; row i of the mapping file
    rows: Vec<TitleIndexEntry>,

    /// Pre-computed L2 norms, parallel to `rows`
    norms: Vec<f32>,

    positions: HashMap<String, usize>,
}

/// Answer to "can similarity search be served from this directory?"
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    Ready { titles: usize, title_version: i64 },
    Missing,
    Inconsistent { reason: String },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }
}

// ============================================================================
// BUILD
// ============================================================================

/// Embed every distinct normalized title and build a fresh index
pub fn build_index<E: EmbeddingProvider>(
    conn: &Connection,
    embedder: &E,
    config: &IndexConfig,
) -> PipelineResult<TitleIndex> {
    let title_version = db::title_version(conn)?;
    let members = db::title_members(conn)?;

    // BTreeMap iteration is title-ordered, so row order is reproducible
    let titles: Vec<String> = members.keys().cloned().collect();
    let texts: Vec<String> = titles.iter().map(|t| embedding_text(t)).collect();

    info!(titles = titles.len(), title_version, "building title index");
    let vectors = embed_all(embedder, &texts, config)?;

    let rows = members
        .into_iter()
        .zip(vectors)
        .map(|((title, ids), embedding)| TitleIndexEntry {
            title,
            embedding,
            member_entry_ids: ids.into_iter().collect(),
        })
        .collect();

    TitleIndex::from_rows(rows, config.metric, title_version, Utc::now())
}

fn embed_all<E: EmbeddingProvider>(
    embedder: &E,
    texts: &[String],
    config: &IndexConfig,
) -> PipelineResult<Vec<Vec<f32>>> {
    let batch_size = embedder.batch_size().max(1);
    let chunks: Vec<&[String]> = texts.chunks(batch_size).collect();
    let workers = config.concurrency.clamp(1, chunks.len().max(1));

    let embed_chunk = |chunk: &[String]| -> Result<Vec<Vec<f32>>, UpstreamError> {
        let inputs: Vec<&str> = chunk.iter().map(String::as_str).collect();
        config
            .retry
            .run("embed", || embedder.embed(&inputs), UpstreamError::is_retryable)
    };

    let mut results: Vec<(usize, Result<Vec<Vec<f32>>, UpstreamError>)> = if workers == 1 {
        chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| (i, embed_chunk(*chunk)))
            .collect()
    } else {
        thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    let chunks = &chunks;
                    let embed_chunk = &embed_chunk;
                    scope.spawn(move || {
                        chunks
                            .iter()
                            .enumerate()
                            .skip(worker)
                            .step_by(workers)
                            .map(|(i, chunk)| (i, embed_chunk(*chunk)))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap_or_default())
                .collect()
        })
    };

    if results.len() != chunks.len() {
        return Err(anyhow!(
            "embedding worker panicked ({} of {} batches returned)",
            results.len(),
            chunks.len()
        )
        .into());
    }

    results.sort_by_key(|(i, _)| *i);
    let mut vectors = Vec::with_capacity(texts.len());
    for (i, result) in results {
        let batch = result?;
        if batch.len() != chunks[i].len() {
            return Err(anyhow!(
                "embedding batch {} returned {} vectors for {} titles",
                i,
                batch.len(),
                chunks[i].len()
            )
            .into());
        }
        debug!(batch = i, size = batch.len(), "embedded batch");
        vectors.extend(batch);
    }

    Ok(vectors)
}

/// Text sent to the embedding API for a title
pub fn embedding_text(title: &str) -> String {
    let trimmed = title.trim();
    let without_to = match trimmed.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("to ") => &trimmed[3..],
        _ => trimmed,
    };

    without_to
        .chars()
        .filter(|c| !matches!(c, '"' | '\'' | '\u{201C}' | '\u{201D}'))
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// INDEX
// ============================================================================

impl TitleIndex {
    /// Assemble an index from rows; rows are re-sorted by title
    pub fn from_rows(
        mut rows: Vec<TitleIndexEntry>,
        metric: Metric,
        title_version: i64,
        built_at: DateTime<Utc>,
    ) -> PipelineResult<TitleIndex> {
        rows.sort_by(|a, b| a.title.cmp(&b.title));

        let dim = rows.first().map(|r| r.embedding.len()).unwrap_or(0);
        let mut positions = HashMap::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            if row.embedding.len() != dim || dim == 0 {
                return Err(PipelineError::IndexCorrupted(format!(
                    "title {:?} has a {}-dimensional vector (expected {})",
                    row.title,
                    row.embedding.len(),
                    dim
                )));
            }
            if positions.insert(row.title.clone(), i).is_some() {
                return Err(PipelineError::IndexCorrupted(format!(
                    "duplicate title {:?}",
                    row.title
                )));
            }
        }

        let norms = rows.iter().map(|r| l2_norm(&r.embedding)).collect();

        Ok(TitleIndex {
            dim,
            metric,
            title_version,
            built_at,
            rows,
            norms,
            positions,
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn title_version(&self) -> i64 {
        self.title_version
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn contains(&self, title: &str) -> bool {
        self.positions.contains_key(title)
    }

    pub fn entry(&self, title: &str) -> Option<&TitleIndexEntry> {
        self.positions.get(title).map(|&i| &self.rows[i])
    }

    pub fn entries(&self) -> &[TitleIndexEntry] {
        &self.rows
    }

    /// Fail with `IndexStale` when a merge happened after this index was built
    pub fn check_fresh(&self, current_version: i64) -> PipelineResult<()> {
        if self.title_version != current_version {
            return Err(PipelineError::IndexStale {
                index_version: self.title_version,
                current_version,
            });
        }
        Ok(())
    }

    /// Nearest titles to an indexed title, excluding itself
    pub fn query(&self, title: &str, k: usize, threshold: f32) -> PipelineResult<Vec<SimilarTitle>> {
        let row = self
            .entry(title)
            .ok_or_else(|| PipelineError::unknown_title(title))?;
        self.query_vector(&row.embedding, Some(title), k, threshold)
    }

    /// Nearest titles to an arbitrary vector.
    /// Results: score >= threshold, score descending, ties by title ascending.
    pub fn query_vector(
        &self,
        vector: &[f32],
        exclude: Option<&str>,
        k: usize,
        threshold: f32,
    ) -> PipelineResult<Vec<SimilarTitle>> {
        if self.rows.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if vector.len() != self.dim {
            return Err(anyhow!(
                "query vector has {} dimensions, index has {}",
                vector.len(),
                self.dim
            )
            .into());
        }

        let query_norm = l2_norm(vector);
        let mut hits: Vec<SimilarTitle> = self
            .rows
            .iter()
            .zip(&self.norms)
            .filter(|(row, _)| Some(row.title.as_str()) != exclude)
            .map(|(row, &norm)| {
                let score = match self.metric {
                    Metric::Cosine => cosine_sim(vector, &row.embedding, query_norm, norm),
                    Metric::L2 => 1.0 / (1.0 + euclidean_dist(vector, &row.embedding)),
                };
                SimilarTitle {
                    title: row.title.clone(),
                    score,
                }
            })
            .filter(|hit| hit.score >= threshold)
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.title.cmp(&b.title))
        });
        hits.truncate(k);

        Ok(hits)
    }

    /// SHA-256 over the ordered titles; ties the mapping file to the vectors
    pub fn titles_digest(&self) -> String {
        digest_titles(self.rows.iter().map(|r| r.title.as_str()))
    }

    // ========================================================================
    // PERSISTENCE
    // ========================================================================

    /// Write both artifacts into `dir` (temp file + rename for each)
    pub fn save(&self, dir: &Path) -> PipelineResult<()> {
        fs::create_dir_all(dir)?;

        let mapping_tmp = dir.join(format!("{MAPPING_FILE}.tmp"));
        {
            let mut writer = csv::Writer::from_path(&mapping_tmp)
                .with_context(|| format!("Failed to create {:?}", mapping_tmp))?;
            for (row, entry) in self.rows.iter().enumerate() {
                writer
                    .serialize(MappingRow {
                        row,
                        title: entry.title.clone(),
                        member_ids: entry
                            .member_entry_ids
                            .iter()
                            .map(|id| id.to_string())
                            .collect::<Vec<_>>()
                            .join(";"),
                    })
                    .context("Failed to write mapping row")?;
            }
            writer.flush()?;
        }

        let index_tmp = dir.join(format!("{INDEX_FILE}.tmp"));
        {
            let file = File::create(&index_tmp)?;
            let mut writer = BufWriter::new(file);
            let header = IndexFile {
                format_version: FORMAT_VERSION,
                dim: self.dim,
                metric: self.metric,
                title_version: self.title_version,
                built_at: self.built_at,
                titles_digest: self.titles_digest(),
                vectors: self.rows.iter().map(|r| r.embedding.clone()).collect(),
            };
            serde_json::to_writer(&mut writer, &header).context("Failed to write index file")?;
            writer.flush()?;
        }

        fs::rename(&mapping_tmp, mapping_path(dir))?;
        fs::rename(&index_tmp, index_path(dir))?;

        info!(dir = %dir.display(), titles = self.rows.len(), "saved title index");
        Ok(())
    }

    /// Load both artifacts, validating that they describe the same rows
    pub fn load(dir: &Path) -> PipelineResult<TitleIndex> {
        let file = File::open(index_path(dir))?;
        let header: IndexFile = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| PipelineError::IndexCorrupted(format!("index file: {e}")))?;

        if header.format_version != FORMAT_VERSION {
            return Err(PipelineError::IndexCorrupted(format!(
                "unsupported format version {}",
                header.format_version
            )));
        }

        let mut reader = csv::Reader::from_path(mapping_path(dir))
            .map_err(|e| PipelineError::IndexCorrupted(format!("mapping file: {e}")))?;
        let mapping = reader
            .deserialize::<MappingRow>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| PipelineError::IndexCorrupted(format!("mapping file: {e}")))?;

        if mapping.len() != header.vectors.len() {
            return Err(PipelineError::IndexCorrupted(format!(
                "mapping has {} rows but index has {} vectors",
                mapping.len(),
                header.vectors.len()
            )));
        }

        if let Some((i, row)) = mapping.iter().enumerate().find(|(i, row)| row.row != *i) {
            return Err(PipelineError::IndexCorrupted(format!(
                "mapping row {} is out of order (found row number {})",
                i, row.row
            )));
        }

        let digest = digest_titles(mapping.iter().map(|r| r.title.as_str()));
        if digest != header.titles_digest {
            return Err(PipelineError::IndexCorrupted(
                "mapping titles do not match the index digest".to_string(),
            ));
        }

        let mut rows = Vec::with_capacity(mapping.len());
        for (row, embedding) in mapping.into_iter().zip(header.vectors) {
            if embedding.len() != header.dim {
                return Err(PipelineError::IndexCorrupted(format!(
                    "row {} has {} dimensions (expected {})",
                    row.row,
                    embedding.len(),
                    header.dim
                )));
            }
            let member_entry_ids = parse_member_ids(&row.member_ids)?;
            rows.push(TitleIndexEntry {
                title: row.title,
                embedding,
                member_entry_ids,
            });
        }

        TitleIndex::from_rows(rows, header.metric, header.title_version, header.built_at)
    }
}

/// Readiness signal for the dashboard: both files exist and agree on size
pub fn readiness(dir: &Path) -> Readiness {
    if !index_path(dir).exists() || !mapping_path(dir).exists() {
        return Readiness::Missing;
    }

    match TitleIndex::load(dir) {
        Ok(index) => Readiness::Ready {
            titles: index.len(),
            title_version: index.title_version(),
        },
        Err(e) => Readiness::Inconsistent {
            reason: e.to_string(),
        },
    }
}

pub fn index_path(dir: &Path) -> PathBuf {
    dir.join(INDEX_FILE)
}

pub fn mapping_path(dir: &Path) -> PathBuf {
    dir.join(MAPPING_FILE)
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    format_version: u32,
    dim: usize,
    metric: Metric,
    title_version: i64,
    built_at: DateTime<Utc>,
    titles_digest: String,
    vectors: Vec<Vec<f32>>,
}

#[derive(Serialize, Deserialize)]
struct MappingRow {
    row: usize,
    title: String,
    member_ids: String,
}

fn parse_member_ids(value: &str) -> PipelineResult<BTreeSet<i64>> {
    value
        .split(';')
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|_| PipelineError::IndexCorrupted(format!("bad member id {s:?}")))
        })
        .collect()
}

fn digest_titles<'a>(titles: impl Iterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for title in titles {
        hasher.update(title.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

#[inline]
fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

#[inline]
fn cosine_sim(a: &[f32], b: &[f32], norm_a: f32, norm_b: f32) -> f32 {
    if norm_a < 1e-8 || norm_b < 1e-8 {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot / (norm_a * norm_b)
}

#[inline]
fn euclidean_dist(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}
