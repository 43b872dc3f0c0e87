// 🔗 Similarity Merger - Collapse near-duplicate titles into a target
// Suggestions come from the title index; merges rewrite the store atomically.

use crate::db::{self, Event};
use crate::error::{PipelineError, PipelineResult};
use crate::index::TitleIndex;
use rusqlite::{params_from_iter, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

// ============================================================================
// MERGE TYPES
// ============================================================================

/// What a merge touched; stored as the `titles_merged` event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub target_title: String,
    pub source_titles: Vec<String>,
    pub affected_entry_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeResult {
    /// Entries moved from the sources to the target
    pub merged_count: usize,

    /// Entries under the target after the merge
    pub new_total_count: i64,

    /// Title version written by this merge
    pub title_version: i64,

    pub record: MergeRecord,
}

/// A near-duplicate of the queried title, with its current size
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeCandidate {
    pub title: String,
    pub score: f32,
    pub entry_count: i64,
}

// ============================================================================
// SUGGEST
// ============================================================================

/// Near-duplicates of `title` worth merging into it.
/// Refuses to answer from an index built before the latest merge.
pub fn suggest_merges(
    conn: &Connection,
    index: &TitleIndex,
    title: &str,
    k: usize,
    threshold: f32,
) -> PipelineResult<Vec<MergeCandidate>> {
    index.check_fresh(db::title_version(conn)?)?;

    let hits = index.query(title, k, threshold)?;
    let mut candidates = Vec::with_capacity(hits.len());
    for hit in hits {
        let entry_count = db::count_for_title(conn, &hit.title)?;
        candidates.push(MergeCandidate {
            title: hit.title,
            score: hit.score,
            entry_count,
        });
    }

    Ok(candidates)
}

// ============================================================================
// MERGE
// ============================================================================

/// Rewrite every result titled with one of `sources` to `target`.
///
/// Validation and the rewrite share one immediate transaction, so a failed
/// precondition or a storage error leaves the store untouched.
pub fn merge(
    conn: &mut Connection,
    target: &str,
    sources: &[String],
    actor: &str,
) -> PipelineResult<MergeResult> {
    let sources = dedupe_sources(sources);
    if sources.is_empty() {
        return Err(PipelineError::InvalidMerge(
            "at least one source title is required".to_string(),
        ));
    }
    if sources.iter().any(|s| s == target) {
        return Err(PipelineError::InvalidMerge(format!(
            "target {target:?} is also listed as a source"
        )));
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    for title in std::iter::once(target).chain(sources.iter().map(String::as_str)) {
        if db::count_for_title(&tx, title)? == 0 {
            return Err(PipelineError::unknown_title(title));
        }
    }

    let placeholders = (0..sources.len())
        .map(|i| format!("?{}", i + 1))
        .collect::<Vec<_>>()
        .join(", ");

    let affected_entry_ids: Vec<i64> = {
        let mut stmt = tx.prepare(&format!(
            "SELECT entry_id FROM normalized_results
             WHERE normalized_title IN ({placeholders})
             ORDER BY entry_id ASC"
        ))?;
        let ids = stmt
            .query_map(params_from_iter(sources.iter()), |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        ids
    };

    let target_param = format!("?{}", sources.len() + 1);
    let merged_count = tx.execute(
        &format!(
            "UPDATE normalized_results SET normalized_title = {target_param}
             WHERE normalized_title IN ({placeholders})"
        ),
        params_from_iter(sources.iter().map(String::as_str).chain(std::iter::once(target))),
    )?;

    let title_version = db::bump_title_version(&tx)?;
    let new_total_count = db::count_for_title(&tx, target)?;

    let record = MergeRecord {
        target_title: target.to_string(),
        source_titles: sources,
        affected_entry_ids,
    };

    let event = Event::new(
        "titles_merged",
        "title",
        target,
        json!({
            "record": record,
            "merged_count": merged_count,
            "new_total_count": new_total_count,
            "title_version": title_version,
        }),
        actor,
    );
    db::insert_event(&tx, &event)?;

    tx.commit()?;

    info!(
        target_title = target,
        sources = ?record.source_titles,
        merged_count,
        new_total_count,
        title_version,
        "titles merged"
    );

    Ok(MergeResult {
        merged_count,
        new_total_count,
        title_version,
        record,
    })
}

/// Trim, drop blanks, collapse repeats; first occurrence wins
fn dedupe_sources(sources: &[String]) -> Vec<String> {
    let mut seen = Vec::with_capacity(sources.len());
    for source in sources {
        let source = source.trim();
        if !source.is_empty() && !seen.iter().any(|s: &String| s == source) {
            seen.push(source.to_string());
        }
    }
    seen
}
