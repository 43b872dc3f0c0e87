use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Maximum number of (category, subcategory) pairs per entry
pub const MAX_CATEGORY_PAIRS: usize = 3;

/// Substituted when the model output carries no usable categories
pub const FALLBACK_CATEGORY: &str = "Uncategorized";
pub const FALLBACK_SUBCATEGORY: &str = "Unspecified";

const TITLE_VERSION_KEY: &str = "title_version";

/// Raw dream entry owned by the record store (never mutated here)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: i64,
    pub original_text: String,
    pub created_at: DateTime<Utc>,

    // Dashboard-side fields, only read by the aggregate queries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_at_dream: Option<i64>,
}

/// One taxonomy assignment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CategoryPair {
    pub category: String,
    pub subcategory: String,
}

impl CategoryPair {
    pub fn new(category: impl Into<String>, subcategory: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            subcategory: subcategory.into(),
        }
    }

    pub fn fallback() -> Self {
        Self::new(FALLBACK_CATEGORY, FALLBACK_SUBCATEGORY)
    }

    pub fn is_valid(&self) -> bool {
        !self.category.trim().is_empty() && !self.subcategory.trim().is_empty()
    }
}

/// Normalizer output persisted once per entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedResult {
    pub entry_id: i64,
    pub normalized_title: String,

    /// Ordered, 1..=3 pairs
    pub categories: Vec<CategoryPair>,

    /// True when `categories` is the substituted fallback pair
    pub is_fallback: bool,

    pub model: String,
    pub normalized_at: DateTime<Utc>,
}

impl NormalizedResult {
    /// Check the 1..=3 non-empty pairs invariant and a non-empty title
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.normalized_title.trim().is_empty(),
            "entry {} has an empty normalized title",
            self.entry_id
        );
        anyhow::ensure!(
            (1..=MAX_CATEGORY_PAIRS).contains(&self.categories.len()),
            "entry {} has {} category pairs (expected 1..={})",
            self.entry_id,
            self.categories.len(),
            MAX_CATEGORY_PAIRS
        );
        anyhow::ensure!(
            self.categories.iter().all(CategoryPair::is_valid),
            "entry {} has an empty category or subcategory",
            self.entry_id
        );
        Ok(())
    }
}

/// Event for the audit trail
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

pub fn open_database(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("Failed to open database {:?}", db_path))?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // ==========================================================================
    // Dreams Table (raw entries, written by the dashboard importer)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS dreams (
            id INTEGER PRIMARY KEY,
            original_text TEXT NOT NULL,
            username TEXT,
            age_at_dream INTEGER,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Normalized Results (at most one row per dream)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS normalized_results (
            entry_id INTEGER PRIMARY KEY REFERENCES dreams(id),
            normalized_title TEXT NOT NULL CHECK (normalized_title <> ''),
            category_1 TEXT NOT NULL,
            subcategory_1 TEXT NOT NULL,
            category_2 TEXT,
            subcategory_2 TEXT,
            category_3 TEXT,
            subcategory_3 TEXT,
            is_fallback INTEGER NOT NULL DEFAULT 0,
            model TEXT NOT NULL,
            normalized_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Pipeline metadata (title_version counter)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS pipeline_meta (
            key TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO pipeline_meta (key, value) VALUES (?1, 0)",
        params![TITLE_VERSION_KEY],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_normalized_title ON normalized_results(normalized_title)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_category_1 ON normalized_results(category_1)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// ENTRIES
// ============================================================================

/// Insert a raw entry, returning its id
pub fn insert_entry(
    conn: &Connection,
    original_text: &str,
    username: Option<&str>,
    age_at_dream: Option<i64>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO dreams (original_text, username, age_at_dream, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![original_text, username, age_at_dream, Utc::now().to_rfc3339()],
    )?;

    Ok(conn.last_insert_rowid())
}

/// Entries without a NormalizedResult, ascending id, strictly after `after_id`
pub fn pending_entries(conn: &Connection, after_id: i64, limit: usize) -> Result<Vec<Entry>> {
    let mut stmt = conn.prepare(
        "SELECT d.id, d.original_text, d.username, d.age_at_dream, d.created_at
         FROM dreams d
         LEFT JOIN normalized_results n ON n.entry_id = d.id
         WHERE n.entry_id IS NULL AND d.id > ?1
         ORDER BY d.id ASC
         LIMIT ?2",
    )?;

    let entries = stmt
        .query_map(params![after_id, limit as i64], |row| {
            let created_at_str: String = row.get(4)?;
            Ok(Entry {
                id: row.get(0)?,
                original_text: row.get(1)?,
                username: row.get(2)?,
                age_at_dream: row.get(3)?,
                created_at: parse_timestamp(&created_at_str),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(entries)
}

pub fn count_entries(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM dreams", [], |row| row.get(0))?;
    Ok(count)
}

pub fn count_pending(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM dreams d
         LEFT JOIN normalized_results n ON n.entry_id = d.id
         WHERE n.entry_id IS NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ============================================================================
// NORMALIZED RESULTS
// ============================================================================

/// Persist one result. Returns false (and writes nothing) when the entry
/// already has a result, which keeps reruns idempotent.
pub fn save_normalized_result(conn: &Connection, result: &NormalizedResult) -> Result<bool> {
    result.validate()?;

    let pair = |i: usize| result.categories.get(i);
    let tx = conn.unchecked_transaction()?;

    let inserted = tx.execute(
        "INSERT INTO normalized_results (
            entry_id, normalized_title,
            category_1, subcategory_1, category_2, subcategory_2, category_3, subcategory_3,
            is_fallback, model, normalized_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            result.entry_id,
            result.normalized_title,
            pair(0).map(|p| &p.category),
            pair(0).map(|p| &p.subcategory),
            pair(1).map(|p| &p.category),
            pair(1).map(|p| &p.subcategory),
            pair(2).map(|p| &p.category),
            pair(2).map(|p| &p.subcategory),
            result.is_fallback,
            result.model,
            result.normalized_at.to_rfc3339(),
        ],
    );

    match inserted {
        Ok(_) => {}
        // Only an existing result for this entry counts as "already done";
        // a missing dream row (foreign key) is a real failure
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    }

    let event = Event::new(
        "entry_normalized",
        "dream",
        &result.entry_id.to_string(),
        serde_json::json!({
            "title": result.normalized_title,
            "categories": result.categories,
            "is_fallback": result.is_fallback,
        }),
        "batch_runner",
    );
    insert_event(&tx, &event)?;
    tx.commit()?;

    Ok(true)
}

pub fn get_normalized_result(conn: &Connection, entry_id: i64) -> Result<Option<NormalizedResult>> {
    let result = conn
        .query_row(
            "SELECT entry_id, normalized_title,
                    category_1, subcategory_1, category_2, subcategory_2, category_3, subcategory_3,
                    is_fallback, model, normalized_at
             FROM normalized_results
             WHERE entry_id = ?1",
            params![entry_id],
            row_to_normalized,
        )
        .optional()?;

    Ok(result)
}

pub fn get_all_normalized_results(conn: &Connection) -> Result<Vec<NormalizedResult>> {
    let mut stmt = conn.prepare(
        "SELECT entry_id, normalized_title,
                category_1, subcategory_1, category_2, subcategory_2, category_3, subcategory_3,
                is_fallback, model, normalized_at
         FROM normalized_results
         ORDER BY entry_id ASC",
    )?;

    let results = stmt
        .query_map([], row_to_normalized)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(results)
}

fn row_to_normalized(row: &Row<'_>) -> rusqlite::Result<NormalizedResult> {
    let mut categories = Vec::with_capacity(MAX_CATEGORY_PAIRS);
    for i in 0..MAX_CATEGORY_PAIRS {
        let category: Option<String> = row.get(2 + i * 2)?;
        let subcategory: Option<String> = row.get(3 + i * 2)?;
        if let (Some(category), Some(subcategory)) = (category, subcategory) {
            categories.push(CategoryPair { category, subcategory });
        }
    }

    let normalized_at: String = row.get(10)?;

    Ok(NormalizedResult {
        entry_id: row.get(0)?,
        normalized_title: row.get(1)?,
        categories,
        is_fallback: row.get(8)?,
        model: row.get(9)?,
        normalized_at: parse_timestamp(&normalized_at),
    })
}

pub fn count_normalized(conn: &Connection) -> Result<i64> {
    let count: i64 =
        conn.query_row("SELECT COUNT(*) FROM normalized_results", [], |row| row.get(0))?;
    Ok(count)
}

pub fn count_fallback(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM normalized_results WHERE is_fallback = 1",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Number of entries currently under `title`
pub fn count_for_title(conn: &Connection, title: &str) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM normalized_results WHERE normalized_title = ?1",
        params![title],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Distinct titles with their member entry ids, ordered by title
pub fn title_members(conn: &Connection) -> Result<BTreeMap<String, Vec<i64>>> {
    let mut stmt = conn.prepare(
        "SELECT normalized_title, entry_id
         FROM normalized_results
         ORDER BY normalized_title ASC, entry_id ASC",
    )?;

    let mut members: BTreeMap<String, Vec<i64>> = BTreeMap::new();
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    for row in rows {
        let (title, entry_id) = row?;
        members.entry(title).or_default().push(entry_id);
    }

    Ok(members)
}

// ============================================================================
// TITLE VERSION (bumped by every merge)
// ============================================================================

pub fn title_version(conn: &Connection) -> Result<i64> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT value FROM pipeline_meta WHERE key = ?1",
            params![TITLE_VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;

    Ok(version.unwrap_or(0))
}

/// Increment and return the new version. Call inside the merge transaction.
pub fn bump_title_version(conn: &Connection) -> Result<i64> {
    conn.execute(
        "INSERT INTO pipeline_meta (key, value) VALUES (?1, 1)
         ON CONFLICT(key) DO UPDATE SET value = value + 1",
        params![TITLE_VERSION_KEY],
    )?;

    title_version(conn)
}

// ============================================================================
// AUDIT TRAIL
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_timestamp(&timestamp_str),
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).unwrap_or(serde_json::Value::Null),
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}
