// 🏃 Batch Runner - Restart-safe normalization of pending entries
// Sequential, one model call in flight, one write per entry.
//
// Restart safety comes from the store, not from a checkpoint file:
// an entry is "done" exactly when it has a NormalizedResult row.

use crate::db::{self, Entry};
use crate::normalizer::{LanguageModel, NormalizeError, Normalizer};
use crate::retry::RetryPolicy;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

// ============================================================================
// RUN STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Progress of one runner invocation, owned by the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub status: RunStatus,

    /// Results written during this run
    pub processed: usize,

    /// Entries left pending after retries or a parse failure
    pub skipped: usize,

    /// Entries selected for this run
    pub total: usize,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl RunState {
    pub fn new() -> Self {
        RunState {
            run_id: Uuid::new_v4().to_string(),
            status: RunStatus::Idle,
            processed: 0,
            skipped: 0,
            total: 0,
            started_at: None,
            finished_at: None,
            last_error: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    fn start(&mut self) {
        self.status = RunStatus::Running;
        self.started_at.get_or_insert_with(Utc::now);
        self.finished_at = None;
    }

    fn finish(&mut self, outcome: &Result<usize>) {
        self.finished_at = Some(Utc::now());
        match outcome {
            Ok(_) => self.status = RunStatus::Completed,
            Err(e) => {
                self.status = RunStatus::Failed;
                self.last_error = Some(format!("{e:#}"));
            }
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// RUNNER
// ============================================================================

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Retries for rate-limit / transient upstream failures
    pub retry: RetryPolicy,

    /// Pause between entries to stay under calls-per-minute limits
    pub pace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            retry: RetryPolicy::default(),
            pace: Duration::from_millis(50),
        }
    }
}

/// Result of one selection window
#[derive(Debug, Default, Clone, Copy)]
struct BatchOutcome {
    selected: usize,
    processed: usize,
    skipped: usize,
    last_id: i64,
}

pub struct BatchRunner<'a, M> {
    conn: &'a Connection,
    normalizer: Normalizer<M>,
    config: RunnerConfig,
}

impl<'a, M: LanguageModel> BatchRunner<'a, M> {
    pub fn new(conn: &'a Connection, model: M, config: RunnerConfig) -> Self {
        BatchRunner {
            conn,
            normalizer: Normalizer::new(model),
            config,
        }
    }

    /// Normalize up to `batch_size` pending entries (ascending id).
    /// Returns the number of results written.
    pub fn run(&self, batch_size: usize, state: &mut RunState) -> Result<usize> {
        state.start();
        let outcome = self.run_window(0, batch_size, state).map(|b| {
            state.total = b.selected;
            b.processed
        });
        state.finish(&outcome);
        outcome
    }

    /// Keep running batches until every pending entry has been attempted once.
    /// Skipped entries stay pending for the next invocation.
    pub fn run_until_complete(&self, batch_size: usize, state: &mut RunState) -> Result<usize> {
        state.start();
        let outcome = self.drain(batch_size, state);
        state.finish(&outcome);
        outcome
    }

    fn drain(&self, batch_size: usize, state: &mut RunState) -> Result<usize> {
        state.total = db::count_pending(self.conn)? as usize;
        let mut cursor = 0;
        let mut written = 0;
        let mut batch_number = 0;

        loop {
            let batch = self.run_window(cursor, batch_size, state)?;
            if batch.selected == 0 {
                break;
            }
            batch_number += 1;
            written += batch.processed;
            cursor = batch.last_id;

            info!(
                batch = batch_number,
                processed = batch.processed,
                skipped = batch.skipped,
                done = state.processed + state.skipped,
                total = state.total,
                "batch complete"
            );
        }

        Ok(written)
    }

    fn run_window(&self, after_id: i64, batch_size: usize, state: &mut RunState) -> Result<BatchOutcome> {
        let entries = db::pending_entries(self.conn, after_id, batch_size)?;
        let mut outcome = BatchOutcome {
            selected: entries.len(),
            last_id: after_id,
            ..BatchOutcome::default()
        };

        for (i, entry) in entries.iter().enumerate() {
            if i > 0 && !self.config.pace.is_zero() {
                thread::sleep(self.config.pace);
            }

            if self.process_entry(entry)? {
                outcome.processed += 1;
                state.processed += 1;
            } else {
                outcome.skipped += 1;
                state.skipped += 1;
            }
            outcome.last_id = entry.id;
        }

        Ok(outcome)
    }

    /// Ok(true) when a result was written; Ok(false) when the entry was
    /// skipped. Err only for storage failures, which abort the run.
    fn process_entry(&self, entry: &Entry) -> Result<bool> {
        let normalized = self.config.retry.run(
            "normalize",
            || self.normalizer.normalize(&entry.original_text),
            NormalizeError::is_retryable,
        );

        match normalized {
            Ok(normalized) => {
                let result = normalized.into_result(entry.id, self.normalizer.model_name());
                let written = db::save_normalized_result(self.conn, &result)?;
                if written && result.is_fallback {
                    warn!(entry_id = entry.id, "model returned no usable categories; stored fallback pair");
                }
                Ok(written)
            }
            Err(NormalizeError::Parse { raw }) => {
                warn!(entry_id = entry.id, raw = %truncate(&raw, 200), "unparseable model output; skipping");
                Ok(false)
            }
            Err(NormalizeError::Upstream(e)) => {
                warn!(entry_id = entry.id, error = %e, "upstream failure; skipping");
                Ok(false)
            }
        }
    }
}

// ============================================================================
// PROGRESS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub total_entries: i64,
    pub normalized: i64,
    pub fallback: i64,
    pub pending: i64,
    pub percent_complete: f64,
}

pub fn progress(conn: &Connection) -> Result<Progress> {
    let total_entries = db::count_entries(conn)?;
    let normalized = db::count_normalized(conn)?;
    let percent_complete = if total_entries == 0 {
        100.0
    } else {
        normalized as f64 * 100.0 / total_entries as f64
    };

    Ok(Progress {
        total_entries,
        normalized,
        fallback: db::count_fallback(conn)?,
        pending: db::count_pending(conn)?,
        percent_complete,
    })
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{setup_database, CategoryPair};
    use crate::error::{UpstreamError, UpstreamKind};
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    /// Answers per input text; `fail_first` upstream errors before answering
    struct FakeModel {
        answers: HashMap<String, String>,
        failures: RefCell<HashMap<String, (u32, UpstreamKind)>>,
        calls: Cell<usize>,
    }

    impl FakeModel {
        fn new(answers: &[(&str, &str)]) -> Self {
            FakeModel {
                answers: answers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                failures: RefCell::new(HashMap::new()),
                calls: Cell::new(0),
            }
        }

        fn fail_first(self, text: &str, times: u32, kind: UpstreamKind) -> Self {
            self.failures.borrow_mut().insert(text.to_string(), (times, kind));
            self
        }
    }

    impl LanguageModel for FakeModel {
        fn complete(&self, prompt: &str) -> Result<String, UpstreamError> {
            self.calls.set(self.calls.get() + 1);
            let text = prompt.rsplit("Dream: ").next().unwrap_or_default().to_string();

            if let Some((remaining, kind)) = self.failures.borrow_mut().get_mut(&text) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(UpstreamError::new(*kind, "simulated"));
                }
            }

            Ok(self
                .answers
                .get(&text)
                .cloned()
                .unwrap_or_else(|| "no idea".to_string()))
        }

        fn model_name(&self) -> &str {
            "fake-model"
        }
    }

    const DOCTOR: &str = "i want to become a doctor one day";
    const DOCTOR_JSON: &str =
        r#"{"title": "become doctor", "categories": [{"category": "Career", "subcategory": "Medicine"}]}"#;

    fn config() -> RunnerConfig {
        RunnerConfig {
            retry: RetryPolicy::immediate(3),
            pace: Duration::ZERO,
        }
    }

    fn setup(texts: &[&str]) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        for text in texts {
            db::insert_entry(&conn, text, None, None).unwrap();
        }
        conn
    }

    #[test]
    fn test_doctor_scenario_and_second_run_is_noop() {
        let conn = setup(&[DOCTOR]);
        let model = FakeModel::new(&[(DOCTOR, DOCTOR_JSON)]);
        let runner = BatchRunner::new(&conn, &model, config());

        let mut state = RunState::new();
        assert_eq!(runner.run(10, &mut state).unwrap(), 1);
        assert_eq!(state.status, RunStatus::Completed);

        let stored = db::get_normalized_result(&conn, 1).unwrap().unwrap();
        assert_eq!(stored.normalized_title, "become doctor");
        assert_eq!(stored.categories, vec![CategoryPair::new("Career", "Medicine")]);
        assert_eq!(stored.model, "fake-model");

        let mut second = RunState::new();
        assert_eq!(runner.run(10, &mut second).unwrap(), 0);
        assert_eq!(second.total, 0);
        assert_eq!(model.calls.get(), 1);
        assert_eq!(db::count_normalized(&conn).unwrap(), 1);
    }

    #[test]
    fn test_batch_size_limits_and_ascending_order() {
        let conn = setup(&["a", "b", "c"]);
        let answer = r#"{"title": "x", "categories": [{"category": "C", "subcategory": "S"}]}"#;
        let model = FakeModel::new(&[("a", answer), ("b", answer), ("c", answer)]);
        let runner = BatchRunner::new(&conn, &model, config());

        let mut state = RunState::new();
        assert_eq!(runner.run(2, &mut state).unwrap(), 2);
        assert!(db::get_normalized_result(&conn, 1).unwrap().is_some());
        assert!(db::get_normalized_result(&conn, 2).unwrap().is_some());
        assert!(db::get_normalized_result(&conn, 3).unwrap().is_none());
    }

    #[test]
    fn test_rate_limit_retried_then_succeeds() {
        let conn = setup(&[DOCTOR]);
        let model =
            FakeModel::new(&[(DOCTOR, DOCTOR_JSON)]).fail_first(DOCTOR, 2, UpstreamKind::RateLimited);
        let runner = BatchRunner::new(&conn, &model, config());

        let mut state = RunState::new();
        assert_eq!(runner.run(10, &mut state).unwrap(), 1);
        assert_eq!(model.calls.get(), 3);
        assert_eq!(state.skipped, 0);
    }

    #[test]
    fn test_retry_cap_skips_entry_and_continues() {
        let conn = setup(&["flaky", DOCTOR]);
        let model = FakeModel::new(&[(DOCTOR, DOCTOR_JSON)]).fail_first(
            "flaky",
            10,
            UpstreamKind::Transient,
        );
        let runner = BatchRunner::new(&conn, &model, config());

        let mut state = RunState::new();
        assert_eq!(runner.run(10, &mut state).unwrap(), 1);
        assert_eq!(state.skipped, 1);
        // 3 attempts on the flaky entry, 1 on the doctor entry
        assert_eq!(model.calls.get(), 4);
        assert_eq!(db::count_pending(&conn).unwrap(), 1);
    }

    #[test]
    fn test_rejected_and_parse_errors_not_retried() {
        let conn = setup(&["refused", "gibberish"]);
        let model = FakeModel::new(&[]).fail_first("refused", 10, UpstreamKind::Rejected);
        let runner = BatchRunner::new(&conn, &model, config());

        let mut state = RunState::new();
        assert_eq!(runner.run(10, &mut state).unwrap(), 0);
        assert_eq!(state.skipped, 2);
        assert_eq!(model.calls.get(), 2);
    }

    #[test]
    fn test_fallback_results_are_marked() {
        let conn = setup(&["something vague"]);
        let model = FakeModel::new(&[("something vague", r#"{"title": "be happy"}"#)]);
        let runner = BatchRunner::new(&conn, &model, config());

        runner.run(10, &mut RunState::new()).unwrap();

        let stored = db::get_normalized_result(&conn, 1).unwrap().unwrap();
        assert!(stored.is_fallback);
        assert_eq!(stored.categories, vec![CategoryPair::fallback()]);
        assert_eq!(progress(&conn).unwrap().fallback, 1);
    }

    #[test]
    fn test_run_until_complete_passes_stuck_entries() {
        let texts = ["a", "stuck", "b", "c", "d"];
        let conn = setup(&texts);
        let answer = r#"{"title": "x", "categories": [["C", "S"]]}"#;
        let model = FakeModel::new(&[("a", answer), ("b", answer), ("c", answer), ("d", answer)]);
        let runner = BatchRunner::new(&conn, &model, config());

        let mut state = RunState::new();
        assert_eq!(runner.run_until_complete(2, &mut state).unwrap(), 4);
        assert_eq!(state.total, 5);
        assert_eq!(state.skipped, 1);
        assert_eq!(state.status, RunStatus::Completed);

        let p = progress(&conn).unwrap();
        assert_eq!(p.normalized, 4);
        assert_eq!(p.pending, 1);
        assert!((p.percent_complete - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_every_written_result_has_one_to_three_pairs() {
        let conn = setup(&["one", "many", "none"]);
        let model = FakeModel::new(&[
            ("one", r#"{"title": "a", "categories": [["A", "B"]]}"#),
            (
                "many",
                r#"{"title": "b", "categories": [["A","B"],["C","D"],["E","F"],["G","H"]]}"#,
            ),
            ("none", r#"{"title": "c", "categories": []}"#),
        ]);
        let runner = BatchRunner::new(&conn, &model, config());
        runner.run(10, &mut RunState::new()).unwrap();

        for result in db::get_all_normalized_results(&conn).unwrap() {
            assert!((1..=3).contains(&result.categories.len()));
        }
    }

    /// Captures formatted log lines
    #[derive(Clone, Default)]
    struct LogBuffer(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
        type Writer = LogBuffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    fn with_captured_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        let value = tracing::subscriber::with_default(subscriber, f);
        (value, logs.contents())
    }

    /// Another writer normalizes the entry while the model call is in flight
    struct RacingModel<'c> {
        conn: &'c Connection,
    }

    impl LanguageModel for RacingModel<'_> {
        fn complete(&self, _prompt: &str) -> Result<String, UpstreamError> {
            let other = db::NormalizedResult {
                entry_id: 1,
                normalized_title: "be happy".to_string(),
                categories: vec![CategoryPair::new("Personal", "Wellbeing")],
                is_fallback: false,
                model: "other-writer".to_string(),
                normalized_at: Utc::now(),
            };
            db::save_normalized_result(self.conn, &other).unwrap();
            Ok(r#"{"title": "be happy"}"#.to_string())
        }

        fn model_name(&self) -> &str {
            "racing-model"
        }
    }

    #[test]
    fn test_fallback_warning_only_when_stored() {
        let conn = setup(&["something vague"]);
        let model = FakeModel::new(&[("something vague", r#"{"title": "be happy"}"#)]);
        let runner = BatchRunner::new(&conn, &model, config());

        let (written, logs) = with_captured_logs(|| runner.run(10, &mut RunState::new()).unwrap());
        assert_eq!(written, 1);
        assert!(logs.contains("stored fallback pair"));
    }

    #[test]
    fn test_no_fallback_warning_when_result_already_exists() {
        let conn = setup(&["something vague"]);
        let runner = BatchRunner::new(&conn, RacingModel { conn: &conn }, config());

        let mut state = RunState::new();
        let (written, logs) = with_captured_logs(|| runner.run(10, &mut state).unwrap());

        assert_eq!(written, 0);
        assert_eq!(state.skipped, 1);
        assert!(!logs.contains("stored fallback pair"));

        let stored = db::get_normalized_result(&conn, 1).unwrap().unwrap();
        assert_eq!(stored.model, "other-writer");
        assert!(!stored.is_fallback);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abc", 5), "abc");
        assert_eq!(truncate("abcdef", 3), "abc…");
    }
}
