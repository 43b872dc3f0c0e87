// End-to-end: normalize → index → suggest → merge → stale index → rebuild

use dream_pipeline::{
    build_index, database_stats, insert_entry, merge, open_database, progress, readiness,
    suggest_merges, BatchRunner, EmbeddingProvider, IndexConfig, LanguageModel, PipelineError,
    Readiness, RetryPolicy, RunState, RunnerConfig, TitleIndex, UpstreamError,
};
use std::cell::Cell;
use std::collections::HashMap;
use std::time::Duration;

struct FakeModel {
    answers: HashMap<&'static str, &'static str>,
    calls: Cell<usize>,
}

impl LanguageModel for FakeModel {
    fn complete(&self, prompt: &str) -> Result<String, UpstreamError> {
        self.calls.set(self.calls.get() + 1);
        let dream = prompt.rsplit("Dream: ").next().unwrap_or_default();
        Ok(self.answers.get(dream).copied().unwrap_or("no idea").to_string())
    }

    fn model_name(&self) -> &str {
        "fake-model"
    }
}

struct FakeEmbedder {
    vectors: HashMap<&'static str, [f32; 3]>,
}

impl EmbeddingProvider for FakeEmbedder {
    fn embed(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, UpstreamError> {
        Ok(inputs
            .iter()
            .map(|text| self.vectors.get(text).copied().unwrap_or([0.0, 1.0, 0.0]).to_vec())
            .collect())
    }
}

fn fake_model() -> FakeModel {
    let answers = HashMap::from([
        (
            "i want to be rich",
            r#"{"title": "become rich", "categories": [{"category": "Financial", "subcategory": "Wealth"}]}"#,
        ),
        (
            "lots and lots of money",
            "```json\n{\"title\": \"get rich\", \"categories\": [[\"Financial\", \"Wealth\"]]}\n```",
        ),
        (
            "להיות עשיר מאוד",
            r#"{"title": "Become Wealthy.", "categories": ["Financial|Wealth"]}"#,
        ),
        (
            "learn to play the piano",
            r#"{"title": "learn piano", "categories": [{"category": "Education", "subcategory": "Music"}, {"category": "Hobbies", "subcategory": "Music"}]}"#,
        ),
    ]);
    FakeModel {
        answers,
        calls: Cell::new(0),
    }
}

fn fake_embedder() -> FakeEmbedder {
    FakeEmbedder {
        vectors: HashMap::from([
            ("become rich", [1.0, 0.0, 0.0]),
            ("get rich", [0.95, 0.05, 0.0]),
            ("become wealthy", [0.9, 0.1, 0.0]),
            ("learn piano", [0.0, 0.0, 1.0]),
        ]),
    }
}

fn runner_config() -> RunnerConfig {
    RunnerConfig {
        retry: RetryPolicy::immediate(2),
        pace: Duration::ZERO,
    }
}

fn index_config() -> IndexConfig {
    IndexConfig {
        concurrency: 2,
        retry: RetryPolicy::immediate(2),
        ..IndexConfig::default()
    }
}

#[test]
fn test_full_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let index_dir = dir.path().join("index");
    let mut conn = open_database(&dir.path().join("dreams.db")).unwrap();

    for (text, age) in [
        ("i want to be rich", 17),
        ("i want to be rich", 34),
        ("lots and lots of money", 22),
        ("להיות עשיר מאוד", 41),
        ("learn to play the piano", 9),
        ("   ", 30),
    ] {
        insert_entry(&conn, text, Some("someone"), Some(age)).unwrap();
    }

    // Normalize everything; the blank entry stays pending
    let model = fake_model();
    let runner = BatchRunner::new(&conn, &model, runner_config());
    let mut state = RunState::new();
    assert_eq!(runner.run_until_complete(2, &mut state).unwrap(), 5);
    assert_eq!(state.skipped, 1);

    let p = progress(&conn).unwrap();
    assert_eq!(p.normalized, 5);
    assert_eq!(p.pending, 1);

    // Restart: nothing new to write, no extra model calls for finished entries
    let calls_before = model.calls.get();
    let mut second = RunState::new();
    assert_eq!(runner.run(10, &mut second).unwrap(), 0);
    assert_eq!(model.calls.get(), calls_before);

    // Index
    assert_eq!(readiness(&index_dir), Readiness::Missing);
    let embedder = fake_embedder();
    let index = build_index(&conn, &embedder, &index_config()).unwrap();
    assert_eq!(index.len(), 4);
    index.save(&index_dir).unwrap();
    assert_eq!(
        readiness(&index_dir),
        Readiness::Ready {
            titles: 4,
            title_version: 0
        }
    );

    // Suggest from the reloaded index
    let loaded = TitleIndex::load(&index_dir).unwrap();
    let candidates = suggest_merges(&conn, &loaded, "become rich", 5, 0.9).unwrap();
    let titles: Vec<&str> = candidates.iter().map(|c| c.title.as_str()).collect();
    assert_eq!(titles, vec!["get rich", "become wealthy"]);
    assert!(candidates.iter().all(|c| c.entry_count == 1));

    // Merge
    let sources: Vec<String> = candidates.into_iter().map(|c| c.title).collect();
    let result = merge(&mut conn, "become rich", &sources, "test").unwrap();
    assert_eq!(result.merged_count, 2);
    assert_eq!(result.new_total_count, 4);

    // Old index refuses to answer
    let err = suggest_merges(&conn, &loaded, "become rich", 5, 0.9).unwrap_err();
    assert!(matches!(err, PipelineError::IndexStale { .. }));

    // Rebuild picks up the merged titles
    let rebuilt = build_index(&conn, &embedder, &index_config()).unwrap();
    rebuilt.save(&index_dir).unwrap();
    let reloaded = TitleIndex::load(&index_dir).unwrap();
    assert_eq!(reloaded.len(), 2);
    assert!(suggest_merges(&conn, &reloaded, "become rich", 5, 0.9)
        .unwrap()
        .is_empty());

    let stats = database_stats(&conn).unwrap();
    assert_eq!(stats.unique_titles, 2);
    assert_eq!(stats.unique_categories, 2);
}
