// Dream Pipeline - Core Library
// Normalize raw dream entries, index their titles, merge near-duplicates.

pub mod db;
pub mod error;
pub mod retry;
pub mod normalizer; // Free text → title + category pairs
pub mod llm;        // HTTP clients for chat + embeddings
pub mod runner;     // Restart-safe batch normalization
pub mod index;      // Title embeddings + nearest-neighbour search
pub mod merger;     // Near-duplicate title merges
pub mod aggregates; // Read-only grouped queries
pub mod config;

// Re-export commonly used types
pub use db::{
    CategoryPair, Entry, Event, NormalizedResult,
    open_database, setup_database, insert_entry, pending_entries,
    save_normalized_result, get_normalized_result, title_version,
    insert_event, get_events_for_entity,
};
pub use error::{PipelineError, PipelineResult, UpstreamError, UpstreamKind};
pub use retry::RetryPolicy;
pub use normalizer::{LanguageModel, NormalizeError, Normalized, Normalizer};
pub use llm::{ChatClient, OpenAiEmbedder};
pub use runner::{progress, BatchRunner, Progress, RunState, RunStatus, RunnerConfig};
pub use index::{
    build_index, readiness, EmbeddingProvider, IndexConfig, Metric, Readiness,
    SimilarTitle, TitleIndex, TitleIndexEntry,
};
pub use merger::{merge, suggest_merges, MergeCandidate, MergeRecord, MergeResult};
pub use aggregates::{
    category_breakdown, database_stats, unique_titles, CategoryLevel, CategoryStat,
    DatabaseStats, SortOrder, TitleFilter, TitleSort, TitlePage, TitleSummary,
};
pub use config::PipelineConfig;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
