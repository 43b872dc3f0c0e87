// ⚙️ Pipeline Config - Settings shared by the CLI and library callers
// Populated by the binary from flags / environment; defaults match the hosted APIs.

use crate::index::{IndexConfig, Metric};
use crate::retry::RetryPolicy;
use crate::runner::RunnerConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CHAT_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_CHAT_MODEL: &str = "llama-3.3-70b-versatile";
pub const DEFAULT_EMBEDDING_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout_secs: u64,
}

impl Default for ChatSettings {
    fn default() -> Self {
        ChatSettings {
            base_url: DEFAULT_CHAT_BASE_URL.to_string(),
            model: DEFAULT_CHAT_MODEL.to_string(),
            temperature: 0.1,
            max_tokens: 300,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub base_url: String,
    pub model: String,

    /// Requested vector size; `None` keeps the model's native size
    pub dimensions: Option<usize>,

    /// Titles per embedding request
    pub batch_size: usize,

    /// Embedding requests in flight during an index build
    pub concurrency: usize,

    pub metric: Metric,
    pub timeout_secs: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        EmbeddingSettings {
            base_url: DEFAULT_EMBEDDING_BASE_URL.to_string(),
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            dimensions: None,
            batch_size: 100,
            concurrency: 4,
            metric: Metric::Cosine,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub db_path: PathBuf,

    /// Directory holding `titles.index.json` and `titles.mapping.csv`
    pub index_dir: PathBuf,

    pub chat: ChatSettings,
    pub embedding: EmbeddingSettings,
    pub retry: RetryPolicy,

    /// Entries per runner batch
    pub batch_size: usize,

    /// Pause between model calls, in milliseconds
    pub pace_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            db_path: PathBuf::from("dreams.db"),
            index_dir: PathBuf::from("index"),
            chat: ChatSettings::default(),
            embedding: EmbeddingSettings::default(),
            retry: RetryPolicy::default(),
            batch_size: 100,
            pace_ms: 50,
        }
    }
}

impl PipelineConfig {
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            retry: self.retry.clone(),
            pace: Duration::from_millis(self.pace_ms),
        }
    }

    pub fn index_config(&self) -> IndexConfig {
        IndexConfig {
            metric: self.embedding.metric,
            concurrency: self.embedding.concurrency.max(1),
            retry: self.retry.clone(),
        }
    }
}
