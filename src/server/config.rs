//! Broker Configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::models::{EmbeddingResult, SentenceOptions, TokenPooling, DEFAULT_BATCH_SIZE};
use crate::protocol::DEFAULT_MAX_MESSAGE_SIZE;
use crate::server::directory::BackendDirectory;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub performance: PerformanceConfig,
    pub embedding: EmbeddingConfig,
    pub monitoring: MonitoringConfig,
    pub directory: BackendDirectory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    /// Overrides the port found in the backend directory
    pub port: Option<u16>,
    pub max_connections: usize,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub max_message_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub worker_threads: usize,
    /// Capacity of the broker -> worker queue
    pub message_queue_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Logical backend name, e.g. `fasttext`
    pub backend: String,
    /// Model name or path
    pub model: String,
    pub tokenizer: Option<String>,
    pub max_sequence_length: usize,
    pub default_batch_size: usize,
    pub normalize: bool,
    /// Token reduction for the transformer backends, `mean` or `cls`
    pub token_pooling: TokenPooling,
    /// Refuse to start when the model fails to load
    pub fail_fast: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
}

impl ServerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> EmbeddingResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> EmbeddingResult<Self> {
        let config: ServerConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Options handed to the transformer backends
    pub fn sentence_options(&self) -> SentenceOptions {
        SentenceOptions {
            tokenizer_path: self.embedding.tokenizer.clone(),
            max_sequence_length: self.embedding.max_sequence_length,
            normalize: self.embedding.normalize,
            num_threads: self.performance.worker_threads.max(1),
            token_pooling: self.embedding.token_pooling,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.network.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.network.request_timeout_secs)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: None,
            max_connections: 1024,
            connect_timeout_secs: 5,
            request_timeout_secs: 300,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            message_queue_size: 5000,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: "fasttext".to_string(),
            model: String::new(),
            tokenizer: None,
            max_sequence_length: 256,
            default_batch_size: DEFAULT_BATCH_SIZE,
            normalize: false,
            token_pooling: TokenPooling::Mean,
            fail_fast: true,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}
