//! TOML configuration.
//!
//! Every section is optional; a missing file section falls back to its
//! defaults, so an empty file is a valid configuration:
//!
//! ```toml
//! knowledge_base_path = "./data/memory.sqlite"
//!
//! [security]
//! anonymous_role = "reader"
//! [security.roles]
//! admin = ["admin"]
//! reader = ["read"]
//! [security.users]
//! alice = "admin"
//!
//! [chunking]
//! max_chunk_size = 800
//! overlap_percent = 10
//!
//! [embedding]
//! provider = "hash"
//! dims = 384
//!
//! [llm]
//! provider = "ollama"
//! model = "llama3.1"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use context_memory_core::access::SecurityConfig;
use context_memory_core::cache::CacheConfig;
use context_memory_core::chunk::ChunkingConfig;
use context_memory_core::models::MetadataFilter;
use context_memory_core::EngineError;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// SQLite database holding the durable index.
    pub knowledge_base_path: PathBuf,
    pub security: SecurityConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub cache: CacheConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Chunks retrieved per query.
    pub k: usize,
    /// Default per-topic limit for focused context.
    pub max_per_topic: usize,
    /// Timeout applied to each provider call.
    pub timeout_secs: u64,
    /// Filter merged into every QA retrieval.
    pub default_filter: MetadataFilter,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: 4,
            max_per_topic: 3,
            timeout_secs: 30,
            default_filter: MetadataFilter::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `hash`, `openai`, `ollama`, or `disabled`.
    pub provider: String,
    pub model: Option<String>,
    pub dims: Option<usize>,
    /// Base URL override for HTTP providers.
    pub url: Option<String>,
    pub batch_size: usize,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hash".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    /// `ollama`, `openai`, or `disabled`.
    pub provider: String,
    pub model: Option<String>,
    pub url: Option<String>,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            url: None,
            max_retries: 3,
            timeout_secs: 120,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            knowledge_base_path: PathBuf::from("./data/context-memory.sqlite"),
            security: SecurityConfig::default(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            cache: CacheConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

impl Config {
    /// Configuration for a database at `path` with every other section
    /// at its defaults.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            knowledge_base_path: path.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> context_memory_core::Result<()> {
        if self.knowledge_base_path.as_os_str().is_empty() {
            return Err(EngineError::validation("knowledge_base_path must be set"));
        }
        self.chunking.validate()?;
        self.cache.validate()?;
        self.security.validate()?;

        if self.retrieval.k == 0 {
            return Err(EngineError::validation("retrieval.k must be >= 1"));
        }
        if self.retrieval.max_per_topic == 0 {
            return Err(EngineError::validation("retrieval.max_per_topic must be >= 1"));
        }
        if self.retrieval.timeout_secs == 0 {
            return Err(EngineError::validation("retrieval.timeout_secs must be >= 1"));
        }

        match self.embedding.provider.as_str() {
            "hash" | "disabled" => {}
            "openai" | "ollama" => {
                if self.embedding.model.is_none() {
                    return Err(EngineError::validation(format!(
                        "embedding.model must be specified when provider is '{}'",
                        self.embedding.provider
                    )));
                }
                if self.embedding.dims.is_none() {
                    return Err(EngineError::validation(format!(
                        "embedding.dims must be specified when provider is '{}'",
                        self.embedding.provider
                    )));
                }
            }
            other => {
                return Err(EngineError::validation(format!(
                    "unknown embedding provider '{other}': must be hash, openai, ollama, or disabled"
                )))
            }
        }
        if self.embedding.dims == Some(0) {
            return Err(EngineError::validation("embedding.dims must be > 0"));
        }
        if self.embedding.batch_size == 0 {
            return Err(EngineError::validation("embedding.batch_size must be > 0"));
        }

        match self.llm.provider.as_str() {
            "ollama" | "openai" | "disabled" => {}
            other => {
                return Err(EngineError::validation(format!(
                    "unknown llm provider '{other}': must be ollama, openai, or disabled"
                )))
            }
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a TOML document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}
