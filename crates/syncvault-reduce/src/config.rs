//! Repository and engine configuration (TOML or JSON).

use crate::chunker::{Chunker, ChunkerConfig};
use crate::error::{ReduceError, ReduceResult};
use crate::keys::MasterKey;
use crate::multichunk::MultiChunkerConfig;
use crate::transformer::{default_descriptors, TransformScope, TransformerChain, TransformerDescriptor};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use syncvault_transfer::RetryConfig;

/// Everything another process needs to read a repository's containers,
/// apart from the master key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Chunking strategy.
    pub chunker: ChunkerConfig,
    /// Container packing.
    pub multichunker: MultiChunkerConfig,
    /// Transformer chain, in encode order.
    pub transformers: Vec<TransformerDescriptor>,
    /// Unit the chain is applied to.
    pub transform_scope: TransformScope,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            multichunker: MultiChunkerConfig::default(),
            transformers: default_descriptors(),
            transform_scope: TransformScope::default(),
        }
    }
}

impl RepoConfig {
    /// Config without any transformer (plaintext containers).
    pub fn plaintext() -> Self {
        Self {
            transformers: Vec::new(),
            ..Self::default()
        }
    }

    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> ReduceResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| ReduceError::Config(format!("{}: {e}", path.display()))),
            "json" => serde_json::from_str(&contents)
                .map_err(|e| ReduceError::Config(format!("{}: {e}", path.display()))),
            _ => Err(ReduceError::Config(format!(
                "Unsupported config file extension: {ext}"
            ))),
        }
    }

    /// Build the chunker.
    pub fn build_chunker(&self) -> ReduceResult<Box<dyn Chunker>> {
        self.chunker.build()
    }

    /// Build the transformer chain.
    pub fn build_chain(&self, master_key: Option<&MasterKey>) -> ReduceResult<TransformerChain> {
        TransformerChain::from_descriptors(&self.transformers, master_key)
    }

    /// Check every part without keeping the built objects.
    pub fn validate(&self, master_key: Option<&MasterKey>) -> ReduceResult<()> {
        self.build_chunker()?;
        self.multichunker.threshold_bytes()?;
        self.build_chain(master_key)?;
        Ok(())
    }
}

/// Runtime settings of a [`crate::SyncEngine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Repository layout.
    #[serde(default)]
    pub repo: RepoConfig,
    /// Upload/download retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Local directory for outgoing and downloaded blobs.
    pub cache_dir: PathBuf,
}

impl EngineConfig {
    /// Default repository layout with the given cache directory.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo: RepoConfig::default(),
            retry: RetryConfig::default(),
            cache_dir: cache_dir.into(),
        }
    }

    /// Replace the repository layout.
    pub fn with_repo(mut self, repo: RepoConfig) -> Self {
        self.repo = repo;
        self
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}
