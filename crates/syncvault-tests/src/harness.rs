//! Test Harness - throwaway repositories, connections and engines

use crate::unreliable::{UnreliableLocalPlugin, SETTING_PATTERNS, UNRELIABLE_PLUGIN_ID};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use syncvault_reduce::{
    default_descriptors, DedupIndex, EngineConfig, KdfParams, MasterKey, MemoryDedupIndex,
    RepoConfig, SyncEngine,
};
use syncvault_transfer::local::SETTING_PATH;
use syncvault_transfer::{
    Connection, ConnectionConfig, PluginRegistry, PluginSettings, RetryConfig, TransferPool,
    LOCAL_PLUGIN_ID,
};
use tempfile::TempDir;

/// Passphrase of every test master key.
pub const TEST_PASSPHRASE: &str = "some password";

/// Cheap KDF so tests don't spend a second per key.
pub const TEST_KDF: KdfParams = KdfParams { rounds: 1_000 };

/// One master key per test process; derivation is the slow part.
pub fn test_master_key() -> MasterKey {
    static KEY: OnceLock<MasterKey> = OnceLock::new();
    KEY.get_or_init(|| {
        MasterKey::create(TEST_PASSPHRASE, &TEST_KDF).expect("test master key")
    })
    .clone()
}

/// Registry with the built-in plugins plus `unreliable_local`.
pub fn test_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::with_builtin_plugins();
    registry
        .register(Arc::new(UnreliableLocalPlugin))
        .expect("unreliable_local registers once");
    registry
}

/// Repository layout used by most tests: zstd then cipher "1,2", 4 MiB containers.
pub fn test_repo_config(crypto: bool) -> RepoConfig {
    RepoConfig {
        transformers: if crypto { default_descriptors() } else { Vec::new() },
        ..RepoConfig::default()
    }
}

/// Deterministic pseudo-random bytes (incompressible, chunk-friendly).
pub fn random_bytes(size: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; size];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

/// A temp directory holding one repository and any number of client caches.
#[derive(Debug)]
pub struct TestRepo {
    temp_dir: TempDir,
    crypto: bool,
    repo_config: RepoConfig,
    retry: RetryConfig,
}

impl TestRepo {
    pub fn new() -> Self {
        Self::with_crypto(true)
    }

    pub fn with_crypto(crypto: bool) -> Self {
        let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
        Self {
            temp_dir,
            crypto,
            repo_config: test_repo_config(crypto),
            retry: RetryConfig {
                initial_backoff: std::time::Duration::from_millis(1),
                max_backoff: std::time::Duration::from_millis(5),
                ..RetryConfig::default()
            },
        }
    }

    pub fn with_repo_config(mut self, repo_config: RepoConfig) -> Self {
        self.repo_config = repo_config;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn repo_path(&self) -> PathBuf {
        self.root().join("repo")
    }

    pub fn cache_path(&self, client: &str) -> PathBuf {
        self.root().join(format!("client-{client}")).join("cache")
    }

    pub fn repo_config(&self) -> &RepoConfig {
        &self.repo_config
    }

    pub fn master_key(&self) -> Option<MasterKey> {
        self.crypto.then(test_master_key)
    }

    pub fn local_connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::new(
            LOCAL_PLUGIN_ID,
            PluginSettings::new().with(SETTING_PATH, self.repo_path().display().to_string()),
        )
    }

    pub fn unreliable_connection_config(&self, patterns: &[&str]) -> ConnectionConfig {
        ConnectionConfig::new(
            UNRELIABLE_PLUGIN_ID,
            PluginSettings::new()
                .with(SETTING_PATH, self.repo_path().display().to_string())
                .with(SETTING_PATTERNS, patterns.join(";")),
        )
    }

    /// Resolve, init and create the repository, like a fresh client would.
    pub async fn connect(&self, config: &ConnectionConfig) -> anyhow::Result<Box<dyn Connection>> {
        let connection = test_registry().connect(config)?;
        connection.create_transfer_manager()?.init(true).await?;
        Ok(connection)
    }

    /// Engine for `client` over `connection`, sharing `index`.
    pub fn engine_with(
        &self,
        client: &str,
        connection: &dyn Connection,
        index: Arc<dyn DedupIndex>,
    ) -> anyhow::Result<SyncEngine> {
        let pool = TransferPool::from_connection(connection, 2)?;
        let config = EngineConfig::new(self.cache_path(client))
            .with_repo(self.repo_config.clone())
            .with_retry(self.retry.clone());
        let key = self.master_key();
        Ok(SyncEngine::new(config, key.as_ref(), index, pool)?)
    }

    /// Engine over a fresh local connection with its own index.
    pub async fn local_engine(&self) -> anyhow::Result<SyncEngine> {
        let connection = self.connect(&self.local_connection_config()).await?;
        self.engine_with("local", connection.as_ref(), Arc::new(MemoryDedupIndex::new()))
    }

    /// Files currently stored under the repository's multichunk directory.
    pub fn stored_containers(&self) -> Vec<PathBuf> {
        let dir = self.repo_path().join("multichunks");
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|e| e.path())
                    .filter(|p| p.is_file())
                    .collect()
            })
            .unwrap_or_default();
        files.sort();
        files
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// Install a fmt subscriber once per test binary. Honors `RUST_LOG`.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
