//! Fault injection for transfer managers - the `unreliable_local` plugin
//!
//! Every operation is described as `rel=<n> op=<kind> remote=<name>`, where
//! `n` counts operations across all managers of one connection. An operation
//! fails with `TransferError::Injected` when its description matches an
//! active failure rule. A [`Checkpoint`] instead lets the operation complete
//! on the backend and then holds it until the test releases it.

use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use syncvault_transfer::local::SETTING_PATH;
use syncvault_transfer::{
    Connection, LocalConnection, Plugin, PluginSettings, RemoteFile, TransferError,
    TransferManager, TransferResult,
};
use tokio::sync::Semaphore;
use tracing::warn;

/// Plugin id of the fault-injecting local backend.
pub const UNRELIABLE_PLUGIN_ID: &str = "unreliable_local";

/// Setting key holding `;`-separated failure patterns.
pub const SETTING_PATTERNS: &str = "patterns";

/// Kind of transfer operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Init,
    Upload,
    Download,
    Delete,
    List,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Init => "init",
            OperationKind::Upload => "upload",
            OperationKind::Download => "download",
            OperationKind::Delete => "delete",
            OperationKind::List => "list",
        }
    }
}

/// A regex over operation descriptions, optionally limited to the first N matches
#[derive(Debug, Clone)]
pub struct FailureRule {
    pattern: Regex,
    remaining: Option<usize>,
}

impl FailureRule {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            remaining: None,
        })
    }

    /// Only fail the first `n` matching operations.
    pub fn times(mut self, n: usize) -> Self {
        self.remaining = Some(n);
        self
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    fn fires(&mut self, description: &str) -> bool {
        if !self.pattern.is_match(description) {
            return false;
        }
        match &mut self.remaining {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }
}

/// Holds the first operation matching a pattern after the backend has
/// completed it, until [`Checkpoint::release`] is called. Later matches pass.
#[derive(Debug)]
pub struct Checkpoint {
    pattern: Regex,
    armed: AtomicBool,
    reached: Semaphore,
    released: Semaphore,
}

impl Checkpoint {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            armed: AtomicBool::new(true),
            reached: Semaphore::new(0),
            released: Semaphore::new(0),
        })
    }

    /// Resolves once an operation is being held.
    pub async fn reached(&self) {
        if let Ok(permit) = self.reached.acquire().await {
            permit.forget();
        }
    }

    /// Let the held operation return to its caller.
    pub fn release(&self) {
        self.released.add_permits(1);
    }

    async fn pass(&self, description: &str) {
        if !self.pattern.is_match(description) || !self.armed.swap(false, Ordering::SeqCst) {
            return;
        }
        warn!(operation = %description, "Holding completed transfer at checkpoint");
        self.reached.add_permits(1);
        if let Ok(permit) = self.released.acquire().await {
            permit.forget();
        }
    }
}

/// Shared rule set, checkpoints, operation counter and operation log
#[derive(Debug, Default)]
pub struct FaultInjector {
    rules: Mutex<Vec<FailureRule>>,
    checkpoints: Mutex<Vec<Arc<Checkpoint>>>,
    counter: AtomicU64,
    log: Mutex<Vec<String>>,
    injected: AtomicU64,
}

impl FaultInjector {
    pub fn new(rules: Vec<FailureRule>) -> Self {
        Self {
            rules: Mutex::new(rules),
            ..Self::default()
        }
    }

    /// Parse `;`-separated patterns. Blank entries are ignored.
    pub fn from_patterns(patterns: &str) -> Result<Self, regex::Error> {
        let rules = patterns
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(FailureRule::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(rules))
    }

    pub fn add_rule(&self, rule: FailureRule) {
        self.rules.lock().unwrap_or_else(|e| e.into_inner()).push(rule);
    }

    pub fn clear_rules(&self) {
        self.rules.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Hold the next operation matching `pattern` once it has completed.
    pub fn add_checkpoint(&self, pattern: &str) -> Result<Arc<Checkpoint>, regex::Error> {
        let checkpoint = Arc::new(Checkpoint::new(pattern)?);
        self.checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&checkpoint));
        Ok(checkpoint)
    }

    /// Wait at every checkpoint matching a completed operation.
    pub async fn pass_checkpoints(&self, description: &str) {
        let checkpoints = self
            .checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for checkpoint in checkpoints {
            checkpoint.pass(description).await;
        }
    }

    /// Record the operation and fail it if a rule fires. Returns the
    /// operation's description.
    pub fn check(
        &self,
        kind: OperationKind,
        remote: Option<&RemoteFile>,
    ) -> TransferResult<String> {
        let rel = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let description = format!(
            "rel={rel} op={} remote={}",
            kind.as_str(),
            remote.map_or("-", RemoteFile::name)
        );
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(description.clone());

        let fired = self
            .rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter_mut()
            .any(|rule| rule.fires(&description));
        if fired {
            self.injected.fetch_add(1, Ordering::SeqCst);
            warn!(operation = %description, "Injecting transfer failure");
            return Err(TransferError::Injected {
                operation: description,
            });
        }
        Ok(description)
    }

    /// Descriptions of all operations seen so far, in order.
    pub fn operations(&self) -> Vec<String> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of injected failures.
    pub fn injected_count(&self) -> u64 {
        self.injected.load(Ordering::SeqCst)
    }
}

/// Wraps any transfer manager and fails operations matching the injector's rules
#[derive(Debug)]
pub struct UnreliableTransferManager {
    inner: Box<dyn TransferManager>,
    faults: Arc<FaultInjector>,
}

impl UnreliableTransferManager {
    pub fn new(inner: Box<dyn TransferManager>, faults: Arc<FaultInjector>) -> Self {
        Self { inner, faults }
    }

    pub fn faults(&self) -> &Arc<FaultInjector> {
        &self.faults
    }
}

#[async_trait]
impl TransferManager for UnreliableTransferManager {
    async fn init(&self, create_if_missing: bool) -> TransferResult<()> {
        let operation = self.faults.check(OperationKind::Init, None)?;
        self.inner.init(create_if_missing).await?;
        self.faults.pass_checkpoints(&operation).await;
        Ok(())
    }

    async fn upload(&self, local: &Path, remote: &RemoteFile) -> TransferResult<()> {
        let operation = self.faults.check(OperationKind::Upload, Some(remote))?;
        self.inner.upload(local, remote).await?;
        self.faults.pass_checkpoints(&operation).await;
        Ok(())
    }

    async fn download(&self, remote: &RemoteFile, local: &Path) -> TransferResult<()> {
        let operation = self.faults.check(OperationKind::Download, Some(remote))?;
        self.inner.download(remote, local).await?;
        self.faults.pass_checkpoints(&operation).await;
        Ok(())
    }

    async fn delete(&self, remote: &RemoteFile) -> TransferResult<bool> {
        let operation = self.faults.check(OperationKind::Delete, Some(remote))?;
        let deleted = self.inner.delete(remote).await?;
        self.faults.pass_checkpoints(&operation).await;
        Ok(deleted)
    }

    async fn list(&self) -> TransferResult<BTreeSet<RemoteFile>> {
        let operation = self.faults.check(OperationKind::List, None)?;
        let listing = self.inner.list().await?;
        self.faults.pass_checkpoints(&operation).await;
        Ok(listing)
    }
}

/// Factory for [`UnreliableLocalConnection`]s.
#[derive(Debug, Default)]
pub struct UnreliableLocalPlugin;

impl Plugin for UnreliableLocalPlugin {
    fn id(&self) -> &'static str {
        UNRELIABLE_PLUGIN_ID
    }

    fn name(&self) -> &'static str {
        "Unreliable local filesystem (testing)"
    }

    fn create_connection(&self) -> Box<dyn Connection> {
        Box::new(UnreliableLocalConnection::default())
    }
}

/// Local connection whose transfer managers share one [`FaultInjector`]
#[derive(Debug, Clone, Default)]
pub struct UnreliableLocalConnection {
    local: LocalConnection,
    faults: Arc<FaultInjector>,
}

impl UnreliableLocalConnection {
    pub fn new(path: impl Into<PathBuf>, rules: Vec<FailureRule>) -> Self {
        Self {
            local: LocalConnection::with_path(path),
            faults: Arc::new(FaultInjector::new(rules)),
        }
    }

    pub fn faults(&self) -> &Arc<FaultInjector> {
        &self.faults
    }

    pub fn repository_path(&self) -> Option<&Path> {
        self.local.repository_path()
    }
}

impl Connection for UnreliableLocalConnection {
    fn plugin_id(&self) -> &'static str {
        UNRELIABLE_PLUGIN_ID
    }

    fn init(&mut self, settings: &PluginSettings) -> TransferResult<()> {
        settings.reject_unknown(UNRELIABLE_PLUGIN_ID, &[SETTING_PATH, SETTING_PATTERNS])?;
        let path = settings.require(UNRELIABLE_PLUGIN_ID, SETTING_PATH)?;
        let local_settings = PluginSettings::new().with(SETTING_PATH, path);
        self.local.init(&local_settings)?;

        let faults = FaultInjector::from_patterns(settings.get(SETTING_PATTERNS).unwrap_or(""))
            .map_err(|e| TransferError::InvalidSettings {
                plugin: UNRELIABLE_PLUGIN_ID.to_string(),
                reason: format!("invalid failure pattern: {e}"),
            })?;
        self.faults = Arc::new(faults);
        Ok(())
    }

    fn create_transfer_manager(&self) -> TransferResult<Box<dyn TransferManager>> {
        Ok(Box::new(UnreliableTransferManager::new(
            Box::new(self.local.local_transfer_manager()?),
            Arc::clone(&self.faults),
        )))
    }
}
