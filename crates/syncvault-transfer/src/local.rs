//! Local filesystem storage plugin.
//!
//! Repository layout:
//! ```text
//! <path>/
//!   multichunks/multichunk-<id>
//!   <other objects>
//! ```

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{TransferError, TransferResult};
use crate::plugin::{Connection, Plugin, TransferManager};
use crate::remote::RemoteFile;
use crate::settings::PluginSettings;

/// Plugin id of the local filesystem backend.
pub const LOCAL_PLUGIN_ID: &str = "local";

/// Setting key holding the repository directory.
pub const SETTING_PATH: &str = "path";

const MULTICHUNK_DIR: &str = "multichunks";

/// Factory for [`LocalConnection`]s.
#[derive(Debug, Default)]
pub struct LocalPlugin;

impl LocalPlugin {
    /// Create the plugin.
    pub fn new() -> Self {
        Self
    }
}

impl Plugin for LocalPlugin {
    fn id(&self) -> &'static str {
        LOCAL_PLUGIN_ID
    }

    fn name(&self) -> &'static str {
        "Local filesystem"
    }

    fn create_connection(&self) -> Box<dyn Connection> {
        Box::new(LocalConnection::default())
    }
}

/// Connection to a repository directory on a local or mounted filesystem.
#[derive(Debug, Clone, Default)]
pub struct LocalConnection {
    repository_path: Option<PathBuf>,
}

impl LocalConnection {
    /// Connection already pointing at `path`.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            repository_path: Some(path.into()),
        }
    }

    /// Repository directory, once configured.
    pub fn repository_path(&self) -> Option<&Path> {
        self.repository_path.as_deref()
    }

    /// Transfer manager with the concrete type, for wrapping by decorators.
    pub fn local_transfer_manager(&self) -> TransferResult<LocalTransferManager> {
        let root = self
            .repository_path
            .clone()
            .ok_or_else(|| TransferError::NotConfigured {
                plugin: LOCAL_PLUGIN_ID.to_string(),
            })?;
        Ok(LocalTransferManager::new(root))
    }
}

impl Connection for LocalConnection {
    fn plugin_id(&self) -> &'static str {
        LOCAL_PLUGIN_ID
    }

    fn init(&mut self, settings: &PluginSettings) -> TransferResult<()> {
        settings.reject_unknown(LOCAL_PLUGIN_ID, &[SETTING_PATH])?;
        let path = settings.require(LOCAL_PLUGIN_ID, SETTING_PATH)?;
        let path = PathBuf::from(path);
        if !path.is_absolute() {
            return Err(TransferError::InvalidSettings {
                plugin: LOCAL_PLUGIN_ID.to_string(),
                reason: format!("'{SETTING_PATH}' must be absolute, got {}", path.display()),
            });
        }
        self.repository_path = Some(path);
        Ok(())
    }

    fn create_transfer_manager(&self) -> TransferResult<Box<dyn TransferManager>> {
        Ok(Box::new(self.local_transfer_manager()?))
    }
}

/// Transfer manager storing objects as files below the repository directory.
#[derive(Debug, Clone)]
pub struct LocalTransferManager {
    root: PathBuf,
}

impl LocalTransferManager {
    /// Manager for the repository at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Repository directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_dir(&self, remote: &RemoteFile) -> PathBuf {
        if remote.multichunk_id().is_some() {
            self.root.join(MULTICHUNK_DIR)
        } else {
            self.root.clone()
        }
    }

    fn object_path(&self, remote: &RemoteFile) -> PathBuf {
        self.object_dir(remote).join(remote.name())
    }

    async fn ensure_repository(&self) -> TransferResult<()> {
        if fs::metadata(self.root.join(MULTICHUNK_DIR)).await.is_err() {
            return Err(TransferError::RepositoryNotFound {
                location: self.root.display().to_string(),
            });
        }
        Ok(())
    }
}

fn map_io(err: std::io::Error, root: &Path) -> TransferError {
    if err.kind() == std::io::ErrorKind::PermissionDenied {
        TransferError::PermissionDenied {
            location: root.display().to_string(),
            reason: err.to_string(),
        }
    } else {
        TransferError::Io(err)
    }
}

async fn list_dir(dir: &Path, out: &mut BTreeSet<RemoteFile>) -> std::io::Result<()> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        // Temp files start with a dot and fail validation.
        if let Some(name) = entry.file_name().to_str() {
            if let Ok(remote) = RemoteFile::new(name) {
                out.insert(remote);
            }
        }
    }
    Ok(())
}

#[async_trait]
impl TransferManager for LocalTransferManager {
    #[instrument(skip(self), fields(root = %self.root.display()))]
    async fn init(&self, create_if_missing: bool) -> TransferResult<()> {
        if create_if_missing {
            fs::create_dir_all(self.root.join(MULTICHUNK_DIR))
                .await
                .map_err(|e| map_io(e, &self.root))?;
            debug!("Local repository ready");
            return Ok(());
        }
        self.ensure_repository().await
    }

    #[instrument(skip(self, local), fields(remote = %remote))]
    async fn upload(&self, local: &Path, remote: &RemoteFile) -> TransferResult<()> {
        self.ensure_repository().await?;
        let dir = self.object_dir(remote);
        let tmp = dir.join(format!(".tmp-{}", Uuid::new_v4()));
        if let Err(e) = fs::copy(local, &tmp).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(map_io(e, &self.root));
        }
        if let Err(e) = fs::rename(&tmp, self.object_path(remote)).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(map_io(e, &self.root));
        }
        debug!("Uploaded");
        Ok(())
    }

    #[instrument(skip(self, local), fields(remote = %remote))]
    async fn download(&self, remote: &RemoteFile, local: &Path) -> TransferResult<()> {
        let source = self.object_path(remote);
        if fs::metadata(&source).await.is_err() {
            return Err(TransferError::NotFound {
                name: remote.name().to_string(),
            });
        }
        let file_name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = local.with_file_name(format!(".{file_name}.{}", Uuid::new_v4()));
        if let Err(e) = fs::copy(&source, &tmp).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(map_io(e, &self.root));
        }
        fs::rename(&tmp, local)
            .await
            .map_err(|e| map_io(e, &self.root))?;
        debug!("Downloaded");
        Ok(())
    }

    #[instrument(skip(self), fields(remote = %remote))]
    async fn delete(&self, remote: &RemoteFile) -> TransferResult<bool> {
        match fs::remove_file(self.object_path(remote)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(map_io(e, &self.root)),
        }
    }

    async fn list(&self) -> TransferResult<BTreeSet<RemoteFile>> {
        self.ensure_repository().await?;
        let mut out = BTreeSet::new();
        list_dir(&self.root, &mut out)
            .await
            .map_err(|e| map_io(e, &self.root))?;
        list_dir(&self.root.join(MULTICHUNK_DIR), &mut out)
            .await
            .map_err(|e| map_io(e, &self.root))?;
        Ok(out)
    }
}
