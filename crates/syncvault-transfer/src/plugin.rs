//! Backend abstraction for SyncVault remote storage.
//!
//! A [`Plugin`] is a named factory producing unconfigured [`Connection`]s.
//! An initialized connection creates [`TransferManager`]s, the only boundary
//! a storage provider has to implement: init, upload, download, delete, list.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::path::Path;

use crate::error::TransferResult;
use crate::remote::RemoteFile;
use crate::settings::PluginSettings;

/// A storage backend type, registered under a unique id.
pub trait Plugin: Send + Sync + Debug {
    /// Unique id used in connection configs, e.g. `local`.
    fn id(&self) -> &'static str;

    /// Human readable name.
    fn name(&self) -> &'static str;

    /// Create an unconfigured connection for this backend.
    fn create_connection(&self) -> Box<dyn Connection>;
}

/// A configured handle to one storage backend.
///
/// Connections are created unconfigured; [`Connection::init`] validates the
/// settings and must succeed before transfer managers can be created.
pub trait Connection: Send + Sync + Debug {
    /// Id of the plugin that created this connection.
    fn plugin_id(&self) -> &'static str;

    /// Validate and apply backend-specific settings.
    ///
    /// Fails with [`crate::TransferError::InvalidSettings`] on missing,
    /// unknown or malformed keys.
    fn init(&mut self, settings: &PluginSettings) -> TransferResult<()>;

    /// Create a transfer manager bound to this connection's settings.
    fn create_transfer_manager(&self) -> TransferResult<Box<dyn TransferManager>>;
}

/// Blob-level operations against a remote repository.
///
/// Operations are idempotent where the backend allows it: re-uploading the
/// same remote name replaces the object, deleting a missing object succeeds.
#[async_trait]
pub trait TransferManager: Send + Sync + Debug {
    /// Connect to the repository, creating it if allowed and missing.
    async fn init(&self, create_if_missing: bool) -> TransferResult<()>;

    /// Upload the local file at `local` as `remote`.
    async fn upload(&self, local: &Path, remote: &RemoteFile) -> TransferResult<()>;

    /// Download `remote` into the local file `local`, replacing it.
    async fn download(&self, remote: &RemoteFile, local: &Path) -> TransferResult<()>;

    /// Delete `remote`. Returns false if it did not exist.
    async fn delete(&self, remote: &RemoteFile) -> TransferResult<bool>;

    /// List all objects in the repository.
    async fn list(&self) -> TransferResult<BTreeSet<RemoteFile>>;
}
