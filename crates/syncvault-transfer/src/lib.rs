#![warn(missing_docs)]

//! SyncVault transfer subsystem: plugin registry, connections and transfer managers
//!
//! Resolution path: ConnectionConfig → PluginRegistry → Plugin → Connection → TransferManager
//! Backends are dumb blob stores: init, upload, download, delete, list.

pub mod error;
pub mod local;
pub mod plugin;
pub mod pool;
pub mod registry;
pub mod remote;
pub mod retry;
pub mod settings;

pub use error::{TransferError, TransferResult};
pub use local::{LocalConnection, LocalPlugin, LocalTransferManager, LOCAL_PLUGIN_ID};
pub use plugin::{Connection, Plugin, TransferManager};
pub use pool::{PoolStats, PooledTransferManager, TransferPool};
pub use registry::PluginRegistry;
pub use remote::{RemoteFile, MULTICHUNK_PREFIX};
pub use retry::{RetryConfig, RetryExecutor, RetryOutcome};
pub use settings::{ConnectionConfig, PluginSettings};
