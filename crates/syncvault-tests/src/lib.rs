//! SyncVault Test Infrastructure
//!
//! Test support shared by the end-to-end scenarios under `tests/`: the
//! `unreliable_local` fault-injecting plugin, throwaway repositories with
//! local or unreliable connections, and tracing setup for test binaries.

pub mod harness;
pub mod unreliable;

pub use harness::{
    init_test_tracing, random_bytes, test_master_key, test_registry, test_repo_config, TestRepo,
};
pub use unreliable::{
    Checkpoint, FailureRule, FaultInjector, OperationKind, UnreliableLocalConnection,
    UnreliableLocalPlugin, UnreliableTransferManager, UNRELIABLE_PLUGIN_ID,
};
