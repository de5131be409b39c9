//! Orphan container collection.
//! A remote container is an orphan when no index entry references it, e.g.
//! after a sync was interrupted between upload and index update, or when every
//! chunk it holds was first indexed from another container.

use crate::multichunk::ContainerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use syncvault_transfer::RemoteFile;
use tracing::debug;

/// Statistics from a garbage collection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcStats {
    /// Remote containers examined.
    pub containers_scanned: usize,
    /// Orphans deleted.
    pub containers_deleted: usize,
    /// Orphans that were already gone when deleted.
    pub containers_missing: usize,
    /// Remote objects that are not containers (left alone).
    pub foreign_objects: usize,
}

/// Containers to delete, computed from a remote listing and the index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcPlan {
    /// Unreferenced containers.
    pub orphans: Vec<RemoteFile>,
    /// Containers examined.
    pub scanned: usize,
    /// Non-container objects in the listing.
    pub foreign: usize,
}

impl GcPlan {
    /// Mark: every listed container not in `referenced` is an orphan.
    pub fn compute(remote: &BTreeSet<RemoteFile>, referenced: &BTreeSet<ContainerId>) -> Self {
        let mut plan = GcPlan::default();
        for file in remote {
            match ContainerId::from_remote_file(file) {
                Some(id) => {
                    plan.scanned += 1;
                    if !referenced.contains(&id) {
                        plan.orphans.push(file.clone());
                    }
                }
                None => plan.foreign += 1,
            }
        }
        debug!(
            scanned = plan.scanned,
            orphans = plan.orphans.len(),
            foreign = plan.foreign,
            "GC mark complete"
        );
        plan
    }

    /// Stats skeleton before any deletion.
    pub fn stats(&self) -> GcStats {
        GcStats {
            containers_scanned: self.scanned,
            foreign_objects: self.foreign,
            ..GcStats::default()
        }
    }
}
