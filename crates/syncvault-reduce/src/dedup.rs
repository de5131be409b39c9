//! Deduplication index: chunk checksum to container location.
//!
//! Entries are written only after the container holding the chunk has been
//! acknowledged by the remote, so every entry is backed by stored data.
//! Containers between "upload started" and "entries recorded" are tracked as
//! in flight so that garbage collection run by any engine sharing the index
//! leaves them alone.

use crate::checksum::Checksum;
use crate::error::{ReduceError, ReduceResult};
use crate::multichunk::{ChunkPlacement, Container, ContainerId};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Debug;
use tracing::debug;

/// Location of a stored chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLocation {
    /// Container holding the chunk
    pub container_id: ContainerId,
    /// Byte offset within the container payload
    pub offset: u32,
    /// Stored length in bytes
    pub length: u32,
}

impl From<ChunkPlacement> for ChunkLocation {
    fn from(p: ChunkPlacement) -> Self {
        Self {
            container_id: p.container_id,
            offset: p.offset,
            length: p.length,
        }
    }
}

/// Index shared by concurrent sync sessions.
/// Object-safe so backends can be swapped behind an `Arc<dyn DedupIndex>`.
pub trait DedupIndex: Send + Sync + Debug {
    /// Location of a chunk, if stored.
    fn lookup(&self, checksum: &Checksum) -> Option<ChunkLocation>;

    /// Record a location. First writer wins: returns false and leaves the
    /// entry untouched if the checksum is already indexed.
    fn record(&self, checksum: Checksum, location: ChunkLocation) -> bool;

    /// Number of indexed chunks.
    fn len(&self) -> usize;

    /// Snapshot of all entries.
    fn entries(&self) -> Vec<(Checksum, ChunkLocation)>;

    /// Mark `id` as being uploaded.
    fn begin_upload(&self, id: ContainerId);

    /// Clear the in-flight mark of `id`.
    fn end_upload(&self, id: &ContainerId);

    /// Containers currently marked as being uploaded.
    fn uploads_in_flight(&self) -> BTreeSet<ContainerId>;

    /// True if `checksum` is indexed.
    fn contains(&self, checksum: &Checksum) -> bool {
        self.lookup(checksum).is_some()
    }

    /// True if nothing is indexed.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record every chunk of an uploaded container. Returns how many were new.
    fn record_container(&self, container: &Container) -> usize {
        let id = container.id();
        let added = container
            .entries()
            .iter()
            .filter(|e| {
                self.record(
                    e.checksum,
                    ChunkLocation {
                        container_id: id,
                        offset: e.offset,
                        length: e.length,
                    },
                )
            })
            .count();
        debug!(container = %id, added, chunks = container.len(), "Recorded container in index");
        added
    }

    /// Distinct containers referenced by any entry.
    fn referenced_containers(&self) -> BTreeSet<ContainerId> {
        self.entries()
            .into_iter()
            .map(|(_, loc)| loc.container_id)
            .collect()
    }

    /// Fail if an entry references a container missing from `remote`.
    fn verify_against(&self, remote: &BTreeSet<ContainerId>) -> ReduceResult<()> {
        let missing: Vec<ContainerId> = self
            .referenced_containers()
            .into_iter()
            .filter(|id| !remote.contains(id))
            .collect();
        match missing.first() {
            None => Ok(()),
            Some(first) => Err(ReduceError::IndexConsistency(format!(
                "{} indexed container(s) missing remotely, first: {first}",
                missing.len()
            ))),
        }
    }
}

/// Keeps a container marked in flight until dropped.
///
/// Dropping the guard without recording the container (failed or cancelled
/// upload) turns a stored blob into an orphan for GC to collect.
#[derive(Debug)]
pub struct InFlightUpload<'a> {
    index: &'a dyn DedupIndex,
    id: ContainerId,
}

impl<'a> InFlightUpload<'a> {
    /// Mark `id` in flight on `index`.
    pub fn register(index: &'a dyn DedupIndex, id: ContainerId) -> Self {
        index.begin_upload(id);
        Self { index, id }
    }

    /// The guarded container.
    pub fn id(&self) -> ContainerId {
        self.id
    }
}

impl Drop for InFlightUpload<'_> {
    fn drop(&mut self) {
        self.index.end_upload(&self.id);
    }
}

/// In-memory index over a sharded concurrent map.
#[derive(Debug, Default)]
pub struct MemoryDedupIndex {
    entries: DashMap<Checksum, ChunkLocation>,
    in_flight: DashSet<ContainerId>,
}

impl MemoryDedupIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }
}

impl DedupIndex for MemoryDedupIndex {
    fn lookup(&self, checksum: &Checksum) -> Option<ChunkLocation> {
        self.entries.get(checksum).map(|e| *e.value())
    }

    fn record(&self, checksum: Checksum, location: ChunkLocation) -> bool {
        match self.entries.entry(checksum) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(location);
                true
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn entries(&self) -> Vec<(Checksum, ChunkLocation)> {
        self.entries
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect()
    }

    fn begin_upload(&self, id: ContainerId) {
        self.in_flight.insert(id);
    }

    fn end_upload(&self, id: &ContainerId) {
        self.in_flight.remove(id);
    }

    fn uploads_in_flight(&self) -> BTreeSet<ContainerId> {
        self.in_flight.iter().map(|id| *id).collect()
    }
}
