//! Sync engine: chunk → dedup → pack → transform → upload → index.
//!
//! Restore runs the reverse path: index → download → decode → parse → slice →
//! verify. Index entries are recorded only after the remote has acknowledged
//! the container, so an interrupted or failed sync never leaves entries that
//! point at missing data.
//!
//! Chunking and the transformer chain run on the blocking thread pool; the
//! async side only does dedup bookkeeping and transfers.

use crate::checksum::Checksum;
use crate::chunker::{Chunk, Chunker};
use crate::config::EngineConfig;
use crate::dedup::{ChunkLocation, DedupIndex, InFlightUpload};
use crate::error::{ReduceError, ReduceResult};
use crate::gc::{GcPlan, GcStats};
use crate::keys::MasterKey;
use crate::multichunk::{Container, ContainerId, MultiChunker};
use crate::transformer::{TransformScope, TransformerChain};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;
use syncvault_transfer::{RemoteFile, RetryExecutor, RetryOutcome, TransferError, TransferPool};
use tempfile::TempPath;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, instrument, warn};

/// Chunks buffered between the chunking thread and the packer.
const CHUNK_QUEUE_DEPTH: usize = 16;

/// Ordered chunk list of one synced file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    /// Chunk checksums in file order.
    pub chunks: Vec<Checksum>,
    /// File size in bytes.
    pub size: u64,
}

/// Outcome of one sync call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// How to rebuild the file.
    pub manifest: FileManifest,
    /// Chunks produced by the chunker.
    pub chunks_total: usize,
    /// Chunks already indexed or already packed in this session.
    pub chunks_deduplicated: usize,
    /// Chunks packed into containers.
    pub chunks_new: usize,
    /// Containers uploaded.
    pub containers_uploaded: usize,
    /// Sealed containers dropped because every chunk got indexed meanwhile.
    pub containers_skipped: usize,
    /// Encoded bytes uploaded.
    pub bytes_uploaded: u64,
}

impl SyncReport {
    /// Fraction of chunks that were not packed again.
    pub fn dedup_ratio(&self) -> f64 {
        if self.chunks_total == 0 {
            0.0
        } else {
            self.chunks_deduplicated as f64 / self.chunks_total as f64
        }
    }
}

/// Ties chunker, index, multichunker, transformer chain and transfer pool together.
///
/// Any number of engines may share one index and one repository. Syncs and
/// garbage collection may overlap: a container is registered with the index
/// as in flight before its upload starts, and GC never deletes a container
/// that is in flight or referenced.
pub struct SyncEngine {
    config: EngineConfig,
    chunker: Arc<dyn Chunker>,
    chain: Arc<TransformerChain>,
    index: Arc<dyn DedupIndex>,
    pool: TransferPool,
    retry: RetryExecutor,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("chunker", &self.chunker)
            .field("chain", &self.chain)
            .field("pool", &self.pool)
            .field("indexed_chunks", &self.index.len())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Validate the configuration and build the engine.
    pub fn new(
        config: EngineConfig,
        master_key: Option<&MasterKey>,
        index: Arc<dyn DedupIndex>,
        pool: TransferPool,
    ) -> ReduceResult<Self> {
        let chunker = config.repo.build_chunker()?;
        let chain = config.repo.build_chain(master_key)?;
        config.repo.multichunker.threshold_bytes()?;
        std::fs::create_dir_all(&config.cache_dir)?;
        Ok(Self {
            retry: RetryExecutor::new(config.retry.clone()),
            config,
            chunker: Arc::from(chunker),
            chain: Arc::new(chain),
            index,
            pool,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared dedup index.
    pub fn index(&self) -> &Arc<dyn DedupIndex> {
        &self.index
    }

    /// Transformer chain applied to outgoing data.
    pub fn chain(&self) -> &TransformerChain {
        &self.chain
    }

    /// Transfer manager pool.
    pub fn pool(&self) -> &TransferPool {
        &self.pool
    }

    /// Sync a local file.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn sync_file(&self, path: &Path) -> ReduceResult<SyncReport> {
        let file = tokio::fs::File::open(path).await?.into_std().await;
        self.sync_reader(BufReader::new(file)).await
    }

    /// Sync everything `reader` yields.
    ///
    /// Chunks already in the index are skipped; new ones are packed and each
    /// sealed container is shipped before the next chunk is taken. Dropping
    /// the returned future leaves the index untouched for every container
    /// whose upload had not completed.
    pub async fn sync_reader<R: Read + Send + 'static>(
        &self,
        reader: R,
    ) -> ReduceResult<SyncReport> {
        let mut packer = MultiChunker::new(self.config.repo.multichunker)?;
        let mut pending: HashSet<Checksum> = HashSet::new();
        let mut report = SyncReport::default();

        let (mut chunks, producer) = self.spawn_chunker(reader);
        while let Some(chunk) = chunks.recv().await {
            let chunk = chunk?;
            let checksum = chunk.checksum;
            report.chunks_total += 1;
            report.manifest.size += chunk.size() as u64;
            report.manifest.chunks.push(checksum);

            if self.index.contains(&checksum) || !pending.insert(checksum) {
                report.chunks_deduplicated += 1;
                continue;
            }
            report.chunks_new += 1;

            let payload = match self.config.repo.transform_scope {
                TransformScope::Container => chunk.data,
                TransformScope::Chunk => Bytes::from(self.encode_blocking(chunk.data).await?),
            };
            if let Some(sealed) = packer.add(checksum, &payload)?.sealed {
                self.ship(sealed, &mut report).await?;
            }
        }
        producer.await?;
        if let Some(sealed) = packer.seal_current() {
            self.ship(sealed, &mut report).await?;
        }

        info!(
            size = report.manifest.size,
            chunks = report.chunks_total,
            deduplicated = report.chunks_deduplicated,
            containers = report.containers_uploaded,
            "Sync complete"
        );
        Ok(report)
    }

    /// Run the chunker on the blocking pool, feeding a bounded queue.
    fn spawn_chunker<R: Read + Send + 'static>(
        &self,
        reader: R,
    ) -> (mpsc::Receiver<ReduceResult<Chunk>>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(CHUNK_QUEUE_DEPTH);
        let chunker = Arc::clone(&self.chunker);
        let producer = task::spawn_blocking(move || {
            for chunk in chunker.chunks(Box::new(reader)) {
                // Receiver gone: the sync failed or was dropped.
                if tx.blocking_send(chunk).is_err() {
                    break;
                }
            }
        });
        (rx, producer)
    }

    async fn encode_blocking<B>(&self, data: B) -> ReduceResult<Vec<u8>>
    where
        B: AsRef<[u8]> + Send + 'static,
    {
        let chain = Arc::clone(&self.chain);
        task::spawn_blocking(move || chain.encode(data.as_ref())).await?
    }

    async fn decode_blocking<B>(&self, data: B) -> ReduceResult<Vec<u8>>
    where
        B: AsRef<[u8]> + Send + 'static,
    {
        let chain = Arc::clone(&self.chain);
        task::spawn_blocking(move || chain.decode(data.as_ref())).await?
    }

    /// Upload a sealed container and index its chunks.
    async fn ship(&self, sealed: Container, report: &mut SyncReport) -> ReduceResult<()> {
        // Another session may have indexed some of these chunks since they were packed.
        let container = sealed.retain(|e| !self.index.contains(&e.checksum));
        if container.is_empty() {
            debug!(container = %container.id(), "All chunks indexed meanwhile, skipping upload");
            report.containers_skipped += 1;
            return Ok(());
        }

        let encoded = match self.config.repo.transform_scope {
            TransformScope::Container => self.encode_blocking(container.to_bytes()).await?,
            TransformScope::Chunk => container.to_bytes(),
        };
        let remote = container.id().remote_file()?;

        // Registered before the first byte leaves, released after the index update.
        let _in_flight = InFlightUpload::register(self.index.as_ref(), container.id());
        let blob = self.scratch_path("upload")?;
        tokio::fs::write(&blob, &encoded).await?;
        self.upload_with_retry(&blob, &remote).await?;
        drop(blob);

        let added = self.index.record_container(&container);
        report.containers_uploaded += 1;
        report.bytes_uploaded += encoded.len() as u64;
        debug!(
            container = %container.id(),
            chunks = container.len(),
            indexed = added,
            bytes = encoded.len(),
            "Shipped container"
        );
        Ok(())
    }

    async fn upload_with_retry(&self, blob: &Path, remote: &RemoteFile) -> ReduceResult<()> {
        let pool = &self.pool;
        let outcome = self
            .retry
            .execute(|| async move { pool.checkout().await.upload(blob, remote).await })
            .await;
        match outcome {
            RetryOutcome::Success { attempts, .. } => {
                if attempts > 1 {
                    info!(remote = %remote, attempts, "Upload succeeded after retry");
                }
                Ok(())
            }
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => {
                warn!(remote = %remote, attempts, error = %last_error, "Upload failed");
                Err(last_error.into())
            }
        }
    }

    /// Rebuild a file into `writer`. Returns the number of bytes written.
    #[instrument(skip(self, manifest, writer), fields(chunks = manifest.chunks.len(), size = manifest.size))]
    pub async fn restore<W: Write + Send>(
        &self,
        manifest: &FileManifest,
        writer: &mut W,
    ) -> ReduceResult<u64> {
        let mut containers: HashMap<ContainerId, Container> = HashMap::new();
        let mut written = 0u64;
        for checksum in &manifest.chunks {
            let data = self.read_chunk_cached(checksum, &mut containers).await?;
            writer.write_all(&data)?;
            written += data.len() as u64;
        }
        writer.flush()?;
        if written != manifest.size {
            return Err(ReduceError::IndexConsistency(format!(
                "restored {written} bytes, manifest records {}",
                manifest.size
            )));
        }
        Ok(written)
    }

    /// Fetch and verify a single chunk.
    pub async fn read_chunk(&self, checksum: &Checksum) -> ReduceResult<Bytes> {
        let mut containers = HashMap::new();
        self.read_chunk_cached(checksum, &mut containers).await
    }

    async fn read_chunk_cached(
        &self,
        checksum: &Checksum,
        containers: &mut HashMap<ContainerId, Container>,
    ) -> ReduceResult<Bytes> {
        let location: ChunkLocation = self.index.lookup(checksum).ok_or_else(|| {
            ReduceError::IndexConsistency(format!("chunk {checksum} is not indexed"))
        })?;
        if !containers.contains_key(&location.container_id) {
            let container = self.fetch_container(location.container_id).await?;
            containers.insert(location.container_id, container);
        }
        let container = containers.get(&location.container_id).ok_or_else(|| {
            ReduceError::IndexConsistency(format!("container {} not loaded", location.container_id))
        })?;
        let stored = container.slice_at(location.offset, location.length)?;
        let data = match self.config.repo.transform_scope {
            TransformScope::Container => stored,
            TransformScope::Chunk => Bytes::from(self.decode_blocking(stored).await?),
        };
        let actual = Checksum::of(&data);
        if &actual != checksum {
            return Err(ReduceError::ChecksumMismatch {
                expected: checksum.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(data)
    }

    /// Download, decode and parse one container.
    pub async fn fetch_container(&self, id: ContainerId) -> ReduceResult<Container> {
        let remote = id.remote_file()?;
        let blob = self.scratch_path("download")?;
        let pool = &self.pool;
        let target: &Path = &blob;
        let remote_ref = &remote;
        let outcome = self
            .retry
            .execute(|| async move { pool.checkout().await.download(remote_ref, target).await })
            .await
            .into_result();
        let bytes = match outcome {
            Ok(()) => tokio::fs::read(&blob).await?,
            Err(TransferError::NotFound { name }) => {
                return Err(ReduceError::IndexConsistency(format!(
                    "indexed container {name} is missing remotely"
                )))
            }
            Err(e) => return Err(e.into()),
        };
        drop(blob);

        let decoded = match self.config.repo.transform_scope {
            TransformScope::Container => self.decode_blocking(bytes).await?,
            TransformScope::Chunk => bytes,
        };
        let container = Container::from_bytes(&decoded)?;
        if container.id() != id {
            return Err(ReduceError::IndexConsistency(format!(
                "remote {remote} holds container {}",
                container.id()
            )));
        }
        debug!(container = %id, chunks = container.len(), "Fetched container");
        Ok(container)
    }

    /// Containers present in the remote repository.
    pub async fn remote_containers(&self) -> ReduceResult<BTreeSet<ContainerId>> {
        let listing = self.pool.checkout().await.list().await?;
        Ok(listing
            .iter()
            .filter_map(ContainerId::from_remote_file)
            .collect())
    }

    /// Check that every indexed container exists remotely.
    pub async fn verify_index(&self) -> ReduceResult<()> {
        let remote = self.remote_containers().await?;
        self.index.verify_against(&remote)
    }

    /// Delete remote containers that are neither referenced by an index
    /// entry nor being uploaded by a sync sharing the index.
    #[instrument(skip(self))]
    pub async fn collect_garbage(&self) -> ReduceResult<GcStats> {
        let manager = self.pool.checkout().await;
        let listing = manager.list().await?;
        // In-flight set first: an upload leaves it only after its entries are recorded.
        let mut live = self.index.uploads_in_flight();
        live.extend(self.index.referenced_containers());
        let plan = GcPlan::compute(&listing, &live);
        let mut stats = plan.stats();
        for orphan in &plan.orphans {
            if manager.delete(orphan).await? {
                stats.containers_deleted += 1;
            } else {
                stats.containers_missing += 1;
            }
        }
        info!(
            scanned = stats.containers_scanned,
            deleted = stats.containers_deleted,
            "Garbage collection complete"
        );
        Ok(stats)
    }

    /// Scratch file in the cache dir, removed when the guard drops.
    fn scratch_path(&self, kind: &str) -> ReduceResult<TempPath> {
        let file = tempfile::Builder::new()
            .prefix(&format!("{kind}-"))
            .suffix(".blob")
            .tempfile_in(&self.config.cache_dir)?;
        Ok(file.into_temp_path())
    }
}
