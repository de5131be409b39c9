#![warn(missing_docs)]

//! SyncVault reduction subsystem: chunking, dedupe (BLAKE3), multichunk packing,
//! compression (LZ4/Zstd) and encryption (AES-GCM/ChaCha20-Poly1305)
//!
//! Sync path:    Data → Chunk (FastCDC) → Checksum → Dedupe → Pack → Compress → Encrypt → Upload → Index
//! Restore path: Index → Download → Decrypt → Decompress → Unpack → Verify → Data

pub mod checksum;
pub mod chunker;
pub mod compression;
pub mod config;
pub mod dedup;
pub mod encryption;
pub mod engine;
pub mod error;
pub mod gc;
pub mod keys;
pub mod multichunk;
pub mod transformer;

pub use checksum::Checksum;
pub use chunker::{CdcChunker, Chunk, ChunkStream, Chunker, ChunkerConfig, FixedSizeChunker};
pub use compression::{CompressionAlgorithm, CompressionTransformer};
pub use config::{EngineConfig, RepoConfig};
pub use dedup::{ChunkLocation, DedupIndex, InFlightUpload, MemoryDedupIndex};
pub use encryption::{CipherSpec, CipherTransformer, EncryptionKey};
pub use engine::{FileManifest, SyncEngine, SyncReport};
pub use error::{ReduceError, ReduceResult};
pub use gc::{GcPlan, GcStats};
pub use keys::{KdfParams, MasterKey, SaltedKeyRecord};
pub use multichunk::{
    AddOutcome, ChunkPlacement, Container, ContainerEntry, ContainerId, MultiChunker,
    MultiChunkerConfig,
};
pub use transformer::{
    default_descriptors, TransformScope, Transformer, TransformerChain, TransformerDescriptor,
};
