//! Error types for the syncvault-reduce subsystem

use syncvault_transfer::TransferError;

/// Result type alias for reduction and sync operations.
pub type ReduceResult<T> = Result<T, ReduceError>;

/// All errors that can occur while chunking, packing, transforming and syncing
#[derive(Debug, thiserror::Error)]
pub enum ReduceError {
    /// Invalid chunker, multichunker or transformer configuration
    #[error("Configuration error: {0}")]
    Config(String),
    /// Source stream could not be read
    #[error("Chunking failed: {0}")]
    ChunkingFailed(String),
    /// Compression operation failed
    #[error("Compression failed: {0}")]
    CompressionFailed(String),
    /// Decompression failed: input is corrupt or was not produced by this transformer
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),
    /// Encryption operation failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    /// Decryption authentication tag mismatch: wrong key, or data corrupted or tampered
    #[error("Decryption failed: authentication tag mismatch (wrong key or corrupted data)")]
    DecryptionAuthFailed,
    /// Encoded payload has an invalid structure (bad magic, truncated header)
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    /// A cipher transformer was configured but no master key was provided
    #[error("Missing encryption key: cipher transformer configured but no master key was set")]
    MissingKey,
    /// Restored chunk content does not hash to its checksum
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Checksum recorded in the index
        expected: String,
        /// Checksum of the bytes actually read
        actual: String,
    },
    /// Internal contract violation between the index and remote storage
    #[error("Index consistency error: {0}")]
    IndexConsistency(String),
    /// Transfer layer failure
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A chunking or transform task on the blocking pool panicked or was cancelled
    #[error("Blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ReduceError {
    /// True when decoded data failed an integrity check. Restores must abort
    /// rather than hand out the bytes.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            ReduceError::DecryptionAuthFailed
                | ReduceError::DecompressionFailed(_)
                | ReduceError::MalformedPayload(_)
                | ReduceError::ChecksumMismatch { .. }
        )
    }

    /// True for setup errors that must not be retried.
    pub fn is_configuration_error(&self) -> bool {
        match self {
            ReduceError::Config(_) | ReduceError::MissingKey => true,
            ReduceError::Transfer(e) => e.is_configuration_error(),
            _ => false,
        }
    }
}
