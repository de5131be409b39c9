//! LZ4 and Zstd compression stages for the transformer chain.
//!
//! Stages are stateless and never share a dictionary across containers, so
//! every container decodes on its own.

use crate::error::ReduceError;
use crate::transformer::{Transformer, TransformerDescriptor};
use serde::{Deserialize, Serialize};

/// Transformer type name of the Zstd stage.
pub const ZSTD_TYPE: &str = "zstd";
/// Transformer type name of the LZ4 stage.
pub const LZ4_TYPE: &str = "lz4";
/// Zstd setting: compression level.
pub const SETTING_LEVEL: &str = "level";
/// Zstd level used when the setting is absent.
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Compression algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    /// LZ4 block format with prepended size, fastest
    Lz4,
    /// Zstandard, higher ratio, the default for outgoing containers
    Zstd {
        /// Compression level (1=fastest, 19=best ratio, 3=balanced default)
        level: i32,
    },
}

/// Compress data with the given algorithm. Returns compressed bytes.
pub fn compress(data: &[u8], algo: CompressionAlgorithm) -> Result<Vec<u8>, ReduceError> {
    match algo {
        CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionAlgorithm::Zstd { level } => {
            zstd::encode_all(data, level).map_err(|e| ReduceError::CompressionFailed(e.to_string()))
        }
    }
}

/// Decompress data using the algorithm that was used for compression.
pub fn decompress(data: &[u8], algo: CompressionAlgorithm) -> Result<Vec<u8>, ReduceError> {
    match algo {
        CompressionAlgorithm::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| ReduceError::DecompressionFailed(e.to_string())),
        CompressionAlgorithm::Zstd { .. } => {
            zstd::decode_all(data).map_err(|e| ReduceError::DecompressionFailed(e.to_string()))
        }
    }
}

/// A compression stage of the transformer chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionTransformer {
    algo: CompressionAlgorithm,
}

impl CompressionTransformer {
    /// Stage for a fixed algorithm.
    pub fn new(algo: CompressionAlgorithm) -> Self {
        Self { algo }
    }

    /// Build from a `zstd` or `lz4` descriptor, validating its settings.
    pub fn from_descriptor(descriptor: &TransformerDescriptor) -> Result<Self, ReduceError> {
        match descriptor.kind.as_str() {
            LZ4_TYPE => {
                descriptor.reject_unknown_settings(&[])?;
                Ok(Self::new(CompressionAlgorithm::Lz4))
            }
            ZSTD_TYPE => {
                descriptor.reject_unknown_settings(&[SETTING_LEVEL])?;
                let level = match descriptor.settings.get(SETTING_LEVEL) {
                    None => DEFAULT_ZSTD_LEVEL,
                    Some(raw) => raw
                        .trim()
                        .parse::<i32>()
                        .ok()
                        .filter(|l| zstd::compression_level_range().contains(l))
                        .ok_or_else(|| {
                            ReduceError::Config(format!("invalid zstd level '{raw}'"))
                        })?,
                };
                Ok(Self::new(CompressionAlgorithm::Zstd { level }))
            }
            other => Err(ReduceError::Config(format!(
                "'{other}' is not a compression transformer"
            ))),
        }
    }

    /// The configured algorithm.
    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algo
    }
}

impl Transformer for CompressionTransformer {
    fn type_name(&self) -> &'static str {
        match self.algo {
            CompressionAlgorithm::Zstd { .. } => ZSTD_TYPE,
            CompressionAlgorithm::Lz4 => LZ4_TYPE,
        }
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, ReduceError> {
        compress(data, self.algo)
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, ReduceError> {
        decompress(data, self.algo)
    }
}
