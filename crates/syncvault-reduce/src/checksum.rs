//! Content checksums: BLAKE3 digests used as chunk identity and dedup key

use crate::error::ReduceError;
use serde::{Deserialize, Serialize};

/// Length of a checksum in bytes.
pub const CHECKSUM_LEN: usize = 32;

/// A 32-byte BLAKE3 hash identifying a chunk's content. Used as the dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Checksum(pub [u8; CHECKSUM_LEN]);

impl Checksum {
    /// Hash `data`.
    pub fn of(data: &[u8]) -> Self {
        Checksum(*blake3::hash(data).as_bytes())
    }

    /// Return the hash as a lowercase hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string
    pub fn from_hex(s: &str) -> Result<Self, ReduceError> {
        let mut bytes = [0u8; CHECKSUM_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| ReduceError::MalformedPayload(format!("invalid checksum hex: {e}")))?;
        Ok(Checksum(bytes))
    }

    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8; CHECKSUM_LEN] {
        &self.0
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
