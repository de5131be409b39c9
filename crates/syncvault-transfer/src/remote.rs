//! Remote object naming.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{TransferError, TransferResult};

/// Name prefix of remote container objects.
pub const MULTICHUNK_PREFIX: &str = "multichunk-";

/// Maximum length of a remote object name.
pub const MAX_NAME_LEN: usize = 255;

/// Validated name of an object in a remote repository.
///
/// Backends are flat blob stores, so names are restricted to
/// `[A-Za-z0-9._-]` and may not start with a dot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemoteFile(String);

impl RemoteFile {
    /// Validate and wrap a remote name.
    pub fn new(name: impl Into<String>) -> TransferResult<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= MAX_NAME_LEN
            && !name.starts_with('.')
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
        if !valid {
            return Err(TransferError::InvalidRemoteName { name });
        }
        Ok(Self(name))
    }

    /// Remote name for a container with the given hex id.
    pub fn multichunk(id_hex: &str) -> TransferResult<Self> {
        Self::new(format!("{MULTICHUNK_PREFIX}{id_hex}"))
    }

    /// The hex id if this names a container.
    pub fn multichunk_id(&self) -> Option<&str> {
        self.0.strip_prefix(MULTICHUNK_PREFIX)
    }

    /// The raw name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RemoteFile {
    type Error = TransferError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RemoteFile> for String {
    fn from(value: RemoteFile) -> Self {
        value.0
    }
}
