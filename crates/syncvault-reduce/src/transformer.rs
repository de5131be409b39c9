//! Ordered, reversible transformer chain applied to outgoing containers.
//!
//! A chain is built from a list of [`TransformerDescriptor`]s and is fully
//! described by that list, so another process holding the same descriptors
//! and master key rebuilds an identical chain.

use crate::compression::{CompressionTransformer, LZ4_TYPE, ZSTD_TYPE};
use crate::encryption::{CipherTransformer, CIPHER_TYPE, SETTING_CIPHER_SPECS};
use crate::error::ReduceError;
use crate::keys::MasterKey;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use syncvault_transfer::PluginSettings;
use tracing::debug;

/// A reversible byte transformation.
pub trait Transformer: Send + Sync + Debug {
    /// Config name of this transformer, e.g. `"zstd"`.
    fn type_name(&self) -> &'static str;
    /// Forward transformation.
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, ReduceError>;
    /// Inverse of [`Transformer::encode`].
    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, ReduceError>;
}

/// One configured stage: a transformer type and its settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformerDescriptor {
    /// Transformer type name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Transformer-specific settings.
    #[serde(default)]
    pub settings: PluginSettings,
}

impl TransformerDescriptor {
    /// Descriptor with explicit settings.
    pub fn new(kind: impl Into<String>, settings: PluginSettings) -> Self {
        Self {
            kind: kind.into(),
            settings,
        }
    }

    /// Descriptor with default settings.
    pub fn bare(kind: impl Into<String>) -> Self {
        Self::new(kind, PluginSettings::new())
    }

    /// Fail if any setting key is not in `allowed`.
    pub fn reject_unknown_settings(&self, allowed: &[&str]) -> Result<(), ReduceError> {
        match self.settings.iter().find(|(k, _)| !allowed.contains(k)) {
            Some((key, _)) => Err(ReduceError::Config(format!(
                "transformer '{}' does not accept setting '{key}'",
                self.kind
            ))),
            None => Ok(()),
        }
    }
}

/// Compression followed by two-layer encryption (AES-128-GCM, ChaCha20-Poly1305).
pub fn default_descriptors() -> Vec<TransformerDescriptor> {
    vec![
        TransformerDescriptor::bare(ZSTD_TYPE),
        TransformerDescriptor::new(
            CIPHER_TYPE,
            PluginSettings::new().with(SETTING_CIPHER_SPECS, "1,2"),
        ),
    ]
}

/// What unit the chain is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformScope {
    /// Encode whole sealed containers (one envelope per remote object).
    #[default]
    Container,
    /// Encode each chunk payload before packing.
    Chunk,
}

/// An ordered list of transformers.
#[derive(Debug, Default)]
pub struct TransformerChain {
    stages: Vec<Box<dyn Transformer>>,
    descriptors: Vec<TransformerDescriptor>,
}

impl TransformerChain {
    /// The identity chain.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build and validate a chain. Cipher stages need `master_key`.
    pub fn from_descriptors(
        descriptors: &[TransformerDescriptor],
        master_key: Option<&MasterKey>,
    ) -> Result<Self, ReduceError> {
        let mut stages: Vec<Box<dyn Transformer>> = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let stage: Box<dyn Transformer> = match descriptor.kind.as_str() {
                ZSTD_TYPE | LZ4_TYPE => Box::new(CompressionTransformer::from_descriptor(descriptor)?),
                CIPHER_TYPE => {
                    let key = master_key.ok_or(ReduceError::MissingKey)?;
                    Box::new(CipherTransformer::from_descriptor(descriptor, key)?)
                }
                other => {
                    return Err(ReduceError::Config(format!("unknown transformer type '{other}'")))
                }
            };
            stages.push(stage);
        }
        debug!(
            stages = ?stages.iter().map(|s| s.type_name()).collect::<Vec<_>>(),
            "Built transformer chain"
        );
        Ok(Self {
            stages,
            descriptors: descriptors.to_vec(),
        })
    }

    /// Descriptors this chain was built from.
    pub fn descriptors(&self) -> &[TransformerDescriptor] {
        &self.descriptors
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// True for the identity chain.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Apply all stages, first to last.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>, ReduceError> {
        let mut buf = data.to_vec();
        for stage in &self.stages {
            buf = stage.encode(&buf)?;
        }
        Ok(buf)
    }

    /// Undo all stages, last to first.
    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>, ReduceError> {
        let mut buf = data.to_vec();
        for stage in self.stages.iter().rev() {
            buf = stage.decode(&buf)?;
        }
        Ok(buf)
    }
}
