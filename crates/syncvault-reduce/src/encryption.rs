//! AEAD cipher stage: AES-GCM and ChaCha20-Poly1305 with per-container HKDF keys
//!
//! Envelope layout (all integers little endian):
//! ```text
//! magic "SVCT" | version u8 | n u8 | spec ids [n] | salt [32] | nonces [n * 12] | ciphertext
//! ```
//! The whole header is authenticated as associated data by every cipher layer.

use crate::error::ReduceError;
use crate::keys::MasterKey;
use crate::transformer::{Transformer, TransformerDescriptor};
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Transformer type name of the cipher stage.
pub const CIPHER_TYPE: &str = "cipher";
/// Cipher setting: comma-separated cipher spec ids, applied in order.
pub const SETTING_CIPHER_SPECS: &str = "cipherspecs";
/// Cipher specs used when the setting is absent.
pub const DEFAULT_CIPHER_SPECS: &str = "1";

const MAGIC: &[u8; 4] = b"SVCT";
const VERSION: u8 = 1;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const MAX_LAYERS: usize = 8;

/// 256-bit (32-byte) encryption key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(pub [u8; 32]);

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

/// A numbered cipher specification: algorithm plus key length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherSpec {
    /// Spec 1: AES-128-GCM
    Aes128Gcm,
    /// Spec 2: ChaCha20-Poly1305, 256-bit key
    ChaCha20Poly1305,
    /// Spec 3: AES-256-GCM
    Aes256Gcm,
}

impl CipherSpec {
    /// All known specs.
    pub const ALL: [CipherSpec; 3] = [
        CipherSpec::Aes128Gcm,
        CipherSpec::ChaCha20Poly1305,
        CipherSpec::Aes256Gcm,
    ];

    /// Numeric id recorded in configs and envelopes.
    pub fn id(self) -> u8 {
        match self {
            CipherSpec::Aes128Gcm => 1,
            CipherSpec::ChaCha20Poly1305 => 2,
            CipherSpec::Aes256Gcm => 3,
        }
    }

    /// Look up a spec by id.
    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.id() == id)
    }

    /// Key length in bytes.
    pub fn key_len(self) -> usize {
        match self {
            CipherSpec::Aes128Gcm => 16,
            CipherSpec::ChaCha20Poly1305 | CipherSpec::Aes256Gcm => 32,
        }
    }

    /// Parse a list like `"1,2"`.
    pub fn parse_list(raw: &str) -> Result<Vec<Self>, ReduceError> {
        let specs = raw
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<u8>()
                    .ok()
                    .and_then(Self::from_id)
                    .ok_or_else(|| ReduceError::Config(format!("unknown cipher spec '{part}'")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if specs.is_empty() || specs.len() > MAX_LAYERS {
            return Err(ReduceError::Config(format!(
                "cipher spec list must have 1 to {MAX_LAYERS} entries"
            )));
        }
        Ok(specs)
    }
}

/// Generate a cryptographically random 12-byte nonce
pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Encrypt one layer. `aad` is authenticated but not encrypted.
pub fn encrypt(
    spec: CipherSpec,
    key: &EncryptionKey,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, ReduceError> {
    let payload = Payload {
        msg: plaintext,
        aad,
    };
    let result = match spec {
        CipherSpec::Aes128Gcm => Aes128Gcm::new_from_slice(&key.0[..spec.key_len()])
            .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?
            .encrypt(aes_gcm::Nonce::from_slice(nonce), payload),
        CipherSpec::Aes256Gcm => Aes256Gcm::new_from_slice(&key.0)
            .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?
            .encrypt(aes_gcm::Nonce::from_slice(nonce), payload),
        CipherSpec::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(&key.0)
            .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?
            .encrypt(chacha20poly1305::Nonce::from_slice(nonce), payload),
    };
    result.map_err(|e| ReduceError::EncryptionFailed(e.to_string()))
}

/// Decrypt one layer. Returns DecryptionAuthFailed if tampered, corrupted or the key is wrong.
pub fn decrypt(
    spec: CipherSpec,
    key: &EncryptionKey,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, ReduceError> {
    let payload = Payload {
        msg: ciphertext,
        aad,
    };
    let result = match spec {
        CipherSpec::Aes128Gcm => Aes128Gcm::new_from_slice(&key.0[..spec.key_len()])
            .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?
            .decrypt(aes_gcm::Nonce::from_slice(nonce), payload),
        CipherSpec::Aes256Gcm => Aes256Gcm::new_from_slice(&key.0)
            .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?
            .decrypt(aes_gcm::Nonce::from_slice(nonce), payload),
        CipherSpec::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(&key.0)
            .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?
            .decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload),
    };
    result.map_err(|_| ReduceError::DecryptionAuthFailed)
}

struct Envelope<'a> {
    header: &'a [u8],
    specs: Vec<CipherSpec>,
    salt: &'a [u8],
    nonces: Vec<[u8; NONCE_LEN]>,
    ciphertext: &'a [u8],
}

fn parse_envelope(data: &[u8]) -> Result<Envelope<'_>, ReduceError> {
    let malformed = |what: &str| ReduceError::MalformedPayload(format!("cipher envelope: {what}"));
    if data.len() < MAGIC.len() + 2 || &data[..MAGIC.len()] != MAGIC {
        return Err(malformed("bad magic"));
    }
    if data[4] != VERSION {
        return Err(malformed("unsupported version"));
    }
    let n = data[5] as usize;
    if n == 0 || n > MAX_LAYERS {
        return Err(malformed("bad layer count"));
    }
    let header_len = 6 + n + SALT_LEN + n * NONCE_LEN;
    if data.len() < header_len {
        return Err(malformed("truncated header"));
    }
    let specs = data[6..6 + n]
        .iter()
        .map(|id| CipherSpec::from_id(*id).ok_or_else(|| malformed("unknown cipher spec")))
        .collect::<Result<Vec<_>, _>>()?;
    let salt_start = 6 + n;
    let nonce_start = salt_start + SALT_LEN;
    let nonces = data[nonce_start..header_len]
        .chunks_exact(NONCE_LEN)
        .map(|c| {
            let mut nonce = [0u8; NONCE_LEN];
            nonce.copy_from_slice(c);
            nonce
        })
        .collect();
    Ok(Envelope {
        header: &data[..header_len],
        specs,
        salt: &data[salt_start..nonce_start],
        nonces,
        ciphertext: &data[header_len..],
    })
}

/// Cipher stage of the transformer chain.
///
/// Every encode call draws a fresh salt and nonces, so the output is
/// self-contained given the master key.
#[derive(Clone)]
pub struct CipherTransformer {
    specs: Vec<CipherSpec>,
    master_key: MasterKey,
}

impl std::fmt::Debug for CipherTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherTransformer")
            .field("specs", &self.specs)
            .finish_non_exhaustive()
    }
}

impl CipherTransformer {
    /// Stage encrypting with `specs` in order.
    pub fn new(specs: Vec<CipherSpec>, master_key: MasterKey) -> Result<Self, ReduceError> {
        if specs.is_empty() || specs.len() > MAX_LAYERS {
            return Err(ReduceError::Config(format!(
                "cipher spec list must have 1 to {MAX_LAYERS} entries"
            )));
        }
        Ok(Self { specs, master_key })
    }

    /// Build from a `cipher` descriptor.
    pub fn from_descriptor(
        descriptor: &TransformerDescriptor,
        master_key: &MasterKey,
    ) -> Result<Self, ReduceError> {
        descriptor.reject_unknown_settings(&[SETTING_CIPHER_SPECS])?;
        let raw = descriptor
            .settings
            .get(SETTING_CIPHER_SPECS)
            .unwrap_or(DEFAULT_CIPHER_SPECS);
        Self::new(CipherSpec::parse_list(raw)?, master_key.clone())
    }

    /// Configured cipher specs, in encode order.
    pub fn specs(&self) -> &[CipherSpec] {
        &self.specs
    }
}

impl Transformer for CipherTransformer {
    fn type_name(&self) -> &'static str {
        CIPHER_TYPE
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, ReduceError> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let nonces: Vec<[u8; NONCE_LEN]> = self.specs.iter().map(|_| random_nonce()).collect();

        let mut header =
            Vec::with_capacity(6 + self.specs.len() * (1 + NONCE_LEN) + SALT_LEN);
        header.extend_from_slice(MAGIC);
        header.push(VERSION);
        header.push(self.specs.len() as u8);
        header.extend(self.specs.iter().map(|s| s.id()));
        header.extend_from_slice(&salt);
        for nonce in &nonces {
            header.extend_from_slice(nonce);
        }

        let mut body = data.to_vec();
        for (spec, nonce) in self.specs.iter().zip(&nonces) {
            let key = self.master_key.derive_cipher_key(&salt, *spec)?;
            body = encrypt(*spec, &key, nonce, &body, &header)?;
        }

        let mut out = header;
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, ReduceError> {
        let envelope = parse_envelope(data)?;
        let mut body = envelope.ciphertext.to_vec();
        for (spec, nonce) in envelope.specs.iter().zip(&envelope.nonces).rev() {
            let key = self.master_key.derive_cipher_key(envelope.salt, *spec)?;
            body = decrypt(*spec, &key, nonce, &body, envelope.header)?;
        }
        Ok(body)
    }
}
