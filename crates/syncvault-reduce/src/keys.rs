//! Repository master key and per-container key derivation.
//!
//! The master key is derived once per repository from a passphrase and a
//! random salt (PBKDF2-HMAC-SHA256). Only the salted form ([`SaltedKeyRecord`])
//! leaves the process. Cipher transformers derive a key per container and
//! cipher spec with HKDF-SHA256.

use crate::encryption::{CipherSpec, EncryptionKey};
use crate::error::ReduceError;
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt::Debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of the master key salt.
pub const MASTER_KEY_SALT_LEN: usize = 32;

/// Length of the master key.
pub const MASTER_KEY_LEN: usize = 32;

/// PBKDF2 rounds used when none are configured.
pub const DEFAULT_KDF_ROUNDS: u32 = 1_000_000;

const CIPHER_KEY_INFO: &[u8] = b"syncvault-cipher-key";

/// Parameters for passphrase-based master key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// PBKDF2 iteration count.
    pub rounds: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            rounds: DEFAULT_KDF_ROUNDS,
        }
    }
}

/// The repository master key together with the salt it was derived with.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    salt: [u8; MASTER_KEY_SALT_LEN],
    key: [u8; MASTER_KEY_LEN],
}

impl Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MasterKey {{ salt: {}, key: [REDACTED] }}", hex::encode(self.salt))
    }
}

impl MasterKey {
    /// Create a new master key from a passphrase with a fresh random salt.
    pub fn create(passphrase: &str, params: &KdfParams) -> Result<Self, ReduceError> {
        let mut salt = [0u8; MASTER_KEY_SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        Self::derive(passphrase, salt, params)
    }

    /// Re-derive a master key from a passphrase and a known salt.
    pub fn derive(
        passphrase: &str,
        salt: [u8; MASTER_KEY_SALT_LEN],
        params: &KdfParams,
    ) -> Result<Self, ReduceError> {
        if params.rounds == 0 {
            return Err(ReduceError::Config("KDF rounds must be positive".to_string()));
        }
        let mut key = [0u8; MASTER_KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), &salt, params.rounds, &mut key);
        Ok(Self { salt, key })
    }

    /// Build from raw parts, e.g. loaded from a key store.
    pub fn from_parts(salt: [u8; MASTER_KEY_SALT_LEN], key: [u8; MASTER_KEY_LEN]) -> Self {
        Self { salt, key }
    }

    /// Restore from the persisted salted form.
    pub fn from_record(record: &SaltedKeyRecord) -> Result<Self, ReduceError> {
        let mut salt = [0u8; MASTER_KEY_SALT_LEN];
        let mut key = [0u8; MASTER_KEY_LEN];
        hex::decode_to_slice(&record.salt, &mut salt)
            .map_err(|e| ReduceError::Config(format!("invalid master key salt: {e}")))?;
        hex::decode_to_slice(&record.key, &mut key)
            .map_err(|e| ReduceError::Config(format!("invalid master key: {e}")))?;
        Ok(Self { salt, key })
    }

    /// Salted form for persistence by config collaborators.
    pub fn to_record(&self) -> SaltedKeyRecord {
        SaltedKeyRecord {
            salt: hex::encode(self.salt),
            key: hex::encode(self.key),
        }
    }

    /// The salt this key was derived with.
    pub fn salt(&self) -> &[u8; MASTER_KEY_SALT_LEN] {
        &self.salt
    }

    /// Derive the key for one cipher spec from a per-container salt.
    pub fn derive_cipher_key(
        &self,
        container_salt: &[u8],
        spec: CipherSpec,
    ) -> Result<EncryptionKey, ReduceError> {
        let hk = Hkdf::<Sha256>::new(Some(container_salt), &self.key);
        let mut okm = [0u8; 32];
        let mut info = Vec::with_capacity(CIPHER_KEY_INFO.len() + 1);
        info.extend_from_slice(CIPHER_KEY_INFO);
        info.push(spec.id());
        hk.expand(&info, &mut okm)
            .map_err(|e| ReduceError::EncryptionFailed(format!("HKDF expand failed: {e}")))?;
        Ok(EncryptionKey(okm))
    }
}

/// Persisted, hex-encoded form of a [`MasterKey`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaltedKeyRecord {
    /// Hex salt.
    pub salt: String,
    /// Hex key derived from passphrase and salt.
    pub key: String,
}

impl Debug for SaltedKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SaltedKeyRecord {{ salt: {}, key: [REDACTED] }}", self.salt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST: KdfParams = KdfParams { rounds: 1_000 };

    #[test]
    fn test_create_uses_random_salt() {
        let k1 = MasterKey::create("some password", &FAST).unwrap();
        let k2 = MasterKey::create("some password", &FAST).unwrap();
        assert_ne!(k1.salt(), k2.salt());
        assert_ne!(k1.to_record().key, k2.to_record().key);
    }

    #[test]
    fn test_derive_is_deterministic() {
        let k1 = MasterKey::create("some password", &FAST).unwrap();
        let k2 = MasterKey::derive("some password", *k1.salt(), &FAST).unwrap();
        assert_eq!(k1.to_record(), k2.to_record());
        let other = MasterKey::derive("other password", *k1.salt(), &FAST).unwrap();
        assert_ne!(k1.to_record(), other.to_record());
    }

    #[test]
    fn test_zero_rounds_rejected() {
        assert!(matches!(
            MasterKey::create("pw", &KdfParams { rounds: 0 }),
            Err(ReduceError::Config(_))
        ));
    }

    #[test]
    fn test_record_roundtrip() {
        let key = MasterKey::create("pw", &FAST).unwrap();
        let restored = MasterKey::from_record(&key.to_record()).unwrap();
        assert_eq!(restored.to_record(), key.to_record());

        let bad = SaltedKeyRecord {
            salt: "00".to_string(),
            key: key.to_record().key,
        };
        assert!(MasterKey::from_record(&bad).is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = MasterKey::from_parts([1u8; 32], [0xabu8; 32]);
        let dbg = format!("{:?} {:?}", key, key.to_record());
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains(&"ab".repeat(32)));
    }

    #[test]
    fn test_cipher_keys_depend_on_salt_and_spec() {
        let master = MasterKey::from_parts([1u8; 32], [2u8; 32]);
        let a = master.derive_cipher_key(&[0u8; 32], CipherSpec::Aes128Gcm).unwrap();
        let again = master.derive_cipher_key(&[0u8; 32], CipherSpec::Aes128Gcm).unwrap();
        let other_salt = master.derive_cipher_key(&[9u8; 32], CipherSpec::Aes128Gcm).unwrap();
        let other_spec = master
            .derive_cipher_key(&[0u8; 32], CipherSpec::ChaCha20Poly1305)
            .unwrap();
        assert_eq!(a.0, again.0);
        assert_ne!(a.0, other_salt.0);
        assert_ne!(a.0, other_spec.0);
    }
}
