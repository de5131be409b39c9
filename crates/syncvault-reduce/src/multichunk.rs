//! Multichunk packing: chunks are appended to an open container until it
//! reaches its size threshold, then the container is sealed and shipped.
//!
//! Wire format (integers little endian):
//! ```text
//! magic "SVMC" | version u8 | id [32] | count u32 | count * (checksum [32], offset u32, length u32) | payload
//! ```

use crate::checksum::{Checksum, CHECKSUM_LEN};
use crate::error::{ReduceError, ReduceResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use syncvault_transfer::{PluginSettings, RemoteFile, TransferResult};
use tracing::debug;

/// Default container threshold in KiB (4 MiB).
pub const DEFAULT_CONTAINER_SIZE_KIB: u64 = 4 * 1024;
/// Largest accepted container threshold in KiB (1 GiB).
pub const MAX_CONTAINER_SIZE_KIB: u64 = 1024 * 1024;
/// Multichunker setting: threshold in KiB.
pub const SETTING_SIZE: &str = "size";
/// Largest single chunk payload a container accepts.
pub const MAX_ENTRY_LEN: usize = 256 * 1024 * 1024;

const MAGIC: &[u8; 4] = b"SVMC";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 32 + 4;
const ENTRY_LEN: usize = CHECKSUM_LEN + 4 + 4;

/// Random 32-byte container identity, chosen when the container is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(pub [u8; 32]);

impl ContainerId {
    /// Fresh random id.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        ContainerId(bytes)
    }

    /// Lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the hex form.
    pub fn from_hex(s: &str) -> ReduceResult<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| ReduceError::MalformedPayload(format!("invalid container id: {e}")))?;
        Ok(ContainerId(bytes))
    }

    /// Remote object name: `multichunk-<hex>`.
    pub fn remote_file(&self) -> TransferResult<RemoteFile> {
        RemoteFile::multichunk(&self.to_hex())
    }

    /// Inverse of [`ContainerId::remote_file`]; `None` for other objects.
    pub fn from_remote_file(remote: &RemoteFile) -> Option<Self> {
        remote.multichunk_id().and_then(|hex| Self::from_hex(hex).ok())
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Position of one chunk inside a container payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerEntry {
    /// Checksum of the plaintext chunk.
    pub checksum: Checksum,
    /// Byte offset within the payload.
    pub offset: u32,
    /// Length of the stored bytes.
    pub length: u32,
}

/// Where an added chunk landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlacement {
    /// Container holding the chunk.
    pub container_id: ContainerId,
    /// Byte offset within the container payload.
    pub offset: u32,
    /// Stored length.
    pub length: u32,
}

/// A sealed, immutable container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    id: ContainerId,
    entries: Vec<ContainerEntry>,
    payload: Bytes,
}

impl Container {
    /// Container id.
    pub fn id(&self) -> ContainerId {
        self.id
    }

    /// Entries in payload order.
    pub fn entries(&self) -> &[ContainerEntry] {
        &self.entries
    }

    /// Number of chunks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no chunks are left.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Payload size in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Stored bytes of the chunk with `checksum`, if present.
    pub fn chunk(&self, checksum: &Checksum) -> Option<Bytes> {
        self.entries
            .iter()
            .find(|e| &e.checksum == checksum)
            .map(|e| self.slice(e.offset, e.length))
    }

    /// Stored bytes at a known placement.
    pub fn slice_at(&self, offset: u32, length: u32) -> ReduceResult<Bytes> {
        let end = offset as usize + length as usize;
        if end > self.payload.len() {
            return Err(ReduceError::IndexConsistency(format!(
                "placement {offset}+{length} outside container {} ({} bytes)",
                self.id,
                self.payload.len()
            )));
        }
        Ok(self.slice(offset, length))
    }

    fn slice(&self, offset: u32, length: u32) -> Bytes {
        self.payload
            .slice(offset as usize..offset as usize + length as usize)
    }

    /// Rebuild with only the chunks matching `keep`. The id is unchanged.
    pub fn retain<F>(&self, mut keep: F) -> Container
    where
        F: FnMut(&ContainerEntry) -> bool,
    {
        let mut entries = Vec::with_capacity(self.entries.len());
        let mut payload = BytesMut::with_capacity(self.payload.len());
        for entry in self.entries.iter().filter(|e| keep(e)) {
            entries.push(ContainerEntry {
                checksum: entry.checksum,
                offset: payload.len() as u32,
                length: entry.length,
            });
            payload.extend_from_slice(&self.slice(entry.offset, entry.length));
        }
        Container {
            id: self.id,
            entries,
            payload: payload.freeze(),
        }
    }

    /// Deterministic serialization.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf =
            BytesMut::with_capacity(HEADER_LEN + self.entries.len() * ENTRY_LEN + self.payload.len());
        buf.put_slice(MAGIC);
        buf.put_u8(VERSION);
        buf.put_slice(&self.id.0);
        buf.put_u32_le(self.entries.len() as u32);
        for e in &self.entries {
            buf.put_slice(e.checksum.as_bytes());
            buf.put_u32_le(e.offset);
            buf.put_u32_le(e.length);
        }
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    /// Parse and validate a serialized container.
    pub fn from_bytes(data: &[u8]) -> ReduceResult<Container> {
        let malformed = |what: &str| ReduceError::MalformedPayload(format!("container: {what}"));
        if data.len() < HEADER_LEN {
            return Err(malformed("truncated header"));
        }
        let mut buf = data;
        if &buf[..4] != MAGIC {
            return Err(malformed("bad magic"));
        }
        buf.advance(4);
        if buf.get_u8() != VERSION {
            return Err(malformed("unsupported version"));
        }
        let mut id = [0u8; 32];
        buf.copy_to_slice(&mut id);
        let count = buf.get_u32_le() as usize;
        if buf.remaining() < count.saturating_mul(ENTRY_LEN) {
            return Err(malformed("truncated entry table"));
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let mut checksum = [0u8; CHECKSUM_LEN];
            buf.copy_to_slice(&mut checksum);
            entries.push(ContainerEntry {
                checksum: Checksum(checksum),
                offset: buf.get_u32_le(),
                length: buf.get_u32_le(),
            });
        }
        let payload = Bytes::copy_from_slice(buf);
        if entries
            .iter()
            .any(|e| e.offset as usize + e.length as usize > payload.len())
        {
            return Err(malformed("entry outside payload"));
        }
        Ok(Container {
            id: ContainerId(id),
            entries,
            payload,
        })
    }
}

/// Multichunker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiChunkerConfig {
    /// Seal threshold in KiB.
    pub size: u64,
}

impl Default for MultiChunkerConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_CONTAINER_SIZE_KIB,
        }
    }
}

impl MultiChunkerConfig {
    /// Config with a threshold in KiB.
    pub fn with_size_kib(size: u64) -> Self {
        Self { size }
    }

    /// Parse plugin-style settings (`size` in KiB).
    pub fn from_settings(settings: &PluginSettings) -> ReduceResult<Self> {
        if let Some((key, _)) = settings.iter().find(|(k, _)| *k != SETTING_SIZE) {
            return Err(ReduceError::Config(format!(
                "multichunker does not accept setting '{key}'"
            )));
        }
        match settings.get(SETTING_SIZE) {
            None => Ok(Self::default()),
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Self::with_size_kib)
                .map_err(|_| ReduceError::Config(format!("invalid multichunk size '{raw}'"))),
        }
    }

    /// Threshold in bytes, after validation.
    pub fn threshold_bytes(&self) -> ReduceResult<usize> {
        if self.size == 0 || self.size > MAX_CONTAINER_SIZE_KIB {
            return Err(ReduceError::Config(format!(
                "multichunk size must be between 1 and {MAX_CONTAINER_SIZE_KIB} KiB, got {}",
                self.size
            )));
        }
        Ok(self.size as usize * 1024)
    }
}

/// Result of [`MultiChunker::add`].
#[derive(Debug)]
pub struct AddOutcome {
    /// Where the chunk was placed.
    pub placement: ChunkPlacement,
    /// The previous container, if adding this chunk sealed it.
    pub sealed: Option<Container>,
}

#[derive(Debug)]
struct OpenContainer {
    id: ContainerId,
    entries: Vec<ContainerEntry>,
    payload: BytesMut,
}

/// Packs chunk payloads into size-bounded containers.
#[derive(Debug)]
pub struct MultiChunker {
    threshold: usize,
    current: Option<OpenContainer>,
}

impl MultiChunker {
    /// Packer with the configured threshold.
    pub fn new(config: MultiChunkerConfig) -> ReduceResult<Self> {
        Ok(Self {
            threshold: config.threshold_bytes()?,
            current: None,
        })
    }

    /// Seal threshold in bytes.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Bytes in the open container.
    pub fn open_payload_len(&self) -> usize {
        self.current.as_ref().map_or(0, |c| c.payload.len())
    }

    /// Append a chunk. Seals the open container first if the chunk would
    /// push it over the threshold; chunks are never split.
    pub fn add(&mut self, checksum: Checksum, payload: &[u8]) -> ReduceResult<AddOutcome> {
        if payload.len() > MAX_ENTRY_LEN {
            return Err(ReduceError::Config(format!(
                "chunk of {} bytes exceeds container entry limit",
                payload.len()
            )));
        }
        let overflows = self.current.as_ref().is_some_and(|c| {
            !c.entries.is_empty() && c.payload.len() + payload.len() > self.threshold
        });
        let sealed = if overflows { self.seal_current() } else { None };

        let open = self.current.get_or_insert_with(|| OpenContainer {
            id: ContainerId::random(),
            entries: Vec::new(),
            payload: BytesMut::new(),
        });
        let placement = ChunkPlacement {
            container_id: open.id,
            offset: open.payload.len() as u32,
            length: payload.len() as u32,
        };
        open.entries.push(ContainerEntry {
            checksum,
            offset: placement.offset,
            length: placement.length,
        });
        open.payload.extend_from_slice(payload);
        Ok(AddOutcome { placement, sealed })
    }

    /// Seal and return the open container, if it holds any chunk.
    pub fn seal_current(&mut self) -> Option<Container> {
        let open = self.current.take()?;
        if open.entries.is_empty() {
            return None;
        }
        debug!(
            container = %open.id,
            chunks = open.entries.len(),
            payload_bytes = open.payload.len(),
            threshold = self.threshold,
            "Sealed container"
        );
        Some(Container {
            id: open.id,
            entries: open.entries,
            payload: open.payload.freeze(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packer(kib: u64) -> MultiChunker {
        MultiChunker::new(MultiChunkerConfig::with_size_kib(kib)).unwrap()
    }

    fn chunk(byte: u8, len: usize) -> (Checksum, Vec<u8>) {
        let data = vec![byte; len];
        (Checksum::of(&data), data)
    }

    #[test]
    fn seals_before_exceeding_threshold() {
        let mut p = packer(1);
        let (c1, d1) = chunk(1, 600);
        let (c2, d2) = chunk(2, 600);
        let first = p.add(c1, &d1).unwrap();
        assert!(first.sealed.is_none());
        let second = p.add(c2, &d2).unwrap();
        let sealed = second.sealed.unwrap();
        assert_eq!(sealed.id(), first.placement.container_id);
        assert_eq!(sealed.len(), 1);
        assert!(sealed.payload_len() <= 1024);
        assert_ne!(second.placement.container_id, sealed.id());
        assert_eq!(second.placement.offset, 0);
    }

    #[test]
    fn fills_up_to_threshold_exactly() {
        let mut p = packer(1);
        for i in 0..4u8 {
            let (c, d) = chunk(i, 256);
            assert!(p.add(c, &d).unwrap().sealed.is_none());
        }
        assert_eq!(p.open_payload_len(), 1024);
        let sealed = p.seal_current().unwrap();
        assert_eq!(sealed.len(), 4);
        assert!(p.seal_current().is_none());
    }

    #[test]
    fn oversize_chunk_gets_own_container() {
        let mut p = packer(1);
        let (small, sd) = chunk(1, 100);
        let (big, bd) = chunk(2, 5000);
        let (after, ad) = chunk(3, 100);
        p.add(small, &sd).unwrap();
        let big_out = p.add(big, &bd).unwrap();
        assert_eq!(big_out.sealed.unwrap().len(), 1);
        let after_out = p.add(after, &ad).unwrap();
        let big_container = after_out.sealed.unwrap();
        assert_eq!(big_container.id(), big_out.placement.container_id);
        assert_eq!(big_container.len(), 1);
        assert_eq!(big_container.chunk(&big).unwrap().len(), 5000);
    }

    #[test]
    fn placements_address_payload() {
        let mut p = packer(64);
        let (c1, d1) = chunk(1, 10);
        let (c2, d2) = chunk(2, 20);
        p.add(c1, &d1).unwrap();
        let pl = p.add(c2, &d2).unwrap().placement;
        let sealed = p.seal_current().unwrap();
        assert_eq!(&sealed.slice_at(pl.offset, pl.length).unwrap()[..], &d2[..]);
        assert!(sealed.slice_at(25, 10).is_err());
    }

    #[test]
    fn wire_format_roundtrip_and_layout() {
        let mut p = packer(64);
        let (c1, d1) = chunk(1, 10);
        p.add(c1, &d1).unwrap();
        let sealed = p.seal_current().unwrap();
        let bytes = sealed.to_bytes();
        assert_eq!(&bytes[..4], b"SVMC");
        assert_eq!(bytes[4], 1);
        assert_eq!(&bytes[5..37], &sealed.id().0);
        assert_eq!(&bytes[37..41], &1u32.to_le_bytes());
        assert_eq!(bytes.len(), HEADER_LEN + ENTRY_LEN + 10);
        assert_eq!(bytes, sealed.to_bytes());
        assert_eq!(Container::from_bytes(&bytes).unwrap(), sealed);
    }

    #[test]
    fn malformed_containers_rejected() {
        assert!(Container::from_bytes(b"SVMC").is_err());
        let mut p = packer(64);
        let (c1, d1) = chunk(1, 10);
        p.add(c1, &d1).unwrap();
        let bytes = p.seal_current().unwrap().to_bytes();
        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(Container::from_bytes(&bad_magic).is_err());
        let truncated = &bytes[..bytes.len() - 1];
        assert!(matches!(
            Container::from_bytes(truncated),
            Err(ReduceError::MalformedPayload(_))
        ));
    }

    #[test]
    fn retain_keeps_id_and_repacks() {
        let mut p = packer(64);
        let chunks: Vec<_> = (0..3u8).map(|i| chunk(i, 10 + i as usize)).collect();
        for (c, d) in &chunks {
            p.add(*c, d).unwrap();
        }
        let sealed = p.seal_current().unwrap();
        let kept = sealed.retain(|e| e.checksum != chunks[0].0);
        assert_eq!(kept.id(), sealed.id());
        assert_eq!(kept.len(), 2);
        assert_eq!(kept.entries()[0].offset, 0);
        assert_eq!(&kept.chunk(&chunks[2].0).unwrap()[..], &chunks[2].1[..]);
        assert!(sealed.retain(|_| false).is_empty());
    }

    #[test]
    fn config_from_settings() {
        let cfg = MultiChunkerConfig::from_settings(&PluginSettings::new().with("size", "4096"))
            .unwrap();
        assert_eq!(cfg.threshold_bytes().unwrap(), 4 * 1024 * 1024);
        assert_eq!(MultiChunkerConfig::default(), cfg);
        assert!(MultiChunkerConfig::from_settings(&PluginSettings::new().with("size", "big")).is_err());
        assert!(MultiChunkerConfig::from_settings(&PluginSettings::new().with("level", "1")).is_err());
        assert!(MultiChunker::new(MultiChunkerConfig::with_size_kib(0)).is_err());
    }

    #[test]
    fn container_ids_map_to_remote_names() {
        let id = ContainerId::random();
        let remote = id.remote_file().unwrap();
        assert_eq!(remote.name(), format!("multichunk-{}", id.to_hex()));
        assert_eq!(ContainerId::from_remote_file(&remote), Some(id));
        let other = RemoteFile::new("syncvault-repo").unwrap();
        assert_eq!(ContainerId::from_remote_file(&other), None);
    }
}
