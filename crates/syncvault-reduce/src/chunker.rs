//! Chunkers: split a byte stream into checksummed chunks.
//!
//! Two strategies are available, fixed-size and content-defined (FastCDC).
//! Both are lazy: a [`ChunkStream`] reads from the source only as chunks are
//! pulled, and ends after the first error.

use crate::checksum::Checksum;
use crate::error::{ReduceError, ReduceResult};
use bytes::Bytes;
use fastcdc::v2020::{self, StreamCDC};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read};

/// FastCDC bounds on the minimum chunk size.
pub const CDC_MIN_SIZE_RANGE: std::ops::RangeInclusive<usize> = 64..=1024 * 1024;
/// FastCDC bounds on the average chunk size.
pub const CDC_AVG_SIZE_RANGE: std::ops::RangeInclusive<usize> = 256..=4 * 1024 * 1024;
/// FastCDC bounds on the maximum chunk size.
pub const CDC_MAX_SIZE_RANGE: std::ops::RangeInclusive<usize> = 1024..=16 * 1024 * 1024;
/// Largest accepted fixed chunk size.
pub const MAX_FIXED_SIZE: usize = 16 * 1024 * 1024;

/// A piece of a file, identified by the checksum of its content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// BLAKE3 checksum of `data`
    pub checksum: Checksum,
    /// Chunk content
    pub data: Bytes,
    /// Byte offset of this chunk in the source stream
    pub offset: u64,
}

impl Chunk {
    /// Build a chunk and compute its checksum.
    pub fn new(data: Bytes, offset: u64) -> Self {
        Self {
            checksum: Checksum::of(&data),
            data,
            offset,
        }
    }

    /// Content length in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Lazy sequence of chunks. Yields at most one error, then ends.
pub type ChunkStream<'a> = Box<dyn Iterator<Item = ReduceResult<Chunk>> + Send + 'a>;

/// Splits a byte stream into chunks.
pub trait Chunker: Send + Sync + std::fmt::Debug {
    /// Chunk `reader` lazily.
    fn chunks<'a>(&self, reader: Box<dyn Read + Send + 'a>) -> ChunkStream<'a>;

    /// Chunk an in-memory buffer.
    fn chunk_bytes(&self, data: &[u8]) -> ReduceResult<Vec<Chunk>> {
        self.chunks(Box::new(std::io::Cursor::new(data))).collect()
    }
}

/// Cuts every `size` bytes; the last chunk may be shorter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedSizeChunker {
    size: usize,
}

impl FixedSizeChunker {
    /// Chunker with the given chunk size.
    pub fn new(size: usize) -> ReduceResult<Self> {
        if size == 0 || size > MAX_FIXED_SIZE {
            return Err(ReduceError::Config(format!(
                "fixed chunk size must be between 1 and {MAX_FIXED_SIZE}, got {size}"
            )));
        }
        Ok(Self { size })
    }

    /// Configured chunk size.
    pub fn size(&self) -> usize {
        self.size
    }
}

struct FixedChunks<'a> {
    reader: Box<dyn Read + Send + 'a>,
    size: usize,
    offset: u64,
    done: bool,
}

impl FixedChunks<'_> {
    /// Fill up to `size` bytes, retrying short reads.
    fn fill(&mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; self.size];
        let mut filled = 0;
        while filled < self.size {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

impl Iterator for FixedChunks<'_> {
    type Item = ReduceResult<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.fill() {
            Ok(buf) if buf.is_empty() => {
                self.done = true;
                None
            }
            Ok(buf) => {
                if buf.len() < self.size {
                    self.done = true;
                }
                let chunk = Chunk::new(Bytes::from(buf), self.offset);
                self.offset += chunk.size() as u64;
                Some(Ok(chunk))
            }
            Err(e) => {
                self.done = true;
                Some(Err(ReduceError::ChunkingFailed(e.to_string())))
            }
        }
    }
}

impl Chunker for FixedSizeChunker {
    fn chunks<'a>(&self, reader: Box<dyn Read + Send + 'a>) -> ChunkStream<'a> {
        Box::new(FixedChunks {
            reader,
            size: self.size,
            offset: 0,
            done: false,
        })
    }
}

/// Content-defined chunker using the FastCDC 2020 algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CdcChunker {
    min_size: u32,
    avg_size: u32,
    max_size: u32,
}

impl CdcChunker {
    /// Chunker with explicit bounds, validated against FastCDC's limits.
    pub fn new(min_size: usize, avg_size: usize, max_size: usize) -> ReduceResult<Self> {
        let check = |name: &str, value: usize, range: std::ops::RangeInclusive<usize>| {
            if range.contains(&value) {
                Ok(())
            } else {
                Err(ReduceError::Config(format!(
                    "cdc {name} {value} outside {}..={}",
                    range.start(),
                    range.end()
                )))
            }
        };
        check("min_size", min_size, CDC_MIN_SIZE_RANGE)?;
        check("avg_size", avg_size, CDC_AVG_SIZE_RANGE)?;
        check("max_size", max_size, CDC_MAX_SIZE_RANGE)?;
        if !(min_size <= avg_size && avg_size <= max_size) {
            return Err(ReduceError::Config(format!(
                "cdc sizes must satisfy min <= avg <= max, got {min_size}/{avg_size}/{max_size}"
            )));
        }
        Ok(Self {
            min_size: min_size as u32,
            avg_size: avg_size as u32,
            max_size: max_size as u32,
        })
    }
}

impl Default for CdcChunker {
    fn default() -> Self {
        Self {
            min_size: 16 * 1024,
            avg_size: 64 * 1024,
            max_size: 256 * 1024,
        }
    }
}

impl Chunker for CdcChunker {
    fn chunks<'a>(&self, reader: Box<dyn Read + Send + 'a>) -> ChunkStream<'a> {
        let mut inner = StreamCDC::new(reader, self.min_size, self.avg_size, self.max_size);
        let mut failed = false;
        Box::new(std::iter::from_fn(move || {
            if failed {
                return None;
            }
            match inner.next()? {
                Ok(c) => Some(Ok(Chunk::new(Bytes::from(c.data), c.offset))),
                Err(v2020::Error::Empty) => None,
                Err(e) => {
                    failed = true;
                    Some(Err(ReduceError::ChunkingFailed(format!("{e:?}"))))
                }
            }
        }))
    }
}

/// Chunker selection as stored in the repository config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChunkerConfig {
    /// [`FixedSizeChunker`]
    Fixed {
        /// Chunk size in bytes
        size: usize,
    },
    /// [`CdcChunker`]
    Cdc {
        /// Minimum chunk size in bytes
        min_size: usize,
        /// Average (target) chunk size in bytes
        avg_size: usize,
        /// Maximum chunk size in bytes
        max_size: usize,
    },
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        ChunkerConfig::Cdc {
            min_size: 16 * 1024,
            avg_size: 64 * 1024,
            max_size: 256 * 1024,
        }
    }
}

impl ChunkerConfig {
    /// Validate and build the configured chunker.
    pub fn build(&self) -> ReduceResult<Box<dyn Chunker>> {
        Ok(match *self {
            ChunkerConfig::Fixed { size } => Box::new(FixedSizeChunker::new(size)?),
            ChunkerConfig::Cdc {
                min_size,
                avg_size,
                max_size,
            } => Box::new(CdcChunker::new(min_size, avg_size, max_size)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn reassemble(chunks: &[Chunk]) -> Vec<u8> {
        chunks.iter().flat_map(|c| c.data.iter().copied()).collect()
    }

    fn small_cdc() -> CdcChunker {
        CdcChunker::new(1024, 4096, 16 * 1024).unwrap()
    }

    struct FailingReader {
        served: usize,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.served >= 8192 {
                return Err(std::io::Error::other("disk went away"));
            }
            let n = buf.len().min(8192 - self.served);
            buf[..n].fill(7);
            self.served += n;
            Ok(n)
        }
    }

    #[test]
    fn cdc_chunks_reassemble() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let chunks = CdcChunker::default().chunk_bytes(&data).unwrap();
        assert!(!chunks.is_empty());
        assert_eq!(reassemble(&chunks), data);
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(CdcChunker::default().chunk_bytes(&[]).unwrap().is_empty());
        assert!(FixedSizeChunker::new(10).unwrap().chunk_bytes(&[]).unwrap().is_empty());
    }

    #[test]
    fn input_shorter_than_min_is_one_chunk() {
        let chunks = small_cdc().chunk_bytes(b"tiny").unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].checksum, Checksum::of(b"tiny"));
        assert_eq!(chunks[0].size(), 4);
    }

    #[test]
    fn fixed_chunks_emit_short_tail() {
        let chunks = FixedSizeChunker::new(4).unwrap().chunk_bytes(b"abcdefghij").unwrap();
        let sizes: Vec<usize> = chunks.iter().map(Chunk::size).collect();
        let offsets: Vec<u64> = chunks.iter().map(|c| c.offset).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(offsets, vec![0, 4, 8]);
    }

    #[test]
    fn offsets_are_contiguous() {
        let data = vec![42u8; 100_000];
        let chunks = small_cdc().chunk_bytes(&data).unwrap();
        let mut expected = 0u64;
        for c in &chunks {
            assert_eq!(c.offset, expected);
            expected += c.size() as u64;
        }
        assert_eq!(expected, data.len() as u64);
    }

    #[test]
    fn read_error_ends_stream() {
        for chunker in [
            Box::new(FixedSizeChunker::new(4096).unwrap()) as Box<dyn Chunker>,
            Box::new(small_cdc()),
        ] {
            let results: Vec<_> = chunker.chunks(Box::new(FailingReader { served: 0 })).collect();
            let last = results.last().unwrap();
            assert!(matches!(last, Err(ReduceError::ChunkingFailed(_))));
            assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
        }
    }

    #[test]
    fn cdc_bounds_validated() {
        assert!(CdcChunker::new(16, 4096, 16384).is_err());
        assert!(CdcChunker::new(8192, 4096, 16384).is_err());
        assert!(CdcChunker::new(1024, 4096, 32 * 1024 * 1024).is_err());
        assert!(FixedSizeChunker::new(0).is_err());
    }

    #[test]
    fn config_serde_and_build() {
        let cfg: ChunkerConfig = toml::from_str("type = \"fixed\"\nsize = 4096\n").unwrap();
        assert_eq!(cfg, ChunkerConfig::Fixed { size: 4096 });
        assert!(cfg.build().is_ok());
        assert!(ChunkerConfig::default().build().is_ok());
        let bad = ChunkerConfig::Cdc {
            min_size: 1,
            avg_size: 2,
            max_size: 3,
        };
        assert!(matches!(bad.build(), Err(ReduceError::Config(_))));
    }

    #[test]
    fn shifted_content_shares_chunks() {
        let base: Vec<u8> = (0..300_000u64)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let mut shifted = b"inserted prefix".to_vec();
        shifted.extend_from_slice(&base);
        let chunker = small_cdc();
        let a: std::collections::HashSet<_> = chunker
            .chunk_bytes(&base)
            .unwrap()
            .into_iter()
            .map(|c| c.checksum)
            .collect();
        let shared = chunker
            .chunk_bytes(&shifted)
            .unwrap()
            .iter()
            .filter(|c| a.contains(&c.checksum))
            .count();
        assert!(shared > 0);
    }

    proptest! {
        #[test]
        fn prop_chunks_reassemble(data in prop::collection::vec(0u8..=255, 0..200_000), fixed in 1usize..10_000) {
            prop_assert_eq!(reassemble(&small_cdc().chunk_bytes(&data).unwrap()), data.clone());
            let f = FixedSizeChunker::new(fixed).unwrap();
            prop_assert_eq!(reassemble(&f.chunk_bytes(&data).unwrap()), data);
        }

        #[test]
        fn prop_chunking_is_deterministic(data in prop::collection::vec(0u8..=255, 0..100_000)) {
            let a = small_cdc().chunk_bytes(&data).unwrap();
            let b = small_cdc().chunk_bytes(&data).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
