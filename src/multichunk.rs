//! Size-bounded chunk containers
//!
//! Chunks are not stored one object per chunk. A [`MultiChunker`] packs them
//! into containers ("multichunks") that are uploaded as single remote
//! objects named `multichunk-<id>`, where the id is the checksum of the
//! first chunk written.
//!
//! A container moves through three states:
//!
//! ```text
//! Open --(next chunk would exceed the bound)--> Full --seal()--> Sealed
//!   \___________________________seal()___________________________/
//! ```
//!
//! Writing to a full or sealed container is an error. Sealing happens
//! exactly once; it finalizes the transformer chain and flushes the
//! underlying stream.
//!
//! ## Container format
//!
//! The plaintext container (before transformation) is
//!
//! ```text
//! magic "SFMC" | version (1)
//! entry*: checksum (32) | length u32 BE | bytes
//! ```
//!
//! The packed size counts all of these bytes. It never exceeds the
//! configured maximum unless a single chunk is larger than the maximum, in
//! which case that chunk fills a container alone.

use crate::chunker::Chunk;
use crate::config::MultiChunkerConfig;
use crate::error::{Result, SyncError};
use crate::model::{Checksum, ChunkEntry, MultiChunkEntry, MultiChunkId, CHECKSUM_LEN};
use crate::transform::{decode_error, FinishWrite, TransformerChain};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use tracing::{debug, trace};

const CONTAINER_MAGIC: &[u8; 4] = b"SFMC";
const CONTAINER_VERSION: u8 = 1;

/// Bytes of container header
pub const CONTAINER_HEADER_SIZE: u64 = 5;

/// Per-entry overhead: checksum plus length prefix
pub const ENTRY_OVERHEAD: u64 = CHECKSUM_LEN as u64 + 4;

/// Lifecycle state of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiChunkState {
    /// Accepting chunks
    Open,
    /// Bound reached; must be sealed
    Full,
    /// Finalized and immutable
    Sealed,
}

/// Creates containers with a common size bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiChunker {
    max_size: u64,
}

impl MultiChunker {
    /// Create a multichunker with the given packed size bound
    pub fn new(max_size: u64) -> Self {
        Self { max_size: max_size.max(1) }
    }

    /// Create a multichunker from configuration
    pub fn from_config(config: &MultiChunkerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config.max_size))
    }

    /// Packed size bound
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Open a new container writing through `chain` into `writer`
    ///
    /// # Arguments
    ///
    /// * `id` - Container id, the checksum of the first chunk to be written
    /// * `writer` - Destination of the transformed container bytes
    /// * `chain` - Transformer stages applied to the container
    pub fn create<'a, W: Write + 'a>(
        &self,
        id: MultiChunkId,
        writer: W,
        chain: &TransformerChain,
    ) -> Result<MultiChunk<'a>> {
        let mut out = chain.encoder(writer)?;
        out.write_all(CONTAINER_MAGIC)?;
        out.write_all(&[CONTAINER_VERSION])?;

        debug!("Opened multichunk {}", id.short());
        Ok(MultiChunk {
            id,
            max_size: self.max_size,
            packed_size: CONTAINER_HEADER_SIZE,
            chunks: Vec::new(),
            state: MultiChunkState::Open,
            out: Some(out),
        })
    }
}

impl Default for MultiChunker {
    fn default() -> Self {
        Self::new(MultiChunkerConfig::default().max_size)
    }
}

/// An open container being written
pub struct MultiChunk<'a> {
    id: MultiChunkId,
    max_size: u64,
    packed_size: u64,
    chunks: Vec<ChunkEntry>,
    state: MultiChunkState,
    out: Option<Box<dyn FinishWrite + 'a>>,
}

impl MultiChunk<'_> {
    /// Container id
    pub fn id(&self) -> MultiChunkId {
        self.id
    }

    /// Current state
    pub fn state(&self) -> MultiChunkState {
        self.state
    }

    /// Packed (untransformed) size so far, including the header
    pub fn packed_size(&self) -> u64 {
        self.packed_size
    }

    /// Chunks written so far
    pub fn chunks(&self) -> &[ChunkEntry] {
        &self.chunks
    }

    /// True once the container must be sealed
    pub fn is_full(&self) -> bool {
        self.state != MultiChunkState::Open
    }

    /// True if `chunk_size` more bytes fit without exceeding the bound
    ///
    /// An empty container accepts any chunk, so oversized chunks get a
    /// container of their own.
    pub fn accepts(&self, chunk_size: u32) -> bool {
        self.state == MultiChunkState::Open
            && (self.chunks.is_empty()
                || self.packed_size + ENTRY_OVERHEAD + chunk_size as u64 <= self.max_size)
    }

    /// Append a chunk
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MultiChunkSealed`] if the container is sealed,
    /// and [`SyncError::InvalidMultiChunk`] if it is full.
    pub fn write(&mut self, chunk: &Chunk) -> Result<()> {
        match self.state {
            MultiChunkState::Sealed => return Err(SyncError::MultiChunkSealed(self.id.to_hex())),
            MultiChunkState::Full => {
                return Err(SyncError::InvalidMultiChunk(format!(
                    "multichunk {} is full",
                    self.id
                )))
            }
            MultiChunkState::Open => {}
        }
        if !self.accepts(chunk.size()) {
            self.state = MultiChunkState::Full;
            return Err(SyncError::InvalidMultiChunk(format!(
                "chunk {} does not fit into multichunk {}",
                chunk.checksum, self.id
            )));
        }

        let out = self
            .out
            .as_mut()
            .ok_or_else(|| SyncError::MultiChunkSealed(self.id.to_hex()))?;
        out.write_all(chunk.checksum.as_bytes())?;
        out.write_all(&chunk.size().to_be_bytes())?;
        out.write_all(&chunk.data)?;

        self.packed_size += ENTRY_OVERHEAD + chunk.data.len() as u64;
        self.chunks.push(chunk.entry());
        if self.packed_size >= self.max_size {
            self.state = MultiChunkState::Full;
        }
        trace!(
            "Wrote chunk {} to multichunk {} ({} bytes packed)",
            chunk.checksum.short(),
            self.id.short(),
            self.packed_size
        );
        Ok(())
    }

    /// Finalize the container
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MultiChunkSealed`] if already sealed, or the
    /// underlying I/O error if finalizing the stream fails.
    pub fn seal(&mut self) -> Result<SealedMultiChunk> {
        let out = self
            .out
            .take()
            .ok_or_else(|| SyncError::MultiChunkSealed(self.id.to_hex()))?;
        self.state = MultiChunkState::Sealed;
        out.finish()?;

        debug!(
            "Sealed multichunk {} with {} chunks ({} bytes packed)",
            self.id.short(),
            self.chunks.len(),
            self.packed_size
        );
        Ok(SealedMultiChunk {
            id: self.id,
            packed_size: self.packed_size,
            chunks: std::mem::take(&mut self.chunks),
        })
    }
}

/// A finalized container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMultiChunk {
    /// Container id
    pub id: MultiChunkId,
    /// Packed size including the header
    pub packed_size: u64,
    /// Chunks in write order
    pub chunks: Vec<ChunkEntry>,
}

impl SealedMultiChunk {
    /// Database entry for this container
    pub fn entry(&self) -> MultiChunkEntry {
        MultiChunkEntry {
            id: self.id,
            chunks: self.chunks.iter().map(|c| c.checksum).collect(),
        }
    }
}

/// Sequential reader over a container's chunks
///
/// Every chunk is verified against its checksum as it is read.
pub struct MultiChunkReader<'a> {
    input: Box<dyn Read + 'a>,
    done: bool,
}

impl<'a> MultiChunkReader<'a> {
    /// Start reading a transformed container
    pub fn new<R: Read + 'a>(reader: R, chain: &TransformerChain) -> Result<Self> {
        let mut input = chain.decoder(reader)?;
        let mut header = [0u8; CONTAINER_HEADER_SIZE as usize];
        input.read_exact(&mut header).map_err(decode_error)?;
        if &header[..4] != CONTAINER_MAGIC || header[4] != CONTAINER_VERSION {
            return Err(SyncError::InvalidMultiChunk(
                "bad container header".to_string(),
            ));
        }
        Ok(Self { input, done: false })
    }

    /// Read the next chunk, or `None` at the end of the container
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.done {
            return Ok(None);
        }

        let mut checksum = [0u8; CHECKSUM_LEN];
        let first = read_fully(&mut self.input, &mut checksum)?;
        if first == 0 {
            self.done = true;
            return Ok(None);
        }
        if first < CHECKSUM_LEN {
            return Err(SyncError::InvalidMultiChunk("truncated entry header".to_string()));
        }

        let mut len = [0u8; 4];
        if read_fully(&mut self.input, &mut len)? < len.len() {
            return Err(SyncError::InvalidMultiChunk("truncated entry length".to_string()));
        }
        let len = u32::from_be_bytes(len) as u64;

        let mut data = Vec::new();
        (&mut self.input)
            .take(len)
            .read_to_end(&mut data)
            .map_err(decode_error)?;
        if data.len() as u64 != len {
            return Err(SyncError::InvalidMultiChunk("truncated entry data".to_string()));
        }

        let chunk = Chunk::new(data);
        let expected = Checksum::from_bytes(checksum);
        if chunk.checksum != expected {
            return Err(SyncError::HashMismatch {
                expected: expected.to_hex(),
                actual: chunk.checksum.to_hex(),
            });
        }
        Ok(Some(chunk))
    }

    /// Scan forward for a specific chunk
    pub fn read_chunk(&mut self, checksum: &Checksum) -> Result<Chunk> {
        while let Some(chunk) = self.next_chunk()? {
            if &chunk.checksum == checksum {
                return Ok(chunk);
            }
        }
        Err(SyncError::ChunkNotFound(checksum.to_hex()))
    }
}

impl MultiChunkReader<'static> {
    /// Open a container file
    pub fn open(path: &Path, chain: &TransformerChain) -> Result<Self> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file), chain)
    }
}

impl Iterator for MultiChunkReader<'_> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}

/// Read until `buf` is full or the stream ends; returns bytes read
fn read_fully<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(decode_error(e)),
        }
    }
    Ok(filled)
}
