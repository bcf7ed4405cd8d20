//! Splitting file content into content-addressed chunks
//!
//! A [`Chunker`] turns one byte stream into a lazy, finite sequence of
//! [`Chunk`]s. Every chunk carries the SHA-256 checksum of its exact byte
//! range, so identical bytes always produce identical chunk ids and are
//! stored once.
//!
//! Two boundary strategies are available:
//!
//! - **Fixed**: cut every `size` bytes. Cheap, but an insertion near the
//!   start of a file shifts every later boundary.
//! - **Content-defined**: FastCDC rolling hash. Boundaries depend on the
//!   content itself, so local edits only disturb nearby chunks.
//!
//! Chunking never buffers more than one maximum-size chunk and never
//! mutates its input. A new sequence can be started for the same file at
//! any time.
//!
//! ## Examples
//!
//! ```rust
//! use syncfold::chunker::Chunker;
//!
//! let chunker = Chunker::fixed(4);
//! let chunks: Vec<_> = chunker
//!     .split(&b"abcdefghij"[..])
//!     .collect::<Result<_, _>>()
//!     .unwrap();
//!
//! assert_eq!(chunks.len(), 3);
//! assert_eq!(chunks[2].data, b"ij");
//! ```

use crate::config::ChunkerConfig;
use crate::error::{Result, SyncError};
use crate::model::{Checksum, ChunkEntry};
use fastcdc::v2020::StreamCDC;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::trace;

/// A chunk of file content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// SHA-256 of `data`
    pub checksum: Checksum,
    /// The chunk bytes
    pub data: Vec<u8>,
}

impl Chunk {
    /// Build a chunk from its bytes
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            checksum: Checksum::of(&data),
            data,
        }
    }

    /// Size in bytes
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Database entry for this chunk
    pub fn entry(&self) -> ChunkEntry {
        ChunkEntry {
            checksum: self.checksum,
            size: self.size(),
        }
    }
}

/// Boundary strategy for splitting streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunker {
    /// Cut every `size` bytes
    Fixed {
        /// Chunk size in bytes
        size: u32,
    },
    /// FastCDC content-defined boundaries
    ContentDefined {
        /// Minimum chunk size
        min_size: u32,
        /// Expected chunk size
        avg_size: u32,
        /// Maximum chunk size
        max_size: u32,
    },
}

impl Chunker {
    /// Fixed-size chunker
    pub fn fixed(size: u32) -> Self {
        Chunker::Fixed { size }
    }

    /// Content-defined chunker
    pub fn content_defined(min_size: u32, avg_size: u32, max_size: u32) -> Self {
        Chunker::ContentDefined { min_size, avg_size, max_size }
    }

    /// Build a chunker from validated configuration
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidConfiguration`] if the sizes are outside
    /// what the chunker supports.
    pub fn from_config(config: &ChunkerConfig) -> Result<Self> {
        config.validate()?;
        Ok(match *config {
            ChunkerConfig::Fixed { size } => Chunker::Fixed { size },
            ChunkerConfig::ContentDefined { min_size, avg_size, max_size } => {
                Chunker::ContentDefined { min_size, avg_size, max_size }
            }
        })
    }

    /// Largest chunk this chunker can emit
    pub fn max_chunk_size(&self) -> u32 {
        match *self {
            Chunker::Fixed { size } => size,
            Chunker::ContentDefined { max_size, .. } => max_size,
        }
    }

    /// Lazily split a stream into chunks
    pub fn split<R: Read>(&self, reader: R) -> Chunks<R> {
        let inner = match *self {
            Chunker::Fixed { size } => ChunksInner::Fixed {
                reader,
                size: size.max(1) as usize,
                done: false,
            },
            Chunker::ContentDefined { min_size, avg_size, max_size } => {
                ChunksInner::ContentDefined(StreamCDC::new(reader, min_size, avg_size, max_size))
            }
        };
        Chunks { inner, path: None }
    }

    /// Lazily split a file into chunks
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened. Read errors while iterating are
    /// reported as [`SyncError::Chunking`] items naming the file.
    pub fn split_file(&self, path: &Path) -> Result<Chunks<BufReader<File>>> {
        let file = File::open(path).map_err(|e| SyncError::Chunking {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        trace!("Chunking {:?} with {:?}", path, self);
        let mut chunks = self.split(BufReader::new(file));
        chunks.path = Some(path.to_path_buf());
        Ok(chunks)
    }
}

impl Default for Chunker {
    fn default() -> Self {
        // Defaults are within the supported ranges
        match ChunkerConfig::default() {
            ChunkerConfig::Fixed { size } => Chunker::Fixed { size },
            ChunkerConfig::ContentDefined { min_size, avg_size, max_size } => {
                Chunker::ContentDefined { min_size, avg_size, max_size }
            }
        }
    }
}

/// Iterator over the chunks of one stream
pub struct Chunks<R: Read> {
    inner: ChunksInner<R>,
    path: Option<PathBuf>,
}

enum ChunksInner<R: Read> {
    Fixed { reader: R, size: usize, done: bool },
    ContentDefined(StreamCDC<R>),
}

impl<R: Read> Chunks<R> {
    fn error(&self, message: String) -> SyncError {
        SyncError::Chunking {
            path: self.path.clone().unwrap_or_default(),
            message,
        }
    }
}

impl<R: Read> Iterator for Chunks<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let result = match &mut self.inner {
            ChunksInner::Fixed { reader, size, done } => {
                if *done {
                    return None;
                }
                match read_up_to(reader, *size) {
                    Ok(data) if data.is_empty() => {
                        *done = true;
                        return None;
                    }
                    Ok(data) => {
                        if data.len() < *size {
                            *done = true;
                        }
                        Ok(Chunk::new(data))
                    }
                    Err(e) => {
                        *done = true;
                        Err(e.to_string())
                    }
                }
            }
            ChunksInner::ContentDefined(cdc) => match cdc.next()? {
                Ok(chunk) => Ok(Chunk::new(chunk.data)),
                Err(e) => Err(e.to_string()),
            },
        };
        Some(result.map_err(|message| self.error(message)))
    }
}

/// Fill up to `size` bytes, stopping early only at end of stream
fn read_up_to<R: Read>(reader: &mut R, size: usize) -> std::io::Result<Vec<u8>> {
    let mut data = Vec::with_capacity(size);
    reader.by_ref().take(size as u64).read_to_end(&mut data)?;
    Ok(data)
}
