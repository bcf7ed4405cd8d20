//! Deduplication pipeline
//!
//! The [`Deduper`] drives one sequential pass over a list of files: every
//! regular file is chunked, each chunk is offered to a [`DeduperListener`],
//! and chunks the listener reports as new are packed into multichunk
//! containers through the transformer chain.
//!
//! The listener owns everything stateful: the existence index that decides
//! whether a chunk is new, where container files go, and what to record
//! about each file. The deduper itself is purely mechanical.
//!
//! ## Callback order
//!
//! ```text
//! on_start
//! for each file:
//!     on_file_start
//!     for each chunk (regular files only):
//!         on_chunk -> new?
//!         if new:
//!             [seal current container if the chunk does not fit -> on_close_multi_chunk]
//!             [open container at multi_chunk_target -> on_open_multi_chunk]
//!             write -> on_write_multi_chunk
//!         on_file_add_chunk
//!     on_file_end(last chunk checksum or None)
//! [seal last container -> on_close_multi_chunk]
//! on_finish
//! ```
//!
//! ## Failure handling
//!
//! Any error aborts the run. A container that is still open when the error
//! occurs is dropped and its file removed before the error propagates, so
//! no partially written container is ever left behind. Containers sealed
//! earlier in the run were already handed to the listener, which owns them.

use crate::chunker::{Chunk, Chunker};
use crate::error::Result;
use crate::model::{Checksum, MultiChunkId};
use crate::multichunk::{MultiChunk, MultiChunker, SealedMultiChunk};
use crate::transform::TransformerChain;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Receiver of deduplication events
///
/// Methods with default bodies are notifications only.
pub trait DeduperListener {
    /// Called once before the first file
    fn on_start(&mut self, _file_count: usize) {}

    /// Called before a file is processed
    fn on_file_start(&mut self, file: &Path) -> Result<()>;

    /// Decide whether a chunk is new; only new chunks are stored
    fn on_chunk(&mut self, chunk: &Chunk) -> bool;

    /// Local path the container with the given id should be written to
    fn multi_chunk_target(&mut self, id: &MultiChunkId) -> Result<PathBuf>;

    /// A container was opened
    fn on_open_multi_chunk(&mut self, _multi_chunk: &MultiChunk<'_>) {}

    /// A new chunk was written to the open container
    fn on_write_multi_chunk(&mut self, _multi_chunk: &MultiChunk<'_>, _chunk: &Chunk) {}

    /// A container was sealed and is complete on disk
    fn on_close_multi_chunk(&mut self, sealed: SealedMultiChunk) -> Result<()>;

    /// A chunk (new or known) belongs to the current file, in file order
    fn on_file_add_chunk(&mut self, file: &Path, chunk: &Chunk);

    /// The current file is done
    fn on_file_end(&mut self, file: &Path, last_chunk: Option<Checksum>) -> Result<()>;

    /// Called once after the last container was sealed
    fn on_finish(&mut self) {}
}

/// Counters of one deduplication run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    /// Files visited
    pub files: usize,
    /// Chunks produced by the chunker
    pub chunks: usize,
    /// Chunks the listener reported as new
    pub new_chunks: usize,
    /// Containers sealed
    pub multi_chunks: usize,
    /// Bytes read from regular files
    pub bytes_read: u64,
    /// Bytes of new chunk data stored
    pub bytes_stored: u64,
}

/// Orchestrates chunking and packing
#[derive(Debug, Clone)]
pub struct Deduper {
    chunker: Chunker,
    multi_chunker: MultiChunker,
    transformer: TransformerChain,
}

struct OpenContainer {
    path: PathBuf,
    multi_chunk: MultiChunk<'static>,
}

impl Deduper {
    /// Create a deduper from its three collaborators
    pub fn new(chunker: Chunker, multi_chunker: MultiChunker, transformer: TransformerChain) -> Self {
        Self {
            chunker,
            multi_chunker,
            transformer,
        }
    }

    /// Chunker in use
    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    /// Transformer chain applied to containers
    pub fn transformer(&self) -> &TransformerChain {
        &self.transformer
    }

    /// Deduplicate `files` in order, reporting to `listener`
    ///
    /// # Errors
    ///
    /// Propagates chunking, container and listener errors. The open
    /// container, if any, is deleted first.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use syncfold::deduper::{Deduper, DeduperListener};
    /// # fn run(deduper: &Deduper, listener: &mut impl DeduperListener) -> syncfold::Result<()> {
    /// let files = vec![std::path::PathBuf::from("notes.txt")];
    /// let stats = deduper.deduplicate(&files, listener)?;
    /// println!("{} new chunks in {} containers", stats.new_chunks, stats.multi_chunks);
    /// # Ok(())
    /// # }
    /// ```
    pub fn deduplicate<L: DeduperListener + ?Sized>(
        &self,
        files: &[PathBuf],
        listener: &mut L,
    ) -> Result<DedupStats> {
        let mut stats = DedupStats::default();
        let mut open: Option<OpenContainer> = None;

        let result = self.run(files, listener, &mut open, &mut stats);
        if let Err(e) = result {
            if let Some(container) = open.take() {
                discard(container);
            }
            return Err(e);
        }

        info!(
            "Deduplicated {} files: {} chunks, {} new, {} multichunks",
            stats.files, stats.chunks, stats.new_chunks, stats.multi_chunks
        );
        Ok(stats)
    }

    fn run<L: DeduperListener + ?Sized>(
        &self,
        files: &[PathBuf],
        listener: &mut L,
        open: &mut Option<OpenContainer>,
        stats: &mut DedupStats,
    ) -> Result<()> {
        listener.on_start(files.len());

        for file in files {
            listener.on_file_start(file)?;
            stats.files += 1;

            let mut last_chunk = None;
            if is_regular_file(file) {
                for chunk in self.chunker.split_file(file)? {
                    let chunk = chunk?;
                    stats.chunks += 1;
                    stats.bytes_read += chunk.data.len() as u64;

                    if listener.on_chunk(&chunk) {
                        self.store_chunk(&chunk, listener, open, stats)?;
                    }

                    listener.on_file_add_chunk(file, &chunk);
                    last_chunk = Some(chunk.checksum);
                }
            }

            listener.on_file_end(file, last_chunk)?;
        }

        if let Some(container) = open.take() {
            self.close(container, listener, stats)?;
        }

        listener.on_finish();
        Ok(())
    }

    fn store_chunk<L: DeduperListener + ?Sized>(
        &self,
        chunk: &Chunk,
        listener: &mut L,
        open: &mut Option<OpenContainer>,
        stats: &mut DedupStats,
    ) -> Result<()> {
        let fits = open
            .as_ref()
            .map(|c| c.multi_chunk.accepts(chunk.size()))
            .unwrap_or(true);
        if !fits {
            if let Some(container) = open.take() {
                self.close(container, listener, stats)?;
            }
        }

        if open.is_none() {
            let path = listener.multi_chunk_target(&chunk.checksum)?;
            let file = File::create(&path)?;
            let container = OpenContainer {
                multi_chunk: self
                    .multi_chunker
                    .create(chunk.checksum, BufWriter::new(file), &self.transformer)
                    .inspect_err(|_| remove_partial(&path))?,
                path,
            };
            listener.on_open_multi_chunk(&container.multi_chunk);
            *open = Some(container);
        }

        if let Some(container) = open.as_mut() {
            container.multi_chunk.write(chunk)?;
            stats.new_chunks += 1;
            stats.bytes_stored += chunk.data.len() as u64;
            listener.on_write_multi_chunk(&container.multi_chunk, chunk);
        }
        Ok(())
    }

    fn close<L: DeduperListener + ?Sized>(
        &self,
        mut container: OpenContainer,
        listener: &mut L,
        stats: &mut DedupStats,
    ) -> Result<()> {
        let sealed = match container.multi_chunk.seal() {
            Ok(sealed) => sealed,
            Err(e) => {
                remove_partial(&container.path);
                return Err(e);
            }
        };
        stats.multi_chunks += 1;
        debug!("Container {} written to {:?}", sealed.id.short(), container.path);
        listener.on_close_multi_chunk(sealed)
    }
}

fn is_regular_file(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.file_type().is_file())
        .unwrap_or(false)
}

fn discard(container: OpenContainer) {
    let OpenContainer { path, multi_chunk } = container;
    drop(multi_chunk);
    remove_partial(&path);
}

fn remove_partial(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove partial multichunk {:?}: {}", path, e);
        }
    } else {
        debug!("Removed partial multichunk {:?}", path);
    }
}
