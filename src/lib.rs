//! # Syncfold - Deduplicating, encrypted folder synchronization
//!
//! A file synchronization engine for clients that share a folder through
//! dumb storage. There is no server: every client publishes immutable,
//! encrypted files to a repository and merges what the others published.
//!
//! ## Overview
//!
//! Syncfold lets a set of clients:
//! - Split files into chunks and store every distinct chunk only once
//! - Pack chunks into compressed and encrypted multichunk containers
//! - Record file changes as database versions stamped with vector clocks
//! - Reconcile concurrent database versions deterministically on every client
//! - Keep the losing side of a conflicting edit as a conflicted copy
//! - Talk to any storage that can upload, download, move, delete and list files
//!
//! ## Architecture
//!
//! ```text
//!   sync folder ──scan──► Indexer ──► Deduper ──► Chunker
//!                           │            │
//!                           │            └──► MultiChunker ──► TransformerChain ──► multichunk files
//!                           ▼
//!                    DatabaseVersion ──► RemoteTransaction ──► TransferManager stack
//!                                                                   │
//!   sync folder ◄──restore── Synchronizer ◄── DatabaseReconciler ◄──┘ (other clients' versions)
//! ```
//!
//! - **Chunking**: fixed-size or content-defined boundaries, SHA-256 identities
//! - **Containers**: chunks are appended to multichunks until a size bound is
//!   reached; each container is written through a transformer chain (LZ4 and
//!   AES-256-GCM)
//! - **Database versions**: one per sync-up, holding the new chunks,
//!   containers, file contents and file history deltas
//! - **Reconciliation**: a pure function over all known versions that orders
//!   them causally, resolves concurrent edits of the same file with a
//!   pluggable policy and quarantines clients whose logs are inconsistent
//! - **Transfer**: a small trait with decorators for retries and for
//!   sharding large folders into hashed sub-paths
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use syncfold::config::{SyncConfig, TransformerConfig};
//! use syncfold::database::LocalDatabaseStore;
//! use syncfold::sync::{build_transfer_stack, Synchronizer};
//! use syncfold::transfer::LocalTransferManager;
//! use syncfold::transform::MasterKey;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig::builder("laptop")
//!     .transformers(TransformerConfig::compressed_and_encrypted())
//!     .ignore_patterns(vec!["*.tmp".to_string()])
//!     .build()?;
//! let key = MasterKey::new(vec![7u8; 32])?;
//!
//! let backend = LocalTransferManager::new("/mnt/shared/repo");
//! let transfer = build_transfer_stack(backend, &config)?;
//! transfer.init(true)?;
//!
//! let store = LocalDatabaseStore::open("/home/me/.syncfold/db")?;
//! let mut sync = Synchronizer::new(
//!     config,
//!     "/home/me/Sync",
//!     "/home/me/.syncfold/work",
//!     transfer,
//!     store,
//!     Some(&key),
//! )?;
//!
//! let merge = sync.down()?;
//! println!("{} remote versions, {} conflicts", merge.accepted.len(), merge.conflicts.len());
//!
//! if let Some(id) = sync.up()? {
//!     println!("Published {}", id);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! ### Vector Clocks
//!
//! Each client numbers its database versions 1, 2, 3 and stamps every
//! version with the highest sequence it has seen from every client. Two
//! versions are either ordered (one happened before the other) or
//! concurrent. Concurrent versions touching the same file history are
//! conflicts.
//!
//! ### Conflicts
//!
//! Conflicts are resolved by a [`ConflictPolicy`](reconciler::ConflictPolicy).
//! The default keeps the most recently modified file and breaks ties by
//! client id. The losing edit is not lost: the client that made it writes
//! it next to the winner as `name (client's conflicted copy, date).ext`
//! and publishes it with its next sync-up.
//!
//! ### Repository Layout
//!
//! Remote files have typed, validated names (see [`transfer::RemoteFile`]):
//! `database-<client>-<seq>`, `multichunk-<hex>`, `transaction-<client>-<ms>`
//! and so on. Uploads go through a [`RemoteTransaction`](transfer::RemoteTransaction)
//! so a database version only becomes visible once every container it
//! references is in place.
//!
//! ## Error Handling
//!
//! All operations return [`Result<T, SyncError>`](SyncError). Storage
//! errors distinguish transient failures (retried) from permanent ones, and
//! a failed sync operation is reported as [`SyncError::SyncAborted`]
//! carrying the underlying cause.
//!
//! ## Module Organization
//!
//! - [`chunker`]: Splitting data into checksummed chunks
//! - [`multichunk`]: Chunk containers
//! - [`transform`]: Compression and encryption stages
//! - [`deduper`]: Driving chunker and containers over a set of files
//! - [`model`]: Database versions, file histories and contents
//! - [`vector_clock`]: Causality tracking
//! - [`database`]: In-memory view and local persistence
//! - [`reconciler`]: Merging database logs
//! - [`indexer`]: Turning the sync folder into a database version
//! - [`transfer`]: Remote storage abstraction and decorators
//! - [`sync`]: Up, down and restore
//! - [`config`]: Client configuration
//! - [`error`]: Error types and handling

pub mod chunker;
pub mod config;
pub mod database;
pub mod deduper;
pub mod error;
pub mod indexer;
pub mod model;
pub mod multichunk;
pub mod reconciler;
pub mod sync;
pub mod transfer;
pub mod transform;
pub mod utils;
pub mod vector_clock;

// Re-export main types for convenience
pub use chunker::{Chunk, Chunker};
pub use config::SyncConfig;
pub use database::{DatabaseStore, LocalDatabaseStore, MemoryDatabase};
pub use deduper::Deduper;
pub use error::{Result, SyncError};
pub use model::{Checksum, DatabaseVersion, DatabaseVersionId, FileHistory, FileHistoryId, FileVersion};
pub use multichunk::MultiChunker;
pub use reconciler::{DatabaseReconciler, MergeResult};
pub use sync::Synchronizer;
pub use transfer::{RemoteFile, RemoteFileKind, TransferManager};
pub use transform::{MasterKey, TransformerChain};
pub use vector_clock::{ClockOrdering, VectorClock};
