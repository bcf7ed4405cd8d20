//! Remote storage abstraction
//!
//! Everything the engine stores remotely is an opaque named object. The
//! object name alone identifies its kind: a fixed prefix, a dash and a
//! kind-specific identifier.
//!
//! | Kind            | Name                              | Folder          |
//! |-----------------|-----------------------------------|-----------------|
//! | Database        | `database-<client>-<sequence>`    | `databases`     |
//! | MultiChunk      | `multichunk-<checksum hex>`       | `multichunks`   |
//! | Temp            | `temp-<name>`                     | `temporary`     |
//! | Transaction     | `transaction-<client>-<millis>`   | `transactions`  |
//! | Action          | `action-<name>`                   | `actions`       |
//! | Master          | `master`                          | repository root |
//! | Repo            | `syncfold`                        | repository root |
//!
//! A backend implements [`TransferManager`]. Cross-cutting behavior is added
//! by wrapping one manager in another:
//!
//! - [`RetriableTransferManager`] retries transient failures
//! - [`PathAwareTransferManager`] shards object names into nested folders
//!
//! [`RemoteTransaction`] groups several uploads so that other clients see
//! either all of them or none.
//!
//! ## Example
//!
//! ```rust
//! use syncfold::transfer::{RemoteFile, RemoteFileKind};
//!
//! let file = RemoteFile::parse("database-A-0000000001").unwrap();
//! assert_eq!(file.kind(), RemoteFileKind::Database);
//! assert_eq!(file.database_id().unwrap().sequence, 1);
//! assert!(RemoteFile::parse("database-A-x").is_err());
//! ```

mod local;
mod memory;
mod path_aware;
mod retry;
mod transaction;

pub use local::LocalTransferManager;
pub use memory::{FailureKind, MemoryTransferManager, Operation};
pub use path_aware::PathAwareTransferManager;
pub use retry::RetriableTransferManager;
pub use transaction::{ManifestEntry, RemoteTransaction, TransactionManifest};

use crate::error::{Result, SyncError};
use crate::model::{Checksum, DatabaseVersionId, MultiChunkId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Closed set of remote object kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RemoteFileKind {
    /// Serialized database version
    Database,
    /// Container of packed chunks
    MultiChunk,
    /// Staged upload awaiting its move into place
    Temp,
    /// Manifest of an in-flight transaction
    Transaction,
    /// Marker of a running client operation
    Action,
    /// Repository master key salt
    Master,
    /// Repository marker file
    Repo,
}

/// Static naming information of one kind
struct KindEntry {
    kind: RemoteFileKind,
    prefix: &'static str,
    folder: &'static str,
    exact: bool,
}

const KIND_TABLE: [KindEntry; 7] = [
    KindEntry { kind: RemoteFileKind::Database, prefix: "database", folder: "databases", exact: false },
    KindEntry { kind: RemoteFileKind::MultiChunk, prefix: "multichunk", folder: "multichunks", exact: false },
    KindEntry { kind: RemoteFileKind::Temp, prefix: "temp", folder: "temporary", exact: false },
    KindEntry { kind: RemoteFileKind::Transaction, prefix: "transaction", folder: "transactions", exact: false },
    KindEntry { kind: RemoteFileKind::Action, prefix: "action", folder: "actions", exact: false },
    KindEntry { kind: RemoteFileKind::Master, prefix: "master", folder: "", exact: true },
    KindEntry { kind: RemoteFileKind::Repo, prefix: "syncfold", folder: "", exact: true },
];

impl RemoteFileKind {
    /// All kinds in table order
    pub const ALL: [RemoteFileKind; 7] = [
        RemoteFileKind::Database,
        RemoteFileKind::MultiChunk,
        RemoteFileKind::Temp,
        RemoteFileKind::Transaction,
        RemoteFileKind::Action,
        RemoteFileKind::Master,
        RemoteFileKind::Repo,
    ];

    fn entry(self) -> &'static KindEntry {
        &KIND_TABLE[self as usize]
    }

    /// Name prefix (the whole name for `Master` and `Repo`)
    pub fn prefix(self) -> &'static str {
        self.entry().prefix
    }

    /// Folder holding objects of this kind; empty for the repository root
    pub fn folder(self) -> &'static str {
        self.entry().folder
    }

    /// Whether the kind has exactly one object with a fixed name
    pub fn is_singleton(self) -> bool {
        self.entry().exact
    }

    fn validate_identifier(self, identifier: &str) -> bool {
        match self {
            RemoteFileKind::Database | RemoteFileKind::Transaction => {
                split_client_number(identifier).is_some()
            }
            RemoteFileKind::MultiChunk => Checksum::from_hex(identifier).is_ok(),
            RemoteFileKind::Temp | RemoteFileKind::Action => !identifier.is_empty(),
            RemoteFileKind::Master | RemoteFileKind::Repo => false,
        }
    }
}

impl fmt::Display for RemoteFileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Split `<client>-<digits>` into its parts
fn split_client_number(identifier: &str) -> Option<(&str, u64)> {
    let (client, number) = identifier.rsplit_once('-')?;
    if client.is_empty() || !client.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    number.parse().ok().map(|n| (client, n))
}

/// A named object on the remote storage
///
/// `sub_path` is set by the path-aware decorator for sharded kinds and is
/// relative to the kind's folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteFile {
    kind: RemoteFileKind,
    name: String,
    sub_path: Option<String>,
}

impl RemoteFile {
    /// Parse an object name, deriving its kind from the prefix
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidRemoteFileName`] if the prefix is unknown
    /// or the identifier does not match the kind's format.
    pub fn parse(name: &str) -> Result<Self> {
        if let Some(entry) = KIND_TABLE.iter().find(|s| s.exact && s.prefix == name) {
            return Ok(Self::unchecked(entry.kind, name));
        }

        let invalid = || SyncError::InvalidRemoteFileName(name.to_string());
        let (prefix, identifier) = name.split_once('-').ok_or_else(invalid)?;
        let entry = KIND_TABLE
            .iter()
            .find(|s| !s.exact && s.prefix == prefix)
            .ok_or_else(invalid)?;

        if !entry.kind.validate_identifier(identifier) {
            return Err(invalid());
        }
        Ok(Self::unchecked(entry.kind, name))
    }

    /// Parse an object name and require a specific kind
    pub fn of_kind(kind: RemoteFileKind, name: &str) -> Result<Self> {
        let file = Self::parse(name)?;
        if file.kind != kind {
            return Err(SyncError::InvalidRemoteFileName(format!(
                "{} is not a {} file",
                name, kind
            )));
        }
        Ok(file)
    }

    fn unchecked(kind: RemoteFileKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            sub_path: None,
        }
    }

    /// Remote file of a database version
    pub fn database(id: &DatabaseVersionId) -> Self {
        Self::unchecked(RemoteFileKind::Database, id.remote_name())
    }

    /// Remote file of a multichunk container
    pub fn multi_chunk(id: &MultiChunkId) -> Self {
        Self::unchecked(RemoteFileKind::MultiChunk, format!("multichunk-{}", id.to_hex()))
    }

    /// Staging name for an upload of `target`
    pub fn temp_for(target: &RemoteFile) -> Self {
        Self::unchecked(RemoteFileKind::Temp, format!("temp-{}", target.name))
    }

    /// Transaction manifest name of a client
    pub fn transaction(client: &str, millis: u64) -> Self {
        Self::unchecked(RemoteFileKind::Transaction, format!("transaction-{}-{}", client, millis))
    }

    /// The repository marker file
    pub fn repo() -> Self {
        Self::unchecked(RemoteFileKind::Repo, RemoteFileKind::Repo.prefix())
    }

    /// The master file
    pub fn master() -> Self {
        Self::unchecked(RemoteFileKind::Master, RemoteFileKind::Master.prefix())
    }

    /// Kind derived from the name
    pub fn kind(&self) -> RemoteFileKind {
        self.kind
    }

    /// Object name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sharding sub-path below the kind folder, if any
    pub fn sub_path(&self) -> Option<&str> {
        self.sub_path.as_deref()
    }

    /// Same object placed below a sub-path
    pub fn with_sub_path(mut self, sub_path: impl Into<String>) -> Self {
        let sub_path = sub_path.into();
        self.sub_path = if sub_path.is_empty() { None } else { Some(sub_path) };
        self
    }

    /// Path relative to the repository root, `/`-separated
    pub fn relative_path(&self) -> String {
        let mut parts = Vec::with_capacity(3);
        let folder = self.kind.folder();
        if !folder.is_empty() {
            parts.push(folder);
        }
        if let Some(sub_path) = self.sub_path.as_deref() {
            parts.push(sub_path.trim_matches('/'));
        }
        parts.push(&self.name);
        parts.join("/")
    }

    /// Database version id encoded in a database file name
    pub fn database_id(&self) -> Option<DatabaseVersionId> {
        if self.kind != RemoteFileKind::Database {
            return None;
        }
        let identifier = self.name.strip_prefix("database-")?;
        split_client_number(identifier).map(|(client, sequence)| DatabaseVersionId {
            client: client.to_string(),
            sequence,
        })
    }

    /// Multichunk id encoded in a multichunk file name
    pub fn multi_chunk_id(&self) -> Option<MultiChunkId> {
        if self.kind != RemoteFileKind::MultiChunk {
            return None;
        }
        Checksum::from_hex(self.name.strip_prefix("multichunk-")?).ok()
    }

    /// Client and creation time encoded in a transaction manifest name
    pub fn transaction_owner(&self) -> Option<(&str, u64)> {
        if self.kind != RemoteFileKind::Transaction {
            return None;
        }
        split_client_number(self.name.strip_prefix("transaction-")?)
    }
}

impl fmt::Display for RemoteFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relative_path())
    }
}

/// Outcome of probing a storage target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageTestResult {
    /// The repository location exists
    pub target_exists: bool,
    /// Objects can be written to it
    pub target_can_write: bool,
    /// The location can be created if missing
    pub target_can_create: bool,
    /// The repository marker file is present
    pub repo_file_exists: bool,
    /// First error encountered while probing
    pub error: Option<String>,
}

/// Capability contract of a remote storage backend
///
/// All calls are synchronous and blocking. Implementations report transient
/// problems as [`SyncError::Storage`], a missing object as
/// [`SyncError::StorageFileNotFound`] and a move of a missing source as
/// [`SyncError::StorageMoveFailed`].
pub trait TransferManager: Send + Sync {
    /// Open the connection to the storage
    fn connect(&self) -> Result<()>;

    /// Close the connection
    fn disconnect(&self) -> Result<()>;

    /// Create the repository layout, optionally creating the target itself
    fn init(&self, create_if_required: bool) -> Result<()>;

    /// Upload a local file under the given remote name, replacing any object
    fn upload(&self, local: &Path, remote: &RemoteFile) -> Result<()>;

    /// Download a remote object into a local file
    fn download(&self, remote: &RemoteFile, local: &Path) -> Result<()>;

    /// Rename a remote object
    fn move_file(&self, source: &RemoteFile, target: &RemoteFile) -> Result<()>;

    /// Delete a remote object; returns false if it did not exist
    fn delete(&self, remote: &RemoteFile) -> Result<bool>;

    /// List all objects of one kind, keyed by name
    fn list(&self, kind: RemoteFileKind) -> Result<BTreeMap<String, RemoteFile>>;

    /// Check that the repository location exists
    fn test_target_exists(&self) -> Result<bool>;

    /// Check that objects can be written to the repository location
    fn test_target_can_write(&self) -> Result<bool>;

    /// Check that the repository location can be created
    fn test_target_can_create(&self) -> Result<bool>;

    /// Check that the repository marker file exists
    fn test_repo_file_exists(&self) -> Result<bool>;

    /// Make sure the folders leading to `remote` exist
    fn create_path(&self, remote: &RemoteFile) -> Result<()> {
        let _ = remote;
        Ok(())
    }

    /// Probe the target and collect the results
    fn test(&self, test_create_target: bool) -> StorageTestResult {
        let mut result = StorageTestResult::default();
        let outcome = (|| -> Result<()> {
            result.target_exists = self.test_target_exists()?;
            if result.target_exists {
                result.target_can_write = self.test_target_can_write()?;
                result.repo_file_exists = self.test_repo_file_exists()?;
            } else if test_create_target {
                result.target_can_create = self.test_target_can_create()?;
            }
            Ok(())
        })();
        if let Err(e) = outcome {
            result.error = Some(e.to_string());
        }
        result
    }
}

macro_rules! delegate_transfer_manager {
    ($ty:ty) => {
        impl<T: TransferManager + ?Sized> TransferManager for $ty {
            fn connect(&self) -> Result<()> {
                (**self).connect()
            }
            fn disconnect(&self) -> Result<()> {
                (**self).disconnect()
            }
            fn init(&self, create_if_required: bool) -> Result<()> {
                (**self).init(create_if_required)
            }
            fn upload(&self, local: &Path, remote: &RemoteFile) -> Result<()> {
                (**self).upload(local, remote)
            }
            fn download(&self, remote: &RemoteFile, local: &Path) -> Result<()> {
                (**self).download(remote, local)
            }
            fn move_file(&self, source: &RemoteFile, target: &RemoteFile) -> Result<()> {
                (**self).move_file(source, target)
            }
            fn delete(&self, remote: &RemoteFile) -> Result<bool> {
                (**self).delete(remote)
            }
            fn list(&self, kind: RemoteFileKind) -> Result<BTreeMap<String, RemoteFile>> {
                (**self).list(kind)
            }
            fn test_target_exists(&self) -> Result<bool> {
                (**self).test_target_exists()
            }
            fn test_target_can_write(&self) -> Result<bool> {
                (**self).test_target_can_write()
            }
            fn test_target_can_create(&self) -> Result<bool> {
                (**self).test_target_can_create()
            }
            fn test_repo_file_exists(&self) -> Result<bool> {
                (**self).test_repo_file_exists()
            }
            fn create_path(&self, remote: &RemoteFile) -> Result<()> {
                (**self).create_path(remote)
            }
            fn test(&self, test_create_target: bool) -> StorageTestResult {
                (**self).test(test_create_target)
            }
        }
    };
}

delegate_transfer_manager!(Box<T>);
delegate_transfer_manager!(Arc<T>);
delegate_transfer_manager!(&T);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_kinds() {
        let multichunk = format!("multichunk-{}", "ab".repeat(32));
        let cases = [
            ("database-A-0000000003", RemoteFileKind::Database),
            (multichunk.as_str(), RemoteFileKind::MultiChunk),
            ("temp-database-A-1", RemoteFileKind::Temp),
            ("transaction-B-1700000000000", RemoteFileKind::Transaction),
            ("action-up-A", RemoteFileKind::Action),
            ("master", RemoteFileKind::Master),
            ("syncfold", RemoteFileKind::Repo),
        ];
        for (name, kind) in cases {
            let file = RemoteFile::parse(name).unwrap();
            assert_eq!(file.kind(), kind, "{}", name);
            assert_eq!(file.name(), name);
        }
    }

    #[test]
    fn test_parse_rejects_malformed_names() {
        for name in [
            "",
            "database",
            "database-A",
            "database-A1-0001",
            "database--0001",
            "multichunk-xyz",
            "multichunk-abcd",
            "temp-",
            "unknown-thing",
            "master-1",
        ] {
            assert!(
                matches!(RemoteFile::parse(name), Err(SyncError::InvalidRemoteFileName(_))),
                "{} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_of_kind_checks_kind() {
        assert!(RemoteFile::of_kind(RemoteFileKind::Database, "database-A-1").is_ok());
        assert!(RemoteFile::of_kind(RemoteFileKind::MultiChunk, "database-A-1").is_err());
    }

    #[test]
    fn test_constructors_round_trip_through_parse() {
        let id = DatabaseVersionId {
            client: "A".to_string(),
            sequence: 12,
        };
        let db = RemoteFile::database(&id);
        assert_eq!(RemoteFile::parse(db.name()).unwrap(), db);
        assert_eq!(db.database_id(), Some(id));

        let mc_id = Checksum::of(b"container");
        let mc = RemoteFile::multi_chunk(&mc_id);
        assert_eq!(mc.multi_chunk_id(), Some(mc_id));

        let temp = RemoteFile::temp_for(&mc);
        assert_eq!(temp.kind(), RemoteFileKind::Temp);
        assert_eq!(temp.name(), format!("temp-{}", mc.name()));

        let tx = RemoteFile::transaction("A", 42);
        assert_eq!(tx.transaction_owner(), Some(("A", 42)));
    }

    #[test]
    fn test_relative_path_uses_kind_folder_and_sub_path() {
        let db = RemoteFile::parse("database-A-1").unwrap();
        assert_eq!(db.relative_path(), "databases/database-A-1");

        let sharded = db.clone().with_sub_path("ab/cd");
        assert_eq!(sharded.relative_path(), "databases/ab/cd/database-A-1");
        assert_eq!(sharded.sub_path(), Some("ab/cd"));

        assert_eq!(RemoteFile::repo().relative_path(), "syncfold");
        assert_eq!(db.with_sub_path("").sub_path(), None);
    }

    #[test]
    fn test_kind_table_is_indexed_by_discriminant() {
        for kind in RemoteFileKind::ALL {
            assert_eq!(kind.entry().kind, kind);
        }
    }
}
