//! Sharding transfer decorator
//!
//! Storage backends degrade when a single folder holds hundreds of thousands
//! of objects. [`PathAwareTransferManager`] spreads the affected kinds over
//! nested folders named after the hex digest of the object name:
//!
//! ```text
//! multichunks/3f/a9/multichunk-00ab...
//!             ^^ ^^
//!             |  second bytes_per_folder hex characters
//!             first bytes_per_folder hex characters
//! ```
//!
//! The layout is a pure function of the name, so any client finds the object
//! without a lookup.

use super::{RemoteFile, RemoteFileKind, StorageTestResult, TransferManager};
use crate::config::PathAwareConfig;
use crate::error::Result;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::trace;

/// Places objects of the configured kinds below a hash-derived sub-path
#[derive(Debug)]
pub struct PathAwareTransferManager<T> {
    inner: T,
    config: PathAwareConfig,
}

impl<T: TransferManager> PathAwareTransferManager<T> {
    /// Wrap a manager
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::InvalidConfiguration`] if the layout needs more
    /// hash characters than the digest has.
    pub fn new(inner: T, config: PathAwareConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { inner, config })
    }

    /// The wrapped manager
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Sub-path an object of this name is stored below
    pub fn sub_path_for(&self, name: &str) -> String {
        let digest = hex::encode(Sha256::digest(name.as_bytes()));
        let width = self.config.bytes_per_folder;
        let mut sub_path = String::with_capacity(self.config.subfolder_depth * (width + 1));
        for level in 0..self.config.subfolder_depth {
            if level > 0 {
                sub_path.push(self.config.folder_separator);
            }
            sub_path.push_str(&digest[level * width..(level + 1) * width]);
        }
        sub_path
    }

    fn is_affected(&self, kind: RemoteFileKind) -> bool {
        self.config.affected.contains(&kind)
    }

    fn path_aware(&self, remote: &RemoteFile) -> RemoteFile {
        if !self.is_affected(remote.kind()) || self.config.subfolder_depth == 0 {
            return remote.clone();
        }
        let sharded = remote.clone().with_sub_path(self.sub_path_for(remote.name()));
        trace!("Sharded {} to {}", remote.name(), sharded.relative_path());
        sharded
    }

    fn create_path_if_required(&self, remote: &RemoteFile) -> Result<()> {
        if remote.sub_path().is_some() {
            self.inner.create_path(remote)?;
        }
        Ok(())
    }
}

impl<T: TransferManager> TransferManager for PathAwareTransferManager<T> {
    fn connect(&self) -> Result<()> {
        self.inner.connect()
    }

    fn disconnect(&self) -> Result<()> {
        self.inner.disconnect()
    }

    fn init(&self, create_if_required: bool) -> Result<()> {
        self.inner.init(create_if_required)
    }

    fn upload(&self, local: &Path, remote: &RemoteFile) -> Result<()> {
        let target = self.path_aware(remote);
        self.create_path_if_required(&target)?;
        self.inner.upload(local, &target)
    }

    fn download(&self, remote: &RemoteFile, local: &Path) -> Result<()> {
        self.inner.download(&self.path_aware(remote), local)
    }

    fn move_file(&self, source: &RemoteFile, target: &RemoteFile) -> Result<()> {
        let source = self.path_aware(source);
        let target = self.path_aware(target);
        self.create_path_if_required(&target)?;
        self.inner.move_file(&source, &target)
    }

    fn delete(&self, remote: &RemoteFile) -> Result<bool> {
        self.inner.delete(&self.path_aware(remote))
    }

    fn list(&self, kind: RemoteFileKind) -> Result<BTreeMap<String, RemoteFile>> {
        self.inner.list(kind)
    }

    fn test_target_exists(&self) -> Result<bool> {
        self.inner.test_target_exists()
    }

    fn test_target_can_write(&self) -> Result<bool> {
        self.inner.test_target_can_write()
    }

    fn test_target_can_create(&self) -> Result<bool> {
        self.inner.test_target_can_create()
    }

    fn test_repo_file_exists(&self) -> Result<bool> {
        self.inner.test_repo_file_exists()
    }

    fn create_path(&self, remote: &RemoteFile) -> Result<()> {
        self.inner.create_path(&self.path_aware(remote))
    }

    fn test(&self, test_create_target: bool) -> StorageTestResult {
        self.inner.test(test_create_target)
    }
}
