//! All-or-nothing publication of remote objects
//!
//! A [`RemoteTransaction`] makes a group of uploads visible together:
//!
//! 1. A JSON manifest listing every staged object is uploaded as
//!    `transaction-<client>-<millis>`.
//! 2. Every file is uploaded under its staging name `temp-<name>`.
//! 3. Staged objects are moved to their final names: multichunks first,
//!    database files last. Other clients only look at database files, so
//!    nothing becomes reachable before the final move.
//! 4. The manifest is deleted.
//!
//! If any step before the last move fails, everything already staged or
//! moved is deleted again. A client that crashed mid-transaction removes its
//! leftovers on the next run with [`RemoteTransaction::cleanup_stale`].

use super::{RemoteFile, RemoteFileKind, TransferManager};
use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// One staged object of a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Staging name
    pub temp: String,
    /// Final name
    pub target: String,
}

/// Content of a transaction manifest object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionManifest {
    /// Client running the transaction
    pub client: String,
    /// Start time
    pub created: DateTime<Utc>,
    /// Staged objects in move order
    pub entries: Vec<ManifestEntry>,
}

/// A group of uploads committed together
pub struct RemoteTransaction<'a, T: TransferManager + ?Sized> {
    transfer: &'a T,
    client: String,
    uploads: Vec<(PathBuf, RemoteFile)>,
}

struct Progress {
    manifest: Option<RemoteFile>,
    staged: Vec<RemoteFile>,
    moved: Vec<RemoteFile>,
}

impl<'a, T: TransferManager + ?Sized> RemoteTransaction<'a, T> {
    /// Start an empty transaction
    pub fn new(transfer: &'a T, client: impl Into<String>) -> Self {
        Self {
            transfer,
            client: client.into(),
            uploads: Vec::new(),
        }
    }

    /// Stage a local file for upload under `remote`
    pub fn add_upload(&mut self, local: impl Into<PathBuf>, remote: RemoteFile) {
        self.uploads.push((local.into(), remote));
    }

    /// Number of staged uploads
    pub fn len(&self) -> usize {
        self.uploads.len()
    }

    /// Check if nothing is staged
    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty()
    }

    /// Publish all staged uploads
    ///
    /// # Errors
    ///
    /// Returns the first error of the transfer manager. The remote is rolled
    /// back before returning, so none of the staged objects remain visible.
    pub fn commit(mut self) -> Result<()> {
        if self.uploads.is_empty() {
            return Ok(());
        }

        // Database files last
        self.uploads
            .sort_by_key(|(_, remote)| remote.kind() == RemoteFileKind::Database);

        let mut progress = Progress {
            manifest: None,
            staged: Vec::new(),
            moved: Vec::new(),
        };

        match self.run(&mut progress) {
            Ok(()) => {
                if let Some(manifest) = &progress.manifest {
                    if let Err(e) = self.transfer.delete(manifest) {
                        warn!("Could not delete transaction manifest {}: {}", manifest, e);
                    }
                }
                info!(
                    "Committed transaction of {} objects for client {}",
                    self.uploads.len(),
                    self.client
                );
                Ok(())
            }
            Err(e) => {
                warn!("Transaction failed, rolling back: {}", e);
                self.rollback(&progress);
                Err(e)
            }
        }
    }

    fn run(&self, progress: &mut Progress) -> Result<()> {
        let created = Utc::now();
        let manifest = TransactionManifest {
            client: self.client.clone(),
            created,
            entries: self
                .uploads
                .iter()
                .map(|(_, remote)| ManifestEntry {
                    temp: RemoteFile::temp_for(remote).name().to_string(),
                    target: remote.name().to_string(),
                })
                .collect(),
        };

        let manifest_remote =
            RemoteFile::transaction(&self.client, created.timestamp_millis().max(0) as u64);
        let mut manifest_file = NamedTempFile::new()?;
        serde_json::to_writer_pretty(manifest_file.as_file_mut(), &manifest)?;
        manifest_file.as_file_mut().flush()?;
        progress.manifest = Some(manifest_remote.clone());
        self.transfer.upload(manifest_file.path(), &manifest_remote)?;
        debug!("Uploaded transaction manifest {}", manifest_remote);

        for (local, remote) in &self.uploads {
            let temp = RemoteFile::temp_for(remote);
            progress.staged.push(temp.clone());
            self.transfer.upload(local, &temp)?;
        }

        for (_, remote) in &self.uploads {
            let temp = RemoteFile::temp_for(remote);
            self.transfer.move_file(&temp, remote)?;
            progress.moved.push(remote.clone());
        }

        Ok(())
    }

    fn rollback(&self, progress: &Progress) {
        for remote in progress.moved.iter().rev() {
            if let Err(e) = self.transfer.delete(remote) {
                warn!("Rollback could not delete {}: {}", remote, e);
            }
        }
        for temp in &progress.staged {
            if let Err(e) = self.transfer.delete(temp) {
                warn!("Rollback could not delete {}: {}", temp, e);
            }
        }
        if let Some(manifest) = &progress.manifest {
            if let Err(e) = self.transfer.delete(manifest) {
                warn!("Rollback could not delete {}: {}", manifest, e);
            }
        }
    }

    /// Remove the leftovers of interrupted transactions of `client`
    ///
    /// Staged objects are always deleted. Moved objects are deleted only if
    /// the transaction never published its database file. Returns the number
    /// of manifests cleaned up.
    pub fn cleanup_stale(transfer: &T, client: &str) -> Result<usize> {
        let manifests = transfer.list(RemoteFileKind::Transaction)?;
        let own: Vec<&RemoteFile> = manifests
            .values()
            .filter(|m| m.transaction_owner().map(|(owner, _)| owner) == Some(client))
            .collect();
        if own.is_empty() {
            return Ok(0);
        }

        let databases: BTreeSet<String> =
            transfer.list(RemoteFileKind::Database)?.into_keys().collect();

        for manifest_remote in &own {
            match Self::read_manifest(transfer, manifest_remote) {
                Ok(manifest) => {
                    let published = manifest
                        .entries
                        .iter()
                        .any(|e| e.target.starts_with("database-") && databases.contains(&e.target));

                    for entry in &manifest.entries {
                        delete_named(transfer, &entry.temp);
                        if !published {
                            delete_named(transfer, &entry.target);
                        }
                    }
                }
                Err(e) => warn!("Unreadable transaction manifest {}: {}", manifest_remote, e),
            }
            transfer.delete(manifest_remote)?;
        }

        info!("Cleaned up {} stale transactions of client {}", own.len(), client);
        Ok(own.len())
    }

    fn read_manifest(transfer: &T, remote: &RemoteFile) -> Result<TransactionManifest> {
        let temp_dir = tempfile::tempdir()?;
        let local = temp_dir.path().join("manifest.json");
        transfer.download(remote, &local)?;
        read_manifest_file(&local)
    }
}

fn read_manifest_file(path: &Path) -> Result<TransactionManifest> {
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

fn delete_named<T: TransferManager + ?Sized>(transfer: &T, name: &str) {
    let outcome = RemoteFile::parse(name).and_then(|remote| transfer.delete(&remote));
    match outcome {
        Ok(true) => debug!("Deleted stale object {}", name),
        Ok(false) => {}
        Err(SyncError::InvalidRemoteFileName(_)) => warn!("Stale manifest names invalid object {}", name),
        Err(e) => warn!("Could not delete stale object {}: {}", name, e),
    }
}
