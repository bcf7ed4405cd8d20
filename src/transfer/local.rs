//! Filesystem-backed transfer manager
//!
//! Stores the repository in a local directory (or a mounted network share)
//! with one folder per object kind. Uploads and downloads go through a
//! temporary file that is renamed into place, so a reader never observes a
//! partially written object.

use super::{RemoteFile, RemoteFileKind, TransferManager};
use crate::error::{Result, SyncError};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, trace};
use walkdir::WalkDir;

const WRITE_TEST_FILE: &str = ".syncfold-write-test";

/// Transfer manager over a local directory
#[derive(Debug, Clone)]
pub struct LocalTransferManager {
    root: PathBuf,
}

impl LocalTransferManager {
    /// Create a manager for the repository at `root`
    ///
    /// Nothing is touched on disk until [`TransferManager::init`] is called.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Repository directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a remote object
    pub fn path_of(&self, remote: &RemoteFile) -> PathBuf {
        remote
            .relative_path()
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    fn kind_folder(&self, kind: RemoteFileKind) -> PathBuf {
        match kind.folder() {
            "" => self.root.clone(),
            folder => self.root.join(folder),
        }
    }

    fn copy_atomically(source: &Path, target: &Path) -> io::Result<()> {
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no parent"))?;
        let mut temp = NamedTempFile::new_in(parent)?;
        let mut input = fs::File::open(source)?;
        io::copy(&mut input, temp.as_file_mut())?;
        temp.as_file().sync_all()?;
        temp.persist(target).map_err(|e| e.error)?;
        Ok(())
    }
}

fn storage_error(operation: &str, remote: &RemoteFile, err: io::Error) -> SyncError {
    SyncError::storage(operation, remote.relative_path(), err.to_string())
}

impl TransferManager for LocalTransferManager {
    fn connect(&self) -> Result<()> {
        trace!("Connecting to local repository {}", self.root.display());
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    fn init(&self, create_if_required: bool) -> Result<()> {
        if !self.root.is_dir() {
            if !create_if_required {
                return Err(SyncError::storage(
                    "init",
                    self.root.display().to_string(),
                    "repository folder does not exist",
                ));
            }
            fs::create_dir_all(&self.root).map_err(|e| {
                SyncError::storage("init", self.root.display().to_string(), e.to_string())
            })?;
        }

        for kind in RemoteFileKind::ALL {
            if kind.is_singleton() {
                continue;
            }
            let folder = self.kind_folder(kind);
            fs::create_dir_all(&folder).map_err(|e| {
                SyncError::storage("init", folder.display().to_string(), e.to_string())
            })?;
        }

        info!("Initialized local repository at {}", self.root.display());
        Ok(())
    }

    fn upload(&self, local: &Path, remote: &RemoteFile) -> Result<()> {
        if !local.is_file() {
            return Err(SyncError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("local file {} does not exist", local.display()),
            )));
        }

        let target = self.path_of(remote);
        debug!("Uploading {} to {}", local.display(), remote);
        Self::copy_atomically(local, &target).map_err(|e| storage_error("upload", remote, e))
    }

    fn download(&self, remote: &RemoteFile, local: &Path) -> Result<()> {
        let source = self.path_of(remote);
        if !source.is_file() {
            return Err(SyncError::StorageFileNotFound(remote.relative_path()));
        }

        debug!("Downloading {} to {}", remote, local.display());
        Self::copy_atomically(&source, local).map_err(|e| storage_error("download", remote, e))
    }

    fn move_file(&self, source: &RemoteFile, target: &RemoteFile) -> Result<()> {
        let from = self.path_of(source);
        if !from.is_file() {
            return Err(SyncError::StorageMoveFailed {
                source_name: source.relative_path(),
                target_name: target.relative_path(),
            });
        }

        let to = self.path_of(target);
        trace!("Moving {} to {}", source, target);
        fs::rename(&from, &to).map_err(|e| storage_error("move", target, e))
    }

    fn delete(&self, remote: &RemoteFile) -> Result<bool> {
        let path = self.path_of(remote);
        match fs::remove_file(&path) {
            Ok(()) => {
                trace!("Deleted {}", remote);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(storage_error("delete", remote, e)),
        }
    }

    fn list(&self, kind: RemoteFileKind) -> Result<BTreeMap<String, RemoteFile>> {
        let mut files = BTreeMap::new();

        if kind.is_singleton() {
            if self.root.join(kind.prefix()).is_file() {
                let file = RemoteFile::of_kind(kind, kind.prefix())?;
                files.insert(file.name().to_string(), file);
            }
            return Ok(files);
        }

        let folder = self.kind_folder(kind);
        if !folder.is_dir() {
            return Err(SyncError::storage(
                "list",
                kind.folder(),
                "folder does not exist; repository not initialized",
            ));
        }

        for entry in WalkDir::new(&folder).follow_links(false) {
            let entry =
                entry.map_err(|e| SyncError::storage("list", kind.folder(), e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy();
            let file = match RemoteFile::of_kind(kind, &name) {
                Ok(file) => file,
                Err(_) => {
                    trace!("Ignoring foreign object {}", entry.path().display());
                    continue;
                }
            };

            let sub_path = entry
                .path()
                .parent()
                .and_then(|parent| parent.strip_prefix(&folder).ok())
                .map(|relative| {
                    relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/")
                })
                .unwrap_or_default();

            files.insert(file.name().to_string(), file.with_sub_path(sub_path));
        }

        debug!("Listed {} {} objects", files.len(), kind);
        Ok(files)
    }

    fn test_target_exists(&self) -> Result<bool> {
        Ok(self.root.is_dir())
    }

    fn test_target_can_write(&self) -> Result<bool> {
        let probe = self.root.join(WRITE_TEST_FILE);
        match fs::write(&probe, b"probe") {
            Ok(()) => {
                let _ = fs::remove_file(&probe);
                Ok(true)
            }
            Err(e) => {
                debug!("Repository is not writable: {}", e);
                Ok(false)
            }
        }
    }

    fn test_target_can_create(&self) -> Result<bool> {
        Ok(self
            .root
            .parent()
            .map(|parent| parent.as_os_str().is_empty() || parent.is_dir())
            .unwrap_or(false))
    }

    fn test_repo_file_exists(&self) -> Result<bool> {
        Ok(self.root.join(RemoteFileKind::Repo.prefix()).is_file())
    }

    fn create_path(&self, remote: &RemoteFile) -> Result<()> {
        if let Some(parent) = self.path_of(remote).parent() {
            fs::create_dir_all(parent).map_err(|e| storage_error("create path", remote, e))?;
        }
        Ok(())
    }
}
