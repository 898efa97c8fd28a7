use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{info, warn};

use crate::error::TransferError;
use crate::naming::validate_component;

/// Durable file storage keyed by (owner, name).
///
/// Each stored file lives at `{dir}/{owner}/{name}`. Files are only ever
/// created or replaced by renaming a complete candidate into place.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub async fn new(dir: PathBuf) -> Result<Self, TransferError> {
        fs::create_dir_all(&dir).await?;
        info!("File storage directory: {}", dir.display());
        Ok(Self { dir })
    }

    pub fn root(&self) -> &Path {
        &self.dir
    }

    fn owner_dir(&self, owner: &str) -> Result<PathBuf, TransferError> {
        validate_component(owner)?;
        Ok(self.dir.join(owner))
    }

    /// Path of a stored file; the file need not exist.
    pub fn file_path(&self, owner: &str, name: &str) -> Result<PathBuf, TransferError> {
        validate_component(name)?;
        Ok(self.owner_dir(owner)?.join(name))
    }

    pub async fn exists(&self, owner: &str, name: &str) -> Result<bool, TransferError> {
        let path = self.file_path(owner, name)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Path of an existing stored file, or `NotFound`.
    pub async fn existing_path(&self, owner: &str, name: &str) -> Result<PathBuf, TransferError> {
        if self.exists(owner, name).await? {
            self.file_path(owner, name)
        } else {
            Err(TransferError::NotFound(name.to_string()))
        }
    }

    /// Atomically moves a fully written `candidate` to (owner, name),
    /// replacing any previous file. The candidate must be on the same
    /// filesystem as the store.
    pub async fn commit(&self, owner: &str, name: &str, candidate: &Path) -> Result<PathBuf, TransferError> {
        let target = self.file_path(owner, name)?;
        fs::create_dir_all(self.owner_dir(owner)?).await?;
        fs::rename(candidate, &target).await?;
        Ok(target)
    }

    pub async fn read(&self, owner: &str, name: &str) -> Result<Vec<u8>, TransferError> {
        let path = self.existing_path(owner, name).await?;
        Ok(fs::read(&path).await?)
    }

    pub async fn delete(&self, owner: &str, name: &str) -> Result<(), TransferError> {
        let path = self.file_path(owner, name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(owner, name, "Deleted stored file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(TransferError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Renames a stored file. An existing target is replaced.
    pub async fn rename(&self, owner: &str, from: &str, to: &str) -> Result<(), TransferError> {
        let source = self.existing_path(owner, from).await?;
        let target = self.file_path(owner, to)?;
        if self.exists(owner, to).await? {
            warn!(owner, from, to, "Rename replaces an existing file");
        }
        fs::rename(&source, &target).await?;
        info!(owner, from, to, "Renamed stored file");
        Ok(())
    }

    /// Names of all stored files for `owner`, sorted.
    pub async fn list(&self, owner: &str) -> Result<Vec<String>, TransferError> {
        let dir = self.owner_dir(owner)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
