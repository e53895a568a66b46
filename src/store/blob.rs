//! Flat-file NZB blob cache: `<blob_dir>/<releaseID>.nzb`

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Content-addressed NZB storage on local disk
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    /// Bind to (and create) the blob directory
    pub async fn new(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            Error::config(format!(
                "failed to create blob directory {}: {e}",
                dir.display()
            ))
        })?;
        Ok(BlobStore {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.nzb"))
    }

    /// Read the cached NZB for a release
    pub async fn get(&self, id: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.path_for(id)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("NZB blob for release {id}"))
            } else {
                Error::Io(e)
            }
        })
    }

    /// Store (or overwrite) the NZB for a release
    pub async fn put(&self, id: &str, data: &[u8]) -> Result<()> {
        tokio::fs::write(self.path_for(id), data).await?;
        Ok(())
    }

    /// Whether a blob exists for this release
    pub async fn exists(&self, id: &str) -> bool {
        tokio::fs::metadata(self.path_for(id)).await.is_ok()
    }
}
