use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("failed to create archive directory {0}: {1}")]
    CreateDir(PathBuf, #[source] std::io::Error),
    #[error("failed to write cover {0}: {1}")]
    Write(PathBuf, #[source] std::io::Error),
}

/// Write-once on-disk store for uploaded cover images.
///
/// Each asset key maps to a stable file name derived from the key, so the
/// same track always lands in the same file. Existing files are never
/// overwritten.
#[derive(Debug, Clone)]
pub struct CoverArchive {
    dir: PathBuf,
}

impl CoverArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File that holds the cover for `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let name = Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes());
        self.dir.join(format!("{name}.bin"))
    }

    /// Persist `data` for `key` unless a file already exists.
    ///
    /// Returns `true` if a file was written.
    pub async fn store(&self, key: &str, data: &Bytes) -> Result<bool, ArchiveError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ArchiveError::CreateDir(self.dir.clone(), e))?;

        let path = self.path_for(key);
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        let file = match file {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::debug!(path = %path.display(), "cover already archived");
                return Ok(false);
            }
            Err(e) => return Err(ArchiveError::Write(path, e)),
        };

        write_or_remove(&path, file, data).await?;
        tracing::debug!(key, path = %path.display(), "cover archived");
        Ok(true)
    }
}

/// Write `data` to the freshly created file at `path`. A partial file is
/// removed so a later upload of the same key can write it again.
async fn write_or_remove<W>(path: &Path, mut file: W, data: &[u8]) -> Result<(), ArchiveError>
where
    W: AsyncWrite + Unpin,
{
    let written = match file.write_all(data).await {
        Ok(()) => file.flush().await,
        Err(e) => Err(e),
    };
    let Err(e) = written else {
        return Ok(());
    };
    drop(file);
    if let Err(rm) = tokio::fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), error = %rm, "failed to remove partial cover");
    }
    Err(ArchiveError::Write(path.to_path_buf(), e))
}
