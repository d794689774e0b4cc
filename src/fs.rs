//! Local destination storage.
//!
//! The transfer engine only touches the local disk through [`FileSystem`],
//! which lets tests run whole transfers against an in-memory tree.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWrite;

/// Writable handle to a temporary output file.
pub type LocalWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A directory child reported by [`FileSystem::list_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    /// Full path of the child.
    pub path: PathBuf,
    /// Directory rather than regular file.
    pub is_dir: bool,
}

/// Local operations needed to stage and commit a download.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Whether anything exists at `path`.
    async fn exists(&self, path: &Path) -> bool;

    /// Creates `path` and every missing parent directory.
    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Opens `path` for writing, truncating leftovers from an earlier attempt.
    async fn create(&self, path: &Path) -> io::Result<LocalWriter>;

    /// Moves a finished temporary file over `to`.
    async fn replace(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Deletes a file.
    async fn remove(&self, path: &Path) -> io::Result<()>;

    /// Lists the directories and regular files directly inside `dir`.
    async fn list_dir(&self, dir: &Path) -> io::Result<Vec<LocalEntry>>;
}

/// [`FileSystem`] backed by `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioFileSystem;

impl TokioFileSystem {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSystem for TokioFileSystem {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn create(&self, path: &Path) -> io::Result<LocalWriter> {
        Ok(Box::new(tokio::fs::File::create(path).await?))
    }

    async fn replace(&self, from: &Path, to: &Path) -> io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn list_dir(&self, dir: &Path) -> io::Result<Vec<LocalEntry>> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() || file_type.is_file() {
                children.push(LocalEntry {
                    path: entry.path(),
                    is_dir: file_type.is_dir(),
                });
            }
        }
        Ok(children)
    }
}
