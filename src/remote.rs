//! Abstraction over the remote file protocol.
//!
//! The catalog and the transfer engine only ever talk to a [`RemoteFs`];
//! the SFTP implementation lives in [`crate::sftp`].

use std::io;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::config::ConnectionConfig;
use crate::error::ConnectionError;

/// A readable byte stream for one remote file.
pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Kind of a remote directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory.
    Dir,
    /// Symbolic link (never followed).
    Symlink,
    /// Anything else (sockets, devices, unknown).
    Other,
}

/// One record from a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Entry name without any directory component.
    pub name: String,
    /// What the entry is.
    pub kind: EntryKind,
    /// Size in bytes as reported by the server.
    pub size: u64,
}

impl RemoteEntry {
    /// Creates a regular-file entry.
    #[must_use]
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
            size,
        }
    }

    /// Creates a directory entry.
    #[must_use]
    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Dir,
            size: 0,
        }
    }
}

/// Operations the core needs from a live remote connection.
///
/// Errors are reported as [`io::Error`] with kinds mapped from the
/// protocol: `NotFound`, `PermissionDenied`, and transport kinds such as
/// `ConnectionAborted` or `TimedOut` when the link itself failed.
#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// Lists a directory non-recursively, without `.` and `..`.
    async fn read_dir(&self, path: &str) -> io::Result<Vec<RemoteEntry>>;

    /// Opens a file for sequential reading.
    async fn open(&self, path: &str) -> io::Result<RemoteReader>;

    /// Returns the current size of a remote file.
    async fn file_size(&self, path: &str) -> io::Result<u64>;

    /// Returns false once the underlying transport is known to be gone.
    fn is_alive(&self) -> bool;

    /// Closes the connection. Best effort; never fails.
    async fn close(&self);
}

/// Opens new [`RemoteFs`] connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establishes and authenticates a connection.
    async fn connect(&self, config: &ConnectionConfig)
    -> Result<Box<dyn RemoteFs>, ConnectionError>;
}
