//! Error types for the romfetch library.

use std::io;

use thiserror::Error;

/// Configuration rejected before any connection attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required setting is absent.
    #[error("missing configuration value: {0}")]
    Missing(&'static str),

    /// The connection string could not be parsed.
    #[error("invalid connection string: {0}")]
    InvalidUrl(String),

    /// The connection string uses a scheme other than `sftp`.
    #[error("unsupported scheme '{0}' (connection string must start with sftp://)")]
    UnsupportedScheme(String),

    /// A setting is present but outside its allowed range.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Name of the offending setting.
        key: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The configuration file could not be read or parsed.
    #[error("failed to load config file {path}: {reason}")]
    File {
        /// Path of the configuration file.
        path: String,
        /// Underlying read or parse error.
        reason: String,
    },
}

/// Failure to establish or re-establish the remote connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// TCP connect or SSH handshake failed.
    #[error("cannot reach {host}:{port}: {reason}")]
    Unreachable {
        /// Remote host.
        host: String,
        /// Remote port.
        port: u16,
        /// Underlying failure.
        reason: String,
    },

    /// The server rejected the username/password.
    #[error("authentication failed for user '{0}'")]
    AuthenticationFailed(String),

    /// The connect attempt did not finish in time.
    #[error("connection to {host}:{port} timed out")]
    Timeout {
        /// Remote host.
        host: String,
        /// Remote port.
        port: u16,
    },

    /// The SSH session came up but the SFTP subsystem did not.
    #[error("SFTP subsystem unavailable: {0}")]
    Subsystem(String),

    /// An operation was attempted on a closed or never-opened session.
    #[error("session is not connected")]
    NotConnected,
}

/// Failure to list or search one remote directory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// The directory does not exist.
    #[error("remote directory not found: {0}")]
    NotFound(String),

    /// The directory exists but could not be listed.
    #[error("cannot read remote directory {path}: {reason}")]
    Unreadable {
        /// Remote directory path.
        path: String,
        /// Underlying failure.
        reason: String,
    },

    /// The platform is not a plain directory name.
    #[error("invalid platform name: {0:?}")]
    InvalidName(String),

    /// The connection dropped while listing.
    #[error("connection lost while listing {0}")]
    ConnectionLost(String),

    /// No usable connection was available.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Cause attached to a transfer that ended in `Failed`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// The remote file could not be opened or read.
    #[error("source unreadable: {0}")]
    SourceUnreadable(String),

    /// The local temporary or final file could not be created or written.
    #[error("destination unwritable: {0}")]
    DestinationUnwritable(String),

    /// The network connection failed or stalled mid-transfer.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

impl TransferError {
    /// Classifies a remote-side I/O error.
    ///
    /// Transport-level kinds become `ConnectionLost`; everything else is
    /// attributed to the source file.
    #[must_use]
    pub fn from_remote(err: &io::Error) -> Self {
        if is_connection_error(err) {
            Self::ConnectionLost(err.to_string())
        } else {
            Self::SourceUnreadable(err.to_string())
        }
    }

    /// Wraps a local-side I/O error.
    #[must_use]
    pub fn from_local(err: &io::Error) -> Self {
        Self::DestinationUnwritable(err.to_string())
    }
}

/// Returns true for I/O error kinds that indicate the transport itself failed.
#[must_use]
pub fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
    )
}

/// Errors surfaced by romfetch operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Startup configuration problem.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Connect or reconnect failure.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Listing or search failure.
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// A transfer ended in `Failed`.
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    /// Local I/O error outside of a transfer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A specialized `Result` type for romfetch operations.
pub type Result<T> = std::result::Result<T, Error>;
