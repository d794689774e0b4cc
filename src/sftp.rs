//! SFTP backend built on `russh` and `russh-sftp`.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::StatusCode;

use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::remote::{Connector, EntryKind, RemoteEntry, RemoteFs, RemoteReader};

/// SSH client handler.
struct SshHandler;

#[async_trait]
impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<(Self, bool), Self::Error> {
        // TODO: verify against ~/.ssh/known_hosts once the config carries a host key policy.
        log::warn!("Host key verification not implemented, accepting key");
        Ok((self, true))
    }
}

/// Opens password-authenticated SFTP sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SftpConnector;

impl SftpConnector {
    /// Creates a new `SftpConnector`.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for SftpConnector {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn RemoteFs>, ConnectionError> {
        log::info!(
            "Connecting to {} as {}",
            config.address(),
            config.username
        );

        let unreachable = |reason: String| ConnectionError::Unreachable {
            host: config.host.clone(),
            port: config.port,
            reason,
        };

        let establish = async {
            let ssh_config = Arc::new(client::Config::default());
            let mut handle = client::connect(
                ssh_config,
                (config.host.as_str(), config.port),
                SshHandler,
            )
            .await
            .map_err(|e| unreachable(e.to_string()))?;

            let authenticated = handle
                .authenticate_password(config.username.clone(), config.password.clone())
                .await
                .map_err(|e| unreachable(e.to_string()))?;
            if !authenticated {
                return Err(ConnectionError::AuthenticationFailed(
                    config.username.clone(),
                ));
            }

            let mut channel = handle
                .channel_open_session()
                .await
                .map_err(|e| ConnectionError::Subsystem(format!("failed to open channel: {e}")))?;
            channel
                .request_subsystem(true, "sftp")
                .await
                .map_err(|e| ConnectionError::Subsystem(e.to_string()))?;
            let sftp = SftpSession::new(channel.into_stream())
                .await
                .map_err(|e| ConnectionError::Subsystem(e.to_string()))?;

            Ok::<_, ConnectionError>(SftpRemote { handle, sftp })
        };

        let remote = tokio::time::timeout(config.connect_timeout, establish)
            .await
            .map_err(|_| ConnectionError::Timeout {
                host: config.host.clone(),
                port: config.port,
            })??;

        log::info!("SFTP session established with {}", config.address());
        Ok(Box::new(remote))
    }
}

/// A live SSH connection with its SFTP subsystem.
struct SftpRemote {
    handle: client::Handle<SshHandler>,
    sftp: SftpSession,
}

#[async_trait]
impl RemoteFs for SftpRemote {
    async fn read_dir(&self, path: &str) -> io::Result<Vec<RemoteEntry>> {
        let entries = self.sftp.read_dir(path).await.map_err(sftp_to_io)?;
        Ok(entries
            .filter(|entry| {
                let name = entry.file_name();
                name != "." && name != ".."
            })
            .map(|entry| {
                let meta = entry.metadata();
                let kind = if meta.is_symlink() {
                    EntryKind::Symlink
                } else if meta.is_dir() {
                    EntryKind::Dir
                } else if meta.is_regular() {
                    EntryKind::File
                } else {
                    EntryKind::Other
                };
                RemoteEntry {
                    name: entry.file_name(),
                    kind,
                    size: meta.size.unwrap_or(0),
                }
            })
            .collect())
    }

    async fn open(&self, path: &str) -> io::Result<RemoteReader> {
        let file = self.sftp.open(path).await.map_err(sftp_to_io)?;
        Ok(Box::new(file))
    }

    async fn file_size(&self, path: &str) -> io::Result<u64> {
        let meta = self.sftp.metadata(path).await.map_err(sftp_to_io)?;
        Ok(meta.size.unwrap_or(0))
    }

    fn is_alive(&self) -> bool {
        !self.handle.is_closed()
    }

    async fn close(&self) {
        if let Err(e) = self.sftp.close().await {
            log::debug!("SFTP close failed: {e}");
        }
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await
        {
            log::debug!("SSH disconnect failed: {e}");
        }
    }
}

/// Maps SFTP protocol errors onto `io::ErrorKind`s the core classifies.
fn sftp_to_io(err: SftpError) -> io::Error {
    match err {
        SftpError::Status(status) => {
            let kind = match status.status_code {
                StatusCode::NoSuchFile => io::ErrorKind::NotFound,
                StatusCode::PermissionDenied => io::ErrorKind::PermissionDenied,
                StatusCode::NoConnection | StatusCode::ConnectionLost => {
                    io::ErrorKind::ConnectionAborted
                }
                _ => io::ErrorKind::Other,
            };
            io::Error::new(kind, status.error_message)
        }
        SftpError::Timeout => io::Error::new(io::ErrorKind::TimedOut, "SFTP request timed out"),
        other => io::Error::other(other.to_string()),
    }
}
