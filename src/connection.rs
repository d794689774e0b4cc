//! Connection lifecycle: connect, health-check, reconnect and close.
//!
//! A [`Session`] owns the single remote connection. Every catalog or
//! transfer operation takes an exclusive [`Lease`] on it, so protocol
//! calls are serialized even when a browse is issued while a transfer
//! is running; the browse simply waits for the lease.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, watch};

use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::remote::{Connector, RemoteFs};
use crate::sftp::SftpConnector;

/// Connectivity of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected, or closed.
    Disconnected,
    /// A live connection is available.
    Connected,
    /// A connect attempt failed or an operation saw the link drop.
    Failed,
}

struct Link {
    remote: Option<Arc<dyn RemoteFs>>,
}

/// Handle to the one remote connection.
///
/// Cloning a `Session` yields another handle to the same connection.
#[derive(Clone)]
pub struct Session {
    config: Arc<ConnectionConfig>,
    connector: Arc<dyn Connector>,
    link: Arc<Mutex<Link>>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl Session {
    /// Connects over SFTP.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectionError`] if the host is unreachable, the
    /// credentials are rejected or the attempt times out.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ConnectionError> {
        Self::connect_with(Arc::new(SftpConnector::new()), config).await
    }

    /// Connects using a custom [`Connector`].
    ///
    /// # Errors
    ///
    /// Returns whatever the connector reports.
    pub async fn connect_with(
        connector: Arc<dyn Connector>,
        config: ConnectionConfig,
    ) -> Result<Self, ConnectionError> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let session = Self {
            config: Arc::new(config),
            connector,
            link: Arc::new(Mutex::new(Link { remote: None })),
            state: Arc::new(state),
        };
        session.ensure_connected().await?;
        Ok(session)
    }

    /// Returns the connection parameters.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Returns the current connectivity state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribes to connectivity changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Makes sure a live connection is available, reconnecting once if the
    /// previous one was dropped, failed or closed.
    ///
    /// Waits for any in-flight operation to release the connection first.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectionError`] if reconnecting fails; the session is
    /// then left in [`ConnectionState::Failed`].
    pub async fn ensure_connected(&self) -> Result<(), ConnectionError> {
        let mut link = self.link.lock().await;

        let healthy = link.remote.as_ref().is_some_and(|r| r.is_alive());
        if healthy && self.state() == ConnectionState::Connected {
            return Ok(());
        }

        if let Some(stale) = link.remote.take() {
            log::info!("Reconnecting to {}", self.config.address());
            stale.close().await;
        }

        match self.connector.connect(&self.config).await {
            Ok(remote) => {
                link.remote = Some(Arc::from(remote));
                self.state.send_replace(ConnectionState::Connected);
                log::info!("Connected to {}", self.config.address());
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(ConnectionState::Failed);
                log::error!("Connection to {} failed: {e}", self.config.address());
                Err(e)
            }
        }
    }

    /// Releases the connection. Idempotent and best-effort.
    pub async fn close(&self) {
        let mut link = self.link.lock().await;
        if let Some(remote) = link.remote.take() {
            remote.close().await;
            log::info!("Closed connection to {}", self.config.address());
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Takes exclusive use of the connection for one operation.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] unless the session is
    /// `Connected`; callers recover with [`Session::ensure_connected`].
    pub async fn lease(&self) -> Result<Lease, ConnectionError> {
        let guard = Arc::clone(&self.link).lock_owned().await;
        let remote = match (&guard.remote, self.state()) {
            (Some(remote), ConnectionState::Connected) => Arc::clone(remote),
            _ => return Err(ConnectionError::NotConnected),
        };
        Ok(Lease {
            remote,
            state: Arc::clone(&self.state),
            _guard: guard,
        })
    }
}

/// Exclusive use of the session's connection, released on drop.
pub struct Lease {
    remote: Arc<dyn RemoteFs>,
    state: Arc<watch::Sender<ConnectionState>>,
    _guard: OwnedMutexGuard<Link>,
}

impl Lease {
    /// Returns the leased connection.
    #[must_use]
    pub fn remote(&self) -> &dyn RemoteFs {
        self.remote.as_ref()
    }

    /// Records that the connection dropped during this operation.
    pub fn mark_lost(&self) {
        if *self.state.borrow() == ConnectionState::Connected {
            log::warn!("Connection lost; call ensure_connected before reuse");
        }
        self.state.send_replace(ConnectionState::Failed);
    }
}
