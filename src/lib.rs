//! romfetch - browse, search and download files from an SFTP server.
//!
//! The library owns one remote connection ([`Session`]), lists platform
//! directories and searches them ([`catalog`]), and downloads single files
//! or ordered batches with live progress, cooperative cancellation and
//! guaranteed cleanup of incomplete output ([`TransferEngine`],
//! [`BatchCoordinator`]). It is independent of any UI.
//!
//! # Example
//!
//! ```no_run
//! use romfetch::{AppConfig, BatchCoordinator, Session, TransferEngine, catalog};
//!
//! # async fn example() -> romfetch::Result<()> {
//! let config = AppConfig::load(None)?;
//! let session = Session::connect(config.connection_config()?).await?;
//!
//! let hits = catalog::search(&session, "SNES", "zelda").await?;
//! let engine = TransferEngine::new(config.download.clone());
//! let requests = hits.into_iter().map(|e| engine.request(e)).collect();
//!
//! let summary = BatchCoordinator::new(engine)
//!     .run_batch(&session, requests)
//!     .wait()
//!     .await;
//! println!("Downloaded {} files", summary.completed);
//! session.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod batch;
pub mod catalog;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod format;
pub mod fs;
pub mod memory;
pub mod progress;
pub mod remote;
pub mod sftp;
pub mod stats;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use batch::{BatchCoordinator, BatchHandle, BatchSnapshot, BatchStatus};
pub use catalog::{PlatformEntry, RemoteFileEntry};
pub use config::{AppConfig, ConnectionConfig, TransferConfig};
pub use connection::{ConnectionState, Session};
pub use error::{CatalogError, ConfigError, ConnectionError, Error, Result, TransferError};
pub use format::{format_bytes, format_duration, format_eta, format_speed};
pub use fs::{FileSystem, TokioFileSystem};
pub use memory::SessionMemory;
pub use progress::Eta;
pub use remote::{Connector, RemoteFs};
pub use sftp::SftpConnector;
pub use stats::{BatchSummary, TransferStats};
pub use transfer::{
    NoProgress, TransferEngine, TransferHandle, TransferProgress, TransferRequest,
    TransferSnapshot, TransferState, purge_orphans,
};
