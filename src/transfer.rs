//! Single-file transfer engine.
//!
//! A transfer writes to a hidden `.<name>.romfetch-part` file next to its
//! destination and renames it into place only
//! once the remote stream is exhausted with the expected byte count. Every
//! other exit path removes the temporary file, so a destination is never
//! left half-written.
//!
//! Each transfer runs on its own task. Progress is published as an
//! immutable [`TransferSnapshot`] on a `watch` channel (latest wins) and,
//! optionally, to a [`TransferProgress`] observer.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::catalog::{RemoteFileEntry, is_plain_name};
use crate::config::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE, TransferConfig};
use crate::connection::{Lease, Session};
use crate::error::TransferError;
use crate::format::{format_bytes, format_speed};
use crate::fs::{FileSystem, LocalEntry, TokioFileSystem};
use crate::progress::{Eta, SpeedWindow};
use crate::stats::{BatchSummary, TransferStats, TransferStatsTracker};

/// Suffix of in-progress downloads. The temporary for `A.zip` is
/// `.A.zip.romfetch-part` in the same directory.
pub const PART_SUFFIX: &str = ".romfetch-part";

/// Trait for receiving transfer progress updates.
///
/// All methods have default no-op implementations. Callbacks run on the
/// transfer worker, so implementations should return quickly.
pub trait TransferProgress: Send + Sync {
    /// Called when a transfer starts.
    fn on_transfer_start(&self, _request: &TransferRequest) {}

    /// Called with every published snapshot.
    fn on_progress(&self, _request: &TransferRequest, _snapshot: &TransferSnapshot) {}

    /// Called when a transfer completes successfully.
    fn on_transfer_complete(&self, _request: &TransferRequest, _stats: &TransferStats) {}

    /// Called when a transfer stops because it was cancelled.
    fn on_transfer_cancelled(&self, _request: &TransferRequest) {}

    /// Called when a transfer fails.
    fn on_transfer_failed(&self, _request: &TransferRequest, _error: &TransferError) {}

    /// Called once a batch reaches its terminal state.
    fn on_batch_finished(&self, _summary: &BatchSummary) {}
}

/// A null progress implementation that ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl TransferProgress for NoProgress {}

/// A remote file and the local path it is downloaded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Source entry as listed by the catalog.
    pub entry: RemoteFileEntry,
    /// Final local path.
    pub destination: PathBuf,
}

impl TransferRequest {
    /// Targets `<dest_dir>/<platform>/<name>`.
    #[must_use]
    pub fn new(entry: RemoteFileEntry, dest_dir: &Path) -> Self {
        let destination = dest_dir.join(&entry.platform).join(&entry.name);
        Self { entry, destination }
    }

    /// Returns the temporary path written while the transfer runs.
    #[must_use]
    pub fn part_path(&self) -> PathBuf {
        part_path(&self.destination)
    }
}

/// Returns the temporary path used while downloading to `path`.
#[must_use]
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(path.file_name().unwrap_or_default());
    name.push(PART_SUFFIX);
    path.with_file_name(name)
}

/// Returns true if `name` has the shape of a temporary download file.
#[must_use]
pub fn is_part_name(name: &str) -> bool {
    name.len() > PART_SUFFIX.len() + 1 && name.starts_with('.') && name.ends_with(PART_SUFFIX)
}

/// Rejects entries whose platform or name would resolve outside
/// `<dest_dir>/<platform>/`.
fn check_names(entry: &RemoteFileEntry) -> Result<(), TransferError> {
    for name in [&entry.platform, &entry.name] {
        if !is_plain_name(name) || is_part_name(name) {
            return Err(TransferError::DestinationUnwritable(format!(
                "refusing to store {name:?}: not a plain file name"
            )));
        }
    }
    Ok(())
}

/// Lifecycle of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    /// Not started yet.
    Pending,
    /// Copying.
    InProgress,
    /// Renamed into place with the full byte count.
    Completed,
    /// Stopped on request; nothing left on disk.
    Cancelled,
    /// Stopped by an error; nothing left on disk.
    Failed(TransferError),
}

impl TransferState {
    /// Returns true for `Completed`, `Cancelled` and `Failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed(_))
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::InProgress => f.write_str("in progress"),
            Self::Completed => f.write_str("completed"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// Point-in-time view of a transfer, published after every chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSnapshot {
    /// Current lifecycle state.
    pub state: TransferState,
    /// Bytes written to the temporary file so far.
    pub bytes_transferred: u64,
    /// Size from the listing.
    pub total_bytes: u64,
    /// Smoothed speed.
    pub speed_bytes_per_sec: u64,
    /// Estimated time remaining.
    pub eta: Eta,
}

impl TransferSnapshot {
    /// Snapshot of a transfer that has not started.
    #[must_use]
    pub const fn pending(total_bytes: u64) -> Self {
        Self {
            state: TransferState::Pending,
            bytes_transferred: 0,
            total_bytes,
            speed_bytes_per_sec: 0,
            eta: Eta::Unknown,
        }
    }

    /// Completion ratio in `0.0..=1.0`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.state == TransferState::Completed {
                1.0
            } else {
                0.0
            };
        }
        (self.bytes_transferred as f64 / self.total_bytes as f64).min(1.0)
    }
}

/// Terminal state and statistics of a finished transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Terminal state.
    pub state: TransferState,
    /// Timing and throughput.
    pub stats: TransferStats,
}

/// Handle to a running transfer.
#[derive(Debug)]
pub struct TransferHandle {
    status: watch::Receiver<TransferSnapshot>,
    token: CancellationToken,
    task: JoinHandle<TransferOutcome>,
}

impl TransferHandle {
    /// Requests cooperative cancellation and returns immediately.
    ///
    /// The transfer reaches `Cancelled` once the current chunk is done and
    /// the temporary file is removed.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns the latest snapshot.
    #[must_use]
    pub fn status(&self) -> TransferSnapshot {
        self.status.borrow().clone()
    }

    /// Returns a receiver that observes every new snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TransferSnapshot> {
        self.status.clone()
    }

    /// Returns true once the worker has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the terminal state.
    pub async fn wait(self) -> TransferOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Transfer worker ended abnormally: {e}");
                TransferOutcome {
                    state: TransferState::Failed(TransferError::DestinationUnwritable(format!(
                        "transfer worker ended abnormally: {e}"
                    ))),
                    stats: TransferStats::default(),
                }
            }
        }
    }
}

/// Runs single-file transfers against a [`Session`].
pub struct TransferEngine<F: FileSystem = TokioFileSystem> {
    config: Arc<TransferConfig>,
    fs: Arc<F>,
    progress: Arc<dyn TransferProgress>,
}

impl<F: FileSystem> Clone for TransferEngine<F> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            fs: Arc::clone(&self.fs),
            progress: Arc::clone(&self.progress),
        }
    }
}

impl TransferEngine<TokioFileSystem> {
    /// Creates an engine writing to the local disk.
    #[must_use]
    pub fn new(config: TransferConfig) -> Self {
        Self::with_fs(config, TokioFileSystem)
    }
}

impl<F: FileSystem + 'static> TransferEngine<F> {
    /// Creates an engine with a custom file system implementation.
    #[must_use]
    pub fn with_fs(config: TransferConfig, fs: F) -> Self {
        Self {
            config: Arc::new(config),
            fs: Arc::new(fs),
            progress: Arc::new(NoProgress),
        }
    }

    /// Sets the observer notified of every transfer this engine runs.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn TransferProgress>) -> Self {
        self.progress = progress;
        self
    }

    /// Returns the transfer configuration.
    #[must_use]
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Returns the local file system.
    #[must_use]
    pub fn fs(&self) -> &F {
        &self.fs
    }

    pub(crate) fn progress(&self) -> &dyn TransferProgress {
        self.progress.as_ref()
    }

    /// Builds a request targeting the configured destination directory.
    #[must_use]
    pub fn request(&self, entry: RemoteFileEntry) -> TransferRequest {
        TransferRequest::new(entry, &self.config.dest_dir)
    }

    /// Removes temporaries left in the configured destination directory.
    ///
    /// # Errors
    ///
    /// See [`purge_orphans`].
    pub async fn purge_orphans(&self) -> io::Result<Vec<PathBuf>> {
        purge_orphans(self.fs.as_ref(), &self.config.dest_dir).await
    }

    /// Starts a transfer with its own cancellation token.
    #[must_use]
    pub fn start(&self, session: &Session, request: TransferRequest) -> TransferHandle {
        self.start_with_token(session, request, CancellationToken::new())
    }

    /// Starts a transfer that stops when `token` is cancelled.
    #[must_use]
    pub fn start_with_token(
        &self,
        session: &Session,
        request: TransferRequest,
        token: CancellationToken,
    ) -> TransferHandle {
        let (status, rx) = watch::channel(TransferSnapshot::pending(request.entry.size));
        let started = Instant::now();
        let worker = Worker {
            engine: self.clone(),
            session: session.clone(),
            request,
            token: token.clone(),
            status,
            window: SpeedWindow::default(),
            tracker: TransferStatsTracker::starting_at(started),
            started,
        };
        TransferHandle {
            status: rx,
            token,
            task: tokio::spawn(worker.run()),
        }
    }
}

enum Stop {
    Cancelled,
    Failed(TransferError),
}

fn local_failure(err: &io::Error) -> Stop {
    Stop::Failed(TransferError::from_local(err))
}

fn remote_failure(lease: &Lease, err: &io::Error) -> Stop {
    match TransferError::from_remote(err) {
        TransferError::ConnectionLost(reason) => {
            lease.mark_lost();
            Stop::Failed(TransferError::ConnectionLost(reason))
        }
        _ if !lease.remote().is_alive() => {
            lease.mark_lost();
            Stop::Failed(TransferError::ConnectionLost(err.to_string()))
        }
        other => Stop::Failed(other),
    }
}

struct Worker<F: FileSystem> {
    engine: TransferEngine<F>,
    session: Session,
    request: TransferRequest,
    token: CancellationToken,
    status: watch::Sender<TransferSnapshot>,
    window: SpeedWindow,
    tracker: TransferStatsTracker,
    started: Instant,
}

impl<F: FileSystem + 'static> Worker<F> {
    async fn run(mut self) -> TransferOutcome {
        log::info!(
            "Starting transfer of {} ({}) to {}",
            self.request.entry.name,
            format_bytes(self.request.entry.size),
            self.request.destination.display()
        );
        self.publish(TransferState::InProgress, 0);
        self.engine.progress().on_transfer_start(&self.request);

        let state = if let Err(e) = check_names(&self.request.entry) {
            TransferState::Failed(e)
        } else {
            match self.copy().await {
                Ok(()) => TransferState::Completed,
                Err(stop) => {
                    self.discard_part().await;
                    match stop {
                        Stop::Cancelled => TransferState::Cancelled,
                        Stop::Failed(e) => TransferState::Failed(e),
                    }
                }
            }
        };

        let stats = self.tracker.finish();
        self.publish(state.clone(), stats.bytes);
        self.notify(&state, &stats);
        TransferOutcome { state, stats }
    }

    async fn copy(&mut self) -> Result<(), Stop> {
        let lease = tokio::select! {
            biased;
            () = self.token.cancelled() => return Err(Stop::Cancelled),
            lease = self.session.lease() => lease.map_err(|e| {
                Stop::Failed(TransferError::ConnectionLost(e.to_string()))
            })?,
        };

        let fs = Arc::clone(&self.engine.fs);
        let destination = self.request.destination.clone();
        let part = self.request.part_path();
        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs.create_dir_all(parent)
                .await
                .map_err(|e| local_failure(&e))?;
        }
        let mut writer = fs.create(&part).await.map_err(|e| local_failure(&e))?;

        let remote_path = self.request.entry.remote_path(self.session.config());
        let mut reader = lease
            .remote()
            .open(&remote_path)
            .await
            .map_err(|e| remote_failure(&lease, &e))?;

        let deadline = self.engine.config.chunk_timeout();
        let chunk_size = self.engine.config.chunk_size;
        let mut buf = vec![0u8; chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)];
        let mut bytes = 0u64;
        self.window.record(self.started.elapsed(), 0);

        loop {
            if self.token.is_cancelled() {
                return Err(Stop::Cancelled);
            }
            let read = tokio::select! {
                biased;
                () = self.token.cancelled() => return Err(Stop::Cancelled),
                read = tokio::time::timeout(deadline, reader.read(&mut buf)) => read,
            };
            let n = match read {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(remote_failure(&lease, &e)),
                Err(_) => {
                    lease.mark_lost();
                    return Err(Stop::Failed(TransferError::ConnectionLost(format!(
                        "no data from {remote_path} for {}s",
                        deadline.as_secs()
                    ))));
                }
            };
            writer
                .write_all(&buf[..n])
                .await
                .map_err(|e| local_failure(&e))?;
            bytes += n as u64;
            self.window.record(self.started.elapsed(), bytes);
            self.publish(TransferState::InProgress, bytes);
        }

        writer.shutdown().await.map_err(|e| local_failure(&e))?;
        drop(writer);
        drop(reader);
        verify_length(&lease, &remote_path, bytes, self.request.entry.size).await?;
        drop(lease);

        if fs.exists(&destination).await {
            log::info!("Replacing existing {}", destination.display());
        }
        fs.replace(&part, &destination)
            .await
            .map_err(|e| local_failure(&e))
    }

    fn publish(&mut self, state: TransferState, bytes: u64) {
        let total = self.request.entry.size;
        let speed = self.window.speed();
        self.tracker.record(bytes, speed);
        let eta = match state {
            TransferState::InProgress => self.window.eta(total),
            TransferState::Completed => Eta::Remaining(Duration::ZERO),
            _ => Eta::Unknown,
        };
        let snapshot = TransferSnapshot {
            state,
            bytes_transferred: bytes,
            total_bytes: total,
            speed_bytes_per_sec: speed,
            eta,
        };
        self.engine.progress().on_progress(&self.request, &snapshot);
        self.status.send_replace(snapshot);
    }

    fn notify(&self, state: &TransferState, stats: &TransferStats) {
        let name = &self.request.entry.name;
        let progress = self.engine.progress();
        match state {
            TransferState::Completed => {
                log::info!(
                    "Completed {name}: {} at {}",
                    format_bytes(stats.bytes),
                    format_speed(stats.average_speed)
                );
                progress.on_transfer_complete(&self.request, stats);
            }
            TransferState::Cancelled => {
                log::info!("Cancelled transfer of {name}");
                progress.on_transfer_cancelled(&self.request);
            }
            TransferState::Failed(e) => {
                log::error!("Transfer of {name} failed: {e}");
                progress.on_transfer_failed(&self.request, e);
            }
            TransferState::Pending | TransferState::InProgress => {}
        }
    }

    async fn discard_part(&self) {
        let part = self.request.part_path();
        match self.engine.fs.remove(&part).await {
            Ok(()) => log::debug!("Removed {}", part.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Could not remove {}: {e}", part.display()),
        }
    }
}

/// Accepts a byte count that differs from the listed size only if it
/// matches the file's current size on the remote.
async fn verify_length(
    lease: &Lease,
    remote_path: &str,
    bytes: u64,
    listed: u64,
) -> Result<(), Stop> {
    if bytes == listed {
        return Ok(());
    }
    match lease.remote().file_size(remote_path).await {
        Ok(live) if live == bytes => {
            log::info!("{remote_path} changed since listing: {listed} -> {live} bytes");
            Ok(())
        }
        Ok(live) => Err(Stop::Failed(TransferError::SourceUnreadable(format!(
            "short read from {remote_path}: {bytes} of {live} bytes"
        )))),
        Err(e) => Err(remote_failure(lease, &e)),
    }
}

/// Removes temporary download files left under `dest_dir` by interrupted
/// runs. Completed downloads are never touched.
///
/// Returns the removed paths, sorted. A missing `dest_dir` is not an error.
///
/// # Errors
///
/// Returns an error if a directory cannot be listed or a file cannot be
/// removed.
pub async fn purge_orphans<F: FileSystem + ?Sized>(
    fs: &F,
    dest_dir: &Path,
) -> io::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    let mut pending = vec![dest_dir.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match fs.list_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for LocalEntry { path, is_dir } in entries {
            if is_dir {
                pending.push(path);
            } else if path.file_name().and_then(OsStr::to_str).is_some_and(is_part_name) {
                fs.remove(&path).await?;
                log::info!("Removed orphaned {}", path.display());
                removed.push(path);
            }
        }
    }

    removed.sort();
    Ok(removed)
}
