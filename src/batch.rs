//! Sequential batch execution on top of the transfer engine.
//!
//! Items run strictly one after another on the session's single
//! connection. A failed item does not stop the batch; cancelling the batch
//! cancels the in-flight item and every item that has not started.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionState, Session};
use crate::error::TransferError;
use crate::format::format_bytes;
use crate::fs::{FileSystem, TokioFileSystem};
use crate::progress::{Eta, SpeedWindow, eta};
use crate::stats::{BatchSummary, BatchSummaryBuilder, TransferStats};
use crate::transfer::{TransferEngine, TransferRequest, TransferSnapshot, TransferState};

/// Aggregate status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// Items are still pending or in progress.
    Running,
    /// Every item completed.
    Completed,
    /// Finished without cancellation, but at least one item failed.
    PartiallyFailed,
    /// Cancelled before every item completed.
    Cancelled,
}

impl BatchStatus {
    /// Returns true once the batch has finished.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Per-item view inside a [`BatchSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    /// File name.
    pub name: String,
    /// Current state.
    pub state: TransferState,
    /// Bytes written so far.
    pub bytes_transferred: u64,
    /// Listed size.
    pub total_bytes: u64,
}

/// Point-in-time view of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSnapshot {
    /// Aggregate status.
    pub status: BatchStatus,
    /// Index of the item being transferred, if any.
    pub active_index: Option<usize>,
    /// Items in request order.
    pub items: Vec<BatchItem>,
    /// Bytes of completed items plus the active item's progress.
    pub bytes_transferred: u64,
    /// Sum of listed sizes.
    pub total_bytes: u64,
    /// Smoothed speed across the batch.
    pub speed_bytes_per_sec: u64,
    /// Time to finish the items that are not terminal yet.
    pub eta: Eta,
}

impl BatchSnapshot {
    fn new(requests: &[TransferRequest]) -> Self {
        let items: Vec<BatchItem> = requests
            .iter()
            .map(|r| BatchItem {
                name: r.entry.name.clone(),
                state: TransferState::Pending,
                bytes_transferred: 0,
                total_bytes: r.entry.size,
            })
            .collect();
        Self {
            status: BatchStatus::Running,
            active_index: None,
            total_bytes: items.iter().map(|i| i.total_bytes).sum(),
            items,
            bytes_transferred: 0,
            speed_bytes_per_sec: 0,
            eta: Eta::Unknown,
        }
    }

    /// Number of items that reached `Completed`.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.state == TransferState::Completed)
            .count()
    }

    fn remaining_bytes(&self) -> u64 {
        self.items
            .iter()
            .filter(|i| !i.state.is_terminal())
            .map(|i| i.total_bytes.saturating_sub(i.bytes_transferred))
            .sum()
    }
}

/// Handle to a running batch.
#[derive(Debug)]
pub struct BatchHandle {
    status: watch::Receiver<BatchSnapshot>,
    token: CancellationToken,
    task: JoinHandle<BatchSummary>,
}

impl BatchHandle {
    /// Cancels the in-flight item and every item not yet started.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns the latest snapshot.
    #[must_use]
    pub fn status(&self) -> BatchSnapshot {
        self.status.borrow().clone()
    }

    /// Returns a receiver that observes every new snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<BatchSnapshot> {
        self.status.clone()
    }

    /// Returns true once the batch worker has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the batch to finish and returns its summary.
    pub async fn wait(self) -> BatchSummary {
        match self.task.await {
            Ok(summary) => summary,
            Err(e) => {
                log::error!("Batch worker ended abnormally: {e}");
                BatchSummary::default()
            }
        }
    }
}

/// Runs ordered lists of transfers one at a time.
pub struct BatchCoordinator<F: FileSystem = TokioFileSystem> {
    engine: TransferEngine<F>,
}

impl<F: FileSystem + 'static> BatchCoordinator<F> {
    /// Creates a coordinator that runs items through `engine`.
    #[must_use]
    pub const fn new(engine: TransferEngine<F>) -> Self {
        Self { engine }
    }

    /// Returns the underlying engine.
    #[must_use]
    pub const fn engine(&self) -> &TransferEngine<F> {
        &self.engine
    }

    /// Starts running `requests` in order.
    #[must_use]
    pub fn run_batch(&self, session: &Session, requests: Vec<TransferRequest>) -> BatchHandle {
        let snapshot = BatchSnapshot::new(&requests);
        let (status, rx) = watch::channel(snapshot.clone());
        let token = CancellationToken::new();
        let worker = BatchWorker {
            engine: self.engine.clone(),
            session: session.clone(),
            requests,
            token: token.clone(),
            status,
            snapshot,
            window: SpeedWindow::default(),
            started: Instant::now(),
            moved_before_item: 0,
            summary: BatchSummaryBuilder::new(),
        };
        BatchHandle {
            status: rx,
            token,
            task: tokio::spawn(worker.run()),
        }
    }
}

struct BatchWorker<F: FileSystem> {
    engine: TransferEngine<F>,
    session: Session,
    requests: Vec<TransferRequest>,
    token: CancellationToken,
    status: watch::Sender<BatchSnapshot>,
    snapshot: BatchSnapshot,
    window: SpeedWindow,
    started: Instant,
    // bytes moved by finished items, including failed ones; drives speed
    moved_before_item: u64,
    summary: BatchSummaryBuilder,
}

impl<F: FileSystem + 'static> BatchWorker<F> {
    async fn run(mut self) -> BatchSummary {
        log::info!(
            "Starting batch of {} files ({})",
            self.requests.len(),
            format_bytes(self.snapshot.total_bytes)
        );
        self.window.record(self.started.elapsed(), 0);

        for index in 0..self.requests.len() {
            if self.token.is_cancelled() {
                break;
            }
            self.run_item(index).await;
        }

        let mut skipped = 0;
        for item in &mut self.snapshot.items {
            if item.state == TransferState::Pending {
                item.state = TransferState::Cancelled;
                skipped += 1;
            }
        }
        self.summary.add_skipped(skipped);

        self.snapshot.active_index = None;
        self.snapshot.status = self.final_status();
        self.publish();

        let summary = self.summary.build();
        log::info!(
            "Batch finished ({:?}): {} completed, {} failed, {} cancelled",
            self.snapshot.status,
            summary.completed,
            summary.failed,
            summary.cancelled
        );
        self.engine.progress().on_batch_finished(&summary);
        summary
    }

    fn final_status(&self) -> BatchStatus {
        if self.snapshot.completed() == self.snapshot.items.len() {
            BatchStatus::Completed
        } else if self.token.is_cancelled() {
            BatchStatus::Cancelled
        } else {
            BatchStatus::PartiallyFailed
        }
    }

    async fn run_item(&mut self, index: usize) {
        if self.session.state() != ConnectionState::Connected {
            let reconnect = tokio::select! {
                biased;
                () = self.token.cancelled() => return,
                result = self.session.ensure_connected() => result,
            };
            if let Err(e) = reconnect {
                let state = TransferState::Failed(TransferError::ConnectionLost(e.to_string()));
                self.finish_item(index, state, &TransferStats::default());
                return;
            }
        }

        self.snapshot.active_index = Some(index);
        self.snapshot.items[index].state = TransferState::InProgress;
        self.publish();

        let handle = self.engine.start_with_token(
            &self.session,
            self.requests[index].clone(),
            self.token.child_token(),
        );
        let mut rx = handle.subscribe();
        while rx.changed().await.is_ok() {
            let snap = rx.borrow_and_update().clone();
            self.track_item(index, &snap);
        }

        let outcome = handle.wait().await;
        self.moved_before_item += outcome.stats.bytes;
        self.finish_item(index, outcome.state, &outcome.stats);
    }

    fn track_item(&mut self, index: usize, snap: &TransferSnapshot) {
        if snap.state.is_terminal() {
            return;
        }
        self.snapshot.items[index].bytes_transferred = snap.bytes_transferred;
        self.window.record(
            self.started.elapsed(),
            self.moved_before_item + snap.bytes_transferred,
        );
        self.publish();
    }

    fn finish_item(&mut self, index: usize, state: TransferState, stats: &TransferStats) {
        self.summary.add(&state, stats);
        let item = &mut self.snapshot.items[index];
        item.bytes_transferred = if state == TransferState::Completed {
            stats.bytes
        } else {
            0
        };
        item.state = state;
        self.publish();
    }

    fn publish(&mut self) {
        let snapshot = &mut self.snapshot;
        snapshot.bytes_transferred = snapshot
            .items
            .iter()
            .filter(|i| matches!(i.state, TransferState::Completed | TransferState::InProgress))
            .map(|i| i.bytes_transferred)
            .sum();
        snapshot.speed_bytes_per_sec = self.window.speed();
        snapshot.eta = if snapshot.status.is_terminal() || self.window.len() < 2 {
            Eta::Unknown
        } else {
            eta(snapshot.speed_bytes_per_sec, snapshot.remaining_bytes())
        };
        self.status.send_replace(snapshot.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RemoteFileEntry;
    use crate::config::TransferConfig;
    use crate::testing::{MemFs, MockFile, MockRemote, test_config};
    use crate::transfer::TransferProgress;
    use std::io;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    async fn session_for(remote: &MockRemote) -> Session {
        Session::connect_with(remote.connector(), test_config())
            .await
            .unwrap()
    }

    fn coordinator() -> BatchCoordinator<MemFs> {
        BatchCoordinator::new(TransferEngine::with_fs(
            TransferConfig::new().with_dest_dir("/dl"),
            MemFs::new(),
        ))
    }

    fn request(name: &str, size: u64) -> TransferRequest {
        TransferRequest::new(
            RemoteFileEntry {
                name: name.to_string(),
                size,
                platform: "SNES".to_string(),
            },
            Path::new("/dl"),
        )
    }

    fn states(snapshot: &BatchSnapshot) -> Vec<TransferState> {
        snapshot.items.iter().map(|i| i.state.clone()).collect()
    }

    #[tokio::test]
    async fn all_items_complete_in_order() {
        let remote = MockRemote::new()
            .file("/roms/SNES/A.zip", MockFile::new(3_000))
            .file("/roms/SNES/B.zip", MockFile::new(2_000))
            .file("/roms/SNES/C.zip", MockFile::new(1_000));
        let session = session_for(&remote).await;
        let coordinator = coordinator();

        let handle = coordinator.run_batch(
            &session,
            vec![
                request("C.zip", 1_000),
                request("A.zip", 3_000),
                request("B.zip", 2_000),
            ],
        );
        let rx = handle.subscribe();
        let summary = handle.wait().await;

        assert_eq!(summary.completed, 3);
        assert_eq!(summary.total_bytes, 6_000);
        assert!(summary.is_success());
        assert_eq!(
            remote.opened(),
            ["/roms/SNES/C.zip", "/roms/SNES/A.zip", "/roms/SNES/B.zip"]
        );

        let last = rx.borrow().clone();
        assert_eq!(last.status, BatchStatus::Completed);
        assert_eq!(last.active_index, None);
        assert_eq!(last.bytes_transferred, 6_000);
        assert_eq!(last.total_bytes, 6_000);
        assert_eq!(coordinator.engine().fs().paths().len(), 3);
    }

    #[tokio::test]
    async fn failed_item_does_not_stop_the_batch() {
        let remote = MockRemote::new()
            .file("/roms/SNES/A.zip", MockFile::new(1_000))
            .file("/roms/SNES/C.zip", MockFile::new(1_000));
        let session = session_for(&remote).await;
        let coordinator = coordinator();

        let handle = coordinator.run_batch(
            &session,
            vec![
                request("A.zip", 1_000),
                request("Missing.zip", 500),
                request("C.zip", 1_000),
            ],
        );
        let rx = handle.subscribe();
        let summary = handle.wait().await;

        let last = rx.borrow().clone();
        assert_eq!(last.status, BatchStatus::PartiallyFailed);
        let states = states(&last);
        assert_eq!(states[0], TransferState::Completed);
        assert!(matches!(
            states[1],
            TransferState::Failed(TransferError::SourceUnreadable(_))
        ));
        assert_eq!(states[2], TransferState::Completed);
        assert_eq!((summary.completed, summary.failed), (2, 1));

        let fs = coordinator.engine().fs();
        assert!(fs.exists(Path::new("/dl/SNES/C.zip")).await);
        assert!(!fs.exists(Path::new("/dl/SNES/Missing.zip")).await);
        assert!(!fs.exists(Path::new("/dl/SNES/.Missing.zip.romfetch-part")).await);
    }

    #[tokio::test]
    async fn lost_connection_is_restored_for_next_item() {
        let remote = MockRemote::new()
            .file(
                "/roms/SNES/A.zip",
                MockFile::new(50_000).fail_after(10_000, io::ErrorKind::ConnectionReset),
            )
            .file("/roms/SNES/B.zip", MockFile::new(2_000));
        let session = session_for(&remote).await;
        let coordinator = coordinator();

        let handle =
            coordinator.run_batch(&session, vec![request("A.zip", 50_000), request("B.zip", 2_000)]);
        let rx = handle.subscribe();
        handle.wait().await;

        let states = states(&rx.borrow());
        assert!(matches!(
            states[0],
            TransferState::Failed(TransferError::ConnectionLost(_))
        ));
        assert_eq!(states[1], TransferState::Completed);
        assert_eq!(remote.connects(), 2);
    }

    #[tokio::test]
    async fn unreachable_host_fails_remaining_items() {
        let remote = MockRemote::new().file(
            "/roms/SNES/A.zip",
            MockFile::new(50_000).fail_after(0, io::ErrorKind::BrokenPipe),
        );
        let session = session_for(&remote).await;
        let coordinator = coordinator();

        let handle = coordinator.run_batch(&session, vec![request("A.zip", 50_000)]);
        handle.wait().await;
        remote.refuse_connect(true);

        let handle =
            coordinator.run_batch(&session, vec![request("A.zip", 50_000), request("B.zip", 1)]);
        let rx = handle.subscribe();
        let summary = handle.wait().await;
        assert_eq!(summary.failed, 2);
        assert!(
            states(&rx.borrow())
                .iter()
                .all(|s| matches!(s, TransferState::Failed(TransferError::ConnectionLost(_))))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_item_cancels_the_rest() {
        let remote = MockRemote::new()
            .file(
                "/roms/SNES/A.zip",
                MockFile::new(1_000_000).rate(500_000, 50_000),
            )
            .file("/roms/SNES/B.zip", MockFile::new(2_000))
            .file("/roms/SNES/C.zip", MockFile::new(3_000));
        let session = session_for(&remote).await;
        let coordinator = coordinator();

        let handle = coordinator.run_batch(
            &session,
            vec![
                request("A.zip", 1_000_000),
                request("B.zip", 2_000),
                request("C.zip", 3_000),
            ],
        );
        let mut rx = handle.subscribe();
        loop {
            rx.changed().await.unwrap();
            let snap = rx.borrow_and_update().clone();
            if snap.items[0].bytes_transferred >= 200_000 {
                assert_eq!(snap.active_index, Some(0));
                assert_eq!(snap.status, BatchStatus::Running);
                assert!(snap.eta.as_duration().is_some());
                break;
            }
        }

        handle.cancel();
        let summary = handle.wait().await;
        assert_eq!(summary.cancelled, 3);
        assert_eq!(summary.completed, 0);

        let last = rx.borrow().clone();
        assert_eq!(last.status, BatchStatus::Cancelled);
        assert!(states(&last).iter().all(|s| *s == TransferState::Cancelled));
        assert!(last.items.iter().all(|i| i.bytes_transferred == 0));
        assert_eq!(remote.opened(), ["/roms/SNES/A.zip"]);
        assert!(coordinator.engine().fs().paths().is_empty());
    }

    #[tokio::test]
    async fn cancel_after_last_item_keeps_completed_status() {
        let remote = MockRemote::new().file("/roms/SNES/A.zip", MockFile::new(1_000));
        let session = session_for(&remote).await;
        let coordinator = coordinator();

        let handle = coordinator.run_batch(&session, vec![request("A.zip", 1_000)]);
        let mut rx = handle.subscribe();
        rx.wait_for(|s| s.status.is_terminal()).await.unwrap();
        handle.cancel();
        let summary = handle.wait().await;

        assert!(summary.is_success());
        assert_eq!(rx.borrow().status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn empty_batch_completes_immediately() {
        let remote = MockRemote::new();
        let session = session_for(&remote).await;
        let handle = coordinator().run_batch(&session, Vec::new());
        let rx = handle.subscribe();
        let summary = handle.wait().await;
        assert_eq!(summary.total(), 0);
        assert_eq!(rx.borrow().status, BatchStatus::Completed);
    }

    #[derive(Default)]
    struct SummaryRecorder {
        summaries: Mutex<Vec<BatchSummary>>,
    }

    impl TransferProgress for SummaryRecorder {
        fn on_batch_finished(&self, summary: &BatchSummary) {
            self.summaries.lock().unwrap().push(*summary);
        }
    }

    #[tokio::test]
    async fn observer_receives_batch_summary() {
        let remote = MockRemote::new().file("/roms/SNES/A.zip", MockFile::new(1_000));
        let session = session_for(&remote).await;
        let recorder = Arc::new(SummaryRecorder::default());
        let coordinator = BatchCoordinator::new(
            TransferEngine::with_fs(TransferConfig::new().with_dest_dir("/dl"), MemFs::new())
                .with_progress(recorder.clone()),
        );

        let summary = coordinator
            .run_batch(&session, vec![request("A.zip", 1_000), request("Nope.zip", 1)])
            .wait()
            .await;

        let recorded = recorder.summaries.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0], summary);
        assert_eq!((summary.completed, summary.failed), (1, 1));
    }
}
