//! In-memory remote and local file systems for tests.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, stream};
use tokio::io::AsyncWrite;
use tokio_util::io::StreamReader;

use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::fs::{FileSystem, LocalEntry, LocalWriter};
use crate::remote::{Connector, RemoteEntry, RemoteFs, RemoteReader};

/// Behaviour of one fake remote file.
#[derive(Debug, Clone)]
pub struct MockFile {
    /// Bytes the stream actually yields.
    pub len: u64,
    /// Size reported by `file_size` (defaults to `len`).
    pub live_size: Option<u64>,
    /// Throttle in bytes per second.
    pub rate: Option<u64>,
    /// Bytes per yielded piece.
    pub piece: usize,
    /// Fail opening with this kind.
    pub open_error: Option<io::ErrorKind>,
    /// Fail reading once this many bytes were yielded.
    pub fail_after: Option<(u64, io::ErrorKind)>,
    /// Stop yielding (hang forever) once this many bytes were yielded.
    pub stall_after: Option<u64>,
}

impl MockFile {
    pub fn new(len: u64) -> Self {
        Self {
            len,
            live_size: None,
            rate: None,
            piece: 16 * 1024,
            open_error: None,
            fail_after: None,
            stall_after: None,
        }
    }

    pub const fn rate(mut self, bytes_per_sec: u64, piece: usize) -> Self {
        self.rate = Some(bytes_per_sec);
        self.piece = piece;
        self
    }

    pub const fn open_error(mut self, kind: io::ErrorKind) -> Self {
        self.open_error = Some(kind);
        self
    }

    pub const fn fail_after(mut self, offset: u64, kind: io::ErrorKind) -> Self {
        self.fail_after = Some((offset, kind));
        self
    }

    pub const fn stall_after(mut self, offset: u64) -> Self {
        self.stall_after = Some(offset);
        self
    }

    pub const fn live_size(mut self, size: u64) -> Self {
        self.live_size = Some(size);
        self
    }
}

/// Byte at `offset` of every fake file.
#[allow(clippy::cast_possible_truncation)]
pub const fn pattern_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

#[derive(Default)]
struct RemoteState {
    dirs: Mutex<HashMap<String, Vec<RemoteEntry>>>,
    files: Mutex<HashMap<String, MockFile>>,
    alive: AtomicBool,
    opened: Mutex<Vec<String>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    refuse_connect: AtomicBool,
}

/// Fake remote tree shared by every connection a [`MockConnector`] opens.
#[derive(Clone)]
pub struct MockRemote {
    state: Arc<RemoteState>,
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RemoteState::default()),
        }
    }

    /// Adds a directory listing.
    pub fn dir(self, path: &str, entries: Vec<RemoteEntry>) -> Self {
        self.state
            .dirs
            .lock()
            .unwrap()
            .insert(path.to_string(), entries);
        self
    }

    /// Adds a file; also appends it to its parent's listing.
    pub fn file(self, path: &str, file: MockFile) -> Self {
        if let Some((parent, name)) = path.rsplit_once('/') {
            self.state
                .dirs
                .lock()
                .unwrap()
                .entry(parent.to_string())
                .or_default()
                .push(RemoteEntry::file(name, file.len));
        }
        self.state
            .files
            .lock()
            .unwrap()
            .insert(path.to_string(), file);
        self
    }

    /// Simulates the transport dropping.
    pub fn drop_link(&self) {
        self.state.alive.store(false, Ordering::SeqCst);
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.state.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> Vec<String> {
        self.state.opened.lock().unwrap().clone()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            remote: self.clone(),
        })
    }
}

fn piece_stream(
    state: Arc<RemoteState>,
    file: MockFile,
) -> Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>> {
    let stream = stream::unfold((state, file, 0u64), |(state, file, offset)| async move {
        // A failed read ends the stream.
        if offset == u64::MAX {
            return None;
        }
        if file.stall_after.is_some_and(|at| offset >= at) {
            futures::future::pending::<()>().await;
        }
        if let Some((at, kind)) = file.fail_after
            && offset >= at
        {
            if crate::error::is_connection_error(&io::Error::from(kind)) {
                state.alive.store(false, Ordering::SeqCst);
            }
            let err = io::Error::new(kind, "injected read failure");
            return Some((Err(err), (state, file, u64::MAX)));
        }
        if offset >= file.len {
            return None;
        }
        let mut end = (offset + file.piece as u64).min(file.len);
        if let Some((at, _)) = file.fail_after {
            end = end.min(at.max(offset + 1));
        }
        if let Some(rate) = file.rate {
            #[allow(clippy::cast_precision_loss)]
            let secs = (end - offset) as f64 / rate as f64;
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        }
        let data: Vec<u8> = (offset..end).map(pattern_byte).collect();
        Some((Ok(Bytes::from(data)), (state, file, end)))
    });
    Box::pin(stream)
}

struct MockConnection {
    state: Arc<RemoteState>,
}

#[async_trait]
impl RemoteFs for MockConnection {
    async fn read_dir(&self, path: &str) -> io::Result<Vec<RemoteEntry>> {
        if !self.is_alive() {
            return Err(io::ErrorKind::ConnectionAborted.into());
        }
        self.state
            .dirs
            .lock()
            .unwrap()
            .get(path.trim_end_matches('/'))
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{path}: no such file")))
    }

    async fn open(&self, path: &str) -> io::Result<RemoteReader> {
        if !self.is_alive() {
            return Err(io::ErrorKind::ConnectionAborted.into());
        }
        let file = self
            .state
            .files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{path}: no such file")))?;
        if let Some(kind) = file.open_error {
            return Err(io::Error::new(kind, "injected open failure"));
        }
        self.state.opened.lock().unwrap().push(path.to_string());
        Ok(Box::new(StreamReader::new(piece_stream(
            Arc::clone(&self.state),
            file,
        ))))
    }

    async fn file_size(&self, path: &str) -> io::Result<u64> {
        self.state
            .files
            .lock()
            .unwrap()
            .get(path)
            .map(|f| f.live_size.unwrap_or(f.len))
            .ok_or_else(|| io::ErrorKind::NotFound.into())
    }

    fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockConnector {
    remote: MockRemote,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn RemoteFs>, ConnectionError> {
        let state = Arc::clone(&self.remote.state);
        if state.refuse_connect.load(Ordering::SeqCst) {
            return Err(ConnectionError::Unreachable {
                host: config.host.clone(),
                port: config.port,
                reason: "connection refused".to_string(),
            });
        }
        state.connects.fetch_add(1, Ordering::SeqCst);
        state.alive.store(true, Ordering::SeqCst);
        Ok(Box::new(MockConnection { state }))
    }
}

pub fn test_config() -> ConnectionConfig {
    ConnectionConfig::parse("sftp://tester:pw@mock.host").unwrap()
}

/// In-memory local file system.
#[derive(Default)]
pub struct MemFs {
    files: Mutex<HashMap<PathBuf, Arc<Mutex<Vec<u8>>>>>,
    deny_writes: AtomicBool,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_writes(&self) {
        self.deny_writes.store(true, Ordering::SeqCst);
    }

    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|data| data.lock().unwrap().clone())
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.lock().unwrap().keys().cloned().collect()
    }

    /// Stores a file as if an earlier run had written it.
    pub fn put(&self, path: impl Into<PathBuf>, data: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(path.into(), Arc::new(Mutex::new(data.to_vec())));
    }
}

struct MemWriter {
    data: Arc<Mutex<Vec<u8>>>,
}

impl AsyncWrite for MemWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.data.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl FileSystem for MemFs {
    async fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    async fn create_dir_all(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    async fn create(&self, path: &Path) -> io::Result<LocalWriter> {
        if self.deny_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "read-only file system",
            ));
        }
        let data = Arc::new(Mutex::new(Vec::new()));
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), Arc::clone(&data));
        Ok(Box::new(MemWriter { data }))
    }

    async fn replace(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut files = self.files.lock().unwrap();
        let data = files.remove(from).ok_or(io::ErrorKind::NotFound)?;
        files.insert(to.to_path_buf(), data);
        Ok(())
    }

    async fn list_dir(&self, dir: &Path) -> io::Result<Vec<LocalEntry>> {
        let files = self.files.lock().unwrap();
        let mut children = BTreeMap::new();
        for path in files.keys() {
            let Ok(rest) = path.strip_prefix(dir) else {
                continue;
            };
            let mut parts = rest.components();
            if let Some(first) = parts.next() {
                let nested = parts.next().is_some();
                *children.entry(dir.join(first)).or_insert(false) |= nested;
            }
        }
        if children.is_empty() {
            return Err(io::ErrorKind::NotFound.into());
        }
        Ok(children
            .into_iter()
            .map(|(path, is_dir)| LocalEntry { path, is_dir })
            .collect())
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        self.files
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| io::ErrorKind::NotFound.into())
    }
}
