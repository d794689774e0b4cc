//! Remote catalog: platform listing and per-platform search.

use std::cmp::Ordering;
use std::io;
use std::path::{Component, Path};

use crate::config::{ConnectionConfig, join_remote};
use crate::connection::{Lease, Session};
use crate::error::{CatalogError, is_connection_error};
use crate::remote::{EntryKind, RemoteEntry};
use crate::transfer::is_part_name;

/// A top-level platform directory under the remote root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlatformEntry {
    /// Directory name, used both as label and path segment.
    pub name: String,
}

/// A downloadable file inside a platform directory.
///
/// A snapshot taken at listing time; it is not updated if the remote
/// directory changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteFileEntry {
    /// File name.
    pub name: String,
    /// Size in bytes at listing time.
    pub size: u64,
    /// Platform directory the file lives in.
    pub platform: String,
}

impl RemoteFileEntry {
    /// Returns the file's full remote path.
    #[must_use]
    pub fn remote_path(&self, config: &ConnectionConfig) -> String {
        join_remote(&config.platform_path(&self.platform), &self.name)
    }
}

/// Lists the platform directories under the remote root, sorted by name
/// (ascending, case-insensitive).
///
/// # Errors
///
/// Returns a [`CatalogError`] if the session has no usable connection or
/// the root cannot be read.
pub async fn list_platforms(session: &Session) -> Result<Vec<PlatformEntry>, CatalogError> {
    let root = session.config().remote_root.clone();
    let lease = session.lease().await?;
    let entries = read_dir(&lease, &root).await?;

    let mut platforms: Vec<PlatformEntry> = entries
        .into_iter()
        .filter(|e| e.kind == EntryKind::Dir)
        .filter(|e| keep_name(&root, &e.name))
        .map(|e| PlatformEntry { name: e.name })
        .collect();
    platforms.sort_by(|a, b| compare_names(&a.name, &b.name));

    log::debug!("Listed {} platforms under {root}", platforms.len());
    Ok(platforms)
}

/// Lists the files of `platform` whose names contain `query`
/// case-insensitively, sorted by name (ascending, case-insensitive).
///
/// The query is trimmed; an empty query returns every file. Directories
/// and symlinks are skipped and the listing is not recursive.
///
/// Entries whose name is not a single plain path segment, or that look
/// like a temporary download, are dropped, so every result can be stored
/// under `<dest_dir>/<platform>/`.
///
/// # Errors
///
/// Returns a [`CatalogError`] if `platform` is not a plain directory name,
/// the session has no usable connection or the platform directory is
/// missing or unreadable. No match is an empty result, not an error.
pub async fn search(
    session: &Session,
    platform: &str,
    query: &str,
) -> Result<Vec<RemoteFileEntry>, CatalogError> {
    if !is_plain_name(platform) {
        return Err(CatalogError::InvalidName(platform.to_string()));
    }
    let path = session.config().platform_path(platform);
    let lease = session.lease().await?;
    let entries = read_dir(&lease, &path).await?;
    drop(lease);

    let needle = query.trim().to_lowercase();
    let mut files: Vec<RemoteFileEntry> = entries
        .into_iter()
        .filter(|e| e.kind == EntryKind::File)
        .filter(|e| keep_name(&path, &e.name))
        .filter(|e| matches_query(&e.name, &needle))
        .map(|e| RemoteFileEntry {
            name: e.name,
            size: e.size,
            platform: platform.to_string(),
        })
        .collect();
    files.sort_by(|a, b| compare_names(&a.name, &b.name));

    log::info!(
        "Search in {platform} for '{}' returned {} entries",
        query.trim(),
        files.len()
    );
    Ok(files)
}

/// Returns true if `name` contains `needle`, ignoring case.
///
/// `needle` is expected to be lowercased already.
#[must_use]
pub fn matches_query(name: &str, needle: &str) -> bool {
    needle.is_empty() || name.to_lowercase().contains(needle)
}

/// Returns true if `name` is exactly one normal path segment: no
/// separators, no `.` or `..`, not absolute.
#[must_use]
pub fn is_plain_name(name: &str) -> bool {
    if name.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn keep_name(dir: &str, name: &str) -> bool {
    if !is_plain_name(name) {
        log::warn!("Skipping {name:?} in {dir}: not a plain file name");
        return false;
    }
    if is_part_name(name) {
        log::warn!("Skipping {name:?} in {dir}: reserved for temporary downloads");
        return false;
    }
    true
}

/// Case-insensitive name order with a byte-wise tiebreak.
fn compare_names(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}

async fn read_dir(lease: &Lease, path: &str) -> Result<Vec<RemoteEntry>, CatalogError> {
    lease.remote().read_dir(path).await.map_err(|e| {
        log::warn!("Listing {path} failed: {e}");
        classify(lease, path, &e)
    })
}

fn classify(lease: &Lease, path: &str, err: &io::Error) -> CatalogError {
    if is_connection_error(err) || !lease.remote().is_alive() {
        lease.mark_lost();
        CatalogError::ConnectionLost(path.to_string())
    } else if err.kind() == io::ErrorKind::NotFound {
        CatalogError::NotFound(path.to_string())
    } else {
        CatalogError::Unreadable {
            path: path.to_string(),
            reason: err.to_string(),
        }
    }
}
