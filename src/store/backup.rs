//! Rolling backups of document files
//!
//! Backups live in the backup directory as `<key>.<timestamp>.bak`. The
//! timestamp is ISO-8601 with `-` in place of `:` so the names stay portable,
//! and it sorts lexicographically in time order.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

const BACKUP_EXTENSION: &str = "bak";
const STAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.6fZ";
const STAMP_PARSE_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.fZ";

/// A retained backup of a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    /// Location of the backup file
    pub path: PathBuf,
    /// When the backup was taken
    pub taken_at: DateTime<Utc>,
}

pub(crate) fn backup_path(dir: &Path, key: &str, taken_at: DateTime<Utc>) -> PathBuf {
    dir.join(format!(
        "{key}.{}.{BACKUP_EXTENSION}",
        taken_at.format(STAMP_FORMAT)
    ))
}

fn parse_stamp(path: &Path, key: &str) -> Option<DateTime<Utc>> {
    let name = path.file_name()?.to_str()?;
    let stamp = name
        .strip_prefix(key)?
        .strip_prefix('.')?
        .strip_suffix(BACKUP_EXTENSION)?
        .strip_suffix('.')?;
    NaiveDateTime::parse_from_str(stamp, STAMP_PARSE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// List the backups of `key`, oldest first
pub(crate) fn list(dir: &Path, key: &str) -> io::Result<Vec<BackupEntry>> {
    let pattern = format!(
        "{}/{key}.*.{BACKUP_EXTENSION}",
        glob::Pattern::escape(&dir.to_string_lossy())
    );
    let paths = glob::glob(&pattern)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut entries = Vec::new();
    for path in paths {
        let path = path.map_err(glob::GlobError::into_error)?;
        // Skips files that merely share the prefix, e.g. hand-made copies
        if let Some(taken_at) = parse_stamp(&path, key) {
            entries.push(BackupEntry { path, taken_at });
        }
    }
    entries.sort_by(|a, b| a.taken_at.cmp(&b.taken_at));
    Ok(entries)
}

/// [`list`] on the blocking pool, since globbing walks the directory synchronously
async fn list_blocking(dir: &Path, key: &str) -> io::Result<Vec<BackupEntry>> {
    let dir = dir.to_path_buf();
    let key = key.to_string();
    tokio::task::spawn_blocking(move || list(&dir, &key))
        .await
        .map_err(io::Error::other)?
}

/// Copy `source` into a new backup of `key`.
///
/// Returns `Ok(None)` when there is nothing to back up yet.
pub(crate) async fn create(
    dir: &Path,
    key: &str,
    source: &Path,
    now: DateTime<Utc>,
) -> io::Result<Option<PathBuf>> {
    match fs::metadata(source).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    }

    fs::create_dir_all(dir).await?;

    // Backups must stay strictly ordered even when two writes share a clock tick
    let mut taken_at = now;
    if let Some(newest) = list_blocking(dir, key).await?.last() {
        if newest.taken_at >= taken_at {
            taken_at = newest.taken_at + Duration::microseconds(1);
        }
    }

    let path = backup_path(dir, key, taken_at);
    fs::copy(source, &path).await?;
    Ok(Some(path))
}

/// Delete all but the `keep` most recent backups of `key`
pub(crate) async fn prune(dir: &Path, key: &str, keep: usize) -> io::Result<usize> {
    let entries = list_blocking(dir, key).await?;
    let excess = entries.len().saturating_sub(keep);
    for entry in &entries[..excess] {
        fs::remove_file(&entry.path).await?;
    }
    Ok(excess)
}
