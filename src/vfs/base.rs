use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

use crate::error::Result;

/// One entry of the stock data directory, captured once at mount time.
///
/// The scan runs before the projection is published over the data directory;
/// afterwards the stock files are hidden behind the mount and can only be
/// reached through the backing directory handle. Size and mtime are sampled
/// here and never refreshed until unmount.
#[derive(Debug, Clone)]
pub struct CachedBaseEntry {
    pub relative_path: String,
    pub is_dir: bool,
    pub size: u64,
    pub mtime: SystemTime,
}

/// Recursively scan the stock data directory into a flat entry list.
///
/// Fails only if the top directory cannot be opened. Symbolic links and
/// entries the process cannot read are skipped.
pub fn scan_data_dir(data_dir: &Path) -> Result<Vec<CachedBaseEntry>> {
    // Probe the top directory up front so an unreadable root is an error
    // rather than an empty cache.
    fs::read_dir(data_dir)?;

    let mut cache = Vec::new();

    for entry in WalkDir::new(data_dir)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let Ok(relative) = entry.path().strip_prefix(data_dir) else {
            continue;
        };
        let relative_path = relative.to_string_lossy().into_owned();
        if relative_path.is_empty() {
            continue;
        }

        if entry.file_type().is_dir() {
            cache.push(CachedBaseEntry {
                relative_path,
                is_dir: true,
                size: 0,
                mtime: UNIX_EPOCH,
            });
        } else if entry.file_type().is_file() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            cache.push(CachedBaseEntry {
                relative_path,
                is_dir: false,
                size: metadata.len(),
                mtime: metadata.modified().unwrap_or(UNIX_EPOCH),
            });
        }
        // Symlinks and special files are not projected.
    }

    tracing::debug!(
        "cached {} base entries from {}",
        cache.len(),
        data_dir.display()
    );
    Ok(cache)
}
