use std::ffi::CString;
use std::fs::{self, File};
use std::io;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Owns the staging and overwrite directories and performs every mutation
/// the adapter needs: copy-on-write, creates, renames, removes, and the
/// fold-back that moves staged files into the overwrite directory.
///
/// Staging captures writes while a mount is live; overwrite is the durable
/// destination. After a fold-back no path exists in both.
#[derive(Debug)]
pub struct OverwriteManager {
    staging_dir: PathBuf,
    overwrite_dir: PathBuf,
}

impl OverwriteManager {
    pub fn new(staging_dir: PathBuf, overwrite_dir: PathBuf) -> Self {
        for dir in [&staging_dir, &overwrite_dir] {
            if let Err(e) = fs::create_dir_all(dir) {
                tracing::warn!("Failed to create {}: {}", dir.display(), e);
            }
        }
        OverwriteManager {
            staging_dir,
            overwrite_dir,
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn overwrite_dir(&self) -> &Path {
        &self.overwrite_dir
    }

    pub fn staging_path(&self, relative: &str) -> PathBuf {
        self.staging_dir.join(sanitize_relative(relative))
    }

    pub fn overwrite_path(&self, relative: &str) -> PathBuf {
        self.overwrite_dir.join(sanitize_relative(relative))
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.staging_path(relative).exists() || self.overwrite_path(relative).exists()
    }

    /// Materialize a staging copy of `source` for writing. Idempotent: an
    /// existing staging copy is returned untouched. A missing source yields
    /// an empty staging file.
    pub fn copy_on_write(&self, source: &Path, relative: &str) -> io::Result<PathBuf> {
        let dest = self.staging_path(relative);
        ensure_parent(&dest)?;

        if dest.exists() {
            return Ok(dest);
        }

        if source.as_os_str().is_empty() || !source.exists() {
            File::create(&dest)?;
        } else {
            fs::copy(source, &dest)?;
        }

        tracing::debug!("copy-on-write {} -> {}", source.display(), dest.display());
        Ok(dest)
    }

    /// Copy-on-write where the source lives inside the stock data directory.
    ///
    /// The source is opened relative to the backing directory handle: an
    /// absolute open would resolve through the projection mounted on top of
    /// the data directory and deadlock the FUSE loop. A source absent from
    /// the backing directory yields an empty staging file.
    pub fn copy_on_write_from_handle(
        &self,
        backing_fd: RawFd,
        relative: &str,
    ) -> io::Result<PathBuf> {
        let dest = self.staging_path(relative);
        ensure_parent(&dest)?;

        if dest.exists() {
            return Ok(dest);
        }

        match open_at(backing_fd, Path::new(&sanitize_relative(relative))) {
            Ok(mut source) => {
                let mut out = File::create(&dest)?;
                io::copy(&mut source, &mut out)?;
            }
            Err(_) => {
                File::create(&dest)?;
            }
        }

        tracing::debug!("copy-on-write (backing) -> {}", dest.display());
        Ok(dest)
    }

    /// Create or truncate a staging file with the given contents.
    pub fn write_new(&self, relative: &str, data: &[u8]) -> io::Result<PathBuf> {
        let dest = self.staging_path(relative);
        ensure_parent(&dest)?;
        fs::write(&dest, data)?;
        Ok(dest)
    }

    /// Rename within staging if the source is staged, otherwise within
    /// overwrite. Returns false when the source exists in neither, which is
    /// how base-only paths refuse destructive renames.
    pub fn rename(&self, old_relative: &str, new_relative: &str) -> bool {
        let (from, to) = if self.staging_path(old_relative).exists() {
            (
                self.staging_path(old_relative),
                self.staging_path(new_relative),
            )
        } else if self.overwrite_path(old_relative).exists() {
            (
                self.overwrite_path(old_relative),
                self.overwrite_path(new_relative),
            )
        } else {
            return false;
        };

        if ensure_parent(&to).is_err() {
            return false;
        }
        match fs::rename(&from, &to) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    "rename {} -> {} failed: {}",
                    from.display(),
                    to.display(),
                    e
                );
                false
            }
        }
    }

    /// Remove a staged shadow if one exists, otherwise an overwrite file.
    /// Returns false when neither exists: base files are never destructively
    /// deleted.
    pub fn remove(&self, relative: &str) -> bool {
        for path in [self.staging_path(relative), self.overwrite_path(relative)] {
            if path.exists() {
                return match fs::remove_file(&path).or_else(|_| fs::remove_dir(&path)) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!("remove {} failed: {}", path.display(), e);
                        false
                    }
                };
            }
        }
        false
    }

    /// Create a directory (and parents) in staging.
    pub fn mkdir(&self, relative: &str) -> bool {
        match fs::create_dir_all(self.staging_path(relative)) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("mkdir {} failed: {}", relative, e);
                false
            }
        }
    }

    /// Fold staged files into the overwrite directory and remove the staging
    /// tree. Per-file failures are logged and skipped so one bad entry does
    /// not strand the rest; the staging tree is removed regardless so the
    /// next fold starts clean. Returns the number of files moved.
    pub fn flush_staging(&self) -> usize {
        if !self.staging_dir.exists() {
            return 0;
        }

        let mut moved = 0usize;
        for entry in WalkDir::new(&self.staging_dir)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let Ok(relative) = entry.path().strip_prefix(&self.staging_dir) else {
                continue;
            };
            let dest = self.overwrite_dir.join(relative);

            if entry.file_type().is_dir() {
                if let Err(e) = fs::create_dir_all(&dest) {
                    tracing::warn!("flush: mkdir {} failed: {}", dest.display(), e);
                }
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }

            if let Some(parent) = dest.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    tracing::warn!("flush: mkdir {} failed: {}", parent.display(), e);
                    continue;
                }
            }

            // rename fails across devices; fall back to copy + remove
            let result = fs::rename(entry.path(), &dest).or_else(|_| {
                fs::copy(entry.path(), &dest)?;
                fs::remove_file(entry.path())
            });
            match result {
                Ok(()) => moved += 1,
                Err(e) => {
                    tracing::warn!(
                        "flush: moving {} failed: {}",
                        entry.path().display(),
                        e
                    );
                }
            }
        }

        if let Err(e) = fs::remove_dir_all(&self.staging_dir) {
            tracing::warn!("flush: removing staging tree failed: {}", e);
        }

        if moved > 0 {
            tracing::info!("flushed {} staged file(s) into overwrite", moved);
        }
        moved
    }
}

/// Host path fragment for a virtual relative path: backslashes flipped,
/// leading slashes stripped so the join cannot escape the root.
fn sanitize_relative(relative: &str) -> String {
    relative
        .replace('\\', "/")
        .trim_start_matches('/')
        .to_string()
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Open a path relative to the backing directory descriptor, read-only.
pub(crate) fn open_at(dir_fd: RawFd, relative: &Path) -> io::Result<File> {
    let c_path = CString::new(relative.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains null byte"))?;

    // SAFETY: dir_fd is a valid directory descriptor owned by the mount
    // context and c_path is null-terminated for the duration of the call.
    let fd = unsafe { libc::openat(dir_fd, c_path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd was just returned by openat and has no other owner.
    Ok(unsafe { File::from_raw_fd(fd) })
}
