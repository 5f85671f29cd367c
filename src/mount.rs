use fxhash::FxHashSet;
use parking_lot::RwLock;
use std::ffi::{CStr, OsString};
use std::fs::{self, File};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::wait::waitpid;
use nix::unistd::{execvp, fork, ForkResult};

use crate::error::{Result, StrataError};
use crate::vfs::{compose_tree, scan_data_dir, CachedBaseEntry, OverwriteManager, StrataFs, VfsTree};

const STAGING_DIR_NAME: &str = "VFS_staging";

/// One entry of the mapping the host application hands over: a source
/// directory or file and where it should appear in the projected view.
#[derive(Debug, Clone)]
pub struct MappingEntry {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub is_directory: bool,
}

/// Full description of what to project, as supplied by the mod state source.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub game_dir: PathBuf,
    pub data_dir_name: String,
    pub overwrite_dir: PathBuf,
    pub entries: Vec<MappingEntry>,
}

impl Mapping {
    /// Derive the ordered mod list: directory entries destined for the data
    /// directory, excluding the overwrite tree, deduplicated by source, each
    /// named after its source directory.
    pub fn mods(&self) -> Vec<(String, PathBuf)> {
        let data_dir = self.game_dir.join(&self.data_dir_name);
        let mut seen = FxHashSet::default();
        let mut mods = Vec::new();

        for entry in &self.entries {
            if !entry.is_directory {
                continue;
            }
            if !entry.destination.starts_with(&data_dir) {
                continue;
            }
            if entry.source.starts_with(&self.overwrite_dir) {
                continue;
            }
            if !seen.insert(entry.source.clone()) {
                continue;
            }
            let Some(name) = entry.source.file_name() else {
                continue;
            };
            mods.push((name.to_string_lossy().into_owned(), entry.source.clone()));
        }

        mods
    }
}

/// Owns the mount lifecycle: scan, compose, publish, rebuild, fold, recover.
///
/// The projection is mounted directly over `game_dir/data_dir_name`, so the
/// base snapshot and the backing directory descriptor must both be acquired
/// before the session is published; afterwards the stock files are hidden
/// behind the merged view.
pub struct MountController {
    session: Option<fuser::BackgroundSession>,
    tree: Arc<RwLock<VfsTree>>,
    overwrite: Option<Arc<OverwriteManager>>,
    backing: Option<Arc<File>>,
    base_cache: Vec<CachedBaseEntry>,
    data_dir_path: PathBuf,
    data_dir_name: String,
    overwrite_dir: PathBuf,
    staging_dir: PathBuf,
    last_mods: Vec<(String, PathBuf)>,
}

impl MountController {
    pub fn new() -> Self {
        MountController {
            session: None,
            tree: Arc::new(RwLock::new(VfsTree::new())),
            overwrite: None,
            backing: None,
            base_cache: Vec::new(),
            data_dir_path: PathBuf::new(),
            data_dir_name: String::new(),
            overwrite_dir: PathBuf::new(),
            staging_dir: PathBuf::new(),
            last_mods: Vec::new(),
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.session.is_some()
    }

    /// The directory the projection is (or would be) published over.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir_path
    }

    /// A shared handle to the current tree snapshot, for conflict views.
    pub fn tree(&self) -> Arc<RwLock<VfsTree>> {
        self.tree.clone()
    }

    /// Publish the merged view over the game's data directory.
    pub fn mount(
        &mut self,
        game_dir: &Path,
        data_dir_name: &str,
        overwrite_dir: &Path,
        mods: Vec<(String, PathBuf)>,
    ) -> Result<()> {
        if self.is_mounted() {
            self.unmount();
        }

        let data_dir = game_dir.join(data_dir_name);
        if !data_dir.is_dir() {
            return Err(StrataError::Mount(format!(
                "game data directory does not exist: {}",
                data_dir.display()
            )));
        }

        let staging_dir = overwrite_dir
            .parent()
            .unwrap_or(overwrite_dir)
            .join(STAGING_DIR_NAME);
        fs::create_dir_all(&staging_dir)?;
        fs::create_dir_all(overwrite_dir)?;

        // Scan and open the backing descriptor BEFORE mounting: once the
        // projection covers the data directory the stock files are hidden.
        self.base_cache = scan_data_dir(&data_dir)?;
        let backing = Arc::new(File::open(&data_dir)?);

        if !try_cleanup_stale_mount(&data_dir) {
            return Err(StrataError::Mount(format!(
                "could not recover stale mount at {}",
                data_dir.display()
            )));
        }

        let tree = Arc::new(RwLock::new(compose_tree(
            &self.base_cache,
            overwrite_dir,
            &mods,
        )));
        let overwrite = Arc::new(OverwriteManager::new(
            staging_dir.clone(),
            overwrite_dir.to_path_buf(),
        ));

        let fs = StrataFs::new(tree.clone(), overwrite.clone(), backing.clone());
        let options = vec![
            fuser::MountOption::FSName("strata".to_string()),
            fuser::MountOption::DefaultPermissions,
            fuser::MountOption::NoAtime,
        ];

        let session = fuser::spawn_mount2(fs, &data_dir, &options).map_err(|e| {
            StrataError::Fuse(format!("failed to mount at {}: {}", data_dir.display(), e))
        })?;

        self.session = Some(session);
        self.tree = tree;
        self.overwrite = Some(overwrite);
        self.backing = Some(backing);
        self.data_dir_path = data_dir.clone();
        self.data_dir_name = data_dir_name.to_string();
        self.overwrite_dir = overwrite_dir.to_path_buf();
        self.staging_dir = staging_dir;
        self.last_mods = mods;

        set_mount_point_cell(&data_dir);
        tracing::info!(
            "mounted projection over {} ({} base entries, staging at {})",
            data_dir.display(),
            self.base_cache.len(),
            self.staging_dir.display()
        );
        Ok(())
    }

    /// Tear the projection down and fold staged writes into overwrite.
    /// Idempotent.
    pub fn unmount(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        session.join();

        if let Some(overwrite) = &self.overwrite {
            overwrite.flush_staging();
        }
        drop(self.backing.take());
        clear_mount_point_cell();

        tracing::info!("unmounted projection from {}", self.data_dir_path.display());
    }

    /// Recompose the tree from the cached base entries plus the new mod list
    /// and the current overwrite contents, and swap it in atomically. The
    /// inode table is untouched, so paths keep their inodes.
    pub fn rebuild(
        &mut self,
        mods: Vec<(String, PathBuf)>,
        overwrite_dir: &Path,
        data_dir_name: &str,
    ) {
        if !self.is_mounted() {
            return;
        }

        self.overwrite_dir = overwrite_dir.to_path_buf();
        self.data_dir_name = data_dir_name.to_string();

        let new_tree = compose_tree(&self.base_cache, overwrite_dir, &mods);
        tracing::debug!(
            "rebuilt view of {}: {} files from {} mods",
            self.data_dir_name,
            new_tree.file_count,
            mods.len()
        );
        *self.tree.write() = new_tree;
        self.last_mods = mods;
    }

    /// Fold staging into overwrite without unmounting, then rebuild so the
    /// view picks the folded files up from their overwrite location.
    pub fn flush_staging_live(&mut self) {
        if !self.is_mounted() {
            return;
        }

        if let Some(overwrite) = &self.overwrite {
            overwrite.flush_staging();
        }
        if let Err(e) = fs::create_dir_all(&self.staging_dir) {
            tracing::warn!(
                "failed to recreate staging dir {}: {}",
                self.staging_dir.display(),
                e
            );
        }

        let new_tree = compose_tree(&self.base_cache, &self.overwrite_dir, &self.last_mods);
        *self.tree.write() = new_tree;

        tracing::info!("live staging flush complete");
    }

    /// Convenience over mount/rebuild driven by a mapping descriptor.
    pub fn update_mapping(&mut self, mapping: &Mapping) -> Result<()> {
        let mods = mapping.mods();
        if self.is_mounted() {
            self.rebuild(mods, &mapping.overwrite_dir, &mapping.data_dir_name);
            Ok(())
        } else {
            self.mount(
                &mapping.game_dir,
                &mapping.data_dir_name,
                &mapping.overwrite_dir,
                mods,
            )
        }
    }
}

impl Default for MountController {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MountController {
    fn drop(&mut self) {
        if self.is_mounted() {
            tracing::warn!("controller dropped while mounted, unmounting");
            self.unmount();
        }
    }
}

/// Check /proc/mounts for an active mount at `path`.
pub fn is_mount_point(path: &Path) -> bool {
    let Ok(mounts) = fs::read_to_string("/proc/mounts") else {
        return false;
    };
    let path_str = path.to_string_lossy();
    mounts.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .is_some_and(|field| decode_proc_mount_field(field) == path_str)
    })
}

/// /proc/mounts escapes spaces and some bytes as three-digit octal
/// sequences (e.g. `\040`).
fn decode_proc_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = String::with_capacity(field.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1].is_ascii_digit()
            && bytes[i + 2].is_ascii_digit()
            && bytes[i + 3].is_ascii_digit()
        {
            if let Ok(value) = u8::from_str_radix(&field[i + 1..i + 4], 8) {
                out.push(value as char);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// Recover a mount left behind by a crashed session. Tries the normal
/// unmount utilities first, then the lazy forms, and polls until the target
/// is no longer a mount point. Returns false when every strategy failed.
pub fn try_cleanup_stale_mount(path: &Path) -> bool {
    if !is_mount_point(path) {
        return true;
    }
    tracing::info!("stale mount detected at {}, recovering", path.display());

    if !(run_unmount("fusermount3", &["-u"], path) || run_unmount("fusermount", &["-u"], path)) {
        let _ = run_unmount("umount", &[], path);
        let _ = run_unmount("umount", &["-l"], path);
        let _ = run_unmount("fusermount3", &["-uz"], path);
        let _ = run_unmount("fusermount", &["-uz"], path);
    }

    for _ in 0..10 {
        if !is_mount_point(path) {
            tracing::info!("stale mount recovered");
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    tracing::warn!("could not recover stale mount at {}", path.display());
    false
}

fn run_unmount(program: &str, args: &[&str], target: &Path) -> bool {
    Command::new(program)
        .args(args)
        .arg(target)
        .output()
        .is_ok_and(|o| o.status.success())
}

// The crash handler must be able to read the mount point without touching
// the heap or any lock, so it lives in a fixed atomic byte buffer. Bytes
// are published before the length; a zero length means "no mount".
const MOUNT_POINT_CAP: usize = 4096;
static MOUNT_POINT_LEN: AtomicUsize = AtomicUsize::new(0);
static MOUNT_POINT_BUF: [AtomicU8; MOUNT_POINT_CAP] = [const { AtomicU8::new(0) }; MOUNT_POINT_CAP];

fn set_mount_point_cell(path: &Path) {
    let bytes = path.as_os_str().as_bytes();
    if bytes.is_empty() || bytes.len() >= MOUNT_POINT_CAP || bytes.contains(&0) {
        tracing::warn!(
            "mount point not recorded for emergency unmount: {}",
            path.display()
        );
        MOUNT_POINT_LEN.store(0, Ordering::Release);
        return;
    }
    for (i, b) in bytes.iter().enumerate() {
        MOUNT_POINT_BUF[i].store(*b, Ordering::Relaxed);
    }
    MOUNT_POINT_LEN.store(bytes.len(), Ordering::Release);
}

fn clear_mount_point_cell() {
    MOUNT_POINT_LEN.store(0, Ordering::Release);
}

/// The currently mounted projection target, if any.
pub fn current_mount_point() -> Option<PathBuf> {
    let len = MOUNT_POINT_LEN.load(Ordering::Acquire);
    if len == 0 || len >= MOUNT_POINT_CAP {
        return None;
    }
    let mut bytes = vec![0u8; len];
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = MOUNT_POINT_BUF[i].load(Ordering::Relaxed);
    }
    Some(PathBuf::from(OsString::from_vec(bytes)))
}

/// Unmount the recorded mount point, normal forms first and lazy forms as
/// fallback. Async-signal-safe: only atomics, stack buffers, `fork`, `exec`
/// and `waitpid` are used, so a crash or terminate handler may call this
/// directly. Returns false when no mount point is recorded.
pub fn emergency_unmount() -> bool {
    let len = MOUNT_POINT_LEN.load(Ordering::Acquire);
    if len == 0 || len >= MOUNT_POINT_CAP {
        return false;
    }

    let mut buf = [0u8; MOUNT_POINT_CAP];
    for (i, b) in buf.iter_mut().take(len).enumerate() {
        *b = MOUNT_POINT_BUF[i].load(Ordering::Relaxed);
    }
    let Ok(target) = CStr::from_bytes_with_nul(&buf[..=len]) else {
        return false;
    };

    // Normal unmounts first, then the lazy forms for a wedged target.
    for (program, flag) in [
        (c"fusermount3", c"-u"),
        (c"fusermount", c"-u"),
        (c"fusermount3", c"-uz"),
        (c"fusermount", c"-uz"),
        (c"umount", c"-l"),
    ] {
        // SAFETY: the child performs only exec/_exit, both async-signal-safe.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let _ = execvp(program, &[program, flag, target]);
                // SAFETY: exec failed; terminate the child without unwinding.
                unsafe { libc::_exit(127) };
            }
            Ok(ForkResult::Parent { child }) => {
                let _ = waitpid(child, None);
            }
            Err(_) => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_derives_ordered_mod_list() {
        let mapping = Mapping {
            game_dir: PathBuf::from("/games/SkyrimSE"),
            data_dir_name: "Data".to_string(),
            overwrite_dir: PathBuf::from("/instance/overwrite"),
            entries: vec![
                MappingEntry {
                    source: PathBuf::from("/instance/mods/ModA"),
                    destination: PathBuf::from("/games/SkyrimSE/Data"),
                    is_directory: true,
                },
                MappingEntry {
                    source: PathBuf::from("/instance/mods/ModB"),
                    destination: PathBuf::from("/games/SkyrimSE/Data/Textures"),
                    is_directory: true,
                },
                // Duplicate source: dropped.
                MappingEntry {
                    source: PathBuf::from("/instance/mods/ModA"),
                    destination: PathBuf::from("/games/SkyrimSE/Data"),
                    is_directory: true,
                },
                // Not a directory: dropped.
                MappingEntry {
                    source: PathBuf::from("/instance/mods/loose.esp"),
                    destination: PathBuf::from("/games/SkyrimSE/Data/loose.esp"),
                    is_directory: false,
                },
                // Overwrite tree: dropped.
                MappingEntry {
                    source: PathBuf::from("/instance/overwrite"),
                    destination: PathBuf::from("/games/SkyrimSE/Data"),
                    is_directory: true,
                },
                // Destined outside the data directory: dropped.
                MappingEntry {
                    source: PathBuf::from("/instance/mods/RootMod"),
                    destination: PathBuf::from("/games/SkyrimSE"),
                    is_directory: true,
                },
            ],
        };

        let mods = mapping.mods();
        assert_eq!(
            mods,
            vec![
                ("ModA".to_string(), PathBuf::from("/instance/mods/ModA")),
                ("ModB".to_string(), PathBuf::from("/instance/mods/ModB")),
            ]
        );
    }

    #[test]
    fn test_decode_proc_mount_field() {
        assert_eq!(decode_proc_mount_field("/plain/path"), "/plain/path");
        assert_eq!(
            decode_proc_mount_field("/games/Data\\040Files"),
            "/games/Data Files"
        );
        assert_eq!(decode_proc_mount_field("trailing\\04"), "trailing\\04");
    }

    #[test]
    fn test_is_mount_point() {
        assert!(is_mount_point(Path::new("/")));
        let tmp = tempfile::tempdir().unwrap();
        assert!(!is_mount_point(tmp.path()));
    }

    #[test]
    fn test_stale_cleanup_is_noop_without_mount() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(try_cleanup_stale_mount(tmp.path()));
    }

    #[test]
    fn test_mount_point_cell_roundtrip() {
        // Single test for all cell states: the storage is process-global.
        assert_eq!(current_mount_point(), None);
        assert!(!emergency_unmount());

        set_mount_point_cell(Path::new("/games/SkyrimSE/Data"));
        assert_eq!(
            current_mount_point(),
            Some(PathBuf::from("/games/SkyrimSE/Data"))
        );

        clear_mount_point_cell();
        assert_eq!(current_mount_point(), None);
        assert!(!emergency_unmount());
    }

    #[test]
    fn test_mount_fails_without_data_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let mut controller = MountController::new();
        let result = controller.mount(
            &tmp.path().join("game"),
            "Data",
            &tmp.path().join("overwrite"),
            Vec::new(),
        );
        assert!(matches!(result, Err(StrataError::Mount(_))));
        assert!(!controller.is_mounted());
    }

    #[test]
    fn test_staging_dir_is_sibling_of_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let overwrite = tmp.path().join("instance/overwrite");
        let game = tmp.path().join("game");
        fs::create_dir_all(game.join("Data")).unwrap();

        let mut controller = MountController::new();
        // Mounting may fail in environments without /dev/fuse; the staging
        // directory is created before the session is attempted either way.
        let _ = controller.mount(&game, "Data", &overwrite, Vec::new());
        assert!(tmp.path().join("instance/VFS_staging").is_dir());
        assert!(overwrite.is_dir());
        controller.unmount();
    }
}
