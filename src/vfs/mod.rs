pub mod base;
mod convert;
mod handle;
pub mod inode;
pub mod overwrite;
pub mod tree;

pub use base::{scan_data_dir, CachedBaseEntry};
pub use overwrite::OverwriteManager;
pub use tree::{compose_tree, FileRef, VfsDisplayEntry, VfsNode, VfsTree};

use convert::{dir_attr, file_attr, io_error_to_libc, TTL};
use handle::{OpenFile, READ_BUFFER};
use inode::InodeTable;
use tree::{split_path, ORIGIN_STAGING};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
    FUSE_ROOT_ID,
};
use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Copy of everything an operation needs to know about one resolved node.
/// Taken under the tree's read lock and used after the lock is dropped, so
/// no I/O ever happens while holding the lock.
#[derive(Debug, Clone)]
struct NodeSnapshot {
    is_dir: bool,
    size: u64,
    mtime: SystemTime,
    real_path: PathBuf,
    is_backing: bool,
}

/// The FUSE adapter over the merged tree.
///
/// The tree snapshot sits behind a readers-writer lock: read operations take
/// it shared for the lookup only, mutating operations take it exclusively
/// just for the surgical edit. The inode table and the open-handle map have
/// their own mutexes; no operation holds more than one of them at a time.
/// The backing directory descriptor is read-only and shared freely.
pub struct StrataFs {
    tree: Arc<RwLock<VfsTree>>,
    inodes: Mutex<InodeTable>,
    overwrite: Arc<OverwriteManager>,
    backing: Arc<File>,
    open_files: Mutex<FxHashMap<u64, OpenFile>>,
    next_fh: AtomicU64,
    uid: u32,
    gid: u32,
}

impl StrataFs {
    pub fn new(
        tree: Arc<RwLock<VfsTree>>,
        overwrite: Arc<OverwriteManager>,
        backing: Arc<File>,
    ) -> Self {
        StrataFs {
            tree,
            inodes: Mutex::new(InodeTable::new()),
            overwrite,
            backing,
            open_files: Mutex::new(FxHashMap::default()),
            next_fh: AtomicU64::new(1),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }

    fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    fn inode_path(&self, ino: u64) -> Option<String> {
        self.inodes.lock().path_of(ino).map(String::from)
    }

    fn snapshot(&self, path: &str) -> Option<NodeSnapshot> {
        let tree = self.tree.read();
        let node = tree.resolve_path(path)?;
        Some(match node {
            VfsNode::Directory { .. } => NodeSnapshot {
                is_dir: true,
                size: 0,
                mtime: std::time::UNIX_EPOCH,
                real_path: PathBuf::new(),
                is_backing: false,
            },
            VfsNode::File(file) => NodeSnapshot {
                is_dir: false,
                size: file.size,
                mtime: file.mtime,
                real_path: file.real_path.clone(),
                is_backing: file.is_backing,
            },
        })
    }

    fn list_children_snapshot(&self, path: &str) -> Option<Vec<(String, bool)>> {
        let tree = self.tree.read();
        let node = tree.resolve_path(path)?;
        if !node.is_directory() {
            return None;
        }
        Some(
            node.list_children()
                .into_iter()
                .map(|(name, child)| (name.to_string(), child.is_directory()))
                .collect(),
        )
    }

    fn attr_for(&self, ino: u64, snap: &NodeSnapshot) -> FileAttr {
        if snap.is_dir {
            dir_attr(ino, self.uid, self.gid)
        } else {
            file_attr(ino, self.uid, self.gid, snap.size, snap.mtime)
        }
    }

    /// Repoint the tree node for `relative` at a staging/overwrite file,
    /// refreshing size and mtime from disk. The stat runs before the
    /// writers lock is taken.
    fn update_file_node(&self, relative: &str, real_path: &Path, origin: &str) {
        let (size, mtime) = match fs::metadata(real_path) {
            Ok(m) => (m.len(), m.modified().unwrap_or(SystemTime::now())),
            Err(_) => (0, SystemTime::now()),
        };

        let mut tree = self.tree.write();
        tree.root.insert_file(
            &split_path(relative),
            FileRef {
                real_path: real_path.to_path_buf(),
                size,
                mtime,
                origin: origin.to_string(),
                is_backing: false,
            },
        );
    }

    /// Materialize a writable staging copy for `relative`, using the backing
    /// descriptor when the current source lives in the stock data directory.
    fn stage_for_write(
        &self,
        relative: &str,
        source: &Path,
        is_backing: bool,
    ) -> std::io::Result<PathBuf> {
        if is_backing {
            self.overwrite
                .copy_on_write_from_handle(self.backing.as_raw_fd(), relative)
        } else {
            self.overwrite.copy_on_write(source, relative)
        }
    }
}

fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", base, name)
    }
}

impl Filesystem for StrataFs {
    fn init(
        &mut self,
        _req: &Request,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        tracing::info!("strata projection initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("strata projection destroyed");
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &std::ffi::OsStr, reply: ReplyEntry) {
        tracing::trace!("lookup(parent={}, name={:?})", parent, name);

        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(parent_path) = self.inode_path(parent) else {
            reply.error(libc::ENOENT);
            return;
        };

        let child_path = join_path(&parent_path, name);
        let Some(snap) = self.snapshot(&child_path) else {
            tracing::trace!("lookup: {:?} not present in the merged view", child_path);
            reply.error(libc::ENOENT);
            return;
        };

        let ino = self.inodes.lock().get_or_create(&child_path);
        reply.entry(&TTL, &self.attr_for(ino, &snap), 0);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        tracing::trace!("getattr(ino={})", ino);

        if ino == FUSE_ROOT_ID {
            reply.attr(&TTL, &dir_attr(ino, self.uid, self.gid));
            return;
        }

        let Some(path) = self.inode_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(snap) = self.snapshot(&path) else {
            reply.error(libc::ENOENT);
            return;
        };

        reply.attr(&TTL, &self.attr_for(ino, &snap));
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if ino == FUSE_ROOT_ID {
            reply.attr(&TTL, &dir_attr(ino, self.uid, self.gid));
            return;
        }

        let Some(path) = self.inode_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        // Only size changes mutate the file. chmod/chown/utimens are
        // acknowledged without being persisted.
        if let Some(new_size) = size {
            let handle_state = fh.and_then(|fh| self.open_files.lock().get(&fh).cloned());

            let (current, is_backing) = match &handle_state {
                Some(open) => (open.real_path.clone(), open.is_backing),
                None => {
                    let Some(snap) = self.snapshot(&path) else {
                        reply.error(libc::ENOENT);
                        return;
                    };
                    if snap.is_dir {
                        reply.error(libc::ENOENT);
                        return;
                    }
                    (snap.real_path, snap.is_backing)
                }
            };

            let staged = self.overwrite.staging_path(&path);
            let target = if is_backing || current != staged {
                match self.stage_for_write(&path, &current, is_backing) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::error!("setattr: copy-on-write failed: {}", e);
                        reply.error(io_error_to_libc(&e));
                        return;
                    }
                }
            } else {
                current
            };

            if let Some(fh) = fh {
                let mut open_files = self.open_files.lock();
                if let Some(open) = open_files.get_mut(&fh) {
                    open.real_path = target.clone();
                    open.writable = true;
                    open.is_backing = false;
                }
            }

            let truncated = OpenOptions::new()
                .write(true)
                .open(&target)
                .and_then(|f| f.set_len(new_size));
            if let Err(e) = truncated {
                tracing::error!("setattr: truncate failed: {}", e);
                reply.error(io_error_to_libc(&e));
                return;
            }

            self.update_file_node(&path, &target, ORIGIN_STAGING);
        }

        let Some(snap) = self.snapshot(&path) else {
            reply.error(libc::ENOENT);
            return;
        };
        reply.attr(&TTL, &self.attr_for(ino, &snap));
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        tracing::debug!("open(ino={}, flags={:#x})", ino, flags);

        let Some(path) = self.inode_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(snap) = self.snapshot(&path) else {
            reply.error(libc::ENOENT);
            return;
        };
        if snap.is_dir {
            reply.error(libc::ENOENT);
            return;
        }

        // O_RDONLY is 0, so write intent is anything else in the access mode
        let writable = (flags & libc::O_ACCMODE) != libc::O_RDONLY;

        let (real_path, is_backing) = if writable {
            match self.stage_for_write(&path, &snap.real_path, snap.is_backing) {
                Ok(staged) => {
                    // Later getattr must see the staging copy's size.
                    self.update_file_node(&path, &staged, ORIGIN_STAGING);
                    (staged, false)
                }
                Err(e) => {
                    tracing::error!("open: copy-on-write failed for {:?}: {}", path, e);
                    reply.error(io_error_to_libc(&e));
                    return;
                }
            }
        } else {
            (snap.real_path, snap.is_backing)
        };

        let fh = self.alloc_fh();
        self.open_files.lock().insert(
            fh,
            OpenFile {
                real_path,
                relative_path: path,
                writable,
                is_backing,
            },
        );

        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        tracing::trace!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }

        let open = {
            let open_files = self.open_files.lock();
            match open_files.get(&fh) {
                Some(open) => open.clone(),
                None => {
                    reply.error(libc::EBADF);
                    return;
                }
            }
        };

        let file = if open.is_backing {
            overwrite::open_at(self.backing.as_raw_fd(), &open.real_path)
        } else {
            File::open(&open.real_path)
        };
        let mut file = match file {
            Ok(f) => f,
            Err(e) => {
                tracing::error!("read: opening {:?} failed: {}", open.real_path, e);
                reply.error(io_error_to_libc(&e));
                return;
            }
        };

        READ_BUFFER.with(|buffer| {
            let mut buf = buffer.borrow_mut();
            buf.resize(size as usize, 0);

            if let Err(e) = file.seek(SeekFrom::Start(offset as u64)) {
                reply.error(io_error_to_libc(&e));
                return;
            }
            match file.read(&mut buf[..]) {
                Ok(n) => reply.data(&buf[..n]),
                Err(e) => reply.error(io_error_to_libc(&e)),
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        tracing::trace!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());

        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }

        let open = {
            let open_files = self.open_files.lock();
            match open_files.get(&fh) {
                Some(open) => open.clone(),
                None => {
                    reply.error(libc::EBADF);
                    return;
                }
            }
        };
        if !open.writable {
            reply.error(libc::EACCES);
            return;
        }

        let io_result = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&open.real_path)
            .and_then(|mut file| {
                file.seek(SeekFrom::Start(offset as u64))?;
                file.write(data)
            });

        let written = match io_result {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("write: {:?} failed: {}", open.real_path, e);
                reply.error(io_error_to_libc(&e));
                return;
            }
        };

        // Grow the node's cached size so a following getattr observes the
        // write without another open. max() because writes may land inside
        // the existing extent.
        let old_size = self
            .snapshot(&open.relative_path)
            .map(|s| s.size)
            .unwrap_or(0);
        let new_size = old_size.max(offset as u64 + written as u64);
        {
            let mut tree = self.tree.write();
            tree.root.insert_file(
                &split_path(&open.relative_path),
                FileRef {
                    real_path: open.real_path.clone(),
                    size: new_size,
                    mtime: SystemTime::now(),
                    origin: ORIGIN_STAGING.to_string(),
                    is_backing: false,
                },
            );
        }

        reply.written(written as u32);
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &std::ffi::OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        tracing::debug!("create(parent={}, name={:?})", parent, name);

        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(parent_path) = self.inode_path(parent) else {
            reply.error(libc::ENOENT);
            return;
        };

        let relative = join_path(&parent_path, name);
        let real_path = match self.overwrite.write_new(&relative, &[]) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("create: staging {:?} failed: {}", relative, e);
                reply.error(io_error_to_libc(&e));
                return;
            }
        };

        let now = SystemTime::now();
        {
            let mut tree = self.tree.write();
            tree.root.insert_file(
                &split_path(&relative),
                FileRef {
                    real_path: real_path.clone(),
                    size: 0,
                    mtime: now,
                    origin: ORIGIN_STAGING.to_string(),
                    is_backing: false,
                },
            );
            tree.file_count += 1;
        }

        let ino = self.inodes.lock().get_or_create(&relative);
        let fh = self.alloc_fh();
        self.open_files.lock().insert(
            fh,
            OpenFile {
                real_path,
                relative_path: relative,
                writable: true,
                is_backing: false,
            },
        );

        let attr = file_attr(ino, self.uid, self.gid, 0, now);
        reply.created(&TTL, &attr, 0, fh, 0);
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &std::ffi::OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(parent_path) = self.inode_path(parent) else {
            reply.error(libc::ENOENT);
            return;
        };

        let relative = join_path(&parent_path, name);
        if !self.overwrite.mkdir(&relative) {
            reply.error(libc::EIO);
            return;
        }

        {
            let mut tree = self.tree.write();
            tree.root.insert_directory(&split_path(&relative));
            tree.dir_count += 1;
        }

        let ino = self.inodes.lock().get_or_create(&relative);
        reply.entry(&TTL, &dir_attr(ino, self.uid, self.gid), 0);
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &std::ffi::OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(parent_path) = self.inode_path(parent) else {
            reply.error(libc::ENOENT);
            return;
        };

        let relative = join_path(&parent_path, name);

        // Only a staged or overwrite shadow can be removed; a path that
        // exists purely in the base layer (or a mod) is refused.
        if !self.overwrite.remove(&relative) {
            tracing::debug!("unlink: {:?} has no removable shadow", relative);
            reply.error(libc::EACCES);
            return;
        }

        {
            let mut tree = self.tree.write();
            if tree.root.remove(&split_path(&relative)) {
                tree.file_count = tree.file_count.saturating_sub(1);
            }
        }

        reply.ok();
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &std::ffi::OsStr,
        newparent: u64,
        newname: &std::ffi::OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let (Some(name), Some(newname)) = (name.to_str(), newname.to_str()) else {
            reply.error(libc::EINVAL);
            return;
        };
        let (Some(parent_path), Some(new_parent_path)) =
            (self.inode_path(parent), self.inode_path(newparent))
        else {
            reply.error(libc::ENOENT);
            return;
        };

        let old_relative = join_path(&parent_path, name);
        let new_relative = join_path(&new_parent_path, newname);

        let Some(snap) = self.snapshot(&old_relative) else {
            reply.error(libc::ENOENT);
            return;
        };

        if !self.overwrite.rename(&old_relative, &new_relative) {
            reply.error(libc::EACCES);
            return;
        }

        let staged = self.overwrite.staging_path(&new_relative);
        let new_real = if staged.exists() {
            staged
        } else {
            self.overwrite.overwrite_path(&new_relative)
        };

        {
            let mut tree = self.tree.write();
            tree.root.remove(&split_path(&old_relative));
            if snap.is_dir {
                tree.root.insert_directory(&split_path(&new_relative));
            } else {
                tree.root.insert_file(
                    &split_path(&new_relative),
                    FileRef {
                        real_path: new_real,
                        size: snap.size,
                        mtime: SystemTime::now(),
                        origin: ORIGIN_STAGING.to_string(),
                        is_backing: false,
                    },
                );
            }
        }

        self.inodes.lock().rename(&old_relative, &new_relative);
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        tracing::trace!("readdir(ino={}, offset={})", ino, offset);

        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let Some(path) = self.inode_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(children) = self.list_children_snapshot(&path) else {
            reply.error(libc::ENOTDIR);
            return;
        };

        let mut entries: Vec<(u64, FileType, String)> = Vec::with_capacity(children.len() + 2);
        entries.push((ino, FileType::Directory, ".".to_string()));
        entries.push((FUSE_ROOT_ID, FileType::Directory, "..".to_string()));

        {
            let mut inodes = self.inodes.lock();
            for (name, is_dir) in children {
                let child_path = join_path(&path, &name);
                let child_ino = inodes.get_or_create(&child_path);
                let kind = if is_dir {
                    FileType::Directory
                } else {
                    FileType::RegularFile
                };
                entries.push((child_ino, kind, name));
            }
        }

        for (i, (entry_ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*entry_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.open_files.lock().remove(&fh);
        reply.ok();
    }
}
