use fuser::{FileAttr, FileType};
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Attribute and entry cache timeout. The merged view only changes through
/// this daemon or an explicit rebuild, so the kernel may cache essentially
/// forever.
pub(crate) const TTL: Duration = Duration::from_secs(60 * 60 * 24 * 365);

pub(crate) const BLOCK_SIZE: u32 = 512;

/// Map std::io::Error to the closest libc error code. The raw OS error is
/// passed through verbatim when available.
pub(crate) fn io_error_to_libc(e: &io::Error) -> i32 {
    if let Some(code) = e.raw_os_error() {
        return code;
    }

    match e.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::InvalidData => libc::EINVAL,
        io::ErrorKind::Interrupted => libc::EINTR,
        io::ErrorKind::WriteZero => libc::ENOSPC,
        io::ErrorKind::Unsupported => libc::ENOTSUP,
        _ => libc::EIO,
    }
}

/// Directory attributes: fixed 0755, owned by the mount's process.
pub(crate) fn dir_attr(ino: u64, uid: u32, gid: u32) -> FileAttr {
    FileAttr {
        ino,
        size: 0,
        blocks: 0,
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        crtime: UNIX_EPOCH,
        kind: FileType::Directory,
        perm: 0o755,
        nlink: 2,
        uid,
        gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

/// File attributes: fixed 0644, size and mtime from the file reference.
pub(crate) fn file_attr(ino: u64, uid: u32, gid: u32, size: u64, mtime: SystemTime) -> FileAttr {
    FileAttr {
        ino,
        size,
        blocks: size.div_ceil(BLOCK_SIZE as u64),
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind: FileType::RegularFile,
        perm: 0o644,
        nlink: 1,
        uid,
        gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}
