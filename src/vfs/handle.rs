use std::cell::RefCell;
use std::path::PathBuf;

thread_local! {
    pub(crate) static READ_BUFFER: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(128 * 1024));
}

/// State for one open file handle. Handles carry their own resolved path so
/// they survive tree swaps; a copy-on-write rebinds `real_path` to the
/// staging copy and clears `is_backing`.
#[derive(Debug, Clone)]
pub(crate) struct OpenFile {
    /// Relative when `is_backing`, absolute otherwise.
    pub real_path: PathBuf,
    /// Virtual path within the projection.
    pub relative_path: String,
    pub writable: bool,
    pub is_backing: bool,
}
