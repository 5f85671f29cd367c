pub mod config;
pub mod error;
pub mod mount;
pub mod vfs;

pub use config::{load_profile, save_profile, ModEntry, MountProfile};
pub use error::{Result, StrataError};
pub use mount::{
    current_mount_point, emergency_unmount, is_mount_point, try_cleanup_stale_mount, Mapping,
    MappingEntry, MountController,
};
pub use vfs::{
    compose_tree, scan_data_dir, CachedBaseEntry, FileRef, OverwriteManager, StrataFs, VfsNode,
    VfsTree,
};
