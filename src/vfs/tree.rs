use fxhash::FxHashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

use crate::vfs::base::CachedBaseEntry;

pub const ORIGIN_BASE: &str = "_base_game";
pub const ORIGIN_OVERWRITE: &str = "Overwrite";
pub const ORIGIN_STAGING: &str = "Staging";

/// Normalize a path fragment for case-insensitive lookup.
///
/// Backslashes become forward slashes (guest software hands us Windows-style
/// paths), and the result is lowercased with a Unicode-aware case fold.
/// Display spelling is tracked separately in each directory node.
pub fn normalize_for_lookup(part: &str) -> String {
    part.chars()
        .map(|c| if c == '\\' { '/' } else { c })
        .flat_map(char::to_lowercase)
        .collect()
}

/// Split a relative path into its non-empty components, accepting either
/// slash direction.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split(['/', '\\']).filter(|s| !s.is_empty()).collect()
}

/// Where a merged file really lives on disk.
///
/// For base-game files `real_path` is *relative* to the stock data directory
/// and `is_backing` is true: the file must be opened through the backing
/// directory handle, because once the projection is live the absolute path
/// resolves back into the mount. All other layers store absolute host paths.
#[derive(Debug, Clone)]
pub struct FileRef {
    pub real_path: PathBuf,
    pub size: u64,
    pub mtime: SystemTime,
    pub origin: String,
    pub is_backing: bool,
}

#[derive(Debug, Clone)]
pub enum VfsNode {
    Directory {
        /// Children keyed by normalized name.
        children: FxHashMap<String, VfsNode>,
        /// Original spelling per normalized key. The highest-precedence
        /// insertion wins both content and casing.
        display_names: FxHashMap<String, String>,
    },
    File(FileRef),
}

impl VfsNode {
    pub fn new_directory() -> Self {
        VfsNode::Directory {
            children: FxHashMap::default(),
            display_names: FxHashMap::default(),
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, VfsNode::Directory { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self, VfsNode::File(_))
    }

    pub fn file_ref(&self) -> Option<&FileRef> {
        match self {
            VfsNode::File(file) => Some(file),
            VfsNode::Directory { .. } => None,
        }
    }

    pub fn get_child(&self, name: &str) -> Option<&VfsNode> {
        match self {
            VfsNode::Directory { children, .. } => children.get(&normalize_for_lookup(name)),
            VfsNode::File(_) => None,
        }
    }

    /// Case-insensitive descent. Returns `None` when a component is missing
    /// or a non-terminal component resolves to a file.
    pub fn resolve(&self, components: &[&str]) -> Option<&VfsNode> {
        let mut current = self;
        for part in components {
            current = current.get_child(part)?;
        }
        Some(current)
    }

    /// List children as `(display_name, node)` pairs, using the spelling of
    /// the last (highest-precedence) insertion.
    pub fn list_children(&self) -> Vec<(&str, &VfsNode)> {
        match self {
            VfsNode::Directory {
                children,
                display_names,
            } => children
                .iter()
                .map(|(key, node)| {
                    let name = display_names
                        .get(key)
                        .map(String::as_str)
                        .unwrap_or(key.as_str());
                    (name, node)
                })
                .collect(),
            VfsNode::File(_) => Vec::new(),
        }
    }

    /// Insert a file, creating intermediate directories as needed. A later
    /// insertion at the same normalized path replaces the earlier one.
    pub fn insert_file(&mut self, components: &[&str], file: FileRef) {
        let [head, tail @ ..] = components else {
            return;
        };

        if self.is_file() {
            *self = VfsNode::new_directory();
        }
        let VfsNode::Directory {
            children,
            display_names,
        } = self
        else {
            return;
        };

        let key = normalize_for_lookup(head);
        display_names.insert(key.clone(), (*head).to_string());

        if tail.is_empty() {
            children.insert(key, VfsNode::File(file));
            return;
        }

        let child = children.entry(key).or_insert_with(VfsNode::new_directory);
        if child.is_file() {
            *child = VfsNode::new_directory();
        }
        child.insert_file(tail, file);
    }

    /// Insert an empty directory, creating intermediate directories as needed.
    pub fn insert_directory(&mut self, components: &[&str]) {
        let [head, tail @ ..] = components else {
            return;
        };

        if self.is_file() {
            *self = VfsNode::new_directory();
        }
        let VfsNode::Directory {
            children,
            display_names,
        } = self
        else {
            return;
        };

        let key = normalize_for_lookup(head);
        display_names.insert(key.clone(), (*head).to_string());

        let child = children.entry(key).or_insert_with(VfsNode::new_directory);
        if child.is_file() {
            *child = VfsNode::new_directory();
        }
        child.insert_directory(tail);
    }

    /// Remove the node at `components`. Empty parent directories along the
    /// removal path are pruned up to the first non-empty ancestor.
    pub fn remove(&mut self, components: &[&str]) -> bool {
        let VfsNode::Directory {
            children,
            display_names,
        } = self
        else {
            return false;
        };
        let [head, tail @ ..] = components else {
            return false;
        };

        let key = normalize_for_lookup(head);

        if tail.is_empty() {
            if children.remove(&key).is_none() {
                return false;
            }
            display_names.remove(&key);
            return true;
        }

        let prune = {
            let Some(child) = children.get_mut(&key) else {
                return false;
            };
            if !child.remove(tail) {
                return false;
            }
            matches!(child, VfsNode::Directory { children: c, .. } if c.is_empty())
        };

        if prune {
            children.remove(&key);
            display_names.remove(&key);
        }
        true
    }
}

/// The merged view. Immutable once handed to the adapter, except for
/// surgical edits performed under the tree's writers lock; replaced
/// wholesale on rebuild.
#[derive(Debug, Clone)]
pub struct VfsTree {
    pub root: VfsNode,
    pub file_count: usize,
    pub dir_count: usize,
}

impl VfsTree {
    pub fn new() -> Self {
        VfsTree {
            root: VfsNode::new_directory(),
            file_count: 0,
            dir_count: 1,
        }
    }

    pub fn resolve_path(&self, path: &str) -> Option<&VfsNode> {
        if path.is_empty() {
            Some(&self.root)
        } else {
            self.root.resolve(&split_path(path))
        }
    }

    /// Flatten the merged view into rows for conflict inspection, sorted
    /// directories first, then by case-folded name.
    pub fn flatten(&self) -> Vec<VfsDisplayEntry> {
        let mut entries = Vec::new();
        flatten_node(&self.root, "", 0, &mut entries);
        entries
    }
}

impl Default for VfsTree {
    fn default() -> Self {
        Self::new()
    }
}

/// One row of the flattened merged view.
#[derive(Debug, Clone)]
pub struct VfsDisplayEntry {
    pub virtual_path: String,
    pub origin: String,
    pub is_directory: bool,
    pub depth: u32,
    pub size: u64,
}

fn flatten_node(node: &VfsNode, parent_path: &str, depth: u32, entries: &mut Vec<VfsDisplayEntry>) {
    let mut children = node.list_children();
    children.sort_by(|a, b| {
        b.1.is_directory()
            .cmp(&a.1.is_directory())
            .then_with(|| normalize_for_lookup(a.0).cmp(&normalize_for_lookup(b.0)))
    });

    for (name, child) in children {
        let virtual_path = if parent_path.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", parent_path, name)
        };

        match child {
            VfsNode::Directory { .. } => {
                entries.push(VfsDisplayEntry {
                    virtual_path: virtual_path.clone(),
                    origin: String::new(),
                    is_directory: true,
                    depth,
                    size: 0,
                });
                flatten_node(child, &virtual_path, depth + 1, entries);
            }
            VfsNode::File(file) => {
                entries.push(VfsDisplayEntry {
                    virtual_path,
                    origin: file.origin.clone(),
                    is_directory: false,
                    depth,
                    size: file.size,
                });
            }
        }
    }
}

/// Compose the merged tree from the cached base entries, the overwrite
/// directory and the ordered mod list.
///
/// Precedence is lowest first: base game, then overwrite, then mods in the
/// given order. Later insertions at the same normalized path win. Base
/// entries become backing references holding their relative path; overwrite
/// and mod layers are scanned live.
pub fn compose_tree(
    base_entries: &[CachedBaseEntry],
    overwrite_dir: &Path,
    mods: &[(String, PathBuf)],
) -> VfsTree {
    let mut tree = VfsTree::new();

    for entry in base_entries {
        let components = split_path(&entry.relative_path);
        if entry.is_dir {
            tree.root.insert_directory(&components);
            tree.dir_count += 1;
        } else {
            tree.root.insert_file(
                &components,
                FileRef {
                    real_path: PathBuf::from(&entry.relative_path),
                    size: entry.size,
                    mtime: entry.mtime,
                    origin: ORIGIN_BASE.to_string(),
                    is_backing: true,
                },
            );
            tree.file_count += 1;
        }
    }

    add_layer(&mut tree, overwrite_dir, ORIGIN_OVERWRITE);

    for (mod_name, mod_path) in mods {
        add_layer(&mut tree, mod_path, mod_name);
    }

    tracing::debug!(
        "composed tree: {} files, {} directories",
        tree.file_count,
        tree.dir_count
    );
    tree
}

/// Walk one source directory and merge its contents into the tree.
/// Symbolic links and unreadable entries are skipped; `meta.ini` at the
/// source root is the mod's own metadata and never projected.
fn add_layer(tree: &mut VfsTree, layer_dir: &Path, origin: &str) {
    if !layer_dir.is_dir() {
        return;
    }

    for entry in WalkDir::new(layer_dir)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let Ok(relative) = entry.path().strip_prefix(layer_dir) else {
            continue;
        };
        let relative_str = relative.to_string_lossy();
        if relative_str == "meta.ini" {
            continue;
        }

        let components = split_path(&relative_str);

        if entry.file_type().is_dir() {
            tree.root.insert_directory(&components);
            tree.dir_count += 1;
        } else if entry.file_type().is_file() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            tree.root.insert_file(
                &components,
                FileRef {
                    real_path: entry.path().to_path_buf(),
                    size: metadata.len(),
                    mtime: metadata.modified().unwrap_or(UNIX_EPOCH),
                    origin: origin.to_string(),
                    is_backing: false,
                },
            );
            tree.file_count += 1;
        }
    }
}
