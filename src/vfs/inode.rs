use fxhash::FxHashMap;

use crate::vfs::tree::normalize_for_lookup;

/// Bijection between stable inode numbers and canonical relative paths.
///
/// Inode 1 is the root (empty path). Ids are allocated monotonically and
/// never reused; the table outlives tree rebuilds so a path keeps its inode
/// across `rebuild` and `flush_staging_live`. On rename the affected entries
/// are rewritten in place, preserving their ids.
#[derive(Debug)]
pub struct InodeTable {
    path_to_inode: FxHashMap<String, u64>,
    inode_to_path: FxHashMap<u64, String>,
    next_inode: u64,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = InodeTable {
            path_to_inode: FxHashMap::default(),
            inode_to_path: FxHashMap::default(),
            // 2 because FUSE reserves inode 1 for the root directory
            next_inode: 2,
        };
        table.path_to_inode.insert(String::new(), 1);
        table.inode_to_path.insert(1, String::new());
        table
    }

    /// Return the existing inode for a path or allocate a new one.
    pub fn get_or_create(&mut self, path: &str) -> u64 {
        let key = normalize_key(path);
        if let Some(&ino) = self.path_to_inode.get(&key) {
            return ino;
        }

        let ino = self.next_inode;
        self.next_inode += 1;
        self.path_to_inode.insert(key, ino);
        self.inode_to_path.insert(ino, canonicalize_path(path));
        ino
    }

    /// Canonical path for an inode; the root maps to the empty string.
    pub fn path_of(&self, ino: u64) -> Option<&str> {
        self.inode_to_path.get(&ino).map(String::as_str)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.path_to_inode.len()
    }

    /// Rewrite the entry for `old_path` and every descendant so the inodes
    /// follow the rename. O(entries): every key is inspected once.
    pub fn rename(&mut self, old_path: &str, new_path: &str) {
        let old_key = normalize_key(old_path);
        let new_key = normalize_key(new_path);
        let new_canonical = canonicalize_path(new_path);

        if let Some(ino) = self.path_to_inode.remove(&old_key) {
            self.path_to_inode.insert(new_key.clone(), ino);
            self.inode_to_path.insert(ino, new_canonical.clone());
        }

        let prefix = format!("{}/", old_key);
        let descendants: Vec<(String, u64)> = self
            .path_to_inode
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, &ino)| (key.clone(), ino))
            .collect();

        for (key, ino) in descendants {
            let suffix_key = &key[prefix.len()..];
            let next_key = if new_key.is_empty() {
                suffix_key.to_string()
            } else {
                format!("{}/{}", new_key, suffix_key)
            };
            self.path_to_inode.remove(&key);
            self.path_to_inode.insert(next_key, ino);

            // Preserve the descendant's own casing below the renamed prefix.
            if let Some(stored) = self.inode_to_path.get(&ino) {
                let old_components = split_count(&old_key);
                let tail: Vec<&str> = stored
                    .split('/')
                    .skip(old_components)
                    .collect();
                let rewritten = if new_canonical.is_empty() {
                    tail.join("/")
                } else {
                    format!("{}/{}", new_canonical, tail.join("/"))
                };
                self.inode_to_path.insert(ino, rewritten);
            }
        }
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

fn split_count(path: &str) -> usize {
    path.split('/').filter(|s| !s.is_empty()).count()
}

/// Case-folded key used for lookups.
fn normalize_key(path: &str) -> String {
    normalize_for_lookup(path.trim_matches(['/', '\\']))
}

/// Canonical stored form: forward slashes, no surrounding slashes, original
/// casing preserved.
fn canonicalize_path(path: &str) -> String {
    path.replace('\\', "/").trim_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_is_inode_one() {
        let mut table = InodeTable::new();
        assert_eq!(table.path_of(1), Some(""));
        assert_eq!(table.get_or_create(""), 1);
    }

    #[test]
    fn test_allocation_is_monotonic_and_stable() {
        let mut table = InodeTable::new();
        let a = table.get_or_create("Textures/Armor.dds");
        let b = table.get_or_create("Meshes/x.nif");
        assert_eq!(a, 2);
        assert_eq!(b, 3);
        assert_eq!(table.get_or_create("Textures/Armor.dds"), a);
        assert_eq!(table.path_of(a), Some("Textures/Armor.dds"));
    }

    #[test]
    fn test_case_and_slash_variants_share_an_inode() {
        let mut table = InodeTable::new();
        let a = table.get_or_create("Textures/Armor.dds");
        assert_eq!(table.get_or_create("textures/armor.dds"), a);
        assert_eq!(table.get_or_create("Textures\\Armor.dds"), a);
        assert_eq!(table.get_or_create("/Textures/Armor.dds"), a);
    }

    #[test]
    fn test_unknown_inode_has_no_path() {
        let table = InodeTable::new();
        assert_eq!(table.path_of(99), None);
    }

    #[test]
    fn test_rename_preserves_inode() {
        let mut table = InodeTable::new();
        let ino = table.get_or_create("Foo/bar.txt");
        table.rename("Foo/bar.txt", "Baz/qux.txt");

        assert_eq!(table.get_or_create("baz/qux.txt"), ino);
        assert_eq!(table.path_of(ino), Some("Baz/qux.txt"));
        // The old path now allocates a fresh inode.
        assert_ne!(table.get_or_create("Foo/bar.txt"), ino);
    }

    #[test]
    fn test_rename_rewrites_descendants() {
        let mut table = InodeTable::new();
        let dir = table.get_or_create("SKSE");
        let nested = table.get_or_create("SKSE/Plugins/Foo.ini");
        let sibling = table.get_or_create("Scripts/a.pex");

        table.rename("SKSE", "OBSE");

        assert_eq!(table.get_or_create("OBSE"), dir);
        assert_eq!(table.get_or_create("obse/plugins/foo.ini"), nested);
        assert_eq!(table.path_of(nested), Some("OBSE/Plugins/Foo.ini"));
        // Unrelated entries are untouched.
        assert_eq!(table.path_of(sibling), Some("Scripts/a.pex"));
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_rename_keeps_descendant_casing() {
        let mut table = InodeTable::new();
        let ino = table.get_or_create("Old/MixedCase/File.TXT");
        table.rename("old", "New");
        assert_eq!(table.path_of(ino), Some("New/MixedCase/File.TXT"));
    }
}
