use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// On-disk layout for projection tests: a fake game install plus an
/// instance directory holding overwrite, staging and mods.
pub struct GameFixture {
    pub tmp: TempDir,
    pub game_dir: PathBuf,
    pub data_dir: PathBuf,
    pub overwrite_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub mods_root: PathBuf,
}

#[allow(dead_code)]
impl GameFixture {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let game_dir = tmp.path().join("SkyrimSE");
        let data_dir = game_dir.join("Data");
        let instance = tmp.path().join("instance");
        let overwrite_dir = instance.join("overwrite");
        let staging_dir = instance.join("VFS_staging");
        let mods_root = instance.join("mods");

        fs::create_dir_all(&data_dir).unwrap();
        fs::create_dir_all(&overwrite_dir).unwrap();
        fs::create_dir_all(&mods_root).unwrap();

        GameFixture {
            tmp,
            game_dir,
            data_dir,
            overwrite_dir,
            staging_dir,
            mods_root,
        }
    }

    pub fn write_base(&self, relative: &str, bytes: &[u8]) {
        write_file(&self.data_dir.join(relative), bytes);
    }

    pub fn write_overwrite(&self, relative: &str, bytes: &[u8]) {
        write_file(&self.overwrite_dir.join(relative), bytes);
    }

    pub fn add_mod(&self, name: &str, files: &[(&str, &[u8])]) -> (String, PathBuf) {
        let mod_dir = self.mods_root.join(name);
        for (relative, bytes) in files {
            write_file(&mod_dir.join(relative), bytes);
        }
        (name.to_string(), mod_dir)
    }
}

pub fn write_file(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, bytes).unwrap();
}
