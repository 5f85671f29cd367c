use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, StrataError};

/// One mod layer: a display name and the directory that provides its files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModEntry {
    pub name: String,
    pub path: PathBuf,
}

/// Everything needed to project a game: where the game lives, what its data
/// subdirectory is called, where writes end up, and the ordered mod list
/// (lowest priority first; later entries win conflicts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountProfile {
    pub game_dir: PathBuf,
    #[serde(default = "default_data_dir_name")]
    pub data_dir_name: String,
    pub overwrite_dir: PathBuf,
    #[serde(default)]
    pub mods: Vec<ModEntry>,
}

impl MountProfile {
    pub fn mods(&self) -> Vec<(String, PathBuf)> {
        self.mods
            .iter()
            .map(|m| (m.name.clone(), m.path.clone()))
            .collect()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.game_dir.join(&self.data_dir_name)
    }
}

fn default_data_dir_name() -> String {
    "Data".to_string()
}

/// Default profile location under the platform config directory.
pub fn default_profile_path() -> PathBuf {
    if let Some(project_dirs) = ProjectDirs::from("", "", "strata") {
        return project_dirs.config_dir().join("profile.toml");
    }
    PathBuf::from(".strata-profile.toml")
}

pub fn load_profile(path: Option<&Path>) -> Result<MountProfile> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_profile_path);

    let contents = std::fs::read_to_string(&path).map_err(|e| {
        StrataError::Config(format!("failed to read profile {}: {}", path.display(), e))
    })?;

    toml::from_str(&contents).map_err(|e| {
        StrataError::Config(format!("failed to parse profile {}: {}", path.display(), e))
    })
}

pub fn save_profile(path: &Path, profile: &MountProfile) -> Result<()> {
    let contents = toml::to_string_pretty(profile)
        .map_err(|e| StrataError::Config(format!("failed to serialize profile: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            StrataError::Config(format!(
                "failed to create config directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }
    std::fs::write(path, contents).map_err(|e| {
        StrataError::Config(format!("failed to write profile {}: {}", path.display(), e))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("conf/profile.toml");

        let profile = MountProfile {
            game_dir: PathBuf::from("/games/SkyrimSE"),
            data_dir_name: "Data".to_string(),
            overwrite_dir: PathBuf::from("/instance/overwrite"),
            mods: vec![ModEntry {
                name: "ModA".to_string(),
                path: PathBuf::from("/instance/mods/ModA"),
            }],
        };

        save_profile(&path, &profile).unwrap();
        let loaded = load_profile(Some(&path)).unwrap();

        assert_eq!(loaded.game_dir, profile.game_dir);
        assert_eq!(loaded.data_dir(), PathBuf::from("/games/SkyrimSE/Data"));
        assert_eq!(loaded.mods(), vec![(
            "ModA".to_string(),
            PathBuf::from("/instance/mods/ModA")
        )]);
    }

    #[test]
    fn test_data_dir_name_defaults_to_data() {
        let profile: MountProfile = toml::from_str(
            r#"
            game_dir = "/games/Oblivion"
            overwrite_dir = "/instance/overwrite"
            "#,
        )
        .unwrap();
        assert_eq!(profile.data_dir_name, "Data");
        assert!(profile.mods.is_empty());
    }

    #[test]
    fn test_load_missing_profile_is_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let result = load_profile(Some(&tmp.path().join("absent.toml")));
        assert!(matches!(result, Err(StrataError::Config(_))));
    }
}
