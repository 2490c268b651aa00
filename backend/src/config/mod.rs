//! Configuration management

mod settings;

pub use settings::*;

use anyhow::Result;
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Settings shared between the queue, the server and the composition root.
/// The queue reads a fresh snapshot on every scheduling pass.
pub type SharedSettings = Arc<RwLock<Settings>>;

/// Get the configuration directory path
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("media-downloader")
}

/// Get the configuration file path
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load configuration from file or create default
pub fn load_or_create_default() -> Result<Settings> {
    load_or_create_at(&config_path())
}

/// Load configuration from a specific file, writing defaults if it is missing
pub fn load_or_create_at(path: &Path) -> Result<Settings> {
    if path.exists() {
        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    } else {
        let settings = Settings::default();
        save_to(&settings, path)?;
        Ok(settings)
    }
}

/// Save configuration to a specific file
pub fn save_to(settings: &Settings, path: &Path) -> Result<()> {
    // Ensure config directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let content = toml::to_string_pretty(settings)?;
    fs::write(path, content)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_defaults_then_reads_them_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let created = load_or_create_at(&path).unwrap();
        assert!(path.exists());

        let mut edited = created.clone();
        edited.downloads.max_concurrent = 7;
        save_to(&edited, &path).unwrap();

        let loaded = load_or_create_at(&path).unwrap();
        assert_eq!(loaded.downloads.max_concurrent, 7);
    }
}
