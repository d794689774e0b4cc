//! Last-used platform and query, remembered between runs.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// What the user browsed last.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionMemory {
    /// Platform directory of the last search.
    pub last_platform: Option<String>,
    /// Query of the last search, as typed.
    pub last_query: Option<String>,
}

impl SessionMemory {
    /// Returns the default file location, `$XDG_DATA_HOME/romfetch/memory.toml`.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("romfetch")
            .join("memory.toml")
    }

    /// Records a search.
    pub fn remember(&mut self, platform: &str, query: &str) {
        self.last_platform = Some(platform.to_string());
        self.last_query = Some(query.to_string());
    }

    /// Loads memory from `path`.
    ///
    /// A missing or unparsable file yields empty memory.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                log::warn!("Ignoring unreadable {}: {e}", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Saves memory to `path` atomically (write tmp + rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let tmp_path = path.with_extension("toml.tmp");
        let toml_str = toml::to_string(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        std::fs::write(&tmp_path, toml_str)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/memory.toml");

        let mut memory = SessionMemory::default();
        memory.remember("SNES", "zelda");
        memory.save(&path).unwrap();

        assert_eq!(SessionMemory::load(&path), memory);
        assert!(!path.with_extension("toml.tmp").exists());
    }

    #[test]
    fn missing_file_is_empty_memory() {
        let dir = tempfile::TempDir::new().unwrap();
        let loaded = SessionMemory::load(&dir.path().join("none.toml"));
        assert_eq!(loaded, SessionMemory::default());
    }

    #[test]
    fn corrupt_file_is_empty_memory() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("memory.toml");
        std::fs::write(&path, "last_platform = [").unwrap();
        assert_eq!(SessionMemory::load(&path), SessionMemory::default());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("memory.toml");
        std::fs::write(&path, "last_platform = \"GBA\"\n").unwrap();

        let loaded = SessionMemory::load(&path);
        assert_eq!(loaded.last_platform.as_deref(), Some("GBA"));
        assert_eq!(loaded.last_query, None);
    }

    #[test]
    fn default_path_is_under_data_dir() {
        let path = SessionMemory::default_path();
        assert!(path.to_string_lossy().contains("romfetch"));
    }
}
