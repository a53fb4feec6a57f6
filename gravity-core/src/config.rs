use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

pub const API_URL_ENV: &str = "GRAVITY_API_URL";
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Base URL of the analysis/summarization service.
    pub api_url: String,
    pub highlight_color: String,
    /// How long to let a render settle before aligning highlights.
    pub settle_delay_ms: u64,
    /// Default target length of a summary, in words.
    pub summary_length: u32,
    /// Overrides the platform data directory for the document library.
    pub library_dir: Option<PathBuf>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000".to_string(),
            highlight_color: "yellow".to_string(),
            settle_delay_ms: 300,
            summary_length: 500,
            library_dir: None,
        }
    }
}

impl ReaderConfig {
    pub fn project_dirs() -> Option<ProjectDirs> {
        ProjectDirs::from("net", "gravityreader", "gravityreader")
    }

    /// Reads `path` when it exists, falling back to defaults, then applies
    /// environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {:?}", path))?;
            Self::from_toml_str(&raw)
                .with_context(|| format!("failed to parse config file {:?}", path))?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(API_URL_ENV).filter(|url| !url.trim().is_empty()) {
            self.api_url = url;
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let config = ReaderConfig::from_toml_str(
            r##"
            highlight_color = "#ffeb3b"
            settle_delay_ms = 0
            "##,
        )
        .unwrap();
        assert_eq!(config.highlight_color, "#ffeb3b");
        assert_eq!(config.settle_delay(), Duration::ZERO);
        assert_eq!(config.api_url, ReaderConfig::default().api_url);
        assert_eq!(config.summary_length, 500);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let mut config = ReaderConfig::load(&dir.path().join(CONFIG_FILE)).unwrap();
        config.api_url = ReaderConfig::default().api_url;
        assert_eq!(config, ReaderConfig::default());
    }

    #[test]
    fn env_override_replaces_api_url() {
        let mut config = ReaderConfig::default();
        config.apply_overrides(|key| (key == API_URL_ENV).then(|| "http://api.test".to_string()));
        assert_eq!(config.api_url, "http://api.test");

        config.apply_overrides(|_| Some("  ".to_string()));
        assert_eq!(config.api_url, "http://api.test");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "settle_delay_ms = \"soon\"").unwrap();
        assert!(ReaderConfig::load(&path).is_err());
    }
}
