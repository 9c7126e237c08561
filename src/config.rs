//! Configuration management
//!
//! `config.toml` in the platform config directory; every field has a
//! default so partial files load. A few settings can be overridden from
//! the environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::board::BoardConfig;
use crate::matching::MatcherConfig;
use crate::server::ServerConfig;
use crate::sync::SyncConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Local snapshot location
    #[serde(default)]
    pub store: StoreConfig,
    /// Collective store sync
    #[serde(default)]
    pub sync: SyncConfig,
    /// Relevance ranking
    #[serde(default)]
    pub matcher: MatcherConfig,
    /// Problem board
    #[serde(default)]
    pub board: BoardConfig,
    /// HTTP tool server
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Overrides the platform data directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_snapshot_file")]
    pub snapshot_file: String,
}

fn default_snapshot_file() -> String {
    "knowledge.json".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            snapshot_file: default_snapshot_file(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&config_path()?)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Load configuration from `path`, writing defaults there if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .context("Failed to read config file")?;
            let config: Config = toml::from_str(&contents)
                .context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let parent = path.parent()
            .context("Config path has no parent")?;
        std::fs::create_dir_all(parent)
            .context("Failed to create config directory")?;

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .context("Failed to write config file")?;
        Ok(())
    }

    /// Apply `COLLECTIVE_BASE_URL` and `COLLECTIVE_DATA_DIR`
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("COLLECTIVE_BASE_URL").filter(|v| !v.trim().is_empty()) {
            self.sync.base_url = url.trim().to_string();
        }
        if let Some(dir) = var("COLLECTIVE_DATA_DIR").filter(|v| !v.trim().is_empty()) {
            self.store.data_dir = Some(PathBuf::from(dir.trim()));
        }
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.store.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => data_dir(),
        }
    }

    pub fn snapshot_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(&self.store.snapshot_file))
    }
}

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "collective-memory", "collective-memory")
        .context("Failed to get project directories")
}

/// Get the configuration directory path
pub fn config_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().to_path_buf())
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Get the data directory path
pub fn data_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

/// Show current configuration
pub fn show_config() -> Result<()> {
    let config = Config::load()?;
    println!("# {}", config_path()?.display());
    println!("{}", toml::to_string_pretty(&config).context("Failed to serialize config")?);
    println!("# snapshot: {}", config.snapshot_path()?.display());
    Ok(())
}

/// Set the collective store endpoint
pub fn set_base_url(url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url).with_context(|| format!("Invalid URL: {}", url))?;
    let mut config = Config::load_from(&config_path()?)?;
    config.sync.base_url = parsed.as_str().trim_end_matches('/').to_string();
    config.save()?;
    println!("Collective endpoint set to {}", config.sync.base_url);
    Ok(())
}

/// Turn background sync on or off
pub fn set_sync_enabled(enabled: bool) -> Result<()> {
    let mut config = Config::load_from(&config_path()?)?;
    config.sync.enabled = enabled;
    config.save()?;
    println!("Sync {}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}

/// Store an API key in the keyring and identity file
pub fn set_api_key(key: &str) -> Result<()> {
    let path = crate::security::identity_path(&config_dir()?);
    let mut identity = crate::security::Identity::load_or_create(&path)?;
    identity.set_api_key(&path, key.trim())?;
    println!("API key stored securely.");
    Ok(())
}

/// Forget the API key; sync falls back to anonymous mode
pub fn clear_api_key() -> Result<()> {
    crate::security::keyring::delete_api_key();
    let path = crate::security::identity_path(&config_dir()?);
    let mut identity = crate::security::Identity::load_or_create(&path)?;
    identity.api_key = None;
    identity.save(&path)?;
    println!("API key removed.");
    Ok(())
}

/// Reset configuration to defaults
pub fn reset_config() -> Result<()> {
    let config = Config::default();
    config.save()?;
    println!("Configuration reset to defaults.");
    Ok(())
}

/// Get default configuration as TOML string
pub fn default_config_toml() -> String {
    let config = Config::default();
    toml::to_string_pretty(&config).unwrap_or_else(|_| "# Default configuration\n".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.sync.enabled);
        assert_eq!(config.sync.interval_secs, 300);
        assert_eq!(config.store.snapshot_file, "knowledge.json");
        assert_eq!(config.matcher.default_limit, 5);
        assert!((config.board.solution_threshold - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [sync]
            interval_secs = 60

            [matcher.weights]
            tag = 0.7
            "#,
        ).unwrap();
        assert_eq!(config.sync.interval_secs, 60);
        assert_eq!(config.sync.max_backoff_secs, 3600);
        assert!((config.matcher.weights.tag - 0.7).abs() < f64::EPSILON);
        assert!((config.matcher.weights.lexical - 0.35).abs() < f64::EPSILON);
    }

    #[test]
    fn test_load_from_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.server.port, Config::load_from(&path).unwrap().server.port);
    }

    #[test]
    fn test_default_toml_round_trips() {
        let parsed: Config = toml::from_str(&default_config_toml()).unwrap();
        assert_eq!(parsed.sync.base_url, Config::default().sync.base_url);
    }

    #[test]
    fn test_environment_overrides() {
        let mut config = Config::default();
        config.apply_overrides(|name| match name {
            "COLLECTIVE_BASE_URL" => Some("http://localhost:9000".into()),
            "COLLECTIVE_DATA_DIR" => Some("/tmp/collective".into()),
            _ => None,
        });
        assert_eq!(config.sync.base_url, "http://localhost:9000");
        assert_eq!(config.snapshot_path().unwrap(), PathBuf::from("/tmp/collective/knowledge.json"));
    }
}
