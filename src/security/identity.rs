//! Instance identity record
//!
//! `identity.json` holds the instance id, an optional API key and the
//! creation time. It is created on first run and written with owner-only
//! permissions.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const IDENTITY_FILE: &str = "identity.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Where the API key in use came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    Environment,
    Keyring,
    IdentityFile,
}

impl Identity {
    fn generate() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            api_key: None,
            created_at: Utc::now(),
        }
    }

    /// Read the identity at `path`, creating a fresh one if it does not exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse identity file {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate();
                identity.save(path)?;
                info!("Created instance identity {}", identity.instance_id);
                Ok(identity)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to read identity file {}", path.display())),
        }
    }

    /// Atomically write the identity with restrictive permissions
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path.parent().context("Identity path has no parent")?;
        std::fs::create_dir_all(dir).context("Failed to create identity directory")?;

        let contents = serde_json::to_vec_pretty(self).context("Failed to serialize identity")?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).context("Failed to create temporary identity file")?;
        tmp.write_all(&contents).context("Failed to write identity")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))
                .context("Failed to set file permissions")?;
        }

        tmp.persist(path).context("Failed to replace identity file")?;
        Ok(())
    }

    /// First available key: environment, then `keyring_lookup`, then this record
    pub fn resolve_api_key_with(
        &self,
        env_key: Option<String>,
        keyring_lookup: impl FnOnce() -> Option<String>,
    ) -> Option<(String, KeySource)> {
        if let Some(key) = env_key.filter(|k| !k.trim().is_empty()) {
            return Some((key.trim().to_string(), KeySource::Environment));
        }
        if let Some(key) = keyring_lookup() {
            return Some((key, KeySource::Keyring));
        }
        self.api_key.clone()
            .filter(|k| !k.trim().is_empty())
            .map(|k| (k, KeySource::IdentityFile))
    }

    /// Resolve against the real environment and OS keyring
    pub fn resolve_api_key(&self) -> Option<(String, KeySource)> {
        self.resolve_api_key_with(std::env::var("COLLECTIVE_API_KEY").ok(), super::keyring::get_api_key)
    }

    /// Remember a new key in the keyring and in the identity file
    pub fn set_api_key(&mut self, path: &Path, key: &str) -> Result<()> {
        if let Err(e) = super::keyring::set_api_key(key) {
            warn!("Keyring unavailable, storing API key in identity file only: {}", e);
        }
        self.api_key = Some(key.to_string());
        self.save(path)
    }
}

/// Default identity location inside a config directory
pub fn identity_path(config_dir: &Path) -> PathBuf {
    config_dir.join(IDENTITY_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_once_then_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = identity_path(dir.path());
        let first = Identity::load_or_create(&path).unwrap();
        let second = Identity::load_or_create(&path).unwrap();
        assert_eq!(first, second);
        assert!(uuid::Uuid::parse_str(&first.instance_id).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_identity_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = identity_path(dir.path());
        Identity::load_or_create(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_corrupt_identity_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = identity_path(dir.path());
        std::fs::write(&path, "not json").unwrap();
        assert!(Identity::load_or_create(&path).is_err());
    }

    #[test]
    fn test_key_resolution_order() {
        let identity = Identity {
            instance_id: "i".into(),
            api_key: Some("from-file".into()),
            created_at: Utc::now(),
        };

        let env = identity.resolve_api_key_with(Some("from-env".into()), || Some("from-keyring".into()));
        assert_eq!(env, Some(("from-env".to_string(), KeySource::Environment)));

        let keyring = identity.resolve_api_key_with(None, || Some("from-keyring".into()));
        assert_eq!(keyring, Some(("from-keyring".to_string(), KeySource::Keyring)));

        let file = identity.resolve_api_key_with(Some("  ".into()), || None);
        assert_eq!(file, Some(("from-file".to_string(), KeySource::IdentityFile)));

        let anonymous = Identity { api_key: None, ..identity };
        assert_eq!(anonymous.resolve_api_key_with(None, || None), None);
    }
}
