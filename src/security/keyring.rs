//! OS keyring access for the collective API key
//! The identity file is the fallback when no keyring is available

use anyhow::{Context, Result};

const SERVICE_NAME: &str = "collective-memory";
const API_KEY_USERNAME: &str = "collective-api-key";

/// Store the API key in the OS keyring
pub fn set_api_key(key: &str) -> Result<()> {
    let entry = keyring::Entry::new(SERVICE_NAME, API_KEY_USERNAME)
        .context("Keyring unavailable")?;
    entry.set_password(key).context("Failed to store API key in keyring")?;
    Ok(())
}

/// API key from the OS keyring, if one is stored
pub fn get_api_key() -> Option<String> {
    let entry = keyring::Entry::new(SERVICE_NAME, API_KEY_USERNAME).ok()?;
    entry.get_password()
        .ok()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
}

/// Remove the API key from the OS keyring
pub fn delete_api_key() {
    if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, API_KEY_USERNAME) {
        let _ = entry.delete_credential();
    }
}
