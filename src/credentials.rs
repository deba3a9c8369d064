//! Table-service credentials in the OS credential store.
//!
//! On Windows this uses the Credential Manager, on macOS Keychain, and on
//! Linux the kernel keyutils store (via the `keyring` crate), so the anon key
//! never sits in the local JSON store.

use keyring::Entry;
use tracing::{info, warn};

use crate::config::RemoteConfig;

const SERVICE_NAME: &str = "point-art-hub";

pub const KEY_SERVICE_URL: &str = "service_url";
pub const KEY_ANON_KEY: &str = "service_anon_key";

const ALL_KEYS: &[&str] = &[KEY_SERVICE_URL, KEY_ANON_KEY];

/// Retrieve a single credential. Returns `None` when the entry does not
/// exist or the platform store is unavailable.
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Delete a credential. Silently succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

/// Both the service URL and anon key are stored.
pub fn is_configured() -> bool {
    ALL_KEYS.iter().all(|key| get_credential(key).is_some())
}

/// Persist resolved credentials so later starts need no environment.
pub fn store_remote_config(config: &RemoteConfig) -> Result<(), String> {
    if config.url.trim().is_empty() || config.anon_key.trim().is_empty() {
        return Err("Missing required field: url or anon key".to_string());
    }
    set_credential(KEY_SERVICE_URL, &config.url)?;
    set_credential(KEY_ANON_KEY, config.anon_key.as_str())?;
    info!(url = %config.url, "table service credentials stored");
    Ok(())
}

/// Delete every stored credential.
pub fn clear_all() -> Result<(), String> {
    info!("clearing table service credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}
