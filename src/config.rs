//! Runtime configuration.
//!
//! [`SyncConfig`] carries engine tuning and has serde defaults, so a partial
//! JSON document or an empty environment yields a working setup.
//! [`RemoteConfig`] holds the table-service URL and anon key, resolved from
//! the environment, a connection string, or the OS credential store.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::credentials;
use crate::error::RemoteError;

pub const ENV_DATA_DIR: &str = "POINT_ART_HUB_DATA_DIR";
pub const ENV_SYNC_INTERVAL: &str = "POINT_ART_HUB_SYNC_INTERVAL";
pub const ENV_CLEAR_POLICY: &str = "POINT_ART_HUB_CLEAR_POLICY";
pub const ENV_SERVICE_URL: &str = "POINT_ART_HUB_URL";
pub const ENV_ANON_KEY: &str = "POINT_ART_HUB_ANON_KEY";
pub const ENV_CONNECTION: &str = "POINT_ART_HUB_CONNECTION";

const APP_DIR_NAME: &str = "com.pointarthub.sync";

/// What happens to a category's offline list once a sync pass finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearPolicy {
    /// Clear the whole list, even when some queue entries failed and remain
    /// queued. The pending view can then under-report.
    #[default]
    Unconditional,
    /// Keep records whose queue entry is still pending.
    SyncedOnly,
}

impl ClearPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "unconditional" | "all" => Some(ClearPolicy::Unconditional),
            "synced_only" | "synced-only" | "synced" => Some(ClearPolicy::SyncedOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub sync_interval_secs: u64,
    pub request_timeout_secs: u64,
    /// Poll the service for reachability every N seconds; `None` trusts the
    /// reported connectivity alone.
    pub probe_interval_secs: Option<u64>,
    pub clear_policy: ClearPolicy,
    /// Send `client_ref` as the conflict target so replays never duplicate.
    pub upsert_on_client_ref: bool,
    pub cache_version: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            sync_interval_secs: 15,
            request_timeout_secs: 30,
            probe_interval_secs: None,
            clear_policy: ClearPolicy::Unconditional,
            upsert_on_client_ref: true,
            cache_version: "v1".to_string(),
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `POINT_ART_HUB_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            if !dir.trim().is_empty() {
                config.data_dir = PathBuf::from(dir.trim());
            }
        }
        if let Ok(raw) = std::env::var(ENV_SYNC_INTERVAL) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.sync_interval_secs = secs,
                _ => warn!(value = %raw, "ignoring invalid {ENV_SYNC_INTERVAL}"),
            }
        }
        if let Ok(raw) = std::env::var(ENV_CLEAR_POLICY) {
            match ClearPolicy::parse(&raw) {
                Some(policy) => config.clear_policy = policy,
                None => warn!(value = %raw, "ignoring invalid {ENV_CLEAR_POLICY}"),
            }
        }

        config
    }

    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(value: &Value) -> Result<Self, String> {
        serde_json::from_value(value.clone()).map_err(|e| format!("Invalid sync config: {e}"))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Platform data directory for the engine.
pub fn default_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join(APP_DIR_NAME)
}

// ---------------------------------------------------------------------------
// Remote service credentials
// ---------------------------------------------------------------------------

pub struct RemoteConfig {
    pub url: String,
    pub anon_key: Zeroizing<String>,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("url", &self.url)
            .field("anon_key", &"<redacted>")
            .finish()
    }
}

impl RemoteConfig {
    pub fn new(url: &str, anon_key: &str) -> Self {
        Self {
            url: normalize_service_url(url),
            anon_key: Zeroizing::new(anon_key.trim().to_string()),
        }
    }

    /// Resolve credentials: explicit env vars, then a connection string in
    /// the environment, then the OS credential store.
    pub fn resolve() -> Result<Self, RemoteError> {
        let env_url = non_empty_env(ENV_SERVICE_URL);
        let env_key = non_empty_env(ENV_ANON_KEY);
        if let (Some(url), Some(key)) = (env_url, env_key) {
            info!("table service credentials loaded from environment");
            return Ok(Self::new(&url, &key));
        }

        if let Some(raw) = non_empty_env(ENV_CONNECTION) {
            if let Some(config) = Self::from_connection_string(&raw) {
                info!("table service credentials loaded from connection string");
                return Ok(config);
            }
            warn!("{ENV_CONNECTION} is set but could not be decoded");
        }

        match (
            credentials::get_credential(credentials::KEY_SERVICE_URL),
            credentials::get_credential(credentials::KEY_ANON_KEY),
        ) {
            (Some(url), Some(key)) if !url.trim().is_empty() && !key.trim().is_empty() => {
                info!("table service credentials loaded from credential store");
                Ok(Self::new(&url, &key))
            }
            _ => Err(RemoteError::NotConfigured),
        }
    }

    /// Decode `{"url": ..., "key": ...}`, either as raw JSON or base64
    /// (standard or URL-safe, padding optional).
    pub fn from_connection_string(raw: &str) -> Option<Self> {
        let payload = decode_connection_string_payload(raw)?;
        let url = payload
            .get("url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())?;
        let key = payload
            .get("key")
            .or_else(|| payload.get("anonKey"))
            .or_else(|| payload.get("anon_key"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())?;
        Some(Self::new(url, key))
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

/// Normalise the service URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
pub fn normalize_service_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/rest/v1") {
        url.truncate(url.len() - "/rest/v1".len());
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}
