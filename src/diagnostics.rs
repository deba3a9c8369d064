//! Diagnostics for the sync engine.
//!
//! Provides:
//! - **Logging setup**: console + daily rolling file via `tracing-subscriber`
//!   and `tracing-appender`, with pruning of old log files. Set
//!   `POINT_ART_HUB_LOG_FORMAT=json` for one JSON object per line in the file.
//! - **About info**: version, build timestamp, git SHA, platform.

use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

const LOG_FILE_PREFIX: &str = "sync";
const DEFAULT_FILTER: &str = "info,point_art_hub_sync=debug";

pub const ENV_LOG_FORMAT: &str = "POINT_ART_HUB_LOG_FORMAT";

/// Whether the file layer should emit JSON lines.
fn is_json_format(raw: Option<&str>) -> bool {
    raw.map(|v| v.trim().eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Log directory under the engine's data directory.
pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Install the global subscriber (console + rolling file).
///
/// The returned guard flushes the file writer when dropped; keep it alive
/// for the lifetime of the process. Fails if a subscriber is already set.
pub fn init_logging(data_dir: &Path) -> Result<WorkerGuard, String> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let dir = log_dir(data_dir);
    fs::create_dir_all(&dir).map_err(|e| format!("Failed to create log dir: {e}"))?;
    prune_old_logs(&dir);

    let file_appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let json = is_json_format(std::env::var(ENV_LOG_FORMAT).ok().as_deref());
    let (text_file_layer, json_file_layer) = if json {
        let layer = fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_target(true);
        (None, Some(layer))
    } else {
        let layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true);
        (Some(layer), None)
    };
    let console_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(text_file_layer)
        .with(json_file_layer)
        .try_init()
        .map_err(|e| format!("Failed to install log subscriber: {e}"))?;

    Ok(guard)
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs(dir: &Path) {
    if !dir.exists() {
        return;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|name| name.starts_with(&format!("{LOG_FILE_PREFIX}.")))
                .unwrap_or(false);
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Sort newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

/// Returns version, build timestamp, git SHA, and platform info.
pub fn get_about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_about_info_has_required_fields() {
        let info = get_about_info();
        assert!(info.get("version").is_some());
        assert!(info.get("buildTimestamp").is_some());
        assert!(info.get("gitSha").is_some());
        assert!(info.get("platform").is_some());
    }

    #[test]
    fn test_prune_keeps_newest_files() {
        let dir = std::env::temp_dir().join(format!("log_prune_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        for day in 0..(MAX_LOG_FILES + 3) {
            std::fs::write(dir.join(format!("sync.2026-01-{:02}", day + 1)), b"x").unwrap();
        }
        std::fs::write(dir.join("unrelated.txt"), b"keep").unwrap();

        prune_old_logs(&dir);

        let remaining: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("sync."))
            .collect();
        assert_eq!(remaining.len(), MAX_LOG_FILES);
        assert!(dir.join("unrelated.txt").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_log_format_selection() {
        assert!(is_json_format(Some("json")));
        assert!(is_json_format(Some(" JSON ")));
        assert!(!is_json_format(Some("text")));
        assert!(!is_json_format(None));
    }

    #[test]
    fn test_log_dir_is_under_data_dir() {
        let base = Path::new("/var/lib/pah");
        assert_eq!(log_dir(base), PathBuf::from("/var/lib/pah/logs"));
    }
}
