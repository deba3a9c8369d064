//! Hosted table service client.
//!
//! The service exposes a PostgREST-style interface: `POST {url}/rest/v1/{table}`
//! with the project's anon key in both `apikey` and `Authorization` headers.
//! [`RemoteTables`] is the seam the reconciler depends on; [`RestClient`] is
//! the production implementation.

use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::RemoteConfig;
use crate::error::RemoteError;

/// Column the remote tables use to deduplicate replays.
pub const CLIENT_REF_COLUMN: &str = "client_ref";

/// Timeout used for the lightweight reachability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Insert access to the remote sale tables.
pub trait RemoteTables: Send + Sync + 'static {
    /// Insert `row` into `table`. `client_ref` identifies the sale across
    /// replays.
    fn insert(
        &self,
        table: &str,
        row: Value,
        client_ref: Uuid,
    ) -> impl Future<Output = Result<Value, RemoteError>> + Send;

    /// Whether the service currently answers. Implementations without a
    /// cheap check report reachable.
    fn probe(&self) -> impl Future<Output = bool> + Send {
        async { true }
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a typed remote error.
fn friendly_error(url: &str, err: &reqwest::Error) -> RemoteError {
    if err.is_connect() {
        return RemoteError::Unreachable(url.to_string());
    }
    if err.is_timeout() {
        return RemoteError::Timeout(url.to_string());
    }
    if err.is_builder() {
        return RemoteError::Transport(format!("invalid service URL: {url}"));
    }
    RemoteError::Transport(err.to_string())
}

/// Human-readable message for an HTTP status code.
fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Anon key is invalid or expired".to_string(),
        403 => "Row-level security rejected the insert".to_string(),
        404 => "Table not found".to_string(),
        409 => "Row conflicts with an existing record".to_string(),
        s if s >= 500 => "Table service error".to_string(),
        _ => "Unexpected response from table service".to_string(),
    }
}

/// Build a status error, preferring the service's own message when the body
/// carries one.
fn status_error(status: StatusCode, body_text: &str) -> RemoteError {
    let message = serde_json::from_str::<Value>(body_text)
        .ok()
        .and_then(|json| {
            json.get("message")
                .or_else(|| json.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| {
            let trimmed = body_text.trim();
            if trimmed.is_empty() {
                status_message(status)
            } else {
                format!("{}: {trimmed}", status_message(status))
            }
        });
    RemoteError::Status {
        status: status.as_u16(),
        message,
    }
}

// ---------------------------------------------------------------------------
// REST client
// ---------------------------------------------------------------------------

pub struct RestClient {
    config: RemoteConfig,
    client: Client,
    upsert_on_client_ref: bool,
}

impl RestClient {
    pub fn new(
        config: RemoteConfig,
        timeout: Duration,
        upsert_on_client_ref: bool,
    ) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Transport(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            config,
            client,
            upsert_on_client_ref,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.config.url
    }

    /// Full insert URL for `table`, with the conflict target when replays
    /// are deduplicated.
    pub fn insert_url(&self, table: &str) -> String {
        let base = format!("{}/rest/v1/{table}", self.config.url);
        if self.upsert_on_client_ref {
            format!("{base}?on_conflict={CLIENT_REF_COLUMN}")
        } else {
            base
        }
    }

    /// `Prefer` header value for inserts.
    pub fn prefer_header(&self) -> &'static str {
        if self.upsert_on_client_ref {
            "return=representation,resolution=ignore-duplicates"
        } else {
            "return=representation"
        }
    }

    async fn post_row(&self, table: &str, row: Value, client_ref: Uuid) -> Result<Value, RemoteError> {
        let url = self.insert_url(table);
        let key = self.config.anon_key.as_str();

        let start = Instant::now();
        let resp = self
            .client
            .post(&url)
            .header("apikey", key)
            .header("Authorization", format!("Bearer {key}"))
            .header("Content-Type", "application/json")
            .header("Prefer", self.prefer_header())
            .json(&row)
            .send()
            .await
            .map_err(|e| friendly_error(&self.config.url, &e))?;

        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();
        debug!(
            table,
            client_ref = %client_ref,
            status = status.as_u16(),
            latency_ms = start.elapsed().as_millis() as u64,
            "remote insert finished"
        );

        if !status.is_success() {
            return Err(status_error(status, &body_text));
        }
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| RemoteError::InvalidBody(e.to_string()))
    }
}

impl RemoteTables for RestClient {
    async fn insert(&self, table: &str, row: Value, client_ref: Uuid) -> Result<Value, RemoteError> {
        self.post_row(table, row, client_ref).await
    }

    async fn probe(&self) -> bool {
        let url = format!("{}/rest/v1/", self.config.url);
        let key = self.config.anon_key.as_str();
        match self
            .client
            .head(&url)
            .timeout(PROBE_TIMEOUT)
            .header("apikey", key)
            .send()
            .await
        {
            Ok(resp) => {
                let reachable = !resp.status().is_server_error();
                info!(status = resp.status().as_u16(), reachable, "table service probe");
                reachable
            }
            Err(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------
