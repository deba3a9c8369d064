//! Offline response cache in front of the dashboard's own fetches.
//!
//! Static assets are served cache-first; API-like paths and navigations go
//! network-first and fall back to the cached copy when the network fails.
//! One versioned cache is live at a time; activating a new version purges
//! every other cache.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{RemoteError, StoreResult};
use crate::store::LocalStore;

pub const CACHE_PREFIX: &str = "point-art-hub-";
const CACHE_INDEX_KEY: &str = "sw_cache_index";

const API_PREFIXES: &[&str] = &["/rest/", "/auth/", "/api/", "/storage/"];
const STATIC_EXTENSIONS: &[&str] = &[
    "js", "mjs", "css", "png", "jpg", "jpeg", "gif", "svg", "ico", "webp", "woff", "woff2",
    "ttf", "webmanifest",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
    /// Bypass the cache entirely (non-GET requests, unknown resources).
    NetworkOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub method: String,
    /// Path plus query, e.g. `/rest/v1/gift_daily_sales?select=*`.
    pub path: String,
    pub navigation: bool,
}

impl FetchRequest {
    pub fn get(path: &str) -> Self {
        Self {
            method: "GET".into(),
            path: path.into(),
            navigation: false,
        }
    }

    pub fn navigate(path: &str) -> Self {
        Self {
            navigation: true,
            ..Self::get(path)
        }
    }

    fn path_only(&self) -> &str {
        self.path.split(['?', '#']).next().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(serialize_with = "body_to_base64", deserialize_with = "body_from_base64")]
    pub body: Vec<u8>,
}

impl CachedResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn body_to_base64<S: Serializer>(body: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&BASE64_STANDARD.encode(body))
}

fn body_from_base64<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
    let raw = String::deserialize(d)?;
    BASE64_STANDARD
        .decode(raw.as_bytes())
        .map_err(serde::de::Error::custom)
}

/// Pick the caching strategy for a request.
pub fn classify(request: &FetchRequest) -> Strategy {
    if !request.method.eq_ignore_ascii_case("GET") {
        return Strategy::NetworkOnly;
    }
    let path = request.path_only();
    if API_PREFIXES.iter().any(|p| path.starts_with(p)) || request.navigation {
        return Strategy::NetworkFirst;
    }
    let is_static = path.starts_with("/assets/")
        || path
            .rsplit_once('.')
            .map(|(_, ext)| STATIC_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
    if is_static {
        Strategy::CacheFirst
    } else {
        Strategy::NetworkOnly
    }
}

/// Network side of the cache.
pub trait Fetcher: Send + Sync {
    fn fetch(
        &self,
        request: &FetchRequest,
    ) -> impl Future<Output = Result<CachedResponse, RemoteError>> + Send;
}

/// Fetches from the dashboard origin over HTTP.
pub struct HttpFetcher {
    client: Client,
    origin: String,
}

impl HttpFetcher {
    pub fn new(origin: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Transport(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            origin: origin.trim_end_matches('/').to_string(),
        })
    }
}

impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<CachedResponse, RemoteError> {
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| RemoteError::Transport(format!("Invalid HTTP method: {}", request.method)))?;
        let url = format!("{}{}", self.origin, request.path);
        let resp = self.client.request(method, &url).send().await.map_err(|e| {
            if e.is_timeout() {
                RemoteError::Timeout(url.clone())
            } else if e.is_connect() {
                RemoteError::Unreachable(self.origin.clone())
            } else {
                RemoteError::Transport(e.to_string())
            }
        })?;
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp
            .bytes()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?
            .to_vec();
        Ok(CachedResponse {
            status,
            content_type,
            body,
        })
    }
}

pub struct ResponseCache {
    store: LocalStore,
    version: String,
}

impl ResponseCache {
    pub fn new(store: LocalStore, version: &str) -> Self {
        Self {
            store,
            version: version.to_string(),
        }
    }

    pub fn current_name(&self) -> String {
        format!("{CACHE_PREFIX}{}", self.version)
    }

    fn entries_key(name: &str) -> String {
        format!("sw_cache:{name}")
    }

    /// Cache names currently held.
    pub fn cache_names(&self) -> Vec<String> {
        self.store.get(CACHE_INDEX_KEY)
    }

    /// Open the current cache and seed it with `precache` entries.
    pub fn install(&self, precache: &[(String, CachedResponse)]) -> StoreResult<()> {
        let name = self.current_name();
        self.store
            .update(CACHE_INDEX_KEY, |names: &mut Vec<String>| {
                if !names.contains(&name) {
                    names.push(name.clone());
                }
                Ok(())
            })?;
        self.store.update(
            &Self::entries_key(&name),
            |entries: &mut BTreeMap<String, CachedResponse>| {
                for (path, response) in precache {
                    entries.insert(path.clone(), response.clone());
                }
                Ok(())
            },
        )?;
        info!(cache = %name, precached = precache.len(), "response cache installed");
        Ok(())
    }

    /// Purge every cache other than the current version. Returns the purged
    /// cache names.
    pub fn activate(&self) -> StoreResult<Vec<String>> {
        let current = self.current_name();
        let stale: Vec<String> = self
            .cache_names()
            .into_iter()
            .filter(|name| *name != current)
            .collect();
        for name in &stale {
            self.store.remove(&Self::entries_key(name))?;
            info!(cache = %name, "purged stale response cache");
        }
        self.store
            .update(CACHE_INDEX_KEY, |names: &mut Vec<String>| {
                names.retain(|n| *n == current);
                if names.is_empty() {
                    names.push(current.clone());
                }
                Ok(())
            })?;
        Ok(stale)
    }

    pub fn lookup(&self, path: &str) -> Option<CachedResponse> {
        let entries: BTreeMap<String, CachedResponse> =
            self.store.get(&Self::entries_key(&self.current_name()));
        entries.get(path).cloned()
    }

    /// Store a successful response under `path`; other statuses are ignored.
    pub fn put(&self, path: &str, response: &CachedResponse) -> StoreResult<()> {
        if !response.is_success() {
            return Ok(());
        }
        self.store.update(
            &Self::entries_key(&self.current_name()),
            |entries: &mut BTreeMap<String, CachedResponse>| {
                entries.insert(path.to_string(), response.clone());
                Ok(())
            },
        )
    }

    fn put_quietly(&self, path: &str, response: &CachedResponse) {
        if let Err(e) = self.put(path, response) {
            warn!(path, error = %e, "failed to cache response");
        }
    }

    /// Answer `request` according to its strategy.
    pub async fn fetch<F: Fetcher>(
        &self,
        request: &FetchRequest,
        fetcher: &F,
    ) -> Result<CachedResponse, RemoteError> {
        match classify(request) {
            Strategy::NetworkOnly => fetcher.fetch(request).await,
            Strategy::CacheFirst => {
                if let Some(hit) = self.lookup(&request.path) {
                    debug!(path = %request.path, "cache hit");
                    return Ok(hit);
                }
                let response = fetcher.fetch(request).await?;
                self.put_quietly(&request.path, &response);
                Ok(response)
            }
            Strategy::NetworkFirst => match fetcher.fetch(request).await {
                Ok(response) => {
                    self.put_quietly(&request.path, &response);
                    Ok(response)
                }
                Err(e) => match self.lookup(&request.path) {
                    Some(cached) => {
                        debug!(path = %request.path, error = %e, "network failed, serving cached copy");
                        Ok(cached)
                    }
                    None => Err(e),
                },
            },
        }
    }
}
