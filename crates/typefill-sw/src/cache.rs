//! Cache partitions and the storage that holds them.
//!
//! ```text
//! CacheStorage
//!     ├── typefill-static-v1
//!     │       └── GET url → CacheEntry
//!     ├── typefill-dynamic-v1
//!     └── typefill-images-v1
//! ```
//!
//! Only `200 OK` responses to `GET` requests are ever stored.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use typefill_common::{ResultExt, TypeFillError};
use typefill_net::{Request, Response, ResponseSource};
use url::Url;

use crate::ServiceWorkerError;

/// A logical cache partition. The stored name carries the version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    /// App shell, fonts, stylesheets, CDN scripts.
    Static,
    /// Everything else fetched at runtime.
    Dynamic,
    /// Image responses.
    Image,
}

impl Partition {
    /// Name fragment used between prefix and version.
    pub fn kind(&self) -> &'static str {
        match self {
            Partition::Static => "static",
            Partition::Dynamic => "dynamic",
            Partition::Image => "images",
        }
    }
}

/// Key under which a request is stored: the URL without its fragment.
pub fn request_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

mod base64_body {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod base64_headers {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        headers: &[(String, Vec<u8>)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let encoded: Vec<(&str, String)> = headers
            .iter()
            .map(|(name, value)| (name.as_str(), BASE64.encode(value)))
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(String, Vec<u8>)>, D::Error> {
        let encoded = Vec::<(String, String)>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(name, value)| {
                BASE64
                    .decode(value.as_bytes())
                    .map(|bytes| (name, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

/// A stored response snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response status text.
    pub status_text: String,

    /// Response headers in wire order; repeated names stay separate.
    #[serde(with = "base64_headers")]
    pub headers: Vec<(String, Vec<u8>)>,

    /// Response body.
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response for `request`. Rejects anything but a `200`
    /// response to a `GET`.
    pub fn from_response(request: &Request, response: &Response) -> Result<Self, ServiceWorkerError> {
        if request.method != Method::GET {
            return Err(ServiceWorkerError::NotCacheable(format!(
                "{} {}",
                request.method, request.url
            )));
        }
        if response.status != StatusCode::OK {
            return Err(ServiceWorkerError::NotCacheable(format!(
                "{} returned {}",
                request.url, response.status
            )));
        }

        let headers = response
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();

        Ok(Self {
            url: request_key(&request.url),
            method: Method::GET.to_string(),
            status: response.status.as_u16(),
            status_text: response.status_text.clone(),
            headers,
            body: response.body.to_vec(),
            cached_at: now_millis(),
        })
    }

    /// Rebuild a response from the snapshot.
    pub fn to_response(&self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value),
            ) {
                headers.append(n, v);
            }
        }

        let mut response = Response::new(status, Bytes::from(self.body.clone()))
            .with_status_text(self.status_text.clone())
            .with_source(ResponseSource::Cache);
        response.url = Url::parse(&self.url).ok();
        response.headers = headers;
        response
    }
}

/// One named partition.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Cached entries.
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a URL.
    pub fn match_url(&self, url: &Url) -> Option<&CacheEntry> {
        self.entries.get(&request_key(url))
    }

    /// Match a request. Only `GET` requests can hit.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        if request.method != Method::GET {
            return None;
        }
        self.match_url(&request.url)
    }

    /// Store a response, replacing any previous entry for the request.
    pub fn put(&mut self, request: &Request, response: &Response) -> Result<(), ServiceWorkerError> {
        let entry = CacheEntry::from_response(request, response)?;
        debug!(cache = %self.name, url = %entry.url, bytes = entry.body.len(), "Cache put");
        self.entries.insert(entry.url.clone(), entry);
        Ok(())
    }

    /// Delete entry.
    pub fn delete(&mut self, url: &Url) -> bool {
        self.entries.remove(&request_key(url)).is_some()
    }

    /// Get all keys (URLs).
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    /// Iterate over stored entries.
    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// On-disk form of [`CacheStorage`].
#[derive(Debug, Serialize, Deserialize)]
struct StorageSnapshot {
    format: u32,
    caches: Vec<Cache>,
}

/// Just the format tag, read before the full snapshot.
#[derive(Deserialize)]
struct SnapshotFormat {
    format: u32,
}

const SNAPSHOT_FORMAT: u32 = 2;

/// Every partition, in creation order.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
    order: Vec<String>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        if !self.caches.contains_key(name) {
            debug!(cache = %name, "Creating cache");
            self.order.push(name.to_string());
        }
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Get a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        self.order.retain(|n| n != name);
        self.caches.remove(name).is_some()
    }

    /// All cache names in creation order.
    pub fn keys(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Match a request across all caches, oldest cache first.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        self.order
            .iter()
            .filter_map(|name| self.caches.get(name))
            .find_map(|cache| cache.match_request(request))
    }

    /// Match a URL across all caches, oldest cache first.
    pub fn match_url(&self, url: &Url) -> Option<&CacheEntry> {
        self.order
            .iter()
            .filter_map(|name| self.caches.get(name))
            .find_map(|cache| cache.match_url(url))
    }

    /// Write every cache to `path` as JSON.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), ServiceWorkerError> {
        let snapshot = StorageSnapshot {
            format: SNAPSHOT_FORMAT,
            caches: self
                .order
                .iter()
                .filter_map(|name| self.caches.get(name).cloned())
                .collect(),
        };
        let json = serde_json::to_vec(&snapshot).context("serializing cache snapshot")?;

        // Write-then-rename: readers only ever see a complete snapshot.
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await.map_err(TypeFillError::from)?;
        tokio::fs::rename(&tmp, path).await.map_err(TypeFillError::from)?;

        info!(path = %path.display(), caches = snapshot.caches.len(), "Cache storage saved");
        Ok(())
    }

    /// Restore storage from a snapshot written by [`CacheStorage::save`].
    /// A missing file yields empty storage.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ServiceWorkerError> {
        let path = path.as_ref();
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No cache snapshot, starting empty");
                return Ok(Self::new());
            }
            Err(e) => return Err(TypeFillError::from(e).into()),
        };

        let SnapshotFormat { format } = serde_json::from_slice(&bytes)
            .map_err(|e| TypeFillError::cache_with_source("corrupt cache snapshot", e))?;
        if format != SNAPSHOT_FORMAT {
            warn!(format, "Unknown snapshot format, starting empty");
            return Ok(Self::new());
        }
        let snapshot: StorageSnapshot = serde_json::from_slice(&bytes)
            .map_err(|e| TypeFillError::cache_with_source("corrupt cache snapshot", e))?;

        let mut storage = Self::new();
        for cache in snapshot.caches {
            storage.order.push(cache.name.clone());
            storage.caches.insert(cache.name.clone(), cache);
        }
        info!(path = %path.display(), caches = storage.order.len(), "Cache storage loaded");
        Ok(storage)
    }
}
