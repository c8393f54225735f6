//! Worker configuration.
//!
//! Built once at startup and shared by `Arc` with every handler.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use typefill_common::{RetryConfig, TypeFillError};
use url::Url;

use crate::cache::Partition;
use crate::ServiceWorkerError;

/// Which routing table the dispatcher uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchProfile {
    /// Static, dynamic and image partitions; stale-while-revalidate for
    /// everything unclassified.
    #[default]
    Full,
    /// Static and dynamic partitions only; one cache-or-fetch path for
    /// everything unclassified.
    Lite,
}

/// Defaults applied to push notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationDefaults {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    /// Where a click goes when the payload carries no URL.
    pub url: String,
    pub open_action_title: String,
    pub dismiss_action_title: String,
}

impl Default for NotificationDefaults {
    fn default() -> Self {
        Self {
            title: "TypeFill".to_string(),
            body: "Your templates are ready".to_string(),
            icon: "/icons/icon-192x192.png".to_string(),
            badge: "/icons/icon-72x72.png".to_string(),
            vibrate: vec![100, 50, 100],
            url: "/".to_string(),
            open_action_title: "Open TypeFill".to_string(),
            dismiss_action_title: "Dismiss".to_string(),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwConfig {
    /// Prefix of every partition name.
    pub cache_prefix: String,

    /// Version suffix; bumping it orphans every existing partition.
    pub version: String,

    /// Routing table.
    pub profile: DispatchProfile,

    /// Origin the worker is deployed on. Root-relative paths resolve
    /// against it.
    pub origin: Url,

    /// Document served when a navigation fails and nothing is cached.
    pub app_shell: String,

    /// Resources stored in the static partition at install time.
    pub precache: Vec<String>,

    /// Origins whose responses always go to the static partition.
    pub static_origins: Vec<String>,

    /// Upper bound on a single network fetch, in milliseconds.
    pub network_timeout_ms: u64,

    /// Retry policy for precache and bulk-seed fetches.
    pub precache_retry: RetryConfig,

    /// Request skip-waiting as soon as install succeeds. When off, a new
    /// version waits until no client is controlled or a page sends
    /// `SKIP_WAITING`.
    pub skip_waiting_on_install: bool,

    /// Sync tag that triggers the template sync broadcast.
    pub sync_tag: String,

    /// Periodic sync tag for update checks.
    pub update_check_tag: String,

    pub notifications: NotificationDefaults,
}

impl Default for SwConfig {
    fn default() -> Self {
        Self {
            cache_prefix: "typefill".to_string(),
            version: "v1".to_string(),
            profile: DispatchProfile::Full,
            origin: Url::parse("https://typefill.app/").expect("static origin is valid"),
            app_shell: "/index.html".to_string(),
            precache: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/manifest.json".to_string(),
                "/icons/icon-192x192.png".to_string(),
                "/icons/icon-512x512.png".to_string(),
                "https://cdn.tailwindcss.com".to_string(),
                "https://fonts.googleapis.com/css2?family=Inter:wght@300;400;500;600;700&display=swap"
                    .to_string(),
            ],
            static_origins: vec![
                "https://cdn.tailwindcss.com".to_string(),
                "https://fonts.googleapis.com".to_string(),
                "https://fonts.gstatic.com".to_string(),
            ],
            network_timeout_ms: 30_000,
            precache_retry: RetryConfig {
                max_attempts: 2,
                ..RetryConfig::default()
            },
            skip_waiting_on_install: true,
            sync_tag: "sync-templates".to_string(),
            update_check_tag: "update-check".to_string(),
            notifications: NotificationDefaults::default(),
        }
    }
}

impl SwConfig {
    /// Default configuration for a worker deployed on `origin`.
    pub fn for_origin(origin: Url) -> Self {
        Self {
            origin,
            ..Default::default()
        }
    }

    /// Parse a JSON configuration; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ServiceWorkerError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| TypeFillError::config_with_source("invalid worker config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file.
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ServiceWorkerError> {
        let text = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(TypeFillError::from)?;
        Self::from_json_str(&text)
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ServiceWorkerError> {
        if self.cache_prefix.is_empty() || self.version.is_empty() {
            return Err(TypeFillError::config("cache prefix and version must be non-empty").into());
        }
        if self.network_timeout_ms == 0 {
            return Err(TypeFillError::config("network timeout must be positive").into());
        }
        let retry = &self.precache_retry;
        if retry.max_attempts == 0 {
            return Err(TypeFillError::config("precache retry needs at least one attempt").into());
        }
        if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
            return Err(TypeFillError::config(format!(
                "precache backoff multiplier must be at least 1.0, got {}",
                retry.backoff_multiplier
            ))
            .into());
        }
        for origin in &self.static_origins {
            let parsed = Url::parse(origin)
                .map_err(|e| ServiceWorkerError::InvalidUrl(format!("{origin}: {e}")))?;
            if !parsed.origin().is_tuple() {
                return Err(ServiceWorkerError::InvalidUrl(format!(
                    "{origin}: not an http(s) origin"
                )));
            }
        }
        for entry in &self.precache {
            self.resolve(entry)?;
        }
        Ok(())
    }

    /// Network timeout as a duration.
    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    /// Partitions the current profile uses.
    pub fn partitions(&self) -> &'static [Partition] {
        match self.profile {
            DispatchProfile::Full => &[Partition::Static, Partition::Dynamic, Partition::Image],
            DispatchProfile::Lite => &[Partition::Static, Partition::Dynamic],
        }
    }

    /// Versioned name of a partition, e.g. `typefill-static-v1`.
    pub fn cache_name(&self, partition: Partition) -> String {
        format!("{}-{}-{}", self.cache_prefix, partition.kind(), self.version)
    }

    /// Every partition name the current version recognizes.
    pub fn recognized_cache_names(&self) -> Vec<String> {
        self.partitions()
            .iter()
            .map(|p| self.cache_name(*p))
            .collect()
    }

    /// Resolve a manifest entry or client-supplied URL against the origin.
    pub fn resolve(&self, entry: &str) -> Result<Url, ServiceWorkerError> {
        self.origin
            .join(entry)
            .map_err(|e| ServiceWorkerError::InvalidUrl(format!("{entry}: {e}")))
    }

    /// URL of the app-shell document.
    pub fn app_shell_url(&self) -> Result<Url, ServiceWorkerError> {
        self.resolve(&self.app_shell)
    }

    /// Whether `url` is served by a configured static origin. Origins are
    /// compared after parsing, so case and default ports do not matter.
    pub fn is_static_origin(&self, url: &Url) -> bool {
        let origin = url.origin();
        self.static_origins
            .iter()
            .filter_map(|o| Url::parse(o).ok())
            .any(|o| o.origin() == origin)
    }
}
