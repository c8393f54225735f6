//! Request routing and the three retrieval strategies.
//!
//! Every intercepted request resolves to a response: network failures are
//! logged and replaced by a cached copy, the app shell, or the offline
//! fallback. Cache writes never block the response; they are handed back
//! in the [`WaitUntil`] bag.

use std::sync::Arc;

use futures::future::try_join_all;
use http::{header, HeaderValue, Method, StatusCode};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use typefill_common::{retry_with_backoff, with_timeout};
use typefill_net::{Destination, Fetcher, NetError, Request, Response, ResponseSource};
use url::Url;

use crate::cache::{CacheStorage, Partition};
use crate::config::{DispatchProfile, SwConfig};
use crate::events::{Handled, WaitUntil};
use crate::ServiceWorkerError;

/// Body of the offline fallback response.
pub const OFFLINE_BODY: &str = "Offline - Resource not available";

/// The response served when nothing else is available.
pub fn offline_fallback() -> Response {
    Response::new(StatusCode::SERVICE_UNAVAILABLE, OFFLINE_BODY)
        .with_status_text("Service Unavailable")
        .with_header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))
        .with_source(ResponseSource::Synthesized)
}

/// Strategy chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Not intercepted; the host performs its default fetch.
    PassThrough,
    CacheFirst(Partition),
    /// Always writes to the dynamic partition.
    NetworkFirst,
    /// Always writes to the dynamic partition.
    StaleWhileRevalidate,
}

/// Routes requests and runs strategies against shared cache storage.
#[derive(Clone)]
pub struct CacheDispatcher {
    config: Arc<SwConfig>,
    caches: Arc<RwLock<CacheStorage>>,
    fetcher: Arc<dyn Fetcher>,
}

impl CacheDispatcher {
    pub fn new(
        config: Arc<SwConfig>,
        caches: Arc<RwLock<CacheStorage>>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            config,
            caches,
            fetcher,
        }
    }

    pub fn config(&self) -> &SwConfig {
        &self.config
    }

    pub fn caches(&self) -> &Arc<RwLock<CacheStorage>> {
        &self.caches
    }

    /// Pick a strategy. First matching rule wins.
    pub fn route(&self, request: &Request) -> Route {
        if request.method != Method::GET || !request.is_http() {
            return Route::PassThrough;
        }

        if self.config.is_static_origin(&request.url)
            || matches!(request.destination, Destination::Style | Destination::Font)
        {
            return Route::CacheFirst(Partition::Static);
        }

        if request.destination == Destination::Image && self.config.profile == DispatchProfile::Full
        {
            return Route::CacheFirst(Partition::Image);
        }

        if request.is_navigation() {
            return Route::NetworkFirst;
        }

        match self.config.profile {
            DispatchProfile::Full => Route::StaleWhileRevalidate,
            DispatchProfile::Lite => Route::CacheFirst(Partition::Dynamic),
        }
    }

    /// Handle an intercepted request. `None` means pass through.
    pub async fn dispatch(&self, request: &Request) -> Option<Handled<Response>> {
        let route = self.route(request);
        debug!(url = %request.url, ?route, "Routing request");

        let handled = match route {
            Route::PassThrough => return None,
            Route::CacheFirst(partition) => self.cache_first(request, partition).await,
            Route::NetworkFirst => self.network_first(request).await,
            Route::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
        };
        Some(handled)
    }

    /// Serve from any partition; on miss fetch and store into `partition`.
    pub async fn cache_first(&self, request: &Request, partition: Partition) -> Handled<Response> {
        if let Some(cached) = self.lookup(request).await {
            debug!(url = %request.url, "Cache hit");
            return Handled::done(cached);
        }

        match self.fetch(request).await {
            Ok(response) => {
                let mut wait_until = WaitUntil::new();
                self.store_later(partition, request, &response, &mut wait_until);
                Handled::with(response, wait_until)
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Cache first failed");
                Handled::done(offline_fallback())
            }
        }
    }

    /// Prefer the network; fall back to any cached copy, then the app shell.
    pub async fn network_first(&self, request: &Request) -> Handled<Response> {
        match self.fetch(request).await {
            Ok(response) => {
                let mut wait_until = WaitUntil::new();
                self.store_later(Partition::Dynamic, request, &response, &mut wait_until);
                Handled::with(response, wait_until)
            }
            Err(e) => {
                info!(url = %request.url, error = %e, "Network failed, trying cache");
                if let Some(cached) = self.lookup(request).await {
                    return Handled::done(cached);
                }
                Handled::done(self.app_shell().await.unwrap_or_else(offline_fallback))
            }
        }
    }

    /// Serve the cached copy at once and refresh it in the background; on
    /// miss wait for the network.
    pub async fn stale_while_revalidate(&self, request: &Request) -> Handled<Response> {
        let mut wait_until = WaitUntil::new();

        if let Some(cached) = self.lookup(request).await {
            let this = self.clone();
            let request = request.clone();
            wait_until.push(async move { this.revalidate(request).await });
            return Handled::with(cached, wait_until);
        }

        match self.fetch(request).await {
            Ok(response) => {
                self.store_later(Partition::Dynamic, request, &response, &mut wait_until);
                Handled::with(response, wait_until)
            }
            Err(e) => {
                info!(url = %request.url, error = %e, "Revalidate failed");
                Handled::done(offline_fallback())
            }
        }
    }

    /// Fetch every URL, then store them all into `partition`. Nothing is
    /// written unless every fetch returned `200`.
    pub async fn add_all(&self, partition: Partition, urls: &[Url]) -> Result<usize, ServiceWorkerError> {
        let retry = &self.config.precache_retry;

        let fetches = urls.iter().map(|url| async move {
            let request = Request::get(url.clone());
            let req = &request;
            let response = retry_with_backoff(retry, move || async move {
                let response = self.fetch(req).await?;
                if response.status != StatusCode::OK {
                    return Err(NetError::RequestFailed(format!(
                        "{} returned {}",
                        req.url, response.status
                    )));
                }
                Ok(response)
            })
            .await
            .map_err(|e| ServiceWorkerError::Precache {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            Ok::<_, ServiceWorkerError>((request, response))
        });
        let fetched = try_join_all(fetches).await?;

        let name = self.config.cache_name(partition);
        let mut storage = self.caches.write().await;
        let cache = storage.open(&name);
        for (request, response) in &fetched {
            cache.put(request, response)?;
        }
        info!(cache = %name, count = fetched.len(), "Stored resources");
        Ok(fetched.len())
    }

    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let timeout = self.config.network_timeout();
        with_timeout(timeout, || self.fetcher.fetch(request)).await?
    }

    async fn lookup(&self, request: &Request) -> Option<Response> {
        let storage = self.caches.read().await;
        storage.match_request(request).map(|entry| entry.to_response())
    }

    async fn app_shell(&self) -> Option<Response> {
        let url = self.config.app_shell_url().ok()?;
        let storage = self.caches.read().await;
        let shell = storage.match_url(&url).map(|entry| entry.to_response());
        if shell.is_none() {
            warn!(url = %url, "App shell not cached");
        }
        shell
    }

    async fn revalidate(&self, request: Request) {
        match self.fetch(&request).await {
            Ok(response) => self.store(Partition::Dynamic, &request, &response).await,
            Err(e) => info!(url = %request.url, error = %e, "Revalidate failed"),
        }
    }

    async fn store(&self, partition: Partition, request: &Request, response: &Response) {
        if response.status != StatusCode::OK {
            return;
        }
        let name = self.config.cache_name(partition);
        let mut storage = self.caches.write().await;
        if let Err(e) = storage.open(&name).put(request, response) {
            warn!(cache = %name, url = %request.url, error = %e, "Cache write failed");
        }
    }

    fn store_later(
        &self,
        partition: Partition,
        request: &Request,
        response: &Response,
        wait_until: &mut WaitUntil,
    ) {
        if response.status != StatusCode::OK {
            return;
        }
        let this = self.clone();
        let request = request.clone();
        let response = response.clone();
        wait_until.push(async move { this.store(partition, &request, &response).await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedFetcher;

    fn dispatcher_with(config: SwConfig, fetcher: Arc<ScriptedFetcher>) -> CacheDispatcher {
        CacheDispatcher::new(
            Arc::new(config),
            Arc::new(RwLock::new(CacheStorage::new())),
            fetcher,
        )
    }

    fn dispatcher(fetcher: Arc<ScriptedFetcher>) -> CacheDispatcher {
        dispatcher_with(SwConfig::default(), fetcher)
    }

    fn get(url: &str) -> Request {
        Request::parse(url).unwrap()
    }

    #[test]
    fn test_offline_fallback_shape() {
        let response = offline_fallback();
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.status_text, "Service Unavailable");
        assert_eq!(
            response.headers.get(header::CONTENT_TYPE).unwrap(),
            HeaderValue::from_static("text/plain")
        );
        assert_eq!(response.text().unwrap(), OFFLINE_BODY);
    }

    #[test]
    fn test_routing_table() {
        let d = dispatcher(Arc::new(ScriptedFetcher::new()));

        let post = Request::new(Method::POST, Url::parse("https://typefill.app/api").unwrap());
        assert_eq!(d.route(&post), Route::PassThrough);
        assert_eq!(d.route(&get("chrome-extension://id/x.js")), Route::PassThrough);

        assert_eq!(
            d.route(&get("https://fonts.googleapis.com/css2?family=Inter")),
            Route::CacheFirst(Partition::Static)
        );
        assert_eq!(
            d.route(&get("https://typefill.app/app.css").destination(Destination::Style)),
            Route::CacheFirst(Partition::Static)
        );
        assert_eq!(
            d.route(&get("https://typefill.app/logo.png").destination(Destination::Image)),
            Route::CacheFirst(Partition::Image)
        );
        assert_eq!(
            d.route(&Request::navigate(Url::parse("https://typefill.app/page").unwrap())),
            Route::NetworkFirst
        );
        assert_eq!(
            d.route(&get("https://typefill.app/api/templates")),
            Route::StaleWhileRevalidate
        );
    }

    #[test]
    fn test_static_origin_beats_image_destination() {
        let d = dispatcher(Arc::new(ScriptedFetcher::new()));
        let request = get("https://cdn.tailwindcss.com/logo.svg").destination(Destination::Image);
        assert_eq!(d.route(&request), Route::CacheFirst(Partition::Static));
    }

    #[test]
    fn test_lite_routing_folds_images_into_generic_path() {
        let config = SwConfig {
            profile: DispatchProfile::Lite,
            ..Default::default()
        };
        let d = dispatcher_with(config, Arc::new(ScriptedFetcher::new()));

        assert_eq!(
            d.route(&get("https://typefill.app/logo.png").destination(Destination::Image)),
            Route::CacheFirst(Partition::Dynamic)
        );
        assert_eq!(
            d.route(&get("https://typefill.app/api/templates")),
            Route::CacheFirst(Partition::Dynamic)
        );
        assert_eq!(
            d.route(&Request::navigate(Url::parse("https://typefill.app/").unwrap())),
            Route::NetworkFirst
        );
    }

    #[tokio::test]
    async fn test_pass_through_is_none() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let d = dispatcher(fetcher.clone());
        let post = Request::new(Method::POST, Url::parse("https://typefill.app/api").unwrap());
        assert!(d.dispatch(&post).await.is_none());
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_cache_first_stores_then_hits() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.respond("https://typefill.app/app.css", 200, "body{}");
        let d = dispatcher(fetcher.clone());
        let request = get("https://typefill.app/app.css").destination(Destination::Style);

        let first = d.cache_first(&request, Partition::Static).await;
        assert_eq!(first.wait_until.len(), 1);
        let first = first.settled().await;
        assert_eq!(first.source, ResponseSource::Network);

        let second = d.cache_first(&request, Partition::Static).await;
        assert!(second.wait_until.is_empty());
        assert!(second.value.from_cache());
        assert_eq!(second.value.body, first.body);
        assert_eq!(fetcher.calls(), 1);

        let storage = d.caches().read().await;
        assert!(storage.get("typefill-static-v1").unwrap().match_request(&request).is_some());
    }

    #[tokio::test]
    async fn test_cache_first_does_not_store_errors() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.respond("https://typefill.app/missing.png", 404, "nope");
        let d = dispatcher(fetcher.clone());
        let request = get("https://typefill.app/missing.png");

        let handled = d.cache_first(&request, Partition::Image).await;
        assert!(handled.wait_until.is_empty());
        assert_eq!(handled.settled().await.status, StatusCode::NOT_FOUND);
        assert!(d.caches().read().await.match_request(&request).is_none());
    }

    #[tokio::test]
    async fn test_cache_first_offline_fallback() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let d = dispatcher(fetcher);
        let handled = d
            .cache_first(&get("https://fonts.gstatic.com/x.woff2"), Partition::Static)
            .await;
        assert_eq!(handled.value.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(handled.value.source, ResponseSource::Synthesized);
    }

    #[tokio::test]
    async fn test_network_first_prefers_network_and_stores() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.respond("https://typefill.app/editor", 200, "live");
        let d = dispatcher(fetcher.clone());
        let request = Request::navigate(Url::parse("https://typefill.app/editor").unwrap());

        let response = d.network_first(&request).await.settled().await;
        assert_eq!(response.text().unwrap(), "live");

        fetcher.fail("https://typefill.app/editor");
        let offline = d.network_first(&request).await.value;
        assert!(offline.from_cache());
        assert_eq!(offline.text().unwrap(), "live");
    }

    #[tokio::test]
    async fn test_network_first_without_shell_is_offline_fallback() {
        let d = dispatcher(Arc::new(ScriptedFetcher::new()));
        let request = Request::navigate(Url::parse("https://typefill.app/page").unwrap());
        let response = d.network_first(&request).await.value;
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_swr_miss_waits_for_network() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.respond("https://typefill.app/api/templates", 200, "[1]");
        let d = dispatcher(fetcher.clone());
        let request = get("https://typefill.app/api/templates");

        let response = d.stale_while_revalidate(&request).await.settled().await;
        assert_eq!(response.text().unwrap(), "[1]");
        assert!(d.caches().read().await.match_request(&request).is_some());
    }

    #[tokio::test]
    async fn test_swr_miss_and_network_failure_is_offline_fallback() {
        let d = dispatcher(Arc::new(ScriptedFetcher::new()));
        let response = d
            .stale_while_revalidate(&get("https://typefill.app/api/templates"))
            .await
            .value;
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_swr_hit_with_failing_revalidation_keeps_entry() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.respond("https://typefill.app/api/me", 200, "old");
        let d = dispatcher(fetcher.clone());
        let request = get("https://typefill.app/api/me");
        d.stale_while_revalidate(&request).await.settled().await;

        fetcher.fail("https://typefill.app/api/me");
        let handled = d.stale_while_revalidate(&request).await;
        assert_eq!(handled.value.text().unwrap(), "old");
        handled.wait_until.settle().await;

        let again = d.stale_while_revalidate(&request).await.value;
        assert_eq!(again.text().unwrap(), "old");
    }

    #[tokio::test]
    async fn test_network_timeout_falls_back() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.hang("https://typefill.app/app.css");
        let config = SwConfig {
            network_timeout_ms: 20,
            ..Default::default()
        };
        let d = dispatcher_with(config, fetcher);
        let response = d
            .cache_first(&get("https://typefill.app/app.css"), Partition::Static)
            .await
            .value;
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_add_all_is_all_or_nothing() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.respond("https://typefill.app/a", 200, "a");
        fetcher.respond("https://typefill.app/b", 500, "boom");
        let config = SwConfig {
            precache_retry: typefill_common::RetryConfig::none(),
            ..Default::default()
        };
        let d = dispatcher_with(config, fetcher);
        let urls = vec![
            Url::parse("https://typefill.app/a").unwrap(),
            Url::parse("https://typefill.app/b").unwrap(),
        ];

        let err = d.add_all(Partition::Dynamic, &urls).await.unwrap_err();
        assert!(matches!(err, ServiceWorkerError::Precache { ref url, .. } if url == "https://typefill.app/b"));
        assert!(d.caches().read().await.match_url(&urls[0]).is_none());
    }

    #[tokio::test]
    async fn test_add_all_retries_transient_failures() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.respond("https://typefill.app/flaky", 200, "ok");
        fetcher.fail_next("https://typefill.app/flaky", 1);
        let config = SwConfig {
            precache_retry: typefill_common::RetryConfig {
                max_attempts: 2,
                initial_delay_ms: 1,
                jitter: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let d = dispatcher_with(config, fetcher.clone());
        let url = Url::parse("https://typefill.app/flaky").unwrap();

        assert_eq!(d.add_all(Partition::Dynamic, &[url.clone()]).await.unwrap(), 1);
        assert_eq!(fetcher.calls(), 2);
        assert!(d.caches().read().await.match_url(&url).is_some());
    }
}
