//! Installing, waiting and active workers for one scope.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::info;
use typefill_net::{Request, Response};
use url::Url;

use crate::events::Handled;
use crate::worker::{ActivationReport, ServiceWorker, WorkerState};
use crate::ServiceWorkerError;

/// A service worker registration.
#[derive(Debug)]
pub struct Registration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    installing: Option<Arc<ServiceWorker>>,

    /// Waiting worker (installed but not active).
    waiting: Option<Arc<ServiceWorker>>,

    /// Active worker.
    active: Option<Arc<ServiceWorker>>,
}

impl Registration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    pub fn installing(&self) -> Option<&Arc<ServiceWorker>> {
        self.installing.as_ref()
    }

    pub fn waiting(&self) -> Option<&Arc<ServiceWorker>> {
        self.waiting.as_ref()
    }

    /// The worker handling events for this scope.
    pub fn controller(&self) -> Option<&Arc<ServiceWorker>> {
        self.active.as_ref()
    }

    /// Install a new worker version. It moves to waiting, and is
    /// activated at once if it asked to skip waiting or no client is
    /// controlled by the current worker.
    pub async fn register(
        &mut self,
        worker: ServiceWorker,
    ) -> Result<Option<ActivationReport>, ServiceWorkerError> {
        let worker = Arc::new(worker);
        self.installing = Some(Arc::clone(&worker));

        let installed = worker.install().await;
        self.installing = None;
        installed?;

        if let Some(previous) = self.waiting.replace(Arc::clone(&worker)) {
            previous.set_state(WorkerState::Redundant).await;
        }

        let controlled = worker.clients().read().await.controlled_count();
        if worker.skip_waiting_requested() || self.active.is_none() || controlled == 0 {
            return self.activate_waiting().await;
        }
        info!(worker = ?worker.id(), controlled, "Worker waiting for clients to close");
        Ok(None)
    }

    /// Promote the waiting worker, if any.
    pub async fn skip_waiting(&mut self) -> Result<Option<ActivationReport>, ServiceWorkerError> {
        self.activate_waiting().await
    }

    async fn activate_waiting(&mut self) -> Result<Option<ActivationReport>, ServiceWorkerError> {
        let Some(worker) = self.waiting.take() else {
            return Ok(None);
        };

        if let Some(old) = self.active.take() {
            old.set_state(WorkerState::Redundant).await;
        }

        let report = worker.activate().await?;
        self.active = Some(worker);
        Ok(Some(report))
    }

    /// Deliver a page message to the newest worker. A skip-waiting request
    /// promotes the waiting worker immediately.
    pub async fn post_message(
        &mut self,
        data: &JsonValue,
    ) -> Result<Handled<()>, ServiceWorkerError> {
        let target = self
            .waiting
            .as_ref()
            .or(self.active.as_ref())
            .cloned()
            .ok_or_else(|| ServiceWorkerError::State("no worker to receive message".into()))?;

        let handled = target.handle_message(data).await?;
        if self.waiting.is_some() && target.skip_waiting_requested() {
            self.activate_waiting().await?;
        }
        Ok(handled)
    }

    /// Route a fetch to the active worker.
    pub async fn handle_fetch(&self, request: &Request) -> Option<Handled<Response>> {
        match &self.active {
            Some(worker) => worker.handle_fetch(request).await,
            None => None,
        }
    }

    /// Retire every worker.
    pub async fn unregister(&mut self) {
        for worker in [
            self.active.take(),
            self.waiting.take(),
            self.installing.take(),
        ]
        .into_iter()
        .flatten()
        {
            worker.set_state(WorkerState::Redundant).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStorage;
    use crate::clients::{Client, Clients};
    use crate::config::SwConfig;
    use crate::testing::ScriptedFetcher;
    use serde_json::json;
    use tokio::sync::{mpsc, RwLock};

    struct Host {
        caches: Arc<RwLock<CacheStorage>>,
        clients: Arc<RwLock<Clients>>,
        fetcher: Arc<ScriptedFetcher>,
        event_tx: mpsc::UnboundedSender<crate::events::HostEvent>,
        _event_rx: mpsc::UnboundedReceiver<crate::events::HostEvent>,
    }

    impl Host {
        fn new() -> Self {
            let fetcher = Arc::new(ScriptedFetcher::new());
            fetcher.respond("https://typefill.app/index.html", 200, "shell");
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            Self {
                caches: Arc::new(RwLock::new(CacheStorage::new())),
                clients: Arc::new(RwLock::new(Clients::new())),
                fetcher,
                event_tx,
                _event_rx: event_rx,
            }
        }

        fn worker(&self, version: &str) -> ServiceWorker {
            self.worker_with(version, true)
        }

        fn worker_with(&self, version: &str, skip_waiting_on_install: bool) -> ServiceWorker {
            let config = SwConfig {
                version: version.to_string(),
                precache: vec!["/index.html".into()],
                precache_retry: typefill_common::RetryConfig::none(),
                skip_waiting_on_install,
                ..Default::default()
            };
            ServiceWorker::with_shared(
                Arc::new(config),
                self.fetcher.clone(),
                self.caches.clone(),
                self.clients.clone(),
                self.event_tx.clone(),
            )
        }
    }

    fn scope() -> Url {
        Url::parse("https://typefill.app/").unwrap()
    }

    #[tokio::test]
    async fn test_first_registration_activates() {
        let host = Host::new();
        let mut registration = Registration::new(scope());

        let report = registration.register(host.worker("v1")).await.unwrap();
        assert!(report.is_some());
        assert!(registration.waiting().is_none());
        assert!(registration.installing().is_none());
        let active = registration.controller().unwrap();
        assert_eq!(active.state().await, WorkerState::Active);
    }

    #[tokio::test]
    async fn test_update_replaces_old_worker_and_caches() {
        let host = Host::new();
        let mut registration = Registration::new(scope());
        registration.register(host.worker("v1")).await.unwrap();
        let v1 = Arc::clone(registration.controller().unwrap());
        host.clients
            .write()
            .await
            .add(Client::window(scope()));
        host.clients.write().await.claim();

        let report = registration.register(host.worker("v2")).await.unwrap().unwrap();

        assert_eq!(report.deleted, vec!["typefill-static-v1".to_string()]);
        assert_eq!(v1.state().await, WorkerState::Redundant);
        assert_eq!(
            registration.controller().unwrap().config().version,
            "v2"
        );
        assert_eq!(
            host.caches.read().await.keys(),
            vec!["typefill-static-v2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_failed_install_keeps_current_worker() {
        let host = Host::new();
        let mut registration = Registration::new(scope());
        registration.register(host.worker("v1")).await.unwrap();

        host.fetcher.fail("https://typefill.app/index.html");
        let result = registration.register(host.worker("v2")).await;

        assert!(matches!(result, Err(ServiceWorkerError::Precache { .. })));
        assert!(registration.waiting().is_none());
        assert_eq!(registration.controller().unwrap().config().version, "v1");
        assert_eq!(
            registration.controller().unwrap().state().await,
            WorkerState::Active
        );
    }

    #[tokio::test]
    async fn test_post_message_to_active_worker() {
        let host = Host::new();
        let mut registration = Registration::new(scope());
        assert!(registration.post_message(&json!("SKIP_WAITING")).await.is_err());

        registration.register(host.worker("v1")).await.unwrap();
        registration.post_message(&json!("SKIP_WAITING")).await.unwrap();
        assert!(registration.controller().is_some());
    }

    #[tokio::test]
    async fn test_update_waits_while_clients_are_controlled() {
        let host = Host::new();
        let mut registration = Registration::new(scope());
        registration.register(host.worker("v1")).await.unwrap();
        let v1 = Arc::clone(registration.controller().unwrap());
        host.clients.write().await.add(Client::window(scope()));
        host.clients.write().await.claim();

        let report = registration
            .register(host.worker_with("v2", false))
            .await
            .unwrap();

        assert!(report.is_none());
        let waiting = Arc::clone(registration.waiting().unwrap());
        assert_eq!(waiting.state().await, WorkerState::Waiting);
        assert_eq!(registration.controller().unwrap().config().version, "v1");
        assert!(host.caches.read().await.has("typefill-static-v1"));

        registration.post_message(&json!("SKIP_WAITING")).await.unwrap();

        assert!(registration.waiting().is_none());
        assert_eq!(registration.controller().unwrap().config().version, "v2");
        assert_eq!(waiting.state().await, WorkerState::Active);
        assert_eq!(v1.state().await, WorkerState::Redundant);
        assert!(!host.caches.read().await.has("typefill-static-v1"));
    }

    #[tokio::test]
    async fn test_waiting_worker_promoted_on_demand() {
        let host = Host::new();
        let mut registration = Registration::new(scope());
        registration.register(host.worker("v1")).await.unwrap();
        host.clients.write().await.add(Client::window(scope()));
        host.clients.write().await.claim();
        registration
            .register(host.worker_with("v2", false))
            .await
            .unwrap();

        let report = registration.skip_waiting().await.unwrap().unwrap();
        assert_eq!(report.deleted, vec!["typefill-static-v1".to_string()]);
        assert_eq!(registration.controller().unwrap().config().version, "v2");
        assert!(registration.skip_waiting().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_controlled_clients_activates_without_skip_waiting() {
        let host = Host::new();
        let mut registration = Registration::new(scope());
        registration.register(host.worker("v1")).await.unwrap();

        let report = registration
            .register(host.worker_with("v2", false))
            .await
            .unwrap();
        assert!(report.is_some());
        assert!(registration.waiting().is_none());
        assert_eq!(registration.controller().unwrap().config().version, "v2");
    }

    #[tokio::test]
    async fn test_unregister_retires_everything() {
        let host = Host::new();
        let mut registration = Registration::new(scope());
        registration.register(host.worker("v1")).await.unwrap();
        let active = Arc::clone(registration.controller().unwrap());

        registration.unregister().await;
        assert!(registration.controller().is_none());
        assert_eq!(active.state().await, WorkerState::Redundant);
        let request = Request::parse("https://typefill.app/index.html").unwrap();
        assert!(registration.handle_fetch(&request).await.is_none());
    }
}
