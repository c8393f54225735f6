//! The service worker: lifecycle plus one handler per event kind.
//!
//! Handlers never touch a runtime directly. Each returns its result and the
//! background work it started; outbound effects go through the
//! [`HostEvent`] channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use typefill_net::{Fetcher, Request, Response};
use url::Url;

use crate::cache::{CacheStorage, Partition};
use crate::clients::{ClientMatchOptions, Clients};
use crate::config::SwConfig;
use crate::dispatcher::CacheDispatcher;
use crate::events::{
    ClientMessage, Handled, HostEvent, Notification, NotificationAction, NotificationClick,
    PushPayload, WaitUntil, ACTION_DISMISS, ACTION_OPEN,
};
use crate::ServiceWorkerError;

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Created, install not started.
    #[default]
    Parsed,
    /// Precaching.
    Installing,
    /// Installed, waiting to take over.
    Waiting,
    /// Removing stale partitions and claiming clients.
    Activating,
    /// Handling events.
    Active,
    /// Install failed or superseded.
    Redundant,
}

/// What activation cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    /// Partitions deleted because their name is not current.
    pub deleted: Vec<String>,
    /// Clients that came under this worker's control.
    pub clients_claimed: usize,
}

/// Message posted to clients after a template sync.
pub const SYNC_COMPLETE: &str = "SYNC_COMPLETE";

/// A TypeFill service worker instance.
pub struct ServiceWorker {
    id: ServiceWorkerId,
    state: RwLock<WorkerState>,
    skip_waiting: AtomicBool,
    dispatcher: CacheDispatcher,
    clients: Arc<RwLock<Clients>>,
    event_tx: mpsc::UnboundedSender<HostEvent>,
}

impl ServiceWorker {
    /// Create a worker with fresh cache storage and no clients.
    pub fn new(
        config: SwConfig,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<HostEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let worker = Self::with_shared(
            Arc::new(config),
            fetcher,
            Arc::new(RwLock::new(CacheStorage::new())),
            Arc::new(RwLock::new(Clients::new())),
            event_tx,
        );
        (worker, event_rx)
    }

    /// Create a worker over storage and clients that outlive it, as a
    /// newer version does when it replaces an older one.
    pub fn with_shared(
        config: Arc<SwConfig>,
        fetcher: Arc<dyn Fetcher>,
        caches: Arc<RwLock<CacheStorage>>,
        clients: Arc<RwLock<Clients>>,
        event_tx: mpsc::UnboundedSender<HostEvent>,
    ) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            state: RwLock::new(WorkerState::Parsed),
            skip_waiting: AtomicBool::new(false),
            dispatcher: CacheDispatcher::new(config, caches, fetcher),
            clients,
            event_tx,
        }
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn config(&self) -> &SwConfig {
        self.dispatcher.config()
    }

    pub fn dispatcher(&self) -> &CacheDispatcher {
        &self.dispatcher
    }

    pub fn caches(&self) -> &Arc<RwLock<CacheStorage>> {
        self.dispatcher.caches()
    }

    pub fn clients(&self) -> &Arc<RwLock<Clients>> {
        &self.clients
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    pub(crate) async fn set_state(&self, state: WorkerState) {
        *self.state.write().await = state;
        debug!(worker = ?self.id, ?state, "Worker state changed");
        let _ = self.event_tx.send(HostEvent::StateChange {
            worker_id: self.id,
            new_state: state,
        });
    }

    /// Ask to activate as soon as installed instead of waiting for every
    /// client of the old worker to close.
    pub fn skip_waiting(&self) {
        if !self.skip_waiting.swap(true, Ordering::SeqCst) {
            info!(worker = ?self.id, "Skip waiting requested");
            let _ = self.event_tx.send(HostEvent::SkipWaiting { worker_id: self.id });
        }
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    // ==================== Lifecycle ====================

    /// Precache the manifest into the static partition, then request
    /// skip-waiting unless configured not to. On failure the worker becomes redundant and nothing
    /// from the manifest is stored.
    pub async fn install(&self) -> Result<(), ServiceWorkerError> {
        let current = self.state().await;
        if current != WorkerState::Parsed {
            return Err(ServiceWorkerError::State(format!(
                "cannot install from {current:?}"
            )));
        }

        info!(worker = ?self.id, version = %self.config().version, "Installing");
        self.set_state(WorkerState::Installing).await;

        match self.precache().await {
            Ok(count) => {
                info!(worker = ?self.id, count, "Precached assets");
                self.set_state(WorkerState::Waiting).await;
                if self.config().skip_waiting_on_install {
                    self.skip_waiting();
                }
                Ok(())
            }
            Err(e) => {
                error!(worker = ?self.id, error = %e, "Precache failed");
                self.set_state(WorkerState::Redundant).await;
                Err(e)
            }
        }
    }

    async fn precache(&self) -> Result<usize, ServiceWorkerError> {
        let config = self.config();
        let urls = config
            .precache
            .iter()
            .map(|entry| config.resolve(entry))
            .collect::<Result<Vec<Url>, _>>()?;

        // The static partition exists even for an empty manifest.
        self.caches()
            .write()
            .await
            .open(&config.cache_name(Partition::Static));

        self.dispatcher.add_all(Partition::Static, &urls).await
    }

    /// Delete every partition whose name is not current, then claim all
    /// clients.
    pub async fn activate(&self) -> Result<ActivationReport, ServiceWorkerError> {
        let current = self.state().await;
        if current != WorkerState::Waiting {
            return Err(ServiceWorkerError::State(format!(
                "cannot activate from {current:?}"
            )));
        }

        info!(worker = ?self.id, "Activating");
        self.set_state(WorkerState::Activating).await;

        let mut report = ActivationReport::default();
        let recognized = self.config().recognized_cache_names();
        {
            let mut storage = self.caches().write().await;
            for name in storage.keys() {
                if recognized.contains(&name) {
                    continue;
                }
                info!(cache = %name, "Deleting old cache");
                storage.delete(&name);
                report.deleted.push(name);
            }
        }

        report.clients_claimed = self.clients.write().await.claim();
        info!(worker = ?self.id, count = report.clients_claimed, "Claiming clients");
        let _ = self.event_tx.send(HostEvent::ClientsClaimed {
            worker_id: self.id,
            count: report.clients_claimed,
        });

        self.set_state(WorkerState::Active).await;
        Ok(report)
    }

    // ==================== Events ====================

    /// Fetch event. `None` means the request is not intercepted.
    pub async fn handle_fetch(&self, request: &Request) -> Option<Handled<Response>> {
        if self.state().await != WorkerState::Active {
            return None;
        }
        self.dispatcher.dispatch(request).await
    }

    /// Message event from a page.
    pub async fn handle_message(&self, data: &JsonValue) -> Result<Handled<()>, ServiceWorkerError> {
        match ClientMessage::from_json(data)? {
            ClientMessage::SkipWaiting => {
                self.skip_waiting();
                Ok(Handled::done(()))
            }
            ClientMessage::CacheUrls(entries) => {
                let config = self.config();
                let urls = entries
                    .iter()
                    .map(|entry| config.resolve(entry))
                    .collect::<Result<Vec<Url>, _>>()?;

                let dispatcher = self.dispatcher.clone();
                let mut wait_until = WaitUntil::new();
                wait_until.push(async move {
                    if let Err(e) = dispatcher.add_all(Partition::Dynamic, &urls).await {
                        warn!(error = %e, "Caching requested URLs failed");
                    }
                });
                Ok(Handled::with((), wait_until))
            }
        }
    }

    /// Background sync event. Returns whether the tag was recognized.
    pub async fn handle_sync(&self, tag: &str) -> Handled<bool> {
        if tag != self.config().sync_tag {
            debug!(tag, "Ignoring sync tag");
            return Handled::done(false);
        }

        let clients = Arc::clone(&self.clients);
        let event_tx = self.event_tx.clone();
        let mut wait_until = WaitUntil::new();
        wait_until.push(async move {
            info!("Background sync executed");
            let clients = clients.read().await;
            for client in clients.match_all(&ClientMatchOptions::default()) {
                let _ = event_tx.send(HostEvent::PostMessage {
                    client_id: client.id,
                    data: json!({
                        "type": SYNC_COMPLETE,
                        "message": "Templates synced successfully",
                    }),
                });
            }
        });
        Handled::with(true, wait_until)
    }

    /// Periodic sync event. Returns whether the tag was recognized.
    pub async fn handle_periodic_sync(&self, tag: &str) -> Handled<bool> {
        if tag != self.config().update_check_tag {
            debug!(tag, "Ignoring periodic sync tag");
            return Handled::done(false);
        }
        info!("Checking for updates");
        Handled::done(true)
    }

    /// Push event. A push without data shows nothing.
    pub async fn handle_push(&self, data: Option<&[u8]>) -> Handled<Option<Notification>> {
        let Some(data) = data else {
            debug!("Push without data");
            return Handled::done(None);
        };

        let notification = self.notification_for(PushPayload::parse(data));
        info!(tag = %notification.tag, title = %notification.title, "Showing notification");
        let _ = self
            .event_tx
            .send(HostEvent::ShowNotification(notification.clone()));
        Handled::done(Some(notification))
    }

    fn notification_for(&self, payload: PushPayload) -> Notification {
        static TAGS: AtomicU64 = AtomicU64::new(1);
        let defaults = &self.config().notifications;
        Notification {
            tag: format!("typefill-{}", TAGS.fetch_add(1, Ordering::Relaxed)),
            title: payload.title.unwrap_or_else(|| defaults.title.clone()),
            body: payload.body.unwrap_or_else(|| defaults.body.clone()),
            icon: defaults.icon.clone(),
            badge: defaults.badge.clone(),
            vibrate: defaults.vibrate.clone(),
            data: payload.url.unwrap_or_else(|| defaults.url.clone()),
            actions: vec![
                NotificationAction {
                    action: ACTION_OPEN.to_string(),
                    title: defaults.open_action_title.clone(),
                },
                NotificationAction {
                    action: ACTION_DISMISS.to_string(),
                    title: defaults.dismiss_action_title.clone(),
                },
            ],
            require_interaction: false,
        }
    }

    /// Notification click. Closes the notification; opening clicks focus
    /// the first window and navigate it, or open a new one.
    pub async fn handle_notification_click(
        &self,
        click: &NotificationClick,
    ) -> Result<Handled<()>, ServiceWorkerError> {
        let _ = self.event_tx.send(HostEvent::CloseNotification {
            tag: click.notification.tag.clone(),
        });

        if !click.opens_app() {
            return Ok(Handled::done(()));
        }

        let target = if click.notification.data.is_empty() {
            self.config().resolve(&self.config().notifications.url)?
        } else {
            self.config().resolve(&click.notification.data)?
        };

        let clients = Arc::clone(&self.clients);
        let event_tx = self.event_tx.clone();
        let mut wait_until = WaitUntil::new();
        wait_until.push(async move {
            let mut clients = clients.write().await;
            let first = clients
                .match_all(&ClientMatchOptions::default())
                .first()
                .map(|c| c.id);

            match first {
                Some(client_id) => {
                    let focused = clients.focus(client_id);
                    let navigated = clients.navigate(client_id, target.clone());
                    match focused.and(navigated) {
                        Ok(()) => {
                            let _ = event_tx.send(HostEvent::FocusClient { client_id });
                            let _ = event_tx.send(HostEvent::NavigateClient {
                                client_id,
                                url: target,
                            });
                        }
                        Err(e) => warn!(%client_id, error = %e, "Could not focus client"),
                    }
                }
                None => {
                    let client = clients.open_window(target.clone());
                    let _ = event_tx.send(HostEvent::OpenWindow {
                        client_id: client.id,
                        url: target,
                    });
                }
            }
        });
        Ok(Handled::with((), wait_until))
    }
}

impl std::fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("version", &self.config().version)
            .finish()
    }
}
