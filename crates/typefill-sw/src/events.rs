//! Event payloads, outbound host events and the stay-alive bag.

use std::fmt;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

use crate::clients::ClientId;
use crate::worker::{ServiceWorkerId, WorkerState};
use crate::ServiceWorkerError;

// ==================== Stay-alive ====================

/// Work a handler started that must finish before the worker may stop.
#[derive(Default)]
pub struct WaitUntil {
    tasks: Vec<BoxFuture<'static, ()>>,
}

impl WaitUntil {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend the event's lifetime until `task` settles.
    pub fn push<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(task.boxed());
    }

    /// Absorb another bag.
    pub fn extend(&mut self, other: WaitUntil) {
        self.tasks.extend(other.tasks);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Drive every task to completion.
    pub async fn settle(self) {
        if self.tasks.is_empty() {
            return;
        }
        debug!(tasks = self.tasks.len(), "Settling background work");
        join_all(self.tasks).await;
    }

    /// Hand every task to the tokio runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.settle())
    }
}

impl fmt::Debug for WaitUntil {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitUntil")
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

/// A handler's result plus the background work it started.
#[derive(Debug)]
pub struct Handled<T> {
    pub value: T,
    pub wait_until: WaitUntil,
}

impl<T> Handled<T> {
    /// A result with no background work.
    pub fn done(value: T) -> Self {
        Self {
            value,
            wait_until: WaitUntil::new(),
        }
    }

    pub fn with(value: T, wait_until: WaitUntil) -> Self {
        Self { value, wait_until }
    }

    /// Wait for the background work, then return the value.
    pub async fn settled(self) -> T {
        self.wait_until.settle().await;
        self.value
    }
}

// ==================== Host events ====================

/// Side effects the host runtime carries out for the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// The worker asked to skip the waiting phase.
    SkipWaiting { worker_id: ServiceWorkerId },
    /// Worker state changed.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: WorkerState,
    },
    /// The worker took control of open clients.
    ClientsClaimed { worker_id: ServiceWorkerId, count: usize },
    /// Message for one client.
    PostMessage { client_id: ClientId, data: JsonValue },
    ShowNotification(Notification),
    CloseNotification { tag: String },
    FocusClient { client_id: ClientId },
    NavigateClient { client_id: ClientId, url: Url },
    OpenWindow { client_id: ClientId, url: Url },
}

// ==================== Messages ====================

/// Message from a page to the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Activate the waiting worker now.
    SkipWaiting,
    /// Store every URL in the dynamic partition.
    CacheUrls(Vec<String>),
}

#[derive(Deserialize)]
enum Signal {
    #[serde(rename = "SKIP_WAITING")]
    SkipWaiting,
}

#[derive(Deserialize)]
#[serde(tag = "type", content = "payload")]
enum Command {
    #[serde(rename = "CACHE_URLS")]
    CacheUrls(Vec<String>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireMessage {
    Signal(Signal),
    Command(Command),
}

impl ClientMessage {
    /// Decode a structured-clone payload: either a bare control string or
    /// a `{type, payload}` object. Anything else is rejected.
    pub fn from_json(value: &JsonValue) -> Result<Self, ServiceWorkerError> {
        let wire = WireMessage::deserialize(value)
            .map_err(|_| ServiceWorkerError::UnknownMessage(value.to_string()))?;
        Ok(match wire {
            WireMessage::Signal(Signal::SkipWaiting) => ClientMessage::SkipWaiting,
            WireMessage::Command(Command::CacheUrls(urls)) => ClientMessage::CacheUrls(urls),
        })
    }
}

// ==================== Push & notifications ====================

/// Fields a push payload may carry.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PushPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    pub url: Option<String>,
}

impl PushPayload {
    /// Parse raw push data. Non-JSON data yields an empty payload so the
    /// notification falls back to its defaults.
    pub fn parse(data: &[u8]) -> Self {
        match serde_json::from_slice(data) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = %e, "Push payload is not JSON, using defaults");
                Self::default()
            }
        }
    }
}

/// A button on a notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

/// A system notification the host should display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub tag: String,
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    /// URL to open on click.
    pub data: String,
    pub actions: Vec<NotificationAction>,
    pub require_interaction: bool,
}

/// Action identifiers on pushed notifications.
pub const ACTION_OPEN: &str = "open";
pub const ACTION_DISMISS: &str = "dismiss";

/// A click on a notification or one of its actions.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationClick {
    pub notification: Notification,
    /// Empty when the body (not a button) was clicked.
    pub action: Option<String>,
}

impl NotificationClick {
    /// Whether the click should bring the app up.
    pub fn opens_app(&self) -> bool {
        match self.action.as_deref() {
            None | Some("") => true,
            Some(action) => action == ACTION_OPEN,
        }
    }
}
