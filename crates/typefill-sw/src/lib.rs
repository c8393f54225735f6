//! # TypeFill Service Worker
//!
//! Offline caching worker for the TypeFill web application.
//!
//! ## Features
//!
//! - **Routing**: every intercepted GET goes to cache-first, network-first
//!   or stale-while-revalidate depending on origin, destination and mode
//! - **Partitions**: versioned `static`, `dynamic` and `image` caches
//! - **Lifecycle**: atomic precache on install, stale-version cleanup and
//!   client claiming on activate
//! - **Events**: messages, background sync, push and notification clicks
//!
//! ## Architecture
//!
//! ```text
//! Registration
//!     ├── installing / waiting / active (ServiceWorker)
//!     │       ├── CacheDispatcher ──── Fetcher (network)
//!     │       │       └── CacheStorage
//!     │       │               └── Cache: GET url → CacheEntry
//!     │       └── Clients
//!     └── HostEvent channel (notifications, messages, navigation)
//! ```
//!
//! Handlers return [`Handled`]: the response (or unit) plus a
//! [`WaitUntil`] bag of background work the host must let finish.

use thiserror::Error;
use typefill_common::TypeFillError;

pub mod cache;
pub mod clients;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod registration;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheStorage, Partition};
pub use clients::{Client, ClientId, ClientMatchOptions, ClientType, Clients};
pub use config::{DispatchProfile, NotificationDefaults, SwConfig};
pub use dispatcher::{offline_fallback, CacheDispatcher, Route, OFFLINE_BODY};
pub use events::{
    ClientMessage, Handled, HostEvent, Notification, NotificationAction, NotificationClick,
    PushPayload, WaitUntil,
};
pub use registration::Registration;
pub use worker::{ActivationReport, ServiceWorker, ServiceWorkerId, WorkerState};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Precache failed for {url}: {reason}")]
    Precache { url: String, reason: String },

    #[error("Not cacheable: {0}")]
    NotCacheable(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Unrecognized message: {0}")]
    UnknownMessage(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Common(#[from] TypeFillError),
}
