//! In-memory [`Fetcher`] for exercising the worker without a network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use hashbrown::HashMap;
use http::StatusCode;
use typefill_net::{Fetcher, NetError, Request, Response};

use crate::cache::request_key;

#[derive(Debug, Clone)]
enum Script {
    Respond { status: u16, body: String },
    Fail,
    Hang,
}

#[derive(Debug, Default)]
struct ScriptState {
    scripts: HashMap<String, Script>,
    fail_next: HashMap<String, usize>,
    calls: HashMap<String, usize>,
}

/// Answers requests from a per-URL script. Unscripted URLs fail with a
/// connection error.
#[derive(Debug, Default)]
pub struct ScriptedFetcher {
    state: Mutex<ScriptState>,
    total: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ScriptState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    fn key(url: &str) -> String {
        url::Url::parse(url)
            .map(|u| request_key(&u))
            .unwrap_or_else(|_| url.to_string())
    }

    /// Answer `url` with `status` and `body` from now on.
    pub fn respond(&self, url: &str, status: u16, body: impl Into<String>) {
        let script = Script::Respond {
            status,
            body: body.into(),
        };
        self.with_state(|s| s.scripts.insert(Self::key(url), script));
    }

    /// Fail every request for `url` from now on.
    pub fn fail(&self, url: &str) {
        self.with_state(|s| s.scripts.insert(Self::key(url), Script::Fail));
    }

    /// Never answer requests for `url`.
    pub fn hang(&self, url: &str) {
        self.with_state(|s| s.scripts.insert(Self::key(url), Script::Hang));
    }

    /// Fail the next `times` requests for `url`, then follow its script.
    pub fn fail_next(&self, url: &str, times: usize) {
        self.with_state(|s| s.fail_next.insert(Self::key(url), times));
    }

    /// Total number of fetches.
    pub fn calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Number of fetches for one URL.
    pub fn calls_for(&self, url: &str) -> usize {
        self.with_state(|s| s.calls.get(&Self::key(url)).copied().unwrap_or(0))
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        let key = request_key(&request.url);

        let script = self.with_state(|s| {
            *s.calls.entry(key.clone()).or_insert(0) += 1;
            if let Some(remaining) = s.fail_next.get_mut(&key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Some(Script::Fail);
                }
            }
            s.scripts.get(&key).cloned()
        });

        match script {
            Some(Script::Respond { status, body }) => {
                let status = StatusCode::from_u16(status)
                    .map_err(|e| NetError::RequestFailed(e.to_string()))?;
                Ok(Response::new(status, body).with_url(request.url.clone()))
            }
            Some(Script::Hang) => futures::future::pending().await,
            Some(Script::Fail) | None => Err(NetError::Connection(format!(
                "connection refused: {}",
                request.url
            ))),
        }
    }
}
