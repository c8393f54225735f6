//! Pages and workers the service worker can see.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use typefill_common::OptionExt;
use url::Url;

use crate::ServiceWorkerError;

/// Unique identifier for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
    All,
}

/// A page or worker connected to the origin.
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: ClientId,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Whether focused.
    pub focused: bool,

    /// Whether this worker controls the client.
    pub controlled: bool,
}

impl Client {
    /// A window client that is not yet controlled.
    pub fn window(url: Url) -> Self {
        Self {
            id: ClientId::new(),
            url,
            client_type: ClientType::Window,
            focused: false,
            controlled: false,
        }
    }

    /// A worker client.
    pub fn worker(url: Url) -> Self {
        Self {
            client_type: ClientType::Worker,
            ..Self::window(url)
        }
    }
}

/// Options for [`Clients::match_all`].
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

impl ClientMatchOptions {
    /// Every client of every type.
    pub fn everything() -> Self {
        Self {
            include_uncontrolled: true,
            client_type: ClientType::All,
        }
    }

    /// Every window client.
    pub fn windows() -> Self {
        Self {
            include_uncontrolled: true,
            client_type: ClientType::Window,
        }
    }
}

/// Clients in connection order.
#[derive(Debug, Default)]
pub struct Clients {
    clients: Vec<Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) -> ClientId {
        let id = client.id;
        self.clients.push(client);
        id
    }

    /// Remove a client.
    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        let index = self.clients.iter().position(|c| c.id == id)?;
        Some(self.clients.remove(index))
    }

    /// Get a client by ID.
    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.iter().find(|c| c.id == id)
    }

    fn window_mut(&mut self, id: ClientId) -> Result<&mut Client, ServiceWorkerError> {
        let client = self
            .clients
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_not_found(id.to_string())?;
        if client.client_type != ClientType::Window {
            return Err(ServiceWorkerError::State(format!(
                "{id} is not a window client"
            )));
        }
        Ok(client)
    }

    /// Match clients in connection order.
    pub fn match_all(&self, options: &ClientMatchOptions) -> Vec<&Client> {
        self.clients
            .iter()
            .filter(|c| options.include_uncontrolled || c.controlled)
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .collect()
    }

    /// Focus a window client; every other client loses focus.
    pub fn focus(&mut self, id: ClientId) -> Result<(), ServiceWorkerError> {
        self.window_mut(id)?;
        for client in &mut self.clients {
            client.focused = client.id == id;
        }
        Ok(())
    }

    /// Navigate a window client to `url`.
    pub fn navigate(&mut self, id: ClientId, url: Url) -> Result<(), ServiceWorkerError> {
        let client = self.window_mut(id)?;
        client.url = url;
        Ok(())
    }

    /// Open a new focused, controlled window.
    pub fn open_window(&mut self, url: Url) -> Client {
        for client in &mut self.clients {
            client.focused = false;
        }
        let client = Client {
            focused: true,
            controlled: true,
            ..Client::window(url)
        };
        self.clients.push(client.clone());
        client
    }

    /// Take control of every client. Returns how many changed hands.
    pub fn claim(&mut self) -> usize {
        let mut claimed = 0;
        for client in self.clients.iter_mut().filter(|c| !c.controlled) {
            client.controlled = true;
            claimed += 1;
        }
        claimed
    }

    /// Number of clients currently controlled.
    pub fn controlled_count(&self) -> usize {
        self.clients.iter().filter(|c| c.controlled).count()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_open_window() {
        let mut clients = Clients::new();
        let client = clients.open_window(url("https://typefill.app/"));
        assert_eq!(client.client_type, ClientType::Window);
        assert!(client.focused);
        assert!(clients.get(client.id).is_some());
    }

    #[test]
    fn test_match_all_keeps_connection_order() {
        let mut clients = Clients::new();
        let first = clients.add(Client::window(url("https://typefill.app/a")));
        clients.add(Client::worker(url("https://typefill.app/worker.js")));
        let third = clients.add(Client::window(url("https://typefill.app/b")));

        let windows: Vec<_> = clients
            .match_all(&ClientMatchOptions::windows())
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(windows, vec![first, third]);
        assert_eq!(clients.match_all(&ClientMatchOptions::everything()).len(), 3);
    }

    #[test]
    fn test_claim_controls_everything_once() {
        let mut clients = Clients::new();
        clients.add(Client::window(url("https://typefill.app/")));
        clients.add(Client::window(url("https://typefill.app/editor")));

        assert!(clients.match_all(&ClientMatchOptions::default()).is_empty());
        assert_eq!(clients.claim(), 2);
        assert_eq!(clients.claim(), 0);
        assert_eq!(clients.controlled_count(), 2);
    }

    #[test]
    fn test_focus_and_navigate_window() {
        let mut clients = Clients::new();
        let a = clients.add(Client::window(url("https://typefill.app/")));
        let b = clients.add(Client::window(url("https://typefill.app/editor")));

        clients.focus(b).unwrap();
        clients.navigate(b, url("https://typefill.app/templates")).unwrap();

        assert!(!clients.get(a).unwrap().focused);
        let b = clients.get(b).unwrap();
        assert!(b.focused);
        assert_eq!(b.url.path(), "/templates");
    }

    #[test]
    fn test_cannot_focus_worker_or_unknown() {
        let mut clients = Clients::new();
        let worker = clients.add(Client::worker(url("https://typefill.app/w.js")));
        assert!(matches!(clients.focus(worker), Err(ServiceWorkerError::State(_))));

        let gone = clients.add(Client::window(url("https://typefill.app/")));
        clients.remove(gone);
        assert!(clients.focus(gone).is_err());
    }
}
