//! Clients API: the windows and workers the agent may control.
//!
//! The host reports clients as they open, navigate and close; the agent
//! only tracks which version controls each one.

use hashbrown::HashMap;
use offkit_core::CacheVersion;
use tracing::debug;
use url::Url;

use crate::ServiceWorkerError;

// ==================== Client ====================

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
    All,
}

/// A page or worker in scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Current URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Whether focused.
    pub focused: bool,

    /// Version serving this client's requests, if any.
    pub controller: Option<CacheVersion>,
}

impl Client {
    /// An uncontrolled, unfocused window.
    pub fn window(id: impl Into<String>, url: Url) -> Self {
        Self {
            id: id.into(),
            url,
            client_type: ClientType::Window,
            focused: false,
            controller: None,
        }
    }

    pub fn controlled_by(mut self, version: CacheVersion) -> Self {
        self.controller = Some(version);
        self
    }

    pub fn is_controlled(&self) -> bool {
        self.controller.is_some()
    }

    /// Focus the client.
    pub fn focus(&mut self) -> Result<(), ServiceWorkerError> {
        if self.client_type != ClientType::Window {
            return Err(ServiceWorkerError::StateError(
                "Can only focus window clients".to_string(),
            ));
        }
        self.focused = true;
        Ok(())
    }
}

// ==================== Clients ====================

/// Options for [`Clients::match_all`].
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

/// Registry of known clients.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Match all clients, ordered by ID.
    pub fn match_all(&self, options: &ClientMatchOptions) -> Vec<&Client> {
        let mut matched: Vec<&Client> = self
            .clients
            .values()
            .filter(|c| options.include_uncontrolled || c.is_controlled())
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    /// Whether any client is still served by `version`.
    pub fn any_controlled_by(&self, version: &CacheVersion) -> bool {
        self.clients
            .values()
            .any(|c| c.controller.as_ref() == Some(version))
    }

    /// Open a focused window at `url`, controlled by `controller`.
    pub fn open_window(&mut self, url: Url, controller: Option<CacheVersion>) -> Client {
        let id = format!("client-{}", uuid::Uuid::new_v4());
        let client = Client {
            id: id.clone(),
            url,
            client_type: ClientType::Window,
            focused: true,
            controller,
        };

        debug!(client = %id, url = %client.url, "Opened window");
        self.blur_all();
        self.clients.insert(id, client.clone());
        client
    }

    /// Focus the client with `id`; every other client loses focus.
    pub fn focus(&mut self, id: &str) -> Result<&Client, ServiceWorkerError> {
        let client = self
            .clients
            .get(id)
            .ok_or_else(|| ServiceWorkerError::NotFound(id.to_string()))?;
        if client.client_type != ClientType::Window {
            return Err(ServiceWorkerError::StateError(
                "Can only focus window clients".to_string(),
            ));
        }

        self.blur_all();
        let client = self
            .clients
            .get_mut(id)
            .ok_or_else(|| ServiceWorkerError::NotFound(id.to_string()))?;
        client.focus()?;
        Ok(&*client)
    }

    /// Put every client under `version`. Returns the IDs whose controller changed.
    pub fn claim(&mut self, version: &CacheVersion) -> Vec<String> {
        let mut changed: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| c.controller.as_ref() != Some(version))
            .map(|c| {
                c.controller = Some(version.clone());
                c.id.clone()
            })
            .collect();
        changed.sort();
        changed
    }

    /// Set one client's controller. Returns whether it changed.
    pub fn set_controller(&mut self, id: &str, version: &CacheVersion) -> bool {
        match self.clients.get_mut(id) {
            Some(client) if client.controller.as_ref() != Some(version) => {
                client.controller = Some(version.clone());
                true
            }
            _ => false,
        }
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    fn blur_all(&mut self) {
        for client in self.clients.values_mut() {
            client.focused = false;
        }
    }
}
