//! The agent and its event dispatch table.
//!
//! The host delivers every event through [`Agent::dispatch`]. Lifecycle
//! changes come back on the channel returned by [`Agent::new`].
//!
//! The agent is built with the manifest of the running build. When the store
//! already holds an activated version, that version serves requests straight
//! away; nothing has to be reinstalled after a restart.

use bytes::Bytes;
use offkit_core::{AgentConfig, CacheVersion, Manifest, PrecacheAsset};
use offkit_net::{Fetcher, Request};
use offkit_router::{RequestRouter, RouterOptions};
use offkit_store::PrecacheStore;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::{Client, Clients};
use crate::fetch::{FetchError, FetchEvent, FetchHandler, FetchResponse};
use crate::lifecycle::{ActivateReport, InstallReport, Installer};
use crate::push::{self, ClickOutcome, Notification, Notifier, PushDispatcher};
use crate::registration::{AgentEvent, LifecyclePolicy, Registration, ServiceWorker};
use crate::ServiceWorkerError;

// ==================== Events ====================

/// Events the host delivers to the agent.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// Install the manifest the agent was built with.
    Install,
    /// Install a newer manifest.
    Update(Manifest),
    /// Activate the waiting version if nothing holds it back.
    Activate,
    Fetch(FetchEvent),
    /// A push message with its raw payload.
    Push(Option<Bytes>),
    NotificationClick(Notification),
    /// A message posted by a page.
    Message(Value),
}

/// Messages pages may post to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMessage {
    /// Activate the waiting version without waiting for clients to close.
    SkipWaiting,
    /// Report the active version.
    GetVersion,
}

impl AgentMessage {
    /// Parse `{"type": "..."}`.
    pub fn parse(value: &Value) -> Option<Self> {
        match value.get("type").and_then(Value::as_str)? {
            "SKIP_WAITING" => Some(AgentMessage::SkipWaiting),
            "GET_VERSION" => Some(AgentMessage::GetVersion),
            _ => None,
        }
    }
}

/// Result of an install, including the activation it may have triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallOutcome {
    pub version: CacheVersion,
    pub report: InstallReport,
    pub activation: Option<ActivateReport>,
}

/// What handling a [`HostEvent`] produced.
#[derive(Debug)]
pub enum DispatchOutcome {
    Installed(InstallOutcome),
    Activated(Option<ActivateReport>),
    Response(Result<FetchResponse, FetchError>),
    Notified(Notification),
    Clicked(ClickOutcome),
    Version(Option<CacheVersion>),
    Ignored,
}

// ==================== Agent ====================

/// Rebuild the worker for the version the store last activated.
///
/// Assets come from `manifest` when it is that version, otherwise from the
/// keys stored under it.
fn restore_active(
    options: &RouterOptions,
    manifest: &Manifest,
    store: &dyn PrecacheStore,
) -> Result<Option<ServiceWorker>, ServiceWorkerError> {
    let version = match store.active_version() {
        Ok(Some(version)) => version,
        Ok(None) => {
            debug!(scope = %options.scope, "Store is empty");
            return Ok(None);
        }
        Err(e) => {
            warn!(error = %e, "Could not read active version");
            return Ok(None);
        }
    };

    let assets = if &version == manifest.version() {
        manifest.resolve(&options.scope)?
    } else {
        match store.keys() {
            Ok(keys) => keys
                .into_iter()
                .filter(|stored| stored.version == version)
                .filter_map(|stored| PrecacheAsset::from_key(stored.key))
                .collect(),
            Err(e) => {
                warn!(version = %version, error = %e, "Could not list stored keys");
                return Ok(None);
            }
        }
    };

    info!(scope = %options.scope, version = %version, assets = assets.len(), "Store holds an active version");
    let router = RequestRouter::new(options.clone(), &assets);
    Ok(Some(ServiceWorker::new(version, assets, router)))
}

/// The offline agent for one scope.
pub struct Agent {
    config: AgentConfig,
    manifest: Manifest,
    router_options: RouterOptions,
    store: Arc<dyn PrecacheStore>,
    fetcher: Arc<dyn Fetcher>,
    installer: Installer,
    push: PushDispatcher,
    registration: RwLock<Registration>,
    clients: RwLock<Clients>,
    event_tx: mpsc::UnboundedSender<AgentEvent>,
}

impl Agent {
    /// Create an agent for `manifest`.
    ///
    /// The version the store last activated, if any, is restored as the
    /// active worker. `manifest` itself is installed on [`HostEvent::Install`].
    pub fn new(
        config: AgentConfig,
        manifest: Manifest,
        store: Arc<dyn PrecacheStore>,
        fetcher: Arc<dyn Fetcher>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AgentEvent>), ServiceWorkerError> {
        config.validate()?;
        let router_options = RouterOptions::from_config(&config)?;
        let push = PushDispatcher::from_config(&config, notifier)?;
        let installer = Installer::new(Arc::clone(&store), Arc::clone(&fetcher))
            .with_retry(config.precache_retry.clone())
            .with_concurrency(config.precache_concurrency);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut registration = Registration::new(router_options.scope.clone(), event_tx.clone());
        if let Some(worker) = restore_active(&router_options, &manifest, store.as_ref())? {
            registration.restore(worker);
        }

        Ok((
            Self {
                config,
                manifest,
                router_options,
                store,
                fetcher,
                installer,
                push,
                registration: RwLock::new(registration),
                clients: RwLock::new(Clients::new()),
                event_tx,
            },
            event_rx,
        ))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Manifest the agent was built with.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn scope(&self) -> &Url {
        &self.router_options.scope
    }

    pub fn store(&self) -> &Arc<dyn PrecacheStore> {
        &self.store
    }

    /// Version currently serving requests.
    pub async fn active_version(&self) -> Option<CacheVersion> {
        self.registration.read().await.active_version().cloned()
    }

    /// Version waiting to activate.
    pub async fn waiting_version(&self) -> Option<CacheVersion> {
        self.registration
            .read()
            .await
            .waiting()
            .map(|w| w.version.clone())
    }

    /// Handle one host event.
    pub async fn dispatch(&self, event: HostEvent) -> Result<DispatchOutcome, ServiceWorkerError> {
        match event {
            HostEvent::Install => self
                .install(self.manifest.clone())
                .await
                .map(DispatchOutcome::Installed),
            HostEvent::Update(manifest) => self.install(manifest).await.map(DispatchOutcome::Installed),
            HostEvent::Activate => Ok(DispatchOutcome::Activated(self.try_activate().await)),
            HostEvent::Fetch(event) => Ok(DispatchOutcome::Response(self.handle_fetch(event).await)),
            HostEvent::Push(raw) => Ok(DispatchOutcome::Notified(
                self.push.on_push(raw.as_deref()).await,
            )),
            HostEvent::NotificationClick(notification) => self
                .notification_click(&notification)
                .await
                .map(DispatchOutcome::Clicked),
            HostEvent::Message(value) => Ok(self.message(&value).await),
        }
    }

    // ==================== Lifecycle ====================

    /// Install `manifest` as the next version, then activate it if allowed.
    ///
    /// When `manifest` is the active version, only entries missing from the
    /// store are downloaded. Fails with [`ServiceWorkerError::Superseded`]
    /// when a newer install started before this one finished.
    pub async fn install(&self, manifest: Manifest) -> Result<InstallOutcome, ServiceWorkerError> {
        let current = self
            .registration
            .read()
            .await
            .active()
            .filter(|worker| &worker.version == manifest.version())
            .map(ServiceWorker::install_job);
        if let Some(job) = current {
            info!(version = %job.version, "Version already active, filling in missing entries");
            let report = self.installer.install(&job).await?;
            return Ok(InstallOutcome {
                version: job.version,
                report,
                activation: None,
            });
        }

        let assets = manifest.resolve(&self.router_options.scope)?;
        let router = RequestRouter::new(self.router_options.clone(), &assets);
        let version = manifest.version().clone();
        let worker = ServiceWorker::new(version.clone(), assets, router);

        let job = self.registration.write().await.update(worker);
        let report = self.installer.install(&job).await?;
        self.registration.write().await.install_complete(&job)?;

        let activation = self.try_activate().await;
        if activation.is_none() {
            info!(version = %version, "Installed, waiting for clients of the previous version");
        }

        Ok(InstallOutcome {
            version,
            report,
            activation,
        })
    }

    /// Activate the waiting version if the policy allows it now.
    pub async fn try_activate(&self) -> Option<ActivateReport> {
        let mut registration = self.registration.write().await;
        let policy = self.policy();
        {
            let clients = self.clients.read().await;
            if !registration.can_activate(policy, &clients) {
                return None;
            }
        }

        let report = registration.activate(self.store.as_ref())?;
        if policy.claim_clients {
            self.claim(&report.version).await;
        }
        Some(report)
    }

    /// Ask the waiting version, or the one installing, to activate without
    /// waiting for clients to close. Dropped when neither exists.
    pub async fn skip_waiting(&self) -> Option<ActivateReport> {
        if !self.registration.write().await.request_skip_waiting() {
            debug!("Skip waiting requested with no new version");
            return None;
        }
        self.try_activate().await
    }

    fn policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            skip_waiting: self.config.skip_waiting,
            claim_clients: self.config.claim_clients,
        }
    }

    async fn claim(&self, version: &CacheVersion) {
        let changed = self.clients.write().await.claim(version);
        info!(version = %version, clients = changed.len(), "Claimed clients");
        for client_id in changed {
            self.emit(AgentEvent::ControllerChange {
                client_id,
                version: version.clone(),
            });
        }
    }

    // ==================== Clients ====================

    /// Record a newly opened page. It is controlled by the active version, if any.
    pub async fn client_opened(&self, id: impl Into<String>, url: Url) -> Client {
        let controller = self.active_version().await;
        let mut client = Client::window(id, url);
        client.controller = controller;
        self.clients.write().await.add(client.clone());
        client
    }

    /// Forget a closed page. Its departure may let a waiting version activate.
    pub async fn client_closed(&self, id: &str) -> Option<ActivateReport> {
        if self.clients.write().await.remove(id).is_none() {
            debug!(client = id, "Closed unknown client");
        }
        self.try_activate().await
    }

    pub async fn client(&self, id: &str) -> Option<Client> {
        self.clients.read().await.get(id).cloned()
    }

    // ==================== Fetch ====================

    /// Answer an intercepted request.
    ///
    /// Without an active version, or for sub-resources of a page no version
    /// controls, the request goes to the network untouched.
    pub async fn handle_fetch(&self, event: FetchEvent) -> Result<FetchResponse, FetchError> {
        let (router, version) = {
            let registration = self.registration.read().await;
            match registration.active() {
                Some(worker) => (worker.router(), worker.version.clone()),
                None => return self.passthrough(event.request).await,
            }
        };

        let navigation = event.is_navigation();
        if !navigation {
            if let Some(id) = &event.client_id {
                let controlled = self
                    .clients
                    .read()
                    .await
                    .get(id)
                    .map_or(true, Client::is_controlled);
                if !controlled {
                    return self.passthrough(event.request).await;
                }
            }
        }

        let handler = FetchHandler::new(&router, self.store.as_ref(), self.fetcher.as_ref());
        let response = handler.respond(event.request).await;

        if navigation {
            if let Some(id) = &event.resulting_client_id {
                if self.clients.write().await.set_controller(id, &version) {
                    self.emit(AgentEvent::ControllerChange {
                        client_id: id.clone(),
                        version,
                    });
                }
            }
        }

        response
    }

    async fn passthrough(&self, request: Request) -> Result<FetchResponse, FetchError> {
        let response = self.fetcher.fetch(request).await?;
        Ok(FetchResponse::from_network(response))
    }

    // ==================== Push ====================

    /// Render and show the notification for a push payload.
    pub async fn on_push(&self, raw: Option<&[u8]>) -> Notification {
        self.push.on_push(raw).await
    }

    /// Focus or open a window for a clicked notification.
    pub async fn notification_click(
        &self,
        notification: &Notification,
    ) -> Result<ClickOutcome, ServiceWorkerError> {
        let controller = self.active_version().await;
        let mut clients = self.clients.write().await;
        push::handle_click(&mut clients, notification, controller)
    }

    // ==================== Messages ====================

    async fn message(&self, value: &Value) -> DispatchOutcome {
        match AgentMessage::parse(value) {
            Some(AgentMessage::SkipWaiting) => DispatchOutcome::Activated(self.skip_waiting().await),
            Some(AgentMessage::GetVersion) => DispatchOutcome::Version(self.active_version().await),
            None => {
                debug!(message = %value, "Ignoring unknown message");
                DispatchOutcome::Ignored
            }
        }
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.event_tx.send(event);
    }
}
