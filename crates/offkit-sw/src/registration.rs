//! Worker slots and lifecycle transitions.

use offkit_core::{CacheVersion, PrecacheAsset};
use offkit_router::RequestRouter;
use offkit_store::PrecacheStore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

use crate::clients::Clients;
use crate::lifecycle::{self, ActivateReport, InstallGate, InstallJob};
use crate::ServiceWorkerError;

// ==================== Types ====================

/// Unique identifier for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Precaching the manifest.
    Installing,
    /// Installed, waiting for the previous version to let go.
    Waiting,
    /// Removing entries that belong to other versions.
    Activating,
    /// Serving requests.
    Active,
    /// Superseded or replaced. Terminal.
    Redundant,
}

/// When a waiting worker may take over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecyclePolicy {
    pub skip_waiting: bool,
    pub claim_clients: bool,
}

/// Lifecycle notifications for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// A worker changed state.
    StateChange {
        worker_id: ServiceWorkerId,
        version: CacheVersion,
        state: WorkerState,
    },
    /// A new version started installing.
    UpdateFound { version: CacheVersion },
    /// A client is now controlled by `version`.
    ControllerChange { client_id: String, version: CacheVersion },
}

// ==================== Service Worker ====================

/// One version of the agent: a manifest and the router built from it.
#[derive(Debug)]
pub struct ServiceWorker {
    pub id: ServiceWorkerId,
    pub version: CacheVersion,
    pub state: WorkerState,
    pub state_changed_at: Instant,
    assets: Arc<Vec<PrecacheAsset>>,
    router: Arc<RequestRouter>,
    gate: InstallGate,
}

impl ServiceWorker {
    pub fn new(version: CacheVersion, assets: Vec<PrecacheAsset>, router: RequestRouter) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            version,
            state: WorkerState::Installing,
            state_changed_at: Instant::now(),
            assets: Arc::new(assets),
            router: Arc::new(router),
            gate: InstallGate::default(),
        }
    }

    pub fn assets(&self) -> &[PrecacheAsset] {
        &self.assets
    }

    pub fn router(&self) -> Arc<RequestRouter> {
        Arc::clone(&self.router)
    }

    pub fn is_active(&self) -> bool {
        self.state == WorkerState::Active
    }

    pub fn is_redundant(&self) -> bool {
        self.state == WorkerState::Redundant
    }

    /// Work order for the installer, sharing this worker's cancellation flag.
    pub fn install_job(&self) -> InstallJob {
        InstallJob {
            worker_id: self.id,
            version: self.version.clone(),
            assets: Arc::clone(&self.assets),
            gate: self.gate.clone(),
        }
    }

    fn cancel(&self) {
        self.gate.cancel();
    }
}

// ==================== Registration ====================

/// The installing, waiting and active workers for one scope.
#[derive(Debug)]
pub struct Registration {
    /// Scope URL.
    pub scope: Url,

    installing: Option<ServiceWorker>,
    waiting: Option<ServiceWorker>,
    active: Option<ServiceWorker>,

    /// Worker a page asked to skip waiting.
    skip_waiting: Option<ServiceWorkerId>,

    event_tx: mpsc::UnboundedSender<AgentEvent>,
}

impl Registration {
    pub fn new(scope: Url, event_tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            skip_waiting: None,
            event_tx,
        }
    }

    pub fn installing(&self) -> Option<&ServiceWorker> {
        self.installing.as_ref()
    }

    pub fn waiting(&self) -> Option<&ServiceWorker> {
        self.waiting.as_ref()
    }

    pub fn active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    pub fn active_version(&self) -> Option<&CacheVersion> {
        self.active.as_ref().map(|w| &w.version)
    }

    /// Router of the active worker, if any.
    pub fn active_router(&self) -> Option<Arc<RequestRouter>> {
        self.active.as_ref().map(ServiceWorker::router)
    }

    /// Put a worker for an already activated version straight into the
    /// active slot, as after a restart.
    pub fn restore(&mut self, mut worker: ServiceWorker) {
        if let Some(mut old) = self.active.take() {
            self.transition(&mut old, WorkerState::Redundant);
        }
        info!(version = %worker.version, "Restored active worker");
        self.transition(&mut worker, WorkerState::Active);
        self.active = Some(worker);
    }

    /// Let the waiting worker, or the one installing, activate without
    /// waiting for clients to close.
    ///
    /// Returns false when there is no such worker; the request is dropped.
    pub fn request_skip_waiting(&mut self) -> bool {
        self.skip_waiting = self.waiting.as_ref().or(self.installing.as_ref()).map(|w| w.id);
        self.skip_waiting.is_some()
    }

    fn skip_waiting_requested(&self) -> bool {
        matches!((&self.waiting, self.skip_waiting), (Some(waiting), Some(id)) if waiting.id == id)
    }

    /// Start installing `worker`.
    ///
    /// Any worker still installing or waiting is superseded: its cancellation
    /// flag is raised so its install loop stops before the next store write.
    pub fn update(&mut self, mut worker: ServiceWorker) -> InstallJob {
        for mut old in [self.installing.take(), self.waiting.take()].into_iter().flatten() {
            old.cancel();
            info!(version = %old.version, by = %worker.version, "Worker superseded");
            self.transition(&mut old, WorkerState::Redundant);
        }

        let _ = self.event_tx.send(AgentEvent::UpdateFound {
            version: worker.version.clone(),
        });
        self.transition(&mut worker, WorkerState::Installing);

        let job = worker.install_job();
        self.installing = Some(worker);
        job
    }

    /// Move the finished install into the waiting slot.
    pub fn install_complete(&mut self, job: &InstallJob) -> Result<(), ServiceWorkerError> {
        match self.installing.take() {
            Some(mut worker) if worker.id == job.worker_id && !job.is_cancelled() => {
                self.transition(&mut worker, WorkerState::Waiting);
                self.waiting = Some(worker);
                Ok(())
            }
            other => {
                self.installing = other;
                Err(ServiceWorkerError::Superseded(job.version.clone()))
            }
        }
    }

    /// Whether the waiting worker may activate now.
    ///
    /// True when skip-waiting is configured or was requested for this worker,
    /// when nothing is active yet, or when no client is still controlled by
    /// the active version.
    pub fn can_activate(&self, policy: LifecyclePolicy, clients: &Clients) -> bool {
        if self.waiting.is_none() {
            return false;
        }
        match &self.active {
            None => true,
            Some(_) if policy.skip_waiting || self.skip_waiting_requested() => true,
            Some(active) => !clients.any_controlled_by(&active.version),
        }
    }

    /// Activate the waiting worker.
    ///
    /// Returns `None` when nothing is waiting. Store failures are logged by
    /// the activation step and never keep the worker from becoming active.
    pub fn activate(&mut self, store: &dyn PrecacheStore) -> Option<ActivateReport> {
        let mut worker = self.waiting.take()?;
        self.skip_waiting = None;
        self.transition(&mut worker, WorkerState::Activating);

        let previous = self.active.as_ref().map(|w| w.version.clone());
        let report = lifecycle::activate(store, &worker.version, previous);

        if let Some(mut old) = self.active.take() {
            self.transition(&mut old, WorkerState::Redundant);
        }
        self.transition(&mut worker, WorkerState::Active);
        self.active = Some(worker);
        Some(report)
    }

    fn transition(&self, worker: &mut ServiceWorker, state: WorkerState) {
        debug!(worker = worker.id.raw(), version = %worker.version, from = ?worker.state, to = ?state, "Worker state change");
        worker.state = state;
        worker.state_changed_at = Instant::now();
        let _ = self.event_tx.send(AgentEvent::StateChange {
            worker_id: worker.id,
            version: worker.version.clone(),
            state,
        });
    }
}
