//! # Offkit Agent Runtime
//!
//! The background agent that keeps an installed web app usable offline.
//!
//! ## Features
//!
//! - **Lifecycle**: install, wait, activate and retire precache versions
//! - **Fetch Interception**: precache-first sub-resources, app shell navigations
//! - **Clients API**: controlled windows, claim, focus, open
//! - **Push**: render notifications from push payloads, handle clicks
//!
//! ## Architecture
//!
//! ```text
//! Agent (dispatch table)
//!     │
//!     ├── Registration
//!     │       ├── installing (ServiceWorker)
//!     │       ├── waiting (ServiceWorker)
//!     │       └── active (ServiceWorker) ── RequestRouter
//!     │
//!     ├── Clients
//!     ├── PushDispatcher ── Notifier
//!     └── PrecacheStore / Fetcher
//! ```

use offkit_common::OffkitError;
use offkit_core::{CacheVersion, ConfigError, ManifestError};
use offkit_store::StoreError;
use thiserror::Error;

pub mod agent;
pub mod clients;
pub mod extendable;
pub mod fetch;
pub mod lifecycle;
pub mod push;
pub mod registration;

pub use agent::{Agent, AgentMessage, DispatchOutcome, HostEvent, InstallOutcome};
pub use clients::{Client, ClientMatchOptions, ClientType, Clients};
pub use extendable::ExtendableEvent;
pub use fetch::{FetchError, FetchEvent, FetchHandler, FetchResponse, ResponseSource};
pub use lifecycle::{ActivateReport, InstallJob, InstallReport, Installer};
pub use push::{
    handle_click, ClickOutcome, LogNotifier, Notification, NotificationPayload, Notifier,
    PushDispatcher,
};
pub use registration::{
    AgentEvent, LifecyclePolicy, Registration, ServiceWorker, ServiceWorkerId, WorkerState,
};

// ==================== Errors ====================

/// Errors that can occur in agent operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Version {0} was superseded before it finished installing")]
    Superseded(CacheVersion),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl From<ServiceWorkerError> for OffkitError {
    fn from(e: ServiceWorkerError) -> Self {
        match e {
            ServiceWorkerError::Manifest(e) => e.into(),
            ServiceWorkerError::Config(e) => e.into(),
            ServiceWorkerError::Storage(e) => e.into(),
            ServiceWorkerError::NotFound(what) => OffkitError::NotFound(what),
            ServiceWorkerError::Superseded(_) => OffkitError::Cancelled,
            other => OffkitError::lifecycle(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let superseded = ServiceWorkerError::Superseded(CacheVersion::new("v2").unwrap());
        assert!(matches!(OffkitError::from(superseded), OffkitError::Cancelled));

        let state: OffkitError = ServiceWorkerError::StateError("no waiting worker".into()).into();
        assert_eq!(state.category(), "lifecycle");

        let missing: OffkitError = ServiceWorkerError::NotFound("client-1".into()).into();
        assert!(matches!(missing, OffkitError::NotFound(_)));
    }
}
