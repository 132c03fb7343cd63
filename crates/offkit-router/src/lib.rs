//! # Offkit Router
//!
//! Decides where each intercepted request is answered from.
//!
//! ```text
//! classify(url, method)
//!     ├── not GET            → BypassToNetwork
//!     ├── denylisted         → BypassToNetwork
//!     ├── precached variant  → ServeFromPrecache(key)
//!     └── otherwise          → NetworkWithFallback
//!
//! plan_navigation(url)
//!     ├── out of scope / denylisted → PassThrough
//!     └── otherwise                 → AppShell | NetworkFirst
//! ```

pub mod navigation;
pub mod pattern;
pub mod router;

pub use navigation::NavigationPlan;
pub use pattern::{Denylist, PatternType, UrlPattern};
pub use router::{RequestRouter, RouteDecision, RouterOptions};
