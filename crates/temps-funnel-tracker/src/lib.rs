//! Client-side funnel tracking for Temps analytics
//!
//! Watches navigations, clicks and custom application events, advances each
//! active funnel's state machine and reports progress, dropoff and conversion
//! events to the Temps collector.
//!
//! ```no_run
//! use std::sync::Arc;
//! use temps_funnel_tracker::{FunnelTracker, History, TrackerConfig};
//!
//! # async fn run() {
//! let history = Arc::new(History::new("/"));
//! let tracker = FunnelTracker::builder(TrackerConfig::new("my-site"))
//!     .navigation(history.clone())
//!     .build()
//!     .await;
//!
//! if let Some(tracker) = tracker {
//!     tracker.spawn_driver();
//!     history.push_state("/cart");
//!     tracker.track_event("signup");
//!     tracker.teardown().await;
//! }
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod definitions;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod identity;
pub mod interactions;
pub mod listeners;
pub mod machine;
pub mod matcher;
pub mod navigation;
pub mod scheduler;
pub mod signals;
pub mod storage;
pub mod tracker;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock, UtcDateTime};
pub use config::TrackerConfig;
pub use definitions::{DefinitionCache, DefinitionSet};
pub use dispatcher::EventDispatcher;
pub use error::{TrackerError, TrackerResult};
pub use http::{BeaconHandle, HttpClient, ReqwestClient};
pub use identity::IdentityStore;
pub use interactions::{Element, Interaction, InteractionBus};
pub use listeners::{Listener, ListenerId};
pub use machine::{FunnelStateMachine, Outcome, Transition};
pub use navigation::{History, NavigationChange, NavigationKind, NavigationSource};
pub use signals::LocalSignals;
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use tracker::{FunnelTracker, FunnelTrackerBuilder};
pub use types::{
    FunnelDefinition, FunnelEventType, FunnelRuntimeState, QueuedEvent, StepDefinition, StepType,
};
