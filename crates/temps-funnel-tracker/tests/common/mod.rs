//! Shared fixtures for tracker integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use parking_lot::Mutex;
use serde_json::Value;
use temps_funnel_tracker::{
    FunnelDefinition, FunnelTracker, History, HttpClient, InteractionBus, ManualClock,
    MemoryStorage, QueuedEvent, StepDefinition, Storage, TrackerConfig, TrackerError,
    TrackerResult,
};

pub const SITE_ID: &str = "site-1";

/// HTTP fake that serves fixed definitions and records every POST
#[derive(Default)]
pub struct RecordingHttp {
    pub definitions: Mutex<Value>,
    pub get_calls: AtomicUsize,
    pub fail_get: AtomicBool,
    pub fail_post: AtomicBool,
    pub posted: Mutex<Vec<QueuedEvent>>,
}

impl RecordingHttp {
    pub fn serving(definitions: Value) -> Arc<Self> {
        Arc::new(Self {
            definitions: Mutex::new(definitions),
            ..Default::default()
        })
    }

    pub fn gets(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn posted(&self) -> Vec<QueuedEvent> {
        self.posted.lock().clone()
    }

    pub fn set_failing_posts(&self, failing: bool) {
        self.fail_post.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl HttpClient for RecordingHttp {
    async fn get_json(&self, _url: &str) -> TrackerResult<Value> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(TrackerError::HttpStatus {
                status: 500,
                url: "/funnels/active".to_string(),
            });
        }
        Ok(self.definitions.lock().clone())
    }

    async fn post_json(&self, _url: &str, body: String) -> TrackerResult<()> {
        if self.fail_post.load(Ordering::SeqCst) {
            return Err(TrackerError::Network("connection refused".to_string()));
        }
        let event: QueuedEvent = serde_json::from_str(&body)?;
        self.posted.lock().push(event);
        Ok(())
    }
}

pub fn checkout_funnel() -> FunnelDefinition {
    FunnelDefinition::new(
        "F1",
        "Checkout",
        vec![
            StepDefinition::page("Cart", "/cart"),
            StepDefinition::page("Checkout", "/checkout"),
            StepDefinition::page("Thank you", "/thank-you"),
        ],
    )
}

pub fn definitions_payload(funnels: &[FunnelDefinition]) -> Value {
    serde_json::to_value(funnels).expect("definitions serialize")
}

/// A tracker wired to fakes, plus handles to drive it
pub struct Harness {
    pub tracker: FunnelTracker,
    pub clock: Arc<ManualClock>,
    pub storage: Arc<MemoryStorage>,
    pub http: Arc<RecordingHttp>,
    pub history: Arc<History>,
    pub interactions: Arc<InteractionBus>,
}

impl Harness {
    pub async fn start(funnels: &[FunnelDefinition]) -> Self {
        let clock = Arc::new(ManualClock::default());
        let storage = Arc::new(MemoryStorage::new(clock.clone()));
        let http = RecordingHttp::serving(definitions_payload(funnels));
        Self::start_with(clock, storage, http, "/").await
    }

    pub async fn start_with(
        clock: Arc<ManualClock>,
        storage: Arc<MemoryStorage>,
        http: Arc<RecordingHttp>,
        initial_url: &str,
    ) -> Self {
        let history = Arc::new(History::new(initial_url));
        let interactions = Arc::new(InteractionBus::new());
        let tracker = FunnelTracker::builder(TrackerConfig::new(SITE_ID))
            .clock(clock.clone())
            .storage(storage.clone() as Arc<dyn Storage>)
            .http(http.clone())
            .navigation(history.clone())
            .interactions(interactions.clone())
            .build()
            .await
            .expect("tracker starts with a site id");

        Self {
            tracker,
            clock,
            storage,
            http,
            history,
            interactions,
        }
    }

    /// Move the clock forward and fire whatever became due
    pub async fn advance(&self, millis: i64) {
        self.clock.advance(Duration::milliseconds(millis));
        self.tracker.run_pending().await;
    }

    /// Navigate and let the settle timer evaluate the new page
    pub async fn visit(&self, url: &str) {
        self.history.push_state(url);
        self.advance(100).await;
    }
}
