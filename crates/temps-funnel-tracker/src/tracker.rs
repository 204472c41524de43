//! Funnel tracker facade
//!
//! [`FunnelTracker`] wires identity, definitions, the state machine, the
//! watchers and the dispatcher together and is the only type the host talks
//! to. Every entry point degrades instead of failing: storage and network
//! problems are logged and tracking carries on with what it has.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Duration;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock, UtcDateTime};
use crate::config::{
    TrackerConfig, DRIVER_TICK, FLUSH_DEBOUNCE, INITIAL_EVALUATION_DELAY, NAVIGATION_SETTLE_DELAY,
    SNAPSHOT_DEBOUNCE,
};
use crate::definitions::DefinitionCache;
use crate::dispatcher::EventDispatcher;
use crate::error::{degrade, TrackerError, TrackerResult};
use crate::http::{HttpClient, ReqwestClient};
use crate::identity::IdentityStore;
use crate::interactions::{Element, Interaction, InteractionBus};
use crate::listeners::{Listener, ListenerId, Listeners};
use crate::machine::{FunnelStateMachine, Outcome, Transition};
use crate::navigation::{History, NavigationChange, NavigationSource, NavigationWatcher};
use crate::scheduler::{Scheduler, TimerName};
use crate::signals::LocalSignals;
use crate::storage::{
    queue_key, state_key, MemoryStorage, Storage, SESSION_ID_KEY, VISITOR_ID_KEY,
};
use crate::types::{FunnelDefinition, FunnelRuntimeState, QueuedEvent};

/// Collaborators default to the wall clock, in-memory storage, a `reqwest`
/// client, a fresh [`History`] at `/` and a private [`InteractionBus`].
pub struct FunnelTrackerBuilder {
    config: TrackerConfig,
    clock: Option<Arc<dyn Clock>>,
    storage: Option<Arc<dyn Storage>>,
    http: Option<Arc<dyn HttpClient>>,
    navigation: Option<Arc<dyn NavigationSource>>,
    interactions: Option<Arc<InteractionBus>>,
}

impl FunnelTrackerBuilder {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            clock: None,
            storage: None,
            http: None,
            navigation: None,
            interactions: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn http(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn navigation(mut self, navigation: Arc<dyn NavigationSource>) -> Self {
        self.navigation = Some(navigation);
        self
    }

    pub fn interactions(mut self, interactions: Arc<InteractionBus>) -> Self {
        self.interactions = Some(interactions);
        self
    }

    /// Start tracking. `None` when no site id is configured; nothing is
    /// read, written or subscribed in that case.
    pub async fn build(self) -> Option<FunnelTracker> {
        let Some(site_id) = self.config.site_id().map(str::to_string) else {
            debug!("No site id configured, funnel tracking disabled");
            return None;
        };

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let storage: Arc<dyn Storage> = match self.storage {
            Some(storage) => storage,
            None => Arc::new(MemoryStorage::new(clock.clone())),
        };
        let http: Arc<dyn HttpClient> = match self.http {
            Some(http) => http,
            None => Arc::new(degrade(
                ReqwestClient::new(self.config.request_timeout()),
                "Creating funnel HTTP client",
            )?),
        };
        let navigation: Arc<dyn NavigationSource> = match self.navigation {
            Some(navigation) => navigation,
            None => Arc::new(History::new("/")),
        };
        let interactions = self
            .interactions
            .unwrap_or_else(|| Arc::new(InteractionBus::new()));

        let identity = IdentityStore::new(storage.clone(), clock.clone());
        let visitor_id = identity.get_or_create(VISITOR_ID_KEY, self.config.visitor_ttl());
        let session_id = identity.get_or_create_sliding(SESSION_ID_KEY, self.config.session_ttl());
        debug!("Funnel tracking visitor {} in session {}", visitor_id, session_id);

        let definitions = DefinitionCache::new(
            self.config.clone(),
            storage.clone(),
            http.clone(),
            clock.clone(),
        )
        .load(&site_id)
        .await;
        let validated = definitions.validated;

        let mut machine = FunnelStateMachine::new(definitions.funnels);
        let saved_states = degrade(
            read_json::<HashMap<String, FunnelRuntimeState>>(storage.as_ref(), &state_key(&site_id)),
            "Restoring funnel state",
        )
        .flatten();
        if let Some(saved_states) = saved_states {
            let restored = machine.restore(saved_states);
            debug!("Restored state of {} funnels", restored);
        }

        let signals = Arc::new(LocalSignals::new());
        let dispatcher = EventDispatcher::new(
            http,
            self.config.track_url(),
            self.config.use_beacon,
            signals.clone(),
        );
        let outbox = degrade(
            read_json::<Vec<QueuedEvent>>(storage.as_ref(), &queue_key(&site_id)),
            "Restoring funnel outbox",
        )
        .flatten()
        .unwrap_or_default();
        if !outbox.is_empty() {
            info!("Restored {} undelivered funnel events", outbox.len());
            dispatcher.restore(outbox);
        }

        let funnel_count = machine.definitions().len();
        let tracker = FunnelTracker {
            inner: Arc::new(TrackerInner {
                config: self.config,
                site_id,
                clock,
                storage,
                identity,
                machine: Mutex::new(machine),
                scheduler: Mutex::new(Scheduler::new()),
                watcher: Mutex::new(NavigationWatcher::new()),
                pending_path: Mutex::new(None),
                dispatcher,
                signals,
                observers: Listeners::new(),
                navigation,
                interactions,
                subscriptions: Mutex::new(Subscriptions::default()),
                shutdown: CancellationToken::new(),
                driver: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        };

        if !tracker.inner.dispatcher.is_empty() {
            tracker.inner.schedule(TimerName::FlushTrigger, FLUSH_DEBOUNCE);
        }

        if validated {
            tracker.attach();
            tracker
                .inner
                .schedule(TimerName::InitialEvaluation, INITIAL_EVALUATION_DELAY);
        } else {
            warn!("Funnel definitions unavailable, navigation and interactions are not watched");
        }

        info!(
            "Funnel tracker started for site {} with {} active funnels",
            tracker.inner.site_id, funnel_count
        );
        Some(tracker)
    }
}

#[derive(Default)]
struct Subscriptions {
    navigation: Option<ListenerId>,
    interactions: Option<ListenerId>,
}

struct TrackerInner {
    config: TrackerConfig,
    site_id: String,
    clock: Arc<dyn Clock>,
    storage: Arc<dyn Storage>,
    identity: IdentityStore,
    machine: Mutex<FunnelStateMachine>,
    scheduler: Mutex<Scheduler>,
    watcher: Mutex<NavigationWatcher>,
    /// Path waiting for the navigation settle timer
    pending_path: Mutex<Option<String>>,
    dispatcher: EventDispatcher,
    signals: Arc<LocalSignals>,
    observers: Listeners<Transition>,
    navigation: Arc<dyn NavigationSource>,
    interactions: Arc<InteractionBus>,
    subscriptions: Mutex<Subscriptions>,
    shutdown: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Clears the funnel's latch however the mutation exits
struct MutationGuard<'a> {
    inner: &'a TrackerInner,
    funnel_id: &'a str,
}

impl Drop for MutationGuard<'_> {
    fn drop(&mut self) {
        self.inner.machine.lock().finish(self.funnel_id);
    }
}

impl TrackerInner {
    fn schedule(&self, timer: TimerName, delay: Duration) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let deadline = self.clock.now() + delay;
        self.scheduler.lock().arm(timer, deadline);
    }

    /// Run one latched mutation of `funnel_id`. False when the funnel is
    /// unknown or already mutating, or when nothing changed.
    fn mutate<F>(&self, funnel_id: &str, apply: F) -> bool
    where
        F: FnOnce(&mut FunnelStateMachine, UtcDateTime) -> Outcome,
    {
        if !self.machine.lock().try_begin(funnel_id) {
            if self.config.debug {
                debug!(
                    "Funnel {} is already updating, dropping overlapping call",
                    funnel_id
                );
            }
            return false;
        }
        let _guard = MutationGuard {
            inner: self,
            funnel_id,
        };

        let now = self.clock.now();
        let outcome = {
            let mut machine = self.machine.lock();
            apply(&mut machine, now)
        };

        let Outcome::Committed(transition) = outcome else {
            return false;
        };
        self.schedule(TimerName::SnapshotWriter, SNAPSHOT_DEBOUNCE);

        if let Some(transition) = transition {
            // Observers run with the latch still held
            self.observers.emit(&transition);
            let event = self.queued_event(transition, now);
            if self.dispatcher.enqueue(event) {
                debug!("Funnel event queue was empty, flush scheduled");
            }
            self.schedule(TimerName::FlushTrigger, FLUSH_DEBOUNCE);
        }
        true
    }

    fn queued_event(&self, transition: Transition, now: UtcDateTime) -> QueuedEvent {
        let Transition {
            funnel_id,
            event_type,
            step_number,
            step_name,
            step_type,
            state,
            dropoff_reason,
            value,
            data,
            page_path,
        } = transition;

        QueuedEvent {
            funnel_id,
            website_id: self.site_id.clone(),
            visitor_id: self.visitor_id(),
            session_id: self.session_id(),
            event_type,
            step_number,
            step_name,
            step_type,
            current_step: state.current_step,
            completed_steps: state.completed_steps,
            started_at: state.started_at,
            last_activity: state.last_activity,
            converted: state.converted,
            dropoff_reason,
            value,
            data,
            page_path,
            timestamp: now,
        }
    }

    fn visitor_id(&self) -> String {
        self.identity
            .get_or_create(VISITOR_ID_KEY, self.config.visitor_ttl())
    }

    fn session_id(&self) -> String {
        self.identity
            .get_or_create_sliding(SESSION_ID_KEY, self.config.session_ttl())
    }

    fn funnel_ids(&self) -> Vec<String> {
        self.machine.lock().funnel_ids()
    }

    fn evaluate_path(&self, path: &str) {
        debug!("Evaluating page steps for {}", path);
        for funnel_id in self.funnel_ids() {
            self.mutate(&funnel_id, |machine, now| {
                machine.evaluate_page(&funnel_id, path, now)
            });
        }
    }

    fn evaluate_interaction(&self, interaction: &Interaction) {
        for funnel_id in self.funnel_ids() {
            self.mutate(&funnel_id, |machine, now| {
                machine.evaluate_interaction(&funnel_id, interaction, now)
            });
        }
    }

    fn on_navigation(&self, change: &NavigationChange) {
        let observed = self.watcher.lock().observe(&change.url);
        let Some(path) = observed else {
            return;
        };
        debug!("Navigation ({:?}) to {}", change.kind, path);
        *self.pending_path.lock() = Some(path);
        self.schedule(TimerName::NavigationSettle, NAVIGATION_SETTLE_DELAY);
    }

    fn write_snapshot(&self) {
        let states = self.machine.lock().snapshot();
        let written = serde_json::to_string(&states)
            .map_err(TrackerError::from)
            .and_then(|json| self.storage.set(&state_key(&self.site_id), &json, None));
        degrade(written, "Persisting funnel state");

        let pending = self.dispatcher.pending();
        let key = queue_key(&self.site_id);
        let written = if pending.is_empty() {
            self.storage.remove(&key)
        } else {
            serde_json::to_string(&pending)
                .map_err(TrackerError::from)
                .and_then(|json| self.storage.set(&key, &json, None))
        };
        degrade(written, "Persisting funnel outbox");
    }

    fn detach(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        if let Some(id) = subscriptions.navigation {
            self.navigation.unsubscribe(id);
        }
        if let Some(id) = subscriptions.interactions {
            self.interactions.unsubscribe(id);
        }
    }
}

fn read_json<T: DeserializeOwned>(storage: &dyn Storage, key: &str) -> TrackerResult<Option<T>> {
    match storage.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Handle to a running tracker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct FunnelTracker {
    inner: Arc<TrackerInner>,
}

impl FunnelTracker {
    pub fn builder(config: TrackerConfig) -> FunnelTrackerBuilder {
        FunnelTrackerBuilder::new(config)
    }

    fn attach(&self) {
        let weak = Arc::downgrade(&self.inner);
        let navigation = self
            .inner
            .navigation
            .subscribe(Arc::new(move |change: &NavigationChange| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_navigation(change);
                }
            }));

        let weak = Arc::downgrade(&self.inner);
        let interactions = self
            .inner
            .interactions
            .subscribe(Arc::new(move |interaction: &Interaction| {
                if let Some(inner) = weak.upgrade() {
                    inner.evaluate_interaction(interaction);
                }
            }));

        *self.inner.subscriptions.lock() = Subscriptions {
            navigation: Some(navigation),
            interactions: Some(interactions),
        };
    }

    pub fn site_id(&self) -> &str {
        &self.inner.site_id
    }

    pub fn visitor_id(&self) -> String {
        self.inner.visitor_id()
    }

    pub fn session_id(&self) -> String {
        self.inner.session_id()
    }

    /// Report that the visitor reached `step_number` (1-indexed). Returns
    /// true when the funnel's state changed.
    pub fn track_step(&self, funnel_id: &str, step_number: usize) -> bool {
        self.inner.mutate(funnel_id, |machine, now| {
            machine.advance(funnel_id, step_number, now)
        })
    }

    /// Mark a funnel converted regardless of its progress.
    pub fn track_conversion(&self, funnel_id: &str, value: Option<f64>, data: Option<Value>) -> bool {
        self.inner.mutate(funnel_id, |machine, now| {
            machine.force_conversion(funnel_id, value, data, now)
        })
    }

    /// Application-emitted custom event, matched against `custom` steps.
    pub fn track_event(&self, name: impl Into<String>) {
        self.inner.interactions.custom(name);
    }

    /// Click on `target`, matched against `event` steps.
    pub fn handle_click(&self, target: Element) {
        self.inner.interactions.click(target);
    }

    pub fn funnel_state(&self, funnel_id: &str) -> Option<FunnelRuntimeState> {
        self.inner.machine.lock().state(funnel_id).cloned()
    }

    pub fn active_funnels(&self) -> Vec<FunnelDefinition> {
        self.inner.machine.lock().definitions().to_vec()
    }

    pub fn pending_events(&self) -> Vec<QueuedEvent> {
        self.inner.dispatcher.pending()
    }

    /// Observe every reported transition. Observers run synchronously while
    /// the funnel's latch is held, so mutating the same funnel from inside
    /// an observer is rejected.
    pub fn on_transition(&self, observer: Listener<Transition>) -> ListenerId {
        self.inner.observers.add(observer)
    }

    pub fn remove_observer(&self, id: ListenerId) -> bool {
        self.inner.observers.remove(id)
    }

    /// Events handed to the network, re-emitted locally
    pub fn signals(&self) -> &LocalSignals {
        &self.inner.signals
    }

    /// Fire every timer that is due. Returns how many fired.
    pub async fn run_pending(&self) -> usize {
        let now = self.inner.clock.now();
        let due = self.inner.scheduler.lock().take_due(now);

        for timer in &due {
            match timer {
                TimerName::SnapshotWriter => self.inner.write_snapshot(),
                TimerName::FlushTrigger => {
                    self.flush().await;
                }
                TimerName::NavigationSettle => {
                    let pending = self.inner.pending_path.lock().take();
                    if let Some(path) = pending {
                        self.inner.evaluate_path(&path);
                    }
                }
                TimerName::InitialEvaluation => {
                    let url = self.inner.navigation.current_url();
                    let observed = self.inner.watcher.lock().observe(&url);
                    if let Some(path) = observed {
                        self.inner.evaluate_path(&path);
                    }
                }
            }
        }
        due.len()
    }

    /// Send every queued event now. Returns how many were delivered; on
    /// failure the events stay queued and a retry is scheduled.
    pub async fn flush(&self) -> usize {
        match self.inner.dispatcher.flush().await {
            Ok(0) => 0,
            Ok(sent) => {
                debug!("Delivered {} funnel events", sent);
                self.inner.schedule(TimerName::SnapshotWriter, SNAPSHOT_DEBOUNCE);
                sent
            }
            Err(e) => {
                warn!("Funnel event flush failed, will retry: {}", e);
                self.inner.schedule(TimerName::FlushTrigger, FLUSH_DEBOUNCE);
                0
            }
        }
    }

    /// Start the background task that fires due timers. Needs a tokio
    /// runtime; a second call is a no-op.
    pub fn spawn_driver(&self) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime available, funnel timers must be driven manually");
            return false;
        };
        let mut driver = self.inner.driver.lock();
        if driver.is_some() {
            return false;
        }

        let weak = Arc::downgrade(&self.inner);
        let token = self.inner.shutdown.clone();
        *driver = Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(DRIVER_TICK);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        FunnelTracker { inner }.run_pending().await;
                    }
                }
            }
            debug!("Funnel tracker driver stopped");
        }));
        true
    }

    /// Page is going away: persist state and outbox now, then flush without
    /// waiting. The outbox is written before the flush drains the queue.
    pub fn handle_unload(&self) {
        {
            let mut scheduler = self.inner.scheduler.lock();
            scheduler.cancel(TimerName::FlushTrigger);
            scheduler.cancel(TimerName::SnapshotWriter);
        }
        self.inner.write_snapshot();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let tracker = self.clone();
                handle.spawn(async move {
                    tracker.flush().await;
                });
            }
            Err(_) => warn!("No tokio runtime available, unload flush skipped"),
        }
    }

    /// Flush, cancel timers, stop watching and stop the driver. The
    /// navigation and interaction sources are left without our listeners.
    pub async fn teardown(&self) {
        self.flush().await;

        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.scheduler.lock().clear();
        self.inner.detach();

        self.inner.shutdown.cancel();
        let driver = self.inner.driver.lock().take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                warn!("Funnel tracker driver ended abnormally: {}", e);
            }
        }

        self.inner.write_snapshot();
        info!("Funnel tracker for site {} stopped", self.inner.site_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::{FunnelEventType, StepDefinition};
    use async_trait::async_trait;
    use serde_json::json;

    struct StaticHttp {
        definitions: Value,
    }

    #[async_trait]
    impl HttpClient for StaticHttp {
        async fn get_json(&self, _url: &str) -> TrackerResult<Value> {
            Ok(self.definitions.clone())
        }

        async fn post_json(&self, _url: &str, _body: String) -> TrackerResult<()> {
            Ok(())
        }
    }

    async fn tracker(clock: Arc<ManualClock>) -> FunnelTracker {
        let definitions = serde_json::to_value(vec![FunnelDefinition::new(
            "F1",
            "Checkout",
            vec![
                StepDefinition::page("Cart", "/cart"),
                StepDefinition::page("Checkout", "/checkout"),
            ],
        )])
        .unwrap();

        FunnelTracker::builder(TrackerConfig::new("site-1"))
            .clock(clock.clone())
            .storage(Arc::new(MemoryStorage::new(clock)))
            .http(Arc::new(StaticHttp { definitions }))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_queued_event_carries_identity_and_state() {
        let clock = Arc::new(ManualClock::default());
        let tracker = tracker(clock.clone()).await;

        assert!(tracker.track_step("F1", 1));
        let events = tracker.pending_events();
        assert_eq!(events.len(), 1);

        let event = &events[0];
        assert_eq!(event.website_id, "site-1");
        assert_eq!(event.visitor_id, tracker.visitor_id());
        assert_eq!(event.session_id, tracker.session_id());
        assert_eq!(event.event_type, FunnelEventType::Progress);
        assert_eq!(event.completed_steps, vec![0]);
        assert_eq!(event.timestamp, clock.now());
    }

    #[tokio::test]
    async fn test_conversion_payload_is_forwarded() {
        let clock = Arc::new(ManualClock::default());
        let tracker = tracker(clock).await;

        assert!(tracker.track_conversion("F1", Some(12.5), Some(json!({"sku": "A"}))));
        let event = tracker.pending_events().pop().unwrap();
        assert_eq!(event.event_type, FunnelEventType::Conversion);
        assert_eq!(event.value, Some(12.5));
        assert_eq!(event.data, Some(json!({"sku": "A"})));
        assert!(!tracker.track_step("missing", 1));
    }

    #[tokio::test]
    async fn test_mutations_arm_debounced_timers_once() {
        let clock = Arc::new(ManualClock::default());
        let tracker = tracker(clock.clone()).await;

        tracker.track_step("F1", 1);
        clock.advance(Duration::milliseconds(50));
        tracker.track_step("F1", 2);

        let scheduler = tracker.inner.scheduler.lock();
        assert_eq!(
            scheduler.deadline(TimerName::SnapshotWriter),
            Some(clock.now() + SNAPSHOT_DEBOUNCE)
        );
        assert_eq!(
            scheduler.deadline(TimerName::FlushTrigger),
            Some(clock.now() + FLUSH_DEBOUNCE)
        );
    }
}
