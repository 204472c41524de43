//! Outbound event queue
//!
//! Events wait here until the debounced flush sends them. A flush sends every
//! queued event concurrently; if any send fails the whole batch goes back to
//! the front of the queue, so delivery is at-least-once. Flushes run one at
//! a time: a flush started while another is in flight waits for it, so the
//! queue only looks empty once the earlier batch was delivered or requeued.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::try_join_all;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::{TrackerError, TrackerResult};
use crate::http::HttpClient;
use crate::signals::LocalSignals;
use crate::types::QueuedEvent;

pub struct EventDispatcher {
    http: Arc<dyn HttpClient>,
    endpoint: String,
    use_beacon: bool,
    queue: Mutex<VecDeque<QueuedEvent>>,
    flushing: tokio::sync::Mutex<()>,
    signals: Arc<LocalSignals>,
}

impl EventDispatcher {
    pub fn new(
        http: Arc<dyn HttpClient>,
        endpoint: impl Into<String>,
        use_beacon: bool,
        signals: Arc<LocalSignals>,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            use_beacon,
            queue: Mutex::new(VecDeque::new()),
            flushing: tokio::sync::Mutex::new(()),
            signals,
        }
    }

    /// Append an event. Returns true when the queue was empty before.
    pub fn enqueue(&self, event: QueuedEvent) -> bool {
        let mut queue = self.queue.lock();
        let was_empty = queue.is_empty();
        queue.push_back(event);
        was_empty
    }

    /// Put previously persisted events ahead of anything queued since.
    pub fn restore(&self, events: Vec<QueuedEvent>) {
        let mut queue = self.queue.lock();
        for event in events.into_iter().rev() {
            queue.push_front(event);
        }
    }

    pub fn pending(&self) -> Vec<QueuedEvent> {
        self.queue.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Send everything queued. Returns the number of events delivered.
    pub async fn flush(&self) -> TrackerResult<usize> {
        let _in_flight = self.flushing.lock().await;
        let drained: Vec<QueuedEvent> = self.queue.lock().drain(..).collect();
        if drained.is_empty() {
            return Ok(0);
        }

        let mut batch = Vec::with_capacity(drained.len());
        let mut bodies = Vec::with_capacity(drained.len());
        for event in drained {
            match serde_json::to_string(&event) {
                Ok(body) => {
                    bodies.push(body);
                    batch.push(event);
                }
                Err(e) => error!(
                    "Dropping {} event for funnel {}, it cannot be encoded: {}",
                    event.event_type, event.funnel_id, e
                ),
            }
        }

        debug!("Flushing {} funnel events", batch.len());
        let sends = batch
            .iter()
            .zip(bodies)
            .map(|(event, body)| self.deliver(event, body));

        match try_join_all(sends).await {
            Ok(_) => Ok(batch.len()),
            Err(e) => {
                warn!(
                    "Funnel event delivery failed, requeueing {} events: {}",
                    batch.len(),
                    e
                );
                self.restore(batch);
                Err(e)
            }
        }
    }

    async fn deliver(&self, event: &QueuedEvent, body: String) -> TrackerResult<()> {
        self.signals.emit(event);

        if self.use_beacon {
            if let Some(beacon) = self.http.send_beacon(&self.endpoint, body.clone()) {
                // Rejected or aborted beacons fail the batch like a POST would
                return beacon.await.map_err(|e| {
                    TrackerError::Network(format!("Beacon task did not complete: {}", e))
                })?;
            }
            debug!("Beacon unavailable, falling back to POST");
        }
        self.http.post_json(&self.endpoint, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::BeaconHandle;
    use crate::types::FunnelEventType;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeHttp {
        fail: AtomicBool,
        beacon: AtomicBool,
        posts: Mutex<Vec<String>>,
        beacons: AtomicUsize,
    }

    #[async_trait]
    impl HttpClient for FakeHttp {
        async fn get_json(&self, _url: &str) -> TrackerResult<Value> {
            Ok(Value::Null)
        }

        async fn post_json(&self, _url: &str, body: String) -> TrackerResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TrackerError::Network("connection refused".into()));
            }
            self.posts.lock().push(body);
            Ok(())
        }

        fn send_beacon(&self, _url: &str, _body: String) -> Option<BeaconHandle> {
            if !self.beacon.load(Ordering::SeqCst) {
                return None;
            }
            self.beacons.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail.load(Ordering::SeqCst);
            Some(tokio::spawn(async move {
                if fail {
                    return Err(TrackerError::HttpStatus {
                        status: 503,
                        url: "http://collector/funnels/track".to_string(),
                    });
                }
                Ok(())
            }))
        }
    }

    fn event(funnel_id: &str, step_number: usize) -> QueuedEvent {
        QueuedEvent {
            funnel_id: funnel_id.to_string(),
            website_id: "site".to_string(),
            visitor_id: "v".to_string(),
            session_id: "s".to_string(),
            event_type: FunnelEventType::Progress,
            step_number,
            step_name: format!("step {}", step_number),
            step_type: None,
            current_step: step_number,
            completed_steps: (0..step_number).collect(),
            started_at: None,
            last_activity: None,
            converted: false,
            dropoff_reason: None,
            value: None,
            data: None,
            page_path: None,
            timestamp: Utc::now(),
        }
    }

    fn dispatcher(http: Arc<FakeHttp>, use_beacon: bool) -> EventDispatcher {
        EventDispatcher::new(
            http,
            "http://collector/funnels/track",
            use_beacon,
            Arc::new(LocalSignals::new()),
        )
    }

    #[test]
    fn test_enqueue_reports_empty_queue() {
        let dispatcher = dispatcher(Arc::new(FakeHttp::default()), false);
        assert!(dispatcher.enqueue(event("F1", 1)));
        assert!(!dispatcher.enqueue(event("F1", 2)));
        assert_eq!(dispatcher.len(), 2);
    }

    #[tokio::test]
    async fn test_flush_posts_each_event() {
        let http = Arc::new(FakeHttp::default());
        let dispatcher = dispatcher(http.clone(), false);
        dispatcher.enqueue(event("F1", 1));
        dispatcher.enqueue(event("F1", 2));

        assert_eq!(dispatcher.flush().await.unwrap(), 2);
        assert!(dispatcher.is_empty());

        let posts = http.posts.lock();
        assert_eq!(posts.len(), 2);
        let first: QueuedEvent = serde_json::from_str(&posts[0]).unwrap();
        assert_eq!(first.step_number, 1);
    }

    #[tokio::test]
    async fn test_failed_flush_requeues_whole_batch_in_order() {
        let http = Arc::new(FakeHttp::default());
        http.fail.store(true, Ordering::SeqCst);
        let dispatcher = dispatcher(http.clone(), false);
        for step in 1..=3 {
            dispatcher.enqueue(event("F1", step));
        }

        let before = dispatcher.len();
        assert!(dispatcher.flush().await.is_err());
        assert_eq!(dispatcher.len(), before);

        let steps: Vec<usize> = dispatcher.pending().iter().map(|e| e.step_number).collect();
        assert_eq!(steps, vec![1, 2, 3]);

        http.fail.store(false, Ordering::SeqCst);
        assert_eq!(dispatcher.flush().await.unwrap(), 3);
        assert!(dispatcher.is_empty());
    }

    #[tokio::test]
    async fn test_beacon_preferred_when_available() {
        let http = Arc::new(FakeHttp::default());
        http.beacon.store(true, Ordering::SeqCst);
        let dispatcher = dispatcher(http.clone(), true);
        dispatcher.enqueue(event("F1", 1));

        dispatcher.flush().await.unwrap();
        assert_eq!(http.beacons.load(Ordering::SeqCst), 1);
        assert!(http.posts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_beacon_requeues_batch() {
        let http = Arc::new(FakeHttp::default());
        http.beacon.store(true, Ordering::SeqCst);
        http.fail.store(true, Ordering::SeqCst);
        let dispatcher = dispatcher(http.clone(), true);
        dispatcher.enqueue(event("F1", 1));
        dispatcher.enqueue(event("F1", 2));

        assert!(matches!(
            dispatcher.flush().await,
            Err(TrackerError::HttpStatus { status: 503, .. })
        ));
        let steps: Vec<usize> = dispatcher.pending().iter().map(|e| e.step_number).collect();
        assert_eq!(steps, vec![1, 2]);
        assert!(http.posts.lock().is_empty());

        http.fail.store(false, Ordering::SeqCst);
        assert_eq!(dispatcher.flush().await.unwrap(), 2);
        assert!(dispatcher.is_empty());
        assert!(http.posts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_flush_waits_for_batch_in_flight() {
        let http = Arc::new(FakeHttp::default());
        http.beacon.store(true, Ordering::SeqCst);
        http.fail.store(true, Ordering::SeqCst);
        let dispatcher = Arc::new(dispatcher(http.clone(), true));
        dispatcher.enqueue(event("F1", 1));

        let background = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.flush().await }
        });
        tokio::task::yield_now().await;

        // The second flush sees the requeued event, not an empty queue
        assert!(dispatcher.flush().await.is_err());
        assert!(background.await.unwrap().is_err());
        assert_eq!(dispatcher.len(), 1);
    }

    #[tokio::test]
    async fn test_signals_fire_for_every_attempt() {
        let http = Arc::new(FakeHttp::default());
        http.fail.store(true, Ordering::SeqCst);
        let signals = Arc::new(LocalSignals::new());
        let dispatcher = EventDispatcher::new(http, "http://collector", false, signals.clone());

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        signals.subscribe(Arc::new(move |_event: &QueuedEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        dispatcher.enqueue(event("F1", 1));
        let _ = dispatcher.flush().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restore_goes_ahead_of_new_events() {
        let dispatcher = dispatcher(Arc::new(FakeHttp::default()), false);
        dispatcher.enqueue(event("F1", 3));
        dispatcher.restore(vec![event("F1", 1), event("F1", 2)]);

        let steps: Vec<usize> = dispatcher.pending().iter().map(|e| e.step_number).collect();
        assert_eq!(steps, vec![1, 2, 3]);
    }
}
