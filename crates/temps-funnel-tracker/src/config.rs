//! Tracker configuration and timing constants

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Default collector base URL
pub const DEFAULT_API_URL: &str = "http://localhost:3000/api/_temps";
/// Default visitor identifier lifetime (30 days)
pub const DEFAULT_VISITOR_TTL_SECS: i64 = 30 * 24 * 60 * 60;
/// Default session identifier lifetime (30 minutes of inactivity)
pub const DEFAULT_SESSION_TTL_SECS: i64 = 30 * 60;
/// Default HTTP request timeout
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Name of the local signal emitted for every dispatched event
pub const SIGNAL_NAME: &str = "temps:funnel";

/// Minimum time since a funnel started before leaving it counts as a dropoff.
pub const DROPOFF_MIN_ENGAGEMENT: Duration = Duration::seconds(5);
/// Cached definitions older than this are refetched.
pub const DEFINITIONS_STALE_AFTER: Duration = Duration::hours(1);
/// Quiet period before the runtime snapshot is written.
pub const SNAPSHOT_DEBOUNCE: Duration = Duration::milliseconds(100);
/// Quiet period before the event queue is flushed.
pub const FLUSH_DEBOUNCE: Duration = Duration::milliseconds(1000);
/// Delay between a URL change and its evaluation, lets client-rendered content settle.
pub const NAVIGATION_SETTLE_DELAY: Duration = Duration::milliseconds(100);
/// Delay between the first definitions load and the initial page evaluation.
pub const INITIAL_EVALUATION_DELAY: Duration = Duration::milliseconds(500);
/// Interval at which the background driver checks for due timers.
pub const DRIVER_TICK: std::time::Duration = std::time::Duration::from_millis(25);

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_visitor_ttl_secs() -> i64 {
    DEFAULT_VISITOR_TTL_SECS
}

fn default_session_ttl_secs() -> i64 {
    DEFAULT_SESSION_TTL_SECS
}

fn default_use_beacon() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

/// Tracker configuration
///
/// A missing `site_id` leaves the tracker inert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Site (website) the funnels belong to
    pub site_id: Option<String>,

    /// Base URL of the collector, without trailing slash
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Enables development diagnostics
    #[serde(default)]
    pub debug: bool,

    #[serde(default = "default_visitor_ttl_secs")]
    pub visitor_ttl_secs: i64,

    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: i64,

    /// Prefer fire-and-forget delivery when the HTTP client supports it
    #[serde(default = "default_use_beacon")]
    pub use_beacon: bool,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            site_id: None,
            api_url: default_api_url(),
            debug: false,
            visitor_ttl_secs: default_visitor_ttl_secs(),
            session_ttl_secs: default_session_ttl_secs(),
            use_beacon: default_use_beacon(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl TrackerConfig {
    pub fn new(site_id: impl Into<String>) -> Self {
        Self {
            site_id: Some(site_id.into()),
            ..Default::default()
        }
    }

    /// Build a configuration from `TEMPS_SITE_ID`, `TEMPS_API_URL` and `TEMPS_DEBUG`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.site_id = std::env::var("TEMPS_SITE_ID")
            .ok()
            .filter(|s| !s.trim().is_empty());
        if let Ok(url) = std::env::var("TEMPS_API_URL") {
            config.api_url = url;
        }
        config.debug = std::env::var("TEMPS_DEBUG")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        config
    }

    /// Site id, ignoring blank values
    pub fn site_id(&self) -> Option<&str> {
        self.site_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn visitor_ttl(&self) -> Duration {
        Duration::seconds(self.visitor_ttl_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::seconds(self.session_ttl_secs)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }

    /// Endpoint serving active funnel definitions
    pub fn definitions_url(&self, site_id: &str) -> String {
        format!(
            "{}/funnels/active?website_id={}",
            self.api_url.trim_end_matches('/'),
            urlencoding::encode(site_id)
        )
    }

    /// Endpoint receiving tracked funnel events
    pub fn track_url(&self) -> String {
        format!("{}/funnels/track", self.api_url.trim_end_matches('/'))
    }
}
