//! Durable key/value storage
//!
//! Values carry their own expiry metadata; backends drop expired entries on
//! read so identifiers with a TTL disappear without the caller tracking time.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::clock::UtcDateTime;
use crate::error::TrackerResult;

pub const VISITOR_ID_KEY: &str = "temps_visitor_id";
pub const SESSION_ID_KEY: &str = "temps_session_id";

pub fn definitions_key(site_id: &str) -> String {
    format!("temps_funnels_{}", site_id)
}

pub fn definitions_timestamp_key(site_id: &str) -> String {
    format!("temps_funnels_{}_ts", site_id)
}

pub fn state_key(site_id: &str) -> String {
    format!("temps_funnel_state_{}", site_id)
}

pub fn queue_key(site_id: &str) -> String {
    format!("temps_funnel_queue_{}", site_id)
}

pub trait Storage: Send + Sync {
    /// Read a value. Expired values read as `None`.
    fn get(&self, key: &str) -> TrackerResult<Option<String>>;

    /// Write a value, optionally expiring `ttl` after now.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> TrackerResult<()>;

    fn remove(&self, key: &str) -> TrackerResult<()>;
}

/// Stored value plus expiry metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredEntry {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<UtcDateTime>,
}

impl StoredEntry {
    pub fn new(value: &str, ttl: Option<Duration>, now: UtcDateTime) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| now + ttl),
        }
    }

    pub fn is_expired(&self, now: UtcDateTime) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}
