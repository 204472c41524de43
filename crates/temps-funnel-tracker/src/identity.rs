//! Visitor and session identifiers

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::storage::Storage;

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const RANDOM_SUFFIX_LEN: usize = 9;

/// Resolves durable identifiers, creating them when absent or expired.
///
/// Never fails. When storage is unusable the identifier lives in memory for
/// the lifetime of this store, so repeated lookups stay stable.
pub struct IdentityStore {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    fallback: Mutex<HashMap<String, String>>,
}

impl IdentityStore {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            fallback: Mutex::new(HashMap::new()),
        }
    }

    /// Identifier expiring `ttl` after it was created.
    pub fn get_or_create(&self, key: &str, ttl: Duration) -> String {
        self.resolve(key, ttl, false)
    }

    /// Identifier expiring `ttl` after it was last read.
    pub fn get_or_create_sliding(&self, key: &str, ttl: Duration) -> String {
        self.resolve(key, ttl, true)
    }

    fn resolve(&self, key: &str, ttl: Duration, sliding: bool) -> String {
        if let Some(id) = self.fallback.lock().get(key) {
            return id.clone();
        }

        match self.storage.get(key) {
            Ok(Some(existing)) if !existing.is_empty() => {
                if sliding {
                    if let Err(e) = self.storage.set(key, &existing, Some(ttl)) {
                        warn!("Failed to refresh expiry of {}: {}", key, e);
                    }
                }
                existing
            }
            Ok(_) => {
                let id = generate_id(self.clock.now().timestamp_millis());
                match self.storage.set(key, &id, Some(ttl)) {
                    Ok(()) => debug!("Created new identifier for {}", key),
                    Err(e) => {
                        warn!("Failed to persist {}, keeping it in memory: {}", key, e);
                        self.fallback.lock().insert(key.to_string(), id.clone());
                    }
                }
                id
            }
            Err(e) => {
                warn!("Failed to read {}, using an in-memory identifier: {}", key, e);
                let id = generate_id(self.clock.now().timestamp_millis());
                self.fallback.lock().insert(key.to_string(), id.clone());
                id
            }
        }
    }
}

/// Time-based prefix plus random suffix, both base36.
pub fn generate_id(timestamp_millis: i64) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..RANDOM_SUFFIX_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("{}{}", to_base36(timestamp_millis.max(0) as u64), suffix)
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(ID_ALPHABET[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}
