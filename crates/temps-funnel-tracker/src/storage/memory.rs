use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use parking_lot::Mutex;

use super::{Storage, StoredEntry};
use crate::clock::{Clock, SystemClock};
use crate::error::TrackerResult;

/// In-process storage, lost when the process exits
pub struct MemoryStorage {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, StoredEntry>>,
}

impl MemoryStorage {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> TrackerResult<Option<String>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> TrackerResult<()> {
        let entry = StoredEntry::new(value, ttl, self.clock.now());
        self.entries.lock().insert(key.to_string(), entry);
        Ok(())
    }

    fn remove(&self, key: &str) -> TrackerResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_values_expire_on_read() {
        let clock = Arc::new(ManualClock::default());
        let storage = MemoryStorage::new(clock.clone());

        storage
            .set("session", "abc", Some(Duration::minutes(30)))
            .unwrap();
        storage.set("forever", "x", None).unwrap();

        clock.advance(Duration::minutes(29));
        assert_eq!(storage.get("session").unwrap(), Some("abc".to_string()));

        clock.advance(Duration::minutes(2));
        assert_eq!(storage.get("session").unwrap(), None);
        assert_eq!(storage.get("forever").unwrap(), Some("x".to_string()));
        assert_eq!(storage.entries.lock().len(), 1);
    }

    #[test]
    fn test_remove() {
        let storage = MemoryStorage::default();
        storage.set("k", "v", None).unwrap();
        storage.remove("k").unwrap();
        assert!(storage.get("k").unwrap().is_none());
        assert!(storage.is_empty());
    }
}
