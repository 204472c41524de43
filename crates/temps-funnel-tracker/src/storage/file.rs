use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Duration;
use parking_lot::Mutex;
use tracing::debug;

use super::{Storage, StoredEntry};
use crate::clock::{Clock, SystemClock};
use crate::error::{TrackerError, TrackerResult};

/// JSON document on disk holding every key
///
/// Writes replace the document atomically so a crash mid-write leaves the
/// previous version intact.
pub struct FileStorage {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    // Serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_clock(path, Arc::new(SystemClock))
    }

    pub fn with_clock(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            clock,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> TrackerResult<BTreeMap<String, StoredEntry>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_document(&self, document: &BTreeMap<String, StoredEntry>) -> TrackerResult<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut file = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut file, document)?;
        file.flush()?;
        file.persist(&self.path).map_err(|e| {
            TrackerError::Storage(format!(
                "Failed to replace {}: {}",
                self.path.display(),
                e
            ))
        })?;

        debug!("Wrote {} keys to {}", document.len(), self.path.display());
        Ok(())
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> TrackerResult<Option<String>> {
        let _guard = self.lock.lock();
        let mut document = self.read_document()?;
        let now = self.clock.now();

        match document.get(key) {
            Some(entry) if entry.is_expired(now) => {
                document.remove(key);
                self.write_document(&document)?;
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> TrackerResult<()> {
        let _guard = self.lock.lock();
        let mut document = self.read_document()?;
        document.insert(
            key.to_string(),
            StoredEntry::new(value, ttl, self.clock.now()),
        );
        self.write_document(&document)
    }

    fn remove(&self, key: &str) -> TrackerResult<()> {
        let _guard = self.lock.lock();
        let mut document = self.read_document()?;
        if document.remove(key).is_some() {
            self.write_document(&document)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_values_survive_new_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("tracker.json");

        let storage = FileStorage::new(&path);
        storage.set("temps_visitor_id", "v123", None).unwrap();
        drop(storage);

        let reopened = FileStorage::new(&path);
        assert_eq!(
            reopened.get("temps_visitor_id").unwrap(),
            Some("v123".to_string())
        );
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let storage = FileStorage::with_clock(dir.path().join("s.json"), clock.clone());

        storage
            .set("temps_session_id", "s1", Some(Duration::minutes(30)))
            .unwrap();
        clock.advance(Duration::minutes(31));

        assert_eq!(storage.get("temps_session_id").unwrap(), None);
    }

    #[test]
    fn test_corrupt_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();

        let storage = FileStorage::new(&path);
        assert!(matches!(
            storage.get("anything"),
            Err(TrackerError::Serialization(_))
        ));
    }
}
