//! Active funnel definitions, cached per site

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::clock::{Clock, UtcDateTime};
use crate::config::{TrackerConfig, DEFINITIONS_STALE_AFTER};
use crate::error::{TrackerError, TrackerResult};
use crate::http::HttpClient;
use crate::storage::{definitions_key, definitions_timestamp_key, Storage};
use crate::types::FunnelDefinition;

/// Keys a wrapped response may put the definitions under
const WRAPPER_KEYS: [&str; 2] = ["funnels", "data"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DefinitionSet {
    pub funnels: Vec<FunnelDefinition>,
    /// True when the set came from the collector, directly or via a fresh cache
    pub validated: bool,
}

impl DefinitionSet {
    fn fallback() -> Self {
        Self::default()
    }
}

pub struct DefinitionCache {
    config: TrackerConfig,
    storage: Arc<dyn Storage>,
    http: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
}

impl DefinitionCache {
    pub fn new(
        config: TrackerConfig,
        storage: Arc<dyn Storage>,
        http: Arc<dyn HttpClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            storage,
            http,
            clock,
        }
    }

    /// Active definitions for `site_id`. Never fails: problems yield an
    /// empty, unvalidated set.
    pub async fn load(&self, site_id: &str) -> DefinitionSet {
        if let Some(funnels) = self.read_fresh_cache(site_id) {
            debug!("Using {} cached funnel definitions for {}", funnels.len(), site_id);
            return DefinitionSet {
                funnels,
                validated: true,
            };
        }

        match self.fetch(site_id).await {
            Ok(funnels) => {
                info!("Loaded {} active funnels for {}", funnels.len(), site_id);
                DefinitionSet {
                    funnels,
                    validated: true,
                }
            }
            Err(e) => {
                warn!("Failed to load funnel definitions for {}: {}", site_id, e);
                DefinitionSet::fallback()
            }
        }
    }

    fn read_fresh_cache(&self, site_id: &str) -> Option<Vec<FunnelDefinition>> {
        let raw = match self.storage.get(&definitions_key(site_id)) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read cached funnel definitions: {}", e);
                return None;
            }
        };
        let cached_at = match self.storage.get(&definitions_timestamp_key(site_id)) {
            Ok(Some(ts)) => parse_timestamp(&ts)?,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read funnel cache timestamp: {}", e);
                return None;
            }
        };

        if self.clock.now() - cached_at >= DEFINITIONS_STALE_AFTER {
            debug!("Cached funnel definitions for {} are stale", site_id);
            return None;
        }

        let parsed = serde_json::from_str::<Value>(&raw)
            .map_err(TrackerError::from)
            .and_then(decode_definitions);
        match parsed {
            Ok(funnels) => Some(funnels),
            Err(e) => {
                warn!("Ignoring corrupt funnel definitions cache: {}", e);
                None
            }
        }
    }

    async fn fetch(&self, site_id: &str) -> TrackerResult<Vec<FunnelDefinition>> {
        let url = self.config.definitions_url(site_id);
        let raw = self.http.get_json(&url).await?;
        let funnels = decode_definitions(raw.clone())?;

        // The raw payload is cached, the projection is rebuilt on read
        let now = self.clock.now();
        let cached = self
            .storage
            .set(&definitions_key(site_id), &raw.to_string(), None)
            .and_then(|_| {
                self.storage.set(
                    &definitions_timestamp_key(site_id),
                    &now.timestamp_millis().to_string(),
                    None,
                )
            });
        if let Err(e) = cached {
            warn!("Failed to cache funnel definitions: {}", e);
        }

        Ok(funnels)
    }
}

fn parse_timestamp(raw: &str) -> Option<UtcDateTime> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
}

/// Accepts `null`, a bare array, or an object wrapping the array.
pub fn normalize_payload(payload: Value) -> TrackerResult<Vec<Value>> {
    match payload {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => {
            for key in WRAPPER_KEYS {
                match map.remove(key) {
                    Some(Value::Array(items)) => return Ok(items),
                    Some(Value::Null) => return Ok(Vec::new()),
                    _ => {}
                }
            }
            Err(TrackerError::Configuration {
                message: "definitions response has no funnel list".to_string(),
            })
        }
        other => Err(TrackerError::Configuration {
            message: format!("unexpected definitions response: {}", other),
        }),
    }
}

/// Normalized, deserialized, active-only definitions
pub fn decode_definitions(payload: Value) -> TrackerResult<Vec<FunnelDefinition>> {
    let items = normalize_payload(payload)?;
    let mut funnels = Vec::with_capacity(items.len());
    for item in items {
        let definition: FunnelDefinition = serde_json::from_value(item)?;
        if definition.is_active {
            funnels.push(definition);
        }
    }
    Ok(funnels)
}
