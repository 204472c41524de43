//! Funnel definitions, runtime state and outbound events

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::clock::UtcDateTime;

/// How a step is matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    /// Page navigation, matched by URL pattern
    Page,
    /// Element interaction, matched by selector
    Event,
    /// Application-emitted event, matched by name
    Custom,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepType::Page => write!(f, "page"),
            StepType::Event => write!(f, "event"),
            StepType::Custom => write!(f, "custom"),
        }
    }
}

/// Typed view of a step's condition payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepCondition<'a> {
    Page { url: &'a str },
    Event { selector: &'a str },
    Custom { event_name: &'a str },
}

/// One stage of a funnel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(
        default,
        alias = "event_name",
        alias = "eventName",
        skip_serializing_if = "Option::is_none"
    )]
    pub event: Option<String>,
}

impl StepDefinition {
    pub fn page(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            step_type: StepType::Page,
            url: Some(url.into()),
            selector: None,
            event: None,
        }
    }

    pub fn event(name: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            step_type: StepType::Event,
            url: None,
            selector: Some(selector.into()),
            event: None,
        }
    }

    pub fn custom(name: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            step_type: StepType::Custom,
            url: None,
            selector: None,
            event: Some(event_name.into()),
        }
    }

    /// Condition for this step's type, `None` when its payload is missing
    pub fn condition(&self) -> Option<StepCondition<'_>> {
        match self.step_type {
            StepType::Page => self.url.as_deref().map(|url| StepCondition::Page { url }),
            StepType::Event => self
                .selector
                .as_deref()
                .map(|selector| StepCondition::Event { selector }),
            StepType::Custom => self
                .event
                .as_deref()
                .map(|event_name| StepCondition::Custom { event_name }),
        }
    }

    /// Label used in reports, falls back to the condition payload
    pub fn label(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        match self.condition() {
            Some(StepCondition::Page { url }) => url.to_string(),
            Some(StepCondition::Event { selector }) => selector.to_string(),
            Some(StepCondition::Custom { event_name }) => event_name.to_string(),
            None => self.step_type.to_string(),
        }
    }
}

fn default_active() -> bool {
    true
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

/// Server-authored funnel, read-only to the tracker.
///
/// Deserializing keeps only the fields the tracker needs, which is the
/// reduced projection used when reading the definitions cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelDefinition {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    #[serde(default = "default_active", alias = "isActive")]
    pub is_active: bool,
}

impl FunnelDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            steps,
            is_active: true,
        }
    }

    /// 1-indexed step lookup
    pub fn step(&self, step_number: usize) -> Option<&StepDefinition> {
        step_number
            .checked_sub(1)
            .and_then(|index| self.steps.get(index))
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

/// Progress of one visitor through one funnel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunnelRuntimeState {
    /// 0 means not started
    pub current_step: usize,
    /// 0-indexed positions, in completion order
    pub completed_steps: Vec<usize>,
    pub started_at: Option<UtcDateTime>,
    pub last_activity: Option<UtcDateTime>,
    pub converted: bool,
    /// Set while a mutation of this funnel is executing
    #[serde(skip)]
    pub updating: bool,
}

impl FunnelRuntimeState {
    pub fn is_started(&self) -> bool {
        self.current_step > 0
    }

    /// Started, not converted, not on the final step
    pub fn is_in_progress(&self, step_count: usize) -> bool {
        self.current_step > 0 && self.current_step < step_count && !self.converted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunnelEventType {
    Progress,
    Dropoff,
    Conversion,
}

impl fmt::Display for FunnelEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunnelEventType::Progress => write!(f, "progress"),
            FunnelEventType::Dropoff => write!(f, "dropoff"),
            FunnelEventType::Conversion => write!(f, "conversion"),
        }
    }
}

/// One outbound report, immutable once queued
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub funnel_id: String,
    pub website_id: String,
    pub visitor_id: String,
    pub session_id: String,
    pub event_type: FunnelEventType,
    pub step_number: usize,
    pub step_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_type: Option<StepType>,
    pub current_step: usize,
    pub completed_steps: Vec<usize>,
    pub started_at: Option<UtcDateTime>,
    pub last_activity: Option<UtcDateTime>,
    pub converted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dropoff_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_path: Option<String>,
    pub timestamp: UtcDateTime,
}
