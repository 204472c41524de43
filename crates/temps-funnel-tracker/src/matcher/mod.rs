//! Step condition predicates
//!
//! All predicates are pure. Failures inside a predicate count as non-match.

pub mod selector;

use regex::Regex;
use tracing::debug;

pub use selector::Selector;

use crate::error::{TrackerError, TrackerResult};
use crate::interactions::{Element, Interaction};
use crate::types::{StepCondition, StepDefinition};

/// What was observed, in the shape step conditions are written against
#[derive(Debug, Clone, Copy)]
pub enum Observation<'a> {
    Page { path: &'a str },
    Click { target: &'a Element },
    Custom { name: &'a str },
}

impl<'a> From<&'a Interaction> for Observation<'a> {
    fn from(interaction: &'a Interaction) -> Self {
        match interaction {
            Interaction::Click(target) => Observation::Click { target },
            Interaction::Custom(name) => Observation::Custom { name },
        }
    }
}

/// Exact, prefix (`/blog/*`) or wildcard (`/shop/*/checkout`) page match.
pub fn matches_page(path: &str, pattern: &str) -> bool {
    if path == pattern {
        return true;
    }
    if !pattern.contains('*') {
        return false;
    }

    if let Some(prefix) = pattern.strip_suffix('*') {
        if !prefix.contains('*') {
            return path.starts_with(prefix);
        }
    }

    match wildcard_regex(pattern) {
        Ok(regex) => regex.is_match(path),
        Err(e) => {
            debug!("Page pattern '{}' is unusable: {}", pattern, e);
            false
        }
    }
}

fn wildcard_regex(pattern: &str) -> TrackerResult<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{}$", body)).map_err(|e| TrackerError::Configuration {
        message: e.to_string(),
    })
}

/// True when `element` or one of its ancestors matches `selector`.
pub fn matches_element(element: &Element, selector: &str) -> bool {
    match Selector::parse(selector) {
        Ok(selector) => selector.closest(element).is_some(),
        Err(e) => {
            debug!("Treating selector as non-match: {}", e);
            false
        }
    }
}

pub fn matches_custom(name: &str, expected: &str) -> bool {
    name == expected
}

/// Whether `observation` satisfies `step`. Type mismatches never match.
pub fn matches_step(step: &StepDefinition, observation: Observation<'_>) -> bool {
    match (step.condition(), observation) {
        (Some(StepCondition::Page { url }), Observation::Page { path }) => matches_page(path, url),
        (Some(StepCondition::Event { selector }), Observation::Click { target }) => {
            matches_element(target, selector)
        }
        (Some(StepCondition::Custom { event_name }), Observation::Custom { name }) => {
            matches_custom(name, event_name)
        }
        _ => false,
    }
}
