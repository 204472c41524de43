//! Funnel state machine
//!
//! One [`FunnelRuntimeState`] per active funnel. A funnel is entered on any
//! step-1 match and advances only to the step directly after its current one.
//! Leaving an in-progress funnel for a page no step matches resets it, and
//! reports a dropoff when the visitor was engaged long enough.
//!
//! The machine performs no I/O. Callers hold the per-funnel latch
//! ([`FunnelStateMachine::try_begin`] / [`FunnelStateMachine::finish`]) for
//! the duration of a mutation and turn each [`Transition`] into one queued
//! event.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tracing::debug;

use crate::clock::UtcDateTime;
use crate::config::DROPOFF_MIN_ENGAGEMENT;
use crate::interactions::Interaction;
use crate::matcher::{matches_step, Observation};
use crate::types::{FunnelDefinition, FunnelEventType, FunnelRuntimeState, StepType};

/// Tag attached to every dropoff event
pub const DROPOFF_REASON: &str = "navigated_away";

/// An accepted state change worth reporting
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub funnel_id: String,
    pub event_type: FunnelEventType,
    pub step_number: usize,
    pub step_name: String,
    pub step_type: Option<StepType>,
    /// State at emission time; for dropoffs, the state before the reset
    pub state: FunnelRuntimeState,
    pub dropoff_reason: Option<String>,
    pub value: Option<f64>,
    pub data: Option<Value>,
    pub page_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// No mutation happened
    Unchanged,
    /// State was mutated; carries the event to report, if any
    Committed(Option<Transition>),
}

impl Outcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Outcome::Committed(_))
    }

    pub fn transition(&self) -> Option<&Transition> {
        match self {
            Outcome::Committed(Some(transition)) => Some(transition),
            _ => None,
        }
    }

    pub fn into_transition(self) -> Option<Transition> {
        match self {
            Outcome::Committed(transition) => transition,
            Outcome::Unchanged => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct FunnelStateMachine {
    funnels: Vec<FunnelDefinition>,
    states: HashMap<String, FunnelRuntimeState>,
}

impl FunnelStateMachine {
    /// Runtime state for every active definition, starting at step 0.
    pub fn new(definitions: Vec<FunnelDefinition>) -> Self {
        let mut funnels: Vec<FunnelDefinition> = Vec::new();
        let mut states = HashMap::new();

        for definition in definitions.into_iter().filter(|d| d.is_active) {
            if states.contains_key(&definition.id) {
                debug!("Ignoring duplicate funnel definition {}", definition.id);
                continue;
            }
            states.insert(definition.id.clone(), FunnelRuntimeState::default());
            funnels.push(definition);
        }

        Self { funnels, states }
    }

    /// Adopt persisted states of funnels that are still active.
    ///
    /// Entries that no longer fit the definition (step out of range) are
    /// discarded. Returns the number of restored funnels.
    pub fn restore(&mut self, mut snapshot: HashMap<String, FunnelRuntimeState>) -> usize {
        let mut restored = 0;
        for definition in &self.funnels {
            let Some(mut saved) = snapshot.remove(&definition.id) else {
                continue;
            };
            let step_count = definition.step_count();
            let fits = saved.current_step <= step_count
                && saved.completed_steps.iter().all(|index| *index < step_count);
            if !fits {
                debug!("Discarding stale snapshot for funnel {}", definition.id);
                continue;
            }
            saved.updating = false;
            self.states.insert(definition.id.clone(), saved);
            restored += 1;
        }
        restored
    }

    /// Serializable copy of every runtime state, keyed by funnel id
    pub fn snapshot(&self) -> BTreeMap<String, FunnelRuntimeState> {
        self.states
            .iter()
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect()
    }

    pub fn definitions(&self) -> &[FunnelDefinition] {
        &self.funnels
    }

    pub fn funnel_ids(&self) -> Vec<String> {
        self.funnels.iter().map(|f| f.id.clone()).collect()
    }

    pub fn definition(&self, funnel_id: &str) -> Option<&FunnelDefinition> {
        self.funnels.iter().find(|f| f.id == funnel_id)
    }

    pub fn state(&self, funnel_id: &str) -> Option<&FunnelRuntimeState> {
        self.states.get(funnel_id)
    }

    pub fn is_empty(&self) -> bool {
        self.funnels.is_empty()
    }

    /// Set the funnel's latch. False when unknown or already mutating.
    pub fn try_begin(&mut self, funnel_id: &str) -> bool {
        match self.states.get_mut(funnel_id) {
            Some(state) if !state.updating => {
                state.updating = true;
                true
            }
            _ => false,
        }
    }

    pub fn finish(&mut self, funnel_id: &str) {
        if let Some(state) = self.states.get_mut(funnel_id) {
            state.updating = false;
        }
    }

    /// Report that `step_number` (1-indexed) was reached.
    pub fn advance(&mut self, funnel_id: &str, step_number: usize, now: UtcDateTime) -> Outcome {
        self.apply_step(funnel_id, step_number, now, None)
    }

    /// Evaluate a page navigation to `path`.
    pub fn evaluate_page(&mut self, funnel_id: &str, path: &str, now: UtcDateTime) -> Outcome {
        let Some(matched) = self.eligible_matches(funnel_id, Observation::Page { path }) else {
            return Outcome::Unchanged;
        };

        if let Some(step_number) = self.choose_step(funnel_id, &matched) {
            return self.apply_step(funnel_id, step_number, now, Some(path));
        }
        if !matched.is_empty() {
            return Outcome::Unchanged;
        }

        let in_progress = match (self.definition(funnel_id), self.state(funnel_id)) {
            (Some(definition), Some(state)) => state.is_in_progress(definition.step_count()),
            _ => false,
        };
        if in_progress {
            self.drop_off(funnel_id, path, now)
        } else {
            Outcome::Unchanged
        }
    }

    /// Evaluate a click or custom event. Interactions never cause dropoffs.
    pub fn evaluate_interaction(
        &mut self,
        funnel_id: &str,
        interaction: &Interaction,
        now: UtcDateTime,
    ) -> Outcome {
        let Some(matched) = self.eligible_matches(funnel_id, Observation::from(interaction)) else {
            return Outcome::Unchanged;
        };
        match self.choose_step(funnel_id, &matched) {
            Some(step_number) => self.apply_step(funnel_id, step_number, now, None),
            None => Outcome::Unchanged,
        }
    }

    /// Operator override: mark the funnel converted whatever its progress.
    ///
    /// `current_step` and `completed_steps` are left as they are, so the
    /// usual step/cardinality relation does not hold afterwards.
    pub fn force_conversion(
        &mut self,
        funnel_id: &str,
        value: Option<f64>,
        data: Option<Value>,
        now: UtcDateTime,
    ) -> Outcome {
        let Some(definition) = self.funnels.iter().find(|f| f.id == funnel_id) else {
            return Outcome::Unchanged;
        };
        let Some(state) = self.states.get_mut(funnel_id) else {
            return Outcome::Unchanged;
        };

        state.converted = true;
        state.last_activity = Some(now);

        let final_step = definition.step(definition.step_count());
        Outcome::Committed(Some(Transition {
            funnel_id: funnel_id.to_string(),
            event_type: FunnelEventType::Conversion,
            step_number: definition.step_count(),
            step_name: final_step
                .map(|s| s.label())
                .unwrap_or_else(|| "conversion".to_string()),
            step_type: final_step.map(|s| s.step_type),
            state: state.clone(),
            dropoff_reason: None,
            value,
            data,
            page_path: None,
        }))
    }

    /// Back to not started. False when the funnel is unknown.
    pub fn reset(&mut self, funnel_id: &str, now: UtcDateTime) -> bool {
        match self.states.get_mut(funnel_id) {
            Some(state) => {
                *state = FunnelRuntimeState {
                    last_activity: Some(now),
                    updating: state.updating,
                    ..Default::default()
                };
                true
            }
            None => false,
        }
    }

    /// Step numbers whose condition matches and that may be considered:
    /// step 1 always, later steps only once the funnel has started.
    fn eligible_matches(&self, funnel_id: &str, observation: Observation<'_>) -> Option<Vec<usize>> {
        let definition = self.definition(funnel_id)?;
        let started = self.state(funnel_id)?.is_started();

        Some(
            definition
                .steps
                .iter()
                .enumerate()
                .map(|(index, step)| (index + 1, step))
                .filter(|(step_number, _)| *step_number == 1 || started)
                .filter(|(_, step)| matches_step(step, observation))
                .map(|(step_number, _)| step_number)
                .collect(),
        )
    }

    /// The next step wins over a restart when both matched.
    fn choose_step(&self, funnel_id: &str, matched: &[usize]) -> Option<usize> {
        let state = self.state(funnel_id)?;
        let next = state.current_step + 1;
        if state.is_started() && matched.contains(&next) {
            Some(next)
        } else if matched.contains(&1) {
            Some(1)
        } else {
            None
        }
    }

    fn apply_step(
        &mut self,
        funnel_id: &str,
        step_number: usize,
        now: UtcDateTime,
        page_path: Option<&str>,
    ) -> Outcome {
        let Some(definition) = self.funnels.iter().find(|f| f.id == funnel_id) else {
            return Outcome::Unchanged;
        };
        let Some(step) = definition.step(step_number) else {
            return Outcome::Unchanged;
        };
        let Some(state) = self.states.get_mut(funnel_id) else {
            return Outcome::Unchanged;
        };
        let step_count = definition.step_count();
        // Set by a forced conversion earlier in this activation
        let converted_before = state.converted && step_number != 1;

        if step_number == 1 {
            state.current_step = 1;
            state.completed_steps = vec![0];
            state.started_at = Some(now);
            state.converted = false;
        } else if step_number == state.current_step + 1 {
            state.current_step = step_number;
            if !state.completed_steps.contains(&(step_number - 1)) {
                state.completed_steps.push(step_number - 1);
            }
        } else {
            debug!(
                "Ignoring step {} of funnel {} at step {}",
                step_number, funnel_id, state.current_step
            );
            return Outcome::Unchanged;
        }

        state.last_activity = Some(now);
        let event_type = if step_number == step_count {
            state.converted = true;
            if converted_before {
                debug!(
                    "Funnel {} reached its final step after a forced conversion, not reporting it twice",
                    funnel_id
                );
                return Outcome::Committed(None);
            }
            FunnelEventType::Conversion
        } else {
            FunnelEventType::Progress
        };

        debug!(
            "Funnel {} moved to step {}/{} ({})",
            funnel_id, step_number, step_count, event_type
        );

        Outcome::Committed(Some(Transition {
            funnel_id: funnel_id.to_string(),
            event_type,
            step_number,
            step_name: step.label(),
            step_type: Some(step.step_type),
            state: state.clone(),
            dropoff_reason: None,
            value: None,
            data: None,
            page_path: page_path.map(str::to_string),
        }))
    }

    fn drop_off(&mut self, funnel_id: &str, path: &str, now: UtcDateTime) -> Outcome {
        let (Some(definition), Some(state)) = (self.definition(funnel_id), self.state(funnel_id))
        else {
            return Outcome::Unchanged;
        };

        let before = state.clone();
        let last_step = definition.step(before.current_step);
        let engaged = before
            .started_at
            .map(|started| now - started >= DROPOFF_MIN_ENGAGEMENT)
            .unwrap_or(false);

        let transition = engaged.then(|| Transition {
            funnel_id: funnel_id.to_string(),
            event_type: FunnelEventType::Dropoff,
            step_number: before.current_step,
            step_name: last_step.map(|s| s.label()).unwrap_or_default(),
            step_type: last_step.map(|s| s.step_type),
            state: before.clone(),
            dropoff_reason: Some(DROPOFF_REASON.to_string()),
            value: None,
            data: None,
            page_path: Some(path.to_string()),
        });

        if transition.is_none() {
            debug!(
                "Funnel {} left before minimum engagement, resetting without dropoff",
                funnel_id
            );
        }

        self.reset(funnel_id, now);
        Outcome::Committed(transition)
    }
}
