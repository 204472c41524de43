//! Named, cancellable timers
//!
//! The tracker never sleeps on its own. It arms deadlines here and whoever
//! drives the tracker (the background driver or a test) asks for the timers
//! that are due.

use std::collections::HashMap;
use std::fmt;

use crate::clock::UtcDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerName {
    /// Debounced durable write of runtime state and outbox
    SnapshotWriter,
    /// Debounced network flush of the event queue
    FlushTrigger,
    /// Deferred evaluation of the last navigation
    NavigationSettle,
    /// Deferred evaluation of the page the tracker started on
    InitialEvaluation,
}

impl fmt::Display for TimerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerName::SnapshotWriter => write!(f, "snapshot_writer"),
            TimerName::FlushTrigger => write!(f, "flush_trigger"),
            TimerName::NavigationSettle => write!(f, "navigation_settle"),
            TimerName::InitialEvaluation => write!(f, "initial_evaluation"),
        }
    }
}

#[derive(Debug, Default)]
pub struct Scheduler {
    timers: HashMap<TimerName, UtcDateTime>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `name` to fire at `deadline`. A pending deadline is replaced.
    /// Returns true when a pending timer was replaced.
    pub fn arm(&mut self, name: TimerName, deadline: UtcDateTime) -> bool {
        self.timers.insert(name, deadline).is_some()
    }

    pub fn cancel(&mut self, name: TimerName) -> bool {
        self.timers.remove(&name).is_some()
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self, name: TimerName) -> bool {
        self.timers.contains_key(&name)
    }

    #[cfg(test)]
    pub(crate) fn deadline(&self, name: TimerName) -> Option<UtcDateTime> {
        self.timers.get(&name).copied()
    }

    #[cfg(test)]
    pub(crate) fn next_deadline(&self) -> Option<UtcDateTime> {
        self.timers.values().min().copied()
    }

    /// Remove and return every timer whose deadline is at or before `now`,
    /// earliest first. A taken timer cannot fire again until re-armed.
    pub fn take_due(&mut self, now: UtcDateTime) -> Vec<TimerName> {
        let mut due: Vec<(TimerName, UtcDateTime)> = self
            .timers
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(name, deadline)| (*name, *deadline))
            .collect();
        due.sort_by_key(|(_, deadline)| *deadline);

        for (name, _) in &due {
            self.timers.remove(name);
        }
        due.into_iter().map(|(name, _)| name).collect()
    }

    pub fn clear(&mut self) {
        self.timers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_rearm_replaces_deadline() {
        let now = Utc::now();
        let mut scheduler = Scheduler::new();

        assert!(!scheduler.arm(TimerName::FlushTrigger, now + Duration::seconds(1)));
        assert!(scheduler.arm(TimerName::FlushTrigger, now + Duration::seconds(2)));

        // The first deadline no longer fires
        assert!(scheduler.take_due(now + Duration::seconds(1)).is_empty());
        assert_eq!(
            scheduler.take_due(now + Duration::seconds(2)),
            vec![TimerName::FlushTrigger]
        );
        // Fired timers do not fire twice
        assert!(scheduler.take_due(now + Duration::seconds(10)).is_empty());
    }

    #[test]
    fn test_due_timers_in_deadline_order() {
        let now = Utc::now();
        let mut scheduler = Scheduler::new();
        scheduler.arm(TimerName::FlushTrigger, now + Duration::milliseconds(1000));
        scheduler.arm(TimerName::SnapshotWriter, now + Duration::milliseconds(100));
        scheduler.arm(TimerName::NavigationSettle, now + Duration::milliseconds(5000));

        assert_eq!(
            scheduler.next_deadline(),
            Some(now + Duration::milliseconds(100))
        );
        let due = scheduler.take_due(now + Duration::seconds(2));
        assert_eq!(due, vec![TimerName::SnapshotWriter, TimerName::FlushTrigger]);
        assert!(scheduler.is_armed(TimerName::NavigationSettle));
    }

    #[test]
    fn test_cancel() {
        let now = Utc::now();
        let mut scheduler = Scheduler::new();
        scheduler.arm(TimerName::SnapshotWriter, now);
        assert!(scheduler.cancel(TimerName::SnapshotWriter));
        assert!(!scheduler.cancel(TimerName::SnapshotWriter));
        assert!(scheduler.take_due(now).is_empty());
    }
}
