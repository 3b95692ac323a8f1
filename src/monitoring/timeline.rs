//! Instance Timeline
//!
//! Records what happened to one flow instance, in order: states entered,
//! calls dispatched, replies discarded and the terminal outcome. The
//! timeline is part of the instance checkpoint.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type of timeline event.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventType {
    /// A state handler was invoked
    StateEntered { state: String },
    /// An outbound call was committed
    CallDispatched { request_id: u64, target: String, next_state: String },
    /// A reply was dropped (duplicate, late, or for a finished call)
    ReplyDiscarded { request_id: u64, reason: String },
    /// The instance aborted
    Failed { status: String },
    /// The instance ran out of work
    Completed,
}

/// A single event in the timeline.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TimelineEvent {
    pub event: EventType,
    pub timestamp: DateTime<Utc>,
}

/// Ordered event history of one instance.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FlowTimeline {
    events: Vec<TimelineEvent>,
}

impl FlowTimeline {
    /// Creates an empty timeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an event now.
    pub fn add_event(&mut self, event: EventType) {
        self.events.push(TimelineEvent {
            event,
            timestamp: Utc::now(),
        });
    }

    /// Returns all recorded events.
    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Counts how many times `state` was entered.
    pub fn times_entered(&self, state: &str) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(&e.event, EventType::StateEntered { state: s } if s == state))
            .count()
    }

    /// Returns the visited states in order.
    pub fn states_entered(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match &e.event {
                EventType::StateEntered { state } => Some(state.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Counts dispatched calls.
    pub fn calls_dispatched(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e.event, EventType::CallDispatched { .. }))
            .count()
    }

    /// Renders the timeline as text, one event per line with the offset
    /// from the first event.
    pub fn summary(&self) -> String {
        let mut output = String::from("\nInstance Timeline:\n\n");

        let Some(first) = self.events.first() else {
            output.push_str("  (no events)\n");
            return output;
        };

        for event in &self.events {
            let offset = (event.timestamp - first.timestamp).num_milliseconds();
            let line = match &event.event {
                EventType::StateEntered { state } => format!("enter {}", state),
                EventType::CallDispatched { request_id, target, next_state } => {
                    format!("call #{} -> {} (next: {})", request_id, target, next_state)
                }
                EventType::ReplyDiscarded { request_id, reason } => {
                    format!("discard reply #{}: {}", request_id, reason)
                }
                EventType::Failed { status } => format!("FAILED: {}", status),
                EventType::Completed => "completed".to_string(),
            };
            let _ = writeln!(output, "  {:>8}ms  {}", offset, line);
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entered(state: &str) -> EventType {
        EventType::StateEntered { state: state.to_string() }
    }

    #[test]
    fn test_timeline_creation() {
        let timeline = FlowTimeline::new();
        assert!(timeline.get_events().is_empty());
        assert!(timeline.summary().contains("(no events)"));
    }

    #[test]
    fn test_times_entered() {
        let mut timeline = FlowTimeline::new();
        timeline.add_event(entered("Start"));
        timeline.add_event(entered("TableReceived"));
        timeline.add_event(entered("TableReceived"));

        assert_eq!(timeline.times_entered("TableReceived"), 2);
        assert_eq!(timeline.times_entered("Start"), 1);
        assert_eq!(timeline.times_entered("End"), 0);
        assert_eq!(timeline.states_entered(), vec!["Start", "TableReceived", "TableReceived"]);
    }

    #[test]
    fn test_calls_dispatched() {
        let mut timeline = FlowTimeline::new();
        timeline.add_event(EventType::CallDispatched {
            request_id: 1,
            target: "agent:LoadComponent".to_string(),
            next_state: "StartCollection".to_string(),
        });
        timeline.add_event(EventType::Completed);
        assert_eq!(timeline.calls_dispatched(), 1);
    }

    #[test]
    fn test_summary_lists_events() {
        let mut timeline = FlowTimeline::new();
        timeline.add_event(entered("Start"));
        timeline.add_event(EventType::Failed { status: "device busy".to_string() });

        let summary = timeline.summary();
        assert!(summary.contains("enter Start"));
        assert!(summary.contains("FAILED: device busy"));
    }

    #[test]
    fn test_timeline_serialization_roundtrip() {
        let mut timeline = FlowTimeline::new();
        timeline.add_event(entered("Start"));
        timeline.add_event(EventType::ReplyDiscarded {
            request_id: 3,
            reason: "duplicate".to_string(),
        });

        let json = serde_json::to_string(&timeline).unwrap();
        let loaded: FlowTimeline = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, timeline);
    }
}
