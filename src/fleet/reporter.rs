//! Local events waiting to be sent with the next checkin
//!
//! The queue is bounded; when full the oldest event is dropped. Events are
//! removed only once the checkin that carried them succeeded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::warn;

pub const DEFAULT_CAPACITY: usize = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportedEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub subtype: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ReportedEvent {
    pub fn state(subtype: &str, message: impl Into<String>) -> Self {
        Self {
            event_type: "STATE".to_string(),
            subtype: subtype.to_string(),
            timestamp: Utc::now(),
            message: message.into(),
            payload: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            event_type: "ERROR".to_string(),
            subtype: "FAILED".to_string(),
            timestamp: Utc::now(),
            message: message.into(),
            payload: None,
        }
    }
}

/// Events of one checkin; pass `up_to` to [`Reporter::ack`] once delivered.
#[derive(Debug, Clone, Default)]
pub struct PendingEvents {
    pub events: Vec<ReportedEvent>,
    pub up_to: u64,
}

struct Queue {
    events: VecDeque<(u64, ReportedEvent)>,
    next_seq: u64,
}

pub struct Reporter {
    queue: Mutex<Queue>,
    capacity: usize,
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Reporter {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(Queue {
                events: VecDeque::new(),
                next_seq: 1,
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn report(&self, event: ReportedEvent) {
        let mut queue = self.lock();
        if queue.events.len() >= self.capacity {
            if let Some((_, dropped)) = queue.events.pop_front() {
                warn!("Event queue full, dropping: {}", dropped.message);
            }
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.events.push_back((seq, event));
    }

    /// Snapshot of the queued events.
    pub fn pending(&self) -> PendingEvents {
        let queue = self.lock();
        PendingEvents {
            events: queue.events.iter().map(|(_, e)| e.clone()).collect(),
            up_to: queue.events.back().map(|(seq, _)| *seq).unwrap_or(0),
        }
    }

    /// Drop events up to and including `up_to`.
    pub fn ack(&self, up_to: u64) {
        let mut queue = self.lock();
        while queue.events.front().is_some_and(|(seq, _)| *seq <= up_to) {
            queue.events.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_kept_until_acked() {
        let reporter = Reporter::default();
        reporter.report(ReportedEvent::state("RUNNING", "one"));
        reporter.report(ReportedEvent::state("RUNNING", "two"));

        let pending = reporter.pending();
        assert_eq!(pending.events.len(), 2);
        reporter.report(ReportedEvent::error("three"));

        reporter.ack(pending.up_to);
        let rest = reporter.pending();
        assert_eq!(rest.events.len(), 1);
        assert_eq!(rest.events[0].message, "three");
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let reporter = Reporter::new(2);
        for message in ["a", "b", "c"] {
            reporter.report(ReportedEvent::state("RUNNING", message));
        }
        let messages: Vec<String> = reporter
            .pending()
            .events
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(messages, vec!["b", "c"]);
    }

    #[test]
    fn test_empty_pending() {
        let reporter = Reporter::default();
        let pending = reporter.pending();
        assert!(pending.events.is_empty());
        reporter.ack(pending.up_to);
        assert!(reporter.is_empty());
    }
}
