//! # Call Events
//!
//! With `logging.record_calls` enabled the I/O context records one [`CallEvent`] per
//! served call. The log is bounded; the oldest events are discarded first.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use crate::table::Handle;

pub const DEFAULT_EVENT_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEvent {
    pub correlation_id: u64,
    /// `tag.operation`, e.g. `tcp-socket.start-bind`
    pub opcode: String,
    pub handle: Option<Handle>,
    /// `ok`, an error kind such as `would-block`, or `fatal`
    pub outcome: String,
}

/// Shared, bounded event log. Clones refer to the same log.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<Mutex<EventBuffer>>,
}

#[derive(Debug)]
struct EventBuffer {
    enabled: bool,
    capacity: usize,
    events: VecDeque<CallEvent>,
}

impl EventLog {
    pub fn new(enabled: bool, capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventBuffer {
                enabled,
                capacity: capacity.max(1),
                events: VecDeque::new(),
            })),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, 1)
    }

    pub fn is_enabled(&self) -> bool {
        self.buffer().enabled
    }

    pub fn record(&self, event: CallEvent) {
        let mut buffer = self.buffer();
        if !buffer.enabled {
            return;
        }
        if buffer.events.len() == buffer.capacity {
            buffer.events.pop_front();
        }
        buffer.events.push_back(event);
    }

    pub fn snapshot(&self) -> Vec<CallEvent> {
        self.buffer().events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buffer().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One JSON object per line, oldest first.
    pub fn to_json_lines(&self) -> serde_json::Result<String> {
        let mut out = String::new();
        for event in self.buffer().events.iter() {
            out.push_str(&serde_json::to_string(event)?);
            out.push('\n');
        }
        Ok(out)
    }

    fn buffer(&self) -> std::sync::MutexGuard<'_, EventBuffer> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: u64) -> CallEvent {
        CallEvent {
            correlation_id: id,
            opcode: "pollable.ready".to_string(),
            handle: Some(Handle::from_rep(1)),
            outcome: "ok".to_string(),
        }
    }

    #[test]
    fn test_oldest_events_are_discarded() {
        let log = EventLog::new(true, 2);
        log.record(event(1));
        log.record(event(2));
        log.record(event(3));
        let ids: Vec<u64> = log.snapshot().iter().map(|e| e.correlation_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_disabled_log_records_nothing() {
        let log = EventLog::disabled();
        log.record(event(1));
        assert!(log.is_empty());
    }

    #[test]
    fn test_json_lines_parse_back() {
        let log = EventLog::new(true, 8);
        log.record(event(7));
        let lines = log.to_json_lines().unwrap();
        let parsed: CallEvent = serde_json::from_str(lines.trim_end()).unwrap();
        assert_eq!(parsed, event(7));
    }
}
