//! # I/O Store
//!
//! The state a handler works against: the resource table, the configuration, the
//! monotonic clock and the call event log. One store belongs to one I/O context and is
//! shared by every in-flight request task on that context.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::StagehandConfig;
use crate::events::{EventLog, DEFAULT_EVENT_CAPACITY};
use crate::host::poll::MonotonicClock;
use crate::table::ResourceTable;

/// # IoStore
///
/// Handlers lock the table only for the synchronous part of an operation. Anything that
/// waits (a blocking read, a pollable block) clones what it needs out of the table first,
/// so a concurrent drop can still reach the table and wake the waiter.
#[derive(Debug)]
pub struct IoStore {
    table: Mutex<ResourceTable>,
    config: StagehandConfig,
    clock: MonotonicClock,
    events: EventLog,
}

impl IoStore {
    pub fn new(config: StagehandConfig) -> Self {
        let events = EventLog::new(config.logging.record_calls, DEFAULT_EVENT_CAPACITY);
        Self {
            table: Mutex::new(ResourceTable::new()),
            config,
            clock: MonotonicClock::new(),
            events,
        }
    }

    pub fn table(&self) -> MutexGuard<'_, ResourceTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &StagehandConfig {
        &self.config
    }

    pub fn clock(&self) -> &MonotonicClock {
        &self.clock
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Drop every resource, releasing native handles and waking blocked waiters.
    pub fn release_all(&self) {
        self.table().clear();
    }
}
