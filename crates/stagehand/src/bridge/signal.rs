use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use super::Response;

/// One-slot mailbox a calling context blocks on while the I/O context serves its call.
///
/// The cell is allocated once per bridge and reused for every call.
#[derive(Debug, Default)]
pub struct SignalCell {
    slot: Mutex<Option<Response>>,
    ready: Condvar,
}

impl SignalCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `response` and wake the waiting caller. A response nobody took yet is
    /// replaced.
    pub fn signal(&self, response: Response) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(response);
        self.ready.notify_one();
    }

    /// Block until a response arrives, or `timeout` elapses.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<Response> {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let mut slot = match timeout {
            None => self
                .ready
                .wait_while(slot, |slot| slot.is_none())
                .unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => {
                self.ready
                    .wait_timeout_while(slot, timeout, |slot| slot.is_none())
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        };
        slot.take()
    }

    /// Discard a response left over from an abandoned call.
    pub fn reset(&self) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Outcome;
    use crate::value::Value;
    use std::sync::Arc;

    #[test]
    fn test_wait_returns_signalled_response() {
        let cell = Arc::new(SignalCell::new());
        let signaller = Arc::clone(&cell);
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            signaller.signal(Response {
                correlation_id: 9,
                outcome: Outcome::Result(Value::Unit),
            });
        });
        let response = cell.wait(None).unwrap();
        assert_eq!(response.correlation_id, 9);
        assert!(cell.wait(Some(Duration::ZERO)).is_none());
        thread.join().unwrap();
    }

    #[test]
    fn test_wait_times_out() {
        let cell = SignalCell::new();
        assert!(cell.wait(Some(Duration::from_millis(10))).is_none());
    }
}
