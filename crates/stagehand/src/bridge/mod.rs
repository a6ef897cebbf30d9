//! # Bridge
//!
//! The calling side of the synchronous facade. [`Bridge::call`] hands a request to the I/O
//! context over a channel and then blocks the calling thread on a [`SignalCell`] until the
//! context writes the response. Whether the context served the call immediately or after
//! awaiting native I/O is invisible to the caller.
//!
//! Each call carries a correlation id. A response that does not carry the id of the call
//! in flight means the two sides have desynchronized; that, like any other
//! [`ProtocolError`], is fatal and poisons the bridge for every later call.

mod signal;

pub use signal::SignalCell;

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::errors::{Error, ProtocolError};
use crate::opcode::Opcode;
use crate::table::Handle;
use crate::value::Value;

/// One operation against the I/O context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub opcode: Opcode,
    pub handle: Option<Handle>,
    pub payload: Value,
}

impl Call {
    pub fn new(opcode: Opcode, handle: Option<Handle>, payload: Value) -> Self {
        Self {
            opcode,
            handle,
            payload,
        }
    }

    /// The handle the operation targets. Operations on a resource always name one.
    pub fn handle(&self) -> Result<Handle, ProtocolError> {
        self.handle
            .ok_or_else(|| self.malformed("operation requires a resource handle"))
    }

    /// Extract the payload with `extract`, or fail naming the `expected` shape.
    pub fn arg<T>(
        &self,
        extract: impl FnOnce(&Value) -> Option<T>,
        expected: &str,
    ) -> Result<T, ProtocolError> {
        extract(&self.payload).ok_or_else(|| {
            self.malformed(format!(
                "expected {}, got {}",
                expected,
                self.payload.type_name()
            ))
        })
    }

    pub fn malformed(&self, reason: impl Into<String>) -> ProtocolError {
        ProtocolError::MalformedPayload {
            opcode: self.opcode.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug)]
pub struct Request {
    pub correlation_id: u64,
    pub call: Call,
    pub reply: Arc<SignalCell>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub correlation_id: u64,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Result(Value),
    Error(Error),
    Fatal(ProtocolError),
}

impl Outcome {
    /// `ok`, the error kind, or `fatal`.
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Result(_) => "ok",
            Outcome::Error(err) => err.kind(),
            Outcome::Fatal(_) => "fatal",
        }
    }
}

/// # Bridge
///
/// A calling context. Calls block the current thread, so a bridge must not be used from
/// inside an async runtime. Use [`Bridge::try_clone`] to get a bridge for another thread;
/// each bridge has its own signal cell, so a bridge itself is not shared between threads.
#[derive(Debug)]
pub struct Bridge {
    requests: mpsc::Sender<Request>,
    cell: Arc<SignalCell>,
    next_correlation: AtomicU64,
    poisoned: AtomicBool,
    call_timeout: Option<Duration>,
    _single_caller: PhantomData<Cell<()>>,
}

impl Bridge {
    pub(crate) fn new(requests: mpsc::Sender<Request>, call_timeout: Option<Duration>) -> Self {
        Self {
            requests,
            cell: Arc::new(SignalCell::new()),
            next_correlation: AtomicU64::new(1),
            poisoned: AtomicBool::new(false),
            call_timeout,
            _single_caller: PhantomData,
        }
    }

    /// Issue one call and block until the I/O context answers.
    ///
    /// ## Returns
    ///
    /// * `Ok(Ok(value))` - The operation succeeded
    /// * `Ok(Err(error))` - The operation failed with a recoverable semantic error
    /// * `Err(_)` - A fatal [`ProtocolError`]; the bridge is poisoned afterwards
    pub fn call(
        &self,
        opcode: impl Into<Opcode>,
        handle: Option<Handle>,
        payload: Value,
    ) -> anyhow::Result<Result<Value, Error>> {
        if self.is_poisoned() {
            return Err(ProtocolError::Poisoned.into());
        }
        let opcode = opcode.into();
        let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let request = Request {
            correlation_id,
            call: Call::new(opcode, handle, payload),
            reply: Arc::clone(&self.cell),
        };

        self.cell.reset();
        if self.requests.blocking_send(request).is_err() {
            return Err(self.poison(ProtocolError::ContextTerminated));
        }

        let response = match self.cell.wait(self.call_timeout) {
            Some(response) => response,
            None => {
                let timeout = self.call_timeout.unwrap_or_default();
                return Err(self.poison(ProtocolError::Timeout(timeout)));
            }
        };
        if response.correlation_id != correlation_id {
            return Err(self.poison(ProtocolError::CorrelationMismatch {
                expected: correlation_id,
                received: response.correlation_id,
            }));
        }

        match response.outcome {
            Outcome::Result(value) => Ok(Ok(value)),
            Outcome::Error(err) => {
                debug!("{} failed: {}", opcode, err);
                Ok(Err(err))
            }
            Outcome::Fatal(err) => Err(self.poison(err)),
        }
    }

    /// A new calling context on the same I/O context.
    pub fn try_clone(&self) -> anyhow::Result<Bridge> {
        if self.is_poisoned() {
            return Err(ProtocolError::Poisoned.into());
        }
        if self.requests.is_closed() {
            return Err(ProtocolError::ContextTerminated.into());
        }
        Ok(Bridge::new(self.requests.clone(), self.call_timeout))
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    pub(crate) fn poison(&self, err: ProtocolError) -> anyhow::Error {
        error!("bridge poisoned: {}", err);
        self.poisoned.store(true, Ordering::Release);
        err.into()
    }

    #[cfg(test)]
    pub(crate) fn cell(&self) -> Arc<SignalCell> {
        Arc::clone(&self.cell)
    }
}
