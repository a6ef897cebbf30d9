//! # Handlers
//!
//! A [`Handler`] serves every operation for a set of resource tags. The I/O context looks
//! the tag of each incoming opcode up in the [`HandlerRegistry`] and hands the call to the
//! registered handler, which selects the operation by base code.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::bridge::Call;
use crate::errors::{Error, ProtocolError};
use crate::host::lookup::LookupHandler;
use crate::host::poll::PollHandler;
use crate::host::streams::StreamsHandler;
use crate::host::tcp::TcpHandler;
use crate::host::udp::UdpHandler;
use crate::opcode::{BaseOp, ResourceTag};
use crate::store::IoStore;
use crate::value::Value;

/// Outer `Err` is a fatal protocol failure; inner `Err` is a semantic error for the caller.
pub type HandlerResult = Result<Result<Value, Error>, ProtocolError>;

pub trait Handler: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Resource tags this handler serves.
    fn tags(&self) -> &'static [ResourceTag];

    fn handle(
        &self,
        store: Arc<IoStore>,
        op: BaseOp,
        tag: ResourceTag,
        call: Call,
    ) -> BoxFuture<'static, HandlerResult>;
}

/// The base operation is not defined for the tag.
pub fn unsupported(op: BaseOp, tag: ResourceTag) -> ProtocolError {
    ProtocolError::UnsupportedOperation {
        op: op.name().to_string(),
        tag: tag.name().to_string(),
    }
}

pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn Handler>>,
    by_tag: HashMap<ResourceTag, usize>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            by_tag: HashMap::new(),
        }
    }

    /// Register `handler` for its tags. A later registration for a tag replaces the
    /// earlier one.
    pub fn register<H: Handler>(&mut self, handler: H) {
        let index = self.handlers.len();
        for tag in handler.tags() {
            if let Some(previous) = self.by_tag.insert(*tag, index) {
                warn!(
                    "handler '{}' replaces '{}' for {}",
                    handler.name(),
                    self.handlers[previous].name(),
                    tag.name()
                );
            }
        }
        debug!("registered handler '{}'", handler.name());
        self.handlers.push(Arc::new(handler));
    }

    pub fn handler_for(&self, tag: ResourceTag) -> Option<Arc<dyn Handler>> {
        self.by_tag
            .get(&tag)
            .map(|index| Arc::clone(&self.handlers[*index]))
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }
}

impl Default for HandlerRegistry {
    /// Streams, pollables and the clock, TCP, UDP and name lookup.
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(StreamsHandler);
        registry.register(PollHandler);
        registry.register(TcpHandler);
        registry.register(UdpHandler);
        registry.register(LookupHandler);
        registry
    }
}
