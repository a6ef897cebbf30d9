//! # I/O Context
//!
//! A dedicated OS thread running a current-thread tokio runtime. It owns the
//! [`IoStore`] and serves every request arriving from the bridges as its own task, so a
//! call that waits inside the context never keeps another bridge from being served.

use anyhow::{Context as _, Result};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::bridge::{Bridge, Call, Outcome, Request, Response, SignalCell};
use crate::config::StagehandConfig;
use crate::errors::ProtocolError;
use crate::events::{CallEvent, EventLog};
use crate::handler::{HandlerRegistry, HandlerResult};
use crate::store::IoStore;

/// How long in-flight calls get to settle after resources are released at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

/// # IoContext
///
/// Owner of the I/O thread. The context stops when [`IoContext::shutdown`] is called, when
/// it is dropped, or when every [`Bridge`] serving it has been dropped.
#[derive(Debug)]
pub struct IoContext {
    shutdown: CancellationToken,
    thread: Option<JoinHandle<()>>,
    events: EventLog,
}

impl IoContext {
    /// Start an I/O context and return it with its first calling context.
    ///
    /// ## Parameters
    ///
    /// * `config` - Validated before anything is started
    /// * `registry` - Handlers serving each resource tag
    ///
    /// ## Returns
    ///
    /// * `Ok((IoContext, Bridge))` - The running context and a bridge to it
    /// * `Err(anyhow::Error)` - Invalid configuration, or the runtime or thread could not
    ///   be created
    pub fn spawn(config: StagehandConfig, registry: HandlerRegistry) -> Result<(IoContext, Bridge)> {
        config.validate()?;
        let (requests_tx, requests_rx) = mpsc::channel(config.bridge.channel_capacity);
        let bridge = Bridge::new(requests_tx, config.bridge.call_timeout());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build the I/O runtime")?;

        let store = Arc::new(IoStore::new(config));
        let events = store.events().clone();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let registry = Arc::new(registry);

        let thread = std::thread::Builder::new()
            .name("stagehand-io".to_string())
            .spawn(move || runtime.block_on(serve(requests_rx, store, registry, token)))
            .context("Failed to spawn the I/O thread")?;

        info!("I/O context started");
        Ok((
            IoContext {
                shutdown,
                thread: Some(thread),
                events,
            },
            bridge,
        ))
    }

    /// Calls recorded so far. Empty unless `logging.record_calls` is set.
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Stop serving, drop every resource and join the I/O thread. Calls still in flight
    /// or queued fail with `context-terminated`.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        self.shutdown.cancel();
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| anyhow::anyhow!("I/O thread panicked")),
            None => Ok(()),
        }
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!("I/O context did not stop cleanly: {}", err);
        }
    }
}

async fn serve(
    mut requests: mpsc::Receiver<Request>,
    store: Arc<IoStore>,
    registry: Arc<HandlerRegistry>,
    shutdown: CancellationToken,
) {
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("shutdown requested");
                break;
            }
            request = requests.recv() => match request {
                Some(request) => {
                    tasks.spawn(serve_one(Arc::clone(&store), Arc::clone(&registry), request));
                }
                None => {
                    debug!("every bridge is gone");
                    break;
                }
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(err) = joined {
                    if err.is_panic() {
                        error!("request task panicked: {}", err);
                    }
                }
            }
        }
    }

    requests.close();
    while let Ok(request) = requests.try_recv() {
        // Dropping the reply answers with context-terminated.
        drop(Reply::new(request.correlation_id, request.reply));
    }

    store.release_all();
    let settle = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(SHUTDOWN_GRACE, settle).await.is_err() {
        warn!("aborting {} call(s) still in flight", tasks.len());
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
    info!("I/O context stopped");
}

async fn serve_one(store: Arc<IoStore>, registry: Arc<HandlerRegistry>, request: Request) {
    let Request {
        correlation_id,
        call,
        reply,
    } = request;
    let reply = Reply::new(correlation_id, reply);
    let opcode = call.opcode;
    let handle = call.handle;

    let outcome = match dispatch(&store, &registry, call).await {
        Ok(Ok(value)) => Outcome::Result(value),
        Ok(Err(err)) => Outcome::Error(err),
        Err(err) => {
            error!("fatal protocol error on call {}: {}", correlation_id, err);
            Outcome::Fatal(err)
        }
    };
    trace!("call {} {} -> {}", correlation_id, opcode, outcome.kind());

    store.events().record(CallEvent {
        correlation_id,
        opcode: opcode.to_string(),
        handle,
        outcome: outcome.kind().to_string(),
    });
    reply.send(outcome);
}

async fn dispatch(store: &Arc<IoStore>, registry: &HandlerRegistry, call: Call) -> HandlerResult {
    let (op, tag) = call.opcode.decode()?;
    let handler = registry
        .handler_for(tag)
        .ok_or(ProtocolError::UnknownOpcode(call.opcode.raw()))?;
    handler.handle(Arc::clone(store), op, tag, call).await
}

/// Answers a request exactly once. Dropped unanswered (task aborted, panic, shutdown), it
/// answers with `context-terminated` so the caller never hangs.
struct Reply {
    correlation_id: u64,
    cell: Option<Arc<SignalCell>>,
}

impl Reply {
    fn new(correlation_id: u64, cell: Arc<SignalCell>) -> Self {
        Self {
            correlation_id,
            cell: Some(cell),
        }
    }

    fn send(mut self, outcome: Outcome) {
        if let Some(cell) = self.cell.take() {
            cell.signal(Response {
                correlation_id: self.correlation_id,
                outcome,
            });
        }
    }
}

impl Drop for Reply {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            cell.signal(Response {
                correlation_id: self.correlation_id,
                outcome: Outcome::Fatal(ProtocolError::ContextTerminated),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;
    use crate::opcode::{BaseOp, Opcode, ResourceTag};
    use crate::value::Value;

    fn spawn_default() -> (IoContext, Bridge) {
        IoContext::spawn(StagehandConfig::default(), HandlerRegistry::default()).unwrap()
    }

    #[test]
    fn test_unknown_opcode_is_fatal() {
        let (context, bridge) = spawn_default();
        let err = bridge.call(0xffff_ffffu32, None, Value::Unit).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ProtocolError>(),
            Some(&ProtocolError::UnknownOpcode(0xffff_ffff))
        );
        assert!(bridge.is_poisoned());

        // Other calling contexts are unaffected.
        let mut config = StagehandConfig::default();
        config.logging.record_calls = true;
        let other = IoContext::spawn(config, HandlerRegistry::default()).unwrap();
        let ready = other
            .1
            .call(Opcode::new(BaseOp::Create, ResourceTag::Pollable), None, Value::Bool(true))
            .unwrap();
        assert!(ready.is_ok());
        assert_eq!(other.0.events().len(), 1);
        context.shutdown().unwrap();
    }

    #[test]
    fn test_missing_handler_is_unknown_opcode() {
        let (_context, bridge) =
            IoContext::spawn(StagehandConfig::default(), HandlerRegistry::new()).unwrap();
        let opcode = Opcode::new(BaseOp::Now, ResourceTag::Clock);
        let err = bridge.call(opcode, None, Value::Unit).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ProtocolError>(),
            Some(&ProtocolError::UnknownOpcode(opcode.raw()))
        );
    }

    #[test]
    fn test_cloned_bridges_share_the_table() {
        let (_context, bridge) = spawn_default();
        let other = bridge.try_clone().unwrap();
        let handle = bridge
            .call(Opcode::new(BaseOp::Create, ResourceTag::Pollable), None, Value::Bool(false))
            .unwrap()
            .unwrap()
            .as_handle()
            .unwrap();
        let ready = other
            .call(Opcode::new(BaseOp::Ready, ResourceTag::Pollable), Some(handle), Value::Unit)
            .unwrap()
            .unwrap();
        assert_eq!(ready, Value::Bool(false));
    }

    #[test]
    fn test_calls_after_shutdown_fail() {
        let (context, bridge) = spawn_default();
        context.shutdown().unwrap();
        let err = bridge
            .call(Opcode::new(BaseOp::Now, ResourceTag::Clock), None, Value::Unit)
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ProtocolError>(),
            Some(&ProtocolError::ContextTerminated)
        );
    }

    #[test]
    fn test_stale_handle_is_invalid_state() {
        let (_context, bridge) = spawn_default();
        let create = Opcode::new(BaseOp::Create, ResourceTag::Pollable);
        let drop_op = Opcode::new(BaseOp::Drop, ResourceTag::Pollable);
        let handle = bridge
            .call(create, None, Value::Bool(true))
            .unwrap()
            .unwrap()
            .as_handle()
            .unwrap();
        bridge.call(drop_op, Some(handle), Value::Unit).unwrap().unwrap();
        let err = bridge.call(drop_op, Some(handle), Value::Unit).unwrap().unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidState));
        assert!(!bridge.is_poisoned());
    }
}
