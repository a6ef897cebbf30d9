//! IP name lookup.
//!
//! `resolve-addresses` starts a resolution task and returns a resolve-address stream.
//! The stream yields `would-block` until the task settles, then one address per call.

use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::debug;

use super::poll::Pollable;
use super::shared::{Readiness, Shared};
use crate::bridge::Call;
use crate::errors::{Error, ErrorCode};
use crate::handler::{unsupported, Handler, HandlerResult};
use crate::opcode::{BaseOp, ResourceTag};
use crate::store::IoStore;
use crate::value::Value;

#[derive(Debug)]
pub enum Resolution {
    Pending,
    Done(VecDeque<IpAddr>),
    Failed(ErrorCode),
}

impl Resolution {
    fn settled(&self) -> bool {
        !matches!(self, Resolution::Pending)
    }
}

#[derive(Debug)]
pub struct ResolveAddressStream {
    resolution: Arc<Shared<Resolution>>,
    task: Option<AbortHandle>,
}

impl ResolveAddressStream {
    /// Validate `name` and start resolving it. IP literals settle immediately.
    pub fn start(name: &str) -> Result<Self, Error> {
        let host = parse_name(name)?;
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Self {
                resolution: Shared::new(Resolution::Done(VecDeque::from([ip]))),
                task: None,
            });
        }

        let resolution = Shared::new(Resolution::Pending);
        let target = Arc::clone(&resolution);
        let host = host.to_string();
        let task = tokio::spawn(async move {
            let settled = match tokio::net::lookup_host((host.as_str(), 0)).await {
                Ok(addrs) => {
                    let mut unique = VecDeque::new();
                    for addr in addrs {
                        if !unique.contains(&addr.ip()) {
                            unique.push_back(addr.ip());
                        }
                    }
                    debug!("resolved {} to {} address(es)", host, unique.len());
                    Resolution::Done(unique)
                }
                Err(err) => {
                    debug!("resolving {} failed: {}", host, err);
                    Resolution::Failed(lookup_error(&err))
                }
            };
            target.update(|state| *state = settled);
        });
        Ok(Self {
            resolution,
            task: Some(task.abort_handle()),
        })
    }

    /// Next address, `None` once exhausted.
    pub fn next_address(&self) -> Result<Option<IpAddr>, Error> {
        let mut state = self.resolution.lock();
        match &mut *state {
            Resolution::Pending => Err(ErrorCode::WouldBlock.into()),
            Resolution::Done(addrs) => Ok(addrs.pop_front()),
            Resolution::Failed(code) => Err((*code).into()),
        }
    }

    pub fn subscribe(&self) -> Pollable {
        Pollable::one_shot(Readiness::new(&self.resolution, Resolution::settled))
    }

    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Host part of `name`, with IPv6 literal brackets removed.
fn parse_name(name: &str) -> Result<&str, Error> {
    let invalid = |reason: &str| Error::detailed(ErrorCode::InvalidArgument, format!("{:?}: {}", name, reason));
    if name.is_empty() {
        return Err(invalid("empty name"));
    }
    if let Some(inner) = name.strip_prefix('[').and_then(|n| n.strip_suffix(']')) {
        return inner
            .parse::<std::net::Ipv6Addr>()
            .map(|_| inner)
            .map_err(|_| invalid("bracketed name is not an IPv6 address"));
    }
    if name.parse::<IpAddr>().is_ok() {
        return Ok(name);
    }
    let valid_label = |label: &str| {
        !label.is_empty()
            && label.len() <= 63
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    };
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    if trimmed.len() > 253 || !trimmed.split('.').all(valid_label) {
        return Err(invalid("not a valid host name"));
    }
    Ok(name)
}

/// Classify a resolver failure. The structured error wins; getaddrinfo failures
/// only surface as text, so the message is the fallback.
fn lookup_error(err: &io::Error) -> ErrorCode {
    match err.raw_os_error() {
        Some(libc::EAGAIN | libc::EINTR | libc::ETIMEDOUT) => {
            return ErrorCode::TemporaryResolverFailure
        }
        Some(libc::ENOENT) => return ErrorCode::NameUnresolvable,
        _ => {}
    }
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut => {
            return ErrorCode::TemporaryResolverFailure
        }
        io::ErrorKind::NotFound => return ErrorCode::NameUnresolvable,
        _ => {}
    }

    let message = err.to_string().to_ascii_lowercase();
    if message.contains("temporary") || message.contains("try again") {
        ErrorCode::TemporaryResolverFailure
    } else if message.contains("not known")
        || message.contains("no address")
        || message.contains("not found")
        || message.contains("nodename nor servname")
    {
        ErrorCode::NameUnresolvable
    } else {
        ErrorCode::PermanentResolverFailure
    }
}

pub struct LookupHandler;

impl LookupHandler {
    async fn dispatch(store: Arc<IoStore>, op: BaseOp, tag: ResourceTag, call: Call) -> HandlerResult {
        match (op, tag) {
            (BaseOp::ResolveAddresses, ResourceTag::NameLookup) => {
                let name = call.arg(Value::as_string, "host name")?;
                Ok(ResolveAddressStream::start(&name)
                    .and_then(|stream| store.table().push(stream))
                    .map(Value::Handle))
            }
            (BaseOp::ResolveNextAddress, ResourceTag::Future) => {
                let handle = call.handle()?;
                Ok(store
                    .table()
                    .get::<ResolveAddressStream>(handle)
                    .and_then(ResolveAddressStream::next_address)
                    .map(Value::OptionalIp))
            }
            (BaseOp::Subscribe, ResourceTag::Future) => {
                let handle = call.handle()?;
                let mut table = store.table();
                Ok(table
                    .get::<ResolveAddressStream>(handle)
                    .map(ResolveAddressStream::subscribe)
                    .and_then(|pollable| table.push(pollable))
                    .map(Value::Handle))
            }
            (BaseOp::Drop, ResourceTag::Future) => {
                let handle = call.handle()?;
                Ok(store
                    .table()
                    .delete::<ResolveAddressStream>(handle)
                    .map(|_| Value::Unit))
            }
            _ => Err(unsupported(op, tag)),
        }
    }
}

impl Handler for LookupHandler {
    fn name(&self) -> &str {
        "ip-name-lookup"
    }

    fn tags(&self) -> &'static [ResourceTag] {
        &[ResourceTag::NameLookup, ResourceTag::Future]
    }

    fn handle(
        &self,
        store: Arc<IoStore>,
        op: BaseOp,
        tag: ResourceTag,
        call: Call,
    ) -> BoxFuture<'static, HandlerResult> {
        Box::pin(Self::dispatch(store, op, tag, call))
    }
}
