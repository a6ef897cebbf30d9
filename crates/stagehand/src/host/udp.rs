//! # UDP Sockets and Datagram Streams
//!
//! A UDP socket binds in two phases like TCP, then hands out datagram streams with
//! `stream(remote?)`. Each call tears down the previous pair. With a remote address the
//! pair is connected: incoming datagrams from other peers are dropped, and outgoing
//! datagrams may only target that peer. The association is kept by this module rather
//! than by the OS, so re-streaming never needs to disconnect a native socket.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use socket2::{Protocol, SockRef, Type};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::network::{self, apply_hop_limit, IpAddressFamily, SocketOption, SocketOptions};
use super::poll::Pollable;
use super::shared::{Readiness, Shared};
use super::tcp::{PendingKind, PendingOps};
use crate::bridge::Call;
use crate::config::SocketsConfig;
use crate::errors::{Error, ErrorCode};
use crate::handler::{unsupported, Handler, HandlerResult};
use crate::opcode::{BaseOp, ResourceTag};
use crate::store::IoStore;
use crate::table::Handle;
use crate::value::{OptionValue, Value};

/// Largest payload a single UDP datagram can carry.
const RECEIVE_BUFFER_SIZE: usize = 65_536;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingDatagram {
    pub data: Vec<u8>,
    pub remote_address: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingDatagram {
    pub data: Vec<u8>,
    /// Required unless the stream is connected
    pub remote_address: Option<SocketAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UdpState {
    Init,
    Bind,
    Bound,
    Connected,
    Error,
    Closed,
}

#[derive(Debug)]
enum Native {
    None,
    Unbound(socket2::Socket),
    Bound(Arc<tokio::net::UdpSocket>),
}

#[derive(Debug)]
pub struct UdpSocket {
    state: UdpState,
    family: IpAddressFamily,
    requested: Option<SocketAddr>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    options: SocketOptions,
    pending: PendingOps,
    native: Native,
    /// Cancels the datagram streams handed out by the latest `stream` call
    streams: Option<CancellationToken>,
    error: Option<ErrorCode>,
}

impl UdpSocket {
    pub fn new(family: IpAddressFamily) -> Result<Self, Error> {
        let socket = network::open_socket(family, Type::DGRAM, Protocol::UDP)?;
        Ok(Self {
            state: UdpState::Init,
            family,
            requested: None,
            local: None,
            remote: None,
            options: SocketOptions::default(),
            pending: PendingOps::default(),
            native: Native::Unbound(socket),
            streams: None,
            error: None,
        })
    }

    pub fn state(&self) -> UdpState {
        self.state
    }

    pub fn family(&self) -> IpAddressFamily {
        self.family
    }

    /// Cause of the failed `finish-bind` that moved this socket to `Error`.
    pub fn error(&self) -> Option<ErrorCode> {
        self.error
    }

    fn invalid_state(&self, operation: &str) -> Error {
        Error::detailed(
            ErrorCode::InvalidState,
            format!("{} not allowed in {:?} state", operation, self.state),
        )
    }

    fn fail(&mut self, code: ErrorCode) -> Error {
        warn!("udp socket failed: {}", code);
        self.state = UdpState::Error;
        self.error = Some(code);
        self.native = Native::None;
        code.into()
    }

    fn sock_ref(&self) -> Option<SockRef<'_>> {
        match &self.native {
            Native::Unbound(socket) => Some(SockRef::from(socket)),
            Native::Bound(socket) => Some(SockRef::from(socket.as_ref())),
            Native::None => None,
        }
    }

    pub fn start_bind(&mut self, addr: SocketAddr) -> Result<(), Error> {
        if self.state != UdpState::Init {
            return Err(self.invalid_state("start-bind"));
        }
        network::validate_address(&addr, self.family, self.options.ipv6_only)?;
        self.pending.begin(PendingKind::Bind)?;
        debug!("udp start-bind {}", addr);
        self.requested = Some(addr);
        self.state = UdpState::Bind;
        Ok(())
    }

    pub fn finish_bind(&mut self) -> Result<(), Error> {
        self.pending.finish(PendingKind::Bind)?;
        let addr = self.requested.take().ok_or(ErrorCode::NotInProgress)?;
        let socket = match std::mem::replace(&mut self.native, Native::None) {
            Native::Unbound(socket) => socket,
            other => {
                self.native = other;
                return Err(self.invalid_state("finish-bind"));
            }
        };
        if let Err(err) = socket.bind(&addr.into()) {
            return Err(self.fail(ErrorCode::from(err)));
        }
        let socket = match tokio::net::UdpSocket::from_std(std::net::UdpSocket::from(socket)) {
            Ok(socket) => socket,
            Err(err) => return Err(self.fail(ErrorCode::from(err))),
        };
        self.local = socket.local_addr().ok();
        info!("udp socket bound to {:?}", self.local);
        self.native = Native::Bound(Arc::new(socket));
        self.state = UdpState::Bound;
        Ok(())
    }

    /// Replace the datagram streams, optionally associating a remote peer.
    pub fn stream(
        &mut self,
        remote: Option<SocketAddr>,
        config: &SocketsConfig,
    ) -> Result<(IncomingDatagramStream, OutgoingDatagramStream), Error> {
        if !matches!(self.state, UdpState::Bound | UdpState::Connected) {
            return Err(self.invalid_state("stream"));
        }
        let Native::Bound(socket) = &self.native else {
            return Err(self.invalid_state("stream"));
        };
        if let Some(remote) = &remote {
            network::validate_address(remote, self.family, self.options.ipv6_only)?;
            network::validate_remote(remote)?;
        }
        let socket = Arc::clone(socket);

        if let Some(previous) = self.streams.take() {
            debug!("tearing down previous datagram streams");
            previous.cancel();
        }
        let cancel = CancellationToken::new();
        let incoming = IncomingDatagramStream::spawn(
            Arc::clone(&socket),
            remote,
            config.datagram_queue_capacity,
            cancel.clone(),
        );
        let outgoing = OutgoingDatagramStream {
            socket: Arc::downgrade(&socket),
            remote,
            family: self.family,
            ipv6_only: self.options.ipv6_only,
            max_datagram_size: config.max_datagram_size,
            send_permit: config.send_permit,
            permit: 0,
            cancel: cancel.clone(),
        };
        self.streams = Some(cancel);
        self.remote = remote;
        self.state = if remote.is_some() {
            UdpState::Connected
        } else {
            UdpState::Bound
        };
        debug!("udp streams created, remote {:?}", remote);
        Ok((incoming, outgoing))
    }

    pub fn local_address(&self) -> Result<SocketAddr, Error> {
        self.local.ok_or_else(|| self.invalid_state("local-address"))
    }

    pub fn remote_address(&self) -> Result<SocketAddr, Error> {
        match (self.state, self.remote) {
            (UdpState::Connected, Some(remote)) => Ok(remote),
            _ => Err(self.invalid_state("remote-address")),
        }
    }

    pub fn get_option(&self, option: SocketOption) -> Result<OptionValue, Error> {
        match option {
            SocketOption::HopLimit => Ok(OptionValue::Number(u64::from(self.options.hop_limit))),
            SocketOption::ReceiveBufferSize => Ok(OptionValue::Number(
                self.options
                    .receive_buffer_size
                    .or_else(|| self.sock_ref().and_then(|s| s.recv_buffer_size().ok()).map(|n| n as u64))
                    .unwrap_or(0),
            )),
            SocketOption::SendBufferSize => Ok(OptionValue::Number(
                self.options
                    .send_buffer_size
                    .or_else(|| self.sock_ref().and_then(|s| s.send_buffer_size().ok()).map(|n| n as u64))
                    .unwrap_or(0),
            )),
            SocketOption::Ipv6Only if self.family == IpAddressFamily::Ipv6 => {
                Ok(OptionValue::Flag(self.options.ipv6_only))
            }
            _ => Err(ErrorCode::NotSupported.into()),
        }
    }

    pub fn set_option(&mut self, option: SocketOption, value: OptionValue) -> Result<(), Error> {
        if matches!(self.state, UdpState::Error | UdpState::Closed) {
            return Err(self.invalid_state("set-option"));
        }
        match (option, value) {
            (SocketOption::HopLimit, OptionValue::Number(hops)) => {
                let hops = network::validate_hop_limit(hops)?;
                self.options.hop_limit = hops;
                if let Some(sock) = self.sock_ref() {
                    apply_hop_limit(&sock, self.family, hops);
                }
            }
            (SocketOption::ReceiveBufferSize, OptionValue::Number(size)) => {
                self.options.receive_buffer_size = Some(network::validate_nonzero(option, size)?);
                self.push_socket_options();
            }
            (SocketOption::SendBufferSize, OptionValue::Number(size)) => {
                self.options.send_buffer_size = Some(network::validate_nonzero(option, size)?);
                self.push_socket_options();
            }
            (SocketOption::Ipv6Only, OptionValue::Flag(only)) if self.family == IpAddressFamily::Ipv6 => {
                if self.state != UdpState::Init {
                    return Err(self.invalid_state("setting ipv6-only"));
                }
                if let Some(sock) = self.sock_ref() {
                    network::apply_ipv6_only(&sock, only)?;
                }
                self.options.ipv6_only = only;
            }
            (SocketOption::HopLimit | SocketOption::ReceiveBufferSize | SocketOption::SendBufferSize, _) => {
                return Err(Error::detailed(
                    ErrorCode::InvalidArgument,
                    format!("wrong value type for {}", option.name()),
                ))
            }
            _ => return Err(ErrorCode::NotSupported.into()),
        }
        Ok(())
    }

    fn push_socket_options(&self) {
        if let Some(sock) = self.sock_ref() {
            network::apply_socket_options(&sock, self.family, &self.options);
        }
    }

    pub fn close(&mut self) {
        if let Some(streams) = self.streams.take() {
            streams.cancel();
        }
        self.native = Native::None;
        self.state = UdpState::Closed;
    }
}

#[derive(Debug)]
pub struct DatagramQueue {
    datagrams: VecDeque<IncomingDatagram>,
    capacity: usize,
    error: Option<ErrorCode>,
    closed: bool,
}

impl DatagramQueue {
    fn readable(&self) -> bool {
        !self.datagrams.is_empty() || self.error.is_some() || self.closed
    }
}

#[derive(Debug, Clone)]
pub struct IncomingDatagramStream {
    queue: Arc<Shared<DatagramQueue>>,
    cancel: CancellationToken,
}

impl IncomingDatagramStream {
    fn spawn(
        socket: Arc<tokio::net::UdpSocket>,
        remote: Option<SocketAddr>,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        let queue = Shared::new(DatagramQueue {
            datagrams: VecDeque::new(),
            capacity: capacity.max(1),
            error: None,
            closed: false,
        });
        tokio::spawn(run_receiver(socket, remote, Arc::clone(&queue), cancel.clone()));
        Self { queue, cancel }
    }

    /// Up to `max` queued datagrams in arrival order. Never waits.
    pub fn receive(&self, max: u64) -> Result<Vec<IncomingDatagram>, Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::detailed(
                ErrorCode::InvalidState,
                "datagram stream was replaced or its socket dropped",
            ));
        }
        let max = usize::try_from(max).unwrap_or(usize::MAX);
        if max == 0 {
            return Ok(Vec::new());
        }
        self.queue.update(|q| -> Result<Vec<IncomingDatagram>, Error> {
            let n = max.min(q.datagrams.len());
            if n == 0 {
                if let Some(code) = q.error.take() {
                    return Err(code.into());
                }
            }
            Ok(q.datagrams.drain(..n).collect())
        })
    }

    pub fn subscribe(&self) -> Pollable {
        Pollable::event(Readiness::new(&self.queue, DatagramQueue::readable))
    }

    pub fn close(&self) {
        self.cancel.cancel();
        self.queue.update(|q| q.closed = true);
    }
}

async fn run_receiver(
    socket: Arc<tokio::net::UdpSocket>,
    remote: Option<SocketAddr>,
    queue: Arc<Shared<DatagramQueue>>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        match received {
            Ok((n, from)) => {
                if remote.is_some_and(|peer| peer != from) {
                    trace!("dropping datagram from unconnected peer {}", from);
                    continue;
                }
                queue.update(|q| {
                    if q.datagrams.len() < q.capacity {
                        q.datagrams.push_back(IncomingDatagram {
                            data: buf[..n].to_vec(),
                            remote_address: from,
                        });
                    } else {
                        trace!("datagram queue full, dropping datagram from {}", from);
                    }
                });
            }
            Err(err) => {
                debug!("udp receive failed: {}", err);
                queue.update(|q| q.error = Some(ErrorCode::from(err)));
            }
        }
    }
    queue.update(|q| q.closed = true);
}

#[derive(Debug)]
pub struct OutgoingDatagramStream {
    /// The owning `UdpSocket` holds the only strong reference besides the receiver task
    socket: Weak<tokio::net::UdpSocket>,
    remote: Option<SocketAddr>,
    family: IpAddressFamily,
    ipv6_only: bool,
    max_datagram_size: usize,
    send_permit: u64,
    /// Datagrams still covered by the last `check-send`
    permit: u64,
    cancel: CancellationToken,
}

impl OutgoingDatagramStream {
    fn ensure_live(&self) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::detailed(
                ErrorCode::InvalidState,
                "datagram stream was replaced or its socket dropped",
            ));
        }
        Ok(())
    }

    pub fn check_send(&mut self) -> Result<u64, Error> {
        self.ensure_live()?;
        self.permit = self.send_permit;
        Ok(self.permit)
    }

    /// Send in order, stopping at the first failure. Datagrams before it stay sent.
    pub fn send(&mut self, datagrams: &[OutgoingDatagram]) -> Result<u64, Error> {
        self.ensure_live()?;
        if datagrams.is_empty() {
            return Ok(0);
        }
        let count = datagrams.len() as u64;
        if count > self.permit {
            return Err(Error::detailed(
                ErrorCode::InvalidArgument,
                format!("{} datagrams exceed check-send permit of {}", count, self.permit),
            ));
        }
        self.permit -= count;

        let mut sent = 0;
        for datagram in datagrams {
            if let Err(code) = self.send_one(datagram) {
                debug!("udp send stopped after {} datagram(s): {}", sent, code);
                return Err(if sent == 0 {
                    code.into()
                } else {
                    Error::PartialSend { sent, code }
                });
            }
            sent += 1;
        }
        Ok(sent)
    }

    fn send_one(&self, datagram: &OutgoingDatagram) -> Result<(), ErrorCode> {
        let target = match (self.remote, datagram.remote_address) {
            (Some(peer), None) => peer,
            (Some(peer), Some(addr)) if addr == peer => peer,
            (Some(_), Some(_)) | (None, None) => return Err(ErrorCode::InvalidArgument),
            (None, Some(addr)) => addr,
        };
        let code = |e: Error| e.code().unwrap_or(ErrorCode::Unknown);
        network::validate_address(&target, self.family, self.ipv6_only).map_err(code)?;
        network::validate_remote(&target).map_err(code)?;
        if datagram.data.len() > self.max_datagram_size {
            return Err(ErrorCode::DatagramTooLarge);
        }
        let socket = self.socket.upgrade().ok_or(ErrorCode::InvalidState)?;
        socket.try_send_to(&datagram.data, target)?;
        Ok(())
    }
}

pub struct UdpHandler;

impl UdpHandler {
    async fn dispatch(store: Arc<IoStore>, op: BaseOp, tag: ResourceTag, call: Call) -> HandlerResult {
        match (op, tag) {
            (BaseOp::Create, ResourceTag::UdpSocket) => {
                let family = call.arg(Value::as_family, "address family")?;
                Ok(UdpSocket::new(family)
                    .and_then(|socket| store.table().push(socket))
                    .map(Value::Handle))
            }
            (BaseOp::Drop, ResourceTag::UdpSocket) => {
                let handle = call.handle()?;
                Ok(store.table().delete::<UdpSocket>(handle).map(|_| Value::Unit))
            }
            (BaseOp::Subscribe, ResourceTag::UdpSocket) => {
                let handle = call.handle()?;
                let mut table = store.table();
                Ok(table
                    .get::<UdpSocket>(handle)
                    .map(|_| Pollable::ready())
                    .and_then(|pollable| table.push(pollable))
                    .map(Value::Handle))
            }
            (BaseOp::StartBind, ResourceTag::UdpSocket) => {
                let handle = call.handle()?;
                let addr = call.arg(Value::as_address, "socket address")?;
                Ok(with_socket(&store, handle, |s| s.start_bind(addr).map(|_| Value::Unit)))
            }
            (BaseOp::FinishBind, ResourceTag::UdpSocket) => {
                let handle = call.handle()?;
                Ok(with_socket(&store, handle, |s| s.finish_bind().map(|_| Value::Unit)))
            }
            (BaseOp::Stream, ResourceTag::UdpSocket) => {
                let handle = call.handle()?;
                let remote = call.arg(Value::as_optional_address, "optional remote address")?;
                Ok(stream(&store, handle, remote))
            }
            (BaseOp::LocalAddress, ResourceTag::UdpSocket) => {
                let handle = call.handle()?;
                Ok(with_socket(&store, handle, |s| s.local_address().map(Value::Address)))
            }
            (BaseOp::RemoteAddress, ResourceTag::UdpSocket) => {
                let handle = call.handle()?;
                Ok(with_socket(&store, handle, |s| s.remote_address().map(Value::Address)))
            }
            (BaseOp::AddressFamily, ResourceTag::UdpSocket) => {
                let handle = call.handle()?;
                Ok(with_socket(&store, handle, |s| Ok(Value::Family(s.family()))))
            }
            (BaseOp::GetOption, ResourceTag::UdpSocket) => {
                let handle = call.handle()?;
                let option = call.arg(Value::as_socket_option, "socket option")?;
                Ok(with_socket(&store, handle, |s| s.get_option(option).map(OptionValue::into_value)))
            }
            (BaseOp::SetOption, ResourceTag::UdpSocket) => {
                let handle = call.handle()?;
                let (option, value) = call.arg(Value::as_option_setting, "socket option and value")?;
                Ok(with_socket(&store, handle, |s| s.set_option(option, value).map(|_| Value::Unit)))
            }

            (BaseOp::Drop, ResourceTag::IncomingDatagramStream) => {
                let handle = call.handle()?;
                Ok(store
                    .table()
                    .delete::<IncomingDatagramStream>(handle)
                    .map(|_| Value::Unit))
            }
            (BaseOp::Subscribe, ResourceTag::IncomingDatagramStream) => {
                let handle = call.handle()?;
                let mut table = store.table();
                Ok(table
                    .get::<IncomingDatagramStream>(handle)
                    .map(IncomingDatagramStream::subscribe)
                    .and_then(|pollable| table.push(pollable))
                    .map(Value::Handle))
            }
            (BaseOp::Receive, ResourceTag::IncomingDatagramStream) => {
                let handle = call.handle()?;
                let max = call.arg(Value::as_u64, "maximum datagram count")?;
                Ok(store
                    .table()
                    .get::<IncomingDatagramStream>(handle)
                    .and_then(|stream| stream.receive(max))
                    .map(Value::IncomingDatagrams))
            }

            (BaseOp::Drop, ResourceTag::OutgoingDatagramStream) => {
                let handle = call.handle()?;
                Ok(store
                    .table()
                    .delete::<OutgoingDatagramStream>(handle)
                    .map(|_| Value::Unit))
            }
            (BaseOp::Subscribe, ResourceTag::OutgoingDatagramStream) => {
                let handle = call.handle()?;
                let mut table = store.table();
                Ok(table
                    .get::<OutgoingDatagramStream>(handle)
                    .map(|_| Pollable::ready())
                    .and_then(|pollable| table.push(pollable))
                    .map(Value::Handle))
            }
            (BaseOp::CheckSend, ResourceTag::OutgoingDatagramStream) => {
                let handle = call.handle()?;
                Ok(store
                    .table()
                    .get_mut::<OutgoingDatagramStream>(handle)
                    .and_then(OutgoingDatagramStream::check_send)
                    .map(Value::U64))
            }
            (BaseOp::Send, ResourceTag::OutgoingDatagramStream) => {
                let handle = call.handle()?;
                let datagrams = call.arg(Value::as_outgoing_datagrams, "outgoing datagrams")?;
                Ok(store
                    .table()
                    .get_mut::<OutgoingDatagramStream>(handle)
                    .and_then(|stream| stream.send(&datagrams))
                    .map(Value::U64))
            }
            _ => Err(unsupported(op, tag)),
        }
    }
}

fn with_socket(
    store: &IoStore,
    handle: Handle,
    f: impl FnOnce(&mut UdpSocket) -> Result<Value, Error>,
) -> Result<Value, Error> {
    let mut table = store.table();
    f(table.get_mut::<UdpSocket>(handle)?)
}

fn stream(store: &IoStore, handle: Handle, remote: Option<SocketAddr>) -> Result<Value, Error> {
    let mut table = store.table();
    let (incoming, outgoing) = table
        .get_mut::<UdpSocket>(handle)?
        .stream(remote, &store.config().sockets)?;
    let incoming = table.push(incoming)?;
    let outgoing = table.push(outgoing)?;
    Ok(Value::Handles(vec![incoming, outgoing]))
}

impl Handler for UdpHandler {
    fn name(&self) -> &str {
        "udp"
    }

    fn tags(&self) -> &'static [ResourceTag] {
        &[
            ResourceTag::UdpSocket,
            ResourceTag::IncomingDatagramStream,
            ResourceTag::OutgoingDatagramStream,
        ]
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StagehandConfig;
    use std::time::Duration;

    fn bound_socket() -> UdpSocket {
        let mut socket = UdpSocket::new(IpAddressFamily::Ipv4).unwrap();
        socket.start_bind("127.0.0.1:0".parse().unwrap()).unwrap();
        socket.finish_bind().unwrap();
        socket
    }

    #[tokio::test]
    async fn test_stream_requires_bound_socket() {
        let config = StagehandConfig::default();
        let mut socket = UdpSocket::new(IpAddressFamily::Ipv4).unwrap();
        let err = socket.stream(None, &config.sockets).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidState));
    }

    #[tokio::test]
    async fn test_restream_tears_down_previous_pair() {
        let config = StagehandConfig::default();
        let mut socket = bound_socket();
        let (old_in, mut old_out) = socket.stream(None, &config.sockets).unwrap();
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let (_new_in, _new_out) = socket.stream(Some(peer), &config.sockets).unwrap();

        assert_eq!(socket.state(), UdpState::Connected);
        assert_eq!(socket.remote_address().unwrap(), peer);
        assert_eq!(old_in.receive(1).unwrap_err().code(), Some(ErrorCode::InvalidState));
        assert_eq!(old_out.check_send().unwrap_err().code(), Some(ErrorCode::InvalidState));
    }

    #[tokio::test]
    async fn test_send_beyond_permit_is_invalid_argument() {
        let config = StagehandConfig::default();
        let mut socket = bound_socket();
        let (_incoming, mut outgoing) = socket.stream(None, &config.sockets).unwrap();
        let datagram = OutgoingDatagram {
            data: b"x".to_vec(),
            remote_address: Some("127.0.0.1:9".parse().unwrap()),
        };
        let err = outgoing.send(&[datagram]).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidArgument));
    }

    #[tokio::test]
    async fn test_loopback_round_trip_preserves_order_and_source() {
        let config = StagehandConfig::default();
        let mut receiver = bound_socket();
        let mut sender = bound_socket();
        let target = receiver.local_address().unwrap();
        let source = sender.local_address().unwrap();

        let (incoming, _) = receiver.stream(None, &config.sockets).unwrap();
        let (_, mut outgoing) = sender.stream(Some(target), &config.sockets).unwrap();

        assert!(outgoing.check_send().unwrap() >= 2);
        let batch = [b"first".to_vec(), b"second".to_vec()].map(|data| OutgoingDatagram {
            data,
            remote_address: None,
        });
        assert_eq!(outgoing.send(&batch).unwrap(), 2);

        let mut received = Vec::new();
        for _ in 0..100 {
            received.extend(incoming.receive(10).unwrap());
            if received.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].data, b"first");
        assert_eq!(received[1].data, b"second");
        assert!(received.iter().all(|d| d.remote_address == source));
    }

    #[tokio::test]
    async fn test_connected_stream_rejects_other_destination() {
        let config = StagehandConfig::default();
        let mut socket = bound_socket();
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let (_, mut outgoing) = socket.stream(Some(peer), &config.sockets).unwrap();
        outgoing.check_send().unwrap();
        let stray = OutgoingDatagram {
            data: b"x".to_vec(),
            remote_address: Some("127.0.0.1:10".parse().unwrap()),
        };
        assert_eq!(
            outgoing.send(&[stray]).unwrap_err().code(),
            Some(ErrorCode::InvalidArgument)
        );
    }

    #[tokio::test]
    async fn test_close_releases_socket_held_by_streams() {
        let config = StagehandConfig::default();
        let mut socket = bound_socket();
        let addr = socket.local_address().unwrap();
        let (incoming, mut outgoing) = socket.stream(None, &config.sockets).unwrap();
        outgoing.check_send().unwrap();

        socket.close();
        // The receiver task lets go of its reference once it sees the cancellation
        for _ in 0..100 {
            if outgoing.socket.upgrade().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(outgoing.socket.upgrade().is_none());
        // The port is free again while both stream ends are still alive
        std::net::UdpSocket::bind(addr).unwrap();

        let datagram = OutgoingDatagram {
            data: b"late".to_vec(),
            remote_address: Some("127.0.0.1:9".parse().unwrap()),
        };
        assert_eq!(
            outgoing.send(&[datagram]).unwrap_err().code(),
            Some(ErrorCode::InvalidState)
        );
        assert_eq!(incoming.receive(1).unwrap_err().code(), Some(ErrorCode::InvalidState));
    }
}
