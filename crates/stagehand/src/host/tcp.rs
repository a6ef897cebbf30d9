//! # TCP Sockets
//!
//! Two-phase state machine over a native socket:
//!
//! ```text
//! Init --start-bind--> Bind --finish-bind--> Bound --start-connect--> Connect --finish-connect--> Connection
//!                                            Bound --start-listen--> Listen --finish-listen--> Listener
//! ```
//!
//! `start-*` only validates and records intent. `finish-*` performs the native operation;
//! if it fails the socket moves to `Error`, which like `Closed` is terminal. Connecting or
//! listening from `Init` binds implicitly.
//!
//! A listener runs a background acceptor that queues connections up to the backlog.
//! `accept` pops one and builds a connected socket carrying a snapshot of the listener's
//! options at that moment.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use socket2::{Protocol, SockRef, Type};
use std::collections::VecDeque;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::network::{
    self, apply_hop_limit, apply_keep_alive, IpAddressFamily, KeepAlive, ShutdownType,
    SocketOption, SocketOptions,
};
use super::poll::Pollable;
use super::shared::{Readiness, Shared};
use super::streams::{InputSource, InputStream, OutputSink, OutputStream};
use crate::bridge::Call;
use crate::config::StreamsConfig;
use crate::errors::{Error, ErrorCode};
use crate::handler::{unsupported, Handler, HandlerResult};
use crate::opcode::{BaseOp, ResourceTag};
use crate::store::IoStore;
use crate::table::Handle;
use crate::value::{OptionValue, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TcpState {
    Init,
    Bind,
    Bound,
    Connect,
    Connection,
    Listen,
    Listener,
    Error,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Bind,
    Connect,
    Listen,
}

/// In-flight two-phase operations. At most one per kind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PendingOps {
    bind: u8,
    connect: u8,
    listen: u8,
}

impl PendingOps {
    fn slot(&mut self, kind: PendingKind) -> &mut u8 {
        match kind {
            PendingKind::Bind => &mut self.bind,
            PendingKind::Connect => &mut self.connect,
            PendingKind::Listen => &mut self.listen,
        }
    }

    pub fn begin(&mut self, kind: PendingKind) -> Result<(), Error> {
        let slot = self.slot(kind);
        if *slot > 0 {
            return Err(Error::detailed(
                ErrorCode::InvalidState,
                format!("{:?} already in progress", kind),
            ));
        }
        *slot += 1;
        Ok(())
    }

    pub fn finish(&mut self, kind: PendingKind) -> Result<(), Error> {
        let slot = self.slot(kind);
        if *slot == 0 {
            return Err(ErrorCode::NotInProgress.into());
        }
        *slot -= 1;
        Ok(())
    }

    pub fn is_pending(&self, kind: PendingKind) -> bool {
        match kind {
            PendingKind::Bind => self.bind > 0,
            PendingKind::Connect => self.connect > 0,
            PendingKind::Listen => self.listen > 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpOptions {
    pub socket: SocketOptions,
    pub keep_alive: KeepAlive,
    pub backlog: u32,
}

impl TcpOptions {
    fn new(backlog: u32) -> Self {
        Self {
            socket: SocketOptions::default(),
            keep_alive: KeepAlive::default(),
            backlog,
        }
    }
}

#[derive(Debug)]
pub struct AcceptQueue {
    ready: VecDeque<io::Result<(TcpStream, SocketAddr)>>,
    limit: usize,
    closed: bool,
}

impl AcceptQueue {
    fn has_room(&mut self) -> Option<()> {
        (self.ready.len() < self.limit).then_some(())
    }

    fn readable(&self) -> bool {
        !self.ready.is_empty() || self.closed
    }
}

#[derive(Debug)]
struct Acceptor {
    /// Duplicate of the listening descriptor for options
    native: socket2::Socket,
    queue: Arc<Shared<AcceptQueue>>,
    cancel: CancellationToken,
}

async fn run_acceptor(listener: TcpListener, queue: Arc<Shared<AcceptQueue>>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = queue.wait_for(AcceptQueue::has_room) => {}
        }
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match &accepted {
            Ok((_, peer)) => debug!("queued connection from {}", peer),
            Err(err) => warn!("accept failed: {}", err),
        }
        queue.update(|q| q.ready.push_back(accepted));
    }
    queue.update(|q| q.closed = true);
}

/// An established connection and the two streams serving it.
#[derive(Debug)]
struct Connection {
    /// Duplicate of the connection's descriptor for options and shutdown
    native: socket2::Socket,
    input: InputStream,
    output: OutputStream,
    cancel: CancellationToken,
}

impl Connection {
    fn spawn(stream: TcpStream, streams: &StreamsConfig) -> Result<Self, Error> {
        let native = SockRef::from(&stream).try_clone().map_err(ErrorCode::from)?;
        let (read, write) = stream.into_split();
        let cancel = CancellationToken::new();
        let input = InputStream::spawn_reader(
            read,
            InputSource::Tcp,
            streams.buffer_capacity,
            streams.read_chunk_size,
            cancel.child_token(),
        );
        let output = OutputStream::spawn_writer(
            write,
            OutputSink::Tcp,
            streams.buffer_capacity,
            cancel.child_token(),
        );
        Ok(Self {
            native,
            input,
            output,
            cancel,
        })
    }

    fn close(&self) {
        self.cancel.cancel();
        self.input.close();
        self.output.close();
    }
}

#[derive(Debug)]
enum Native {
    None,
    Socket(tokio::net::TcpSocket),
    /// The native socket is owned by an in-flight `finish-connect`
    Connecting(CancellationToken),
    Connected(Connection),
    Listening(Acceptor),
}

#[derive(Debug)]
pub struct TcpSocket {
    state: TcpState,
    family: IpAddressFamily,
    /// Address recorded by `start-bind`
    requested: Option<SocketAddr>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    options: TcpOptions,
    pending: PendingOps,
    native: Native,
    error: Option<ErrorCode>,
}

impl TcpSocket {
    pub fn new(family: IpAddressFamily, backlog: u32) -> Result<Self, Error> {
        let socket = network::open_socket(family, Type::STREAM, Protocol::TCP)?;
        let socket = tokio::net::TcpSocket::from_std_stream(std::net::TcpStream::from(socket));
        Ok(Self {
            state: TcpState::Init,
            family,
            requested: None,
            local: None,
            remote: None,
            options: TcpOptions::new(backlog),
            pending: PendingOps::default(),
            native: Native::Socket(socket),
            error: None,
        })
    }

    /// A connected socket produced by `accept`, carrying `options` from its listener.
    fn accepted(
        family: IpAddressFamily,
        options: TcpOptions,
        stream: TcpStream,
        peer: SocketAddr,
        streams: &StreamsConfig,
    ) -> Result<Self, Error> {
        let sock = SockRef::from(&stream);
        network::apply_socket_options(&sock, family, &options.socket);
        apply_keep_alive(&sock, &options.keep_alive);
        let local = stream.local_addr().map_err(ErrorCode::from)?;
        let connection = Connection::spawn(stream, streams)?;
        Ok(Self {
            state: TcpState::Connection,
            family,
            requested: None,
            local: Some(local),
            remote: Some(peer),
            options,
            pending: PendingOps::default(),
            native: Native::Connected(connection),
            error: None,
        })
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn family(&self) -> IpAddressFamily {
        self.family
    }

    pub fn options(&self) -> &TcpOptions {
        &self.options
    }

    /// Cause of the failed `finish-*` that moved this socket to `Error`.
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
        warn!("tcp socket failed: {}", code);
        self.state = TcpState::Error;
        self.error = Some(code);
        self.native = Native::None;
        code.into()
    }

    fn take_socket(&mut self) -> Result<tokio::net::TcpSocket, Error> {
        match std::mem::replace(&mut self.native, Native::None) {
            Native::Socket(socket) => Ok(socket),
            other => {
                self.native = other;
                Err(self.invalid_state("native socket access"))
            }
        }
    }

    fn sock_ref(&self) -> Option<SockRef<'_>> {
        match &self.native {
            Native::Socket(socket) => Some(SockRef::from(socket)),
            Native::Connected(connection) => Some(SockRef::from(&connection.native)),
            Native::Listening(acceptor) => Some(SockRef::from(&acceptor.native)),
            Native::None | Native::Connecting(_) => None,
        }
    }

    pub fn start_bind(&mut self, addr: SocketAddr) -> Result<(), Error> {
        if self.state != TcpState::Init {
            return Err(self.invalid_state("start-bind"));
        }
        network::validate_address(&addr, self.family, self.options.socket.ipv6_only)?;
        self.pending.begin(PendingKind::Bind)?;
        debug!("tcp start-bind {}", addr);
        self.requested = Some(addr);
        self.state = TcpState::Bind;
        Ok(())
    }

    pub fn finish_bind(&mut self) -> Result<(), Error> {
        self.pending.finish(PendingKind::Bind)?;
        let addr = match self.requested.take() {
            Some(addr) => addr,
            None => return Err(ErrorCode::NotInProgress.into()),
        };
        let bound = match &self.native {
            Native::Socket(socket) => bind_native(socket, addr),
            _ => Err(ErrorCode::InvalidState),
        };
        match bound {
            Ok(local) => {
                info!("tcp socket bound to {}", local);
                self.local = Some(local);
                self.state = TcpState::Bound;
                Ok(())
            }
            Err(code) => Err(self.fail(code)),
        }
    }

    pub fn start_connect(&mut self, remote: SocketAddr) -> Result<(), Error> {
        if !matches!(self.state, TcpState::Init | TcpState::Bound) {
            return Err(self.invalid_state("start-connect"));
        }
        network::validate_address(&remote, self.family, self.options.socket.ipv6_only)?;
        network::validate_remote(&remote)?;
        self.pending.begin(PendingKind::Connect)?;
        debug!("tcp start-connect {}", remote);
        self.remote = Some(remote);
        self.state = TcpState::Connect;
        Ok(())
    }

    /// First half of `finish-connect`: claim the pending operation and the native socket.
    /// The returned token is cancelled if the socket is dropped before the connect settles.
    fn begin_finish_connect(
        &mut self,
    ) -> Result<(tokio::net::TcpSocket, SocketAddr, CancellationToken), Error> {
        self.pending.finish(PendingKind::Connect)?;
        let remote = self.remote.ok_or(ErrorCode::NotInProgress)?;
        let socket = self.take_socket()?;
        let cancel = CancellationToken::new();
        self.native = Native::Connecting(cancel.clone());
        Ok((socket, remote, cancel))
    }

    /// Second half of `finish-connect`, once the native connect has settled.
    fn complete_connect(
        &mut self,
        connected: io::Result<TcpStream>,
        streams: &StreamsConfig,
    ) -> Result<(InputStream, OutputStream), Error> {
        let stream = match connected {
            Ok(stream) => stream,
            Err(err) => return Err(self.fail(ErrorCode::from(err))),
        };
        self.local = stream.local_addr().ok();
        let connection = match Connection::spawn(stream, streams) {
            Ok(connection) => connection,
            Err(e) => return Err(self.fail(e.code().unwrap_or(ErrorCode::Unknown))),
        };
        let pair = (connection.input.clone(), connection.output.clone());
        info!(
            "tcp connection {:?} -> {:?} established",
            self.local, self.remote
        );
        self.native = Native::Connected(connection);
        self.state = TcpState::Connection;
        Ok(pair)
    }

    pub fn start_listen(&mut self) -> Result<(), Error> {
        if !matches!(self.state, TcpState::Init | TcpState::Bound) {
            return Err(self.invalid_state("start-listen"));
        }
        self.pending.begin(PendingKind::Listen)?;
        self.state = TcpState::Listen;
        Ok(())
    }

    pub fn finish_listen(&mut self) -> Result<(), Error> {
        self.pending.finish(PendingKind::Listen)?;
        let socket = self.take_socket()?;
        if self.local.is_none() {
            let any = SocketAddr::new(self.family.unspecified(), 0);
            if let Err(code) = bind_native(&socket, any) {
                return Err(self.fail(code));
            }
        }
        let listener = match socket.listen(self.options.backlog) {
            Ok(listener) => listener,
            Err(err) => return Err(self.fail(ErrorCode::from(err))),
        };
        let native = match SockRef::from(&listener).try_clone() {
            Ok(native) => native,
            Err(err) => return Err(self.fail(ErrorCode::from(err))),
        };
        self.local = listener.local_addr().ok();

        let queue = Shared::new(AcceptQueue {
            ready: VecDeque::new(),
            limit: self.options.backlog.max(1) as usize,
            closed: false,
        });
        let cancel = CancellationToken::new();
        tokio::spawn(run_acceptor(listener, Arc::clone(&queue), cancel.clone()));
        info!("tcp socket listening on {:?}", self.local);
        self.native = Native::Listening(Acceptor {
            native,
            queue,
            cancel,
        });
        self.state = TcpState::Listener;
        Ok(())
    }

    /// Pop one queued connection. The listener's state is unchanged.
    fn accept(&mut self, streams: &StreamsConfig) -> Result<(TcpSocket, InputStream, OutputStream), Error> {
        if self.state != TcpState::Listener {
            return Err(self.invalid_state("accept"));
        }
        let Native::Listening(acceptor) = &self.native else {
            return Err(self.invalid_state("accept"));
        };
        let next = acceptor.queue.update(|q| q.ready.pop_front());
        let (stream, peer) = match next {
            None => return Err(ErrorCode::WouldBlock.into()),
            Some(Err(err)) => return Err(ErrorCode::from(err).into()),
            Some(Ok(accepted)) => accepted,
        };
        let mut socket = TcpSocket::accepted(self.family, self.options.clone(), stream, peer, streams)?;
        // Sizes never set explicitly are reported as the listener's effective values
        let (receive, send) = self.effective_buffer_sizes();
        let inherited = &mut socket.options.socket;
        inherited.receive_buffer_size = receive;
        inherited.send_buffer_size = send;
        let (input, output) = match &socket.native {
            Native::Connected(connection) => (connection.input.clone(), connection.output.clone()),
            _ => return Err(ErrorCode::Unknown.into()),
        };
        info!("tcp accepted connection from {}", peer);
        Ok((socket, input, output))
    }

    pub fn shutdown(&mut self, how: ShutdownType) -> Result<(), Error> {
        let Native::Connected(connection) = &self.native else {
            return Err(self.invalid_state("shutdown"));
        };
        if self.state != TcpState::Connection {
            return Err(self.invalid_state("shutdown"));
        }
        debug!("tcp shutdown {:?}", how);
        if matches!(how, ShutdownType::Receive | ShutdownType::Both) {
            if let Err(err) = connection.native.shutdown(Shutdown::Read) {
                debug!("shutdown of receive side failed: {}", err);
            }
            connection.input.close();
        }
        if matches!(how, ShutdownType::Send | ShutdownType::Both) {
            connection.output.close();
        }
        Ok(())
    }

    pub fn local_address(&self) -> Result<SocketAddr, Error> {
        self.local.ok_or_else(|| self.invalid_state("local-address"))
    }

    pub fn remote_address(&self) -> Result<SocketAddr, Error> {
        match (self.state, self.remote) {
            (TcpState::Connection, Some(remote)) => Ok(remote),
            _ => Err(self.invalid_state("remote-address")),
        }
    }

    pub fn is_listening(&self) -> bool {
        self.state == TcpState::Listener
    }

    pub fn subscribe(&self) -> Pollable {
        match &self.native {
            Native::Listening(acceptor) => {
                Pollable::event(Readiness::new(&acceptor.queue, AcceptQueue::readable))
            }
            _ => Pollable::ready(),
        }
    }

    /// `(receive, send)` buffer sizes: the explicit setting, else what the OS reports.
    fn effective_buffer_sizes(&self) -> (Option<u64>, Option<u64>) {
        let sock = self.sock_ref();
        let receive = self.options.socket.receive_buffer_size.or_else(|| {
            sock.as_ref()
                .and_then(|s| s.recv_buffer_size().ok())
                .map(|n| n as u64)
        });
        let send = self.options.socket.send_buffer_size.or_else(|| {
            sock.as_ref()
                .and_then(|s| s.send_buffer_size().ok())
                .map(|n| n as u64)
        });
        (receive, send)
    }

    pub fn get_option(&self, option: SocketOption) -> Result<OptionValue, Error> {
        let options = &self.options;
        let value = match option {
            SocketOption::KeepAliveEnabled => OptionValue::Flag(options.keep_alive.enabled),
            SocketOption::KeepAliveIdleTime => {
                OptionValue::Number(duration_nanos(options.keep_alive.idle_time))
            }
            SocketOption::KeepAliveInterval => {
                OptionValue::Number(duration_nanos(options.keep_alive.interval))
            }
            SocketOption::KeepAliveCount => OptionValue::Number(u64::from(options.keep_alive.count)),
            SocketOption::HopLimit => OptionValue::Number(u64::from(options.socket.hop_limit)),
            SocketOption::ReceiveBufferSize => {
                OptionValue::Number(self.effective_buffer_sizes().0.unwrap_or(0))
            }
            SocketOption::SendBufferSize => {
                OptionValue::Number(self.effective_buffer_sizes().1.unwrap_or(0))
            }
            SocketOption::Ipv6Only => {
                if self.family != IpAddressFamily::Ipv6 {
                    return Err(ErrorCode::NotSupported.into());
                }
                OptionValue::Flag(options.socket.ipv6_only)
            }
            SocketOption::ListenBacklogSize => OptionValue::Number(u64::from(options.backlog)),
        };
        Ok(value)
    }

    pub fn set_option(&mut self, option: SocketOption, value: OptionValue) -> Result<(), Error> {
        if matches!(self.state, TcpState::Error | TcpState::Closed) {
            return Err(self.invalid_state("set-option"));
        }
        match (option, value) {
            (SocketOption::KeepAliveEnabled, OptionValue::Flag(enabled)) => {
                self.options.keep_alive.enabled = enabled;
                self.push_keep_alive();
            }
            (SocketOption::KeepAliveIdleTime, OptionValue::Number(nanos)) => {
                let nanos = network::validate_nonzero(option, nanos)?;
                self.options.keep_alive.idle_time = Duration::from_nanos(nanos);
                self.push_keep_alive();
            }
            (SocketOption::KeepAliveInterval, OptionValue::Number(nanos)) => {
                let nanos = network::validate_nonzero(option, nanos)?;
                self.options.keep_alive.interval = Duration::from_nanos(nanos);
                self.push_keep_alive();
            }
            (SocketOption::KeepAliveCount, OptionValue::Number(count)) => {
                let count = network::validate_nonzero(option, count)?;
                self.options.keep_alive.count = u32::try_from(count).unwrap_or(u32::MAX);
                self.push_keep_alive();
            }
            (SocketOption::HopLimit, OptionValue::Number(hops)) => {
                let hops = network::validate_hop_limit(hops)?;
                self.options.socket.hop_limit = hops;
                if let Some(sock) = self.sock_ref() {
                    apply_hop_limit(&sock, self.family, hops);
                }
            }
            (SocketOption::ReceiveBufferSize, OptionValue::Number(size)) => {
                let size = network::validate_nonzero(option, size)?;
                self.options.socket.receive_buffer_size = Some(size);
                self.push_socket_options();
            }
            (SocketOption::SendBufferSize, OptionValue::Number(size)) => {
                let size = network::validate_nonzero(option, size)?;
                self.options.socket.send_buffer_size = Some(size);
                self.push_socket_options();
            }
            (SocketOption::Ipv6Only, OptionValue::Flag(only)) => {
                if self.family != IpAddressFamily::Ipv6 {
                    return Err(ErrorCode::NotSupported.into());
                }
                if self.state != TcpState::Init {
                    return Err(self.invalid_state("setting ipv6-only"));
                }
                if let Some(sock) = self.sock_ref() {
                    network::apply_ipv6_only(&sock, only)?;
                }
                self.options.socket.ipv6_only = only;
            }
            (SocketOption::ListenBacklogSize, OptionValue::Number(size)) => {
                let size = network::validate_nonzero(option, size)?;
                if !matches!(self.state, TcpState::Init | TcpState::Bound) {
                    return Err(self.invalid_state("setting listen-backlog-size"));
                }
                self.options.backlog = u32::try_from(size).unwrap_or(u32::MAX);
            }
            (option, _) => {
                return Err(Error::detailed(
                    ErrorCode::InvalidArgument,
                    format!("wrong value type for {}", option.name()),
                ))
            }
        }
        Ok(())
    }

    fn push_keep_alive(&self) {
        if let Some(sock) = self.sock_ref() {
            apply_keep_alive(&sock, &self.options.keep_alive);
        }
    }

    fn push_socket_options(&self) {
        if let Some(sock) = self.sock_ref() {
            network::apply_socket_options(&sock, self.family, &self.options.socket);
        }
    }

    /// Release the native socket and wake anything waiting on its streams or queue.
    pub fn close(&mut self) {
        match std::mem::replace(&mut self.native, Native::None) {
            Native::Connected(connection) => connection.close(),
            Native::Listening(acceptor) => {
                acceptor.cancel.cancel();
                acceptor.queue.update(|q| {
                    q.ready.clear();
                    q.closed = true;
                });
            }
            Native::Connecting(cancel) => cancel.cancel(),
            Native::Socket(_) | Native::None => {}
        }
        if self.state != TcpState::Closed {
            debug!("tcp socket closed in {:?} state", self.state);
        }
        self.state = TcpState::Closed;
    }
}

fn bind_native(socket: &tokio::net::TcpSocket, addr: SocketAddr) -> Result<SocketAddr, ErrorCode> {
    // Lets a restarted listener reclaim a port still in TIME_WAIT
    if addr.port() > 0 {
        socket.set_reuseaddr(true).map_err(ErrorCode::from)?;
    }
    socket.bind(addr).map_err(ErrorCode::from)?;
    socket.local_addr().map_err(ErrorCode::from)
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

async fn finish_connect(store: &IoStore, handle: Handle) -> Result<Value, Error> {
    let (socket, remote, cancel) = store
        .table()
        .get_mut::<TcpSocket>(handle)?
        .begin_finish_connect()?;
    debug!("tcp finish-connect to {}", remote);
    let connected = tokio::select! {
        _ = cancel.cancelled() => {
            debug!("tcp connect to {} abandoned, socket dropped", remote);
            return Err(Error::detailed(
                ErrorCode::InvalidState,
                "socket dropped during finish-connect",
            ));
        }
        connected = socket.connect(remote) => connected,
    };

    let mut table = store.table();
    let (input, output) =
        table
            .get_mut::<TcpSocket>(handle)?
            .complete_connect(connected, &store.config().streams)?;
    let input = table.push(input)?;
    let output = table.push(output)?;
    Ok(Value::Handles(vec![input, output]))
}

fn accept(store: &IoStore, handle: Handle) -> Result<Value, Error> {
    let mut table = store.table();
    let (socket, input, output) = table
        .get_mut::<TcpSocket>(handle)?
        .accept(&store.config().streams)?;
    let socket = table.push(socket)?;
    let input = table.push(input)?;
    let output = table.push(output)?;
    Ok(Value::Handles(vec![socket, input, output]))
}

pub struct TcpHandler;

impl TcpHandler {
    async fn dispatch(store: Arc<IoStore>, op: BaseOp, tag: ResourceTag, call: Call) -> HandlerResult {
        if tag != ResourceTag::TcpSocket {
            return Err(unsupported(op, tag));
        }
        if op == BaseOp::Create {
            let family = call.arg(Value::as_family, "address family")?;
            let backlog = store.config().sockets.default_backlog;
            return Ok(TcpSocket::new(family, backlog)
                .and_then(|socket| store.table().push(socket))
                .map(Value::Handle));
        }

        let handle = call.handle()?;
        match op {
            BaseOp::Drop => Ok(store.table().delete::<TcpSocket>(handle).map(|_| Value::Unit)),
            BaseOp::FinishConnect => Ok(finish_connect(&store, handle).await),
            BaseOp::Accept => Ok(accept(&store, handle)),
            BaseOp::Subscribe => {
                let mut table = store.table();
                let pollable = match table.get::<TcpSocket>(handle) {
                    Ok(socket) => socket.subscribe(),
                    Err(e) => return Ok(Err(e)),
                };
                Ok(table.push(pollable).map(Value::Handle))
            }
            BaseOp::StartBind => {
                let addr = call.arg(Value::as_address, "socket address")?;
                Ok(with_socket(&store, handle, |s| s.start_bind(addr).map(|_| Value::Unit)))
            }
            BaseOp::FinishBind => Ok(with_socket(&store, handle, |s| s.finish_bind().map(|_| Value::Unit))),
            BaseOp::StartConnect => {
                let addr = call.arg(Value::as_address, "socket address")?;
                Ok(with_socket(&store, handle, |s| s.start_connect(addr).map(|_| Value::Unit)))
            }
            BaseOp::StartListen => Ok(with_socket(&store, handle, |s| s.start_listen().map(|_| Value::Unit))),
            BaseOp::FinishListen => {
                Ok(with_socket(&store, handle, |s| s.finish_listen().map(|_| Value::Unit)))
            }
            BaseOp::Shutdown => {
                let how = call.arg(Value::as_shutdown, "shutdown type")?;
                Ok(with_socket(&store, handle, |s| s.shutdown(how).map(|_| Value::Unit)))
            }
            BaseOp::LocalAddress => Ok(with_socket(&store, handle, |s| s.local_address().map(Value::Address))),
            BaseOp::RemoteAddress => {
                Ok(with_socket(&store, handle, |s| s.remote_address().map(Value::Address)))
            }
            BaseOp::IsListening => Ok(with_socket(&store, handle, |s| Ok(Value::Bool(s.is_listening())))),
            BaseOp::AddressFamily => Ok(with_socket(&store, handle, |s| Ok(Value::Family(s.family())))),
            BaseOp::GetOption => {
                let option = call.arg(Value::as_socket_option, "socket option")?;
                Ok(with_socket(&store, handle, |s| s.get_option(option).map(OptionValue::into_value)))
            }
            BaseOp::SetOption => {
                let (option, value) = call.arg(Value::as_option_setting, "socket option and value")?;
                Ok(with_socket(&store, handle, |s| s.set_option(option, value).map(|_| Value::Unit)))
            }
            _ => Err(unsupported(op, tag)),
        }
    }
}

fn with_socket(
    store: &IoStore,
    handle: Handle,
    f: impl FnOnce(&mut TcpSocket) -> Result<Value, Error>,
) -> Result<Value, Error> {
    let mut table = store.table();
    f(table.get_mut::<TcpSocket>(handle)?)
}

impl Handler for TcpHandler {
    fn name(&self) -> &str {
        "tcp"
    }

    fn tags(&self) -> &'static [ResourceTag] {
        &[ResourceTag::TcpSocket]
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

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_pending_ops_track_one_per_kind() {
        let mut pending = PendingOps::default();
        assert_eq!(
            pending.finish(PendingKind::Bind).unwrap_err().code(),
            Some(ErrorCode::NotInProgress)
        );
        pending.begin(PendingKind::Bind).unwrap();
        assert!(pending.is_pending(PendingKind::Bind));
        assert_eq!(
            pending.begin(PendingKind::Bind).unwrap_err().code(),
            Some(ErrorCode::InvalidState)
        );
        pending.begin(PendingKind::Listen).unwrap();
        pending.finish(PendingKind::Bind).unwrap();
        assert!(!pending.is_pending(PendingKind::Bind));
    }

    #[tokio::test]
    async fn test_bind_transitions() {
        let mut socket = TcpSocket::new(IpAddressFamily::Ipv4, 16).unwrap();
        assert_eq!(
            socket.finish_bind().unwrap_err().code(),
            Some(ErrorCode::NotInProgress)
        );

        socket.start_bind(loopback()).unwrap();
        assert_eq!(socket.state(), TcpState::Bind);
        assert_eq!(
            socket.start_bind(loopback()).unwrap_err().code(),
            Some(ErrorCode::InvalidState)
        );

        socket.finish_bind().unwrap();
        assert_eq!(socket.state(), TcpState::Bound);
        assert_ne!(socket.local_address().unwrap().port(), 0);
        assert_eq!(
            socket.start_bind(loopback()).unwrap_err().code(),
            Some(ErrorCode::InvalidState)
        );
    }

    #[tokio::test]
    async fn test_start_bind_rejects_wrong_family() {
        let mut socket = TcpSocket::new(IpAddressFamily::Ipv4, 16).unwrap();
        let err = socket.start_bind("[::1]:0".parse().unwrap()).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidArgument));
        assert_eq!(socket.state(), TcpState::Init);
    }

    #[tokio::test]
    async fn test_failed_bind_is_terminal() {
        let mut first = TcpSocket::new(IpAddressFamily::Ipv4, 16).unwrap();
        first.start_bind(loopback()).unwrap();
        first.finish_bind().unwrap();
        first.start_listen().unwrap();
        first.finish_listen().unwrap();
        let taken = first.local_address().unwrap();

        let mut second = TcpSocket::new(IpAddressFamily::Ipv4, 16).unwrap();
        second.start_bind(taken).unwrap();
        let err = second.finish_bind().unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::AddressInUse));
        assert_eq!(second.state(), TcpState::Error);
        assert_eq!(second.error(), Some(ErrorCode::AddressInUse));
        assert_eq!(
            second.start_listen().unwrap_err().code(),
            Some(ErrorCode::InvalidState)
        );
    }

    #[tokio::test]
    async fn test_option_validation() {
        let mut socket = TcpSocket::new(IpAddressFamily::Ipv4, 16).unwrap();
        let zero = socket
            .set_option(SocketOption::ReceiveBufferSize, OptionValue::Number(0))
            .unwrap_err();
        assert_eq!(zero.code(), Some(ErrorCode::InvalidArgument));
        let hops = socket
            .set_option(SocketOption::HopLimit, OptionValue::Number(0))
            .unwrap_err();
        assert_eq!(hops.code(), Some(ErrorCode::InvalidArgument));
        let v6 = socket
            .set_option(SocketOption::Ipv6Only, OptionValue::Flag(true))
            .unwrap_err();
        assert_eq!(v6.code(), Some(ErrorCode::NotSupported));

        socket
            .set_option(SocketOption::HopLimit, OptionValue::Number(12))
            .unwrap();
        assert_eq!(
            socket.get_option(SocketOption::HopLimit).unwrap(),
            OptionValue::Number(12)
        );
    }

    #[tokio::test]
    async fn test_backlog_is_bind_time_only() {
        let mut socket = TcpSocket::new(IpAddressFamily::Ipv4, 16).unwrap();
        socket
            .set_option(SocketOption::ListenBacklogSize, OptionValue::Number(4))
            .unwrap();
        socket.start_listen().unwrap();
        socket.finish_listen().unwrap();
        assert!(socket.is_listening());
        let err = socket
            .set_option(SocketOption::ListenBacklogSize, OptionValue::Number(8))
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidState));
    }

    #[tokio::test]
    async fn test_accept_without_pending_connection_would_block() {
        let config = StagehandConfig::default();
        let mut listener = TcpSocket::new(IpAddressFamily::Ipv4, 16).unwrap();
        listener.start_bind(loopback()).unwrap();
        listener.finish_bind().unwrap();
        assert_eq!(
            listener.accept(&config.streams).unwrap_err().code(),
            Some(ErrorCode::InvalidState)
        );
        listener.start_listen().unwrap();
        listener.finish_listen().unwrap();
        assert_eq!(
            listener.accept(&config.streams).unwrap_err().code(),
            Some(ErrorCode::WouldBlock)
        );
    }

    #[tokio::test]
    async fn test_accept_with_default_buffer_sizes_matches_listener() {
        let config = StagehandConfig::default();
        let mut listener = TcpSocket::new(IpAddressFamily::Ipv4, 16).unwrap();
        listener.start_bind(loopback()).unwrap();
        listener.finish_bind().unwrap();
        listener.start_listen().unwrap();
        listener.finish_listen().unwrap();
        let addr = listener.local_address().unwrap();

        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), listener.subscribe().block())
            .await
            .expect("connection never queued");
        let (accepted, _input, _output) = listener.accept(&config.streams).unwrap();

        for option in [SocketOption::ReceiveBufferSize, SocketOption::SendBufferSize] {
            let value = listener.get_option(option).unwrap();
            assert_ne!(value, OptionValue::Number(0), "{} reads as zero", option.name());
            assert_eq!(accepted.get_option(option).unwrap(), value);
        }
    }

    #[tokio::test]
    async fn test_close_cancels_pending_connect() {
        let mut socket = TcpSocket::new(IpAddressFamily::Ipv4, 16).unwrap();
        socket.start_connect("127.0.0.1:9".parse().unwrap()).unwrap();
        let (_native, _remote, cancel) = socket.begin_finish_connect().unwrap();
        assert!(!cancel.is_cancelled());

        socket.close();
        assert!(cancel.is_cancelled());
        assert_eq!(socket.state(), TcpState::Closed);
    }

    #[tokio::test]
    async fn test_shutdown_requires_connection() {
        let mut socket = TcpSocket::new(IpAddressFamily::Ipv4, 16).unwrap();
        assert_eq!(
            socket.shutdown(ShutdownType::Both).unwrap_err().code(),
            Some(ErrorCode::InvalidState)
        );
    }
}
