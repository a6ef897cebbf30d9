//! Address families, address validation and socket options shared by TCP and UDP.

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tracing::debug;

use crate::errors::{Error, ErrorCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IpAddressFamily {
    Ipv4,
    Ipv6,
}

impl IpAddressFamily {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => IpAddressFamily::Ipv4,
            SocketAddr::V6(_) => IpAddressFamily::Ipv6,
        }
    }

    pub fn unspecified(self) -> IpAddr {
        match self {
            IpAddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    fn domain(self) -> Domain {
        match self {
            IpAddressFamily::Ipv4 => Domain::IPV4,
            IpAddressFamily::Ipv6 => Domain::IPV6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShutdownType {
    Receive,
    Send,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SocketOption {
    KeepAliveEnabled,
    KeepAliveIdleTime,
    KeepAliveInterval,
    KeepAliveCount,
    HopLimit,
    ReceiveBufferSize,
    SendBufferSize,
    Ipv6Only,
    ListenBacklogSize,
}

impl SocketOption {
    pub fn name(self) -> &'static str {
        match self {
            SocketOption::KeepAliveEnabled => "keep-alive-enabled",
            SocketOption::KeepAliveIdleTime => "keep-alive-idle-time",
            SocketOption::KeepAliveInterval => "keep-alive-interval",
            SocketOption::KeepAliveCount => "keep-alive-count",
            SocketOption::HopLimit => "hop-limit",
            SocketOption::ReceiveBufferSize => "receive-buffer-size",
            SocketOption::SendBufferSize => "send-buffer-size",
            SocketOption::Ipv6Only => "ipv6-only",
            SocketOption::ListenBacklogSize => "listen-backlog-size",
        }
    }

    pub fn is_flag(self) -> bool {
        matches!(self, SocketOption::KeepAliveEnabled | SocketOption::Ipv6Only)
    }
}

/// Options shared by both socket kinds. Values are what the caller last set; they are
/// pushed to the native socket when it exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketOptions {
    pub hop_limit: u8,
    pub receive_buffer_size: Option<u64>,
    pub send_buffer_size: Option<u64>,
    pub ipv6_only: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            hop_limit: 64,
            receive_buffer_size: None,
            send_buffer_size: None,
            ipv6_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAlive {
    pub enabled: bool,
    pub idle_time: Duration,
    pub interval: Duration,
    pub count: u32,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            enabled: false,
            idle_time: Duration::from_secs(7200),
            interval: Duration::from_secs(75),
            count: 9,
        }
    }
}

/// Family of `addr` must match the socket's. An IPv6 socket accepts IPv4-mapped
/// addresses only while dual-stack.
pub fn validate_family(
    addr: &SocketAddr,
    family: IpAddressFamily,
    ipv6_only: bool,
) -> Result<(), Error> {
    match (family, addr) {
        (IpAddressFamily::Ipv4, SocketAddr::V4(_)) => Ok(()),
        (IpAddressFamily::Ipv6, SocketAddr::V6(v6)) => {
            if ipv6_only && v6.ip().to_ipv4_mapped().is_some() {
                Err(Error::detailed(
                    ErrorCode::InvalidArgument,
                    "IPv4-mapped address on an IPv6-only socket",
                ))
            } else {
                Ok(())
            }
        }
        _ => Err(Error::detailed(
            ErrorCode::InvalidArgument,
            format!("{} does not match the {:?} socket family", addr, family),
        )),
    }
}

pub fn validate_unicast(addr: &SocketAddr) -> Result<(), Error> {
    let unicast = match addr.ip() {
        IpAddr::V4(ip) => !ip.is_multicast() && !ip.is_broadcast(),
        IpAddr::V6(ip) => !ip.is_multicast(),
    };
    if unicast {
        Ok(())
    } else {
        Err(Error::detailed(
            ErrorCode::InvalidArgument,
            format!("{} is not a unicast address", addr.ip()),
        ))
    }
}

/// A remote peer needs a concrete address and port.
pub fn validate_remote(addr: &SocketAddr) -> Result<(), Error> {
    validate_unicast(addr)?;
    if addr.ip().to_canonical().is_unspecified() || addr.port() == 0 {
        return Err(Error::detailed(
            ErrorCode::InvalidArgument,
            format!("{} is not a connectable address", addr),
        ));
    }
    Ok(())
}

/// The full check for a local or remote address supplied to a socket.
pub fn validate_address(
    addr: &SocketAddr,
    family: IpAddressFamily,
    ipv6_only: bool,
) -> Result<(), Error> {
    validate_family(addr, family, ipv6_only)?;
    validate_unicast(addr)
}

pub fn validate_hop_limit(value: u64) -> Result<u8, Error> {
    match u8::try_from(value) {
        Ok(hops) if hops >= 1 => Ok(hops),
        _ => Err(Error::detailed(
            ErrorCode::InvalidArgument,
            format!("hop limit {} is outside 1..=255", value),
        )),
    }
}

pub fn validate_nonzero(option: SocketOption, value: u64) -> Result<u64, Error> {
    if value == 0 {
        Err(Error::detailed(
            ErrorCode::InvalidArgument,
            format!("{} must be greater than zero", option.name()),
        ))
    } else {
        Ok(value)
    }
}

/// Open a non-blocking native socket of `family`.
pub fn open_socket(family: IpAddressFamily, ty: Type, protocol: Protocol) -> Result<Socket, Error> {
    let socket = Socket::new(family.domain(), ty, Some(protocol)).map_err(ErrorCode::from)?;
    socket.set_nonblocking(true).map_err(ErrorCode::from)?;
    debug!("opened {:?} {:?} socket", family, ty);
    Ok(socket)
}

/// Push the caller-set options to a native socket. Best-effort; failures are logged.
/// `ipv6_only` is not included: the OS only accepts it before bind.
pub fn apply_socket_options(socket: &SockRef<'_>, family: IpAddressFamily, options: &SocketOptions) {
    apply_hop_limit(socket, family, options.hop_limit);
    if let Some(size) = options.receive_buffer_size {
        if let Err(err) = socket.set_recv_buffer_size(clamp_buffer(size)) {
            debug!("receive buffer size not applied: {}", err);
        }
    }
    if let Some(size) = options.send_buffer_size {
        if let Err(err) = socket.set_send_buffer_size(clamp_buffer(size)) {
            debug!("send buffer size not applied: {}", err);
        }
    }
}

pub fn apply_ipv6_only(socket: &SockRef<'_>, only: bool) -> Result<(), Error> {
    socket.set_only_v6(only).map_err(ErrorCode::from)?;
    Ok(())
}

pub fn apply_hop_limit(socket: &SockRef<'_>, family: IpAddressFamily, hops: u8) {
    let applied = match family {
        IpAddressFamily::Ipv4 => socket.set_ttl(u32::from(hops)),
        IpAddressFamily::Ipv6 => socket.set_unicast_hops_v6(u32::from(hops)),
    };
    if let Err(err) = applied {
        debug!("hop limit not applied: {}", err);
    }
}

pub fn apply_keep_alive(socket: &SockRef<'_>, keep_alive: &KeepAlive) {
    if let Err(err) = socket.set_keepalive(keep_alive.enabled) {
        debug!("keep-alive not applied: {}", err);
        return;
    }
    if !keep_alive.enabled {
        return;
    }
    let params = TcpKeepalive::new()
        .with_time(keep_alive.idle_time)
        .with_interval(keep_alive.interval);
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
    let params = params.with_retries(keep_alive.count);
    if let Err(err) = socket.set_tcp_keepalive(&params) {
        debug!("keep-alive parameters not applied: {}", err);
    }
}

fn clamp_buffer(size: u64) -> usize {
    usize::try_from(size).unwrap_or(usize::MAX).min(i32::MAX as usize)
}
