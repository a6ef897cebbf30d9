//! # Values
//!
//! Argument and result payloads carried across the bridge. Each operation expects one
//! shape; handlers pull it out with the `as_*` accessors and report a malformed payload
//! when the shape does not match.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

use crate::host::network::{IpAddressFamily, ShutdownType, SocketOption};
use crate::host::streams::StreamSpec;
use crate::host::udp::{IncomingDatagram, OutgoingDatagram};
use crate::table::Handle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type", content = "value")]
pub enum Value {
    Unit,
    Bool(bool),
    U64(u64),
    String(String),
    Bytes(Vec<u8>),
    Handle(Handle),
    Handles(Vec<Handle>),
    /// Indices into a pollable list
    Indices(Vec<u32>),
    Address(SocketAddr),
    OptionalAddress(Option<SocketAddr>),
    OptionalIp(Option<IpAddr>),
    Family(IpAddressFamily),
    Shutdown(ShutdownType),
    SocketOption(SocketOption),
    Tuple(Vec<Value>),
    StreamSpec(StreamSpec),
    IncomingDatagrams(Vec<IncomingDatagram>),
    OutgoingDatagrams(Vec<OutgoingDatagram>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::U64(_) => "u64",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Handle(_) => "handle",
            Value::Handles(_) => "handles",
            Value::Indices(_) => "indices",
            Value::Address(_) => "address",
            Value::OptionalAddress(_) => "optional-address",
            Value::OptionalIp(_) => "optional-ip",
            Value::Family(_) => "family",
            Value::Shutdown(_) => "shutdown",
            Value::SocketOption(_) => "socket-option",
            Value::Tuple(_) => "tuple",
            Value::StreamSpec(_) => "stream-spec",
            Value::IncomingDatagrams(_) => "incoming-datagrams",
            Value::OutgoingDatagrams(_) => "outgoing-datagrams",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Value::Bytes(b) => Some(b.clone()),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<Handle> {
        match self {
            Value::Handle(h) => Some(*h),
            _ => None,
        }
    }

    pub fn as_handles(&self) -> Option<Vec<Handle>> {
        match self {
            Value::Handles(h) => Some(h.clone()),
            _ => None,
        }
    }

    pub fn as_indices(&self) -> Option<Vec<u32>> {
        match self {
            Value::Indices(i) => Some(i.clone()),
            _ => None,
        }
    }

    pub fn as_address(&self) -> Option<SocketAddr> {
        match self {
            Value::Address(addr) => Some(*addr),
            _ => None,
        }
    }

    /// Accepts `Unit` as "no address" as well as an explicit optional.
    pub fn as_optional_address(&self) -> Option<Option<SocketAddr>> {
        match self {
            Value::OptionalAddress(addr) => Some(*addr),
            Value::Address(addr) => Some(Some(*addr)),
            Value::Unit => Some(None),
            _ => None,
        }
    }

    pub fn as_optional_ip(&self) -> Option<Option<IpAddr>> {
        match self {
            Value::OptionalIp(ip) => Some(*ip),
            _ => None,
        }
    }

    pub fn as_family(&self) -> Option<IpAddressFamily> {
        match self {
            Value::Family(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_shutdown(&self) -> Option<ShutdownType> {
        match self {
            Value::Shutdown(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_socket_option(&self) -> Option<SocketOption> {
        match self {
            Value::SocketOption(o) => Some(*o),
            _ => None,
        }
    }

    pub fn as_stream_spec(&self) -> Option<StreamSpec> {
        match self {
            Value::StreamSpec(spec) => Some(spec.clone()),
            _ => None,
        }
    }

    pub fn as_incoming_datagrams(&self) -> Option<Vec<IncomingDatagram>> {
        match self {
            Value::IncomingDatagrams(d) => Some(d.clone()),
            _ => None,
        }
    }

    pub fn as_outgoing_datagrams(&self) -> Option<Vec<OutgoingDatagram>> {
        match self {
            Value::OutgoingDatagrams(d) => Some(d.clone()),
            _ => None,
        }
    }

    /// `Tuple[Handle, U64]`, the splice argument.
    pub fn as_handle_and_u64(&self) -> Option<(Handle, u64)> {
        match self {
            Value::Tuple(items) => match items.as_slice() {
                [Value::Handle(h), Value::U64(n)] => Some((*h, *n)),
                _ => None,
            },
            _ => None,
        }
    }

    /// `Tuple[SocketOption, Bool | U64]`. Flags also accept 0/1 and numbers accept
    /// booleans; range checks belong to the socket.
    pub fn as_option_setting(&self) -> Option<(SocketOption, OptionValue)> {
        let Value::Tuple(items) = self else {
            return None;
        };
        let [Value::SocketOption(option), value] = items.as_slice() else {
            return None;
        };
        let value = match (option.is_flag(), value) {
            (true, Value::Bool(b)) => OptionValue::Flag(*b),
            (true, Value::U64(n)) => OptionValue::Flag(*n != 0),
            (false, Value::U64(n)) => OptionValue::Number(*n),
            (false, Value::Bool(b)) => OptionValue::Number(u64::from(*b)),
            _ => return None,
        };
        Some((*option, value))
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Unit
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::U64(n)
    }
}

impl From<Handle> for Value {
    fn from(h: Handle) -> Self {
        Value::Handle(h)
    }
}

impl From<SocketAddr> for Value {
    fn from(addr: SocketAddr) -> Self {
        Value::Address(addr)
    }
}

/// A socket option value, read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionValue {
    Flag(bool),
    Number(u64),
}

impl OptionValue {
    pub fn into_value(self) -> Value {
        match self {
            OptionValue::Flag(b) => Value::Bool(b),
            OptionValue::Number(n) => Value::U64(n),
        }
    }
}
