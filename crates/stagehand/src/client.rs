//! # Typed Calls
//!
//! Convenience wrappers over [`Bridge::call`], one per operation. Each builds the opcode
//! and payload and unpacks the result into a Rust type. A result of the wrong shape is a
//! protocol error and poisons the bridge like any other.

use std::net::{IpAddr, SocketAddr};

use crate::bridge::Bridge;
use crate::errors::{Error, ProtocolError};
use crate::host::network::{IpAddressFamily, ShutdownType, SocketOption};
use crate::host::streams::StreamSpec;
use crate::host::udp::{IncomingDatagram, OutgoingDatagram};
use crate::opcode::{BaseOp, Opcode, ResourceTag};
use crate::table::Handle;
use crate::value::{OptionValue, Value};

/// Outer `Err` is fatal, inner `Err` is the operation's semantic error.
pub type CallResult<T> = anyhow::Result<Result<T, Error>>;

fn unit(value: &Value) -> Option<()> {
    matches!(value, Value::Unit).then_some(())
}

fn pair(value: &Value) -> Option<(Handle, Handle)> {
    match value {
        Value::Handles(handles) => match handles.as_slice() {
            [a, b] => Some((*a, *b)),
            _ => None,
        },
        _ => None,
    }
}

fn triple(value: &Value) -> Option<(Handle, Handle, Handle)> {
    match value {
        Value::Handles(handles) => match handles.as_slice() {
            [a, b, c] => Some((*a, *b, *c)),
            _ => None,
        },
        _ => None,
    }
}

fn option_value(value: &Value) -> Option<OptionValue> {
    match value {
        Value::Bool(b) => Some(OptionValue::Flag(*b)),
        Value::U64(n) => Some(OptionValue::Number(*n)),
        _ => None,
    }
}

impl Bridge {
    fn invoke<T>(
        &self,
        op: BaseOp,
        tag: ResourceTag,
        handle: Option<Handle>,
        payload: Value,
        extract: impl FnOnce(&Value) -> Option<T>,
        expected: &str,
    ) -> CallResult<T> {
        let opcode = Opcode::new(op, tag);
        match self.call(opcode, handle, payload)? {
            Ok(value) => match extract(&value) {
                Some(result) => Ok(Ok(result)),
                None => Err(self.poison(ProtocolError::MalformedPayload {
                    opcode: opcode.to_string(),
                    reason: format!("expected {} result, got {}", expected, value.type_name()),
                })),
            },
            Err(err) => Ok(Err(err)),
        }
    }

    // Streams

    pub fn create_input_stream(&self, spec: StreamSpec) -> CallResult<Handle> {
        self.invoke(
            BaseOp::Create,
            ResourceTag::InputStream,
            None,
            Value::StreamSpec(spec),
            Value::as_handle,
            "handle",
        )
    }

    pub fn create_output_stream(&self, spec: StreamSpec) -> CallResult<Handle> {
        self.invoke(
            BaseOp::Create,
            ResourceTag::OutputStream,
            None,
            Value::StreamSpec(spec),
            Value::as_handle,
            "handle",
        )
    }

    /// Connected `(output, input)` pair.
    pub fn create_pipe(&self, capacity: Option<u64>) -> CallResult<(Handle, Handle)> {
        self.invoke(
            BaseOp::Create,
            ResourceTag::OutputStream,
            None,
            Value::StreamSpec(StreamSpec::Pipe { capacity }),
            pair,
            "handle pair",
        )
    }

    pub fn read(&self, stream: Handle, len: u64) -> CallResult<Vec<u8>> {
        self.invoke(BaseOp::Read, ResourceTag::InputStream, Some(stream), Value::U64(len), Value::as_bytes, "bytes")
    }

    pub fn blocking_read(&self, stream: Handle, len: u64) -> CallResult<Vec<u8>> {
        self.invoke(
            BaseOp::BlockingRead,
            ResourceTag::InputStream,
            Some(stream),
            Value::U64(len),
            Value::as_bytes,
            "bytes",
        )
    }

    pub fn skip(&self, stream: Handle, len: u64) -> CallResult<u64> {
        self.invoke(BaseOp::Skip, ResourceTag::InputStream, Some(stream), Value::U64(len), Value::as_u64, "u64")
    }

    pub fn blocking_skip(&self, stream: Handle, len: u64) -> CallResult<u64> {
        self.invoke(
            BaseOp::BlockingSkip,
            ResourceTag::InputStream,
            Some(stream),
            Value::U64(len),
            Value::as_u64,
            "u64",
        )
    }

    pub fn input_stream_subscribe(&self, stream: Handle) -> CallResult<Handle> {
        self.invoke(BaseOp::Subscribe, ResourceTag::InputStream, Some(stream), Value::Unit, Value::as_handle, "handle")
    }

    pub fn drop_input_stream(&self, stream: Handle) -> CallResult<()> {
        self.invoke(BaseOp::Drop, ResourceTag::InputStream, Some(stream), Value::Unit, unit, "unit")
    }

    pub fn check_write(&self, stream: Handle) -> CallResult<u64> {
        self.invoke(BaseOp::CheckWrite, ResourceTag::OutputStream, Some(stream), Value::Unit, Value::as_u64, "u64")
    }

    pub fn write(&self, stream: Handle, bytes: &[u8]) -> CallResult<()> {
        self.invoke(
            BaseOp::Write,
            ResourceTag::OutputStream,
            Some(stream),
            Value::Bytes(bytes.to_vec()),
            unit,
            "unit",
        )
    }

    pub fn blocking_write_and_flush(&self, stream: Handle, bytes: &[u8]) -> CallResult<()> {
        self.invoke(
            BaseOp::BlockingWriteAndFlush,
            ResourceTag::OutputStream,
            Some(stream),
            Value::Bytes(bytes.to_vec()),
            unit,
            "unit",
        )
    }

    pub fn flush(&self, stream: Handle) -> CallResult<()> {
        self.invoke(BaseOp::Flush, ResourceTag::OutputStream, Some(stream), Value::Unit, unit, "unit")
    }

    pub fn blocking_flush(&self, stream: Handle) -> CallResult<()> {
        self.invoke(BaseOp::BlockingFlush, ResourceTag::OutputStream, Some(stream), Value::Unit, unit, "unit")
    }

    pub fn write_zeroes(&self, stream: Handle, len: u64) -> CallResult<()> {
        self.invoke(BaseOp::WriteZeroes, ResourceTag::OutputStream, Some(stream), Value::U64(len), unit, "unit")
    }

    pub fn blocking_write_zeroes_and_flush(&self, stream: Handle, len: u64) -> CallResult<()> {
        self.invoke(
            BaseOp::BlockingWriteZeroesAndFlush,
            ResourceTag::OutputStream,
            Some(stream),
            Value::U64(len),
            unit,
            "unit",
        )
    }

    /// Move up to `len` bytes from `src` into `dst`. Returns the count moved.
    pub fn splice(&self, dst: Handle, src: Handle, len: u64) -> CallResult<u64> {
        self.invoke(
            BaseOp::Splice,
            ResourceTag::OutputStream,
            Some(dst),
            Value::Tuple(vec![Value::Handle(src), Value::U64(len)]),
            Value::as_u64,
            "u64",
        )
    }

    pub fn blocking_splice(&self, dst: Handle, src: Handle, len: u64) -> CallResult<u64> {
        self.invoke(
            BaseOp::BlockingSplice,
            ResourceTag::OutputStream,
            Some(dst),
            Value::Tuple(vec![Value::Handle(src), Value::U64(len)]),
            Value::as_u64,
            "u64",
        )
    }

    pub fn output_stream_subscribe(&self, stream: Handle) -> CallResult<Handle> {
        self.invoke(BaseOp::Subscribe, ResourceTag::OutputStream, Some(stream), Value::Unit, Value::as_handle, "handle")
    }

    pub fn drop_output_stream(&self, stream: Handle) -> CallResult<()> {
        self.invoke(BaseOp::Drop, ResourceTag::OutputStream, Some(stream), Value::Unit, unit, "unit")
    }

    // Pollables and the clock

    /// A pollable that is always (`true`) or never (`false`) ready.
    pub fn create_pollable(&self, ready: bool) -> CallResult<Handle> {
        self.invoke(BaseOp::Create, ResourceTag::Pollable, None, Value::Bool(ready), Value::as_handle, "handle")
    }

    pub fn pollable_ready(&self, pollable: Handle) -> CallResult<bool> {
        self.invoke(BaseOp::Ready, ResourceTag::Pollable, Some(pollable), Value::Unit, Value::as_bool, "bool")
    }

    pub fn pollable_block(&self, pollable: Handle) -> CallResult<()> {
        self.invoke(BaseOp::Block, ResourceTag::Pollable, Some(pollable), Value::Unit, unit, "unit")
    }

    /// Block until at least one of `pollables` is ready. Returns the ready indices.
    pub fn poll_list(&self, pollables: &[Handle]) -> CallResult<Vec<u32>> {
        self.invoke(
            BaseOp::PollList,
            ResourceTag::Pollable,
            None,
            Value::Handles(pollables.to_vec()),
            Value::as_indices,
            "indices",
        )
    }

    pub fn drop_pollable(&self, pollable: Handle) -> CallResult<()> {
        self.invoke(BaseOp::Drop, ResourceTag::Pollable, Some(pollable), Value::Unit, unit, "unit")
    }

    pub fn clock_now(&self) -> CallResult<u64> {
        self.invoke(BaseOp::Now, ResourceTag::Clock, None, Value::Unit, Value::as_u64, "u64")
    }

    pub fn clock_resolution(&self) -> CallResult<u64> {
        self.invoke(BaseOp::Resolution, ResourceTag::Clock, None, Value::Unit, Value::as_u64, "u64")
    }

    pub fn subscribe_instant(&self, when: u64) -> CallResult<Handle> {
        self.invoke(
            BaseOp::SubscribeInstant,
            ResourceTag::Clock,
            None,
            Value::U64(when),
            Value::as_handle,
            "handle",
        )
    }

    pub fn subscribe_duration(&self, nanos: u64) -> CallResult<Handle> {
        self.invoke(
            BaseOp::SubscribeDuration,
            ResourceTag::Clock,
            None,
            Value::U64(nanos),
            Value::as_handle,
            "handle",
        )
    }

    // TCP

    pub fn create_tcp_socket(&self, family: IpAddressFamily) -> CallResult<Handle> {
        self.invoke(BaseOp::Create, ResourceTag::TcpSocket, None, Value::Family(family), Value::as_handle, "handle")
    }

    fn tcp_unit(&self, op: BaseOp, socket: Handle, payload: Value) -> CallResult<()> {
        self.invoke(op, ResourceTag::TcpSocket, Some(socket), payload, unit, "unit")
    }

    pub fn tcp_start_bind(&self, socket: Handle, local: SocketAddr) -> CallResult<()> {
        self.tcp_unit(BaseOp::StartBind, socket, Value::Address(local))
    }

    pub fn tcp_finish_bind(&self, socket: Handle) -> CallResult<()> {
        self.tcp_unit(BaseOp::FinishBind, socket, Value::Unit)
    }

    pub fn tcp_start_connect(&self, socket: Handle, remote: SocketAddr) -> CallResult<()> {
        self.tcp_unit(BaseOp::StartConnect, socket, Value::Address(remote))
    }

    /// Returns the connection's `(input, output)` streams.
    pub fn tcp_finish_connect(&self, socket: Handle) -> CallResult<(Handle, Handle)> {
        self.invoke(BaseOp::FinishConnect, ResourceTag::TcpSocket, Some(socket), Value::Unit, pair, "handle pair")
    }

    pub fn tcp_start_listen(&self, socket: Handle) -> CallResult<()> {
        self.tcp_unit(BaseOp::StartListen, socket, Value::Unit)
    }

    pub fn tcp_finish_listen(&self, socket: Handle) -> CallResult<()> {
        self.tcp_unit(BaseOp::FinishListen, socket, Value::Unit)
    }

    /// Returns `(socket, input, output)` for the accepted connection.
    pub fn tcp_accept(&self, listener: Handle) -> CallResult<(Handle, Handle, Handle)> {
        self.invoke(BaseOp::Accept, ResourceTag::TcpSocket, Some(listener), Value::Unit, triple, "handle triple")
    }

    pub fn tcp_shutdown(&self, socket: Handle, how: ShutdownType) -> CallResult<()> {
        self.tcp_unit(BaseOp::Shutdown, socket, Value::Shutdown(how))
    }

    pub fn tcp_local_address(&self, socket: Handle) -> CallResult<SocketAddr> {
        self.invoke(BaseOp::LocalAddress, ResourceTag::TcpSocket, Some(socket), Value::Unit, Value::as_address, "address")
    }

    pub fn tcp_remote_address(&self, socket: Handle) -> CallResult<SocketAddr> {
        self.invoke(BaseOp::RemoteAddress, ResourceTag::TcpSocket, Some(socket), Value::Unit, Value::as_address, "address")
    }

    pub fn tcp_is_listening(&self, socket: Handle) -> CallResult<bool> {
        self.invoke(BaseOp::IsListening, ResourceTag::TcpSocket, Some(socket), Value::Unit, Value::as_bool, "bool")
    }

    pub fn tcp_address_family(&self, socket: Handle) -> CallResult<IpAddressFamily> {
        self.invoke(BaseOp::AddressFamily, ResourceTag::TcpSocket, Some(socket), Value::Unit, Value::as_family, "family")
    }

    pub fn tcp_get_option(&self, socket: Handle, option: SocketOption) -> CallResult<OptionValue> {
        self.invoke(
            BaseOp::GetOption,
            ResourceTag::TcpSocket,
            Some(socket),
            Value::SocketOption(option),
            option_value,
            "option value",
        )
    }

    pub fn tcp_set_option(&self, socket: Handle, option: SocketOption, value: OptionValue) -> CallResult<()> {
        self.tcp_unit(
            BaseOp::SetOption,
            socket,
            Value::Tuple(vec![Value::SocketOption(option), value.into_value()]),
        )
    }

    pub fn tcp_subscribe(&self, socket: Handle) -> CallResult<Handle> {
        self.invoke(BaseOp::Subscribe, ResourceTag::TcpSocket, Some(socket), Value::Unit, Value::as_handle, "handle")
    }

    pub fn drop_tcp_socket(&self, socket: Handle) -> CallResult<()> {
        self.tcp_unit(BaseOp::Drop, socket, Value::Unit)
    }

    // UDP

    pub fn create_udp_socket(&self, family: IpAddressFamily) -> CallResult<Handle> {
        self.invoke(BaseOp::Create, ResourceTag::UdpSocket, None, Value::Family(family), Value::as_handle, "handle")
    }

    fn udp_unit(&self, op: BaseOp, socket: Handle, payload: Value) -> CallResult<()> {
        self.invoke(op, ResourceTag::UdpSocket, Some(socket), payload, unit, "unit")
    }

    pub fn udp_start_bind(&self, socket: Handle, local: SocketAddr) -> CallResult<()> {
        self.udp_unit(BaseOp::StartBind, socket, Value::Address(local))
    }

    pub fn udp_finish_bind(&self, socket: Handle) -> CallResult<()> {
        self.udp_unit(BaseOp::FinishBind, socket, Value::Unit)
    }

    /// Returns a fresh `(incoming, outgoing)` datagram stream pair.
    pub fn udp_stream(&self, socket: Handle, remote: Option<SocketAddr>) -> CallResult<(Handle, Handle)> {
        self.invoke(
            BaseOp::Stream,
            ResourceTag::UdpSocket,
            Some(socket),
            Value::OptionalAddress(remote),
            pair,
            "handle pair",
        )
    }

    pub fn udp_local_address(&self, socket: Handle) -> CallResult<SocketAddr> {
        self.invoke(BaseOp::LocalAddress, ResourceTag::UdpSocket, Some(socket), Value::Unit, Value::as_address, "address")
    }

    pub fn udp_remote_address(&self, socket: Handle) -> CallResult<SocketAddr> {
        self.invoke(BaseOp::RemoteAddress, ResourceTag::UdpSocket, Some(socket), Value::Unit, Value::as_address, "address")
    }

    pub fn udp_address_family(&self, socket: Handle) -> CallResult<IpAddressFamily> {
        self.invoke(BaseOp::AddressFamily, ResourceTag::UdpSocket, Some(socket), Value::Unit, Value::as_family, "family")
    }

    pub fn udp_get_option(&self, socket: Handle, option: SocketOption) -> CallResult<OptionValue> {
        self.invoke(
            BaseOp::GetOption,
            ResourceTag::UdpSocket,
            Some(socket),
            Value::SocketOption(option),
            option_value,
            "option value",
        )
    }

    pub fn udp_set_option(&self, socket: Handle, option: SocketOption, value: OptionValue) -> CallResult<()> {
        self.udp_unit(
            BaseOp::SetOption,
            socket,
            Value::Tuple(vec![Value::SocketOption(option), value.into_value()]),
        )
    }

    pub fn udp_subscribe(&self, socket: Handle) -> CallResult<Handle> {
        self.invoke(BaseOp::Subscribe, ResourceTag::UdpSocket, Some(socket), Value::Unit, Value::as_handle, "handle")
    }

    pub fn drop_udp_socket(&self, socket: Handle) -> CallResult<()> {
        self.udp_unit(BaseOp::Drop, socket, Value::Unit)
    }

    pub fn receive(&self, stream: Handle, max: u64) -> CallResult<Vec<IncomingDatagram>> {
        self.invoke(
            BaseOp::Receive,
            ResourceTag::IncomingDatagramStream,
            Some(stream),
            Value::U64(max),
            Value::as_incoming_datagrams,
            "incoming datagrams",
        )
    }

    pub fn incoming_datagram_stream_subscribe(&self, stream: Handle) -> CallResult<Handle> {
        self.invoke(
            BaseOp::Subscribe,
            ResourceTag::IncomingDatagramStream,
            Some(stream),
            Value::Unit,
            Value::as_handle,
            "handle",
        )
    }

    pub fn drop_incoming_datagram_stream(&self, stream: Handle) -> CallResult<()> {
        self.invoke(BaseOp::Drop, ResourceTag::IncomingDatagramStream, Some(stream), Value::Unit, unit, "unit")
    }

    /// Datagrams the next `send` may carry.
    pub fn check_send(&self, stream: Handle) -> CallResult<u64> {
        self.invoke(
            BaseOp::CheckSend,
            ResourceTag::OutgoingDatagramStream,
            Some(stream),
            Value::Unit,
            Value::as_u64,
            "u64",
        )
    }

    /// Send in order. Returns how many were sent; a failure after some were sent is
    /// reported as `partial-send`.
    pub fn send(&self, stream: Handle, datagrams: Vec<OutgoingDatagram>) -> CallResult<u64> {
        self.invoke(
            BaseOp::Send,
            ResourceTag::OutgoingDatagramStream,
            Some(stream),
            Value::OutgoingDatagrams(datagrams),
            Value::as_u64,
            "u64",
        )
    }

    pub fn outgoing_datagram_stream_subscribe(&self, stream: Handle) -> CallResult<Handle> {
        self.invoke(
            BaseOp::Subscribe,
            ResourceTag::OutgoingDatagramStream,
            Some(stream),
            Value::Unit,
            Value::as_handle,
            "handle",
        )
    }

    pub fn drop_outgoing_datagram_stream(&self, stream: Handle) -> CallResult<()> {
        self.invoke(BaseOp::Drop, ResourceTag::OutgoingDatagramStream, Some(stream), Value::Unit, unit, "unit")
    }

    // Name lookup

    /// Start resolving `name`. Returns the resolve-address stream.
    pub fn resolve_addresses(&self, name: &str) -> CallResult<Handle> {
        self.invoke(
            BaseOp::ResolveAddresses,
            ResourceTag::NameLookup,
            None,
            Value::String(name.to_string()),
            Value::as_handle,
            "handle",
        )
    }

    /// `None` once every address was returned; `would-block` while still resolving.
    pub fn resolve_next_address(&self, lookup: Handle) -> CallResult<Option<IpAddr>> {
        self.invoke(
            BaseOp::ResolveNextAddress,
            ResourceTag::Future,
            Some(lookup),
            Value::Unit,
            Value::as_optional_ip,
            "optional ip",
        )
    }

    pub fn resolve_subscribe(&self, lookup: Handle) -> CallResult<Handle> {
        self.invoke(BaseOp::Subscribe, ResourceTag::Future, Some(lookup), Value::Unit, Value::as_handle, "handle")
    }

    pub fn drop_resolve_address_stream(&self, lookup: Handle) -> CallResult<()> {
        self.invoke(BaseOp::Drop, ResourceTag::Future, Some(lookup), Value::Unit, unit, "unit")
    }
}
