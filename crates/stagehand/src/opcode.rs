//! # Opcode Space
//!
//! A flat integer namespace for every call the I/O context serves. The base operation is
//! shifted above [`TAG_BITS`]; the resource tag occupies the low bits. One dispatch table
//! therefore serves every resource kind, and a new kind only claims a new tag value.

use crate::errors::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of the resource-tag field.
pub const TAG_BITS: u32 = 8;
pub const TAG_MASK: u32 = (1 << TAG_BITS) - 1;

/// Base operations. Discriminants are part of the in-process protocol and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum BaseOp {
    Create = 0x01,
    Drop = 0x02,
    Subscribe = 0x03,

    // Input streams
    Read = 0x10,
    BlockingRead = 0x11,
    Skip = 0x12,
    BlockingSkip = 0x13,

    // Output streams
    CheckWrite = 0x20,
    Write = 0x21,
    BlockingWriteAndFlush = 0x22,
    Flush = 0x23,
    BlockingFlush = 0x24,
    WriteZeroes = 0x25,
    BlockingWriteZeroesAndFlush = 0x26,
    Splice = 0x27,
    BlockingSplice = 0x28,

    // Pollables and the monotonic clock
    Ready = 0x30,
    Block = 0x31,
    PollList = 0x32,
    Now = 0x33,
    Resolution = 0x34,
    SubscribeInstant = 0x35,
    SubscribeDuration = 0x36,

    // Sockets
    StartBind = 0x40,
    FinishBind = 0x41,
    StartConnect = 0x42,
    FinishConnect = 0x43,
    StartListen = 0x44,
    FinishListen = 0x45,
    Accept = 0x46,
    Shutdown = 0x47,
    LocalAddress = 0x48,
    RemoteAddress = 0x49,
    IsListening = 0x4a,
    AddressFamily = 0x4b,
    GetOption = 0x4c,
    SetOption = 0x4d,

    // Datagrams
    Stream = 0x50,
    Receive = 0x51,
    CheckSend = 0x52,
    Send = 0x53,

    // Name lookup
    ResolveAddresses = 0x60,
    ResolveNextAddress = 0x61,
}

impl BaseOp {
    pub const ALL: &'static [BaseOp] = &[
        BaseOp::Create,
        BaseOp::Drop,
        BaseOp::Subscribe,
        BaseOp::Read,
        BaseOp::BlockingRead,
        BaseOp::Skip,
        BaseOp::BlockingSkip,
        BaseOp::CheckWrite,
        BaseOp::Write,
        BaseOp::BlockingWriteAndFlush,
        BaseOp::Flush,
        BaseOp::BlockingFlush,
        BaseOp::WriteZeroes,
        BaseOp::BlockingWriteZeroesAndFlush,
        BaseOp::Splice,
        BaseOp::BlockingSplice,
        BaseOp::Ready,
        BaseOp::Block,
        BaseOp::PollList,
        BaseOp::Now,
        BaseOp::Resolution,
        BaseOp::SubscribeInstant,
        BaseOp::SubscribeDuration,
        BaseOp::StartBind,
        BaseOp::FinishBind,
        BaseOp::StartConnect,
        BaseOp::FinishConnect,
        BaseOp::StartListen,
        BaseOp::FinishListen,
        BaseOp::Accept,
        BaseOp::Shutdown,
        BaseOp::LocalAddress,
        BaseOp::RemoteAddress,
        BaseOp::IsListening,
        BaseOp::AddressFamily,
        BaseOp::GetOption,
        BaseOp::SetOption,
        BaseOp::Stream,
        BaseOp::Receive,
        BaseOp::CheckSend,
        BaseOp::Send,
        BaseOp::ResolveAddresses,
        BaseOp::ResolveNextAddress,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            BaseOp::Create => "create",
            BaseOp::Drop => "drop",
            BaseOp::Subscribe => "subscribe",
            BaseOp::Read => "read",
            BaseOp::BlockingRead => "blocking-read",
            BaseOp::Skip => "skip",
            BaseOp::BlockingSkip => "blocking-skip",
            BaseOp::CheckWrite => "check-write",
            BaseOp::Write => "write",
            BaseOp::BlockingWriteAndFlush => "blocking-write-and-flush",
            BaseOp::Flush => "flush",
            BaseOp::BlockingFlush => "blocking-flush",
            BaseOp::WriteZeroes => "write-zeroes",
            BaseOp::BlockingWriteZeroesAndFlush => "blocking-write-zeroes-and-flush",
            BaseOp::Splice => "splice",
            BaseOp::BlockingSplice => "blocking-splice",
            BaseOp::Ready => "ready",
            BaseOp::Block => "block",
            BaseOp::PollList => "poll",
            BaseOp::Now => "now",
            BaseOp::Resolution => "resolution",
            BaseOp::SubscribeInstant => "subscribe-instant",
            BaseOp::SubscribeDuration => "subscribe-duration",
            BaseOp::StartBind => "start-bind",
            BaseOp::FinishBind => "finish-bind",
            BaseOp::StartConnect => "start-connect",
            BaseOp::FinishConnect => "finish-connect",
            BaseOp::StartListen => "start-listen",
            BaseOp::FinishListen => "finish-listen",
            BaseOp::Accept => "accept",
            BaseOp::Shutdown => "shutdown",
            BaseOp::LocalAddress => "local-address",
            BaseOp::RemoteAddress => "remote-address",
            BaseOp::IsListening => "is-listening",
            BaseOp::AddressFamily => "address-family",
            BaseOp::GetOption => "get-option",
            BaseOp::SetOption => "set-option",
            BaseOp::Stream => "stream",
            BaseOp::Receive => "receive",
            BaseOp::CheckSend => "check-send",
            BaseOp::Send => "send",
            BaseOp::ResolveAddresses => "resolve-addresses",
            BaseOp::ResolveNextAddress => "resolve-next-address",
        }
    }
}

/// Resource-kind tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u32)]
pub enum ResourceTag {
    InputStream = 0x01,
    OutputStream = 0x02,
    Pollable = 0x03,
    TcpSocket = 0x04,
    UdpSocket = 0x05,
    IncomingDatagramStream = 0x06,
    OutgoingDatagramStream = 0x07,
    Future = 0x08,
    Clock = 0x09,
    NameLookup = 0x0a,
}

impl ResourceTag {
    pub const ALL: &'static [ResourceTag] = &[
        ResourceTag::InputStream,
        ResourceTag::OutputStream,
        ResourceTag::Pollable,
        ResourceTag::TcpSocket,
        ResourceTag::UdpSocket,
        ResourceTag::IncomingDatagramStream,
        ResourceTag::OutgoingDatagramStream,
        ResourceTag::Future,
        ResourceTag::Clock,
        ResourceTag::NameLookup,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|tag| tag.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            ResourceTag::InputStream => "input-stream",
            ResourceTag::OutputStream => "output-stream",
            ResourceTag::Pollable => "pollable",
            ResourceTag::TcpSocket => "tcp-socket",
            ResourceTag::UdpSocket => "udp-socket",
            ResourceTag::IncomingDatagramStream => "incoming-datagram-stream",
            ResourceTag::OutgoingDatagramStream => "outgoing-datagram-stream",
            ResourceTag::Future => "resolve-address-stream",
            ResourceTag::Clock => "monotonic-clock",
            ResourceTag::NameLookup => "ip-name-lookup",
        }
    }
}

/// `base << TAG_BITS | tag`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Opcode(u32);

impl Opcode {
    pub const fn new(base: BaseOp, tag: ResourceTag) -> Self {
        Opcode(((base as u32) << TAG_BITS) | tag as u32)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Opcode(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Split into base operation and tag. Unknown values are a protocol mismatch.
    pub fn decode(self) -> Result<(BaseOp, ResourceTag), ProtocolError> {
        let base = BaseOp::from_code(self.0 >> TAG_BITS);
        let tag = ResourceTag::from_code(self.0 & TAG_MASK);
        match (base, tag) {
            (Some(base), Some(tag)) => Ok((base, tag)),
            _ => Err(ProtocolError::UnknownOpcode(self.0)),
        }
    }
}

impl From<u32> for Opcode {
    fn from(raw: u32) -> Self {
        Opcode(raw)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Ok((base, tag)) => write!(f, "{}.{}", tag.name(), base.name()),
            Err(_) => write!(f, "{:#010x}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_opcode_round_trips_through_decode() {
        let op = Opcode::new(BaseOp::StartBind, ResourceTag::TcpSocket);
        assert_eq!(op.decode().unwrap(), (BaseOp::StartBind, ResourceTag::TcpSocket));
        assert_eq!(op.to_string(), "tcp-socket.start-bind");
    }

    #[test]
    fn test_opcodes_are_unique_across_the_space() {
        let mut seen = HashSet::new();
        for base in BaseOp::ALL {
            for tag in ResourceTag::ALL {
                assert!(seen.insert(Opcode::new(*base, *tag).raw()));
            }
        }
    }

    #[test]
    fn test_unknown_opcode_is_a_protocol_error() {
        let bogus = Opcode::from_raw((0x7f << TAG_BITS) | ResourceTag::TcpSocket.code());
        assert!(matches!(bogus.decode(), Err(ProtocolError::UnknownOpcode(_))));

        let bad_tag = Opcode::from_raw((BaseOp::Read.code() << TAG_BITS) | 0xee);
        assert!(matches!(bad_tag.decode(), Err(ProtocolError::UnknownOpcode(_))));
    }

    #[test]
    fn test_tags_fit_in_tag_bits() {
        for tag in ResourceTag::ALL {
            assert_eq!(tag.code() & !TAG_MASK, 0);
        }
    }
}
