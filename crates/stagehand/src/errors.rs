//! # Error Taxonomy
//!
//! Every resource operation fails with one member of a closed semantic vocabulary
//! ([`ErrorCode`]) or, for byte streams, with a [`StreamError`]. These are returned to the
//! caller for normal control flow.
//!
//! Failures that mean the calling side and the I/O context have desynchronized are
//! [`ProtocolError`]s. They are never returned as semantic errors; they travel in the outer
//! `anyhow::Result` of a call and poison the bridge that observed them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Semantic error vocabulary shared by every resource type.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    #[error("invalid-argument")]
    InvalidArgument,
    #[error("invalid-state")]
    InvalidState,
    #[error("not-in-progress")]
    NotInProgress,
    #[error("would-block")]
    WouldBlock,
    #[error("address-in-use")]
    AddressInUse,
    #[error("address-not-bindable")]
    AddressNotBindable,
    #[error("connection-refused")]
    ConnectionRefused,
    #[error("connection-reset")]
    ConnectionReset,
    #[error("connection-aborted")]
    ConnectionAborted,
    #[error("remote-unreachable")]
    RemoteUnreachable,
    #[error("timeout")]
    Timeout,
    #[error("datagram-too-large")]
    DatagramTooLarge,
    #[error("access-denied")]
    AccessDenied,
    #[error("not-supported")]
    NotSupported,
    #[error("new-socket-limit")]
    NewSocketLimit,
    #[error("name-unresolvable")]
    NameUnresolvable,
    #[error("temporary-resolver-failure")]
    TemporaryResolverFailure,
    #[error("permanent-resolver-failure")]
    PermanentResolverFailure,
    #[error("unknown")]
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "invalid-argument",
            ErrorCode::InvalidState => "invalid-state",
            ErrorCode::NotInProgress => "not-in-progress",
            ErrorCode::WouldBlock => "would-block",
            ErrorCode::AddressInUse => "address-in-use",
            ErrorCode::AddressNotBindable => "address-not-bindable",
            ErrorCode::ConnectionRefused => "connection-refused",
            ErrorCode::ConnectionReset => "connection-reset",
            ErrorCode::ConnectionAborted => "connection-aborted",
            ErrorCode::RemoteUnreachable => "remote-unreachable",
            ErrorCode::Timeout => "timeout",
            ErrorCode::DatagramTooLarge => "datagram-too-large",
            ErrorCode::AccessDenied => "access-denied",
            ErrorCode::NotSupported => "not-supported",
            ErrorCode::NewSocketLimit => "new-socket-limit",
            ErrorCode::NameUnresolvable => "name-unresolvable",
            ErrorCode::TemporaryResolverFailure => "temporary-resolver-failure",
            ErrorCode::PermanentResolverFailure => "permanent-resolver-failure",
            ErrorCode::Unknown => "unknown",
        }
    }

    /// Translate a native I/O error into the vocabulary.
    ///
    /// The raw OS code is looked up first, then the portable [`std::io::ErrorKind`].
    /// Anything not listed in either table is `unknown`.
    pub fn from_io_error(err: &std::io::Error) -> Self {
        #[cfg(unix)]
        if let Some(errno) = err.raw_os_error() {
            if let Some((_, code)) = ERRNO_TABLE.iter().find(|(e, _)| *e == errno) {
                return *code;
            }
        }
        KIND_TABLE
            .iter()
            .find(|(kind, _)| *kind == err.kind())
            .map(|(_, code)| *code)
            .unwrap_or(ErrorCode::Unknown)
    }
}

impl From<std::io::Error> for ErrorCode {
    fn from(err: std::io::Error) -> Self {
        ErrorCode::from_io_error(&err)
    }
}

#[cfg(unix)]
static ERRNO_TABLE: &[(i32, ErrorCode)] = &[
    (libc::EACCES, ErrorCode::AccessDenied),
    (libc::EPERM, ErrorCode::AccessDenied),
    (libc::EADDRINUSE, ErrorCode::AddressInUse),
    (libc::EADDRNOTAVAIL, ErrorCode::AddressNotBindable),
    (libc::EAFNOSUPPORT, ErrorCode::InvalidArgument),
    (libc::EINVAL, ErrorCode::InvalidArgument),
    (libc::EDESTADDRREQ, ErrorCode::InvalidArgument),
    (libc::EAGAIN, ErrorCode::WouldBlock),
    (libc::EWOULDBLOCK, ErrorCode::WouldBlock),
    (libc::EALREADY, ErrorCode::InvalidState),
    (libc::EISCONN, ErrorCode::InvalidState),
    (libc::ENOTCONN, ErrorCode::InvalidState),
    (libc::ECONNREFUSED, ErrorCode::ConnectionRefused),
    (libc::ECONNRESET, ErrorCode::ConnectionReset),
    (libc::EPIPE, ErrorCode::ConnectionReset),
    (libc::ECONNABORTED, ErrorCode::ConnectionAborted),
    (libc::ETIMEDOUT, ErrorCode::Timeout),
    (libc::EHOSTUNREACH, ErrorCode::RemoteUnreachable),
    (libc::EHOSTDOWN, ErrorCode::RemoteUnreachable),
    (libc::ENETUNREACH, ErrorCode::RemoteUnreachable),
    (libc::ENETDOWN, ErrorCode::RemoteUnreachable),
    (libc::EMSGSIZE, ErrorCode::DatagramTooLarge),
    (libc::EOPNOTSUPP, ErrorCode::NotSupported),
    (libc::EPROTONOSUPPORT, ErrorCode::NotSupported),
    (libc::ENOPROTOOPT, ErrorCode::NotSupported),
    (libc::EMFILE, ErrorCode::NewSocketLimit),
    (libc::ENFILE, ErrorCode::NewSocketLimit),
    (libc::ENOBUFS, ErrorCode::NewSocketLimit),
    (libc::ENOMEM, ErrorCode::NewSocketLimit),
];

static KIND_TABLE: &[(std::io::ErrorKind, ErrorCode)] = &[
    (std::io::ErrorKind::PermissionDenied, ErrorCode::AccessDenied),
    (std::io::ErrorKind::AddrInUse, ErrorCode::AddressInUse),
    (std::io::ErrorKind::AddrNotAvailable, ErrorCode::AddressNotBindable),
    (std::io::ErrorKind::InvalidInput, ErrorCode::InvalidArgument),
    (std::io::ErrorKind::WouldBlock, ErrorCode::WouldBlock),
    (std::io::ErrorKind::NotConnected, ErrorCode::InvalidState),
    (std::io::ErrorKind::ConnectionRefused, ErrorCode::ConnectionRefused),
    (std::io::ErrorKind::ConnectionReset, ErrorCode::ConnectionReset),
    (std::io::ErrorKind::BrokenPipe, ErrorCode::ConnectionReset),
    (std::io::ErrorKind::ConnectionAborted, ErrorCode::ConnectionAborted),
    (std::io::ErrorKind::TimedOut, ErrorCode::Timeout),
    (std::io::ErrorKind::HostUnreachable, ErrorCode::RemoteUnreachable),
    (std::io::ErrorKind::NetworkUnreachable, ErrorCode::RemoteUnreachable),
    (std::io::ErrorKind::Unsupported, ErrorCode::NotSupported),
    (std::io::ErrorKind::OutOfMemory, ErrorCode::NewSocketLimit),
];

/// Cause carried by a `last-operation-failed` stream error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoError {
    pub code: ErrorCode,
    pub message: String,
}

impl IoError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn to_debug_string(&self) -> String {
        format!("{}: {}", self.code, self.message)
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_debug_string())
    }
}

impl std::error::Error for IoError {}

impl From<std::io::Error> for IoError {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorCode::from_io_error(&err), err.to_string())
    }
}

/// Stream error matching the `stream-error` variant of byte streams.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamError {
    /// The last operation failed; the stream is closed afterwards
    #[error("last-operation-failed: {0}")]
    LastOperationFailed(IoError),
    /// The stream is closed and no more data can be read or written
    #[error("closed")]
    Closed,
}

impl From<IoError> for StreamError {
    fn from(err: IoError) -> Self {
        StreamError::LastOperationFailed(err)
    }
}

/// # Error
///
/// The tagged `{kind, detail}` error a caller observes from a resource operation.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Error {
    #[error("{0}")]
    Code(ErrorCode),

    #[error("{code}: {detail}")]
    Detailed { code: ErrorCode, detail: String },

    #[error("{0}")]
    Stream(StreamError),

    /// Some datagrams of a batch were sent before `code` stopped it
    #[error("{code} after {sent} datagram(s) sent")]
    PartialSend { sent: u64, code: ErrorCode },
}

impl Error {
    pub fn detailed(code: ErrorCode, detail: impl Into<String>) -> Self {
        Error::Detailed {
            code,
            detail: detail.into(),
        }
    }

    /// Semantic kind, e.g. `"would-block"` or `"closed"`.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Code(code) | Error::Detailed { code, .. } | Error::PartialSend { code, .. } => {
                code.as_str()
            }
            Error::Stream(StreamError::Closed) => "closed",
            Error::Stream(StreamError::LastOperationFailed(_)) => "last-operation-failed",
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            Error::Code(_) | Error::Stream(StreamError::Closed) => None,
            Error::Detailed { detail, .. } => Some(detail.clone()),
            Error::Stream(StreamError::LastOperationFailed(cause)) => {
                Some(cause.to_debug_string())
            }
            Error::PartialSend { sent, .. } => Some(sent.to_string()),
        }
    }

    /// The vocabulary member behind this error, if it is not a stream condition.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::Code(code) | Error::Detailed { code, .. } | Error::PartialSend { code, .. } => {
                Some(*code)
            }
            Error::Stream(_) => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Stream(StreamError::Closed))
    }
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Error::Code(code)
    }
}

impl From<StreamError> for Error {
    fn from(err: StreamError) -> Self {
        Error::Stream(err)
    }
}

/// # ProtocolError
///
/// Fatal desynchronization between the calling side and the I/O context.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolError {
    #[error("unknown opcode {0:#010x}")]
    UnknownOpcode(u32),

    #[error("operation {op} is not defined for {tag}")]
    UnsupportedOperation { op: String, tag: String },

    #[error("correlation mismatch: expected {expected}, received {received}")]
    CorrelationMismatch { expected: u64, received: u64 },

    #[error("malformed payload for {opcode}: {reason}")]
    MalformedPayload { opcode: String, reason: String },

    #[error("call did not complete within {0:?}")]
    Timeout(Duration),

    #[error("I/O context terminated")]
    ContextTerminated,

    #[error("bridge poisoned by an earlier protocol error")]
    Poisoned,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_kind_translation_is_total() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(ErrorCode::from_io_error(&refused), ErrorCode::ConnectionRefused);

        let other = io::Error::new(io::ErrorKind::Other, "something odd");
        assert_eq!(ErrorCode::from_io_error(&other), ErrorCode::Unknown);
    }

    #[cfg(unix)]
    #[test]
    fn test_errno_translation() {
        let in_use = io::Error::from_raw_os_error(libc::EADDRINUSE);
        assert_eq!(ErrorCode::from_io_error(&in_use), ErrorCode::AddressInUse);

        let not_avail = io::Error::from_raw_os_error(libc::EADDRNOTAVAIL);
        assert_eq!(ErrorCode::from_io_error(&not_avail), ErrorCode::AddressNotBindable);

        let too_big = io::Error::from_raw_os_error(libc::EMSGSIZE);
        assert_eq!(ErrorCode::from_io_error(&too_big), ErrorCode::DatagramTooLarge);

        // Not in either table
        let odd = io::Error::from_raw_os_error(libc::EXDEV);
        assert_eq!(ErrorCode::from_io_error(&odd), ErrorCode::Unknown);
    }

    #[test]
    fn test_error_kind_and_detail() {
        let err = Error::from(ErrorCode::WouldBlock);
        assert_eq!(err.kind(), "would-block");
        assert_eq!(err.detail(), None);

        let partial = Error::PartialSend {
            sent: 1,
            code: ErrorCode::DatagramTooLarge,
        };
        assert_eq!(partial.kind(), "datagram-too-large");
        assert_eq!(partial.detail(), Some("1".to_string()));

        let failed = Error::from(StreamError::LastOperationFailed(IoError::new(
            ErrorCode::ConnectionReset,
            "peer went away",
        )));
        assert_eq!(failed.kind(), "last-operation-failed");
        assert_eq!(
            failed.detail(),
            Some("connection-reset: peer went away".to_string())
        );
        assert!(Error::from(StreamError::Closed).is_closed());
    }

    #[test]
    fn test_error_code_serializes_kebab_case() {
        let json = serde_json::to_string(&ErrorCode::TemporaryResolverFailure).unwrap();
        assert_eq!(json, "\"temporary-resolver-failure\"");
    }
}
