//! # Stagehand
//!
//! Blocking, POSIX-style byte streams, pollables and TCP/UDP sockets for callers that must
//! look synchronous, served by a dedicated asynchronous I/O context.
//!
//! ## Architecture
//!
//! * `IoContext`: a thread running a tokio runtime that owns every resource
//! * `Bridge`: a calling context; each call blocks until the I/O context answers
//! * `HandlerRegistry`: maps each resource tag of an opcode to the handler serving it
//! * `ResourceTable`: live resources by handle, never reusing a handle
//!
//! Operations are addressed by an [`Opcode`], a base operation combined with a resource
//! tag. Failures come in two tiers: a recoverable [`Error`] from the fixed error
//! vocabulary, and a fatal [`ProtocolError`] that poisons the bridge that observed it.
//!
//! ## Example Usage
//!
//! ```no_run
//! use stagehand::{HandlerRegistry, IoContext, StagehandConfig, StreamSpec};
//!
//! fn example() -> anyhow::Result<()> {
//!     let (_context, bridge) =
//!         IoContext::spawn(StagehandConfig::default(), HandlerRegistry::default())?;
//!     let (output, input) = bridge.create_pipe(None)??;
//!     bridge.write(output, b"hello")??;
//!     let bytes = bridge.blocking_read(input, 5)??;
//!     assert_eq!(bytes, b"hello");
//!     let _stdout = bridge.create_output_stream(StreamSpec::Stdout)??;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod client;
pub mod config;
pub mod context;
pub mod errors;
pub mod events;
pub mod handler;
pub mod host;
pub mod logging;
pub mod opcode;
pub mod store;
pub mod table;
pub mod value;

pub use bridge::{Bridge, Call, Outcome};
pub use client::CallResult;
pub use config::{ConfigError, StagehandConfig};
pub use context::IoContext;
pub use errors::{Error, ErrorCode, IoError, ProtocolError, StreamError};
pub use events::{CallEvent, EventLog};
pub use handler::{Handler, HandlerRegistry, HandlerResult};
pub use host::network::{IpAddressFamily, ShutdownType, SocketOption};
pub use host::streams::StreamSpec;
pub use host::udp::{IncomingDatagram, OutgoingDatagram};
pub use opcode::{BaseOp, Opcode, ResourceTag};
pub use store::IoStore;
pub use table::Handle;
pub use value::{OptionValue, Value};
