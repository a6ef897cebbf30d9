//! Resource implementations and the handlers that serve them.

pub mod lookup;
pub mod network;
pub mod poll;
pub mod shared;
pub mod streams;
pub mod tcp;
pub mod udp;
