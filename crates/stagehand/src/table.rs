//! # Resource Table
//!
//! Every live resource the I/O context owns is stored here under a [`Handle`]. Handles
//! are allocated from a counter that only moves forward, so a handle is never reused
//! within a context and a stale handle can never reach a newer resource.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use crate::errors::{Error, ErrorCode};
use crate::host::lookup::ResolveAddressStream;
use crate::host::poll::Pollable;
use crate::host::streams::{InputStream, OutputStream};
use crate::host::tcp::TcpSocket;
use crate::host::udp::{IncomingDatagramStream, OutgoingDatagramStream, UdpSocket};
use crate::opcode::ResourceTag;

/// Opaque reference to a resource in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(u32);

impl Handle {
    pub const fn from_rep(rep: u32) -> Self {
        Self(rep)
    }

    pub const fn rep(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub enum Resource {
    InputStream(InputStream),
    OutputStream(OutputStream),
    Pollable(Pollable),
    TcpSocket(TcpSocket),
    UdpSocket(UdpSocket),
    IncomingDatagramStream(IncomingDatagramStream),
    OutgoingDatagramStream(OutgoingDatagramStream),
    Future(ResolveAddressStream),
}

impl Resource {
    pub fn tag(&self) -> ResourceTag {
        match self {
            Resource::InputStream(_) => ResourceTag::InputStream,
            Resource::OutputStream(_) => ResourceTag::OutputStream,
            Resource::Pollable(_) => ResourceTag::Pollable,
            Resource::TcpSocket(_) => ResourceTag::TcpSocket,
            Resource::UdpSocket(_) => ResourceTag::UdpSocket,
            Resource::IncomingDatagramStream(_) => ResourceTag::IncomingDatagramStream,
            Resource::OutgoingDatagramStream(_) => ResourceTag::OutgoingDatagramStream,
            Resource::Future(_) => ResourceTag::Future,
        }
    }

    /// Stop background work and wake anything blocked on this resource.
    fn release(&mut self) {
        match self {
            Resource::InputStream(stream) => stream.close(),
            Resource::OutputStream(stream) => stream.close(),
            Resource::TcpSocket(socket) => socket.close(),
            Resource::UdpSocket(socket) => socket.close(),
            Resource::IncomingDatagramStream(stream) => stream.close(),
            Resource::Future(lookup) => lookup.close(),
            Resource::Pollable(_) | Resource::OutgoingDatagramStream(_) => {}
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Resource").field(&self.tag()).finish()
    }
}

/// A concrete resource type that can be stored in and fetched from the table.
pub trait TableResource: Sized {
    const TAG: ResourceTag;

    fn from_ref(resource: &Resource) -> Option<&Self>;
    fn from_mut(resource: &mut Resource) -> Option<&mut Self>;
    fn from_owned(resource: Resource) -> Option<Self>;
}

macro_rules! table_resource {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl TableResource for $ty {
                const TAG: ResourceTag = ResourceTag::$variant;

                fn from_ref(resource: &Resource) -> Option<&Self> {
                    match resource {
                        Resource::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }

                fn from_mut(resource: &mut Resource) -> Option<&mut Self> {
                    match resource {
                        Resource::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }

                fn from_owned(resource: Resource) -> Option<Self> {
                    match resource {
                        Resource::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }
            }

            impl From<$ty> for Resource {
                fn from(inner: $ty) -> Self {
                    Resource::$variant(inner)
                }
            }
        )*
    };
}

table_resource! {
    InputStream => InputStream,
    OutputStream => OutputStream,
    Pollable => Pollable,
    TcpSocket => TcpSocket,
    UdpSocket => UdpSocket,
    IncomingDatagramStream => IncomingDatagramStream,
    OutgoingDatagramStream => OutgoingDatagramStream,
    Future => ResolveAddressStream,
}

#[derive(Debug)]
pub struct ResourceTable {
    entries: HashMap<Handle, Resource>,
    next: u32,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next: 1,
        }
    }

    /// Insert a resource under a fresh handle.
    ///
    /// Fails with `new-socket-limit` once the handle space is used up.
    pub fn push(&mut self, resource: impl Into<Resource>) -> Result<Handle, Error> {
        let resource = resource.into();
        if self.next == u32::MAX {
            return Err(Error::detailed(
                ErrorCode::NewSocketLimit,
                "resource handle space exhausted",
            ));
        }
        let handle = Handle(self.next);
        self.next += 1;
        debug!("new {} {}", resource.tag().name(), handle);
        self.entries.insert(handle, resource);
        Ok(handle)
    }

    pub fn get<T: TableResource>(&self, handle: Handle) -> Result<&T, Error> {
        let resource = self.entries.get(&handle).ok_or_else(|| not_live(handle))?;
        T::from_ref(resource).ok_or_else(|| wrong_kind::<T>(handle, resource))
    }

    pub fn get_mut<T: TableResource>(&mut self, handle: Handle) -> Result<&mut T, Error> {
        let resource = self
            .entries
            .get_mut(&handle)
            .ok_or_else(|| not_live(handle))?;
        let tag = resource.tag();
        T::from_mut(resource).ok_or_else(|| wrong_kind_tag::<T>(handle, tag))
    }

    /// Release and remove a resource. The handle is dead afterwards.
    pub fn delete<T: TableResource>(&mut self, handle: Handle) -> Result<T, Error> {
        self.get::<T>(handle)?;
        let mut resource = self.entries.remove(&handle).ok_or_else(|| not_live(handle))?;
        resource.release();
        debug!("dropped {} {}", resource.tag().name(), handle);
        let tag = resource.tag();
        T::from_owned(resource).ok_or_else(|| wrong_kind_tag::<T>(handle, tag))
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release every resource. Handles are not reset.
    pub fn clear(&mut self) {
        for (handle, mut resource) in self.entries.drain() {
            resource.release();
            debug!("released {} {} at shutdown", resource.tag().name(), handle);
        }
    }
}

impl Default for ResourceTable {
    fn default() -> Self {
        Self::new()
    }
}

fn not_live(handle: Handle) -> Error {
    Error::detailed(
        ErrorCode::InvalidState,
        format!("handle {} is not live", handle),
    )
}

fn wrong_kind<T: TableResource>(handle: Handle, resource: &Resource) -> Error {
    wrong_kind_tag::<T>(handle, resource.tag())
}

fn wrong_kind_tag<T: TableResource>(handle: Handle, actual: ResourceTag) -> Error {
    Error::detailed(
        ErrorCode::InvalidArgument,
        format!(
            "handle {} is a {}, not a {}",
            handle,
            actual.name(),
            T::TAG.name()
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_never_reused() {
        let mut table = ResourceTable::new();
        let first = table.push(Pollable::ready()).unwrap();
        table.delete::<Pollable>(first).unwrap();
        let second = table.push(Pollable::ready()).unwrap();
        assert_ne!(first, second);
        assert!(second > first);

        let err = table.get::<Pollable>(first).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidState));
    }

    #[test]
    fn test_wrong_kind_is_invalid_argument() {
        let mut table = ResourceTable::new();
        let handle = table.push(Pollable::never()).unwrap();
        let err = table.get::<InputStream>(handle).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidArgument));
        assert!(table.delete::<InputStream>(handle).is_err());
        assert!(table.contains(handle));
    }

    #[tokio::test]
    async fn test_clear_closes_streams() {
        let mut table = ResourceTable::new();
        let (output, input) = OutputStream::pipe(8);
        let kept = input.clone();
        table.push(output).unwrap();
        table.push(input).unwrap();
        assert_eq!(table.len(), 2);

        table.clear();
        assert!(table.is_empty());
        assert!(kept.read(1).unwrap_err().is_closed());
    }
}
