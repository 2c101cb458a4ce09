//! Opaque handles that cross the boundary.
//!
//! Every handle is a plain `u32` newtype. The side that does not own an entity never interprets
//! the number; it only passes it back to the owner.

use cranelift_entity::entity_impl;

/// A host-owned, single-request execution context.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct RequestHandle(u32);

entity_impl!(RequestHandle, "request");

/// The host's own configuration object, needed by the metric calls.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct HostConfig(u32);

entity_impl!(HostConfig, "host_config");

/// A parsed (or merged) extension configuration, issued by the bridge.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct ConfigId(u32);

entity_impl!(ConfigId, "config");

/// A host buffer, such as a request or response body chunk.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct BufferRef(u32);

entity_impl!(BufferRef, "buffer");

/// A counter, gauge or histogram bound to a configuration at definition time.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct MetricId(u32);

entity_impl!(MetricId, "metric");

/// One suspended boundary call. Unique within its request.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct CallId(u32);

entity_impl!(CallId, "call");
