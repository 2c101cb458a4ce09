//! The capability surface the host exposes to the bridge.
//!
//! Every boundary call reaches the host through the [`Host`] trait. Methods take the opaque
//! handle they act on and report their outcome through the status protocol; `Err(Status::Ok)` is
//! never produced.

use {
    crate::{
        filter::FilterStatus,
        handles::{BufferRef, HostConfig, MetricId, RequestHandle},
        headers::HeaderMap,
        logging::LogLevel,
        marshal::HeaderSink,
        session::YieldTicket,
        status::Status,
    },
    bytes::Bytes,
};

/// How `set_header` treats values already present under the name.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum HeaderAction {
    /// Replace every existing value.
    Set = 0,
    /// Append after the existing values.
    Add = 1,
}

/// How `set_buffer` combines the new bytes with the buffer's current contents.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum BufferAction {
    Set = 0,
    Append = 1,
    Prepend = 2,
}

/// Per-request values the host computes itself.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u32)]
pub enum WellKnownValue {
    RouteName = 1,
    FilterChainName = 2,
    Protocol = 3,
    ResponseCode = 4,
    ResponseCodeDetails = 5,
    AttemptCount = 6,
    DownstreamLocalAddress = 7,
    DownstreamRemoteAddress = 8,
    UpstreamLocalAddress = 9,
    UpstreamRemoteAddress = 10,
    UpstreamClusterName = 11,
    VirtualClusterName = 12,
}

impl WellKnownValue {
    const ALL: [WellKnownValue; 12] = [
        Self::RouteName,
        Self::FilterChainName,
        Self::Protocol,
        Self::ResponseCode,
        Self::ResponseCodeDetails,
        Self::AttemptCount,
        Self::DownstreamLocalAddress,
        Self::DownstreamRemoteAddress,
        Self::UpstreamLocalAddress,
        Self::UpstreamRemoteAddress,
        Self::UpstreamClusterName,
        Self::VirtualClusterName,
    ];

    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.id() == id)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::RouteName => "route_name",
            Self::FilterChainName => "filter_chain_name",
            Self::Protocol => "protocol",
            Self::ResponseCode => "response_code",
            Self::ResponseCodeDetails => "response_code_details",
            Self::AttemptCount => "attempt_count",
            Self::DownstreamLocalAddress => "downstream_local_address",
            Self::DownstreamRemoteAddress => "downstream_remote_address",
            Self::UpstreamLocalAddress => "upstream_local_address",
            Self::UpstreamRemoteAddress => "upstream_remote_address",
            Self::UpstreamClusterName => "upstream_cluster_name",
            Self::VirtualClusterName => "virtual_cluster_name",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.name() == name)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum StateType {
    ReadOnly = 0,
    Mutable = 1,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum LifeSpan {
    FilterChain = 0,
    Request = 1,
    Connection = 2,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum StreamSharing {
    None = 0,
    SharedWithUpstreamConnection = 1,
    SharedWithUpstreamConnectionOnce = 2,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u32)]
pub enum MetricKind {
    Counter = 0,
    Gauge = 1,
    Histogram = 2,
}

/// Why the host is tearing a request down.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum DestroyReason {
    Normal = 0,
    Terminate = 1,
}

/// Why the extension is releasing its reference to a request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum FinalizeReason {
    /// Released after the host tore the request down.
    Normal = 0,
    /// The last reference was dropped without an explicit teardown.
    Dropped = 1,
}

/// A reply the extension asks the host to send in place of forwarding the request.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LocalReply {
    pub code: u16,
    pub body: String,
    pub headers: HeaderMap,
    pub grpc_status: Option<i64>,
    pub details: String,
}

impl LocalReply {
    pub fn new(code: u16, body: impl Into<String>) -> Self {
        Self {
            code,
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

/// The native host, as seen by the bridge.
///
/// Request-scoped methods are called with the request's critical section held, so an
/// implementation never sees two of them overlap for the same request. The three lookups that
/// take a [`YieldTicket`] may answer `Err(Status::Yield)` and keep the ticket; the call then
/// stays suspended until the host completes or cancels it, from any thread.
pub trait Host: Send + Sync {
    fn continue_request(&self, req: RequestHandle, status: FilterStatus) -> Result<(), Status>;

    fn send_local_reply(&self, req: RequestHandle, reply: &LocalReply) -> Result<(), Status>;

    /// Terminate the request with a fault reply. `detail` starts with the fault marker.
    fn send_fault_reply(&self, req: RequestHandle, detail: &str) -> Result<(), Status>;

    fn get_header(&self, req: RequestHandle, name: &str) -> Result<String, Status>;

    /// Write the current phase's headers into `sink`, in host order.
    fn copy_headers(&self, req: RequestHandle, sink: &mut dyn HeaderSink) -> Result<(), Status>;

    fn set_header(
        &self,
        req: RequestHandle,
        name: &str,
        value: &str,
        action: HeaderAction,
    ) -> Result<(), Status>;

    fn remove_header(&self, req: RequestHandle, name: &str) -> Result<(), Status>;

    fn copy_trailers(&self, req: RequestHandle, sink: &mut dyn HeaderSink)
        -> Result<(), Status>;

    fn set_trailer(
        &self,
        req: RequestHandle,
        name: &str,
        value: &str,
        action: HeaderAction,
    ) -> Result<(), Status>;

    fn remove_trailer(&self, req: RequestHandle, name: &str) -> Result<(), Status>;

    /// Copy out up to `len` bytes of a buffer.
    fn get_buffer(&self, req: RequestHandle, buffer: BufferRef, len: usize)
        -> Result<Bytes, Status>;

    /// `data` is only borrowed for the duration of the call.
    fn set_buffer(
        &self,
        req: RequestHandle,
        buffer: BufferRef,
        data: &[u8],
        action: BufferAction,
    ) -> Result<(), Status>;

    fn drain_buffer(&self, req: RequestHandle, buffer: BufferRef, len: usize)
        -> Result<(), Status>;

    fn get_string_value(&self, req: RequestHandle, value: WellKnownValue)
        -> Result<String, Status>;

    fn get_integer_value(&self, req: RequestHandle, value: WellKnownValue) -> Result<u64, Status>;

    /// Answer with the namespace's fields in the structured-value wire encoding.
    fn get_dynamic_metadata(
        &self,
        req: RequestHandle,
        namespace: &str,
        ticket: YieldTicket,
    ) -> Result<Vec<u8>, Status>;

    fn set_dynamic_metadata(
        &self,
        req: RequestHandle,
        namespace: &str,
        key: &str,
        value: &[u8],
    ) -> Result<(), Status>;

    fn get_filter_state(
        &self,
        req: RequestHandle,
        key: &str,
        ticket: YieldTicket,
    ) -> Result<String, Status>;

    fn set_filter_state(
        &self,
        req: RequestHandle,
        key: &str,
        value: &str,
        state_type: StateType,
        life_span: LifeSpan,
        sharing: StreamSharing,
    ) -> Result<(), Status>;

    fn get_property(
        &self,
        req: RequestHandle,
        key: &str,
        ticket: YieldTicket,
    ) -> Result<String, Status>;

    /// The extension no longer holds any reference to the request.
    fn finalize(&self, req: RequestHandle, reason: FinalizeReason) -> Result<(), Status>;

    fn log(&self, level: LogLevel, message: &str) -> Result<(), Status>;

    fn log_level(&self) -> Result<LogLevel, Status>;

    fn define_metric(
        &self,
        config: HostConfig,
        kind: MetricKind,
        name: &str,
    ) -> Result<MetricId, Status>;

    fn increment_metric(&self, config: HostConfig, metric: MetricId, offset: i64)
        -> Result<(), Status>;

    fn get_metric(&self, config: HostConfig, metric: MetricId) -> Result<u64, Status>;

    fn record_metric(&self, config: HostConfig, metric: MetricId, value: u64)
        -> Result<(), Status>;
}
