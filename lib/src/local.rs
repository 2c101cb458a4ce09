//! An in-memory host, for local runs and tests.
//!
//! [`LocalHost`] implements [`Host`] over plain collections and drives a [`Bridge`] the way a
//! proxy would: it tracks which phase is active, whether the extension is inside a host
//! invocation, and whether it handed the request off to a background task.

use {
    crate::{
        config::{BridgeConfig, LocalHostConfig},
        execute::Bridge,
        filter::{FilterStatus, Phase, Plugin},
        handles::{BufferRef, ConfigId, HostConfig, MetricId, RequestHandle},
        headers::HeaderMap,
        host::{
            BufferAction, DestroyReason, FinalizeReason, HeaderAction, Host, LifeSpan, LocalReply,
            MetricKind, StateType, StreamSharing, WellKnownValue,
        },
        logging::{HostLogWriter, LogLevel},
        marshal::{self, HeaderSink},
        session::{Completion, YieldTicket},
        status::Status,
    },
    bytes::Bytes,
    cranelift_entity::PrimaryMap,
    serde_json::{Map, Value},
    std::{
        collections::{HashMap, HashSet},
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Mutex, MutexGuard, PoisonError,
        },
        thread,
        time::Duration,
    },
};

/// A reply the extension sent for a request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Reply {
    Local(LocalReply),
    /// A fault reply; the detail starts with the fault marker.
    Fault(String),
}

impl Reply {
    pub fn is_fault(&self) -> bool {
        matches!(self, Reply::Fault(_))
    }
}

#[derive(Clone, Copy, Debug)]
enum Lookup {
    Metadata,
    FilterState,
    Property,
}

/// A lookup answered with [`Status::Yield`], waiting for the test (or runner) to resolve it.
struct Parked {
    req: RequestHandle,
    key: String,
    lookup: Lookup,
    ticket: YieldTicket,
}

#[derive(Default)]
struct RequestState {
    phase: Option<Phase>,
    in_call: bool,
    running: bool,
    early_continue: Option<FilterStatus>,
    destroyed: bool,
    request_headers: HeaderMap,
    request_trailers: HeaderMap,
    response_headers: HeaderMap,
    response_trailers: HeaderMap,
    buffers: PrimaryMap<BufferRef, Vec<u8>>,
    dynamic_metadata: HashMap<String, Map<String, Value>>,
    filter_state: HashMap<String, (String, StateType)>,
    properties: HashMap<String, String>,
    replies: Vec<Reply>,
    continued: Vec<FilterStatus>,
    finalized: Option<FinalizeReason>,
}

impl RequestState {
    fn phase(&self) -> Result<Phase, Status> {
        self.phase.ok_or(Status::InvalidPhase)
    }

    fn headers(&mut self) -> Result<&mut HeaderMap, Status> {
        Ok(if self.phase()?.is_decode() {
            &mut self.request_headers
        } else {
            &mut self.response_headers
        })
    }

    fn trailers(&mut self) -> Result<&mut HeaderMap, Status> {
        Ok(if self.phase()?.is_decode() {
            &mut self.request_trailers
        } else {
            &mut self.response_trailers
        })
    }

    fn mutable_headers(&mut self) -> Result<&mut HeaderMap, Status> {
        if !self.phase()?.is_headers() {
            return Err(Status::InvalidPhase);
        }
        self.headers()
    }

    fn mutable_trailers(&mut self) -> Result<&mut HeaderMap, Status> {
        if !self.phase()?.is_trailers() {
            return Err(Status::InvalidPhase);
        }
        self.trailers()
    }

    fn buffer(&mut self, buffer: BufferRef) -> Result<&mut Vec<u8>, Status> {
        if !self.phase()?.is_data() {
            return Err(Status::InvalidPhase);
        }
        self.buffers.get_mut(buffer).ok_or(Status::InternalFailure)
    }

    fn lookup(&self, lookup: Lookup, key: &str) -> Completion {
        if self.destroyed {
            return Completion::gone();
        }
        match lookup {
            Lookup::Metadata => {
                let empty = Map::new();
                let fields = self.dynamic_metadata.get(key).unwrap_or(&empty);
                match marshal::encode_struct(fields) {
                    Ok(bytes) => Completion::ok(bytes),
                    Err(_) => Completion::failed(Status::SerializationFailure),
                }
            }
            Lookup::FilterState => match self.filter_state.get(key) {
                Some((value, _)) => Completion::ok(value.as_bytes()),
                None => Completion::not_found(),
            },
            Lookup::Property => match self.properties.get(key) {
                Some(value) => Completion::ok(value.as_bytes()),
                None => Completion::not_found(),
            },
        }
    }
}

struct MetricSlot {
    config: HostConfig,
    kind: MetricKind,
    value: u64,
}

#[derive(Default)]
struct Metrics {
    slots: PrimaryMap<MetricId, MetricSlot>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The reference host.
pub struct LocalHost {
    config: LocalHostConfig,
    log_level: LogLevel,
    delay: Option<Duration>,
    requests: Mutex<PrimaryMap<RequestHandle, RequestState>>,
    host_configs: Mutex<PrimaryMap<HostConfig, ()>>,
    metrics: Mutex<Metrics>,
    parked: Mutex<Vec<Parked>>,
    active: Mutex<HashSet<RequestHandle>>,
    overlap: AtomicBool,
    late_calls: AtomicUsize,
}

/// Marks a request as inside a host critical section.
struct Active<'a> {
    host: &'a LocalHost,
    req: RequestHandle,
}

impl Drop for Active<'_> {
    fn drop(&mut self) {
        lock(&self.host.active).remove(&self.req);
    }
}

impl LocalHost {
    pub fn new(config: LocalHostConfig) -> Self {
        Self {
            config,
            log_level: LogLevel::default(),
            delay: None,
            requests: Mutex::new(PrimaryMap::new()),
            host_configs: Mutex::new(PrimaryMap::new()),
            metrics: Mutex::new(Metrics::default()),
            parked: Mutex::new(Vec::new()),
            active: Mutex::new(HashSet::new()),
            overlap: AtomicBool::new(false),
            late_calls: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.local_host().clone()).with_log_level(config.log_level())
    }

    pub fn with_log_level(self, log_level: LogLevel) -> Self {
        Self { log_level, ..self }
    }

    /// Sleep for `delay` inside every request critical section, to widen race windows.
    pub fn with_delay(self, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..self
        }
    }

    /// Whether two critical sections for the same request ever overlapped.
    pub fn overlap_detected(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }

    /// Request-scoped calls that arrived after the request was torn down.
    pub fn late_calls(&self) -> usize {
        self.late_calls.load(Ordering::SeqCst)
    }

    pub fn new_host_config(&self) -> HostConfig {
        lock(&self.host_configs).push(())
    }

    /// Start a request with the given request headers, seeded from the configuration.
    pub fn new_request(&self, headers: HeaderMap) -> RequestHandle {
        let state = RequestState {
            request_headers: headers,
            dynamic_metadata: self.config.dynamic_metadata.clone(),
            filter_state: self
                .config
                .filter_state
                .iter()
                .map(|(k, v)| (k.clone(), (v.clone(), StateType::Mutable)))
                .collect(),
            properties: self.config.properties.clone(),
            ..RequestState::default()
        };
        lock(&self.requests).push(state)
    }

    fn inspect<T>(
        &self,
        req: RequestHandle,
        f: impl FnOnce(&mut RequestState) -> T,
    ) -> Option<T> {
        lock(&self.requests).get_mut(req).map(f)
    }

    pub fn set_response_headers(&self, req: RequestHandle, headers: HeaderMap) {
        self.inspect(req, |s| s.response_headers = headers);
    }

    pub fn set_request_trailers(&self, req: RequestHandle, trailers: HeaderMap) {
        self.inspect(req, |s| s.request_trailers = trailers);
    }

    pub fn set_response_trailers(&self, req: RequestHandle, trailers: HeaderMap) {
        self.inspect(req, |s| s.response_trailers = trailers);
    }

    pub fn request_headers(&self, req: RequestHandle) -> HeaderMap {
        self.inspect(req, |s| s.request_headers.clone())
            .unwrap_or_default()
    }

    pub fn response_headers(&self, req: RequestHandle) -> HeaderMap {
        self.inspect(req, |s| s.response_headers.clone())
            .unwrap_or_default()
    }

    pub fn request_trailers(&self, req: RequestHandle) -> HeaderMap {
        self.inspect(req, |s| s.request_trailers.clone())
            .unwrap_or_default()
    }

    /// Contents of the most recent body chunk handed to the extension.
    pub fn last_buffer(&self, req: RequestHandle) -> Option<Vec<u8>> {
        self.inspect(req, |s| s.buffers.values().last().cloned())
            .flatten()
    }

    pub fn replies(&self, req: RequestHandle) -> Vec<Reply> {
        self.inspect(req, |s| s.replies.clone()).unwrap_or_default()
    }

    /// Statuses passed to `continue_request`, in order.
    pub fn continued(&self, req: RequestHandle) -> Vec<FilterStatus> {
        self.inspect(req, |s| s.continued.clone())
            .unwrap_or_default()
    }

    pub fn is_running(&self, req: RequestHandle) -> bool {
        self.inspect(req, |s| s.running).unwrap_or(false)
    }

    pub fn finalized(&self, req: RequestHandle) -> Option<FinalizeReason> {
        self.inspect(req, |s| s.finalized).flatten()
    }

    pub fn filter_state(&self, req: RequestHandle, key: &str) -> Option<String> {
        self.inspect(req, |s| s.filter_state.get(key).map(|(v, _)| v.clone()))
            .flatten()
    }

    pub fn dynamic_metadata(&self, req: RequestHandle, namespace: &str) -> Map<String, Value> {
        self.inspect(req, |s| s.dynamic_metadata.get(namespace).cloned())
            .flatten()
            .unwrap_or_default()
    }

    /// Current value of a metric, if the id was ever issued.
    pub fn metric_value(&self, metric: MetricId) -> Option<u64> {
        lock(&self.metrics).slots.get(metric).map(|m| m.value)
    }

    /// Number of metric definitions the host has been asked for.
    pub fn metric_definitions(&self) -> usize {
        lock(&self.metrics).slots.len()
    }

    /// Number of lookups waiting to be completed.
    pub fn parked(&self) -> usize {
        lock(&self.parked).len()
    }

    /// Resolve every parked lookup for `key` from the request's current state.
    ///
    /// Returns the number of suspended calls resumed.
    pub fn complete_deferred(&self, key: &str) -> usize {
        self.resolve(|p| p.key == key, None)
    }

    /// Resolve every parked lookup for `key` with an explicit result.
    pub fn complete_deferred_with(&self, key: &str, completion: Completion) -> usize {
        self.resolve(|p| p.key == key, Some(completion))
    }

    pub fn complete_all(&self) -> usize {
        self.resolve(|_| true, None)
    }

    fn resolve(&self, matches: impl Fn(&Parked) -> bool, completion: Option<Completion>) -> usize {
        let ready = {
            let mut parked = lock(&self.parked);
            let (ready, rest): (Vec<Parked>, Vec<Parked>) =
                parked.drain(..).partition(|p| matches(p));
            *parked = rest;
            ready
        };
        ready
            .into_iter()
            .map(|p| {
                let completion = match &completion {
                    Some(completion) => completion.clone(),
                    None => self
                        .inspect(p.req, |s| s.lookup(p.lookup, &p.key))
                        .unwrap_or_else(Completion::gone),
                };
                p.ticket.complete(completion)
            })
            .filter(|resumed| *resumed)
            .count()
    }

    fn park(&self, req: RequestHandle, key: &str, lookup: Lookup, ticket: YieldTicket) -> Status {
        tracing::debug!(%req, key, ?lookup, call = %ticket.call_id(), "deferring lookup");
        lock(&self.parked).push(Parked {
            req,
            key: key.to_owned(),
            lookup,
            ticket,
        });
        Status::Yield
    }

    /// Run one request-scoped host call, with the checks a proxy applies to calls from the
    /// extension.
    fn with_request<T>(
        &self,
        req: RequestHandle,
        f: impl FnOnce(&mut RequestState) -> Result<T, Status>,
    ) -> Result<T, Status> {
        let _active = self.enter(req);
        let mut requests = lock(&self.requests);
        let state = requests.get_mut(req).ok_or(Status::FilterIsGone)?;
        if state.destroyed {
            tracing::warn!(%req, "call after teardown");
            self.late_calls.fetch_add(1, Ordering::SeqCst);
            return Err(Status::FilterIsDestroyed);
        }
        if !state.in_call && !state.running {
            return Err(Status::NotInHost);
        }
        f(state)
    }

    fn enter(&self, req: RequestHandle) -> Active<'_> {
        if !lock(&self.active).insert(req) {
            tracing::error!(%req, "overlapping critical sections");
            self.overlap.store(true, Ordering::SeqCst);
        }
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        Active { host: self, req }
    }

    /// Invoke the extension for one phase, the way the proxy's filter chain would.
    fn invoke(
        &self,
        req: RequestHandle,
        phase: Phase,
        f: impl FnOnce() -> FilterStatus,
    ) -> FilterStatus {
        self.inspect(req, |s| {
            s.phase = Some(phase);
            s.in_call = true;
            s.early_continue = None;
        });
        let status = f();
        self.inspect(req, |s| {
            s.in_call = false;
            if status == FilterStatus::Running {
                match s.early_continue.take() {
                    Some(continued) => s.continued.push(continued),
                    None => s.running = true,
                }
            }
        });
        tracing::debug!(%req, %phase, ?status, "phase returned");
        status
    }

    fn header_sizes(&self, req: RequestHandle, trailers: bool, decode: bool) -> (usize, usize) {
        self.inspect(req, |s| {
            let map = match (trailers, decode) {
                (false, true) => &s.request_headers,
                (false, false) => &s.response_headers,
                (true, true) => &s.request_trailers,
                (true, false) => &s.response_trailers,
            };
            (map.pair_count(), map.byte_size())
        })
        .unwrap_or_default()
    }

    fn new_buffer(&self, req: RequestHandle, data: &[u8]) -> Option<BufferRef> {
        self.inspect(req, |s| s.buffers.push(data.to_vec()))
    }

    pub fn decode_headers<P: Plugin>(
        &self,
        bridge: &Bridge<P>,
        req: RequestHandle,
        config: ConfigId,
        end_stream: bool,
    ) -> FilterStatus {
        let (count, bytes) = self.header_sizes(req, false, true);
        self.invoke(req, Phase::DecodeHeaders, || {
            bridge.on_request_headers(req, config, end_stream, count, bytes)
        })
    }

    pub fn decode_data<P: Plugin>(
        &self,
        bridge: &Bridge<P>,
        req: RequestHandle,
        data: &[u8],
        end_stream: bool,
    ) -> FilterStatus {
        let Some(buffer) = self.new_buffer(req, data) else {
            return FilterStatus::Continue;
        };
        self.invoke(req, Phase::DecodeData, || {
            bridge.on_request_data(req, end_stream, buffer, data.len())
        })
    }

    pub fn decode_trailers<P: Plugin>(
        &self,
        bridge: &Bridge<P>,
        req: RequestHandle,
    ) -> FilterStatus {
        let (count, bytes) = self.header_sizes(req, true, true);
        self.invoke(req, Phase::DecodeTrailers, || {
            bridge.on_request_trailers(req, count, bytes)
        })
    }

    pub fn encode_headers<P: Plugin>(
        &self,
        bridge: &Bridge<P>,
        req: RequestHandle,
        config: ConfigId,
        end_stream: bool,
    ) -> FilterStatus {
        let (count, bytes) = self.header_sizes(req, false, false);
        self.invoke(req, Phase::EncodeHeaders, || {
            bridge.on_response_headers(req, config, end_stream, count, bytes)
        })
    }

    pub fn encode_data<P: Plugin>(
        &self,
        bridge: &Bridge<P>,
        req: RequestHandle,
        data: &[u8],
        end_stream: bool,
    ) -> FilterStatus {
        let Some(buffer) = self.new_buffer(req, data) else {
            return FilterStatus::Continue;
        };
        self.invoke(req, Phase::EncodeData, || {
            bridge.on_response_data(req, end_stream, buffer, data.len())
        })
    }

    pub fn encode_trailers<P: Plugin>(
        &self,
        bridge: &Bridge<P>,
        req: RequestHandle,
    ) -> FilterStatus {
        let (count, bytes) = self.header_sizes(req, true, false);
        self.invoke(req, Phase::EncodeTrailers, || {
            bridge.on_response_trailers(req, count, bytes)
        })
    }

    /// Tear the request down. Lookups still parked for it are dropped.
    pub fn destroy<P: Plugin>(
        &self,
        bridge: &Bridge<P>,
        req: RequestHandle,
        reason: DestroyReason,
    ) {
        bridge.on_destroy(req, reason);
        self.inspect(req, |s| {
            s.destroyed = true;
            s.running = false;
        });
        lock(&self.parked).retain(|p| p.req != req);
    }

    fn metric<T>(
        &self,
        config: HostConfig,
        metric: MetricId,
        f: impl FnOnce(&mut MetricSlot) -> Result<T, Status>,
    ) -> Result<T, Status> {
        let mut metrics = lock(&self.metrics);
        match metrics.slots.get_mut(metric) {
            Some(slot) if slot.config == config => f(slot),
            _ => Err(Status::InternalFailure),
        }
    }
}

impl Host for LocalHost {
    fn continue_request(&self, req: RequestHandle, status: FilterStatus) -> Result<(), Status> {
        self.with_request(req, |s| {
            if s.in_call {
                s.early_continue = Some(status);
            } else {
                s.running = false;
                s.continued.push(status);
            }
            Ok(())
        })
    }

    fn send_local_reply(&self, req: RequestHandle, reply: &LocalReply) -> Result<(), Status> {
        self.with_request(req, |s| {
            s.replies.push(Reply::Local(reply.clone()));
            s.running = false;
            Ok(())
        })
    }

    fn send_fault_reply(&self, req: RequestHandle, detail: &str) -> Result<(), Status> {
        self.with_request(req, |s| {
            s.replies.push(Reply::Fault(detail.to_owned()));
            s.running = false;
            Ok(())
        })
    }

    fn get_header(&self, req: RequestHandle, name: &str) -> Result<String, Status> {
        self.with_request(req, |s| {
            s.headers()?
                .get(name)
                .map(str::to_owned)
                .ok_or(Status::ValueNotFound)
        })
    }

    fn copy_headers(&self, req: RequestHandle, sink: &mut dyn HeaderSink) -> Result<(), Status> {
        self.with_request(req, |s| {
            marshal::write_headers(s.headers()?, sink).map_err(|e| {
                tracing::warn!(%req, "copy_headers: {e}");
                e.to_status()
            })
        })
    }

    fn set_header(
        &self,
        req: RequestHandle,
        name: &str,
        value: &str,
        action: HeaderAction,
    ) -> Result<(), Status> {
        self.with_request(req, |s| {
            let headers = s.mutable_headers()?;
            match action {
                HeaderAction::Set => headers.insert(name, value),
                HeaderAction::Add => headers.append(name, value),
            }
            Ok(())
        })
    }

    fn remove_header(&self, req: RequestHandle, name: &str) -> Result<(), Status> {
        self.with_request(req, |s| {
            s.mutable_headers()?.remove(name);
            Ok(())
        })
    }

    fn copy_trailers(&self, req: RequestHandle, sink: &mut dyn HeaderSink) -> Result<(), Status> {
        self.with_request(req, |s| {
            marshal::write_headers(s.trailers()?, sink).map_err(|e| {
                tracing::warn!(%req, "copy_trailers: {e}");
                e.to_status()
            })
        })
    }

    fn set_trailer(
        &self,
        req: RequestHandle,
        name: &str,
        value: &str,
        action: HeaderAction,
    ) -> Result<(), Status> {
        self.with_request(req, |s| {
            let trailers = s.mutable_trailers()?;
            match action {
                HeaderAction::Set => trailers.insert(name, value),
                HeaderAction::Add => trailers.append(name, value),
            }
            Ok(())
        })
    }

    fn remove_trailer(&self, req: RequestHandle, name: &str) -> Result<(), Status> {
        self.with_request(req, |s| {
            s.mutable_trailers()?.remove(name);
            Ok(())
        })
    }

    fn get_buffer(
        &self,
        req: RequestHandle,
        buffer: BufferRef,
        len: usize,
    ) -> Result<Bytes, Status> {
        self.with_request(req, |s| {
            let data = s.buffer(buffer)?;
            let len = len.min(data.len());
            Ok(Bytes::copy_from_slice(&data[..len]))
        })
    }

    fn set_buffer(
        &self,
        req: RequestHandle,
        buffer: BufferRef,
        data: &[u8],
        action: BufferAction,
    ) -> Result<(), Status> {
        self.with_request(req, |s| {
            let current = s.buffer(buffer)?;
            match action {
                BufferAction::Set => {
                    current.clear();
                    current.extend_from_slice(data);
                }
                BufferAction::Append => current.extend_from_slice(data),
                BufferAction::Prepend => {
                    current.splice(0..0, data.iter().copied());
                }
            }
            Ok(())
        })
    }

    fn drain_buffer(
        &self,
        req: RequestHandle,
        buffer: BufferRef,
        len: usize,
    ) -> Result<(), Status> {
        self.with_request(req, |s| {
            let current = s.buffer(buffer)?;
            let len = len.min(current.len());
            current.drain(..len);
            Ok(())
        })
    }

    fn get_string_value(
        &self,
        req: RequestHandle,
        value: WellKnownValue,
    ) -> Result<String, Status> {
        self.with_request(req, |_| {
            self.config
                .string_values
                .get(&value)
                .cloned()
                .ok_or(Status::ValueNotFound)
        })
    }

    fn get_integer_value(&self, req: RequestHandle, value: WellKnownValue) -> Result<u64, Status> {
        self.with_request(req, |_| {
            self.config
                .integer_values
                .get(&value)
                .copied()
                .ok_or(Status::ValueNotFound)
        })
    }

    fn get_dynamic_metadata(
        &self,
        req: RequestHandle,
        namespace: &str,
        ticket: YieldTicket,
    ) -> Result<Vec<u8>, Status> {
        self.with_request(req, |s| {
            if self.config.deferred.contains(namespace) {
                return Err(self.park(req, namespace, Lookup::Metadata, ticket));
            }
            s.lookup(Lookup::Metadata, namespace).into_result()
        })
    }

    fn set_dynamic_metadata(
        &self,
        req: RequestHandle,
        namespace: &str,
        key: &str,
        value: &[u8],
    ) -> Result<(), Status> {
        let value: Value =
            serde_json::from_slice(value).map_err(|_| Status::SerializationFailure)?;
        self.with_request(req, |s| {
            s.dynamic_metadata
                .entry(namespace.to_owned())
                .or_default()
                .insert(key.to_owned(), value);
            Ok(())
        })
    }

    fn get_filter_state(
        &self,
        req: RequestHandle,
        key: &str,
        ticket: YieldTicket,
    ) -> Result<String, Status> {
        self.with_request(req, |s| {
            if self.config.deferred.contains(key) {
                return Err(self.park(req, key, Lookup::FilterState, ticket));
            }
            s.filter_state
                .get(key)
                .map(|(value, _)| value.clone())
                .ok_or(Status::ValueNotFound)
        })
    }

    fn set_filter_state(
        &self,
        req: RequestHandle,
        key: &str,
        value: &str,
        state_type: StateType,
        life_span: LifeSpan,
        sharing: StreamSharing,
    ) -> Result<(), Status> {
        self.with_request(req, |s| {
            if s
                .filter_state
                .get(key)
                .is_some_and(|(_, existing)| *existing == StateType::ReadOnly)
            {
                tracing::debug!(%req, key, "refusing to overwrite read-only filter state");
                return Err(Status::InternalFailure);
            }
            tracing::trace!(%req, key, ?life_span, ?sharing, "set filter state");
            s.filter_state
                .insert(key.to_owned(), (value.to_owned(), state_type));
            Ok(())
        })
    }

    fn get_property(
        &self,
        req: RequestHandle,
        key: &str,
        ticket: YieldTicket,
    ) -> Result<String, Status> {
        self.with_request(req, |s| {
            if self.config.deferred.contains(key) {
                return Err(self.park(req, key, Lookup::Property, ticket));
            }
            s.properties.get(key).cloned().ok_or(Status::ValueNotFound)
        })
    }

    fn finalize(&self, req: RequestHandle, reason: FinalizeReason) -> Result<(), Status> {
        self.inspect(req, |s| s.finalized = Some(reason))
            .ok_or(Status::FilterIsGone)
    }

    fn log(&self, level: LogLevel, message: &str) -> Result<(), Status> {
        if level < self.log_level {
            return Ok(());
        }
        HostLogWriter::write_entry(level, message.as_bytes()).map_err(|e| {
            tracing::error!("could not write log entry: {e}");
            Status::InternalFailure
        })
    }

    fn log_level(&self) -> Result<LogLevel, Status> {
        Ok(self.log_level)
    }

    fn define_metric(
        &self,
        config: HostConfig,
        kind: MetricKind,
        name: &str,
    ) -> Result<MetricId, Status> {
        if lock(&self.host_configs).get(config).is_none() {
            return Err(Status::InternalFailure);
        }
        let id = lock(&self.metrics).slots.push(MetricSlot {
            config,
            kind,
            value: 0,
        });
        tracing::debug!(%config, %id, ?kind, name, "metric defined");
        Ok(id)
    }

    fn increment_metric(
        &self,
        config: HostConfig,
        metric: MetricId,
        offset: i64,
    ) -> Result<(), Status> {
        self.metric(config, metric, |slot| match slot.kind {
            MetricKind::Counter if offset >= 0 => {
                slot.value = slot.value.saturating_add(offset.unsigned_abs());
                Ok(())
            }
            MetricKind::Gauge => {
                slot.value = slot.value.saturating_add_signed(offset);
                Ok(())
            }
            _ => Err(Status::InternalFailure),
        })
    }

    fn get_metric(&self, config: HostConfig, metric: MetricId) -> Result<u64, Status> {
        self.metric(config, metric, |slot| Ok(slot.value))
    }

    fn record_metric(
        &self,
        config: HostConfig,
        metric: MetricId,
        value: u64,
    ) -> Result<(), Status> {
        self.metric(config, metric, |slot| match slot.kind {
            MetricKind::Gauge | MetricKind::Histogram => {
                slot.value = value;
                Ok(())
            }
            MetricKind::Counter => Err(Status::InternalFailure),
        })
    }
}
