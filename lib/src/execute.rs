//! Host entry points.

use {
    crate::{
        config::BridgeConfig,
        error::{Error, HandleError},
        fault,
        filter::{DataChunk, FilterStatus, Phase, Plugin, StreamFilter},
        handles::{BufferRef, ConfigId, HostConfig, RequestHandle},
        host::{DestroyReason, Host},
        logging::LogLevel,
        registry::{ConfigScope, ConfigStore},
        session::Request,
        status,
    },
    std::{
        collections::HashMap,
        panic::{self, AssertUnwindSafe},
        sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
    },
    tracing::{event, info_span, Level},
};

/// A live request and the filter instance created for it.
struct Slot<F> {
    request: Request,
    filter: Mutex<Option<F>>,
}

/// Execution context for one extension.
///
/// This is all of the state the host reaches through the bridge: the extension itself, its
/// parsed configurations, and the requests currently in flight. It is cheaply clonable, and
/// every clone refers to the same state.
pub struct Bridge<P: Plugin> {
    /// The host every boundary call goes to.
    host: Arc<dyn Host>,
    /// The extension.
    plugin: Arc<P>,
    /// Minimum level of extension log entries forwarded to the host.
    log_level: LogLevel,
    /// Parsed and merged configurations, by the id handed back to the host.
    configs: Arc<RwLock<ConfigStore<P::Config>>>,
    /// Requests the host has invoked the extension for and not yet destroyed.
    requests: Arc<Mutex<HashMap<RequestHandle, Arc<Slot<P::Filter>>>>>,
}

impl<P: Plugin> Clone for Bridge<P> {
    fn clone(&self) -> Self {
        Self {
            host: self.host.clone(),
            plugin: self.plugin.clone(),
            log_level: self.log_level,
            configs: self.configs.clone(),
            requests: self.requests.clone(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<P: Plugin> Bridge<P> {
    /// Create a new execution context for `plugin`, talking to `host`.
    pub fn new(host: Arc<dyn Host>, plugin: P) -> Self {
        Self {
            host,
            plugin: Arc::new(plugin),
            log_level: LogLevel::default(),
            configs: Arc::new(RwLock::new(ConfigStore::default())),
            requests: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Apply the bridge settings from an `isthmus.toml`.
    pub fn with_config(self, config: &BridgeConfig) -> Self {
        Self {
            log_level: config.log_level(),
            ..self
        }
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub fn plugin(&self) -> &P {
        &self.plugin
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    /// Forward a log entry that is not tied to any request.
    pub fn log(&self, level: LogLevel, message: &str) -> Result<(), Error> {
        if level < self.log_level {
            return Ok(());
        }
        status::check_unit("log", self.host.log(level, message))
    }

    /// Parse a configuration and return the id the host should use for it.
    pub fn new_config(&self, host_config: HostConfig, raw: &[u8]) -> Result<ConfigId, Error> {
        let mut scope = ConfigScope::new(self.host.clone(), host_config);
        let config = catch_config_panic("parse", || self.plugin.parse(raw, &mut scope))??;
        let id = self
            .configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(config);
        event!(Level::INFO, config = %id, %host_config, "parsed configuration");
        Ok(id)
    }

    /// Combine two configurations into a new one. Both stay valid.
    pub fn merge_config(&self, parent: ConfigId, child: ConfigId) -> Result<ConfigId, Error> {
        let (parent_config, child_config) = {
            let configs = self.configs.read().unwrap_or_else(PoisonError::into_inner);
            (configs.get(parent)?, configs.get(child)?)
        };
        let merged = catch_config_panic("merge", || {
            self.plugin.merge(&parent_config, &child_config)
        })?;
        let id = self
            .configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(merged);
        event!(Level::INFO, %parent, %child, merged = %id, "merged configuration");
        Ok(id)
    }

    /// Release a configuration. Requests already using it keep their reference.
    pub fn destroy_config(&self, id: ConfigId) -> Result<(), Error> {
        self.configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)?;
        event!(Level::DEBUG, config = %id, "destroyed configuration");
        Ok(())
    }

    /// Number of configurations not yet destroyed.
    pub fn config_count(&self) -> usize {
        self.configs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .live()
    }

    /// The extension's view of a request in flight, if the host has invoked it.
    pub fn request(&self, req: RequestHandle) -> Option<Request> {
        lock(&self.requests)
            .get(&req)
            .map(|slot| slot.request.clone())
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn on_request_headers(
        &self,
        req: RequestHandle,
        config: ConfigId,
        end_stream: bool,
        count: usize,
        bytes: usize,
    ) -> FilterStatus {
        self.run(req, Phase::DecodeHeaders, Some(config), |request, filter| {
            let headers = request.copy_headers(count, bytes)?;
            filter.decode_headers(&headers, end_stream)
        })
    }

    pub fn on_request_data(
        &self,
        req: RequestHandle,
        end_stream: bool,
        buffer: BufferRef,
        len: usize,
    ) -> FilterStatus {
        self.run(req, Phase::DecodeData, None, |request, filter| {
            let chunk = DataChunk::new(buffer, request.get_buffer(buffer, len)?);
            filter.decode_data(&chunk, end_stream)
        })
    }

    pub fn on_request_trailers(
        &self,
        req: RequestHandle,
        count: usize,
        bytes: usize,
    ) -> FilterStatus {
        self.run(req, Phase::DecodeTrailers, None, |request, filter| {
            let trailers = request.copy_trailers(count, bytes)?;
            filter.decode_trailers(&trailers)
        })
    }

    pub fn on_response_headers(
        &self,
        req: RequestHandle,
        config: ConfigId,
        end_stream: bool,
        count: usize,
        bytes: usize,
    ) -> FilterStatus {
        self.run(req, Phase::EncodeHeaders, Some(config), |request, filter| {
            let headers = request.copy_headers(count, bytes)?;
            filter.encode_headers(&headers, end_stream)
        })
    }

    pub fn on_response_data(
        &self,
        req: RequestHandle,
        end_stream: bool,
        buffer: BufferRef,
        len: usize,
    ) -> FilterStatus {
        self.run(req, Phase::EncodeData, None, |request, filter| {
            let chunk = DataChunk::new(buffer, request.get_buffer(buffer, len)?);
            filter.encode_data(&chunk, end_stream)
        })
    }

    pub fn on_response_trailers(
        &self,
        req: RequestHandle,
        count: usize,
        bytes: usize,
    ) -> FilterStatus {
        self.run(req, Phase::EncodeTrailers, None, |request, filter| {
            let trailers = request.copy_trailers(count, bytes)?;
            filter.encode_trailers(&trailers)
        })
    }

    /// The host tore the request down.
    ///
    /// The filter hears about it first, then every suspended call resumes with a dead-context
    /// result, and from then on every boundary call on the request aborts without reaching the
    /// host.
    pub fn on_destroy(&self, req: RequestHandle, reason: DestroyReason) {
        let span = info_span!("request", id = %req);
        let _enter = span.enter();

        let Some(slot) = lock(&self.requests).remove(&req) else {
            event!(Level::DEBUG, ?reason, "destroy for a request never seen");
            return;
        };
        let notified = panic::catch_unwind(AssertUnwindSafe(|| {
            if let Some(filter) = lock(&slot.filter).as_mut() {
                filter.on_destroy(reason);
            }
        }));
        if let Err(payload) = notified {
            event!(
                Level::ERROR,
                "extension panicked in on_destroy: {}",
                fault::panic_message(&*payload)
            );
        }
        let cancelled = slot.request.destroy();
        event!(Level::DEBUG, ?reason, cancelled, "request destroyed");
    }

    fn slot(&self, req: RequestHandle) -> Arc<Slot<P::Filter>> {
        lock(&self.requests)
            .entry(req)
            .or_insert_with(|| {
                Arc::new(Slot {
                    request: Request::new(req, self.host.clone(), self.log_level),
                    filter: Mutex::new(None),
                })
            })
            .clone()
    }

    /// Run one phase callback under the fault translator.
    ///
    /// The filter instance is created on the first entry that names a configuration.
    fn run<F>(
        &self,
        req: RequestHandle,
        phase: Phase,
        config: Option<ConfigId>,
        f: F,
    ) -> FilterStatus
    where
        F: FnOnce(&Request, &mut P::Filter) -> Result<FilterStatus, Error>,
    {
        let span = info_span!("request", id = %req, %phase);
        let _enter = span.enter();

        let slot = self.slot(req);
        let request = &slot.request;
        if fault::flush_deferred(request) {
            return FilterStatus::LocalReply;
        }

        let status = fault::guard(request, phase, || {
            let mut filter = lock(&slot.filter);
            let filter = match &mut *filter {
                Some(filter) => filter,
                empty => {
                    let id = config.ok_or(HandleError::UnknownRequest(req))?;
                    let config = self
                        .configs
                        .read()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get(id)?;
                    empty.insert(self.plugin.create_filter(config, request.clone()))
                }
            };
            f(request, filter)
        });
        event!(Level::DEBUG, ?status, "phase finished");
        status
    }
}

/// Run configuration code from the extension without letting a panic reach the host.
fn catch_config_panic<T>(what: &str, f: impl FnOnce() -> T) -> Result<T, Error> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let message = fault::panic_message(&*payload);
        event!(Level::ERROR, "extension panicked in config {what}: {message}");
        Error::Other(anyhow::anyhow!("config {what} panicked: {message}"))
    })
}
