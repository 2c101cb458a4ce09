//! Request sessions.
//!
//! A [`Request`] is the extension's view of one host-owned request: the opaque handle, its
//! liveness, the lock that serializes host critical sections, and the outstanding yields.

mod suspend;

pub use suspend::{Completion, YieldTicket};

use {
    self::suspend::Suspender,
    crate::{
        error::{Abort, Error},
        fault::{self, FAULT_MARKER},
        filter::FilterStatus,
        handles::{BufferRef, RequestHandle},
        headers::HeaderMap,
        host::{
            BufferAction, FinalizeReason, HeaderAction, Host, LifeSpan, LocalReply, StateType,
            StreamSharing, WellKnownValue,
        },
        logging::LogLevel,
        marshal::{self, HeaderStaging},
        status::{self, Status},
    },
    bytes::Bytes,
    serde::Serialize,
    serde_json::{Map, Value},
    std::{
        fmt,
        future::Future,
        sync::{
            atomic::{AtomicBool, AtomicU8, Ordering},
            Arc, Mutex, MutexGuard, PoisonError,
        },
    },
    tokio::task::JoinHandle,
    tracing_futures::Instrument,
};

/// Whether the host side of a request can still be reached.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Liveness {
    Live = 0,
    /// The host reported the request as finished.
    Gone = 1,
    /// The host tore the request down.
    Destroyed = 2,
}

impl Liveness {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Live,
            1 => Self::Gone,
            _ => Self::Destroyed,
        }
    }
}

/// Fields the extension may touch outside the host's own call. Guarded by the request lock.
#[derive(Default)]
pub(crate) struct RequestShared {
    string_value: String,
    deferred_fault: Option<String>,
}

struct RequestInner {
    handle: RequestHandle,
    host: Arc<dyn Host>,
    liveness: AtomicU8,
    state: Mutex<RequestShared>,
    suspender: Suspender,
    replied: AtomicBool,
    finalized: AtomicBool,
    min_log_level: LogLevel,
}

/// A single request, as seen from extension code.
///
/// Cloning is cheap; every clone refers to the same request. Clones may be moved into
/// background tasks, and all of them observe teardown.
#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

impl Request {
    pub(crate) fn new(handle: RequestHandle, host: Arc<dyn Host>, min_log_level: LogLevel) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                handle,
                host,
                liveness: AtomicU8::new(Liveness::Live as u8),
                state: Mutex::new(RequestShared::default()),
                suspender: Suspender::default(),
                replied: AtomicBool::new(false),
                finalized: AtomicBool::new(false),
                min_log_level,
            }),
        }
    }

    pub fn handle(&self) -> RequestHandle {
        self.inner.handle
    }

    pub fn liveness(&self) -> Liveness {
        Liveness::from_u8(self.inner.liveness.load(Ordering::Acquire))
    }

    /// Number of boundary calls currently suspended on the host.
    pub fn pending_calls(&self) -> usize {
        self.inner.suspender.pending()
    }

    /// Whether a fault reply has already been sent for this request.
    pub fn fault_replied(&self) -> bool {
        self.inner.replied.load(Ordering::Acquire)
    }

    /// Take the request lock. A lock poisoned by a panicking holder is recovered; the shared
    /// fields are caches and bookkeeping that stay valid across an unwind.
    pub(crate) fn lock(&self) -> MutexGuard<'_, RequestShared> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn mark(&self, liveness: Liveness) {
        let _ = self.inner.liveness.compare_exchange(
            Liveness::Live as u8,
            liveness as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Refuse calls on a request the host has invalidated. Must be called with the request lock
    /// held, so teardown cannot slip in between the check and the host call.
    fn ensure_live(&self, call: &'static str) -> Result<(), Error> {
        match self.liveness() {
            Liveness::Live => Ok(()),
            Liveness::Gone => Err(Abort::new(call, Status::FilterIsGone).into()),
            Liveness::Destroyed => Err(Abort::new(call, Status::FilterIsDestroyed).into()),
        }
    }

    fn checked<T>(&self, call: &'static str, res: Result<T, Status>) -> Result<Option<T>, Error> {
        match res {
            Err(Status::FilterIsGone) => self.mark(Liveness::Gone),
            Err(Status::FilterIsDestroyed) => self.mark(Liveness::Destroyed),
            _ => {}
        }
        status::check(call, res)
    }

    /// Run one host call inside the request's critical section.
    fn call<T>(
        &self,
        call: &'static str,
        f: impl FnOnce(&dyn Host, RequestHandle) -> Result<T, Status>,
    ) -> Result<Option<T>, Error> {
        let res = {
            let _guard = self.lock();
            self.ensure_live(call)?;
            f(&*self.inner.host, self.inner.handle)
        };
        self.checked(call, res)
    }

    /// Run a host call that may answer [`Status::Yield`], suspending until it is completed.
    ///
    /// The lock is released while suspended, and taken again before the delivered result is
    /// read, so other tasks on the same request can make progress in between.
    async fn call_suspendable<T>(
        &self,
        call: &'static str,
        f: impl FnOnce(&dyn Host, RequestHandle, YieldTicket) -> Result<T, Status>,
        resume: impl FnOnce(Vec<u8>) -> Result<T, Error>,
    ) -> Result<Option<T>, Error> {
        let (ticket, suspension) = self.inner.suspender.prepare();
        let res = {
            let _guard = self.lock();
            self.ensure_live(call)?;
            f(&*self.inner.host, self.inner.handle, ticket)
        };
        if !matches!(res, Err(Status::Yield)) {
            drop(suspension);
            return self.checked(call, res);
        }

        let completion = suspension.wait().await;
        let _guard = self.lock();
        match self.checked(call, completion.into_result())? {
            Some(bytes) => resume(bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Hand control back to the host after the extension returned [`FilterStatus::Running`].
    pub fn continue_with(&self, status: FilterStatus) -> Result<(), Error> {
        self.call("continue", |host, req| host.continue_request(req, status))
            .map(drop)
    }

    pub fn send_local_reply(&self, reply: &LocalReply) -> Result<(), Error> {
        self.call("send_local_reply", |host, req| host.send_local_reply(req, reply))
            .map(drop)
    }

    /// Terminate the request with a fault reply carrying [`FAULT_MARKER`].
    ///
    /// At most one fault reply is ever sent per request, and none once the request is gone.
    /// Returns whether this call sent it. If the host is not expecting a call, the reply is kept
    /// and sent on the next entry. Failures are logged, never returned.
    pub fn send_fault_reply(&self, detail: &str) -> bool {
        let message = format!("{FAULT_MARKER}: {detail}");
        let res = {
            let _guard = self.lock();
            if self.liveness() != Liveness::Live {
                tracing::debug!(
                    request = %self.handle(),
                    "not replying to a dead request: {detail}"
                );
                return false;
            }
            if self.inner.replied.swap(true, Ordering::AcqRel) {
                tracing::debug!(
                    request = %self.handle(),
                    "fault reply already sent: {detail}"
                );
                return false;
            }
            self.inner.host.send_fault_reply(self.inner.handle, &message)
        };
        match res {
            Ok(()) => true,
            Err(Status::NotInHost) => {
                self.inner.replied.store(false, Ordering::Release);
                tracing::warn!(
                    request = %self.handle(),
                    "host not expecting a call; fault reply deferred"
                );
                self.defer_fault(detail.to_owned());
                false
            }
            Err(status) => {
                let _ = self.checked("send_fault_reply", Err::<(), _>(status));
                tracing::error!(request = %self.handle(), "could not send fault reply: {status}");
                false
            }
        }
    }

    pub fn get_header(&self, name: &str) -> Result<Option<String>, Error> {
        self.call("get_header", |host, req| host.get_header(req, name))
    }

    pub fn set_header(&self, name: &str, value: &str, action: HeaderAction) -> Result<(), Error> {
        self.call("set_header", |host, req| {
            host.set_header(req, name, value, action)
        })
        .map(drop)
    }

    pub fn remove_header(&self, name: &str) -> Result<(), Error> {
        self.call("remove_header", |host, req| host.remove_header(req, name))
            .map(drop)
    }

    /// Copy the current phase's headers out of the host. `count` and `bytes` are the sizes the
    /// host reported when it invoked the phase.
    pub fn copy_headers(&self, count: usize, bytes: usize) -> Result<HeaderMap, Error> {
        let mut staging = HeaderStaging::new(count, bytes);
        self.call("copy_headers", |host, req| {
            host.copy_headers(req, &mut staging)
        })?
        .ok_or(Error::InternalFailure)?;
        staging.finish()
    }

    pub fn set_trailer(&self, name: &str, value: &str, action: HeaderAction) -> Result<(), Error> {
        self.call("set_trailer", |host, req| {
            host.set_trailer(req, name, value, action)
        })
        .map(drop)
    }

    pub fn remove_trailer(&self, name: &str) -> Result<(), Error> {
        self.call("remove_trailer", |host, req| host.remove_trailer(req, name))
            .map(drop)
    }

    pub fn copy_trailers(&self, count: usize, bytes: usize) -> Result<HeaderMap, Error> {
        let mut staging = HeaderStaging::new(count, bytes);
        self.call("copy_trailers", |host, req| {
            host.copy_trailers(req, &mut staging)
        })?
        .ok_or(Error::InternalFailure)?;
        staging.finish()
    }

    /// Copy up to `len` bytes out of a host buffer.
    pub fn get_buffer(&self, buffer: BufferRef, len: usize) -> Result<Bytes, Error> {
        Ok(self
            .call("get_buffer", |host, req| host.get_buffer(req, buffer, len))?
            .unwrap_or_default())
    }

    pub fn set_buffer(
        &self,
        buffer: BufferRef,
        data: &[u8],
        action: BufferAction,
    ) -> Result<(), Error> {
        self.call("set_buffer", |host, req| {
            host.set_buffer(req, buffer, data, action)
        })
        .map(drop)
    }

    /// Drop the first `len` bytes of a host buffer.
    pub fn drain_buffer(&self, buffer: BufferRef, len: usize) -> Result<(), Error> {
        self.call("drain_buffer", |host, req| {
            host.drain_buffer(req, buffer, len)
        })
        .map(drop)
    }

    pub fn get_string_value(&self, value: WellKnownValue) -> Result<Option<String>, Error> {
        const CALL: &str = "get_string_value";
        let mut state = self.lock();
        self.ensure_live(CALL)?;
        let res = self.inner.host.get_string_value(self.inner.handle, value);
        match self.checked(CALL, res)? {
            Some(s) => {
                state.string_value = s;
                Ok(Some(state.string_value.clone()))
            }
            None => Ok(None),
        }
    }

    pub fn get_integer_value(&self, value: WellKnownValue) -> Result<Option<u64>, Error> {
        self.call("get_integer_value", |host, req| {
            host.get_integer_value(req, value)
        })
    }

    /// Every field under `namespace`. A namespace the host does not know is an empty map.
    pub async fn get_dynamic_metadata(&self, namespace: &str) -> Result<Map<String, Value>, Error> {
        let encoded = self
            .call_suspendable(
                "get_dynamic_metadata",
                |host, req, ticket| host.get_dynamic_metadata(req, namespace, ticket),
                Ok,
            )
            .await?;
        match encoded {
            Some(bytes) => marshal::decode_struct(&bytes),
            None => Ok(Map::new()),
        }
    }

    /// Store `value` under `namespace` and `key`. Anything serializable is accepted and
    /// converted to a structured value first.
    pub fn set_dynamic_metadata<T>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
    ) -> Result<(), Error>
    where
        T: Serialize + ?Sized,
    {
        let encoded = marshal::encode_value(&marshal::to_structured(value)?)?;
        self.call("set_dynamic_metadata", |host, req| {
            host.set_dynamic_metadata(req, namespace, key, &encoded)
        })
        .map(drop)
    }

    pub async fn get_filter_state(&self, key: &str) -> Result<Option<String>, Error> {
        self.call_suspendable(
            "get_filter_state",
            |host, req, ticket| host.get_filter_state(req, key, ticket),
            |bytes| Ok(String::from_utf8(bytes)?),
        )
        .await
    }

    pub fn set_filter_state(
        &self,
        key: &str,
        value: &str,
        state_type: StateType,
        life_span: LifeSpan,
        sharing: StreamSharing,
    ) -> Result<(), Error> {
        self.call("set_filter_state", |host, req| {
            host.set_filter_state(req, key, value, state_type, life_span, sharing)
        })
        .map(drop)
    }

    pub async fn get_property(&self, key: &str) -> Result<Option<String>, Error> {
        self.call_suspendable(
            "get_property",
            |host, req, ticket| host.get_property(req, key, ticket),
            |bytes| Ok(String::from_utf8(bytes)?),
        )
        .await
    }

    /// Forward a log entry to the host, if it is at or above the bridge's configured level.
    pub fn log(&self, level: LogLevel, message: &str) -> Result<(), Error> {
        if level < self.inner.min_log_level {
            return Ok(());
        }
        status::check_unit("log", self.inner.host.log(level, message))
    }

    pub fn log_level(&self) -> Result<LogLevel, Error> {
        status::check_present("log_level", self.inner.host.log_level())
    }

    /// Tell the host the extension holds no more references to this request.
    ///
    /// Only the first call reaches the host. Dropping the last clone of a request finalizes it
    /// automatically.
    pub fn finalize(&self, reason: FinalizeReason) {
        self.inner.finalize(reason);
    }

    /// Run `task` in the background after a phase callback returned [`FilterStatus::Running`].
    ///
    /// The status the task resolves to is passed to the host with [`Request::continue_with`].
    /// Panics and errors in the task become a fault reply, as for phase callbacks.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<FilterStatus, Error>> + Send + 'static,
    {
        // The phase that spawned the task has usually returned by the time it runs.
        let span =
            tracing::info_span!(parent: None, "request", id = %self.handle(), phase = "background");
        tokio::spawn(fault::guard_async(self.clone(), task).instrument(span))
    }

    pub(crate) fn defer_fault(&self, detail: String) {
        let mut state = self.lock();
        if state.deferred_fault.is_none() {
            state.deferred_fault = Some(detail);
        }
    }

    pub(crate) fn take_deferred_fault(&self) -> Option<String> {
        self.lock().deferred_fault.take()
    }

    /// Mark the request destroyed and resume every suspended call with a dead-context result.
    pub(crate) fn destroy(&self) -> usize {
        {
            let _guard = self.lock();
            self.inner
                .liveness
                .store(Liveness::Destroyed as u8, Ordering::Release);
        }
        self.inner.suspender.cancel_all()
    }
}

impl RequestInner {
    fn finalize(&self, reason: FinalizeReason) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(status) = self.host.finalize(self.handle, reason) {
            tracing::debug!(request = %self.handle, "finalize failed: {status}");
        }
    }
}

impl Drop for RequestInner {
    fn drop(&mut self) {
        let reason = match Liveness::from_u8(*self.liveness.get_mut()) {
            Liveness::Live => FinalizeReason::Dropped,
            Liveness::Gone | Liveness::Destroyed => FinalizeReason::Normal,
        };
        self.finalize(reason);
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("handle", &self.inner.handle)
            .field("liveness", &self.liveness())
            .finish()
    }
}
