//! Turning extension panics and aborts into a single fault reply.
//!
//! Nothing raised by extension code crosses into the host. Every entry point runs its phase
//! callback through [`guard`], and background tasks run through [`guard_async`].

use {
    crate::{
        error::Error,
        filter::{FilterStatus, Phase},
        session::Request,
        status::Status,
    },
    futures::FutureExt,
    std::{
        any::Any,
        future::Future,
        panic::{self, AssertUnwindSafe},
    },
};

/// Fixed marker at the start of every fault reply, so hosts and clients can tell a fault apart
/// from a reply the extension chose to send.
pub const FAULT_MARKER: &str = "extension_panic";

/// Where a failure surfaced. Only background tasks can run while the host is not expecting a
/// call, so only they defer their fault reply.
#[derive(Clone, Copy, Debug)]
enum Site {
    Phase(Phase),
    Background,
}

impl Site {
    fn as_str(self) -> &'static str {
        match self {
            Site::Phase(phase) => phase.as_str(),
            Site::Background => "background task",
        }
    }
}

/// Run a phase callback, converting a panic or an unhandled error into a fault reply.
pub(crate) fn guard<F>(request: &Request, phase: Phase, f: F) -> FilterStatus
where
    F: FnOnce() -> Result<FilterStatus, Error>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => {
            on_error(request, Site::Phase(phase), err);
            FilterStatus::LocalReply
        }
        Err(payload) => {
            on_panic(request, Site::Phase(phase), payload);
            FilterStatus::LocalReply
        }
    }
}

/// Drive a background task to completion, then hand its final status to the host.
pub(crate) async fn guard_async<F>(request: Request, task: F)
where
    F: Future<Output = Result<FilterStatus, Error>>,
{
    let result = match AssertUnwindSafe(task).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => return on_panic(&request, Site::Background, payload),
    };
    let result = result.and_then(|status| match status {
        FilterStatus::LocalReply => Ok(()),
        FilterStatus::Running => {
            tracing::warn!(
                request = %request.handle(),
                "background task finished while still running"
            );
            Ok(())
        }
        status => request.continue_with(status),
    });
    if let Err(err) = result {
        on_error(&request, Site::Background, err);
    }
}

/// Send a fault reply deferred by an earlier background failure. Returns whether one was sent.
pub(crate) fn flush_deferred(request: &Request) -> bool {
    match request.take_deferred_fault() {
        Some(detail) => request.send_fault_reply(&detail),
        None => false,
    }
}

fn on_error(request: &Request, site: Site, err: Error) {
    let handle = request.handle();
    match err.as_abort().map(|abort| abort.status()) {
        Some(status) if status.is_context_dead() => {
            tracing::info!(request = %handle, site = site.as_str(), "{err}; no reply sent");
        }
        Some(Status::NotInHost) if matches!(site, Site::Background) => {
            tracing::warn!(request = %handle, "{err}; replying on the next entry");
            request.defer_fault(err.to_string());
        }
        _ => {
            tracing::error!(request = %handle, site = site.as_str(), "{err}");
            request.send_fault_reply(&format!("{}: {err}", site.as_str()));
        }
    }
}

fn on_panic(request: &Request, site: Site, payload: Box<dyn Any + Send>) {
    let message = panic_message(&*payload);
    tracing::error!(
        request = %request.handle(),
        site = site.as_str(),
        "extension panicked: {message}"
    );
    request.send_fault_reply(&format!("{}: {message}", site.as_str()));
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}
