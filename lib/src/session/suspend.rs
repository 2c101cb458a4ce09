//! Suspending boundary calls until the host completes them.

use {
    crate::{handles::CallId, status::Status},
    cranelift_entity::EntityRef,
    std::{
        collections::HashMap,
        fmt,
        sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    },
    tokio::sync::oneshot,
};

/// The outcome the host delivers to a suspended call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Completion(Result<Vec<u8>, Status>);

impl Completion {
    /// The call succeeded with `value`, in the same encoding the synchronous path would return.
    pub fn ok(value: impl Into<Vec<u8>>) -> Self {
        Self(Ok(value.into()))
    }

    pub fn not_found() -> Self {
        Self(Err(Status::ValueNotFound))
    }

    /// The call finished with a non-success status.
    pub fn failed(status: Status) -> Self {
        debug_assert!(
            !matches!(status, Status::Ok | Status::Yield),
            "{status:?} cannot complete a suspended call"
        );
        Self(Err(status))
    }

    /// The request went away while the call was suspended.
    pub fn gone() -> Self {
        Self(Err(Status::FilterIsGone))
    }

    pub fn into_result(self) -> Result<Vec<u8>, Status> {
        self.0
    }
}

#[derive(Default)]
struct Waiters {
    next: u32,
    pending: HashMap<CallId, oneshot::Sender<Completion>>,
    closed: bool,
}

fn lock(waiters: &Mutex<Waiters>) -> MutexGuard<'_, Waiters> {
    waiters.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bookkeeping for a request's outstanding yields.
///
/// Completions are matched to callers by [`CallId`], so any number of calls may be suspended at
/// once and the host may complete them in any order.
#[derive(Default)]
pub(crate) struct Suspender {
    waiters: Arc<Mutex<Waiters>>,
}

impl Suspender {
    /// Register a call that may yield, before handing its ticket to the host.
    pub(crate) fn prepare(&self) -> (YieldTicket, Suspension) {
        let (sender, receiver) = oneshot::channel();
        let mut waiters = lock(&self.waiters);
        let call = CallId::new(waiters.next as usize);
        waiters.next += 1;
        if waiters.closed {
            // Torn down already; the caller resumes immediately and observes the dead context.
            let _ = sender.send(Completion::gone());
        } else {
            waiters.pending.insert(call, sender);
        }
        drop(waiters);

        let ticket = YieldTicket {
            call,
            waiters: Arc::downgrade(&self.waiters),
        };
        let suspension = Suspension {
            call,
            receiver,
            waiters: self.waiters.clone(),
        };
        (ticket, suspension)
    }

    /// Number of calls issued but not yet completed.
    pub(crate) fn pending(&self) -> usize {
        lock(&self.waiters).pending.len()
    }

    /// Resume every outstanding call with [`Completion::gone`] and refuse any new ones.
    pub(crate) fn cancel_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut waiters = lock(&self.waiters);
            waiters.closed = true;
            waiters.pending.drain().collect()
        };
        let count = drained.len();
        for (call, sender) in drained {
            tracing::debug!(%call, "cancelling suspended call");
            let _ = sender.send(Completion::gone());
        }
        count
    }
}

/// The extension side of a call that may be suspended.
pub(crate) struct Suspension {
    call: CallId,
    receiver: oneshot::Receiver<Completion>,
    waiters: Arc<Mutex<Waiters>>,
}

impl Suspension {
    /// Wait until the host completes or cancels the call.
    pub(crate) async fn wait(mut self) -> Completion {
        tracing::trace!(call = %self.call, "suspended");
        match (&mut self.receiver).await {
            Ok(completion) => completion,
            Err(_) => Completion::gone(),
        }
    }
}

/// A suspension dropped before it resumed (the host answered synchronously, or the caller gave
/// up waiting) stops counting as pending, and its ticket becomes stale.
impl Drop for Suspension {
    fn drop(&mut self) {
        lock(&self.waiters).pending.remove(&self.call);
    }
}

/// The host's handle on a suspended call.
///
/// A ticket resumes its call at most once. It does not keep the request alive; completing a
/// ticket whose request is gone does nothing.
#[derive(Clone)]
pub struct YieldTicket {
    call: CallId,
    waiters: Weak<Mutex<Waiters>>,
}

impl YieldTicket {
    pub fn call_id(&self) -> CallId {
        self.call
    }

    /// Deliver the result of the suspended call and resume its caller.
    ///
    /// Returns `false`, without touching any other call, if this ticket was already completed
    /// or cancelled.
    pub fn complete(&self, completion: Completion) -> bool {
        let Some(waiters) = self.waiters.upgrade() else {
            return false;
        };
        let sender = lock(&waiters).pending.remove(&self.call);
        match sender {
            Some(sender) => {
                tracing::trace!(call = %self.call, "resumed");
                sender.send(completion).is_ok()
            }
            None => {
                tracing::debug!(call = %self.call, "ignoring duplicate completion");
                false
            }
        }
    }

    /// Resume the call as if the request had gone away.
    pub fn cancel(&self) -> bool {
        self.complete(Completion::gone())
    }
}

impl fmt::Debug for YieldTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("YieldTicket").field(&self.call).finish()
    }
}
