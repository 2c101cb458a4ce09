//! The status protocol shared by every boundary call.

use {
    crate::error::{Abort, Error},
    std::fmt,
};

/// Result code returned by a boundary call.
///
/// This is a closed set: the host never produces any other value, and [`Status::from_code`]
/// rejects anything it does not recognize.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(i32)]
pub enum Status {
    /// Success; any output has been populated.
    Ok = 0,
    /// The requested value does not exist. A negative lookup, not an error.
    ValueNotFound = 1,
    /// The host failed to carry out the call.
    InternalFailure = 2,
    /// A value could not be encoded or decoded across the boundary.
    SerializationFailure = 3,
    /// The result is not ready yet; the caller must suspend until the host completes it.
    Yield = 4,
    /// The request has already finished on the host side.
    FilterIsGone = -1,
    /// The filter instance has been destroyed on the host side.
    FilterIsDestroyed = -2,
    /// The call was made while the host was not expecting any call from the extension.
    NotInHost = -3,
    /// The call is not permitted in the current pipeline phase.
    InvalidPhase = -4,
}

/// Broad category of a [`Status`], which decides how a call site handles it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusClass {
    Success,
    NotFound,
    /// A data-level failure, surfaced to extension code as an [`Error`].
    Recoverable,
    Pending,
    /// The request context is unusable; the current invocation must abort.
    Fatal,
}

impl Status {
    /// Decode a raw status code received from the host.
    pub fn from_code(code: i32) -> Result<Self, Error> {
        let status = match code {
            0 => Self::Ok,
            1 => Self::ValueNotFound,
            2 => Self::InternalFailure,
            3 => Self::SerializationFailure,
            4 => Self::Yield,
            -1 => Self::FilterIsGone,
            -2 => Self::FilterIsDestroyed,
            -3 => Self::NotInHost,
            -4 => Self::InvalidPhase,
            other => return Err(Error::UnknownStatusCode(other)),
        };
        Ok(status)
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn class(self) -> StatusClass {
        match self {
            Self::Ok => StatusClass::Success,
            Self::ValueNotFound => StatusClass::NotFound,
            Self::InternalFailure | Self::SerializationFailure => StatusClass::Recoverable,
            Self::Yield => StatusClass::Pending,
            Self::FilterIsGone | Self::FilterIsDestroyed | Self::NotInHost | Self::InvalidPhase => {
                StatusClass::Fatal
            }
        }
    }

    pub fn is_fatal(self) -> bool {
        self.class() == StatusClass::Fatal
    }

    /// Whether the request context behind this status can no longer receive anything,
    /// including a fault reply.
    pub fn is_context_dead(self) -> bool {
        matches!(self, Self::FilterIsGone | Self::FilterIsDestroyed)
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::ValueNotFound => "value not found",
            Self::InternalFailure => "internal failure",
            Self::SerializationFailure => "serialization failure",
            Self::Yield => "yield",
            Self::FilterIsGone => "request is finished",
            Self::FilterIsDestroyed => "filter has been destroyed",
            Self::NotInHost => "host is not expecting a call from the extension",
            Self::InvalidPhase => "invalid phase, maybe headers/buffer already continued",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interpret the outcome of a host call that cannot yield.
///
/// `ValueNotFound` becomes `Ok(None)`, data-level failures become recoverable errors, and the
/// fatal statuses become [`Error::Abort`], naming `call` so the fault reply can say which
/// boundary call observed the dead context. A `Yield` here means the host broke the protocol.
pub fn check<T>(call: &'static str, res: Result<T, Status>) -> Result<Option<T>, Error> {
    match res {
        Ok(value) => Ok(Some(value)),
        Err(status) => match status.class() {
            StatusClass::Success => Err(Error::InternalFailure),
            StatusClass::NotFound => Ok(None),
            StatusClass::Recoverable => Err(recoverable(status)),
            StatusClass::Pending => {
                tracing::warn!(call, "host yielded on a call that cannot suspend");
                Err(Error::InternalFailure)
            }
            StatusClass::Fatal => Err(Abort::new(call, status).into()),
        },
    }
}

/// Like [`check`], for calls whose result must be present.
pub fn check_present<T>(call: &'static str, res: Result<T, Status>) -> Result<T, Error> {
    check(call, res)?.ok_or(Error::InternalFailure)
}

/// Like [`check`], for calls that produce no output.
pub fn check_unit(call: &'static str, res: Result<(), Status>) -> Result<(), Error> {
    check(call, res).map(drop)
}

pub(crate) fn recoverable(status: Status) -> Error {
    match status {
        Status::SerializationFailure => Error::SerializationFailure,
        _ => Error::InternalFailure,
    }
}
