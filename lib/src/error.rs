//! Error types.

use {
    crate::{
        handles::{ConfigId, RequestHandle},
        status::Status,
    },
    std::fmt,
};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The request context is unusable and the current extension invocation must stop.
    ///
    /// Boundary calls return this for the fatal statuses. It is meant to be propagated with `?`
    /// up to the entry point, where the fault translator turns it into a terminating reply.
    #[error(transparent)]
    Abort(#[from] Abort),

    /// The host failed to carry out a call.
    #[error("Internal failure in the host")]
    InternalFailure,

    /// A value could not be encoded or decoded across the boundary.
    #[error("Serialization failure")]
    SerializationFailure,

    /// Thrown when the host writes more into a staging area than it reported up front.
    #[error("Buffer length error: {buf} too long to fit in {len}")]
    BufferLengthError {
        buf: &'static str,
        len: &'static str,
    },

    #[error(transparent)]
    HandleError(#[from] HandleError),

    /// Error when an invalid argument is supplied to a boundary call.
    #[error("Invalid argument given")]
    InvalidArgument,

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("Unknown status code: {0}")]
    UnknownStatusCode(i32),

    #[error{"Expected UTF-8"}]
    Utf8Expected(#[from] std::str::Utf8Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether this error must abort the current extension invocation, rather than being
    /// handled by the extension.
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::Abort(_))
    }

    /// The abort details, if this is an abort.
    pub fn as_abort(&self) -> Option<&Abort> {
        match self {
            Error::Abort(abort) => Some(abort),
            _ => None,
        }
    }

    /// Convert to a status code suitable for passing across the boundary.
    pub fn to_status(&self) -> Status {
        match self {
            Error::Abort(abort) => abort.status(),
            Error::SerializationFailure | Error::Json(_) | Error::Utf8Expected(_) => {
                Status::SerializationFailure
            }
            Error::HandleError(HandleError::UnknownRequest(_)) => Status::FilterIsGone,
            // All other errors map to a generic internal failure.
            Error::InternalFailure
            | Error::BufferLengthError { .. }
            | Error::HandleError(_)
            | Error::InvalidArgument
            | Error::UnknownStatusCode(_)
            | Error::Other(_) => Status::InternalFailure,
        }
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(e: std::string::FromUtf8Error) -> Self {
        Error::Utf8Expected(e.utf8_error())
    }
}

/// A fatal status observed by a boundary call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Abort {
    call: &'static str,
    status: Status,
}

impl Abort {
    /// Create an abort for the given boundary call.
    ///
    /// `status` is one of the fatal statuses, except for calls where any failure is a
    /// programming error, such as the metric calls.
    pub fn new(call: &'static str, status: Status) -> Self {
        Self { call, status }
    }

    /// The name of the boundary call that observed the fatal status.
    pub fn call(&self) -> &'static str {
        self.call
    }

    pub fn status(&self) -> Status {
        self.status
    }
}

impl fmt::Display for Abort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} aborted: {}", self.call, self.status)
    }
}

impl std::error::Error for Abort {}

/// Errors thrown due to an invalid handle of some kind.
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    /// A request handle was not known to the bridge.
    #[error("Invalid request handle: {0}")]
    UnknownRequest(RequestHandle),

    /// A config id was not valid.
    #[error("Invalid config handle: {0}")]
    InvalidConfigHandle(ConfigId),
}

/// Errors that can occur while parsing an `isthmus.toml` file.
#[derive(Debug, thiserror::Error)]
pub enum BridgeConfigError {
    /// An I/O error that occurred while reading the file.
    #[error("error reading '{path}': {err}")]
    IoError {
        path: String,
        #[source]
        err: std::io::Error,
    },

    /// An error that occurred while deserializing the file.
    ///
    /// This represents errors caused by syntactically invalid TOML data, missing fields, etc.
    #[error("error parsing `isthmus.toml`: {0}")]
    InvalidToml(#[from] toml::de::Error),

    #[error("could not re-encode the plugin config table: {0}")]
    PluginConfigEncoding(#[from] toml::ser::Error),

    #[error("'{0}' is not a valid log level")]
    InvalidLogLevel(String),

    #[error("invalid configuration for local host '{section}': {err}")]
    InvalidLocalHostDefinition {
        section: &'static str,
        #[source]
        err: LocalHostConfigError,
    },
}

/// Errors that may occur while validating the `[local_host]` seed tables.
#[derive(Debug, thiserror::Error)]
pub enum LocalHostConfigError {
    #[error("definition was not provided as a TOML table")]
    InvalidEntryType,

    #[error("'deferred' must be a list of strings")]
    InvalidDeferredList,

    #[error("unrecognized key '{0}'")]
    UnrecognizedKey(String),

    #[error("value for '{0}' was not a string")]
    InvalidStringEntry(String),

    #[error("value for '{0}' was not a non-negative integer")]
    InvalidIntegerEntry(String),

    #[error("unknown well-known value '{0}'")]
    UnknownWellKnownValue(String),

    #[error("could not convert metadata for '{key}' to a structured value: {err}")]
    InvalidMetadata {
        key: String,
        #[source]
        err: serde_json::Error,
    },
}
