//! What an extension implements.

use {
    crate::{
        error::Error, handles::BufferRef, headers::HeaderMap, host::DestroyReason,
        registry::ConfigScope, session::Request,
    },
    bytes::Bytes,
    std::{fmt, ops::Deref, sync::Arc},
};

/// What the extension tells the host to do after a phase callback.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u32)]
pub enum FilterStatus {
    /// A background task owns the request now, and will call `continue_with` when it is done.
    Running = 0,
    /// A reply was sent; the request is finished.
    LocalReply = 1,
    Continue = 2,
    StopAndBuffer = 3,
    StopAndBufferWatermark = 4,
    StopNoBuffer = 5,
}

impl FilterStatus {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::Running,
            1 => Self::LocalReply,
            2 => Self::Continue,
            3 => Self::StopAndBuffer,
            4 => Self::StopAndBufferWatermark,
            5 => Self::StopNoBuffer,
            _ => return None,
        })
    }
}

/// A pipeline phase in which the host invokes the extension.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Phase {
    DecodeHeaders,
    DecodeData,
    DecodeTrailers,
    EncodeHeaders,
    EncodeData,
    EncodeTrailers,
}

impl Phase {
    pub fn is_decode(self) -> bool {
        matches!(
            self,
            Self::DecodeHeaders | Self::DecodeData | Self::DecodeTrailers
        )
    }

    pub fn is_headers(self) -> bool {
        matches!(self, Self::DecodeHeaders | Self::EncodeHeaders)
    }

    pub fn is_data(self) -> bool {
        matches!(self, Self::DecodeData | Self::EncodeData)
    }

    pub fn is_trailers(self) -> bool {
        matches!(self, Self::DecodeTrailers | Self::EncodeTrailers)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DecodeHeaders => "decode_headers",
            Self::DecodeData => "decode_data",
            Self::DecodeTrailers => "decode_trailers",
            Self::EncodeHeaders => "encode_headers",
            Self::EncodeData => "encode_data",
            Self::EncodeTrailers => "encode_trailers",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A body chunk handed to a data callback: a copy of the bytes, plus the host buffer they came
/// from so the extension can rewrite it through the request.
#[derive(Clone, Debug)]
pub struct DataChunk {
    buffer: BufferRef,
    bytes: Bytes,
}

impl DataChunk {
    pub(crate) fn new(buffer: BufferRef, bytes: Bytes) -> Self {
        Self { buffer, bytes }
    }

    pub fn buffer(&self) -> BufferRef {
        self.buffer
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }
}

impl Deref for DataChunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

/// Per-request extension logic. Every callback defaults to continuing.
#[allow(unused_variables)]
pub trait StreamFilter: Send + 'static {
    fn decode_headers(
        &mut self,
        headers: &HeaderMap,
        end_stream: bool,
    ) -> Result<FilterStatus, Error> {
        Ok(FilterStatus::Continue)
    }

    fn decode_data(&mut self, data: &DataChunk, end_stream: bool) -> Result<FilterStatus, Error> {
        Ok(FilterStatus::Continue)
    }

    fn decode_trailers(&mut self, trailers: &HeaderMap) -> Result<FilterStatus, Error> {
        Ok(FilterStatus::Continue)
    }

    fn encode_headers(
        &mut self,
        headers: &HeaderMap,
        end_stream: bool,
    ) -> Result<FilterStatus, Error> {
        Ok(FilterStatus::Continue)
    }

    fn encode_data(&mut self, data: &DataChunk, end_stream: bool) -> Result<FilterStatus, Error> {
        Ok(FilterStatus::Continue)
    }

    fn encode_trailers(&mut self, trailers: &HeaderMap) -> Result<FilterStatus, Error> {
        Ok(FilterStatus::Continue)
    }

    /// The host tore the request down. Boundary calls on the request fail from now on.
    fn on_destroy(&mut self, reason: DestroyReason) {}
}

/// An extension: parses its configuration once, then creates a filter per request.
pub trait Plugin: Send + Sync + 'static {
    type Config: Send + Sync + 'static;
    type Filter: StreamFilter;

    /// Parse the raw configuration bytes. Metrics are defined here, through `scope`.
    fn parse(&self, raw: &[u8], scope: &mut ConfigScope) -> Result<Self::Config, Error>;

    /// Combine a parent configuration with a more specific child.
    fn merge(&self, parent: &Self::Config, child: &Self::Config) -> Self::Config;

    fn create_filter(&self, config: Arc<Self::Config>, request: Request) -> Self::Filter;
}
