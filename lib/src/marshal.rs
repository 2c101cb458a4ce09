//! Moving collections and structured values across the boundary.

use {
    crate::{error::Error, headers::HeaderMap},
    bytes::{Bytes, BytesMut},
    serde::Serialize,
    serde_json::{Map, Value},
    smallvec::SmallVec,
};

/// Header counts at or below this are staged without a heap allocation for the span table.
///
/// Most requests carry fewer headers than this. It should not be much larger, or every call pays
/// for stack space it rarely uses.
pub const INLINE_HEADER_CAPACITY: usize = 16;

const INLINE_HEADER_SPANS: usize = INLINE_HEADER_CAPACITY * 2;

/// A structured value as exchanged with the host: null, bool, number, string, list or map.
pub type StructuredValue = Value;

/// Where the host writes a header collection it is handing over.
pub trait HeaderSink {
    /// Write one raw name/value pair.
    fn push(&mut self, name: &[u8], value: &[u8]) -> Result<(), Error>;
}

#[derive(Clone, Copy, Debug)]
struct Span {
    start: usize,
    len: usize,
}

/// Staging area for a bulk header or trailer transfer.
///
/// The host reports the pair count and total byte size before writing anything. Spans are kept
/// inline for small collections and on the heap for larger ones; bytes go into a single
/// allocation sized to the reported total, so spans never move while the host is writing.
pub struct HeaderStaging {
    count: usize,
    byte_limit: usize,
    spans: SmallVec<[Span; INLINE_HEADER_SPANS]>,
    buf: BytesMut,
}

impl HeaderStaging {
    pub fn new(count: usize, bytes: usize) -> Self {
        let spans = if count <= INLINE_HEADER_CAPACITY {
            SmallVec::new()
        } else {
            SmallVec::with_capacity(count * 2)
        };
        Self {
            count,
            byte_limit: bytes,
            spans,
            buf: BytesMut::with_capacity(bytes),
        }
    }

    /// Whether the span table stayed in the inline area.
    pub fn is_inline(&self) -> bool {
        !self.spans.spilled()
    }

    pub fn written(&self) -> usize {
        self.spans.len() / 2
    }

    /// Rebuild the ordered multi-map from what the host wrote.
    ///
    /// The staged bytes are frozen first and only read through shared views, and each derived
    /// name and value is copied out before the staging memory is released.
    pub fn finish(self) -> Result<HeaderMap, Error> {
        if self.written() != self.count {
            tracing::warn!(
                reported = self.count,
                written = self.written(),
                "host wrote fewer headers than it reported"
            );
            return Err(Error::InternalFailure);
        }
        let staged: Bytes = self.buf.freeze();
        let mut map = HeaderMap::with_capacity(self.count);
        for pair in self.spans.chunks_exact(2) {
            let name = view(&staged, pair[0])?;
            let value = view(&staged, pair[1])?;
            map.append(name, value);
        }
        Ok(map)
    }

    fn push_span(&mut self, bytes: &[u8]) {
        self.spans.push(Span {
            start: self.buf.len(),
            len: bytes.len(),
        });
        self.buf.extend_from_slice(bytes);
    }
}

impl HeaderSink for HeaderStaging {
    fn push(&mut self, name: &[u8], value: &[u8]) -> Result<(), Error> {
        if self.written() >= self.count {
            return Err(Error::BufferLengthError {
                buf: "headers",
                len: "header_count",
            });
        }
        if self.buf.len() + name.len() + value.len() > self.byte_limit {
            return Err(Error::BufferLengthError {
                buf: "header bytes",
                len: "header_bytes",
            });
        }
        self.push_span(name);
        self.push_span(value);
        Ok(())
    }
}

fn view(staged: &Bytes, span: Span) -> Result<&str, Error> {
    Ok(std::str::from_utf8(
        &staged[span.start..span.start + span.len],
    )?)
}

/// Write an existing collection into a sink, in the order a host hands it over.
pub fn write_headers(map: &HeaderMap, sink: &mut dyn HeaderSink) -> Result<(), Error> {
    for (name, value) in map.pairs() {
        sink.push(name.as_bytes(), value.as_bytes())?;
    }
    Ok(())
}

/// Encode a structured value for the host.
pub fn encode_value(value: &StructuredValue) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(value).map_err(|e| {
        tracing::debug!("failed to encode structured value: {e}");
        Error::SerializationFailure
    })
}

/// Encode a map of structured values, as the host hands metadata back.
pub fn encode_struct(fields: &Map<String, Value>) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(fields).map_err(|_| Error::SerializationFailure)
}

/// Decode a map of structured values received from the host. An empty payload is an empty map.
pub fn decode_struct(bytes: &[u8]) -> Result<Map<String, Value>, Error> {
    if bytes.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_slice(bytes) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(_) => Err(Error::SerializationFailure),
        Err(e) => {
            tracing::debug!("failed to decode structured value: {e}");
            Err(Error::SerializationFailure)
        }
    }
}

/// Convert any serializable extension value into a [`StructuredValue`].
pub fn to_structured<T: Serialize + ?Sized>(value: &T) -> Result<StructuredValue, Error> {
    serde_json::to_value(value).map_err(|_| Error::SerializationFailure)
}
