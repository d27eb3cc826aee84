//! Application payloads carried by request and response frames.

use bytes::Bytes;
use std::fmt;

/// A unit of application data: a data slice plus optional metadata.
///
/// Both slices are reference-counted [`Bytes`], so cloning a payload never
/// copies the underlying buffers. A payload with `metadata == None` is
/// distinct on the wire from one with zero-length metadata.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Payload {
    data: Bytes,
    metadata: Option<Bytes>,
}

impl Payload {
    /// Create a payload from data and optional metadata.
    pub fn new(data: impl Into<Bytes>, metadata: Option<Bytes>) -> Self {
        Self { data: data.into(), metadata }
    }

    /// Create a data-only payload.
    pub fn from_data(data: impl Into<Bytes>) -> Self {
        Self { data: data.into(), metadata: None }
    }

    /// Create a metadata-only payload (used for metadata-push).
    pub fn from_metadata(metadata: impl Into<Bytes>) -> Self {
        Self { data: Bytes::new(), metadata: Some(metadata.into()) }
    }

    /// An empty payload: zero-length data, no metadata.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The data slice.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// The metadata slice, if present.
    pub fn metadata(&self) -> Option<&Bytes> {
        self.metadata.as_ref()
    }

    /// Whether metadata is present (zero-length metadata counts as present).
    pub fn has_metadata(&self) -> bool {
        self.metadata.is_some()
    }

    /// Data interpreted as UTF-8, if valid.
    pub fn data_utf8(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Total number of payload bytes (data + metadata).
    pub fn len(&self) -> usize {
        self.data.len() + self.metadata.as_ref().map_or(0, Bytes::len)
    }

    /// True when there is no data and no metadata.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.metadata.is_none()
    }

    /// Decompose into `(data, metadata)`.
    pub fn into_parts(self) -> (Bytes, Option<Bytes>) {
        (self.data, self.metadata)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("data_len", &self.data.len())
            .field("metadata_len", &self.metadata.as_ref().map(Bytes::len))
            .finish()
    }
}

impl From<&str> for Payload {
    fn from(data: &str) -> Self {
        Self::from_data(Bytes::copy_from_slice(data.as_bytes()))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Self::from_data(data)
    }
}
