//! Frame model and binary codec.
//!
//! A [`Frame`] is the atomic wire unit: a 31-bit stream id, a type, a
//! 10-bit flag field, and a type-specific body. Stream 0 is reserved for
//! connection-level frames (SETUP, KEEPALIVE, LEASE, ERROR, METADATA_PUSH).

use crate::{error::FrameError, payload::Payload};
use bytes::Bytes;
use std::time::Duration;

mod codec;
mod io;

pub use codec::{FrameCodec, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};
pub use io::{read_frame, write_frame};

/// Largest legal stream id (31 bits).
pub const MAX_STREAM_ID: u32 = 0x7fff_ffff;

/// Largest legal request-n credit (31 bits). A request for this value is
/// treated as unbounded demand.
pub const MAX_REQUEST_N: u32 = 0x7fff_ffff;

/// Protocol version carried in SETUP. This implementation speaks 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    /// Major version.
    pub major: u16,
    /// Minor version.
    pub minor: u16,
}

impl Version {
    /// Version 1.0.
    pub const V1: Self = Self { major: 1, minor: 0 };
}

/// Frame type discriminant, encoded in the upper 6 bits of the
/// type-and-flags word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// First frame of a connection.
    Setup = 0x01,
    /// Grant of new-stream permits.
    Lease = 0x02,
    /// Liveness heartbeat.
    Keepalive = 0x03,
    /// Single request, single response.
    RequestResponse = 0x04,
    /// Single request, no response.
    RequestFnf = 0x05,
    /// Single request, stream of responses.
    RequestStream = 0x06,
    /// Bi-directional stream.
    RequestChannel = 0x07,
    /// Additional demand for an open stream.
    RequestN = 0x08,
    /// Cancel an open stream.
    Cancel = 0x09,
    /// Data frame on an open stream.
    Payload = 0x0a,
    /// Stream or connection error.
    Error = 0x0b,
    /// Connection-level metadata, no response.
    MetadataPush = 0x0c,
    /// Session resumption (recognized, not supported).
    Resume = 0x0d,
    /// Session resumption ack (recognized, not supported).
    ResumeOk = 0x0e,
    /// Extension frame.
    Ext = 0x3f,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0x01 => Ok(Self::Setup),
            0x02 => Ok(Self::Lease),
            0x03 => Ok(Self::Keepalive),
            0x04 => Ok(Self::RequestResponse),
            0x05 => Ok(Self::RequestFnf),
            0x06 => Ok(Self::RequestStream),
            0x07 => Ok(Self::RequestChannel),
            0x08 => Ok(Self::RequestN),
            0x09 => Ok(Self::Cancel),
            0x0a => Ok(Self::Payload),
            0x0b => Ok(Self::Error),
            0x0c => Ok(Self::MetadataPush),
            0x0d => Ok(Self::Resume),
            0x0e => Ok(Self::ResumeOk),
            0x3f => Ok(Self::Ext),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// Flag bits within the 10-bit flag field. METADATA and IGNORE are shared
/// across frame types; the remaining bits are type-specific.
pub(crate) mod flags {
    /// Frame may be dropped if not understood.
    pub const IGNORE: u16 = 0x200;
    /// Metadata (with 24-bit length prefix) follows the fixed fields.
    pub const METADATA: u16 = 0x100;
    /// More fragments follow (fragmentation is an out-of-core transform).
    pub const FOLLOWS: u16 = 0x080;
    /// KEEPALIVE: the receiver must echo.
    pub const RESPOND: u16 = 0x080;
    /// SETUP: client will honor LEASE frames.
    pub const LEASE: u16 = 0x040;
    /// SETUP: client requests resumption.
    pub const RESUME: u16 = 0x080;
    /// PAYLOAD / REQUEST_CHANNEL: stream is complete.
    pub const COMPLETE: u16 = 0x040;
    /// PAYLOAD: frame carries data.
    pub const NEXT: u16 = 0x020;
}

/// Contents of a SETUP frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Setup {
    /// Declared protocol version.
    pub version: Version,
    /// How often the sender will emit KEEPALIVE frames.
    pub keepalive_interval: Duration,
    /// Maximum silence the sender will tolerate before declaring the
    /// connection dead.
    pub max_lifetime: Duration,
    /// The sender intends to honor LEASE admission control.
    pub lease: bool,
    /// Opaque resumption token. Never produced by this implementation;
    /// carried so an acceptor can reject it frame-accurately.
    pub resume_token: Option<Bytes>,
    /// MIME type for metadata on this connection.
    pub metadata_mime_type: String,
    /// MIME type for data on this connection.
    pub data_mime_type: String,
    /// Payload handed to the acceptor alongside the connection.
    pub payload: Payload,
}

/// Type-specific frame contents.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    /// SETUP: first frame of a connection.
    Setup(Box<Setup>),
    /// LEASE: permits valid for `ttl` from receipt.
    Lease {
        /// Validity window.
        ttl: Duration,
        /// Number of new streams the receiver may initiate.
        number_of_requests: u32,
        /// Optional lease metadata.
        metadata: Option<Bytes>,
    },
    /// KEEPALIVE: heartbeat, optionally demanding an echo.
    Keepalive {
        /// True when the receiver must echo this frame.
        respond: bool,
        /// Count of frames the sender has received on this connection.
        last_received_position: u64,
        /// Opaque payload echoed back verbatim.
        data: Bytes,
    },
    /// REQUEST_RESPONSE: expect exactly one PAYLOAD in return.
    RequestResponse {
        /// Request payload.
        payload: Payload,
    },
    /// REQUEST_FNF: no response will ever arrive.
    RequestFnf {
        /// Request payload.
        payload: Payload,
    },
    /// REQUEST_STREAM: expect up to `initial_request_n` PAYLOAD frames
    /// before further REQUEST_N credit.
    RequestStream {
        /// Initial credit; zero is invalid.
        initial_request_n: u32,
        /// Request payload.
        payload: Payload,
    },
    /// REQUEST_CHANNEL: bi-directional; carries the first upstream element.
    RequestChannel {
        /// Initial credit for the responder's output; zero is invalid.
        initial_request_n: u32,
        /// The requester's upstream is already complete.
        complete: bool,
        /// First upstream payload.
        payload: Payload,
    },
    /// REQUEST_N: additional credit for an open stream.
    RequestN {
        /// Credit to add; zero is invalid.
        n: u32,
    },
    /// CANCEL: stop the stream, no further frames wanted.
    Cancel,
    /// PAYLOAD: data and/or terminal marker for an open stream.
    Payload {
        /// More fragments follow (carried, not interpreted by the core).
        follows: bool,
        /// Terminal marker: the stream is complete.
        complete: bool,
        /// The frame carries a payload element.
        next: bool,
        /// Payload element (empty when `next` is unset).
        payload: Payload,
    },
    /// ERROR: stream error, or connection error on stream 0.
    Error {
        /// Wire error code (see [`crate::error::codes`]).
        code: u32,
        /// UTF-8 error message.
        message: String,
    },
    /// METADATA_PUSH: connection-level metadata on stream 0.
    MetadataPush {
        /// Pushed metadata.
        metadata: Bytes,
    },
    /// RESUME: recognized so it can be rejected; never sent.
    Resume {
        /// Raw frame body after the header.
        body: Bytes,
    },
    /// RESUME_OK: recognized so it can be rejected; never sent.
    ResumeOk {
        /// Raw frame body after the header.
        body: Bytes,
    },
    /// EXT: extension frame.
    Ext {
        /// Frame may be dropped silently when not understood.
        ignore: bool,
        /// Extension type discriminant.
        extended_type: u32,
        /// Raw extension body.
        body: Bytes,
    },
}

/// A complete frame: stream id plus typed body.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// 31-bit stream id; 0 for connection-level frames.
    pub stream_id: u32,
    /// Type-specific contents.
    pub body: FrameBody,
}

impl Frame {
    /// SETUP on stream 0.
    pub fn setup(setup: Setup) -> Self {
        Self { stream_id: 0, body: FrameBody::Setup(Box::new(setup)) }
    }

    /// LEASE on stream 0.
    pub fn lease(ttl: Duration, number_of_requests: u32, metadata: Option<Bytes>) -> Self {
        Self { stream_id: 0, body: FrameBody::Lease { ttl, number_of_requests, metadata } }
    }

    /// KEEPALIVE on stream 0.
    pub fn keepalive(respond: bool, last_received_position: u64, data: Bytes) -> Self {
        Self { stream_id: 0, body: FrameBody::Keepalive { respond, last_received_position, data } }
    }

    /// REQUEST_RESPONSE for a new stream.
    pub fn request_response(stream_id: u32, payload: Payload) -> Self {
        Self { stream_id, body: FrameBody::RequestResponse { payload } }
    }

    /// REQUEST_FNF for a new stream.
    pub fn request_fnf(stream_id: u32, payload: Payload) -> Self {
        Self { stream_id, body: FrameBody::RequestFnf { payload } }
    }

    /// REQUEST_STREAM for a new stream.
    pub fn request_stream(stream_id: u32, initial_request_n: u32, payload: Payload) -> Self {
        Self { stream_id, body: FrameBody::RequestStream { initial_request_n, payload } }
    }

    /// REQUEST_CHANNEL for a new stream.
    pub fn request_channel(
        stream_id: u32,
        initial_request_n: u32,
        complete: bool,
        payload: Payload,
    ) -> Self {
        Self { stream_id, body: FrameBody::RequestChannel { initial_request_n, complete, payload } }
    }

    /// REQUEST_N credit for an open stream.
    pub fn request_n(stream_id: u32, n: u32) -> Self {
        Self { stream_id, body: FrameBody::RequestN { n } }
    }

    /// CANCEL for an open stream.
    pub fn cancel(stream_id: u32) -> Self {
        Self { stream_id, body: FrameBody::Cancel }
    }

    /// PAYLOAD carrying one element.
    pub fn payload_next(stream_id: u32, payload: Payload) -> Self {
        Self {
            stream_id,
            body: FrameBody::Payload { follows: false, complete: false, next: true, payload },
        }
    }

    /// PAYLOAD carrying the final element.
    pub fn payload_next_complete(stream_id: u32, payload: Payload) -> Self {
        Self {
            stream_id,
            body: FrameBody::Payload { follows: false, complete: true, next: true, payload },
        }
    }

    /// PAYLOAD carrying only the terminal marker.
    pub fn payload_complete(stream_id: u32) -> Self {
        Self {
            stream_id,
            body: FrameBody::Payload {
                follows: false,
                complete: true,
                next: false,
                payload: Payload::empty(),
            },
        }
    }

    /// ERROR with an explicit code and message.
    pub fn error(stream_id: u32, code: u32, message: impl Into<String>) -> Self {
        Self { stream_id, body: FrameBody::Error { code, message: message.into() } }
    }

    /// METADATA_PUSH on stream 0.
    pub fn metadata_push(metadata: Bytes) -> Self {
        Self { stream_id: 0, body: FrameBody::MetadataPush { metadata } }
    }

    /// The type discriminant for this frame.
    pub fn frame_type(&self) -> FrameType {
        match &self.body {
            FrameBody::Setup(_) => FrameType::Setup,
            FrameBody::Lease { .. } => FrameType::Lease,
            FrameBody::Keepalive { .. } => FrameType::Keepalive,
            FrameBody::RequestResponse { .. } => FrameType::RequestResponse,
            FrameBody::RequestFnf { .. } => FrameType::RequestFnf,
            FrameBody::RequestStream { .. } => FrameType::RequestStream,
            FrameBody::RequestChannel { .. } => FrameType::RequestChannel,
            FrameBody::RequestN { .. } => FrameType::RequestN,
            FrameBody::Cancel => FrameType::Cancel,
            FrameBody::Payload { .. } => FrameType::Payload,
            FrameBody::Error { .. } => FrameType::Error,
            FrameBody::MetadataPush { .. } => FrameType::MetadataPush,
            FrameBody::Resume { .. } => FrameType::Resume,
            FrameBody::ResumeOk { .. } => FrameType::ResumeOk,
            FrameBody::Ext { .. } => FrameType::Ext,
        }
    }

    /// Whether this frame takes the prioritized lane of the outbound
    /// queue: KEEPALIVE, LEASE, ERROR, and CANCEL jump ahead of buffered
    /// data frames.
    pub fn is_control(&self) -> bool {
        matches!(
            self.body,
            FrameBody::Keepalive { .. }
                | FrameBody::Lease { .. }
                | FrameBody::Error { .. }
                | FrameBody::Cancel
        )
    }

    /// Whether this frame opens a new stream.
    pub fn is_request(&self) -> bool {
        matches!(
            self.body,
            FrameBody::RequestResponse { .. }
                | FrameBody::RequestFnf { .. }
                | FrameBody::RequestStream { .. }
                | FrameBody::RequestChannel { .. }
        )
    }
}
