//! Binary encode/decode between [`Frame`] values and byte buffers.
//!
//! Header layout (big-endian): 4 bytes stream id (high bit reserved 0),
//! then 2 bytes holding `(type << 10) | flags`. Metadata, when the
//! METADATA flag is set, is preceded by a 3-byte big-endian length so a
//! zero-length metadata slice stays distinguishable from absent metadata.
//! Data always fills the remainder of the frame.

use super::{flags, Frame, FrameBody, FrameType, Setup, Version, MAX_REQUEST_N, MAX_STREAM_ID};
use crate::{error::FrameError, payload::Payload};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;

/// Frame header size: stream id + type-and-flags word.
pub const HEADER_SIZE: usize = 6;

/// Largest metadata slice expressible with the 24-bit length prefix.
const MAX_METADATA_LEN: usize = (1 << 24) - 1;

/// Default inbound frame size limit (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Codec for whole frames over a boundary-preserving transport.
///
/// The codec is stateless apart from the inbound size limit, which is
/// enforced before any allocation happens for a frame.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    /// Create a codec with the given inbound frame size limit.
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// The configured inbound frame size limit.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a frame into `dst`.
    pub fn encode(&self, frame: &Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.stream_id > MAX_STREAM_ID {
            return Err(FrameError::InvalidStreamId);
        }
        dst.put_u32(frame.stream_id);

        let flag_bits = frame_flags(&frame.body)?;
        dst.put_u16(((frame.frame_type() as u16) << 10) | flag_bits);

        match &frame.body {
            FrameBody::Setup(setup) => {
                dst.put_u16(setup.version.major);
                dst.put_u16(setup.version.minor);
                dst.put_u32(duration_millis(setup.keepalive_interval));
                dst.put_u32(duration_millis(setup.max_lifetime));
                if let Some(token) = &setup.resume_token {
                    dst.put_u16(token.len() as u16);
                    dst.put_slice(token);
                }
                put_mime(dst, &setup.metadata_mime_type);
                put_mime(dst, &setup.data_mime_type);
                put_payload(dst, &setup.payload)?;
            }
            FrameBody::Lease { ttl, number_of_requests, metadata } => {
                dst.put_u32(duration_millis(*ttl));
                dst.put_u32(*number_of_requests);
                put_metadata(dst, metadata.as_ref())?;
            }
            FrameBody::Keepalive { last_received_position, data, .. } => {
                dst.put_u64(*last_received_position);
                dst.put_slice(data);
            }
            FrameBody::RequestResponse { payload } | FrameBody::RequestFnf { payload } => {
                put_payload(dst, payload)?;
            }
            FrameBody::RequestStream { initial_request_n, payload }
            | FrameBody::RequestChannel { initial_request_n, payload, .. } => {
                check_request_n(*initial_request_n)?;
                dst.put_u32(*initial_request_n);
                put_payload(dst, payload)?;
            }
            FrameBody::RequestN { n } => {
                check_request_n(*n)?;
                dst.put_u32(*n);
            }
            FrameBody::Cancel => {}
            FrameBody::Payload { payload, .. } => {
                put_payload(dst, payload)?;
            }
            FrameBody::Error { code, message } => {
                dst.put_u32(*code);
                dst.put_slice(message.as_bytes());
            }
            FrameBody::MetadataPush { metadata } => {
                put_metadata(dst, Some(metadata))?;
            }
            FrameBody::Resume { body } | FrameBody::ResumeOk { body } => {
                dst.put_slice(body);
            }
            FrameBody::Ext { extended_type, body, .. } => {
                dst.put_u32(*extended_type);
                dst.put_slice(body);
            }
        }
        Ok(())
    }

    /// Encode a frame into a freshly allocated buffer.
    pub fn encode_to_bytes(&self, frame: &Frame) -> Result<Bytes, FrameError> {
        let mut dst = BytesMut::with_capacity(HEADER_SIZE + 64);
        self.encode(frame, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Decode one complete frame from `buf`.
    ///
    /// The buffer must hold exactly one frame; the surrounding transport
    /// is responsible for preserving frame boundaries.
    pub fn decode(&self, mut buf: Bytes) -> Result<Frame, FrameError> {
        if buf.len() > self.max_frame_size {
            return Err(FrameError::TooLarge { size: buf.len(), max: self.max_frame_size });
        }
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::Truncated { needed: HEADER_SIZE, have: buf.len() });
        }

        let stream_id = buf.get_u32();
        if stream_id > MAX_STREAM_ID {
            return Err(FrameError::InvalidStreamId);
        }
        let word = buf.get_u16();
        let frame_type = FrameType::try_from((word >> 10) as u8)?;
        let flag_bits = word & 0x03ff;
        let has_metadata = flag_bits & flags::METADATA != 0;

        let body = match frame_type {
            FrameType::Setup => decode_setup(flag_bits, buf)?,
            FrameType::Lease => {
                need(&buf, 8)?;
                let ttl = Duration::from_millis(u64::from(buf.get_u32()));
                let number_of_requests = buf.get_u32();
                let metadata = get_metadata(has_metadata, &mut buf)?;
                FrameBody::Lease { ttl, number_of_requests, metadata }
            }
            FrameType::Keepalive => {
                need(&buf, 8)?;
                let last_received_position = buf.get_u64();
                FrameBody::Keepalive {
                    respond: flag_bits & flags::RESPOND != 0,
                    last_received_position,
                    data: buf,
                }
            }
            FrameType::RequestResponse => {
                FrameBody::RequestResponse { payload: get_payload(has_metadata, buf)? }
            }
            FrameType::RequestFnf => {
                FrameBody::RequestFnf { payload: get_payload(has_metadata, buf)? }
            }
            FrameType::RequestStream => {
                need(&buf, 4)?;
                let initial_request_n = buf.get_u32();
                check_request_n(initial_request_n)?;
                FrameBody::RequestStream {
                    initial_request_n,
                    payload: get_payload(has_metadata, buf)?,
                }
            }
            FrameType::RequestChannel => {
                need(&buf, 4)?;
                let initial_request_n = buf.get_u32();
                check_request_n(initial_request_n)?;
                FrameBody::RequestChannel {
                    initial_request_n,
                    complete: flag_bits & flags::COMPLETE != 0,
                    payload: get_payload(has_metadata, buf)?,
                }
            }
            FrameType::RequestN => {
                need(&buf, 4)?;
                let n = buf.get_u32();
                check_request_n(n)?;
                FrameBody::RequestN { n }
            }
            FrameType::Cancel => FrameBody::Cancel,
            FrameType::Payload => FrameBody::Payload {
                follows: flag_bits & flags::FOLLOWS != 0,
                complete: flag_bits & flags::COMPLETE != 0,
                next: flag_bits & flags::NEXT != 0,
                payload: get_payload(has_metadata, buf)?,
            },
            FrameType::Error => {
                need(&buf, 4)?;
                let code = buf.get_u32();
                let message = String::from_utf8_lossy(&buf).into_owned();
                FrameBody::Error { code, message }
            }
            FrameType::MetadataPush => {
                let metadata = get_metadata(true, &mut buf)?.unwrap_or_else(Bytes::new);
                FrameBody::MetadataPush { metadata }
            }
            FrameType::Resume => FrameBody::Resume { body: buf },
            FrameType::ResumeOk => FrameBody::ResumeOk { body: buf },
            FrameType::Ext => {
                need(&buf, 4)?;
                let extended_type = buf.get_u32();
                FrameBody::Ext {
                    ignore: flag_bits & flags::IGNORE != 0,
                    extended_type,
                    body: buf,
                }
            }
        };

        Ok(Frame { stream_id, body })
    }
}

/// Compute the flag word for a frame body.
fn frame_flags(body: &FrameBody) -> Result<u16, FrameError> {
    Ok(match body {
        FrameBody::Setup(setup) => {
            let mut bits = 0;
            if setup.payload.has_metadata() {
                bits |= flags::METADATA;
            }
            if setup.lease {
                bits |= flags::LEASE;
            }
            if setup.resume_token.is_some() {
                bits |= flags::RESUME;
            }
            bits
        }
        FrameBody::Lease { metadata, .. } => {
            if metadata.is_some() {
                flags::METADATA
            } else {
                0
            }
        }
        FrameBody::Keepalive { respond, .. } => {
            if *respond {
                flags::RESPOND
            } else {
                0
            }
        }
        FrameBody::RequestResponse { payload }
        | FrameBody::RequestFnf { payload }
        | FrameBody::RequestStream { payload, .. } => metadata_bit(payload),
        FrameBody::RequestChannel { complete, payload, .. } => {
            let mut bits = metadata_bit(payload);
            if *complete {
                bits |= flags::COMPLETE;
            }
            bits
        }
        FrameBody::RequestN { .. } | FrameBody::Cancel => 0,
        FrameBody::Payload { follows, complete, next, payload } => {
            let mut bits = metadata_bit(payload);
            if *follows {
                bits |= flags::FOLLOWS;
            }
            if *complete {
                bits |= flags::COMPLETE;
            }
            if *next {
                bits |= flags::NEXT;
            }
            bits
        }
        FrameBody::Error { .. } => 0,
        FrameBody::MetadataPush { .. } => flags::METADATA,
        FrameBody::Resume { .. } | FrameBody::ResumeOk { .. } => 0,
        FrameBody::Ext { ignore, .. } => {
            if *ignore {
                flags::IGNORE
            } else {
                0
            }
        }
    })
}

fn metadata_bit(payload: &Payload) -> u16 {
    if payload.has_metadata() {
        flags::METADATA
    } else {
        0
    }
}

fn duration_millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

fn check_request_n(n: u32) -> Result<(), FrameError> {
    if n == 0 || n > MAX_REQUEST_N {
        return Err(FrameError::InvalidRequestN(n));
    }
    Ok(())
}

fn need(buf: &Bytes, needed: usize) -> Result<(), FrameError> {
    if buf.len() < needed {
        return Err(FrameError::Truncated { needed, have: buf.len() });
    }
    Ok(())
}

fn put_mime(dst: &mut BytesMut, mime: &str) {
    let len = mime.len().min(u8::MAX as usize);
    dst.put_u8(len as u8);
    dst.put_slice(&mime.as_bytes()[..len]);
}

fn get_mime(buf: &mut Bytes, field: &'static str) -> Result<String, FrameError> {
    if buf.is_empty() {
        return Err(FrameError::Truncated { needed: 1, have: 0 });
    }
    let len = buf.get_u8() as usize;
    if buf.len() < len {
        return Err(FrameError::BadLength { field });
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| FrameError::InvalidUtf8 { field })
}

fn put_metadata(dst: &mut BytesMut, metadata: Option<&Bytes>) -> Result<(), FrameError> {
    if let Some(metadata) = metadata {
        if metadata.len() > MAX_METADATA_LEN {
            return Err(FrameError::TooLarge { size: metadata.len(), max: MAX_METADATA_LEN });
        }
        dst.put_uint(metadata.len() as u64, 3);
        dst.put_slice(metadata);
    }
    Ok(())
}

fn get_metadata(has_metadata: bool, buf: &mut Bytes) -> Result<Option<Bytes>, FrameError> {
    if !has_metadata {
        return Ok(None);
    }
    if buf.len() < 3 {
        return Err(FrameError::Truncated { needed: 3, have: buf.len() });
    }
    let len = buf.get_uint(3) as usize;
    if buf.len() < len {
        return Err(FrameError::BadLength { field: "metadata" });
    }
    Ok(Some(buf.split_to(len)))
}

fn put_payload(dst: &mut BytesMut, payload: &Payload) -> Result<(), FrameError> {
    put_metadata(dst, payload.metadata())?;
    dst.put_slice(payload.data());
    Ok(())
}

fn get_payload(has_metadata: bool, mut buf: Bytes) -> Result<Payload, FrameError> {
    let metadata = get_metadata(has_metadata, &mut buf)?;
    Ok(Payload::new(buf, metadata))
}

fn decode_setup(flag_bits: u16, mut buf: Bytes) -> Result<FrameBody, FrameError> {
    need(&buf, 12)?;
    let version = Version { major: buf.get_u16(), minor: buf.get_u16() };
    let keepalive_interval = Duration::from_millis(u64::from(buf.get_u32()));
    let max_lifetime = Duration::from_millis(u64::from(buf.get_u32()));

    let resume_token = if flag_bits & flags::RESUME != 0 {
        need(&buf, 2)?;
        let len = buf.get_u16() as usize;
        if buf.len() < len {
            return Err(FrameError::BadLength { field: "resume token" });
        }
        Some(buf.split_to(len))
    } else {
        None
    };

    let metadata_mime_type = get_mime(&mut buf, "metadata mime type")?;
    let data_mime_type = get_mime(&mut buf, "data mime type")?;
    let payload = get_payload(flag_bits & flags::METADATA != 0, buf)?;

    Ok(FrameBody::Setup(Box::new(Setup {
        version,
        keepalive_interval,
        max_lifetime,
        lease: flag_bits & flags::LEASE != 0,
        resume_token,
        metadata_mime_type,
        data_mime_type,
        payload,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn round_trip(frame: Frame) -> Frame {
        let codec = FrameCodec::default();
        let bytes = codec.encode_to_bytes(&frame).expect("encode");
        let decoded = codec.decode(bytes).expect("decode");
        assert_eq!(decoded, frame);
        decoded
    }

    fn sample_setup(lease: bool, resume_token: Option<Bytes>) -> Setup {
        Setup {
            version: Version::V1,
            keepalive_interval: Duration::from_millis(500),
            max_lifetime: Duration::from_secs(90),
            lease,
            resume_token,
            metadata_mime_type: "application/binary".into(),
            data_mime_type: "application/binary".into(),
            payload: Payload::new(Bytes::from_static(b"setup"), None),
        }
    }

    #[test]
    fn test_setup_round_trip() {
        round_trip(Frame::setup(sample_setup(false, None)));
        round_trip(Frame::setup(sample_setup(true, None)));
        round_trip(Frame::setup(sample_setup(false, Some(Bytes::from_static(b"token")))));
    }

    #[test]
    fn test_lease_round_trip() {
        round_trip(Frame::lease(Duration::from_secs(10), 5, None));
        round_trip(Frame::lease(Duration::from_secs(10), 5, Some(Bytes::from_static(b"meta"))));
    }

    #[test]
    fn test_keepalive_round_trip() {
        let frame = round_trip(Frame::keepalive(true, 42, Bytes::from_static(b"ping")));
        assert_matches!(frame.body, FrameBody::Keepalive { respond: true, .. });
        round_trip(Frame::keepalive(false, 0, Bytes::new()));
    }

    #[test]
    fn test_request_frames_round_trip() {
        let payload = Payload::new(Bytes::from_static(b"data"), Some(Bytes::from_static(b"meta")));
        round_trip(Frame::request_response(1, payload.clone()));
        round_trip(Frame::request_fnf(3, payload.clone()));
        round_trip(Frame::request_stream(5, 128, payload.clone()));
        round_trip(Frame::request_channel(7, 16, false, payload.clone()));
        round_trip(Frame::request_channel(7, 16, true, payload));
        round_trip(Frame::request_n(5, 64));
        round_trip(Frame::cancel(5));
    }

    #[test]
    fn test_payload_round_trip() {
        round_trip(Frame::payload_next(1, Payload::from("hello")));
        round_trip(Frame::payload_next_complete(1, Payload::from("bye")));
        round_trip(Frame::payload_complete(1));
    }

    #[test]
    fn test_error_round_trip() {
        let frame = round_trip(Frame::error(0, crate::error::codes::CONNECTION_ERROR, "boom"));
        assert_matches!(frame.body, FrameBody::Error { message, .. } if message == "boom");
    }

    #[test]
    fn test_metadata_push_round_trip() {
        round_trip(Frame::metadata_push(Bytes::from_static(b"routing")));
        // zero-length metadata is legal and distinct from absent metadata
        round_trip(Frame::metadata_push(Bytes::new()));
    }

    #[test]
    fn test_ext_round_trip() {
        round_trip(Frame {
            stream_id: 0,
            body: FrameBody::Ext {
                ignore: true,
                extended_type: 7,
                body: Bytes::from_static(b"ext"),
            },
        });
    }

    #[test]
    fn test_empty_payload_vs_empty_metadata() {
        // no metadata at all
        let bare = Frame::payload_next(1, Payload::empty());
        // present but zero-length metadata
        let tagged = Frame::payload_next(1, Payload::new(Bytes::new(), Some(Bytes::new())));

        let codec = FrameCodec::default();
        let bare_bytes = codec.encode_to_bytes(&bare).unwrap();
        let tagged_bytes = codec.encode_to_bytes(&tagged).unwrap();
        assert_ne!(bare_bytes, tagged_bytes);

        assert_eq!(codec.decode(bare_bytes).unwrap(), bare);
        assert_eq!(codec.decode(tagged_bytes).unwrap(), tagged);
    }

    #[test]
    fn test_zero_request_n_rejected() {
        let codec = FrameCodec::default();
        let mut raw = BytesMut::new();
        raw.put_u32(5);
        raw.put_u16((FrameType::RequestN as u16) << 10);
        raw.put_u32(0);
        assert_matches!(codec.decode(raw.freeze()), Err(FrameError::InvalidRequestN(0)));
    }

    #[test]
    fn test_high_bit_request_n_rejected() {
        let codec = FrameCodec::default();
        let mut raw = BytesMut::new();
        raw.put_u32(5);
        raw.put_u16((FrameType::RequestN as u16) << 10);
        raw.put_u32(0x8000_0001);
        assert_matches!(codec.decode(raw.freeze()), Err(FrameError::InvalidRequestN(_)));
    }

    #[test]
    fn test_reserved_stream_id_bit_rejected() {
        let codec = FrameCodec::default();
        let mut raw = BytesMut::new();
        raw.put_u32(0x8000_0001);
        raw.put_u16((FrameType::Cancel as u16) << 10);
        assert_matches!(codec.decode(raw.freeze()), Err(FrameError::InvalidStreamId));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let codec = FrameCodec::default();
        let mut raw = BytesMut::new();
        raw.put_u32(1);
        raw.put_u16(0x3e << 10);
        assert_matches!(codec.decode(raw.freeze()), Err(FrameError::UnknownType(0x3e)));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let codec = FrameCodec::default();
        assert_matches!(
            codec.decode(Bytes::from_static(b"\x00\x00")),
            Err(FrameError::Truncated { .. })
        );

        // keepalive with a short position field
        let mut raw = BytesMut::new();
        raw.put_u32(0);
        raw.put_u16((FrameType::Keepalive as u16) << 10);
        raw.put_u32(7);
        assert_matches!(codec.decode(raw.freeze()), Err(FrameError::Truncated { .. }));
    }

    #[test]
    fn test_metadata_length_past_end_rejected() {
        let codec = FrameCodec::default();
        let mut raw = BytesMut::new();
        raw.put_u32(1);
        raw.put_u16(((FrameType::Payload as u16) << 10) | flags::METADATA | flags::NEXT);
        raw.put_uint(100, 3); // claims 100 bytes of metadata
        raw.put_slice(b"short");
        assert_matches!(
            codec.decode(raw.freeze()),
            Err(FrameError::BadLength { field: "metadata" })
        );
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let codec = FrameCodec::new(32);
        let frame = Frame::payload_next(1, Payload::from_data(vec![0u8; 64]));
        let bytes = FrameCodec::default().encode_to_bytes(&frame).unwrap();
        assert_matches!(codec.decode(bytes), Err(FrameError::TooLarge { .. }));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_payload() -> impl Strategy<Value = Payload> {
            (
                proptest::collection::vec(any::<u8>(), 0..256),
                proptest::option::of(proptest::collection::vec(any::<u8>(), 0..256)),
            )
                .prop_map(|(data, metadata)| {
                    Payload::new(Bytes::from(data), metadata.map(Bytes::from))
                })
        }

        proptest! {
            #[test]
            fn prop_payload_frame_round_trip(
                stream_id in 1u32..=MAX_STREAM_ID,
                complete in any::<bool>(),
                next in any::<bool>(),
                payload in arb_payload(),
            ) {
                let frame = Frame {
                    stream_id,
                    body: FrameBody::Payload { follows: false, complete, next, payload },
                };
                let codec = FrameCodec::default();
                let bytes = codec.encode_to_bytes(&frame).unwrap();
                prop_assert_eq!(codec.decode(bytes).unwrap(), frame);
            }

            #[test]
            fn prop_request_stream_round_trip(
                stream_id in 1u32..=MAX_STREAM_ID,
                n in 1u32..=MAX_REQUEST_N,
                payload in arb_payload(),
            ) {
                let frame = Frame::request_stream(stream_id, n, payload);
                let codec = FrameCodec::default();
                let bytes = codec.encode_to_bytes(&frame).unwrap();
                prop_assert_eq!(codec.decode(bytes).unwrap(), frame);
            }
        }
    }
}
