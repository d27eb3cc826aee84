//! Length-prefixed framing for byte-stream transports.
//!
//! Transports that do not preserve message boundaries (TCP) precede every
//! frame with a 3-byte big-endian length. Boundary-preserving transports
//! (WebSocket binary frames, the local pipe) use the codec directly.

use super::{Frame, FrameCodec};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one length-prefixed frame. Returns `Ok(None)` on a clean EOF at a
/// frame boundary.
pub async fn read_frame<R>(io: &mut R, codec: &FrameCodec) -> std::io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 3];
    match io.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes([0, prefix[0], prefix[1], prefix[2]]) as usize;
    if len > codec.max_frame_size() {
        return Err(std::io::Error::other(format!(
            "frame length {len} exceeds limit {}",
            codec.max_frame_size()
        )));
    }

    let mut buf = BytesMut::zeroed(len);
    io.read_exact(&mut buf).await?;

    codec.decode(buf.freeze()).map(Some).map_err(std::io::Error::other)
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(io: &mut W, codec: &FrameCodec, frame: &Frame) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(64);
    codec.encode(frame, &mut buf).map_err(std::io::Error::other)?;

    let len = buf.len();
    if len >= 1 << 24 {
        return Err(std::io::Error::other(format!("frame length {len} exceeds 24-bit prefix")));
    }

    let prefix = [(len >> 16) as u8, (len >> 8) as u8, len as u8];
    io.write_all(&prefix).await?;
    io.write_all(&buf).await?;
    Ok(())
}
