//! The transport contract consumed by the engine.
//!
//! A transport hands the engine a frame-preserving duplex pipe. The
//! engine splits it into independent halves so reads and writes proceed
//! concurrently: a writer task owns the sink, a reader task owns the
//! stream.

use crate::{error::RSocketResult, frame::Frame};
use async_trait::async_trait;

/// Write half of a duplex connection.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Transmit one frame. Frames are transmitted in call order.
    async fn send(&mut self, frame: Frame) -> RSocketResult<()>;

    /// Flush and close the transport for writing.
    async fn close(&mut self) -> RSocketResult<()>;
}

/// Read half of a duplex connection.
///
/// `next_frame` must be cancellation-safe: dropping the returned future
/// must not lose a frame.
#[async_trait]
pub trait FrameStream: Send + 'static {
    /// Receive the next frame. `None` means the transport closed.
    async fn next_frame(&mut self) -> Option<RSocketResult<Frame>>;
}

/// A frame-preserving byte pipe between two peers.
///
/// Implementations adapt a concrete transport (TCP with length-prefix
/// framing, WebSocket binary frames, an in-process pipe) to whole-frame
/// reads and writes.
pub trait DuplexConnection: Send + 'static {
    /// Write half type.
    type Sink: FrameSink;
    /// Read half type.
    type Stream: FrameStream;

    /// Split into independently owned halves.
    fn split(self) -> (Self::Sink, Self::Stream);

    /// Transport availability in `[0.0, 1.0]`.
    fn availability(&self) -> f64 {
        1.0
    }
}
