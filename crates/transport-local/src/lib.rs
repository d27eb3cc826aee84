//! In-process duplex transport.
//!
//! A [`LocalDuplexConnection`] pair is two ends of a frame-preserving
//! pipe built from bounded channels. It backs the integration tests and
//! any same-process client/server wiring; there is no codec involved
//! because frames never leave the process.

use async_trait::async_trait;
use rsocket_core::{
    frame::Frame, DuplexConnection, FrameSink, FrameStream, RSocketError, RSocketResult,
};
use tokio::sync::mpsc;

/// Default frame capacity per direction.
pub const DEFAULT_CAPACITY: usize = 64;

/// One end of an in-process connection.
#[derive(Debug)]
pub struct LocalDuplexConnection {
    outgoing: mpsc::Sender<Frame>,
    incoming: mpsc::Receiver<Frame>,
}

impl LocalDuplexConnection {
    /// Create a connected pair with the default per-direction capacity.
    pub fn pair() -> (Self, Self) {
        Self::pair_with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a connected pair with an explicit per-direction capacity.
    pub fn pair_with_capacity(capacity: usize) -> (Self, Self) {
        let (left_tx, left_rx) = mpsc::channel(capacity);
        let (right_tx, right_rx) = mpsc::channel(capacity);
        (
            Self { outgoing: left_tx, incoming: right_rx },
            Self { outgoing: right_tx, incoming: left_rx },
        )
    }
}

impl DuplexConnection for LocalDuplexConnection {
    type Sink = LocalFrameSink;
    type Stream = LocalFrameStream;

    fn split(self) -> (Self::Sink, Self::Stream) {
        (LocalFrameSink { outgoing: Some(self.outgoing) }, LocalFrameStream { incoming: self.incoming })
    }
}

/// Write half of a local connection.
#[derive(Debug)]
pub struct LocalFrameSink {
    outgoing: Option<mpsc::Sender<Frame>>,
}

#[async_trait]
impl FrameSink for LocalFrameSink {
    async fn send(&mut self, frame: Frame) -> RSocketResult<()> {
        match &self.outgoing {
            Some(outgoing) => outgoing
                .send(frame)
                .await
                .map_err(|_| RSocketError::Transport("peer closed".into())),
            None => Err(RSocketError::Transport("sink closed".into())),
        }
    }

    async fn close(&mut self) -> RSocketResult<()> {
        // dropping the sender is what signals EOF to the peer
        self.outgoing = None;
        Ok(())
    }
}

/// Read half of a local connection.
#[derive(Debug)]
pub struct LocalFrameStream {
    incoming: mpsc::Receiver<Frame>,
}

#[async_trait]
impl FrameStream for LocalFrameStream {
    async fn next_frame(&mut self) -> Option<RSocketResult<Frame>> {
        self.incoming.recv().await.map(Ok)
    }
}
