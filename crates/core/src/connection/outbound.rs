//! Prioritized outbound frame queue.
//!
//! All outbound traffic funnels through one writer task that owns the
//! transport sink, so frames hit the wire in a single total order. Two
//! lanes feed it: an unbounded control lane (KEEPALIVE, LEASE, ERROR,
//! CANCEL) and a bounded data lane. Control frames overtake data frames
//! still sitting in the queue, but never a frame already handed to the
//! transport.

use super::duplex::FrameSink;
use crate::{
    error::{RSocketError, RSocketResult},
    frame::Frame,
};
use tokio::sync::mpsc;
use tracing::trace;

/// Capacity of the bounded data lane.
pub(crate) const DATA_QUEUE_CAPACITY: usize = 64;

/// Messages on the control lane.
enum ControlMessage {
    Frame(Frame),
    /// Stop writing and close the sink. Control frames enqueued earlier
    /// are still written first.
    Shutdown,
}

/// Producer side of the outbound queue. Cheap to clone; every component
/// that emits frames holds one.
#[derive(Clone)]
pub(crate) struct OutboundHandle {
    control: mpsc::UnboundedSender<ControlMessage>,
    data: mpsc::Sender<Frame>,
}

impl OutboundHandle {
    /// Enqueue a control frame ahead of buffered data frames. Best
    /// effort: after shutdown the frame is silently dropped.
    pub(crate) fn send_control(&self, frame: Frame) {
        if self.control.send(ControlMessage::Frame(frame)).is_err() {
            trace!(target: "rsocket::connection", "control frame dropped after writer shutdown");
        }
    }

    /// Enqueue a data frame, waiting for queue space.
    pub(crate) async fn send(&self, frame: Frame) -> RSocketResult<()> {
        self.data.send(frame).await.map_err(|_| RSocketError::ClosedChannel)
    }

    /// Ask the writer to stop once earlier control frames are written.
    pub(crate) fn shutdown(&self) {
        let _ = self.control.send(ControlMessage::Shutdown);
    }
}

/// Spawn the writer task draining both lanes into `sink`.
///
/// On a write failure the writer reports through `on_failure` and stops;
/// the driver turns that into connection teardown.
pub(crate) fn spawn_writer<S: FrameSink>(
    mut sink: S,
    on_failure: mpsc::UnboundedSender<RSocketError>,
) -> OutboundHandle {
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    let (data_tx, mut data_rx) = mpsc::channel(DATA_QUEUE_CAPACITY);

    tokio::spawn(async move {
        let mut data_open = true;
        loop {
            let frame = tokio::select! {
                biased;
                message = control_rx.recv() => match message {
                    Some(ControlMessage::Frame(frame)) => frame,
                    // every producer is gone or shutdown was requested
                    Some(ControlMessage::Shutdown) | None => break,
                },
                frame = data_rx.recv(), if data_open => match frame {
                    Some(frame) => frame,
                    None => {
                        data_open = false;
                        continue;
                    }
                },
            };
            if let Err(error) = sink.send(frame).await {
                let _ = on_failure.send(error);
                break;
            }
        }
        if let Err(error) = sink.close().await {
            trace!(target: "rsocket::connection", %error, "error closing transport sink");
        }
    });

    OutboundHandle { control: control_tx, data: data_tx }
}
