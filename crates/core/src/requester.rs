//! Requester side: originates interactions and owns per-stream receiver
//! state.
//!
//! The public [`RSocketHandle`] is a cheap clone over the driver's
//! command channel. Stream-shaped interactions hand back a
//! [`StreamReceiver`] that translates consumer demand into REQUEST_N
//! credit and emits CANCEL when dropped mid-stream.

use crate::{
    connection::{Command, ConnectionDriver, ProtocolViolation, StreamEntry, StreamSignal},
    error::{RSocketError, RSocketResult},
    frame::{Frame, FrameBody, MAX_REQUEST_N},
    lease::LeaseManager,
    payload::Payload,
    socket::PayloadStream,
};
use futures::Stream;
use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tracing::trace;

/// Handle to one end of a live connection.
///
/// Implements the [`crate::RSocket`] contract by forwarding to the
/// connection driver. Dropping every handle does not close the
/// connection; use [`RSocketHandle::close`].
#[derive(Clone, Debug)]
pub struct RSocketHandle {
    commands: mpsc::UnboundedSender<Command>,
    next_token: Arc<AtomicU64>,
    prefetch: u32,
    lease: Arc<LeaseManager>,
    closed: watch::Receiver<bool>,
}

impl RSocketHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        next_token: Arc<AtomicU64>,
        prefetch: u32,
        lease: Arc<LeaseManager>,
        closed: watch::Receiver<bool>,
    ) -> Self {
        Self { commands, next_token, prefetch, lease, closed }
    }

    fn token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a payload without expecting any response. Completes once the
    /// frame is queued for transmission.
    pub async fn fire_and_forget(&self, payload: Payload) -> RSocketResult<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::FireAndForget { payload, reply })
            .map_err(|_| RSocketError::ClosedChannel)?;
        response.await.map_err(|_| RSocketError::ClosedChannel)?
    }

    /// Send a request and await the single response payload.
    pub async fn request_response(&self, payload: Payload) -> RSocketResult<Payload> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::RequestResponse { payload, reply })
            .map_err(|_| RSocketError::ClosedChannel)?;
        response.await.map_err(|_| RSocketError::ClosedChannel)?
    }

    /// Open a response stream with the default REQUEST_N window.
    pub fn request_stream(&self, payload: Payload) -> PayloadStream {
        self.request_stream_with_prefetch(payload, self.prefetch)
    }

    /// Open a response stream with an explicit REQUEST_N window. The
    /// window doubles as `initial_request_n` on the REQUEST_STREAM
    /// frame; nothing is sent until the stream is first polled.
    pub fn request_stream_with_prefetch(&self, payload: Payload, prefetch: u32) -> PayloadStream {
        let prefetch = prefetch.clamp(1, MAX_REQUEST_N);
        Box::pin(StreamReceiver::stream(self.commands.clone(), self.token(), payload, prefetch))
    }

    /// Open a bi-directional channel. The first element of `payloads`
    /// rides in the REQUEST_CHANNEL frame; the rest flow under
    /// peer-granted credit.
    pub fn request_channel(&self, payloads: PayloadStream) -> PayloadStream {
        let prefetch = self.prefetch;
        Box::pin(StreamReceiver::channel(self.commands.clone(), self.token(), payloads, prefetch))
    }

    /// Push connection-level metadata. The payload must carry metadata;
    /// data is ignored.
    pub async fn metadata_push(&self, payload: Payload) -> RSocketResult<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::MetadataPush { payload, reply })
            .map_err(|_| RSocketError::ClosedChannel)?;
        response.await.map_err(|_| RSocketError::ClosedChannel)?
    }

    /// Grant the peer a lease window (requires HONOR_LEASE).
    pub async fn send_lease(&self, ttl: Duration, number_of_requests: u32) -> RSocketResult<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::SendLease { ttl, number_of_requests, reply })
            .map_err(|_| RSocketError::ClosedChannel)?;
        response.await.map_err(|_| RSocketError::ClosedChannel)?
    }

    /// Close the connection. Every outstanding stream terminates with
    /// [`RSocketError::ClosedChannel`].
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Close { reply }).is_ok() {
            let _ = done.await;
        }
    }

    /// Resolve once the connection has closed for any reason.
    pub async fn on_close(&self) {
        let mut closed = self.closed.clone();
        loop {
            if *closed.borrow_and_update() {
                return;
            }
            if closed.changed().await.is_err() {
                return;
            }
        }
    }

    /// Whether the connection has closed.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Availability in `[0.0, 1.0]`: 0.0 once closed; under HONOR_LEASE
    /// the remaining fraction of the current lease; 1.0 otherwise.
    pub fn availability(&self) -> f64 {
        if self.is_closed() {
            return 0.0;
        }
        self.lease.availability()
    }
}

enum ReceiverState {
    /// request_stream not yet announced; waiting for first demand.
    StreamInit(Option<Payload>),
    /// request_channel waiting for the first upstream element.
    ChannelInit(Option<PayloadStream>),
    /// Stream open; delivering signals from the driver.
    Running,
    /// Terminal signal delivered.
    Done,
}

/// Receiver half of a stream or channel.
///
/// Demand is what drives the wire: the opening frame goes out on first
/// poll, REQUEST_N refills go out when the consumer has drained enough
/// of the window at the next poll, and dropping the receiver mid-stream
/// sends CANCEL.
pub(crate) struct StreamReceiver {
    commands: mpsc::UnboundedSender<Command>,
    token: u64,
    prefetch: u32,
    /// Refill once this many elements were consumed since the last
    /// grant: three quarters of the window, so credit arrives before the
    /// window empties.
    refill_threshold: u32,
    consumed: u32,
    events: mpsc::UnboundedReceiver<StreamSignal>,
    /// Handed to the driver with the open command.
    events_tx: Option<mpsc::UnboundedSender<StreamSignal>>,
    /// Responder-side channel input grants its window via REQUEST_N on
    /// first demand instead of an opening frame.
    grant_initial: bool,
    granted: bool,
    state: ReceiverState,
}

impl StreamReceiver {
    fn parts(prefetch: u32) -> (mpsc::UnboundedSender<StreamSignal>, mpsc::UnboundedReceiver<StreamSignal>, u32) {
        let (tx, rx) = mpsc::unbounded_channel();
        let refill_threshold = (prefetch - prefetch / 4).max(1);
        (tx, rx, refill_threshold)
    }

    /// Receiver for a request/stream interaction.
    pub(crate) fn stream(
        commands: mpsc::UnboundedSender<Command>,
        token: u64,
        payload: Payload,
        prefetch: u32,
    ) -> Self {
        let (events_tx, events, refill_threshold) = Self::parts(prefetch);
        Self {
            commands,
            token,
            prefetch,
            refill_threshold,
            consumed: 0,
            events,
            events_tx: Some(events_tx),
            grant_initial: false,
            granted: false,
            state: ReceiverState::StreamInit(Some(payload)),
        }
    }

    /// Receiver for the response half of a request/channel interaction.
    pub(crate) fn channel(
        commands: mpsc::UnboundedSender<Command>,
        token: u64,
        source: PayloadStream,
        prefetch: u32,
    ) -> Self {
        let (events_tx, events, refill_threshold) = Self::parts(prefetch);
        Self {
            commands,
            token,
            prefetch,
            refill_threshold,
            consumed: 0,
            events,
            events_tx: Some(events_tx),
            grant_initial: false,
            granted: false,
            state: ReceiverState::ChannelInit(Some(source)),
        }
    }

    /// Responder-side channel input: the stream is already open, demand
    /// is granted lazily through REQUEST_N.
    pub(crate) fn channel_input(
        commands: mpsc::UnboundedSender<Command>,
        token: u64,
        events: mpsc::UnboundedReceiver<StreamSignal>,
        prefetch: u32,
    ) -> Self {
        let refill_threshold = (prefetch - prefetch / 4).max(1);
        Self {
            commands,
            token,
            prefetch,
            refill_threshold,
            consumed: 0,
            events,
            events_tx: None,
            grant_initial: true,
            granted: false,
            state: ReceiverState::Running,
        }
    }

    fn send_command(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }
}

impl Stream for StreamReceiver {
    type Item = RSocketResult<Payload>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                ReceiverState::StreamInit(payload) => {
                    let payload = payload.take().expect("stream payload present before open");
                    let events = this.events_tx.take().expect("events sender present before open");
                    let sent = this.send_command(Command::OpenStream {
                        token: this.token,
                        payload,
                        prefetch: this.prefetch,
                        events,
                    });
                    if !sent {
                        this.state = ReceiverState::Done;
                        return Poll::Ready(Some(Err(RSocketError::ClosedChannel)));
                    }
                    this.state = ReceiverState::Running;
                }
                ReceiverState::ChannelInit(source_slot) => {
                    let source = source_slot.as_mut().expect("channel source present before open");
                    match source.as_mut().poll_next(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(item) => {
                            let source = source_slot.take();
                            let events =
                                this.events_tx.take().expect("events sender present before open");
                            let command = match item {
                                Some(Ok(first)) => Command::OpenChannel {
                                    token: this.token,
                                    first,
                                    source_complete: false,
                                    source,
                                    prefetch: this.prefetch,
                                    events,
                                },
                                None => Command::OpenChannel {
                                    token: this.token,
                                    first: Payload::empty(),
                                    source_complete: true,
                                    source: None,
                                    prefetch: this.prefetch,
                                    events,
                                },
                                Some(Err(error)) => {
                                    // local upstream failed before anything
                                    // reached the wire
                                    this.state = ReceiverState::Done;
                                    return Poll::Ready(Some(Err(error)));
                                }
                            };
                            if !this.send_command(command) {
                                this.state = ReceiverState::Done;
                                return Poll::Ready(Some(Err(RSocketError::ClosedChannel)));
                            }
                            this.state = ReceiverState::Running;
                        }
                    }
                }
                ReceiverState::Running => {
                    if this.grant_initial && !this.granted {
                        this.granted = true;
                        let _ = this.send_command(Command::RequestN {
                            token: this.token,
                            n: this.prefetch,
                        });
                    }
                    if this.consumed >= this.refill_threshold {
                        let n = this.consumed;
                        this.consumed = 0;
                        let _ = this.send_command(Command::RequestN { token: this.token, n });
                    }
                    return match this.events.poll_recv(cx) {
                        Poll::Pending => Poll::Pending,
                        Poll::Ready(Some(StreamSignal::Next(payload))) => {
                            this.consumed = this.consumed.saturating_add(1);
                            Poll::Ready(Some(Ok(payload)))
                        }
                        Poll::Ready(Some(StreamSignal::Complete)) => {
                            this.state = ReceiverState::Done;
                            Poll::Ready(None)
                        }
                        Poll::Ready(Some(StreamSignal::Error(error))) => {
                            this.state = ReceiverState::Done;
                            Poll::Ready(Some(Err(error)))
                        }
                        Poll::Ready(None) => {
                            this.state = ReceiverState::Done;
                            Poll::Ready(Some(Err(RSocketError::ClosedChannel)))
                        }
                    };
                }
                ReceiverState::Done => return Poll::Ready(None),
            }
        }
    }
}

impl Drop for StreamReceiver {
    fn drop(&mut self) {
        // cancel only streams that actually opened and have not finished
        if matches!(self.state, ReceiverState::Running) {
            let _ = self.commands.send(Command::CancelStream { token: self.token });
        }
    }
}

impl ConnectionDriver {
    /// Dispatch a frame for a stream this side initiated.
    pub(crate) fn on_requester_frame(&mut self, frame: Frame) -> Result<(), ProtocolViolation> {
        let stream_id = frame.stream_id;
        if frame.is_request() {
            return Err(ProtocolViolation::connection(format!(
                "request frame with local parity on stream {stream_id}"
            )));
        }
        let Some(entry) = self.streams.remove(&stream_id) else {
            if self.supplier.is_before_or_current(stream_id) {
                // races with cancellation are expected; drop silently
                trace!(
                    target: "rsocket::requester",
                    stream_id,
                    "late frame for closed stream"
                );
                return Ok(());
            }
            return Err(ProtocolViolation::connection(format!(
                "frame for never-existed stream {stream_id}"
            )));
        };

        match frame.body {
            FrameBody::Payload { next, complete, payload, .. } => {
                self.on_requester_payload(stream_id, entry, next, complete, payload);
            }
            FrameBody::Error { code, message } => {
                self.on_requester_error(stream_id, entry, RSocketError::from_wire(code, message));
            }
            FrameBody::RequestN { n } => {
                if let StreamEntry::Channel { ref credits, .. } = entry {
                    add_credit(credits, n);
                } else {
                    trace!(target: "rsocket::requester", stream_id, "REQUEST_N for non-channel stream");
                }
                self.streams.insert(stream_id, entry);
            }
            FrameBody::Cancel => {
                self.on_requester_cancel(stream_id, entry);
            }
            _ => {
                self.streams.insert(stream_id, entry);
                return Err(ProtocolViolation::connection(format!(
                    "invalid frame type for stream {stream_id}"
                )));
            }
        }
        Ok(())
    }

    fn on_requester_payload(
        &mut self,
        stream_id: u32,
        entry: StreamEntry,
        next: bool,
        complete: bool,
        payload: Payload,
    ) {
        match entry {
            StreamEntry::PendingResponse { reply } => {
                // a bare COMPLETE is an empty response
                let value = if next { payload } else { Payload::empty() };
                let _ = reply.send(Ok(value));
            }
            StreamEntry::Receiver { token, events } => {
                if next {
                    let _ = events.send(StreamSignal::Next(payload));
                }
                if complete {
                    let _ = events.send(StreamSignal::Complete);
                    self.tokens.remove(&token);
                } else {
                    self.streams.insert(stream_id, StreamEntry::Receiver { token, events });
                }
            }
            StreamEntry::Channel {
                token,
                initiator,
                mut receiver,
                credits,
                cancel,
                sender_done,
            } => {
                if let Some(events) = &receiver {
                    if next {
                        let _ = events.send(StreamSignal::Next(payload));
                    }
                    if complete {
                        let _ = events.send(StreamSignal::Complete);
                        receiver = None;
                    }
                }
                if receiver.is_none() && sender_done {
                    self.tokens.remove(&token);
                } else {
                    self.streams.insert(
                        stream_id,
                        StreamEntry::Channel {
                            token,
                            initiator,
                            receiver,
                            credits,
                            cancel,
                            sender_done,
                        },
                    );
                }
            }
            other => {
                trace!(target: "rsocket::requester", stream_id, "PAYLOAD for emission-only stream");
                self.streams.insert(stream_id, other);
            }
        }
    }

    /// An inbound ERROR terminates the whole interaction: both
    /// halves of a channel are dropped.
    fn on_requester_error(&mut self, stream_id: u32, entry: StreamEntry, error: RSocketError) {
        let _ = stream_id;
        match entry {
            StreamEntry::PendingResponse { reply } => {
                let _ = reply.send(Err(error));
            }
            StreamEntry::Receiver { token, events } => {
                let _ = events.send(StreamSignal::Error(error));
                self.tokens.remove(&token);
            }
            StreamEntry::Channel { token, receiver, cancel, .. } => {
                if let Some(events) = receiver {
                    let _ = events.send(StreamSignal::Error(error));
                }
                let _ = cancel.send(true);
                self.tokens.remove(&token);
            }
            StreamEntry::Responding { cancel } | StreamEntry::Sender { cancel, .. } => {
                let _ = cancel.send(true);
            }
        }
    }

    /// CANCEL on a locally initiated channel stops our upstream pump;
    /// the receiving half keeps running until its own terminal.
    fn on_requester_cancel(&mut self, stream_id: u32, entry: StreamEntry) {
        match entry {
            StreamEntry::Channel { token, initiator, receiver, credits, cancel, .. } => {
                let _ = cancel.send(true);
                if receiver.is_none() {
                    self.tokens.remove(&token);
                } else {
                    self.streams.insert(
                        stream_id,
                        StreamEntry::Channel {
                            token,
                            initiator,
                            receiver,
                            credits,
                            cancel,
                            sender_done: true,
                        },
                    );
                }
            }
            other => {
                trace!(target: "rsocket::requester", stream_id, "CANCEL for receiving stream");
                self.streams.insert(stream_id, other);
            }
        }
    }
}

/// Add REQUEST_N credit to an emission pump, saturating at the
/// semaphore's ceiling.
pub(crate) fn add_credit(credits: &Arc<Semaphore>, n: u32) {
    let headroom = Semaphore::MAX_PERMITS - credits.available_permits();
    credits.add_permits((n as usize).min(headroom));
}
