//! Per-connection protocol engine.
//!
//! One driver task owns all connection state: the per-stream dispatch
//! map, the stream-id supplier, keepalive bookkeeping, and the lease
//! windows. It runs a `tokio::select!` loop over inbound frames (fed by
//! a reader task), commands from public handles, internal events from
//! per-stream tasks, writer failures, and the keepalive tick. Inbound
//! dispatch never blocks; everything that can suspend (handler calls,
//! credit waits, queue space) runs in spawned per-stream tasks.

use crate::{
    config::ConnectionConfig,
    error::{codes, RSocketError, RSocketResult},
    frame::{Frame, FrameBody},
    keepalive::KeepAlive,
    lease::{Lease, LeaseManager},
    multiplexer::{route, Route},
    payload::Payload,
    requester::RSocketHandle,
    socket::{PayloadStream, RSocket},
    stream_id::{Side, StreamIdSupplier},
};
use bytes::Bytes;
use std::{
    collections::HashMap,
    sync::{atomic::AtomicU64, Arc},
    time::Duration,
};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tracing::{debug, error, trace, warn};

pub mod duplex;
pub(crate) mod outbound;

pub use duplex::{DuplexConnection, FrameSink, FrameStream};
use outbound::OutboundHandle;

/// Capacity of the bounded inbound frame queue between the reader task
/// and the driver; pacing demand from the transport happens here.
const INBOUND_QUEUE_CAPACITY: usize = 64;

/// Commands sent from public handles to the driver.
pub(crate) enum Command {
    /// Fire-and-forget request; completes once the frame is queued.
    FireAndForget {
        payload: Payload,
        reply: oneshot::Sender<RSocketResult<()>>,
    },
    /// Request/response; completes with the response payload.
    RequestResponse {
        payload: Payload,
        reply: oneshot::Sender<RSocketResult<Payload>>,
    },
    /// Open a request/stream interaction.
    OpenStream {
        token: u64,
        payload: Payload,
        prefetch: u32,
        events: mpsc::UnboundedSender<StreamSignal>,
    },
    /// Open a request/channel interaction. `first` rides in the
    /// REQUEST_CHANNEL frame; the rest of `source` is pumped under
    /// peer-granted credit.
    OpenChannel {
        token: u64,
        first: Payload,
        source_complete: bool,
        source: Option<PayloadStream>,
        prefetch: u32,
        events: mpsc::UnboundedSender<StreamSignal>,
    },
    /// Push connection-level metadata on stream 0.
    MetadataPush {
        payload: Payload,
        reply: oneshot::Sender<RSocketResult<()>>,
    },
    /// Grant the peer a lease window.
    SendLease {
        ttl: Duration,
        number_of_requests: u32,
        reply: oneshot::Sender<RSocketResult<()>>,
    },
    /// Accumulated receiver demand for an open stream.
    RequestN { token: u64, n: u32 },
    /// The local receiver is gone; cancel the stream.
    CancelStream { token: u64 },
    /// Close the connection.
    Close { reply: oneshot::Sender<()> },
}

/// Signals delivered from the driver to a stream receiver.
#[derive(Debug)]
pub(crate) enum StreamSignal {
    /// One payload element.
    Next(Payload),
    /// The stream completed normally.
    Complete,
    /// The stream failed.
    Error(RSocketError),
}

/// Events from per-stream tasks back to the driver.
#[derive(Debug)]
pub(crate) enum Internal {
    /// A responder task or channel pump finished (completed, errored,
    /// or observed cancellation).
    SenderFinished { stream_id: u32 },
}

/// Per-stream dispatcher entry, keyed by stream id in one map.
pub(crate) enum StreamEntry {
    /// Local request/response awaiting the single reply.
    PendingResponse { reply: oneshot::Sender<RSocketResult<Payload>> },
    /// Local stream receiver.
    Receiver {
        token: u64,
        events: mpsc::UnboundedSender<StreamSignal>,
    },
    /// Responder-side request/response task in flight.
    Responding { cancel: watch::Sender<bool> },
    /// Responder-side emission half of a stream.
    Sender {
        credits: Arc<Semaphore>,
        cancel: watch::Sender<bool>,
    },
    /// Both halves of a channel, on either side of the connection.
    Channel {
        token: u64,
        /// True when this side initiated the channel.
        initiator: bool,
        /// Delivery half; `None` once terminated.
        receiver: Option<mpsc::UnboundedSender<StreamSignal>>,
        /// Credit for the local emission pump.
        credits: Arc<Semaphore>,
        /// Cancels the local emission pump.
        cancel: watch::Sender<bool>,
        /// Set when the emission pump has finished.
        sender_done: bool,
    },
}

/// A protocol-fatal condition detected while dispatching a frame.
pub(crate) struct ProtocolViolation {
    pub(crate) code: u32,
    pub(crate) message: String,
}

impl ProtocolViolation {
    pub(crate) fn connection(message: impl Into<String>) -> Self {
        Self { code: codes::CONNECTION_ERROR, message: message.into() }
    }
}

/// A connection whose transport tasks are running but whose driver has
/// not started. The acceptor callback runs in this window so it can
/// reject the connection with a frame-accurate error.
pub(crate) struct PendingConnection {
    side: Side,
    config: ConnectionConfig,
    outbound: OutboundHandle,
    inbound: mpsc::Receiver<RSocketResult<Frame>>,
    command_tx: mpsc::UnboundedSender<Command>,
    commands: mpsc::UnboundedReceiver<Command>,
    next_token: Arc<AtomicU64>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    writer_failures: mpsc::UnboundedReceiver<RSocketError>,
    closed_tx: watch::Sender<bool>,
    lease: Arc<LeaseManager>,
}

impl PendingConnection {
    /// Spawn the reader and writer tasks for `sink`/`stream` and build
    /// the public handle.
    pub(crate) fn new<S, R>(
        side: Side,
        config: ConnectionConfig,
        sink: S,
        stream: R,
    ) -> (RSocketHandle, Self)
    where
        S: FrameSink,
        R: FrameStream,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let outbound = outbound::spawn_writer(sink, failure_tx);
        let inbound = spawn_reader(stream);
        let lease = LeaseManager::new(config.honor_lease);
        let next_token = Arc::new(AtomicU64::new(1));

        let handle = RSocketHandle::new(
            command_tx.clone(),
            next_token.clone(),
            config.prefetch,
            lease.clone(),
            closed_rx,
        );

        let pending = Self {
            side,
            config,
            outbound,
            inbound,
            command_tx,
            commands: command_rx,
            next_token,
            internal_tx,
            internal_rx,
            writer_failures: failure_rx,
            closed_tx,
            lease,
        };
        (handle, pending)
    }

    /// Reject the connection: emit an ERROR on stream 0 and close.
    pub(crate) fn reject(self, code: u32, message: &str) {
        self.outbound.send_control(Frame::error(0, code, message));
        self.outbound.shutdown();
        self.closed_tx.send_replace(true);
    }

    /// Start the driver with the given responder.
    pub(crate) fn launch(self, responder: Arc<dyn RSocket>) {
        let driver = ConnectionDriver {
            side: self.side,
            keepalive: KeepAlive::new(
                self.config.keepalive_period,
                self.config.missed_keepalive_threshold,
                tokio::time::Instant::now(),
            ),
            streams: HashMap::new(),
            tokens: HashMap::new(),
            supplier: StreamIdSupplier::new(self.side),
            max_peer_stream_id: 0,
            outbound: self.outbound,
            responder,
            lease: self.lease,
            frames_received: 0,
            command_tx: self.command_tx,
            next_token: self.next_token,
            internal_tx: self.internal_tx,
            closed_tx: self.closed_tx,
            config: self.config,
        };
        tokio::spawn(driver.run(
            self.inbound,
            self.commands,
            self.internal_rx,
            self.writer_failures,
        ));
    }
}

/// Pump the transport read half into a bounded queue the driver selects
/// on. The queue bound is what paces demand from the transport.
fn spawn_reader<R: FrameStream>(mut stream: R) -> mpsc::Receiver<RSocketResult<Frame>> {
    let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    tokio::spawn(async move {
        while let Some(item) = stream.next_frame().await {
            let fatal = item.is_err();
            if tx.send(item).await.is_err() || fatal {
                break;
            }
        }
    });
    rx
}

/// The per-connection event loop.
pub(crate) struct ConnectionDriver {
    pub(crate) side: Side,
    pub(crate) config: ConnectionConfig,
    pub(crate) streams: HashMap<u32, StreamEntry>,
    /// Receiver-token to stream-id mapping for commands arriving from
    /// stream wrappers.
    pub(crate) tokens: HashMap<u64, u32>,
    pub(crate) supplier: StreamIdSupplier,
    /// Highest peer-initiated id observed; anything above it that is not
    /// a request frame targets a stream that never existed.
    pub(crate) max_peer_stream_id: u32,
    pub(crate) outbound: OutboundHandle,
    pub(crate) responder: Arc<dyn RSocket>,
    pub(crate) lease: Arc<LeaseManager>,
    pub(crate) keepalive: KeepAlive,
    pub(crate) frames_received: u64,
    /// Clone of the handle command channel, used to build responder-side
    /// channel input receivers.
    pub(crate) command_tx: mpsc::UnboundedSender<Command>,
    pub(crate) next_token: Arc<AtomicU64>,
    pub(crate) internal_tx: mpsc::UnboundedSender<Internal>,
    pub(crate) closed_tx: watch::Sender<bool>,
}

impl ConnectionDriver {
    pub(crate) async fn run(
        mut self,
        mut inbound: mpsc::Receiver<RSocketResult<Frame>>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut writer_failures: mpsc::UnboundedReceiver<RSocketError>,
    ) {
        let mut keepalive_ticks = tokio::time::interval(self.config.keepalive_period);
        keepalive_ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        debug!(target: "rsocket::connection", side = ?self.side, "connection driver started");

        loop {
            tokio::select! {
                maybe_frame = inbound.recv() => match maybe_frame {
                    Some(Ok(frame)) => {
                        if let Err(violation) = self.on_frame(frame) {
                            self.protocol_fatal(violation);
                            break;
                        }
                    }
                    Some(Err(transport_error)) => {
                        self.on_read_error(transport_error);
                        break;
                    }
                    None => {
                        debug!(target: "rsocket::connection", "transport closed");
                        self.teardown(RSocketError::ClosedChannel);
                        break;
                    }
                },
                Some(command) = commands.recv() => {
                    if self.on_command(command).await {
                        break;
                    }
                }
                Some(event) = internal.recv() => self.on_internal(event),
                Some(write_error) = writer_failures.recv() => {
                    if !write_error.is_expected_close() {
                        (self.config.error_consumer)(&write_error);
                    }
                    self.teardown(RSocketError::ClosedChannel);
                    break;
                }
                _ = keepalive_ticks.tick() => {
                    if self.on_keepalive_tick() {
                        break;
                    }
                }
            }
        }
        debug!(target: "rsocket::connection", side = ?self.side, "connection driver stopped");
    }

    /// Dispatch one inbound frame. Returns a violation for
    /// protocol-fatal conditions.
    fn on_frame(&mut self, frame: Frame) -> Result<(), ProtocolViolation> {
        self.frames_received += 1;
        trace!(
            target: "rsocket::connection",
            stream_id = frame.stream_id,
            frame_type = ?frame.frame_type(),
            "inbound frame"
        );
        match route(self.side, frame.stream_id) {
            Route::StreamZero => self.on_stream_zero(frame),
            Route::Requester => self.on_requester_frame(frame),
            Route::Responder => self.on_responder_frame(frame),
        }
    }

    /// Handle connection-level frames on stream 0.
    fn on_stream_zero(&mut self, frame: Frame) -> Result<(), ProtocolViolation> {
        match frame.body {
            FrameBody::Keepalive { respond: true, data, .. } => {
                // echo immediately, ahead of buffered data frames
                self.outbound.send_control(Frame::keepalive(false, self.frames_received, data));
                Ok(())
            }
            FrameBody::Keepalive { respond: false, .. } => {
                self.keepalive.on_ack(tokio::time::Instant::now());
                Ok(())
            }
            FrameBody::Lease { ttl, number_of_requests, metadata } => {
                trace!(
                    target: "rsocket::lease",
                    permits = number_of_requests,
                    ttl_ms = ttl.as_millis() as u64,
                    "lease received"
                );
                self.lease.on_lease_received(&Lease {
                    allowed_requests: number_of_requests,
                    ttl,
                    metadata,
                });
                Ok(())
            }
            FrameBody::Error { code, message } => {
                // fatal for the whole connection: every active stream
                // terminates with the peer's error
                let peer_error = RSocketError::from_wire(code, message);
                warn!(target: "rsocket::connection", %peer_error, "connection error from peer");
                self.teardown(peer_error);
                Err(ProtocolViolation { code: 0, message: String::new() })
            }
            FrameBody::MetadataPush { metadata } => {
                let handler = self.responder.clone();
                let consumer = self.config.error_consumer.clone();
                tokio::spawn(async move {
                    if let Err(error) =
                        handler.metadata_push(Payload::new(Bytes::new(), Some(metadata))).await
                    {
                        if !error.is_expected_close() {
                            consumer(&error);
                        }
                    }
                });
                Ok(())
            }
            FrameBody::Setup(_) => {
                Err(ProtocolViolation::connection("unexpected SETUP on established connection"))
            }
            FrameBody::Resume { .. } | FrameBody::ResumeOk { .. } => Err(ProtocolViolation {
                code: codes::REJECTED_RESUME,
                message: "resumption not supported".into(),
            }),
            FrameBody::Ext { ignore: true, extended_type, .. } => {
                trace!(target: "rsocket::connection", extended_type, "ignoring extension frame");
                Ok(())
            }
            FrameBody::Ext { ignore: false, extended_type, .. } => Err(
                ProtocolViolation::connection(format!("unsupported extension {extended_type}")),
            ),
            _ => Err(ProtocolViolation::connection(format!(
                "invalid frame on stream 0: {:?}",
                frame.frame_type()
            ))),
        }
    }

    /// Process one command from a public handle or stream wrapper.
    /// Returns true when the connection should close.
    async fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::FireAndForget { payload, reply } => {
                let result = self.request_fnf(payload).await;
                let _ = reply.send(result);
            }
            Command::RequestResponse { payload, reply } => {
                if let Err(rejected) = self.lease.use_inbound() {
                    let _ = reply.send(Err(rejected));
                } else {
                    self.open_request_response(payload, reply).await;
                }
            }
            Command::OpenStream { token, payload, prefetch, events } => {
                if let Err(rejected) = self.lease.use_inbound() {
                    let _ = events.send(StreamSignal::Error(rejected));
                } else {
                    self.open_stream(token, payload, prefetch, events).await;
                }
            }
            Command::OpenChannel { token, first, source_complete, source, prefetch, events } => {
                if let Err(rejected) = self.lease.use_inbound() {
                    let _ = events.send(StreamSignal::Error(rejected));
                } else {
                    self.open_channel(token, first, source_complete, source, prefetch, events)
                        .await;
                }
            }
            Command::MetadataPush { payload, reply } => {
                let result = match payload.into_parts() {
                    (_, Some(metadata)) => self.outbound.send(Frame::metadata_push(metadata)).await,
                    (_, None) => Err(RSocketError::Invalid("metadata-push requires metadata".into())),
                };
                let _ = reply.send(result);
            }
            Command::SendLease { ttl, number_of_requests, reply } => {
                let result = if self.lease.enabled() {
                    self.lease.on_lease_sent(number_of_requests, ttl);
                    self.outbound.send_control(Frame::lease(ttl, number_of_requests, None));
                    Ok(())
                } else {
                    Err(RSocketError::Unsupported("lease not negotiated"))
                };
                let _ = reply.send(result);
            }
            Command::RequestN { token, n } => {
                if let Some(stream_id) = self.tokens.get(&token).copied() {
                    let _ = self.outbound.send(Frame::request_n(stream_id, n)).await;
                }
            }
            Command::CancelStream { token } => self.cancel_local_stream(token),
            Command::Close { reply } => {
                debug!(target: "rsocket::connection", "closing on request");
                self.teardown(RSocketError::ClosedChannel);
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    async fn request_fnf(&mut self, payload: Payload) -> RSocketResult<()> {
        self.lease.use_inbound()?;
        let stream_id = self.allocate_stream_id();
        self.outbound.send(Frame::request_fnf(stream_id, payload)).await
    }

    async fn open_request_response(
        &mut self,
        payload: Payload,
        reply: oneshot::Sender<RSocketResult<Payload>>,
    ) {
        let stream_id = self.allocate_stream_id();
        self.streams.insert(stream_id, StreamEntry::PendingResponse { reply });
        if self.outbound.send(Frame::request_response(stream_id, payload)).await.is_err() {
            if let Some(StreamEntry::PendingResponse { reply }) = self.streams.remove(&stream_id) {
                let _ = reply.send(Err(RSocketError::ClosedChannel));
            }
        }
    }

    async fn open_stream(
        &mut self,
        token: u64,
        payload: Payload,
        prefetch: u32,
        events: mpsc::UnboundedSender<StreamSignal>,
    ) {
        let stream_id = self.allocate_stream_id();
        self.tokens.insert(token, stream_id);
        self.streams.insert(stream_id, StreamEntry::Receiver { token, events });
        if self.outbound.send(Frame::request_stream(stream_id, prefetch, payload)).await.is_err() {
            self.tokens.remove(&token);
            if let Some(StreamEntry::Receiver { events, .. }) = self.streams.remove(&stream_id) {
                let _ = events.send(StreamSignal::Error(RSocketError::ClosedChannel));
            }
        }
    }

    async fn open_channel(
        &mut self,
        token: u64,
        first: Payload,
        source_complete: bool,
        source: Option<PayloadStream>,
        prefetch: u32,
        events: mpsc::UnboundedSender<StreamSignal>,
    ) {
        let stream_id = self.allocate_stream_id();
        // the peer grants credit for our upstream via REQUEST_N
        let credits = Arc::new(Semaphore::new(0));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        self.tokens.insert(token, stream_id);
        self.streams.insert(
            stream_id,
            StreamEntry::Channel {
                token,
                initiator: true,
                receiver: Some(events),
                credits: credits.clone(),
                cancel: cancel_tx,
                sender_done: source_complete,
            },
        );

        let open = Frame::request_channel(stream_id, prefetch, source_complete, first);
        if self.outbound.send(open).await.is_err() {
            self.tokens.remove(&token);
            if let Some(StreamEntry::Channel { receiver: Some(events), .. }) =
                self.streams.remove(&stream_id)
            {
                let _ = events.send(StreamSignal::Error(RSocketError::ClosedChannel));
            }
            return;
        }

        if let Some(source) = source {
            crate::responder::spawn_sender_pump(
                stream_id,
                source,
                credits,
                cancel_rx,
                self.outbound.clone(),
                self.internal_tx.clone(),
            );
        }
    }

    /// Cancel a locally received stream: emit CANCEL (prioritized) and
    /// drop the local state.
    fn cancel_local_stream(&mut self, token: u64) {
        let Some(stream_id) = self.tokens.remove(&token) else {
            return;
        };
        let (remove, emit_cancel) = match self.streams.get_mut(&stream_id) {
            Some(StreamEntry::Receiver { .. }) => (true, true),
            Some(StreamEntry::Channel { initiator: true, cancel, .. }) => {
                // whole interaction is dead: stop the upstream pump too
                let _ = cancel.send(true);
                (true, true)
            }
            Some(StreamEntry::Channel { initiator: false, receiver, sender_done, .. }) => {
                // the handler dropped its input: stop the peer's upstream
                // but keep our output half running
                *receiver = None;
                (*sender_done, true)
            }
            _ => (false, false),
        };
        if remove {
            self.streams.remove(&stream_id);
        }
        if emit_cancel {
            self.outbound.send_control(Frame::cancel(stream_id));
        }
    }

    fn on_internal(&mut self, event: Internal) {
        match event {
            Internal::SenderFinished { stream_id } => {
                let (remove, drop_token) = match self.streams.get_mut(&stream_id) {
                    Some(StreamEntry::Responding { .. }) | Some(StreamEntry::Sender { .. }) => {
                        (true, None)
                    }
                    Some(StreamEntry::Channel { token, receiver, sender_done, .. }) => {
                        *sender_done = true;
                        if receiver.is_none() {
                            (true, Some(*token))
                        } else {
                            (false, None)
                        }
                    }
                    _ => (false, None),
                };
                if let Some(token) = drop_token {
                    self.tokens.remove(&token);
                }
                if remove {
                    self.streams.remove(&stream_id);
                }
            }
        }
    }

    /// Emit a keepalive tick; returns true when the missed-ack threshold
    /// is breached and the connection must close.
    fn on_keepalive_tick(&mut self) -> bool {
        match self.keepalive.on_tick(tokio::time::Instant::now()) {
            Ok(()) => {
                self.outbound.send_control(Frame::keepalive(
                    true,
                    self.frames_received,
                    Bytes::new(),
                ));
                false
            }
            Err(missed) => {
                error!(target: "rsocket::keepalive", missed, "keepalive timeout");
                self.outbound.send_control(Frame::error(
                    0,
                    codes::CONNECTION_ERROR,
                    "keepalive timeout",
                ));
                self.teardown(RSocketError::ConnectionError("keepalive timeout".into()));
                true
            }
        }
    }

    /// A decode failure is protocol-fatal; any other read error is a
    /// transport failure.
    fn on_read_error(&mut self, transport_error: RSocketError) {
        match transport_error {
            frame_error @ RSocketError::Frame(_) => {
                self.protocol_fatal(ProtocolViolation::connection(frame_error.to_string()));
            }
            other => {
                if !other.is_expected_close() {
                    (self.config.error_consumer)(&other);
                }
                self.teardown(RSocketError::ClosedChannel);
            }
        }
    }

    /// Report a protocol violation to the peer and tear down. Violations
    /// raised after an inbound ERROR(0) already tore down and carry an
    /// empty message.
    fn protocol_fatal(&mut self, violation: ProtocolViolation) {
        if violation.code == 0 {
            return;
        }
        warn!(target: "rsocket::connection", message = %violation.message, "protocol violation");
        self.outbound.send_control(Frame::error(0, violation.code, violation.message));
        self.teardown(RSocketError::ClosedChannel);
    }

    pub(crate) fn allocate_stream_id(&mut self) -> u32 {
        let streams = &self.streams;
        self.supplier.next(|id| streams.contains_key(&id))
    }

    /// Terminate every active stream with `error`, mark the connection
    /// closed, and stop the writer.
    fn teardown(&mut self, error: RSocketError) {
        if *self.closed_tx.borrow() {
            return;
        }
        debug!(
            target: "rsocket::connection",
            side = ?self.side,
            active_streams = self.streams.len(),
            %error,
            "tearing down connection"
        );
        for (_, entry) in self.streams.drain() {
            match entry {
                StreamEntry::PendingResponse { reply } => {
                    let _ = reply.send(Err(error.clone()));
                }
                StreamEntry::Receiver { events, .. } => {
                    let _ = events.send(StreamSignal::Error(error.clone()));
                }
                StreamEntry::Responding { cancel } | StreamEntry::Sender { cancel, .. } => {
                    let _ = cancel.send(true);
                }
                StreamEntry::Channel { receiver, cancel, .. } => {
                    if let Some(events) = receiver {
                        let _ = events.send(StreamSignal::Error(error.clone()));
                    }
                    let _ = cancel.send(true);
                }
            }
        }
        self.tokens.clear();
        self.closed_tx.send_replace(true);
        self.outbound.shutdown();
    }
}
