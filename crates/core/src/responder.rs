//! Responder side: accepts peer-initiated interactions and owns the
//! per-stream emission state.
//!
//! Every interaction that can suspend runs in its own task: a
//! request/response task races the handler against cancellation, and
//! stream/channel emission pumps pull from the handler's output under
//! REQUEST_N credit. The driver only routes frames and flips state.

use crate::{
    connection::{ConnectionDriver, Internal, ProtocolViolation, StreamEntry, StreamSignal},
    connection::outbound::OutboundHandle,
    error::{codes, ErrorConsumer, RSocketError},
    frame::{Frame, FrameBody},
    payload::Payload,
    requester::{add_credit, StreamReceiver},
    socket::{PayloadStream, RSocket},
};
use futures::StreamExt;
use std::sync::{atomic::Ordering, Arc};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::trace;

impl ConnectionDriver {
    /// Dispatch a frame for a stream the peer initiated.
    pub(crate) fn on_responder_frame(&mut self, frame: Frame) -> Result<(), ProtocolViolation> {
        let stream_id = frame.stream_id;

        if frame.is_request() {
            if self.streams.contains_key(&stream_id) {
                return Err(ProtocolViolation::connection(format!(
                    "duplicate request for active stream {stream_id}"
                )));
            }
            if stream_id <= self.max_peer_stream_id {
                // request for an id already allocated and closed: a race
                // with cancellation, not an error
                trace!(target: "rsocket::responder", stream_id, "request for closed stream");
                return Ok(());
            }
            self.max_peer_stream_id = stream_id;

            if !self.lease.use_outbound() {
                self.outbound.send_control(Frame::error(
                    stream_id,
                    codes::REJECTED,
                    "lease exhausted",
                ));
                return Ok(());
            }
            self.accept_request(frame);
            return Ok(());
        }

        let Some(entry) = self.streams.remove(&stream_id) else {
            if stream_id <= self.max_peer_stream_id {
                trace!(target: "rsocket::responder", stream_id, "late frame for closed stream");
                return Ok(());
            }
            return Err(ProtocolViolation::connection(format!(
                "frame for never-existed stream {stream_id}"
            )));
        };

        match frame.body {
            FrameBody::Payload { next, complete, payload, .. } => {
                self.on_channel_input(stream_id, entry, next, complete, payload);
            }
            FrameBody::RequestN { n } => {
                match &entry {
                    StreamEntry::Sender { credits, .. }
                    | StreamEntry::Channel { credits, .. } => add_credit(credits, n),
                    _ => {
                        trace!(target: "rsocket::responder", stream_id, "REQUEST_N for non-emitting stream");
                    }
                }
                self.streams.insert(stream_id, entry);
            }
            FrameBody::Cancel => self.on_peer_cancel(stream_id, entry),
            FrameBody::Error { code, message } => {
                self.on_channel_input_error(
                    stream_id,
                    entry,
                    RSocketError::from_wire(code, message),
                );
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

    /// Start the interaction a request frame opens.
    fn accept_request(&mut self, frame: Frame) {
        let stream_id = frame.stream_id;
        match frame.body {
            FrameBody::RequestFnf { payload } => {
                spawn_fnf_task(self.responder.clone(), payload, self.config.error_consumer.clone());
            }
            FrameBody::RequestResponse { payload } => {
                let (cancel_tx, cancel_rx) = watch::channel(false);
                self.streams.insert(stream_id, StreamEntry::Responding { cancel: cancel_tx });
                spawn_response_task(
                    self.responder.clone(),
                    stream_id,
                    payload,
                    cancel_rx,
                    self.outbound.clone(),
                    self.internal_tx.clone(),
                );
            }
            FrameBody::RequestStream { initial_request_n, payload } => {
                let credits = Arc::new(Semaphore::new(initial_request_n as usize));
                let (cancel_tx, cancel_rx) = watch::channel(false);
                self.streams.insert(
                    stream_id,
                    StreamEntry::Sender { credits: credits.clone(), cancel: cancel_tx },
                );
                let source = self.responder.request_stream(payload);
                spawn_sender_pump(
                    stream_id,
                    source,
                    credits,
                    cancel_rx,
                    self.outbound.clone(),
                    self.internal_tx.clone(),
                );
            }
            FrameBody::RequestChannel { initial_request_n, complete, payload } => {
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                // an empty opening payload with COMPLETE marks an empty
                // upstream, not a one-element one
                if !(complete && payload.is_empty()) {
                    let _ = events_tx.send(StreamSignal::Next(payload));
                }
                if complete {
                    let _ = events_tx.send(StreamSignal::Complete);
                }
                let input = StreamReceiver::channel_input(
                    self.command_tx.clone(),
                    token,
                    events_rx,
                    self.config.prefetch,
                );

                let credits = Arc::new(Semaphore::new(initial_request_n as usize));
                let (cancel_tx, cancel_rx) = watch::channel(false);
                self.tokens.insert(token, stream_id);
                self.streams.insert(
                    stream_id,
                    StreamEntry::Channel {
                        token,
                        initiator: false,
                        receiver: if complete { None } else { Some(events_tx) },
                        credits: credits.clone(),
                        cancel: cancel_tx,
                        sender_done: false,
                    },
                );

                let output = self.responder.request_channel(Box::pin(input));
                spawn_sender_pump(
                    stream_id,
                    output,
                    credits,
                    cancel_rx,
                    self.outbound.clone(),
                    self.internal_tx.clone(),
                );
            }
            _ => unreachable!("accept_request called for non-request frame"),
        }
    }

    /// PAYLOAD on a peer-initiated stream feeds the channel input half;
    /// COMPLETE terminates the input side only.
    fn on_channel_input(
        &mut self,
        stream_id: u32,
        entry: StreamEntry,
        next: bool,
        complete: bool,
        payload: Payload,
    ) {
        match entry {
            StreamEntry::Channel { token, initiator, mut receiver, credits, cancel, sender_done } => {
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
                trace!(target: "rsocket::responder", stream_id, "PAYLOAD for non-channel stream");
                self.streams.insert(stream_id, other);
            }
        }
    }

    /// CANCEL from the peer stops the emission half; for a channel the
    /// handler input is closed as canceled too.
    fn on_peer_cancel(&mut self, stream_id: u32, entry: StreamEntry) {
        match entry {
            StreamEntry::Responding { cancel } | StreamEntry::Sender { cancel, .. } => {
                let _ = cancel.send(true);
            }
            StreamEntry::Channel { token, receiver, cancel, .. } => {
                let _ = cancel.send(true);
                if let Some(events) = receiver {
                    let _ = events
                        .send(StreamSignal::Error(RSocketError::Canceled("canceled by peer".into())));
                }
                self.tokens.remove(&token);
            }
            other => {
                trace!(target: "rsocket::responder", stream_id, "CANCEL for receiving stream");
                self.streams.insert(stream_id, other);
            }
        }
    }

    /// ERROR from the requester terminates a channel's input side only;
    /// the emission half keeps running.
    fn on_channel_input_error(&mut self, stream_id: u32, entry: StreamEntry, error: RSocketError) {
        match entry {
            StreamEntry::Channel { token, initiator, receiver, credits, cancel, sender_done } => {
                if let Some(events) = receiver {
                    let _ = events.send(StreamSignal::Error(error));
                }
                if sender_done {
                    self.tokens.remove(&token);
                } else {
                    self.streams.insert(
                        stream_id,
                        StreamEntry::Channel {
                            token,
                            initiator,
                            receiver: None,
                            credits,
                            cancel,
                            sender_done,
                        },
                    );
                }
            }
            other => {
                trace!(target: "rsocket::responder", stream_id, "ERROR for emission-only stream");
                self.streams.insert(stream_id, other);
            }
        }
    }
}

/// Run the handler for a fire-and-forget request. The result is ignored
/// by design; failures go to the error consumer.
pub(crate) fn spawn_fnf_task(
    handler: Arc<dyn RSocket>,
    payload: Payload,
    consumer: ErrorConsumer,
) {
    tokio::spawn(async move {
        if let Err(error) = handler.fire_and_forget(payload).await {
            if !error.is_expected_close() {
                consumer(&error);
            }
        }
    });
}

/// Run the handler for a request/response, racing it against peer
/// cancellation.
pub(crate) fn spawn_response_task(
    handler: Arc<dyn RSocket>,
    stream_id: u32,
    payload: Payload,
    mut cancelled: watch::Receiver<bool>,
    outbound: OutboundHandle,
    internal: mpsc::UnboundedSender<Internal>,
) {
    tokio::spawn(async move {
        let outcome = tokio::select! {
            _ = cancelled.changed() => None,
            result = handler.request_response(payload) => Some(result),
        };
        match outcome {
            Some(Ok(response)) => {
                let _ = outbound.send(Frame::payload_next_complete(stream_id, response)).await;
            }
            Some(Err(error)) => {
                outbound.send_control(Frame::error(
                    stream_id,
                    error.wire_code(),
                    error.wire_message(),
                ));
            }
            // canceled: no frame may follow
            None => {}
        }
        let _ = internal.send(Internal::SenderFinished { stream_id });
    });
}

/// Pump payloads from `source` onto the wire, one REQUEST_N credit per
/// NEXT frame. Completion and errors are terminal; cancellation stops
/// the pump without emitting anything.
pub(crate) fn spawn_sender_pump(
    stream_id: u32,
    mut source: PayloadStream,
    credits: Arc<Semaphore>,
    mut cancelled: watch::Receiver<bool>,
    outbound: OutboundHandle,
    internal: mpsc::UnboundedSender<Internal>,
) {
    tokio::spawn(async move {
        loop {
            // one-element lookahead: terminals propagate without credit,
            // while a NEXT still waits for its REQUEST_N permit
            let item = tokio::select! {
                _ = cancelled.changed() => break,
                item = source.next() => item,
            };
            match item {
                Some(Ok(payload)) => {
                    let permit = tokio::select! {
                        _ = cancelled.changed() => break,
                        permit = credits.acquire() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    permit.forget();
                    if outbound.send(Frame::payload_next(stream_id, payload)).await.is_err() {
                        break;
                    }
                }
                Some(Err(error)) => {
                    outbound.send_control(Frame::error(
                        stream_id,
                        error.wire_code(),
                        error.wire_message(),
                    ));
                    break;
                }
                None => {
                    let _ = outbound.send(Frame::payload_complete(stream_id)).await;
                    break;
                }
            }
        }
        let _ = internal.send(Internal::SenderFinished { stream_id });
    });
}
