//! Public socket surface: the interaction contract plus the
//! `connect`/`accept` entry points.
//!
//! Both ends of a connection are symmetric: each side holds a requester
//! handle for outgoing interactions and supplies a responder for
//! incoming ones. The acceptor callback receives the parsed SETUP and
//! the peer-facing requester handle, mirroring the server contract of
//! the original protocol.

use crate::{
    config::ConnectionConfig,
    connection::{DuplexConnection, FrameSink, FrameStream as _, PendingConnection},
    error::{codes, RSocketError, RSocketResult},
    frame::{Frame, FrameBody, Setup, Version},
    payload::Payload,
    requester::RSocketHandle,
    stream_id::Side,
};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use std::{sync::Arc, time::Duration};
use tracing::debug;

/// A lazily evaluated sequence of payloads with an error channel.
pub type PayloadStream = futures::stream::BoxStream<'static, RSocketResult<Payload>>;

/// The five interaction models, implemented by both requester handles
/// and application responders.
///
/// Every method has a default that reports the interaction as
/// unsupported, so a responder only implements what it serves.
#[async_trait]
pub trait RSocket: Send + Sync + 'static {
    /// Send a payload with no response.
    async fn fire_and_forget(&self, payload: Payload) -> RSocketResult<()> {
        let _ = payload;
        Err(RSocketError::Unsupported("fire_and_forget"))
    }

    /// Send a request, receive exactly one response payload.
    async fn request_response(&self, payload: Payload) -> RSocketResult<Payload> {
        let _ = payload;
        Err(RSocketError::Unsupported("request_response"))
    }

    /// Send a request, receive a stream of payloads.
    fn request_stream(&self, payload: Payload) -> PayloadStream {
        let _ = payload;
        stream::once(async { Err(RSocketError::Unsupported("request_stream")) }).boxed()
    }

    /// Exchange two streams of payloads over one stream id.
    fn request_channel(&self, payloads: PayloadStream) -> PayloadStream {
        drop(payloads);
        stream::once(async { Err(RSocketError::Unsupported("request_channel")) }).boxed()
    }

    /// Push connection-level metadata; no response.
    async fn metadata_push(&self, payload: Payload) -> RSocketResult<()> {
        let _ = payload;
        Err(RSocketError::Unsupported("metadata_push"))
    }
}

#[async_trait]
impl RSocket for RSocketHandle {
    async fn fire_and_forget(&self, payload: Payload) -> RSocketResult<()> {
        RSocketHandle::fire_and_forget(self, payload).await
    }

    async fn request_response(&self, payload: Payload) -> RSocketResult<Payload> {
        RSocketHandle::request_response(self, payload).await
    }

    fn request_stream(&self, payload: Payload) -> PayloadStream {
        RSocketHandle::request_stream(self, payload)
    }

    fn request_channel(&self, payloads: PayloadStream) -> PayloadStream {
        RSocketHandle::request_channel(self, payloads)
    }

    async fn metadata_push(&self, payload: Payload) -> RSocketResult<()> {
        RSocketHandle::metadata_push(self, payload).await
    }
}

/// A responder that rejects every interaction; the default for clients
/// that only originate requests.
pub struct UnsupportedResponder;

#[async_trait]
impl RSocket for UnsupportedResponder {}

/// The peer's SETUP as surfaced to the acceptor callback.
#[derive(Debug, Clone)]
pub struct SetupPayload {
    /// Declared protocol version.
    pub version: Version,
    /// The client's keepalive tick period.
    pub keepalive_interval: Duration,
    /// The client's declared maximum lifetime.
    pub max_lifetime: Duration,
    /// The client asked for LEASE admission control.
    pub lease: bool,
    /// MIME type for metadata on this connection.
    pub metadata_mime_type: String,
    /// MIME type for data on this connection.
    pub data_mime_type: String,
    /// Payload carried by the SETUP frame.
    pub payload: Payload,
}

impl From<&Setup> for SetupPayload {
    fn from(setup: &Setup) -> Self {
        Self {
            version: setup.version,
            keepalive_interval: setup.keepalive_interval,
            max_lifetime: setup.max_lifetime,
            lease: setup.lease,
            metadata_mime_type: setup.metadata_mime_type.clone(),
            data_mime_type: setup.data_mime_type.clone(),
            payload: setup.payload.clone(),
        }
    }
}

/// Open the client side of a connection: send SETUP and start the
/// engine. `responder` handles server-initiated interactions; pass
/// `None` to reject them all.
pub async fn connect<C>(
    connection: C,
    config: ConnectionConfig,
    responder: Option<Arc<dyn RSocket>>,
) -> RSocketResult<RSocketHandle>
where
    C: DuplexConnection,
{
    config.validate()?;
    let (mut sink, stream) = connection.split();

    // SETUP must be the first frame on the wire, ahead of any keepalive
    // the driver might tick out, so it goes through the sink directly
    sink.send(Frame::setup(Setup {
        version: Version::V1,
        keepalive_interval: config.keepalive_period,
        max_lifetime: config.max_lifetime,
        lease: config.honor_lease,
        resume_token: None,
        metadata_mime_type: config.metadata_mime_type.clone(),
        data_mime_type: config.data_mime_type.clone(),
        payload: config.setup_payload.clone(),
    }))
    .await?;

    let (handle, pending) = PendingConnection::new(Side::Client, config, sink, stream);
    pending.launch(responder.unwrap_or_else(|| Arc::new(UnsupportedResponder)));
    debug!(target: "rsocket::connection", "client connection established");
    Ok(handle)
}

/// Accept the server side of a connection: require SETUP as the first
/// frame, negotiate, then hand the setup payload and the peer-facing
/// requester handle to `acceptor`, which returns the responder for this
/// connection.
pub async fn accept<C, A>(
    connection: C,
    config: ConnectionConfig,
    acceptor: A,
) -> RSocketResult<RSocketHandle>
where
    C: DuplexConnection,
    A: FnOnce(SetupPayload, RSocketHandle) -> RSocketResult<Arc<dyn RSocket>>,
{
    config.validate()?;
    let (mut sink, mut stream) = connection.split();

    let first = match stream.next_frame().await {
        Some(Ok(frame)) => frame,
        Some(Err(error)) => return Err(error),
        None => return Err(RSocketError::ClosedChannel),
    };

    let first_stream_id = first.stream_id;
    let setup = match first.body {
        FrameBody::Setup(setup) if first_stream_id == 0 => *setup,
        _ => {
            let error = RSocketError::InvalidSetup("first frame must be SETUP".into());
            reject_handshake(&mut sink, &error).await;
            return Err(error);
        }
    };

    if setup.version.major != Version::V1.major {
        let error = RSocketError::UnsupportedSetup(format!(
            "unsupported protocol version {}.{}",
            setup.version.major, setup.version.minor
        ));
        reject_handshake(&mut sink, &error).await;
        return Err(error);
    }
    if setup.resume_token.is_some() {
        let error = RSocketError::UnsupportedSetup("resumption not supported".into());
        reject_handshake(&mut sink, &error).await;
        return Err(error);
    }
    if setup.lease && !config.honor_lease {
        let error = RSocketError::UnsupportedSetup("lease not supported".into());
        reject_handshake(&mut sink, &error).await;
        return Err(error);
    }

    // lease admission is in effect only when both sides asked for it
    let mut negotiated = config;
    negotiated.honor_lease = setup.lease && negotiated.honor_lease;

    let setup_payload = SetupPayload::from(&setup);
    debug!(
        target: "rsocket::connection",
        keepalive_ms = setup.keepalive_interval.as_millis() as u64,
        lease = negotiated.honor_lease,
        data_mime = %setup_payload.data_mime_type,
        "accepting connection"
    );

    let (handle, pending) = PendingConnection::new(Side::Server, negotiated, sink, stream);
    match acceptor(setup_payload, handle.clone()) {
        Ok(responder) => {
            pending.launch(responder);
            Ok(handle)
        }
        Err(error) => {
            pending.reject(codes::REJECTED_SETUP, &error.wire_message());
            Err(RSocketError::RejectedSetup(error.wire_message()))
        }
    }
}

/// Send a handshake ERROR on stream 0 and close the sink.
async fn reject_handshake<S: FrameSink>(sink: &mut S, error: &RSocketError) {
    let _ = sink.send(Frame::error(0, error.wire_code(), error.wire_message())).await;
    let _ = sink.close().await;
}
