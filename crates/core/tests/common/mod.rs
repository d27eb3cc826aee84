//! Fixtures shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use futures::{stream, StreamExt};
use rsocket_core::{
    accept, connect,
    frame::{Frame, FrameBody},
    ConnectionConfig, DuplexConnection, FrameStream, Payload, PayloadStream, RSocket,
    RSocketHandle, RSocketResult,
};
use rsocket_transport_local::LocalDuplexConnection;
use std::sync::{Arc, Once};
use tokio::{sync::mpsc, time::timeout};

static INIT: Once = Once::new();

/// Opt-in log output for debugging test failures.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// The handler used by most scenarios: appends " world" to
/// request/response data, serves a 100-element stream, echoes channels
/// with an "_echo" suffix.
pub struct EchoService;

#[async_trait]
impl RSocket for EchoService {
    async fn fire_and_forget(&self, _payload: Payload) -> RSocketResult<()> {
        Ok(())
    }

    async fn request_response(&self, payload: Payload) -> RSocketResult<Payload> {
        let text = payload.data_utf8().unwrap_or_default().to_owned();
        Ok(Payload::from_data(format!("{text} world").into_bytes()))
    }

    fn request_stream(&self, payload: Payload) -> PayloadStream {
        let text = payload.data_utf8().unwrap_or_default().to_owned();
        stream::iter(0..100)
            .map(move |i| Ok(Payload::from_data(format!("{text} world {i}").into_bytes())))
            .boxed()
    }

    fn request_channel(&self, payloads: PayloadStream) -> PayloadStream {
        payloads
            .map(|item| {
                item.map(|payload| {
                    let text = payload.data_utf8().unwrap_or_default();
                    Payload::from_data(format!("{text}_echo").into_bytes())
                })
            })
            .boxed()
    }

    async fn metadata_push(&self, _payload: Payload) -> RSocketResult<()> {
        Ok(())
    }
}

/// Returns every payload byte-identical, metadata included.
pub struct MirrorService;

#[async_trait]
impl RSocket for MirrorService {
    async fn request_response(&self, payload: Payload) -> RSocketResult<Payload> {
        Ok(payload)
    }

    fn request_stream(&self, _payload: Payload) -> PayloadStream {
        stream::empty().boxed()
    }
}

/// Never answers; used to keep responder-side streams active.
pub struct NeverService;

#[async_trait]
impl RSocket for NeverService {
    async fn request_response(&self, _payload: Payload) -> RSocketResult<Payload> {
        futures::future::pending().await
    }
}

/// Forwards fire-and-forget and metadata-push payloads to the test.
pub struct RecordingService {
    pub sink: mpsc::UnboundedSender<(&'static str, Payload)>,
}

#[async_trait]
impl RSocket for RecordingService {
    async fn fire_and_forget(&self, payload: Payload) -> RSocketResult<()> {
        let _ = self.sink.send(("fire_and_forget", payload));
        Ok(())
    }

    async fn metadata_push(&self, payload: Payload) -> RSocketResult<()> {
        let _ = self.sink.send(("metadata_push", payload));
        Ok(())
    }
}

/// Connect a client and a server over the local transport with the
/// given responder on the server side.
pub async fn connected_pair_with(
    responder: Arc<dyn RSocket>,
    client_config: ConnectionConfig,
    server_config: ConnectionConfig,
) -> (RSocketHandle, RSocketHandle) {
    let (left, right) = LocalDuplexConnection::pair();
    let server_task =
        tokio::spawn(
            async move { accept(right, server_config, move |_setup, _peer| Ok(responder)).await },
        );
    let client = connect(left, client_config, Some(Arc::new(EchoService) as Arc<dyn RSocket>))
        .await
        .expect("client connects");
    let server = server_task.await.expect("accept task").expect("server accepts");
    (client, server)
}

/// [`connected_pair_with`] using [`EchoService`] and default configs.
pub async fn connected_pair() -> (RSocketHandle, RSocketHandle) {
    connected_pair_with(
        Arc::new(EchoService),
        ConnectionConfig::default(),
        ConnectionConfig::default(),
    )
    .await
}

/// A SETUP frame the manual test peers send to a real server.
pub fn client_setup_frame(lease: bool) -> Frame {
    Frame::setup(rsocket_core::frame::Setup {
        version: rsocket_core::frame::Version::V1,
        keepalive_interval: std::time::Duration::from_secs(20),
        max_lifetime: std::time::Duration::from_secs(90),
        lease,
        resume_token: None,
        metadata_mime_type: "application/binary".into(),
        data_mime_type: "application/binary".into(),
        payload: Payload::empty(),
    })
}

/// Accept a real server connection driven by a hand-rolled client that
/// speaks raw frames.
pub async fn manual_client_to_server(
    responder: Arc<dyn RSocket>,
    server_config: ConnectionConfig,
    lease: bool,
) -> (
    rsocket_transport_local::LocalFrameSink,
    rsocket_transport_local::LocalFrameStream,
    RSocketHandle,
) {
    use rsocket_core::FrameSink as _;

    let (left, right) = LocalDuplexConnection::pair();
    let server_task =
        tokio::spawn(
            async move { accept(right, server_config, move |_setup, _peer| Ok(responder)).await },
        );
    let (mut sink, stream) = left.split();
    sink.send(client_setup_frame(lease)).await.expect("setup sent");
    let server = server_task.await.expect("accept task").expect("server accepts");
    (sink, stream, server)
}

/// Next frame that is not a KEEPALIVE, with a timeout.
pub async fn next_data_frame<S: FrameStream>(stream: &mut S) -> Frame {
    loop {
        let frame = timeout(std::time::Duration::from_secs(5), stream.next_frame())
            .await
            .expect("frame within timeout")
            .expect("transport open")
            .expect("frame decodes");
        if !matches!(frame.body, FrameBody::Keepalive { .. }) {
            return frame;
        }
    }
}
