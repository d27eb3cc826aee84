//! Keepalive liveness tests, run under virtual time.

mod common;

use common::{init_tracing, next_data_frame};
use assert_matches::assert_matches;
use rsocket_core::{
    connect,
    frame::{Frame, FrameBody},
    ConnectionConfig, DuplexConnection, FrameSink, FrameStream, Payload, RSocketError,
};
use rsocket_transport_local::LocalDuplexConnection;
use std::time::Duration;

fn fast_keepalive_config() -> ConnectionConfig {
    ConnectionConfig {
        keepalive_period: Duration::from_millis(100),
        missed_keepalive_threshold: 3,
        ..Default::default()
    }
}

/// A silent peer kills the connection after the missed
/// ack threshold, and every outstanding subscriber sees the timeout.
#[tokio::test(start_paused = true)]
async fn test_keepalive_timeout_closes_connection() -> eyre::Result<()> {
    init_tracing();
    let (left, right) = LocalDuplexConnection::pair();
    let client = connect(left, fast_keepalive_config(), None).await?;

    // the peer reads frames but never echoes keepalives
    let (peer_sink, mut peer_stream) = right.split();
    tokio::spawn(async move {
        let _sink = peer_sink;
        while peer_stream.next_frame().await.is_some() {}
    });

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.request_response(Payload::from("ping")).await }
    });

    client.on_close().await;
    assert!(client.is_closed());
    assert_eq!(client.availability(), 0.0);

    let error = pending.await?.unwrap_err();
    assert_matches!(error, RSocketError::ConnectionError(message) if message == "keepalive timeout");
    Ok(())
}

/// Echoed keepalives keep the connection alive indefinitely.
#[tokio::test(start_paused = true)]
async fn test_echoed_keepalives_sustain_connection() -> eyre::Result<()> {
    init_tracing();
    let (left, right) = LocalDuplexConnection::pair();
    let client = connect(left, fast_keepalive_config(), None).await?;

    // a peer that echoes every keepalive demanding a response
    let (mut peer_sink, mut peer_stream) = right.split();
    tokio::spawn(async move {
        while let Some(Ok(frame)) = peer_stream.next_frame().await {
            if let FrameBody::Keepalive { respond: true, data, .. } = frame.body {
                if peer_sink.send(Frame::keepalive(false, 0, data)).await.is_err() {
                    break;
                }
            }
        }
    });

    // far past the timeout horizon
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!client.is_closed());
    assert_eq!(client.availability(), 1.0);
    Ok(())
}

/// The receiver of KEEPALIVE{RESPOND} must echo it immediately with the
/// payload intact and the flag cleared.
#[tokio::test]
async fn test_keepalive_echo_carries_payload() -> eyre::Result<()> {
    init_tracing();
    let (left, right) = LocalDuplexConnection::pair();
    let _client = connect(left, ConnectionConfig::default(), None).await?;
    let (mut peer_sink, mut peer_stream) = right.split();

    let setup = next_data_frame(&mut peer_stream).await;
    assert_matches!(setup.body, FrameBody::Setup(_));

    peer_sink
        .send(Frame::keepalive(true, 7, bytes::Bytes::from_static(b"heartbeat")))
        .await?;

    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), peer_stream.next_frame())
            .await?
            .expect("transport open")?;
        if let FrameBody::Keepalive { respond, ref data, .. } = frame.body {
            // skip the client's own RESPOND ticks; wait for our echo
            if !respond {
                assert_eq!(data.as_ref(), b"heartbeat");
                break;
            }
        }
    }
    Ok(())
}
