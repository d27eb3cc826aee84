//! End-to-end interaction tests over the local transport.

mod common;

use common::{
    connected_pair, connected_pair_with, init_tracing, next_data_frame, EchoService,
    MirrorService, RecordingService,
};
use assert_matches::assert_matches;
use bytes::Bytes;
use futures::StreamExt;
use rsocket_core::{
    connect,
    frame::{Frame, FrameBody},
    ConnectionConfig, DuplexConnection, FrameSink, Payload, RSocketError, RSocketResult,
};
use rsocket_transport_local::LocalDuplexConnection;
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::timeout};

#[tokio::test]
async fn test_request_response() -> eyre::Result<()> {
    init_tracing();
    let (client, _server) = connected_pair().await;

    let response = client.request_response(Payload::from("hello")).await?;
    assert_eq!(response.data_utf8(), Some("hello world"));
    Ok(())
}

#[tokio::test]
async fn test_request_response_round_trips_bytes() -> eyre::Result<()> {
    init_tracing();
    let (client, _server) = connected_pair_with(
        Arc::new(MirrorService),
        ConnectionConfig::default(),
        ConnectionConfig::default(),
    )
    .await;

    let payload = Payload::new(
        Bytes::from_static(b"\x00\x01data"),
        Some(Bytes::from_static(b"\xffmeta")),
    );
    let response = client.request_response(payload.clone()).await?;
    assert_eq!(response, payload);

    // empty payload survives untouched and keeps metadata absent
    let empty = client.request_response(Payload::empty()).await?;
    assert_eq!(empty.data().len(), 0);
    assert!(!empty.has_metadata());
    Ok(())
}

#[tokio::test]
async fn test_server_side_requester() -> eyre::Result<()> {
    init_tracing();
    let (_client, server) = connected_pair().await;

    // the connection is symmetric: the server can originate requests too
    let response = server.request_response(Payload::from("hello")).await?;
    assert_eq!(response.data_utf8(), Some("hello world"));
    Ok(())
}

#[tokio::test]
async fn test_request_stream_full_consumption() -> eyre::Result<()> {
    init_tracing();
    let (client, _server) = connected_pair().await;

    let values: Vec<_> = client
        .request_stream(Payload::from("hello"))
        .map(|item| item.expect("stream item"))
        .collect()
        .await;
    assert_eq!(values.len(), 100);
    assert_eq!(values[0].data_utf8(), Some("hello world 0"));
    assert_eq!(values[99].data_utf8(), Some("hello world 99"));
    Ok(())
}

/// Take 2 of 100 with an initial window of 2. The wire
/// must carry exactly REQUEST_STREAM(n=2), two NEXT frames, and CANCEL.
#[tokio::test]
async fn test_stream_partial_consumption_frames() -> eyre::Result<()> {
    init_tracing();
    let (left, right) = LocalDuplexConnection::pair();
    let client = connect(left, ConnectionConfig::default(), None).await?;
    let (mut peer_sink, mut peer_stream) = right.split();

    // the peer sees SETUP first
    let setup = next_data_frame(&mut peer_stream).await;
    assert_matches!(setup.body, FrameBody::Setup(_));

    let responses = client.request_stream_with_prefetch(Payload::from("hello"), 2);

    let taken = tokio::spawn(async move {
        responses
            .take(2)
            .map(|item| item.expect("stream item"))
            .collect::<Vec<_>>()
            .await
    });

    let request = next_data_frame(&mut peer_stream).await;
    let stream_id = request.stream_id;
    assert_matches!(
        request.body,
        FrameBody::RequestStream { initial_request_n: 2, ref payload } if payload.data_utf8() == Some("hello")
    );

    for i in 0..2 {
        let payload = Payload::from_data(format!("hello world {i}").into_bytes());
        peer_sink.send(Frame::payload_next(stream_id, payload)).await?;
    }

    let values = taken.await?;
    assert_eq!(values.len(), 2);
    assert_eq!(values[0].data_utf8(), Some("hello world 0"));
    assert_eq!(values[1].data_utf8(), Some("hello world 1"));

    // dropping the receiver after two elements cancels the stream; no
    // REQUEST_N may precede it
    let cancel = next_data_frame(&mut peer_stream).await;
    assert_eq!(cancel.stream_id, stream_id);
    assert_matches!(cancel.body, FrameBody::Cancel);
    Ok(())
}

/// Window of 1: exactly one NEXT is allowed, then the stream pauses
/// until the consumer's demand turns into REQUEST_N.
#[tokio::test]
async fn test_initial_request_n_of_one_pauses() -> eyre::Result<()> {
    init_tracing();
    let (left, right) = LocalDuplexConnection::pair();
    let client = connect(left, ConnectionConfig::default(), None).await?;
    let (mut peer_sink, mut peer_stream) = right.split();

    let setup = next_data_frame(&mut peer_stream).await;
    assert_matches!(setup.body, FrameBody::Setup(_));

    let mut responses = client.request_stream_with_prefetch(Payload::from("one"), 1);

    // opening the stream needs a first poll; run it concurrently
    let first = tokio::spawn(async move {
        let first = responses.next().await;
        (responses, first)
    });

    let request = next_data_frame(&mut peer_stream).await;
    let stream_id = request.stream_id;
    assert_matches!(request.body, FrameBody::RequestStream { initial_request_n: 1, .. });

    peer_sink.send(Frame::payload_next(stream_id, Payload::from("a"))).await?;
    let (mut responses, first) = first.await?;
    assert_eq!(first.unwrap()?.data_utf8(), Some("a"));

    // the second poll flushes the consumed demand as REQUEST_N(1)
    let second = tokio::spawn(async move { responses.next().await });
    let refill = next_data_frame(&mut peer_stream).await;
    assert_eq!(refill.stream_id, stream_id);
    assert_matches!(refill.body, FrameBody::RequestN { n: 1 });

    peer_sink.send(Frame::payload_next_complete(stream_id, Payload::from("b"))).await?;
    let second = second.await?;
    assert_eq!(second.unwrap()?.data_utf8(), Some("b"));
    Ok(())
}

/// An empty response stream completes with PAYLOAD{COMPLETE} and no
/// NEXT; the subscriber sees no elements.
#[tokio::test]
async fn test_empty_stream_completes() -> eyre::Result<()> {
    init_tracing();
    let (client, _server) = connected_pair_with(
        Arc::new(MirrorService),
        ConnectionConfig::default(),
        ConnectionConfig::default(),
    )
    .await;

    let values: Vec<_> = client.request_stream(Payload::from("none")).collect().await;
    assert!(values.is_empty());
    Ok(())
}

/// Channel echo with a three-element upstream.
#[tokio::test]
async fn test_channel_echo() -> eyre::Result<()> {
    init_tracing();
    let (client, _server) = connected_pair().await;

    let upstream = futures::stream::iter(["1", "2", "3"])
        .map(|text| Ok::<_, RSocketError>(Payload::from(text)))
        .boxed();
    let echoes: Vec<_> = client
        .request_channel(upstream)
        .map(|item| item.expect("channel item"))
        .collect()
        .await;

    let texts: Vec<_> = echoes.iter().map(|p| p.data_utf8().unwrap().to_owned()).collect();
    assert_eq!(texts, vec!["1_echo", "2_echo", "3_echo"]);
    Ok(())
}

/// Channel upstream fed from a live channel, crossing both directions
/// concurrently.
#[tokio::test]
async fn test_channel_interleaved() -> eyre::Result<()> {
    init_tracing();
    let (client, _server) = connected_pair().await;

    let (tx, rx) = mpsc::channel::<RSocketResult<Payload>>(4);
    let upstream = tokio_stream::wrappers::ReceiverStream::new(rx).boxed();
    let mut echoes = client.request_channel(upstream);

    for i in 0..10 {
        tx.send(Ok(Payload::from_data(format!("{i}").into_bytes()))).await?;
        let echoed = timeout(Duration::from_secs(5), echoes.next())
            .await?
            .expect("echo arrives")?;
        assert_eq!(echoed.data_utf8(), Some(format!("{i}_echo").as_str()));
    }
    drop(tx);
    assert!(echoes.next().await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_fire_and_forget_and_metadata_push() -> eyre::Result<()> {
    init_tracing();
    let (sink, mut recorded) = mpsc::unbounded_channel();
    let (client, _server) = connected_pair_with(
        Arc::new(RecordingService { sink }),
        ConnectionConfig::default(),
        ConnectionConfig::default(),
    )
    .await;

    client.fire_and_forget(Payload::from("orders")).await?;
    let (kind, payload) = timeout(Duration::from_secs(5), recorded.recv())
        .await?
        .expect("fnf recorded");
    assert_eq!(kind, "fire_and_forget");
    assert_eq!(payload.data_utf8(), Some("orders"));

    client
        .metadata_push(Payload::from_metadata(Bytes::from_static(b"routing-table")))
        .await?;
    let (kind, payload) = timeout(Duration::from_secs(5), recorded.recv())
        .await?
        .expect("push recorded");
    assert_eq!(kind, "metadata_push");
    assert_eq!(payload.metadata().map(|m| m.as_ref()), Some(&b"routing-table"[..]));

    // metadata-push without metadata is rejected locally
    let error = client.metadata_push(Payload::from("data-only")).await.unwrap_err();
    assert_matches!(error, RSocketError::Invalid(_));
    Ok(())
}

/// The credit invariant: a responder never emits more NEXT frames than
/// granted, even with a fast handler.
#[tokio::test]
async fn test_responder_respects_credit() -> eyre::Result<()> {
    init_tracing();
    let (mut peer_sink, mut peer_stream, _server) = common::manual_client_to_server(
        Arc::new(EchoService),
        ConnectionConfig::default(),
        false,
    )
    .await;

    peer_sink.send(Frame::request_stream(1, 3, Payload::from("hello"))).await?;

    for i in 0..3 {
        let frame = next_data_frame(&mut peer_stream).await;
        assert_eq!(frame.stream_id, 1);
        assert_matches!(
            &frame.body,
            FrameBody::Payload { next: true, payload, .. }
                if payload.data_utf8() == Some(format!("hello world {i}").as_str())
        );
    }

    // no fourth NEXT without further REQUEST_N
    let quiet = timeout(Duration::from_millis(300), async {
        loop {
            let frame = next_data_frame(&mut peer_stream).await;
            if matches!(frame.body, FrameBody::Payload { next: true, .. }) {
                return frame;
            }
        }
    })
    .await;
    assert!(quiet.is_err(), "responder emitted past its credit window");

    // granting more credit resumes emission
    peer_sink.send(Frame::request_n(1, 2)).await?;
    let frame = next_data_frame(&mut peer_stream).await;
    assert_matches!(&frame.body, FrameBody::Payload { next: true, payload, .. }
        if payload.data_utf8() == Some("hello world 3"));
    Ok(())
}

/// After a completed interaction both sides keep working; order within
/// a stream is preserved end-to-end.
#[tokio::test]
async fn test_order_preservation_across_requests() -> eyre::Result<()> {
    init_tracing();
    let (client, _server) = connected_pair().await;

    for _ in 0..3 {
        let values: Vec<_> = client
            .request_stream_with_prefetch(Payload::from("ping"), 16)
            .map(|item| item.expect("stream item"))
            .collect()
            .await;
        assert_eq!(values.len(), 100);
        for (i, value) in values.iter().enumerate() {
            assert_eq!(value.data_utf8(), Some(format!("ping world {i}").as_str()));
        }
    }
    Ok(())
}
