//! RSocket protocol engine (protocol version 1.0).
//!
//! This crate implements the per-connection core of the protocol: the
//! binary frame codec, stream-id allocation and demultiplexing, the
//! per-stream state machines for the four interaction models
//! (fire-and-forget, request/response, request/stream, request/channel)
//! plus metadata-push, REQUEST_N credit flow, keepalive liveness, and
//! optional LEASE admission control.
//!
//! Concrete transports are external: anything implementing
//! [`DuplexConnection`] works, from a TCP adapter using the
//! length-prefixed helpers in [`frame`] to an in-process pipe.
//!
//! ```no_run
//! # use rsocket_core::{connect, ConnectionConfig, Payload};
//! # async fn example<C: rsocket_core::DuplexConnection>(transport: C) -> rsocket_core::RSocketResult<()> {
//! let socket = connect(transport, ConnectionConfig::default(), None).await?;
//! let response = socket.request_response(Payload::from("ping")).await?;
//! println!("{:?}", response.data_utf8());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod config;
mod connection;
mod error;
pub mod frame;
mod keepalive;
mod lease;
mod multiplexer;
mod payload;
mod requester;
mod responder;
mod socket;
mod stream_id;

pub use config::{
    ConnectionConfig, DEFAULT_KEEPALIVE_PERIOD, DEFAULT_MAX_LIFETIME, DEFAULT_MIME_TYPE,
    DEFAULT_MISSED_KEEPALIVE_THRESHOLD, DEFAULT_PREFETCH,
};
pub use connection::{DuplexConnection, FrameSink, FrameStream};
pub use error::{codes, default_error_consumer, ErrorConsumer, FrameError, RSocketError, RSocketResult};
pub use lease::{FairLeaseDistributor, Lease, LeaseRegistration};
pub use payload::Payload;
pub use requester::RSocketHandle;
pub use socket::{accept, connect, PayloadStream, RSocket, SetupPayload, UnsupportedResponder};
pub use stream_id::Side;
