//! Inbound frame routing by stream-id parity.
//!
//! Both peers share one framed pipe. Frames for stream 0 control the
//! connection; for every other id, parity decides whether the frame
//! belongs to a locally initiated stream (requester traffic) or a
//! peer-initiated one (responder traffic).

use crate::stream_id::Side;

/// Destination for an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    /// Connection-level frame: SETUP, KEEPALIVE, LEASE, ERROR(0),
    /// METADATA_PUSH.
    StreamZero,
    /// Frame for a stream this side initiated.
    Requester,
    /// Frame for a stream the peer initiated.
    Responder,
}

/// Route an inbound frame by stream id.
pub(crate) fn route(side: Side, stream_id: u32) -> Route {
    if stream_id == 0 {
        Route::StreamZero
    } else if side.initiated_locally(stream_id) {
        Route::Requester
    } else {
        Route::Responder
    }
}
