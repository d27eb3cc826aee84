//! Error types for the protocol engine.

use std::sync::Arc;
use thiserror::Error;

/// The result type for socket operations.
pub type RSocketResult<T> = Result<T, RSocketError>;

/// Wire error codes carried by ERROR frames.
pub mod codes {
    /// The peer's SETUP was unacceptable.
    pub const INVALID_SETUP: u32 = 0x0000_0001;
    /// A SETUP feature is not supported.
    pub const UNSUPPORTED_SETUP: u32 = 0x0000_0002;
    /// The acceptor rejected the connection.
    pub const REJECTED_SETUP: u32 = 0x0000_0003;
    /// Resumption was rejected.
    pub const REJECTED_RESUME: u32 = 0x0000_0004;
    /// Fatal connection error; close follows.
    pub const CONNECTION_ERROR: u32 = 0x0000_0101;
    /// Graceful close.
    pub const CONNECTION_CLOSE: u32 = 0x0000_0102;
    /// Handler-emitted error.
    pub const APPLICATION_ERROR: u32 = 0x0000_0201;
    /// Transient rejection, retryable by the application.
    pub const REJECTED: u32 = 0x0000_0202;
    /// The request was canceled.
    pub const CANCELED: u32 = 0x0000_0203;
    /// The request was malformed.
    pub const INVALID: u32 = 0x0000_0204;
}

/// Errors observable by application code.
///
/// Variants carrying a message map one-to-one onto wire error codes; the
/// remaining variants are local conditions that never leave this process.
#[derive(Debug, Clone, Error)]
pub enum RSocketError {
    /// The peer's SETUP frame was unacceptable.
    #[error("invalid setup: {0}")]
    InvalidSetup(String),
    /// A requested SETUP feature is not supported.
    #[error("unsupported setup: {0}")]
    UnsupportedSetup(String),
    /// The acceptor rejected the connection.
    #[error("setup rejected: {0}")]
    RejectedSetup(String),
    /// Resumption was rejected (resumption is never negotiated by this
    /// implementation, so this only ever arrives from a peer).
    #[error("resume rejected: {0}")]
    RejectedResume(String),
    /// Fatal connection-level error; the connection is closed.
    #[error("connection error: {0}")]
    ConnectionError(String),
    /// The peer closed the connection gracefully.
    #[error("connection close: {0}")]
    ConnectionClose(String),
    /// An error emitted by the remote handler.
    #[error("application error: {0}")]
    ApplicationError(String),
    /// Transient rejection; the request may be retried.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The stream was canceled.
    #[error("canceled: {0}")]
    Canceled(String),
    /// The request was malformed.
    #[error("invalid request: {0}")]
    Invalid(String),
    /// A peer error outside the predefined code range.
    #[error("peer error {code:#010x}: {message}")]
    Custom {
        /// Raw wire error code.
        code: u32,
        /// UTF-8 message from the ERROR frame.
        message: String,
    },
    /// The connection closed while the operation was outstanding.
    #[error("closed channel")]
    ClosedChannel,
    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// A frame could not be decoded.
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// The local handler does not implement this interaction.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl RSocketError {
    /// Build an error from a wire code and message.
    pub fn from_wire(code: u32, message: String) -> Self {
        match code {
            codes::INVALID_SETUP => Self::InvalidSetup(message),
            codes::UNSUPPORTED_SETUP => Self::UnsupportedSetup(message),
            codes::REJECTED_SETUP => Self::RejectedSetup(message),
            codes::REJECTED_RESUME => Self::RejectedResume(message),
            codes::CONNECTION_ERROR => Self::ConnectionError(message),
            codes::CONNECTION_CLOSE => Self::ConnectionClose(message),
            codes::APPLICATION_ERROR => Self::ApplicationError(message),
            codes::REJECTED => Self::Rejected(message),
            codes::CANCELED => Self::Canceled(message),
            codes::INVALID => Self::Invalid(message),
            _ => Self::Custom { code, message },
        }
    }

    /// The wire code used when sending this error to the peer.
    pub fn wire_code(&self) -> u32 {
        match self {
            Self::InvalidSetup(_) => codes::INVALID_SETUP,
            Self::UnsupportedSetup(_) => codes::UNSUPPORTED_SETUP,
            Self::RejectedSetup(_) => codes::REJECTED_SETUP,
            Self::RejectedResume(_) => codes::REJECTED_RESUME,
            Self::ConnectionError(_) | Self::Transport(_) | Self::Frame(_) => {
                codes::CONNECTION_ERROR
            }
            Self::ConnectionClose(_) | Self::ClosedChannel => codes::CONNECTION_CLOSE,
            Self::Rejected(_) => codes::REJECTED,
            Self::Canceled(_) => codes::CANCELED,
            Self::Invalid(_) => codes::INVALID,
            Self::Custom { code, .. } => *code,
            // handler failures, including unimplemented interactions
            Self::ApplicationError(_) | Self::Unsupported(_) => codes::APPLICATION_ERROR,
        }
    }

    /// The bare message to carry in an outbound ERROR frame, without the
    /// variant prefix `Display` adds.
    pub fn wire_message(&self) -> String {
        match self {
            Self::InvalidSetup(message)
            | Self::UnsupportedSetup(message)
            | Self::RejectedSetup(message)
            | Self::RejectedResume(message)
            | Self::ConnectionError(message)
            | Self::ConnectionClose(message)
            | Self::ApplicationError(message)
            | Self::Rejected(message)
            | Self::Canceled(message)
            | Self::Invalid(message)
            | Self::Transport(message) => message.clone(),
            Self::Custom { message, .. } => message.clone(),
            Self::ClosedChannel => "closed channel".to_string(),
            Self::Frame(frame_error) => frame_error.to_string(),
            Self::Unsupported(operation) => format!("unsupported operation: {operation}"),
        }
    }

    /// Whether this is an expected teardown error that should not be
    /// reported through the error consumer a second time.
    pub fn is_expected_close(&self) -> bool {
        matches!(self, Self::ClosedChannel | Self::ConnectionClose(_))
    }
}

/// Frame decode failures.
///
/// Any of these on an inbound frame is a protocol-fatal condition: the
/// connection sends ERROR(CONNECTION_ERROR) on stream 0 and closes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The buffer is shorter than the minimum for the frame type.
    #[error("frame truncated: need {needed} bytes, have {have}")]
    Truncated {
        /// Bytes required by the fixed part of the frame.
        needed: usize,
        /// Bytes available.
        have: usize,
    },
    /// The type code is outside the known enum.
    #[error("unknown frame type: {0:#x}")]
    UnknownType(u8),
    /// A request-n value of zero or with the high bit set.
    #[error("invalid request n: {0}")]
    InvalidRequestN(u32),
    /// The reserved high bit of the stream id was set.
    #[error("reserved stream id bit set")]
    InvalidStreamId,
    /// The frame exceeds the configured size limit.
    #[error("frame too large: {size} > {max}")]
    TooLarge {
        /// Declared or actual frame size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
    /// A length-prefixed field extends past the end of the frame.
    #[error("invalid length prefix in {field}")]
    BadLength {
        /// Name of the offending field.
        field: &'static str,
    },
    /// A text field is not valid UTF-8.
    #[error("invalid utf-8 in {field}")]
    InvalidUtf8 {
        /// Name of the offending field.
        field: &'static str,
    },
}

/// Callback receiving errors that have no other observer.
/// The default implementation logs at `warn` level.
pub type ErrorConsumer = Arc<dyn Fn(&RSocketError) + Send + Sync>;

/// The default error consumer: log and move on.
pub fn default_error_consumer() -> ErrorConsumer {
    Arc::new(|error| {
        tracing::warn!(target: "rsocket::connection", %error, "unhandled socket error");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_wire_code_round_trip() {
        for code in [
            codes::INVALID_SETUP,
            codes::UNSUPPORTED_SETUP,
            codes::REJECTED_SETUP,
            codes::REJECTED_RESUME,
            codes::CONNECTION_ERROR,
            codes::CONNECTION_CLOSE,
            codes::APPLICATION_ERROR,
            codes::REJECTED,
            codes::CANCELED,
            codes::INVALID,
        ] {
            let error = RSocketError::from_wire(code, "boom".into());
            assert_eq!(error.wire_code(), code);
        }
    }

    #[test]
    fn test_custom_code_preserved() {
        let error = RSocketError::from_wire(0x0000_0301, "vendor".into());
        assert_matches!(error, RSocketError::Custom { code: 0x0000_0301, .. });
        assert_eq!(error.wire_code(), 0x0000_0301);
    }

    #[test]
    fn test_expected_close_filter() {
        assert!(RSocketError::ClosedChannel.is_expected_close());
        assert!(!RSocketError::ConnectionError("x".into()).is_expected_close());
    }
}
