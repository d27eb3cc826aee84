//! Connection configuration.

use crate::{
    error::{default_error_consumer, ErrorConsumer, RSocketError, RSocketResult},
    frame::DEFAULT_MAX_FRAME_SIZE,
    payload::Payload,
};
use std::{fmt, time::Duration};

/// Default KEEPALIVE tick period.
pub const DEFAULT_KEEPALIVE_PERIOD: Duration = Duration::from_secs(20);

/// Default maximum connection lifetime advertised in SETUP.
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(90);

/// Default consecutive missed-ack threshold before the connection is
/// declared dead.
pub const DEFAULT_MISSED_KEEPALIVE_THRESHOLD: u32 = 3;

/// Default REQUEST_N window for stream and channel receivers.
pub const DEFAULT_PREFETCH: u32 = 256;

/// Default MIME type for payload data and metadata.
pub const DEFAULT_MIME_TYPE: &str = "application/binary";

/// Per-connection configuration.
///
/// A connection is configured entirely at construction; there are no
/// process-wide registries. On the client side the MIME types, keepalive
/// parameters, and lease flag are advertised in SETUP; on the server side
/// the SETUP frame overrides the negotiated subset.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// How often to emit KEEPALIVE frames. Must be non-zero.
    pub keepalive_period: Duration,
    /// Maximum connection lifetime advertised in SETUP. Must be non-zero.
    pub max_lifetime: Duration,
    /// Consecutive missed keepalive acks tolerated before the connection
    /// fails with "keepalive timeout".
    pub missed_keepalive_threshold: u32,
    /// Enable LEASE admission control. A client sets the SETUP LEASE
    /// flag; a server accepts leased clients only when this is set.
    pub honor_lease: bool,
    /// MIME type for metadata payloads.
    pub metadata_mime_type: String,
    /// MIME type for data payloads.
    pub data_mime_type: String,
    /// Inbound frame size limit in bytes.
    pub max_frame_size: usize,
    /// Default REQUEST_N window for stream and channel receivers.
    pub prefetch: u32,
    /// Payload carried in SETUP (client side only).
    pub setup_payload: Payload,
    /// Sink for errors with no other observer.
    pub error_consumer: ErrorConsumer,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keepalive_period: DEFAULT_KEEPALIVE_PERIOD,
            max_lifetime: DEFAULT_MAX_LIFETIME,
            missed_keepalive_threshold: DEFAULT_MISSED_KEEPALIVE_THRESHOLD,
            honor_lease: false,
            metadata_mime_type: DEFAULT_MIME_TYPE.to_string(),
            data_mime_type: DEFAULT_MIME_TYPE.to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            prefetch: DEFAULT_PREFETCH,
            setup_payload: Payload::empty(),
            error_consumer: default_error_consumer(),
        }
    }
}

impl ConnectionConfig {
    /// Validate the configuration before use.
    pub fn validate(&self) -> RSocketResult<()> {
        if self.keepalive_period.is_zero() {
            return Err(RSocketError::InvalidSetup("keepalive period must be > 0".into()));
        }
        if self.max_lifetime.is_zero() {
            return Err(RSocketError::InvalidSetup("max lifetime must be > 0".into()));
        }
        if self.prefetch == 0 {
            return Err(RSocketError::InvalidSetup("prefetch must be > 0".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("keepalive_period", &self.keepalive_period)
            .field("max_lifetime", &self.max_lifetime)
            .field("missed_keepalive_threshold", &self.missed_keepalive_threshold)
            .field("honor_lease", &self.honor_lease)
            .field("metadata_mime_type", &self.metadata_mime_type)
            .field("data_mime_type", &self.data_mime_type)
            .field("max_frame_size", &self.max_frame_size)
            .field("prefetch", &self.prefetch)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConnectionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_keepalive_rejected() {
        let config = ConnectionConfig { keepalive_period: Duration::ZERO, ..Default::default() };
        assert_matches!(config.validate(), Err(RSocketError::InvalidSetup(_)));
    }
}
