//! Keepalive liveness bookkeeping.
//!
//! Each peer periodically sends KEEPALIVE with the RESPOND flag; the
//! receiver echoes it back without the flag. The sender records the time
//! of each tick and each ack, and fails the connection once the gap
//! implies too many consecutive unanswered keepalives.

use std::time::Duration;
use tokio::time::Instant;

/// Tick/ack state for outbound keepalives.
#[derive(Debug)]
pub(crate) struct KeepAlive {
    period: Duration,
    missed_threshold: u32,
    last_tick: Instant,
    last_ack: Instant,
}

impl KeepAlive {
    /// Start with a clean slate: assume we are acked as of `now`.
    pub(crate) fn new(period: Duration, missed_threshold: u32, now: Instant) -> Self {
        Self { period, missed_threshold, last_tick: now, last_ack: now }
    }

    /// Record an outbound tick. Returns the number of missed acks when
    /// the threshold is breached; the caller must then fail the
    /// connection.
    pub(crate) fn on_tick(&mut self, now: Instant) -> Result<(), u64> {
        let missed = self.missed_acks();
        if missed > u64::from(self.missed_threshold) {
            return Err(missed);
        }
        self.last_tick = now;
        Ok(())
    }

    /// Record an inbound ack.
    pub(crate) fn on_ack(&mut self, now: Instant) {
        self.last_ack = now;
    }

    /// Consecutive unanswered keepalives implied by the tick/ack gap.
    fn missed_acks(&self) -> u64 {
        let gap = self.last_tick.saturating_duration_since(self.last_ack);
        (gap.as_millis() / self.period.as_millis().max(1)) as u64
    }
}
