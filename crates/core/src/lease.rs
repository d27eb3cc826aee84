//! LEASE admission control.
//!
//! When both peers negotiate HONOR_LEASE in SETUP, a requester may only
//! open new streams while it holds a valid lease from its peer: a permit
//! count with a TTL. Each side tracks two windows: the inbound lease
//! (granted by the peer, gating local requests) and the outbound lease
//! (granted to the peer, enforced against its requests). A newly received
//! LEASE frame replaces the previous window.

use crate::error::{RSocketError, RSocketResult};
use bytes::Bytes;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;

/// A lease grant as seen by application code.
#[derive(Debug, Clone)]
pub struct Lease {
    /// Number of new streams the grantee may initiate.
    pub allowed_requests: u32,
    /// Validity window measured from receipt.
    pub ttl: Duration,
    /// Optional metadata carried by the LEASE frame.
    pub metadata: Option<Bytes>,
}

/// One lease window with its expiry and remaining permit count.
#[derive(Debug)]
struct Window {
    remaining: u32,
    initial: u32,
    expires_at: Instant,
}

impl Window {
    fn new(permits: u32, ttl: Duration, now: Instant) -> Self {
        Self { remaining: permits, initial: permits.max(1), expires_at: now + ttl }
    }

    fn is_valid(&self, now: Instant) -> bool {
        self.remaining > 0 && now < self.expires_at
    }

    /// Take one permit if the window is valid.
    fn try_use(&mut self, now: Instant) -> bool {
        if !self.is_valid(now) {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

/// Both lease windows for one connection.
///
/// Shared between the connection driver (which mutates it) and the public
/// handle (which reads availability), so access goes through short
/// `parking_lot` critical sections.
#[derive(Debug)]
pub(crate) struct LeaseManager {
    enabled: bool,
    inbound: Mutex<Option<Window>>,
    outbound: Mutex<Option<Window>>,
}

impl LeaseManager {
    pub(crate) fn new(enabled: bool) -> Arc<Self> {
        Arc::new(Self { enabled, inbound: Mutex::new(None), outbound: Mutex::new(None) })
    }

    pub(crate) fn enabled(&self) -> bool {
        self.enabled
    }

    /// Requester-side admission check: take one inbound permit or fail
    /// the request before anything reaches the wire.
    pub(crate) fn use_inbound(&self) -> RSocketResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let now = Instant::now();
        let mut window = self.inbound.lock();
        match window.as_mut() {
            Some(window) => {
                if window.try_use(now) {
                    Ok(())
                } else {
                    Err(RSocketError::Rejected("no lease".into()))
                }
            }
            None => Err(RSocketError::Rejected("no lease".into())),
        }
    }

    /// Responder-side enforcement: take one outbound permit; a failure
    /// means the peer exceeded its grant and the stream is rejected.
    pub(crate) fn use_outbound(&self) -> bool {
        if !self.enabled {
            return true;
        }
        let now = Instant::now();
        let mut window = self.outbound.lock();
        match window.as_mut() {
            Some(window) => window.try_use(now),
            None => false,
        }
    }

    /// A LEASE frame arrived: replace the inbound window.
    pub(crate) fn on_lease_received(&self, lease: &Lease) {
        let window = Window::new(lease.allowed_requests, lease.ttl, Instant::now());
        *self.inbound.lock() = Some(window);
    }

    /// A LEASE frame was sent: replace the outbound window.
    pub(crate) fn on_lease_sent(&self, permits: u32, ttl: Duration) {
        let window = Window::new(permits, ttl, Instant::now());
        *self.outbound.lock() = Some(window);
    }

    /// Availability in `[0.0, 1.0]`: the remaining fraction of the
    /// current inbound lease, or 1.0 when leases are disabled.
    pub(crate) fn availability(&self) -> f64 {
        if !self.enabled {
            return 1.0;
        }
        let now = Instant::now();
        match self.inbound.lock().as_ref() {
            Some(window) if window.is_valid(now) => {
                f64::from(window.remaining) / f64::from(window.initial)
            }
            _ => 0.0,
        }
    }
}

/// Splits a permit budget evenly across registered connections on every
/// tick, granting each its share via `send_lease`. Lives above the
/// per-connection engine; deregistering a connection stops its grants.
pub struct FairLeaseDistributor {
    permits_per_tick: u32,
    ttl: Duration,
    sockets: Mutex<Vec<(u64, crate::requester::RSocketHandle)>>,
    next_registration: Mutex<u64>,
}

/// Registration handle returned by [`FairLeaseDistributor::register`];
/// used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseRegistration(u64);

impl FairLeaseDistributor {
    /// Create a distributor granting `permits_per_tick` in total, split
    /// across registered connections, with the given TTL per grant.
    pub fn new(permits_per_tick: u32, ttl: Duration) -> Self {
        Self {
            permits_per_tick,
            ttl,
            sockets: Mutex::new(Vec::new()),
            next_registration: Mutex::new(0),
        }
    }

    /// Register a connection to receive grants on subsequent ticks.
    pub fn register(&self, socket: crate::requester::RSocketHandle) -> LeaseRegistration {
        let mut next = self.next_registration.lock();
        let id = *next;
        *next += 1;
        self.sockets.lock().push((id, socket));
        LeaseRegistration(id)
    }

    /// Stop granting to a previously registered connection.
    pub fn deregister(&self, registration: LeaseRegistration) {
        self.sockets.lock().retain(|(id, _)| *id != registration.0);
    }

    /// Grant each registered connection its share of the budget.
    pub async fn distribute(&self) {
        let sockets: Vec<_> = self.sockets.lock().clone();
        if sockets.is_empty() {
            return;
        }
        let share = self.permits_per_tick / sockets.len() as u32;
        if share == 0 {
            tracing::warn!(
                target: "rsocket::lease",
                connections = sockets.len(),
                budget = self.permits_per_tick,
                "lease budget too small to split"
            );
            return;
        }
        for (_, socket) in sockets {
            if let Err(error) = socket.send_lease(self.ttl, share).await {
                tracing::debug!(target: "rsocket::lease", %error, "lease grant failed");
            }
        }
    }

    /// Drive the distributor on a fixed tick. Runs until dropped.
    pub async fn run(&self, tick: Duration) {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.distribute().await;
        }
    }
}
