//! Stream-id allocation.
//!
//! The side that sent SETUP allocates odd ids, the other side even ids;
//! ids increase monotonically until the 31-bit space is exhausted, then
//! allocation wraps to the smallest id of the correct parity that is not
//! currently active.

use crate::frame::MAX_STREAM_ID;

/// Which side of the connection this engine is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Sent SETUP; allocates odd stream ids.
    Client,
    /// Accepted SETUP; allocates even stream ids.
    Server,
}

impl Side {
    /// The first id this side allocates.
    pub(crate) fn first_id(self) -> u32 {
        match self {
            Side::Client => 1,
            Side::Server => 2,
        }
    }

    /// Whether `stream_id` belongs to the streams this side initiates.
    pub(crate) fn initiated_locally(self, stream_id: u32) -> bool {
        match self {
            Side::Client => stream_id % 2 == 1,
            Side::Server => stream_id % 2 == 0 && stream_id != 0,
        }
    }
}

/// Allocator for locally initiated stream ids.
#[derive(Debug)]
pub(crate) struct StreamIdSupplier {
    side: Side,
    /// Most recently issued id; 0 before the first allocation.
    last: u32,
    /// Set once the id space has wrapped.
    wrapped: bool,
}

impl StreamIdSupplier {
    pub(crate) fn new(side: Side) -> Self {
        Self { side, last: 0, wrapped: false }
    }

    /// Return the smallest unused id greater than the last issued one,
    /// wrapping to the start of the parity range when the 31-bit space
    /// is exhausted. `in_use` reports whether an id is still active.
    pub(crate) fn next(&mut self, mut in_use: impl FnMut(u32) -> bool) -> u32 {
        loop {
            let candidate = if self.last == 0 {
                self.side.first_id()
            } else {
                match self.last.checked_add(2) {
                    Some(id) if id <= MAX_STREAM_ID => id,
                    _ => {
                        self.wrapped = true;
                        self.side.first_id()
                    }
                }
            };
            self.last = candidate;
            if !in_use(candidate) {
                return candidate;
            }
        }
    }

    /// Whether `stream_id` could legitimately have been issued already.
    /// Used to tell a late frame for a closed stream (ignorable) apart
    /// from a frame for a stream that never existed (protocol-fatal).
    pub(crate) fn is_before_or_current(&self, stream_id: u32) -> bool {
        if stream_id == 0 || !self.side.initiated_locally(stream_id) {
            return false;
        }
        self.wrapped || stream_id <= self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ids_are_odd_and_increasing() {
        let mut supplier = StreamIdSupplier::new(Side::Client);
        assert_eq!(supplier.next(|_| false), 1);
        assert_eq!(supplier.next(|_| false), 3);
        assert_eq!(supplier.next(|_| false), 5);
    }

    #[test]
    fn test_server_ids_are_even() {
        let mut supplier = StreamIdSupplier::new(Side::Server);
        assert_eq!(supplier.next(|_| false), 2);
        assert_eq!(supplier.next(|_| false), 4);
    }

    #[test]
    fn test_wrap_rescans_from_parity_start() {
        let mut supplier = StreamIdSupplier::new(Side::Client);
        supplier.last = MAX_STREAM_ID; // odd: 2^31 - 1
        // 1 is still active, 3 is free
        assert_eq!(supplier.next(|id| id == 1), 3);
        assert!(supplier.wrapped);
        // after a wrap every parity-correct id counts as possibly issued
        assert!(supplier.is_before_or_current(0x7fff_0001));
    }

    #[test]
    fn test_is_before_or_current() {
        let mut supplier = StreamIdSupplier::new(Side::Client);
        supplier.next(|_| false);
        supplier.next(|_| false); // last == 3
        assert!(supplier.is_before_or_current(1));
        assert!(supplier.is_before_or_current(3));
        assert!(!supplier.is_before_or_current(5));
        // wrong parity is never ours
        assert!(!supplier.is_before_or_current(2));
        assert!(!supplier.is_before_or_current(0));
    }
}
