//! Receive ring and its counting semaphore.
//!
//! The receive thread swaps each data-plane packet into the next ring slot and
//! the consumer drains slots in order. The semaphore holds one permit per free
//! slot (minus one), so the receive thread blocks instead of dropping or
//! buffering without bound when the consumer falls behind.
//!
//! Cursor updates happen under the channel's response lock; slot contents are
//! only touched by the single producer before publication and by the consumer
//! after.

use std::sync::{Condvar, Mutex};

use crate::buffer::DynPacket;
use crate::common::{lock, wait};

/// Outcome of waiting for a free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Permit {
    /// A slot was free immediately.
    Granted,
    /// The ring was full; the caller blocked until the consumer caught up.
    GrantedAfterWait,
    /// The channel is terminating.
    Closed,
}

#[derive(Debug)]
struct SemState {
    permits: usize,
    closed: bool,
}

/// Counting semaphore that can be closed to release blocked waiters.
#[derive(Debug)]
pub(crate) struct Semaphore {
    state: Mutex<SemState>,
    cond: Condvar,
}

impl Semaphore {
    pub(crate) const fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(SemState { permits, closed: false }),
            cond: Condvar::new(),
        }
    }

    /// Takes one permit, blocking while none is available.
    pub(crate) fn acquire(&self) -> Permit {
        let mut st = lock(&self.state);
        let mut waited = false;
        loop {
            if st.closed {
                return Permit::Closed;
            }
            if st.permits > 0 {
                st.permits -= 1;
                return if waited { Permit::GrantedAfterWait } else { Permit::Granted };
            }
            waited = true;
            st = wait(&self.cond, st);
        }
    }

    /// Returns one permit.
    pub(crate) fn release(&self) {
        lock(&self.state).permits += 1;
        self.cond.notify_one();
    }

    /// Fails all current and future acquisitions.
    pub(crate) fn close(&self) {
        lock(&self.state).closed = true;
        self.cond.notify_all();
    }

    pub(crate) fn available(&self) -> usize {
        lock(&self.state).permits
    }
}

/// Fixed, power-of-two ring of receive buffers.
#[derive(Debug)]
pub(crate) struct RxRing {
    slots: Box<[Mutex<DynPacket>]>,
    mask: usize,
    pub(crate) free: Semaphore,
}

impl RxRing {
    /// Creates `len` slots of `packet_capacity` bytes each. `len` must be a power of two.
    pub(crate) fn new(len: usize, packet_capacity: usize) -> Self {
        debug_assert!(len.is_power_of_two());
        Self {
            slots: (0..len)
                .map(|_| Mutex::new(DynPacket::with_capacity(packet_capacity)))
                .collect(),
            mask: len - 1,
            free: Semaphore::new(len - 1),
        }
    }

    /// Slot for an unbounded cursor position.
    pub(crate) fn slot(&self, pos: usize) -> &Mutex<DynPacket> {
        &self.slots[pos & self.mask]
    }

    /// Packets the ring can hold before the producer blocks.
    pub(crate) const fn capacity(&self) -> usize {
        self.mask
    }
}
