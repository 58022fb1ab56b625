//! Response slots and the waits that fill them.
//!
//! Two kinds of slot exist. The session slot holds at most one response for
//! the single session-wide request in flight (sync rounds, memory-master
//! transactions). Per-device slots let several requests per device be
//! outstanding at once; the receive thread matches them by id.
//!
//! A requester takes the response lock *before* writing its request so the
//! response cannot arrive before its slot is registered:
//!
//! ```text
//! guard = lock_session() / lock_responses()
//! write(request)
//! rsp = wait_response(guard, id) / wait_device_response(guard, dev, id)
//! ... read rsp ...
//! drop(rsp)            // frees the slot and wakes other waiters
//! ```

use std::ops::Deref;
use std::sync::MutexGuard;
use std::thread::{self, ThreadId};

use tracing::trace;

use crate::buffer::DynPacket;
use crate::common::{ProtocolError, Result, lock, wait_timeout};

use super::{Channel, TERMINATION_POLL};

#[derive(Debug)]
pub(crate) struct DevSlot {
    pub(crate) id: u32,
    pub(crate) used: bool,
    pub(crate) rsp: DynPacket,
}

/// State shared between the receive thread, the consumer and requesters.
#[derive(Debug)]
pub(crate) struct ResponseState {
    pub(crate) session: DynPacket,
    pub(crate) session_owner: Option<ThreadId>,
    pub(crate) dev_slots: Vec<Vec<DevSlot>>,
    wpos: usize,
    rpos: usize,
}

impl ResponseState {
    pub(crate) fn new(max_devs: usize, max_outstanding: usize, capacity: usize) -> Self {
        let dev_slots = (0..max_devs)
            .map(|_| {
                (0..max_outstanding)
                    .map(|_| DevSlot { id: 0, used: false, rsp: DynPacket::new() })
                    .collect()
            })
            .collect();
        Self {
            session: DynPacket::with_capacity(capacity),
            session_owner: None,
            dev_slots,
            wpos: 0,
            rpos: 0,
        }
    }

    pub(crate) const fn has_work(&self) -> bool {
        self.wpos != self.rpos
    }

    pub(crate) const fn pending(&self) -> usize {
        self.wpos.wrapping_sub(self.rpos)
    }

    pub(crate) const fn write_pos(&self) -> usize {
        self.wpos
    }

    pub(crate) const fn publish(&mut self) {
        self.wpos = self.wpos.wrapping_add(1);
    }

    /// Claims the oldest unprocessed ring position.
    pub(crate) const fn take_read_pos(&mut self) -> usize {
        let pos = self.rpos;
        self.rpos = pos.wrapping_add(1);
        pos
    }

    /// No request in flight and nothing queued.
    pub(crate) fn is_idle(&self) -> bool {
        !self.has_work()
            && self.session_owner.is_none()
            && self.dev_slots.iter().flatten().all(|s| !s.used)
    }
}

/// Exclusive access to the response slots, taken before writing a request.
///
/// Obtained from [`Channel::lock_session`] or [`Channel::lock_responses`] and
/// consumed by the matching wait. Dropping it unused releases the lock (and
/// session ownership).
#[must_use = "a response guard must be passed to a wait or dropped"]
pub struct ResponseGuard<'a> {
    channel: &'a Channel,
    state: Option<MutexGuard<'a, ResponseState>>,
    session: bool,
}

impl Drop for ResponseGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut st) = self.state.take() {
            if self.session {
                st.session_owner = None;
            }
            drop(st);
            self.channel.progress.notify_all();
        }
    }
}

impl std::fmt::Debug for ResponseGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseGuard").field("session", &self.session).finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Session,
    Device { dev: usize, index: usize },
}

/// A received response, borrowed from its slot.
///
/// Holds the response lock; drop it promptly. Dropping frees the slot.
pub struct Response<'a> {
    channel: &'a Channel,
    state: MutexGuard<'a, ResponseState>,
    slot: Slot,
}

impl Deref for Response<'_> {
    type Target = DynPacket;

    fn deref(&self) -> &DynPacket {
        match self.slot {
            Slot::Session => &self.state.session,
            Slot::Device { dev, index } => &self.state.dev_slots[dev][index].rsp,
        }
    }
}

impl Drop for Response<'_> {
    fn drop(&mut self) {
        match self.slot {
            Slot::Session => {
                self.state.session.invalidate();
                self.state.session_owner = None;
            }
            Slot::Device { dev, index } => {
                let slot = &mut self.state.dev_slots[dev][index];
                slot.rsp.invalidate();
                slot.used = false;
            }
        }
        self.channel.progress.notify_all();
    }
}

impl std::fmt::Debug for Response<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response").field("slot", &self.slot).field("header", &self.header()).finish()
    }
}

impl Channel {
    /// Locks the response slots for a per-device request.
    pub fn lock_responses(&self) -> ResponseGuard<'_> {
        ResponseGuard { channel: self, state: Some(lock(&self.responses)), session: false }
    }

    /// Waits until no session-wide request is in flight, then claims the session slot.
    ///
    /// # Panics
    ///
    /// If the calling thread already owns the session. Session requests do not
    /// nest.
    pub fn lock_session(&self) -> ResponseGuard<'_> {
        let me = thread::current().id();
        let mut st = lock(&self.responses);
        loop {
            match st.session_owner {
                None => break,
                Some(owner) if owner == me => {
                    drop(st);
                    panic!("{}: nested session request on the same thread", self.name);
                }
                Some(_) if self.is_terminated() => break,
                Some(_) => st = wait_timeout(&self.progress, st, TERMINATION_POLL),
            }
        }
        st.session_owner = Some(me);
        ResponseGuard { channel: self, state: Some(st), session: true }
    }

    fn guard_state<'a>(&'a self, mut guard: ResponseGuard<'a>) -> MutexGuard<'a, ResponseState> {
        guard.state.take().unwrap_or_else(|| lock(&self.responses))
    }

    /// Waits for the response to session request `id`.
    ///
    /// Runs [`Channel::process`] while waiting whenever the ring has work, so
    /// handovers cannot stall behind this wait.
    ///
    /// # Errors
    ///
    /// The termination reason if the channel stops first.
    ///
    /// # Panics
    ///
    /// Through [`Channel::fatal`] if the response carries a different id.
    pub fn wait_response<'a>(&'a self, guard: ResponseGuard<'a>, id: u32) -> Result<Response<'a>> {
        let mut st = self.guard_state(guard);
        loop {
            if st.session.is_valid() {
                let got = st.session.header().map_or(id, |h| h.id);
                if got != id {
                    st.session.invalidate();
                    st.session_owner = None;
                    drop(st);
                    self.progress.notify_all();
                    self.fatal(ProtocolError::ResponseIdMismatch { expected: id, got });
                }
                trace!(channel = %self.name, id, "session response");
                return Ok(Response { channel: self, state: st, slot: Slot::Session });
            }
            if let Err(e) = self.check_alive() {
                st.session_owner = None;
                drop(st);
                self.progress.notify_all();
                return Err(e);
            }
            if st.has_work() {
                drop(st);
                let _ = self.process();
                st = lock(&self.responses);
                continue;
            }
            st = wait_timeout(&self.progress, st, TERMINATION_POLL);
        }
    }

    /// Registers a response slot for (`dev`, `id`) and waits for it to fill.
    ///
    /// # Errors
    ///
    /// The termination reason if the channel stops first.
    ///
    /// # Panics
    ///
    /// Through [`Channel::fatal`] if `dev` is outside the table or all of its
    /// slots are taken.
    pub fn wait_device_response<'a>(
        &'a self,
        guard: ResponseGuard<'a>,
        dev: u32,
        id: u32,
    ) -> Result<Response<'a>> {
        let mut st = self.guard_state(guard);
        let d = dev as usize;
        let limit = self.config.max_outstanding;
        let Some(index) = st.dev_slots.get(d).and_then(|slots| slots.iter().position(|s| !s.used))
        else {
            drop(st);
            if d >= self.config.max_devs {
                self.fatal(ProtocolError::NoDevice { dev, cmd: "response" });
            }
            self.fatal(ProtocolError::TooManyOutstanding { dev, limit });
        };
        {
            let slot = &mut st.dev_slots[d][index];
            slot.id = id;
            slot.used = true;
            slot.rsp.invalidate();
        }
        loop {
            if st.dev_slots[d][index].rsp.is_valid() {
                trace!(channel = %self.name, dev, id, "device response");
                return Ok(Response { channel: self, state: st, slot: Slot::Device { dev: d, index } });
            }
            if let Err(e) = self.check_alive() {
                st.dev_slots[d][index].used = false;
                drop(st);
                self.progress.notify_all();
                return Err(e);
            }
            if st.has_work() {
                drop(st);
                let _ = self.process();
                st = lock(&self.responses);
                continue;
            }
            st = wait_timeout(&self.progress, st, TERMINATION_POLL);
        }
    }
}
