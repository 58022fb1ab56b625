//! Virtual-time synchronization.
//!
//! Each side keeps the other within one quantum of its own virtual time:
//! - A Sync request from a peer that is less than a quantum ahead is answered
//!   on the receive thread. Otherwise the consumer either warps the local
//!   clock (if idle and allowed) or defers the reply until local time catches
//!   up; [`Channel::poll_sync`] sends deferred replies.
//! - Locally, [`Channel::poll_sync`] sends a Sync request every quantum and
//!   waits for the peer to answer.
//!
//! All timestamps here are session time (see [`PeerState::normalize`](crate::peer::PeerState::normalize)).

use std::sync::atomic::Ordering;

use tracing::{debug, trace, warn};

use crate::buffer::DynPacket;
use crate::common::{Result, lock};
use crate::proto::codec;
use crate::proto::header::Header;
use crate::proto::packet::Body;
use crate::stats::Counter;

use super::Channel;

#[derive(Debug, Clone, Copy)]
struct DeferredSync {
    id: u32,
    dev: u32,
    timestamp: u64,
}

#[derive(Debug, Default)]
pub(crate) struct SyncState {
    deadline: Option<u64>,
    doing_sync: bool,
    need_sync: bool,
    deferred: Option<DeferredSync>,
}

impl Channel {
    /// Enables or disables clock warping; returns the previous setting.
    pub fn set_time_warp(&self, enable: bool) -> bool {
        self.time_warp.swap(enable, Ordering::AcqRel)
    }

    /// True if the local clock may be warped toward the peer.
    pub fn time_warp(&self) -> bool {
        self.time_warp.load(Ordering::Acquire)
    }

    const fn quantum(&self) -> u64 {
        self.config.sync_quantum_ns
    }

    /// Session time at which the next local sync round is due.
    pub fn sync_deadline(&self) -> Option<u64> {
        lock(&self.sync).deadline
    }

    /// True if a round came due while a deferred reply was still pending.
    pub fn sync_pending(&self) -> bool {
        lock(&self.sync).need_sync
    }

    /// True if a Sync reply is waiting for local time to catch up.
    pub fn has_deferred_sync(&self) -> bool {
        lock(&self.sync).deferred.is_some()
    }

    /// Arms the sync timer one quantum from now.
    ///
    /// No-op when sync is disabled or a round is in progress.
    pub fn restart_sync_timer(&self) {
        if !self.config.sync {
            return;
        }
        let deadline = self.normalized_clk().saturating_add(self.quantum());
        let mut st = lock(&self.sync);
        if st.doing_sync {
            return;
        }
        st.deadline = Some(deadline);
        trace!(channel = %self.name, deadline, "sync timer armed");
    }

    /// Drives time sync from the owner's loop.
    ///
    /// Sends a deferred reply once local time reached it, then runs a sync
    /// round if the timer expired. A round that comes due while a reply is
    /// still deferred is postponed by one quantum.
    ///
    /// # Errors
    ///
    /// Transport failure or termination while sending or waiting.
    pub fn poll_sync(&self) -> Result<()> {
        let now = self.normalized_clk();
        let ready = {
            let mut st = lock(&self.sync);
            match st.deferred {
                Some(d) if now >= d.timestamp => st.deferred.take(),
                _ => None,
            }
        };
        if let Some(d) = ready {
            self.send_sync_resp(d.id, d.dev, d.timestamp)?;
            debug!(channel = %self.name, id = d.id, timestamp = d.timestamp, "deferred sync response sent");
        }

        {
            let mut st = lock(&self.sync);
            match st.deadline {
                Some(deadline) if now >= deadline => {}
                _ => return Ok(()),
            }
            if st.deferred.is_some() {
                st.need_sync = true;
                st.deadline = Some(now.saturating_add(self.quantum()));
                return Ok(());
            }
            st.doing_sync = true;
            st.need_sync = false;
            st.deadline = None;
        }
        let result = self.sync_round(now);
        lock(&self.sync).doing_sync = false;
        self.restart_sync_timer();
        result
    }

    fn sync_round(&self, clk: u64) -> Result<()> {
        let mut pkt = DynPacket::new();
        let id = self.new_id();
        let len = codec::encode_sync(&mut pkt, id, 0, clk);
        let guard = self.lock_session();
        self.write(&pkt.as_bytes()[..len])?;
        let rsp = self.wait_response(guard, id)?;
        let peer_clk = match rsp.packet().map(|p| &p.body) {
            Some(Body::Sync(sync)) => sync.timestamp,
            _ => clk,
        };
        drop(rsp);
        self.stats.bump(Counter::SyncRound);
        debug!(channel = %self.name, clk, peer_clk, "sync round complete");
        Ok(())
    }

    fn send_sync_resp(&self, id: u32, dev: u32, timestamp: u64) -> Result<()> {
        let mut pkt = DynPacket::new();
        let len = codec::encode_sync_resp(&mut pkt, id, dev, timestamp);
        self.write(&pkt.as_bytes()[..len])
    }

    /// Answers a Sync request on the receive thread when the peer is less
    /// than a quantum ahead (or sync is off). Returns false to hand it over.
    pub(super) fn answer_sync_fast(&self, hdr: &Header, pkt: &DynPacket) -> bool {
        let Some(Body::Sync(sync)) = pkt.packet().map(|p| &p.body) else {
            return false;
        };
        let ahead = sync.timestamp.saturating_sub(self.normalized_clk());
        if self.config.sync && ahead >= self.quantum() {
            return false;
        }
        if self.send_sync_resp(hdr.id, hdr.dev, sync.timestamp).is_ok() {
            self.stats.bump(Counter::SyncFast);
        }
        true
    }

    /// Consumer-side handling of a Sync request the fast path declined.
    pub(super) fn handle_sync_request(&self, pkt: &DynPacket) {
        let Some((hdr, ts)) = pkt.packet().and_then(|p| match p.body {
            Body::Sync(sync) => Some((p.header, sync.timestamp)),
            _ => None,
        }) else {
            return;
        };
        let now = self.normalized_clk();
        if ts <= now {
            self.reply_or_log(&hdr, ts);
            return;
        }
        if self.time_warp() && lock(&self.responses).is_idle() {
            let target = ts.min(now.saturating_add(self.quantum()));
            self.warp_to(target);
            if target >= ts {
                self.reply_or_log(&hdr, ts);
                return;
            }
        }
        let replaced = lock(&self.sync).deferred.replace(DeferredSync {
            id: hdr.id,
            dev: hdr.dev,
            timestamp: ts,
        });
        if let Some(prev) = replaced {
            warn!(channel = %self.name, id = prev.id, "deferred sync response superseded");
        }
        self.stats.bump(Counter::SyncDeferred);
        debug!(channel = %self.name, id = hdr.id, timestamp = ts, now, "sync response deferred");
    }

    fn reply_or_log(&self, hdr: &Header, ts: u64) {
        if let Err(e) = self.send_sync_resp(hdr.id, hdr.dev, ts) {
            warn!(channel = %self.name, id = hdr.id, error = %e, "sync response not sent");
        }
    }

    /// Pulls local time forward toward the peer after a completed transaction.
    ///
    /// `lclk` is the session time when the request was issued and `rclk` the
    /// timestamp of the peer's response. The clock moves by at most one
    /// quantum, and only when sync and warping are both enabled.
    pub fn sync_vmclock(&self, lclk: u64, rclk: u64) {
        if !self.config.sync || !self.time_warp() || rclk <= lclk {
            return;
        }
        let target = rclk.min(lclk.saturating_add(self.quantum()));
        if target > self.normalized_clk() {
            self.warp_to(target);
        }
    }

    fn warp_to(&self, session_target: u64) {
        self.clock.warp_to(self.peer.denormalize(session_target));
        self.stats.bump(Counter::Warp);
        trace!(channel = %self.name, target = session_target, "clock warped");
    }
}
