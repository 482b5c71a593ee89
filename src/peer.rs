//! Per-peer reliability state.
//!
//! Everything needed to converse reliably with one remote endpoint lives
//! here and is mutated only through methods, so the credit/backoff/reorder
//! invariants hold at every call site.

use crate::addr::{FiAddr, RawAddress};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

// =============================================================================
// EXTRA FEATURES / REQUESTS
// =============================================================================
// Bit i of exinfo[i/64] at position i%64 advertises feature/request id i.

pub mod extra_feature {
    /// Peer can be the target of RDMA reads (enables long-read protocols).
    pub const RDMA_READ: u64 = 1 << 0;
    /// Peer understands DC packet types and RECEIPT.
    pub const DELIVERY_COMPLETE: u64 = 1 << 1;
    /// Request: keep REQ header lengths stable (keep the raw-address header
    /// even after handshake).
    pub const STABLE_HEADER_LENGTH: u64 = 1 << 2;
    /// Request: stamp a connid on every packet sent to this peer.
    pub const CONNID_HEADER: u64 = 1 << 3;
}

// =============================================================================
// REORDER BUFFER
// =============================================================================

/// Verdict on a REQ packet's msg id relative to the expected id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorderVerdict {
    /// Exactly the expected id: process now.
    InOrder,
    /// Ahead but inside the window: queue until the gap fills.
    Queue,
    /// Behind the window (wrapped distance >= 2^31): already delivered.
    Duplicate,
    /// Ahead beyond the window: protocol error.
    OutOfWindow,
}

/// Modular window over 32-bit message ids. Wrap-around is legal; distances
/// are computed with wrapping arithmetic, so `2^32 + 3` messages to one peer
/// stay ordered. Each slot holds every packet seen for its message id, since
/// a queued medium message may arrive as several segments.
#[derive(Debug)]
pub struct ReorderBuffer {
    exp_msg_id: u32,
    slots: Vec<Vec<usize>>,
    queued: usize,
}

impl ReorderBuffer {
    pub fn new(size: usize) -> Self {
        assert!(size > 0 && size < (1usize << 31));
        Self { exp_msg_id: 0, slots: vec![Vec::new(); size], queued: 0 }
    }

    pub fn expected(&self) -> u32 {
        self.exp_msg_id
    }

    pub fn check(&self, msg_id: u32) -> ReorderVerdict {
        let dist = msg_id.wrapping_sub(self.exp_msg_id);
        if dist == 0 {
            ReorderVerdict::InOrder
        } else if (dist as usize) < self.slots.len() {
            ReorderVerdict::Queue
        } else if dist >= 1 << 31 {
            ReorderVerdict::Duplicate
        } else {
            ReorderVerdict::OutOfWindow
        }
    }

    /// Park a cloned packet for an ahead-of-order msg id.
    pub fn insert(&mut self, msg_id: u32, pkt_idx: usize) {
        debug_assert_eq!(self.check(msg_id), ReorderVerdict::Queue);
        let slot = msg_id as usize % self.slots.len();
        self.slots[slot].push(pkt_idx);
        self.queued += 1;
    }

    /// Advance past the expected id after processing it.
    pub fn advance(&mut self) {
        self.exp_msg_id = self.exp_msg_id.wrapping_add(1);
    }

    /// Take the queued packets for the now-expected id, in arrival order.
    pub fn pop_expected(&mut self) -> Option<Vec<usize>> {
        let slot = self.exp_msg_id as usize % self.slots.len();
        if self.slots[slot].is_empty() {
            return None;
        }
        let pkts = std::mem::take(&mut self.slots[slot]);
        self.queued -= pkts.len();
        Some(pkts)
    }

    pub fn queued(&self) -> usize {
        self.queued
    }

    /// Drain every queued packet (peer teardown).
    pub fn drain(&mut self) -> Vec<usize> {
        self.queued = 0;
        self.slots.iter_mut().flat_map(std::mem::take).collect()
    }
}

// =============================================================================
// PEER
// =============================================================================

/// Per-peer traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub pkts_sent: u64,
    pub pkts_recv: u64,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub rnr_events: u64,
    pub dropped_connid: u64,
}

#[derive(Debug)]
pub struct Peer {
    pub fi_addr: FiAddr,
    /// Raw address as inserted; `raw.connid` is the connection identity all
    /// incoming connids are checked against.
    pub raw: RawAddress,
    pub ah_handle: u64,
    pub ahn: u16,
    /// Set when the peer resolves to an shm transport address.
    pub shm_addr: Option<u64>,
    pub is_self: bool,
    pub is_local: bool,

    // Handshake
    pub handshake_received: bool,
    pub handshake_sent: bool,
    /// A HANDSHAKE could not be posted and awaits the progress loop.
    pub handshake_pending: bool,
    exinfo: Vec<u64>,

    // RNR backoff
    pub in_backoff: bool,
    rnr_deadline: Option<Instant>,
    rnr_backoff_exp: u32,

    // Credits / in-flight accounting
    /// Packets posted to the transport for this peer, not yet completed.
    pub tx_pending: usize,

    // Ordering
    next_msg_id: u32,
    /// One-sided requests stamp ids from their own sequence; they never pass
    /// through the reorder window.
    next_rta_id: u32,
    pub reorder: ReorderBuffer,

    // Outstanding entries referencing this peer (arena ids)
    pub tx_entries: Vec<usize>,
    pub rx_entries: Vec<usize>,
    /// In-flight control packets (handshakes, receipts, grants) owned by
    /// the peer rather than an entry.
    pub outstanding_pkts: usize,
    /// Peer-owned control packets awaiting retransmit after RNR.
    pub queued_ctrl: Vec<usize>,

    pub stats: PeerStats,
}

impl Peer {
    pub fn new(
        fi_addr: FiAddr,
        raw: RawAddress,
        ah_handle: u64,
        ahn: u16,
        recvwin_size: usize,
    ) -> Self {
        Self {
            fi_addr,
            raw,
            ah_handle,
            ahn,
            shm_addr: None,
            is_self: false,
            is_local: false,
            handshake_received: false,
            handshake_sent: false,
            handshake_pending: false,
            exinfo: Vec::new(),
            in_backoff: false,
            rnr_deadline: None,
            rnr_backoff_exp: 0,
            tx_pending: 0,
            next_msg_id: 0,
            next_rta_id: 0,
            reorder: ReorderBuffer::new(recvwin_size),
            tx_entries: Vec::new(),
            rx_entries: Vec::new(),
            outstanding_pkts: 0,
            queued_ctrl: Vec::new(),
            stats: PeerStats::default(),
        }
    }

    /// Allocate the next per-peer monotonic message id.
    pub fn next_msg_id(&mut self) -> u32 {
        let id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1);
        id
    }

    /// Allocate an id for a one-sided request.
    pub fn next_rta_id(&mut self) -> u32 {
        let id = self.next_rta_id;
        self.next_rta_id = self.next_rta_id.wrapping_add(1);
        id
    }

    pub fn apply_handshake(&mut self, exinfo: Vec<u64>) {
        self.handshake_received = true;
        self.exinfo = exinfo;
        trace!(peer = self.fi_addr, features = ?self.exinfo, "handshake received");
    }

    /// Does the peer advertise extra feature/request `id`?
    pub fn has_feature(&self, id: u32) -> bool {
        let word = (id / 64) as usize;
        let bit = id % 64;
        self.exinfo.get(word).is_some_and(|w| w & (1 << bit) != 0)
    }

    fn feature_word0(&self) -> u64 {
        self.exinfo.first().copied().unwrap_or(0)
    }

    pub fn supports_rdma_read(&self) -> bool {
        self.feature_word0() & extra_feature::RDMA_READ != 0
    }

    pub fn supports_delivery_complete(&self) -> bool {
        self.feature_word0() & extra_feature::DELIVERY_COMPLETE != 0
    }

    /// Include the raw-address optional header in REQs to this peer?
    /// Yes until the handshake lands, and indefinitely when the peer asked
    /// for stable header lengths.
    pub fn needs_raw_addr_hdr(&self) -> bool {
        !self.handshake_received
            || self.feature_word0() & extra_feature::STABLE_HEADER_LENGTH != 0
    }

    /// Stamp a connid optional header on REQs? Only once the handshake told
    /// us the peer wants one (pre-handshake REQs already carry the connid
    /// inside the raw-address header).
    pub fn wants_connid_hdr(&self) -> bool {
        self.handshake_received && self.feature_word0() & extra_feature::CONNID_HEADER != 0
    }

    /// Validate the connid carried by an incoming packet. A mismatch means
    /// the packet was sent by a destroyed predecessor QP sharing GID+QPN;
    /// such packets are silently dropped.
    pub fn connid_matches(&mut self, wire_connid: Option<u32>) -> bool {
        match wire_connid {
            Some(id) if id != self.raw.connid => {
                self.stats.dropped_connid += 1;
                debug!(
                    peer = self.fi_addr,
                    got = format_args!("{id:#010x}"),
                    want = format_args!("{:#010x}", self.raw.connid),
                    "dropping packet from stale connection"
                );
                false
            }
            _ => true,
        }
    }

    // -------------------------------------------------------------------------
    // RNR backoff
    // -------------------------------------------------------------------------

    /// Enter (or extend) backoff after an RNR completion. Exponential with a
    /// ceiling, like connection retry delays.
    pub fn rnr_backoff(&mut self, initial_ms: u64, max_ms: u64) {
        let delay = initial_ms.saturating_mul(1 << self.rnr_backoff_exp.min(16)).min(max_ms);
        self.rnr_backoff_exp = self.rnr_backoff_exp.saturating_add(1);
        self.in_backoff = true;
        self.rnr_deadline = Some(Instant::now() + Duration::from_millis(delay));
        self.stats.rnr_events += 1;
        debug!(peer = self.fi_addr, delay_ms = delay, "peer entered RNR backoff");
    }

    pub fn backoff_expired(&self, now: Instant) -> bool {
        match self.rnr_deadline {
            Some(deadline) => now >= deadline,
            None => true,
        }
    }

    pub fn clear_backoff(&mut self) {
        self.in_backoff = false;
        self.rnr_deadline = None;
    }

    /// Any successful completion from the peer proves it is draining again.
    pub fn reset_backoff_state(&mut self) {
        self.rnr_backoff_exp = 0;
    }

    // -------------------------------------------------------------------------
    // Entry tracking
    // -------------------------------------------------------------------------

    pub fn track_tx(&mut self, id: usize) {
        self.tx_entries.push(id);
    }

    pub fn untrack_tx(&mut self, id: usize) {
        if let Some(pos) = self.tx_entries.iter().position(|e| *e == id) {
            self.tx_entries.swap_remove(pos);
        }
    }

    pub fn track_rx(&mut self, id: usize) {
        self.rx_entries.push(id);
    }

    pub fn untrack_rx(&mut self, id: usize) {
        if let Some(pos) = self.rx_entries.iter().position(|e| *e == id) {
            self.rx_entries.swap_remove(pos);
        }
    }

    /// References that keep the peer alive; AV remove fails while nonzero.
    pub fn use_cnt(&self) -> usize {
        self.tx_entries.len() + self.rx_entries.len() + self.outstanding_pkts + self.queued_ctrl.len()
    }

    pub fn on_pkt_sent(&mut self, bytes: usize) {
        self.stats.pkts_sent += 1;
        self.stats.bytes_sent += bytes as u64;
        self.tx_pending += 1;
    }

    /// A send completion arrived for a packet posted toward this peer. The
    /// count saturates rather than asserts: a recreated peer may inherit
    /// completions posted toward its evicted predecessor.
    pub fn on_send_completed(&mut self) {
        self.tx_pending = self.tx_pending.saturating_sub(1);
    }

    pub fn on_pkt_recv(&mut self, bytes: usize) {
        self.stats.pkts_recv += 1;
        self.stats.bytes_recv += bytes as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{Gid, RawAddress};

    fn peer() -> Peer {
        Peer::new(0, RawAddress::new(Gid([1; 16]), 5, 0xaabb), 1, 2, 8)
    }

    #[test]
    fn test_reorder_verdicts() {
        let rb = ReorderBuffer::new(8);
        assert_eq!(rb.check(0), ReorderVerdict::InOrder);
        assert_eq!(rb.check(1), ReorderVerdict::Queue);
        assert_eq!(rb.check(7), ReorderVerdict::Queue);
        assert_eq!(rb.check(8), ReorderVerdict::OutOfWindow);
        assert_eq!(rb.check(u32::MAX), ReorderVerdict::Duplicate);
    }

    #[test]
    fn test_reorder_wraparound() {
        let mut rb = ReorderBuffer::new(8);
        rb.exp_msg_id = u32::MAX;
        assert_eq!(rb.check(u32::MAX), ReorderVerdict::InOrder);
        // 0 is one ahead of u32::MAX
        assert_eq!(rb.check(0), ReorderVerdict::Queue);
        rb.insert(0, 42);
        rb.advance();
        assert_eq!(rb.expected(), 0);
        assert_eq!(rb.pop_expected(), Some(vec![42]));
        assert_eq!(rb.queued(), 0);
    }

    #[test]
    fn test_reorder_queues_segments_together() {
        let mut rb = ReorderBuffer::new(8);
        rb.insert(3, 10);
        rb.insert(3, 11);
        assert_eq!(rb.queued(), 2);
        assert!(rb.pop_expected().is_none(), "id 3 is not expected yet");
        rb.advance();
        rb.advance();
        rb.advance();
        assert_eq!(rb.pop_expected(), Some(vec![10, 11]));
        assert_eq!(rb.queued(), 0);
    }

    #[test]
    fn test_msg_id_wraps() {
        let mut p = peer();
        p.next_msg_id = u32::MAX;
        assert_eq!(p.next_msg_id(), u32::MAX);
        assert_eq!(p.next_msg_id(), 0);
    }

    #[test]
    fn test_feature_bits() {
        let mut p = peer();
        assert!(!p.supports_rdma_read());
        p.apply_handshake(vec![
            extra_feature::RDMA_READ | extra_feature::CONNID_HEADER,
            1 << 2,
        ]);
        assert!(p.supports_rdma_read());
        assert!(!p.supports_delivery_complete());
        assert!(p.wants_connid_hdr());
        // feature id 66 lives in word 1, bit 2
        assert!(p.has_feature(66));
        assert!(!p.has_feature(65));
    }

    #[test]
    fn test_raw_addr_hdr_suppressed_after_handshake() {
        let mut p = peer();
        assert!(p.needs_raw_addr_hdr());
        p.apply_handshake(vec![0]);
        assert!(!p.needs_raw_addr_hdr());

        let mut q = peer();
        q.apply_handshake(vec![extra_feature::STABLE_HEADER_LENGTH]);
        assert!(q.needs_raw_addr_hdr());
    }

    #[test]
    fn test_connid_mismatch_dropped() {
        let mut p = peer();
        assert!(p.connid_matches(None));
        assert!(p.connid_matches(Some(0xaabb)));
        assert!(!p.connid_matches(Some(0xdead)));
        assert_eq!(p.stats.dropped_connid, 1);
    }

    #[test]
    fn test_backoff_grows_and_resets() {
        let mut p = peer();
        p.rnr_backoff(1, 512);
        assert!(p.in_backoff);
        p.rnr_backoff(1, 512);
        assert_eq!(p.rnr_backoff_exp, 2);
        p.reset_backoff_state();
        assert_eq!(p.rnr_backoff_exp, 0);
    }

    #[test]
    fn test_use_cnt() {
        let mut p = peer();
        assert_eq!(p.use_cnt(), 0);
        p.track_tx(1);
        p.track_rx(2);
        p.outstanding_pkts += 1;
        assert_eq!(p.use_cnt(), 3);
        p.untrack_tx(1);
        p.untrack_rx(2);
        assert_eq!(p.use_cnt(), 1);
    }
}
