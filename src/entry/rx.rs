//! Inbound operation entries.

use super::BufDesc;
use crate::addr::{FI_ADDR_UNSPEC, FiAddr};
use crate::transport::MemSeg;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// Posted, unmatched.
    Init,
    /// Created from an unexpected REQ, waiting for a matching recv.
    Unexp,
    /// Matched to a message; protocol not yet driving data.
    Matched,
    /// Data flowing (CTS sent or reads posted).
    Recv,
    /// A control packet hit EAGAIN and waits on the progress loop.
    QueuedCtrl,
    /// Terminal.
    Done,
}

#[derive(Debug)]
pub struct RxEntry {
    pub id: usize,
    pub state: RxState,

    /// Source the application asked for; `FI_ADDR_UNSPEC` matches any.
    pub addr: FiAddr,
    /// Matched source.
    pub peer: Option<FiAddr>,
    pub tagged: bool,
    pub tag: u64,
    pub ignore: u64,

    pub iov: Vec<MemSeg>,
    pub desc: Vec<BufDesc>,
    /// Total iov capacity.
    pub capacity: usize,
    /// Message length from the REQ header (eager: packet-derived).
    pub msg_length: usize,
    pub bytes_received: usize,
    pub bytes_copied: usize,
    /// Bytes granted to the sender in the current CTS round.
    pub window: usize,

    pub msg_id: Option<u32>,
    /// Sender's tx entry id, echoed in CTS/EOR/RECEIPT.
    pub peer_send_id: Option<u32>,
    pub context: u64,
    pub cq_data: Option<u64>,
    /// Sender asked for delivery-complete: RECEIPT after the copy lands.
    pub dc: bool,
    /// REQ packet type that matched this entry.
    pub rtm_typ: u8,

    // Multi-recv: a parent buffer is sliced across arriving messages; each
    // slice is a child entry pointing back at the parent.
    pub is_multi_recv: bool,
    pub multi_parent: Option<usize>,
    /// Parent: bytes carved out so far.
    pub consumed: usize,
    /// Parent: live child entries.
    pub active_children: usize,

    pub canceled: bool,
    /// Inbound packets parked on this entry (unexpected REQ or reordered
    /// segments).
    pub held_pkts: Vec<usize>,
    /// Encoded control packets waiting to be (re)posted.
    pub queued_pkts: Vec<usize>,
    /// Control packet types that could not get a buffer yet; the progress
    /// loop re-issues them.
    pub pending_ctrl: Vec<u8>,
    pub read_entry: Option<usize>,
    /// Requester-side tx entry this internal entry is receiving a response
    /// for (emulated read, fetching atomic); completed together.
    pub linked_tx: Option<usize>,
    /// On-the-fly registrations, dropped at completion.
    pub tmp_mr: Vec<u64>,

    /// Rx side of an emulated write/atomic: no application completion
    /// besides remote CQ data.
    pub internal: bool,
    /// Data is fully received but a control packet (EOR/RECEIPT/response)
    /// is still queued; complete once it drains.
    pub pending_completion: bool,
    pub completed: bool,
}

impl RxEntry {
    pub fn new(
        id: usize,
        addr: FiAddr,
        tagged: bool,
        tag: u64,
        ignore: u64,
        iov: Vec<MemSeg>,
        desc: Vec<BufDesc>,
        context: u64,
    ) -> Self {
        let capacity = super::iov_total(&iov);
        Self {
            id,
            state: RxState::Init,
            addr,
            peer: None,
            tagged,
            tag,
            ignore,
            iov,
            desc,
            capacity,
            msg_length: 0,
            bytes_received: 0,
            bytes_copied: 0,
            window: 0,
            msg_id: None,
            peer_send_id: None,
            context,
            cq_data: None,
            dc: false,
            rtm_typ: 0,
            is_multi_recv: false,
            multi_parent: None,
            consumed: 0,
            active_children: 0,
            canceled: false,
            held_pkts: Vec::new(),
            queued_pkts: Vec::new(),
            pending_ctrl: Vec::new(),
            read_entry: None,
            linked_tx: None,
            tmp_mr: Vec::new(),
            internal: false,
            pending_completion: false,
            completed: false,
        }
    }

    /// Internal entry for the rx side of an emulated one-sided op.
    pub fn new_internal(id: usize, peer: FiAddr) -> Self {
        let mut entry = Self::new(id, peer, false, 0, 0, Vec::new(), Vec::new(), 0);
        entry.peer = Some(peer);
        entry.internal = true;
        entry.state = RxState::Recv;
        entry
    }

    /// Does a REQ from `peer` with this tag match the posted entry?
    pub fn matches(&self, peer: FiAddr, tagged: bool, tag: u64) -> bool {
        if self.tagged != tagged || self.canceled {
            return false;
        }
        if self.addr != FI_ADDR_UNSPEC && self.addr != peer {
            return false;
        }
        if self.tagged && (self.tag ^ tag) & !self.ignore != 0 {
            return false;
        }
        true
    }

    /// Everything the sender will deliver has been copied (or truncated at
    /// capacity).
    pub fn recv_done(&self) -> bool {
        self.bytes_received >= self.msg_length.min(self.capacity)
            || (self.msg_length == 0 && self.state != RxState::Init)
    }

    /// Length reported in the completion entry.
    pub fn cq_len(&self) -> usize {
        self.msg_length.min(self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rx_matching() {
        let e = RxEntry::new(0, FI_ADDR_UNSPEC, false, 0, 0, Vec::new(), Vec::new(), 0);
        assert!(e.matches(5, false, 0));
        assert!(!e.matches(5, true, 0));

        let e = RxEntry::new(0, 3, true, 0xff00, 0x00ff, Vec::new(), Vec::new(), 0);
        assert!(e.matches(3, true, 0xff00));
        assert!(e.matches(3, true, 0xff42), "ignored bits are wildcards");
        assert!(!e.matches(3, true, 0x0000));
        assert!(!e.matches(4, true, 0xff00), "wrong source");
    }

    #[test]
    fn test_canceled_never_matches() {
        let mut e = RxEntry::new(0, FI_ADDR_UNSPEC, false, 0, 0, Vec::new(), Vec::new(), 0);
        e.canceled = true;
        assert!(!e.matches(1, false, 0));
    }
}
