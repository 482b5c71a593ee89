//! Outbound operation entries.

use super::BufDesc;
use crate::addr::FiAddr;
use crate::error::RdmError;
use crate::proto::atomic::AtomicParams;
use crate::transport::MemSeg;
use crate::wire::RmaIov;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOp {
    Msg,
    Tagged,
    Write,
    Read,
    AtomicWrite,
    AtomicFetch,
    AtomicCompare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Created, nothing posted yet.
    Req,
    /// First packet posted; data flowing.
    Send,
    /// A control packet hit EAGAIN and waits on the progress loop.
    QueuedCtrl,
    /// The REQ packet took an RNR; waiting out peer backoff.
    QueuedReqRnr,
    /// One or more DATA packets took an RNR; waiting out peer backoff.
    QueuedDataRnr,
    /// Terminal. The entry is freed once bookkeeping drains.
    Done,
}

/// Packet family the driver chose for this send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxProto {
    Eager,
    Medium,
    LongCts,
    LongRead,
    /// fi_read satisfied by the transport directly, no protocol packets.
    DirectRead,
    /// Emulated read via RTR.
    EmulatedRead,
    Atomic,
}

#[derive(Debug)]
pub struct TxEntry {
    pub id: usize,
    pub op: TxOp,
    pub proto: TxProto,
    pub state: TxState,
    pub peer: FiAddr,
    pub context: u64,

    pub iov: Vec<MemSeg>,
    pub desc: Vec<BufDesc>,
    pub total_len: usize,
    pub bytes_sent: usize,
    pub bytes_acked: usize,

    /// Bytes the peer granted in the current CTS round.
    pub window: usize,
    pub msg_id: u32,
    pub tag: u64,
    pub cq_data: Option<u64>,

    /// Delivery-complete requested: hold the completion for the RECEIPT.
    pub dc: bool,
    pub receipt_received: bool,
    /// Peer's rx entry id, learned from CTS (stamped on DATA packets).
    pub peer_recv_id: Option<u32>,
    pub credit_request: u32,

    /// Encoded packets waiting to be (re)posted.
    pub queued_pkts: Vec<usize>,
    /// Packets posted to a transport and not yet completed. The entry must
    /// outlive them.
    pub pkts_in_flight: usize,

    /// Target regions for one-sided ops.
    pub rma_iov: Vec<RmaIov>,
    /// Remote source for fi_read.
    pub remote_iov: Vec<RmaIov>,
    pub atomic: Option<AtomicParams>,
    pub read_entry: Option<usize>,
    /// Registrations made on the fly (long-read source buffers), dropped at
    /// completion.
    pub tmp_mr: Vec<u64>,

    /// Injected send: no completion entry is written.
    pub suppress_completion: bool,
    pub completed: bool,
    pub failed: Option<RdmError>,
}

impl TxEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        op: TxOp,
        peer: FiAddr,
        iov: Vec<MemSeg>,
        desc: Vec<BufDesc>,
        total_len: usize,
        context: u64,
    ) -> Self {
        Self {
            id,
            op,
            proto: TxProto::Eager,
            state: TxState::Req,
            peer,
            context,
            iov,
            desc,
            total_len,
            bytes_sent: 0,
            bytes_acked: 0,
            window: 0,
            msg_id: 0,
            tag: 0,
            cq_data: None,
            dc: false,
            receipt_received: false,
            peer_recv_id: None,
            credit_request: 0,
            queued_pkts: Vec::new(),
            pkts_in_flight: 0,
            rma_iov: Vec::new(),
            remote_iov: Vec::new(),
            atomic: None,
            read_entry: None,
            tmp_mr: Vec::new(),
            suppress_completion: false,
            completed: false,
            failed: None,
        }
    }

    pub fn tagged(&self) -> bool {
        self.op == TxOp::Tagged
    }

    pub fn mark_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes;
        self.check();
    }

    pub fn mark_acked(&mut self, bytes: usize) {
        self.bytes_acked += bytes;
        self.check();
    }

    pub fn all_acked(&self) -> bool {
        self.bytes_acked == self.total_len
    }

    /// Ready for its (single) completion: all bytes acknowledged, no packet
    /// still in flight, and, under delivery-complete, the RECEIPT seen.
    pub fn completion_ready(&self) -> bool {
        self.all_acked()
            && self.pkts_in_flight == 0
            && (!self.dc || self.receipt_received)
            && self.read_entry.is_none()
    }

    fn check(&self) {
        debug_assert!(
            self.bytes_acked <= self.bytes_sent && self.bytes_sent <= self.total_len,
            "tx {} accounting: acked {} sent {} total {}",
            self.id,
            self.bytes_acked,
            self.bytes_sent,
            self.total_len
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_accounting() {
        let mut tx = TxEntry::new(0, TxOp::Msg, 1, Vec::new(), Vec::new(), 100, 0xc0);
        tx.mark_sent(60);
        tx.mark_acked(60);
        assert!(!tx.all_acked());
        tx.mark_sent(40);
        tx.mark_acked(40);
        assert!(tx.all_acked());
        assert!(tx.completion_ready());
    }

    #[test]
    fn test_tx_dc_holds_completion() {
        let mut tx = TxEntry::new(0, TxOp::Msg, 1, Vec::new(), Vec::new(), 10, 0);
        tx.dc = true;
        tx.mark_sent(10);
        tx.mark_acked(10);
        assert!(!tx.completion_ready());
        tx.receipt_received = true;
        assert!(tx.completion_ready());
    }
}
