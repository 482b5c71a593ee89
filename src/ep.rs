//! The RDM endpoint: public operation surface and the state shared by the
//! sub-protocol drivers.
//!
//! The endpoint is a single-threaded cooperative state machine. Application
//! calls only enqueue intent; every transfer is driven to completion by the
//! progress engine. Methods take `&mut self`, which is the endpoint lock
//! expressed through ownership.

use crate::addr::{FI_ADDR_UNSPEC, FiAddr, RawAddress};
use crate::av::{AddressVector, AvStats};
use crate::config::Config;
use crate::cq::{CompletionQueue, CqEntry, CqErrEntry, comp_flags};
use crate::entry::{
    Arena, BufDesc, ReadEntry, RxEntry, RxState, TxEntry, TxOp, TxState, iov_total,
};
use crate::error::{RdmError, RdmResult};
use crate::hmem::HmemRegistry;
use crate::peer::extra_feature;
use crate::pool::{PktOwner, PktPool, PktState};
use crate::proto;
use crate::proto::atomic::{AtomicDatatype, AtomicOp, AtomicParams};
use crate::transport::{MemSeg, MemoryRegistrar, ShmTransport, Transport, TransportCompletion};
use crate::wire::RmaIov;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace, warn};

// Work-request id namespace: the high byte selects the owner kind, the rest
// is a pool or arena index.
pub(crate) mod wrid {
    pub const KIND_TX_PKT: u64 = 1;
    pub const KIND_RX_PKT: u64 = 2;
    pub const KIND_READ: u64 = 3;

    const SHIFT: u64 = 56;

    pub fn pack(kind: u64, idx: usize) -> u64 {
        (kind << SHIFT) | idx as u64
    }

    pub fn unpack(wr_id: u64) -> (u64, usize) {
        (wr_id >> SHIFT, (wr_id & ((1 << SHIFT) - 1)) as usize)
    }
}

/// Result of trying to push a packet toward the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PostOutcome {
    Posted,
    /// Parked on the owning entry; the progress loop re-drives it.
    Queued,
    /// The owning entry was failed.
    Failed,
}

/// Optional send attributes beyond the plain payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOpts {
    pub tag: Option<u64>,
    /// 8 bytes delivered in the receiver's completion.
    pub cq_data: Option<u64>,
    /// Hold the local completion until the peer confirms delivery.
    pub delivery_complete: bool,
}

/// Endpoint-wide counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointStats {
    pub tx_started: u64,
    pub rx_posted: u64,
    pub completions: u64,
    pub completion_errors: u64,
    pub proto_errors: u64,
    pub unexpected_msgs: u64,
}

pub struct Endpoint {
    pub(crate) cfg: Config,
    pub(crate) raw: RawAddress,
    /// Extra features advertised in our HANDSHAKE.
    pub(crate) features: u64,

    pub(crate) transport: Box<dyn Transport>,
    pub(crate) shm: Option<Box<dyn ShmTransport>>,
    pub(crate) registrar: Box<dyn MemoryRegistrar>,
    pub(crate) hmem: HmemRegistry,
    pub(crate) av: AddressVector,

    pub(crate) tx_pool: PktPool,
    pub(crate) rx_pool: PktPool,
    pub(crate) unexp_pool: PktPool,

    pub(crate) tx_entries: Arena<TxEntry>,
    pub(crate) rx_entries: Arena<RxEntry>,
    pub(crate) read_entries: Arena<ReadEntry>,

    /// Posted untagged receives, match order.
    pub(crate) posted_recvs: VecDeque<usize>,
    /// Posted tagged receives, match order.
    pub(crate) posted_trecvs: VecDeque<usize>,
    /// Unexpected untagged messages (rx entry ids in `Unexp` state).
    pub(crate) unexp_msgs: VecDeque<usize>,
    /// Unexpected tagged messages.
    pub(crate) unexp_tagged: VecDeque<usize>,
    /// (peer, msg_id) -> rx entry, for segments arriving out of order.
    pub(crate) pkt_rx_map: HashMap<(FiAddr, u32), usize>,

    pub(crate) cq: CompletionQueue,

    /// Posted-but-uncompleted tx work requests, all transports.
    pub(crate) outstanding_tx: usize,
    pub(crate) rx_posted_wire: usize,
    pub(crate) rx_posted_shm: usize,

    /// TX entries in long-CTS state with window > 0.
    pub(crate) tx_pending_list: Vec<usize>,
    /// Read entries with chunks left to post.
    pub(crate) read_pending_list: Vec<usize>,
    /// Peers currently in RNR backoff.
    pub(crate) backoff_peers: Vec<FiAddr>,
    /// RX entries with queued control packets.
    pub(crate) queued_rx: Vec<usize>,
    /// TX entries with queued packets.
    pub(crate) queued_tx: Vec<usize>,

    pub(crate) stats: EndpointStats,
    pub(crate) comp_scratch: Vec<TransportCompletion>,
}

impl Endpoint {
    pub fn new(
        cfg: Config,
        transport: Box<dyn Transport>,
        shm: Option<Box<dyn ShmTransport>>,
        mut registrar: Box<dyn MemoryRegistrar>,
        hmem: HmemRegistry,
    ) -> RdmResult<Self> {
        let connid: u32 = rand::thread_rng().r#gen();
        let raw = RawAddress::new(transport.local_gid(), transport.local_qpn(), connid);

        let mut features = cfg.features;
        if !transport.supports_rdma_read() {
            features &= !extra_feature::RDMA_READ;
        }

        let entry_size = transport.mtu();
        let tx_pool = PktPool::new(cfg.tx_pool_size, entry_size, registrar.as_mut())?;
        let rx_pool = PktPool::new(cfg.rx_pool_size, entry_size, registrar.as_mut())?;
        let unexp_pool = PktPool::new(cfg.unexp_pool_size, entry_size, registrar.as_mut())?;

        debug!(addr = %raw, features = format_args!("{features:#x}"), "endpoint open");

        let mut ep = Self {
            av: AddressVector::new(cfg.recvwin_size),
            cq: CompletionQueue::new(cfg.cq_size),
            raw,
            features,
            transport,
            shm,
            registrar,
            hmem,
            tx_pool,
            rx_pool,
            unexp_pool,
            tx_entries: Arena::new(),
            rx_entries: Arena::new(),
            read_entries: Arena::new(),
            posted_recvs: VecDeque::new(),
            posted_trecvs: VecDeque::new(),
            unexp_msgs: VecDeque::new(),
            unexp_tagged: VecDeque::new(),
            pkt_rx_map: HashMap::new(),
            outstanding_tx: 0,
            rx_posted_wire: 0,
            rx_posted_shm: 0,
            tx_pending_list: Vec::new(),
            read_pending_list: Vec::new(),
            backoff_peers: Vec::new(),
            queued_rx: Vec::new(),
            queued_tx: Vec::new(),
            stats: EndpointStats::default(),
            comp_scratch: Vec::new(),
            cfg,
        };
        // Prime the receive side so first contact cannot hit an empty queue.
        crate::progress::run(&mut ep);
        Ok(ep)
    }

    pub fn raw_addr(&self) -> RawAddress {
        self.raw
    }

    pub fn stats(&self) -> EndpointStats {
        self.stats
    }

    pub fn av_stats(&self) -> AvStats {
        self.av.stats()
    }

    pub fn peer_stats(&self, fi_addr: FiAddr) -> Option<crate::peer::PeerStats> {
        self.av.peer(fi_addr).map(|p| p.stats)
    }

    // =========================================================================
    // ADDRESS VECTOR
    // =========================================================================

    pub fn av_insert(&mut self, raw: RawAddress) -> RdmResult<FiAddr> {
        let mut dropped = Vec::new();
        let mut dropped_ctrl = Vec::new();
        let fi_addr = self.av.insert(
            self.transport.as_mut(),
            self.shm.as_deref_mut(),
            self.cfg.shm_enabled,
            &self.raw,
            &self.cfg.local_gids,
            raw,
            &mut dropped,
            &mut dropped_ctrl,
        )?;
        for pkt in dropped {
            self.unexp_pool.release(pkt);
        }
        for pkt in dropped_ctrl {
            self.tx_pool.release(pkt);
        }
        Ok(fi_addr)
    }

    /// `av_insert` with attribute flags. No attribute bit is supported.
    pub fn av_insert_with_flags(&mut self, raw: RawAddress, flags: u64) -> RdmResult<FiAddr> {
        if flags != 0 {
            return Err(RdmError::NotSupported);
        }
        self.av_insert(raw)
    }

    pub fn av_lookup(&self, fi_addr: FiAddr) -> RdmResult<RawAddress> {
        self.av.lookup(fi_addr)
    }

    pub fn av_remove(&mut self, fi_addr: FiAddr) -> RdmResult<()> {
        let (dropped, dropped_ctrl) =
            self.av.remove(self.transport.as_mut(), self.shm.as_deref_mut(), fi_addr)?;
        for pkt in dropped {
            self.unexp_pool.release(pkt);
        }
        for pkt in dropped_ctrl {
            self.tx_pool.release(pkt);
        }
        Ok(())
    }

    pub fn av_reverse_lookup(&self, ahn: u16, qpn: u16) -> Option<FiAddr> {
        self.av.reverse_lookup(ahn, qpn)
    }

    // =========================================================================
    // TWO-SIDED SENDS
    // =========================================================================

    pub fn send(&mut self, peer: FiAddr, seg: MemSeg, desc: BufDesc, context: u64) -> RdmResult<()> {
        self.sendv(peer, &[seg], &[desc], context)
    }

    pub fn sendv(
        &mut self,
        peer: FiAddr,
        iov: &[MemSeg],
        desc: &[BufDesc],
        context: u64,
    ) -> RdmResult<()> {
        self.send_with_opts(peer, iov, desc, SendOpts::default(), context)
    }

    pub fn tsend(
        &mut self,
        peer: FiAddr,
        seg: MemSeg,
        desc: BufDesc,
        tag: u64,
        context: u64,
    ) -> RdmResult<()> {
        self.send_with_opts(peer, &[seg], &[desc], SendOpts { tag: Some(tag), ..Default::default() }, context)
    }

    pub fn tsendv(
        &mut self,
        peer: FiAddr,
        iov: &[MemSeg],
        desc: &[BufDesc],
        tag: u64,
        context: u64,
    ) -> RdmResult<()> {
        self.send_with_opts(peer, iov, desc, SendOpts { tag: Some(tag), ..Default::default() }, context)
    }

    pub fn send_with_data(
        &mut self,
        peer: FiAddr,
        seg: MemSeg,
        desc: BufDesc,
        data: u64,
        context: u64,
    ) -> RdmResult<()> {
        self.send_with_opts(
            peer,
            &[seg],
            &[desc],
            SendOpts { cq_data: Some(data), ..Default::default() },
            context,
        )
    }

    /// Buffered small send: the payload is copied into a packet buffer
    /// immediately, the local completion is written before return, and the
    /// application may reuse its buffer right away. Eager-size only.
    pub fn inject(&mut self, peer: FiAddr, payload: &[u8]) -> RdmResult<()> {
        proto::eager::inject(self, peer, payload)
    }

    pub fn send_with_opts(
        &mut self,
        peer: FiAddr,
        iov: &[MemSeg],
        desc: &[BufDesc],
        opts: SendOpts,
        context: u64,
    ) -> RdmResult<()> {
        let peer_ref = self.av.peer(peer).ok_or(RdmError::InvalidArg)?;
        if opts.delivery_complete
            && peer_ref.handshake_received
            && !peer_ref.supports_delivery_complete()
        {
            return Err(RdmError::OpNotSupported);
        }

        let total_len = iov_total(iov);
        let op = if opts.tag.is_some() { TxOp::Tagged } else { TxOp::Msg };
        let iov = iov.to_vec();
        let desc = desc.to_vec();
        let tx_id = self.tx_entries.insert_with(|id| {
            let mut tx = TxEntry::new(id, op, peer, iov, desc, total_len, context);
            tx.tag = opts.tag.unwrap_or(0);
            tx.cq_data = opts.cq_data;
            tx.dc = opts.delivery_complete;
            tx.credit_request = 0;
            tx
        });
        self.av.peer_mut(peer).expect("validated above").track_tx(tx_id);
        self.stats.tx_started += 1;

        proto::start_msg_send(self, tx_id)
    }

    // =========================================================================
    // RECEIVES
    // =========================================================================

    pub fn recv(&mut self, addr: FiAddr, seg: MemSeg, desc: BufDesc, context: u64) -> RdmResult<()> {
        self.recvv(addr, &[seg], &[desc], context)
    }

    pub fn recvv(
        &mut self,
        addr: FiAddr,
        iov: &[MemSeg],
        desc: &[BufDesc],
        context: u64,
    ) -> RdmResult<()> {
        self.post_recv_entry(addr, false, 0, 0, iov, desc, false, context)
    }

    pub fn trecv(
        &mut self,
        addr: FiAddr,
        seg: MemSeg,
        desc: BufDesc,
        tag: u64,
        ignore: u64,
        context: u64,
    ) -> RdmResult<()> {
        self.post_recv_entry(addr, true, tag, ignore, &[seg], &[desc], false, context)
    }

    /// Post one large buffer sliced across arriving untagged messages. Each
    /// message gets its own completion; the buffer itself is released with a
    /// MULTI_RECV-flagged completion once its remaining space drops below
    /// the configured minimum.
    pub fn recv_multi(&mut self, seg: MemSeg, desc: BufDesc, context: u64) -> RdmResult<()> {
        self.post_recv_entry(FI_ADDR_UNSPEC, false, 0, 0, &[seg], &[desc], true, context)
    }

    #[allow(clippy::too_many_arguments)]
    fn post_recv_entry(
        &mut self,
        addr: FiAddr,
        tagged: bool,
        tag: u64,
        ignore: u64,
        iov: &[MemSeg],
        desc: &[BufDesc],
        multi: bool,
        context: u64,
    ) -> RdmResult<()> {
        if addr != FI_ADDR_UNSPEC && self.av.peer(addr).is_none() {
            return Err(RdmError::InvalidArg);
        }
        let iov = iov.to_vec();
        let desc = desc.to_vec();
        let rx_id = self.rx_entries.insert_with(|id| {
            let mut rx = RxEntry::new(id, addr, tagged, tag, ignore, iov, desc, context);
            rx.is_multi_recv = multi;
            rx
        });
        self.stats.rx_posted += 1;

        // Unexpected messages first, in arrival order.
        if proto::match_unexpected(self, rx_id)? {
            return Ok(());
        }

        if tagged {
            self.posted_trecvs.push_back(rx_id);
        } else {
            self.posted_recvs.push_back(rx_id);
        }
        Ok(())
    }

    /// Cancel a posted receive by context. Writes exactly one `Canceled`
    /// error completion; any packets still arriving for the operation are
    /// discarded silently.
    pub fn cancel(&mut self, context: u64) -> RdmResult<()> {
        let target = self
            .rx_entries
            .ids()
            .into_iter()
            .find(|id| {
                self.rx_entries.get(*id).is_some_and(|rx| {
                    !rx.internal && !rx.completed && !rx.canceled && rx.context == context
                })
            })
            .ok_or(RdmError::InvalidArg)?;

        let rx = self.rx_entries.get_mut(target).expect("found above");
        rx.canceled = true;
        let flags = base_rx_flags(rx.tagged);
        let tag = rx.tag;
        self.posted_recvs.retain(|id| *id != target);
        self.posted_trecvs.retain(|id| *id != target);
        self.cq.push_err(CqErrEntry { context, flags, len: 0, tag, err: RdmError::Canceled });
        self.stats.completion_errors += 1;
        debug!(rx = target, "receive canceled");

        // Nothing matched yet: the entry can go away entirely, unless a
        // multi-recv buffer still has children receiving into it.
        let rx = self.rx_entries.get(target).expect("found above");
        if rx.state == RxState::Init && rx.active_children == 0 {
            self.release_rx_entry(target);
        }
        Ok(())
    }

    // =========================================================================
    // ONE-SIDED (EMULATED)
    // =========================================================================

    pub fn write(
        &mut self,
        peer: FiAddr,
        iov: &[MemSeg],
        desc: &[BufDesc],
        rma_iov: &[RmaIov],
        context: u64,
    ) -> RdmResult<()> {
        self.write_with_opts(peer, iov, desc, rma_iov, SendOpts::default(), context)
    }

    pub fn write_with_data(
        &mut self,
        peer: FiAddr,
        iov: &[MemSeg],
        desc: &[BufDesc],
        rma_iov: &[RmaIov],
        data: u64,
        context: u64,
    ) -> RdmResult<()> {
        self.write_with_opts(
            peer,
            iov,
            desc,
            rma_iov,
            SendOpts { cq_data: Some(data), ..Default::default() },
            context,
        )
    }

    pub fn write_with_opts(
        &mut self,
        peer: FiAddr,
        iov: &[MemSeg],
        desc: &[BufDesc],
        rma_iov: &[RmaIov],
        opts: SendOpts,
        context: u64,
    ) -> RdmResult<()> {
        let peer_ref = self.av.peer(peer).ok_or(RdmError::InvalidArg)?;
        if opts.tag.is_some() {
            return Err(RdmError::InvalidArg);
        }
        if opts.delivery_complete
            && peer_ref.handshake_received
            && !peer_ref.supports_delivery_complete()
        {
            return Err(RdmError::OpNotSupported);
        }
        let total_len = iov_total(iov);
        if total_len as u64 > rma_iov.iter().map(|e| e.len).sum::<u64>() {
            return Err(RdmError::InvalidArg);
        }

        let iov = iov.to_vec();
        let desc = desc.to_vec();
        let rma = rma_iov.to_vec();
        let tx_id = self.tx_entries.insert_with(|id| {
            let mut tx = TxEntry::new(id, TxOp::Write, peer, iov, desc, total_len, context);
            tx.rma_iov = rma;
            tx.cq_data = opts.cq_data;
            tx.dc = opts.delivery_complete;
            tx
        });
        self.av.peer_mut(peer).expect("validated above").track_tx(tx_id);
        self.stats.tx_started += 1;

        proto::rma::start_write(self, tx_id)
    }

    pub fn read(
        &mut self,
        peer: FiAddr,
        iov: &[MemSeg],
        desc: &[BufDesc],
        rma_iov: &[RmaIov],
        context: u64,
    ) -> RdmResult<()> {
        if self.av.peer(peer).is_none() {
            return Err(RdmError::InvalidArg);
        }
        let total_len = iov_total(iov);
        if (total_len as u64) > rma_iov.iter().map(|e| e.len).sum::<u64>() {
            return Err(RdmError::InvalidArg);
        }
        let iov = iov.to_vec();
        let desc = desc.to_vec();
        let rma = rma_iov.to_vec();
        let tx_id = self.tx_entries.insert_with(|id| {
            let mut tx = TxEntry::new(id, TxOp::Read, peer, iov, desc, total_len, context);
            tx.remote_iov = rma;
            tx
        });
        self.av.peer_mut(peer).expect("validated above").track_tx(tx_id);
        self.stats.tx_started += 1;

        proto::rma::start_read(self, tx_id)
    }

    // =========================================================================
    // ATOMICS (EMULATED)
    // =========================================================================

    pub fn atomic_write(
        &mut self,
        peer: FiAddr,
        datatype: AtomicDatatype,
        op: AtomicOp,
        iov: &[MemSeg],
        desc: &[BufDesc],
        rma_iov: &[RmaIov],
        context: u64,
    ) -> RdmResult<()> {
        self.start_atomic(peer, datatype, op, iov, desc, rma_iov, None, None, context)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn atomic_fetch(
        &mut self,
        peer: FiAddr,
        datatype: AtomicDatatype,
        op: AtomicOp,
        iov: &[MemSeg],
        desc: &[BufDesc],
        rma_iov: &[RmaIov],
        result_iov: &[MemSeg],
        result_desc: &[BufDesc],
        context: u64,
    ) -> RdmResult<()> {
        self.start_atomic(
            peer,
            datatype,
            op,
            iov,
            desc,
            rma_iov,
            None,
            Some((result_iov, result_desc)),
            context,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn atomic_compare(
        &mut self,
        peer: FiAddr,
        datatype: AtomicDatatype,
        iov: &[MemSeg],
        desc: &[BufDesc],
        rma_iov: &[RmaIov],
        compare_iov: &[MemSeg],
        result_iov: &[MemSeg],
        result_desc: &[BufDesc],
        context: u64,
    ) -> RdmResult<()> {
        self.start_atomic(
            peer,
            datatype,
            AtomicOp::Cswap,
            iov,
            desc,
            rma_iov,
            Some(compare_iov),
            Some((result_iov, result_desc)),
            context,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn start_atomic(
        &mut self,
        peer: FiAddr,
        datatype: AtomicDatatype,
        op: AtomicOp,
        iov: &[MemSeg],
        desc: &[BufDesc],
        rma_iov: &[RmaIov],
        compare_iov: Option<&[MemSeg]>,
        result: Option<(&[MemSeg], &[BufDesc])>,
        context: u64,
    ) -> RdmResult<()> {
        if self.av.peer(peer).is_none() {
            return Err(RdmError::InvalidArg);
        }
        let total_len = iov_total(iov);
        let elsize = datatype.size();
        if total_len == 0 || total_len % elsize != 0 {
            return Err(RdmError::InvalidArg);
        }
        if let Some(cmp) = compare_iov
            && iov_total(cmp) != total_len
        {
            return Err(RdmError::InvalidArg);
        }
        if let Some((res, _)) = result
            && iov_total(res) != total_len
        {
            return Err(RdmError::InvalidArg);
        }

        let txop = match (compare_iov.is_some(), result.is_some()) {
            (true, _) => TxOp::AtomicCompare,
            (false, true) => TxOp::AtomicFetch,
            (false, false) => TxOp::AtomicWrite,
        };
        let params = AtomicParams {
            datatype,
            op,
            count: total_len / elsize,
            compare_iov: compare_iov.map(<[MemSeg]>::to_vec).unwrap_or_default(),
            result_iov: result.map(|(r, _)| r.to_vec()).unwrap_or_default(),
            result_desc: result.map(|(_, d)| d.to_vec()).unwrap_or_default(),
        };
        let iov = iov.to_vec();
        let desc = desc.to_vec();
        let rma = rma_iov.to_vec();
        let tx_id = self.tx_entries.insert_with(|id| {
            let mut tx = TxEntry::new(id, txop, peer, iov, desc, total_len, context);
            tx.rma_iov = rma;
            tx.atomic = Some(params);
            tx
        });
        self.av.peer_mut(peer).expect("validated above").track_tx(tx_id);
        self.stats.tx_started += 1;

        proto::atomic::start(self, tx_id)
    }

    // =========================================================================
    // COMPLETION QUEUE / PROGRESS
    // =========================================================================

    pub fn progress(&mut self) {
        crate::progress::run(self);
    }

    pub fn cq_read(&mut self, max: usize, out: &mut Vec<CqEntry>) -> usize {
        self.cq.read(max, out)
    }

    pub fn cq_readerr(&mut self) -> Option<CqErrEntry> {
        self.cq.read_err()
    }

    // =========================================================================
    // PACKET PLUMBING (crate-internal)
    // =========================================================================

    /// Allocate a tx packet and encode a control header into it.
    pub(crate) fn alloc_ctrl_pkt(
        &mut self,
        peer: FiAddr,
        typ: u8,
        encode: impl FnOnce(&mut [u8]) -> RdmResult<usize>,
    ) -> RdmResult<usize> {
        let pkt_idx = self.tx_pool.alloc()?;
        match encode(self.tx_pool.get_mut(pkt_idx).buf_mut()) {
            Ok(len) => {
                let pkt = self.tx_pool.get_mut(pkt_idx);
                pkt.len = len;
                pkt.typ = typ;
                pkt.peer = peer;
                Ok(pkt_idx)
            }
            Err(err) => {
                self.tx_pool.release(pkt_idx);
                Err(err)
            }
        }
    }

    /// Post a fully-encoded tx-pool packet toward its peer, choosing the shm
    /// path for local peers. Returns `Again` when the peer is backed off,
    /// the outstanding cap is hit, or the transport pushes back.
    pub(crate) fn post_pkt(&mut self, pkt_idx: usize) -> RdmResult<()> {
        let pkt = self.tx_pool.get(pkt_idx);
        let fi_addr = pkt.peer;
        let len = pkt.len;
        let (seg, lkey) = pkt.seg();
        let peer = self.av.peer(fi_addr).ok_or(RdmError::InvalidArg)?;
        if peer.in_backoff {
            return Err(RdmError::Again);
        }
        if self.outstanding_tx >= self.transport.max_outstanding_tx() {
            return Err(RdmError::Again);
        }

        let shm_addr = if self.cfg.shm_enabled && self.shm.is_some() { peer.shm_addr } else { None };
        let wr_id = wrid::pack(wrid::KIND_TX_PKT, pkt_idx);
        match shm_addr {
            Some(addr) => {
                let shm = self.shm.as_mut().expect("shm_addr implies shm transport");
                shm.post_send(addr, &[seg], wr_id)?;
                self.tx_pool.get_mut(pkt_idx).via_shm = true;
            }
            None => {
                let (ah, qpn) = (peer.ah_handle, peer.raw.qpn);
                self.transport.post_send(ah, qpn, &[seg], &[lkey], wr_id, false)?;
                self.tx_pool.get_mut(pkt_idx).via_shm = false;
            }
        }
        self.outstanding_tx += 1;
        self.av.peer_mut(fi_addr).expect("checked above").on_pkt_sent(len);
        trace!(pkt = pkt_idx, peer = fi_addr, typ = self.tx_pool.get(pkt_idx).typ, "posted pkt");
        Ok(())
    }

    /// Post a packet owned by a tx entry. EAGAIN queues it on the entry for
    /// the progress loop; a hard transport error fails the entry.
    pub(crate) fn post_or_queue_tx(&mut self, tx_id: usize, pkt_idx: usize) -> PostOutcome {
        if self.tx_entries.get(tx_id).is_none() {
            self.tx_pool.release(pkt_idx);
            return PostOutcome::Failed;
        }
        self.tx_pool.get_mut(pkt_idx).owner = PktOwner::Tx(tx_id);
        match self.post_pkt(pkt_idx) {
            Ok(()) => {
                self.tx_entries.get_mut(tx_id).expect("live tx entry").pkts_in_flight += 1;
                PostOutcome::Posted
            }
            Err(RdmError::Again) => {
                let tx = self.tx_entries.get_mut(tx_id).expect("live tx entry");
                tx.queued_pkts.push(pkt_idx);
                if tx.state != TxState::QueuedReqRnr && tx.state != TxState::QueuedDataRnr {
                    tx.state = TxState::QueuedCtrl;
                }
                if !self.queued_tx.contains(&tx_id) {
                    self.queued_tx.push(tx_id);
                }
                PostOutcome::Queued
            }
            Err(_) => {
                self.tx_pool.release(pkt_idx);
                self.fail_tx(tx_id, RdmError::Io);
                PostOutcome::Failed
            }
        }
    }

    /// Post a packet owned by an rx entry (CTS, EOR, RECEIPT, responses).
    /// EAGAIN queues it on the entry; a hard transport error fails the entry.
    pub(crate) fn post_or_queue_rx(&mut self, rx_id: usize, pkt_idx: usize) -> PostOutcome {
        if self.rx_entries.get(rx_id).is_none() {
            self.tx_pool.release(pkt_idx);
            return PostOutcome::Failed;
        }
        self.tx_pool.get_mut(pkt_idx).owner = PktOwner::Rx(rx_id);
        match self.post_pkt(pkt_idx) {
            Ok(()) => {
                // Once posted, control replies outlive their entry: the peer
                // record takes ownership until the send completes.
                let pkt = self.tx_pool.get_mut(pkt_idx);
                pkt.owner = PktOwner::None;
                let peer = pkt.peer;
                self.av.peer_mut(peer).expect("posted toward live peer").outstanding_pkts += 1;
                PostOutcome::Posted
            }
            Err(RdmError::Again) => {
                let rx = self.rx_entries.get_mut(rx_id).expect("live rx entry");
                rx.queued_pkts.push(pkt_idx);
                if rx.state != RxState::Done {
                    rx.state = RxState::QueuedCtrl;
                }
                if !self.queued_rx.contains(&rx_id) {
                    self.queued_rx.push(rx_id);
                }
                PostOutcome::Queued
            }
            Err(_) => {
                self.tx_pool.release(pkt_idx);
                self.fail_rx(rx_id, RdmError::Io);
                PostOutcome::Failed
            }
        }
    }

    /// Move a received packet into the unexpected/reorder pool so the rx
    /// buffer can be reposted.
    pub(crate) fn clone_rx_pkt(&mut self, rx_pool_idx: usize) -> RdmResult<usize> {
        let clone_idx = self.unexp_pool.alloc()?;
        let src = self.rx_pool.get(rx_pool_idx);
        let (len, peer, typ) = (src.len, src.peer, src.typ);
        // two distinct pools, safe to borrow both
        let bytes = src.buf().to_vec();
        let dst = self.unexp_pool.get_mut(clone_idx);
        dst.buf_mut()[..len].copy_from_slice(&bytes);
        dst.len = len;
        dst.peer = peer;
        dst.typ = typ;
        dst.state = PktState::CopyByRead;
        Ok(clone_idx)
    }

    // =========================================================================
    // ENTRY COMPLETION (crate-internal)
    // =========================================================================

    /// Complete a tx entry if every condition (acks, receipts, in-flight
    /// packets, reads) is satisfied.
    pub(crate) fn maybe_complete_tx(&mut self, tx_id: usize) {
        if self.tx_entries.get(tx_id).is_some_and(TxEntry::completion_ready) {
            self.complete_tx(tx_id);
        }
    }

    /// Write the single success completion for a tx entry and free it.
    pub(crate) fn complete_tx(&mut self, tx_id: usize) {
        let tx = self.tx_entries.get_mut(tx_id).expect("live tx entry");
        debug_assert!(!tx.completed, "tx {tx_id} completed twice");
        tx.completed = true;
        if !tx.suppress_completion {
            let mut entry = CqEntry::new(tx.context, tx_flags(tx.op));
            entry.len = tx.total_len;
            entry.tag = tx.tag;
            if tx.dc {
                entry.flags |= comp_flags::DELIVERY_COMPLETE;
            }
            self.cq.push(entry);
            self.stats.completions += 1;
        }
        trace!(tx = tx_id, "tx complete");
        self.release_tx_entry(tx_id);
    }

    /// Write the single error completion for a tx entry and free it.
    pub(crate) fn fail_tx(&mut self, tx_id: usize, err: RdmError) {
        let tx = self.tx_entries.get_mut(tx_id).expect("live tx entry");
        debug_assert!(!tx.completed);
        tx.completed = true;
        tx.failed = Some(err);
        let (context, op, tag, peer) = (tx.context, tx.op, tx.tag, tx.peer);
        if !tx.suppress_completion {
            self.cq.push_err(CqErrEntry { context, flags: tx_flags(op), len: 0, tag, err });
            self.stats.completion_errors += 1;
        }
        warn!(tx = tx_id, peer, %err, "tx failed");
        self.release_tx_entry(tx_id);
    }

    fn release_tx_entry(&mut self, tx_id: usize) {
        let mut tx = self.tx_entries.remove(tx_id).expect("live tx entry");
        for pkt in tx.queued_pkts.drain(..) {
            self.tx_pool.release(pkt);
        }
        for handle in tx.tmp_mr.drain(..) {
            self.registrar.deregister(handle);
        }
        if let Some(read_id) = tx.read_entry {
            self.read_entries.remove(read_id);
            self.read_pending_list.retain(|id| *id != read_id);
        }
        if let Some(peer) = self.av.peer_mut(tx.peer) {
            peer.untrack_tx(tx_id);
        }
        self.tx_pending_list.retain(|id| *id != tx_id);
        self.queued_tx.retain(|id| *id != tx_id);
    }

    /// Write the completion for a finished rx entry (unless it is internal
    /// or canceled) and free it. Delivery receipts and EORs were already
    /// posted (or queued, in which case we are called once they drain).
    pub(crate) fn complete_rx(&mut self, rx_id: usize) {
        let rx = self.rx_entries.get_mut(rx_id).expect("live rx entry");
        debug_assert!(!rx.completed, "rx {rx_id} completed twice");
        debug_assert!(
            rx.queued_pkts.is_empty() && rx.pending_ctrl.is_empty(),
            "rx {rx_id} completing with queued ctrl"
        );
        rx.completed = true;

        let rx = self.rx_entries.get(rx_id).expect("live rx entry");
        if !rx.internal && !rx.canceled {
            let mut entry = CqEntry::new(rx.context, base_rx_flags(rx.tagged));
            entry.len = rx.cq_len();
            entry.tag = rx.tag;
            entry.src_addr = rx.peer.unwrap_or(FI_ADDR_UNSPEC);
            entry.buf = rx.iov.first().map(|s| s.addr).unwrap_or(0);
            if let Some(data) = rx.cq_data {
                entry.flags |= comp_flags::REMOTE_CQ_DATA;
                entry.data = data;
            }
            self.cq.push(entry);
            self.stats.completions += 1;
        } else if rx.internal && let Some(data) = rx.cq_data {
            // Emulated write with remote CQ data: the target side observes
            // a data-bearing completion even though it posted nothing.
            let mut entry = CqEntry::new(0, comp_flags::RMA | comp_flags::WRITE | comp_flags::REMOTE_CQ_DATA);
            entry.len = rx.bytes_received;
            entry.data = data;
            entry.src_addr = rx.peer.unwrap_or(FI_ADDR_UNSPEC);
            self.cq.push(entry);
            self.stats.completions += 1;
        }

        // Requester-side internal entries carry the completion of the tx
        // operation they were receiving the response for.
        let linked_tx = self.rx_entries.get(rx_id).and_then(|rx| rx.linked_tx);
        if let Some(tx_id) = linked_tx
            && let Some(tx) = self.tx_entries.get_mut(tx_id)
        {
            let remaining_sent = tx.total_len - tx.bytes_sent;
            tx.mark_sent(remaining_sent);
            let remaining = tx.total_len - tx.bytes_acked;
            tx.mark_acked(remaining);
            self.maybe_complete_tx(tx_id);
        }

        trace!(rx = rx_id, "rx complete");
        self.finish_multi_recv_child(rx_id);
        self.release_rx_entry(rx_id);
    }

    /// Write the single error completion for an rx entry and free it.
    pub(crate) fn fail_rx(&mut self, rx_id: usize, err: RdmError) {
        let rx = self.rx_entries.get_mut(rx_id).expect("live rx entry");
        debug_assert!(!rx.completed);
        rx.completed = true;
        let already_canceled = rx.canceled && err == RdmError::Canceled;
        if !rx.internal && !already_canceled {
            let (context, tagged, tag) = (rx.context, rx.tagged, rx.tag);
            self.cq.push_err(CqErrEntry {
                context,
                flags: base_rx_flags(tagged),
                len: 0,
                tag,
                err,
            });
            self.stats.completion_errors += 1;
        }
        let linked_tx = self.rx_entries.get(rx_id).and_then(|rx| rx.linked_tx);
        if let Some(tx_id) = linked_tx
            && self.tx_entries.get(tx_id).is_some()
        {
            self.fail_tx(tx_id, err);
        }
        warn!(rx = rx_id, %err, "rx failed");
        self.finish_multi_recv_child(rx_id);
        self.release_rx_entry(rx_id);
    }

    fn finish_multi_recv_child(&mut self, rx_id: usize) {
        let Some(parent_id) = self.rx_entries.get(rx_id).and_then(|rx| rx.multi_parent) else {
            return;
        };
        let Some(parent) = self.rx_entries.get_mut(parent_id) else {
            return;
        };
        debug_assert!(parent.active_children > 0);
        parent.active_children -= 1;
        self.maybe_retire_multi_recv(parent_id);
    }

    /// Retire a multi-recv buffer once it is too full to slice again and no
    /// child is still receiving into it.
    pub(crate) fn maybe_retire_multi_recv(&mut self, parent_id: usize) {
        let parent = self.rx_entries.get(parent_id).expect("live multi-recv parent");
        debug_assert!(parent.is_multi_recv);
        let exhausted = parent.capacity - parent.consumed < self.cfg.min_multi_recv;
        let still_posted = self.posted_recvs.contains(&parent_id);
        if parent.active_children > 0 || (!exhausted && still_posted) {
            return;
        }
        let context = parent.context;
        let consumed = parent.consumed;
        let canceled = parent.canceled;
        self.posted_recvs.retain(|id| *id != parent_id);
        if !canceled {
            let mut entry = CqEntry::new(context, comp_flags::MULTI_RECV);
            entry.len = consumed;
            self.cq.push(entry);
            self.stats.completions += 1;
        }
        self.rx_entries.remove(parent_id);
    }

    pub(crate) fn release_rx_entry(&mut self, rx_id: usize) {
        let Some(mut rx) = self.rx_entries.remove(rx_id) else {
            return;
        };
        for pkt in rx.held_pkts.drain(..) {
            self.unexp_pool.release(pkt);
        }
        for pkt in rx.queued_pkts.drain(..) {
            self.tx_pool.release(pkt);
        }
        for handle in rx.tmp_mr.drain(..) {
            self.registrar.deregister(handle);
        }
        if let Some(read_id) = rx.read_entry {
            self.read_entries.remove(read_id);
            self.read_pending_list.retain(|id| *id != read_id);
        }
        if let Some(msg_id) = rx.msg_id
            && let Some(peer) = rx.peer
        {
            self.pkt_rx_map.remove(&(peer, msg_id));
        }
        if let Some(peer) = rx.peer.and_then(|p| self.av.peer_mut(p)) {
            peer.untrack_rx(rx_id);
        }
        self.posted_recvs.retain(|id| *id != rx_id);
        self.posted_trecvs.retain(|id| *id != rx_id);
        self.unexp_msgs.retain(|id| *id != rx_id);
        self.unexp_tagged.retain(|id| *id != rx_id);
        self.queued_rx.retain(|id| *id != rx_id);
    }

    /// Record a protocol-level violation that has no owning entry.
    pub(crate) fn note_proto_error(&mut self, what: &str, peer: FiAddr) {
        self.stats.proto_errors += 1;
        warn!(peer, what, "protocol error");
    }
}

pub(crate) fn tx_flags(op: TxOp) -> u64 {
    match op {
        TxOp::Msg => comp_flags::SEND | comp_flags::MSG,
        TxOp::Tagged => comp_flags::SEND | comp_flags::TAGGED,
        TxOp::Write => comp_flags::RMA | comp_flags::WRITE,
        TxOp::Read => comp_flags::RMA | comp_flags::READ,
        TxOp::AtomicWrite | TxOp::AtomicFetch | TxOp::AtomicCompare => comp_flags::ATOMIC,
    }
}

pub(crate) fn base_rx_flags(tagged: bool) -> u64 {
    if tagged {
        comp_flags::RECV | comp_flags::TAGGED
    } else {
        comp_flags::RECV | comp_flags::MSG
    }
}
