//! The cooperative progress engine.
//!
//! Invoked from the explicit progress call and from every ingress/egress
//! API. All protocol work happens here: completion dispatch, receive-buffer
//! reposting, backoff expiry, retransmits, window-driven DATA, RDMA reads.
//! Nothing in the engine blocks; anything that cannot run now is left where
//! the next invocation finds it.

use crate::entry::{ReadOwner, RxState, TxState};
use crate::ep::{Endpoint, wrid};
use crate::error::RdmError;
use crate::pool::{PktOwner, PktState};
use crate::proto;
use crate::transport::{CqOpType, CqStatus, ShmCompletion, TransportCompletion};
use crate::wire::{is_req, pkt_type};
use std::time::Instant;
use tracing::{trace, warn};

pub(crate) fn run(ep: &mut Endpoint) {
    poll_wire_cq(ep); // 1
    poll_shm_cq(ep); // 2
    refill_rx_buffers(ep); // 3
    sweep_backoff(ep); // 4
    drive_peer_ctrl(ep); // 5
    drive_queued_rx(ep); // 6
    drive_queued_tx(ep); // 7
    drive_tx_pending(ep); // 8
    drive_reads(ep); // 9
    ep.transport.flush(); // 10
}

// =============================================================================
// STEP 1/2: COMPLETION POLLING
// =============================================================================

fn poll_wire_cq(ep: &mut Endpoint) {
    let mut comps = std::mem::take(&mut ep.comp_scratch);
    comps.clear();
    ep.transport.poll_cq(ep.cfg.cq_poll_batch, &mut comps);
    for comp in &comps {
        dispatch_completion(ep, *comp, false);
    }
    ep.comp_scratch = comps;
}

fn poll_shm_cq(ep: &mut Endpoint) {
    let Some(shm) = ep.shm.as_mut() else {
        return;
    };
    let mut comps: Vec<ShmCompletion> = Vec::new();
    shm.poll_cq(ep.cfg.cq_poll_batch, &mut comps);
    for comp in comps {
        let translated = TransportCompletion {
            op: comp.op,
            wr_id: comp.wr_id,
            status: comp.status,
            byte_len: comp.byte_len,
            src: None,
        };
        match comp.op {
            CqOpType::Recv => {
                let (kind, idx) = wrid::unpack(comp.wr_id);
                debug_assert_eq!(kind, wrid::KIND_RX_PKT);
                ep.rx_posted_shm = ep.rx_posted_shm.saturating_sub(1);
                if comp.status == CqStatus::Ok {
                    ep.rx_pool.get_mut(idx).len = comp.byte_len;
                    let src = comp.src_addr.expect("shm recv carries a source");
                    proto::dispatch_ingress(ep, idx, proto::Ingress::Shm { src_addr: src });
                }
                ep.rx_pool.release(idx);
            }
            _ => dispatch_completion(ep, translated, true),
        }
    }
}

fn dispatch_completion(ep: &mut Endpoint, comp: TransportCompletion, via_shm: bool) {
    match comp.op {
        CqOpType::Send => handle_send_completion(ep, comp),
        CqOpType::Recv => handle_recv_completion(ep, comp, via_shm),
        CqOpType::Read => handle_read_completion(ep, comp),
    }
}

fn handle_send_completion(ep: &mut Endpoint, comp: TransportCompletion) {
    let (kind, pkt_idx) = wrid::unpack(comp.wr_id);
    debug_assert_eq!(kind, wrid::KIND_TX_PKT);
    ep.outstanding_tx = ep.outstanding_tx.saturating_sub(1);

    let (peer_addr, owner, payload_len) = {
        let pkt = ep.tx_pool.get(pkt_idx);
        (pkt.peer, pkt.owner, pkt.payload_len)
    };
    if let Some(peer) = ep.av.peer_mut(peer_addr) {
        peer.on_send_completed();
        if comp.status == CqStatus::Ok {
            peer.reset_backoff_state();
        }
    }

    match comp.status {
        CqStatus::Ok => {
            match owner {
                PktOwner::Tx(tx_id) => {
                    ep.tx_pool.release(pkt_idx);
                    if let Some(tx) = ep.tx_entries.get_mut(tx_id) {
                        tx.pkts_in_flight = tx.pkts_in_flight.saturating_sub(1);
                        tx.mark_acked(payload_len);
                        ep.maybe_complete_tx(tx_id);
                    }
                }
                PktOwner::Rx(_) | PktOwner::None => {
                    // Peer-owned control traffic.
                    ep.tx_pool.release(pkt_idx);
                    if let Some(peer) = ep.av.peer_mut(peer_addr) {
                        peer.outstanding_pkts = peer.outstanding_pkts.saturating_sub(1);
                    }
                }
            }
        }
        CqStatus::Rnr => handle_rnr(ep, pkt_idx),
        CqStatus::Err => {
            ep.tx_pool.release(pkt_idx);
            match owner {
                PktOwner::Tx(tx_id) => {
                    if let Some(tx) = ep.tx_entries.get_mut(tx_id) {
                        tx.pkts_in_flight = tx.pkts_in_flight.saturating_sub(1);
                        ep.fail_tx(tx_id, RdmError::Io);
                    }
                }
                PktOwner::Rx(_) | PktOwner::None => {
                    if let Some(peer) = ep.av.peer_mut(peer_addr) {
                        peer.outstanding_pkts = peer.outstanding_pkts.saturating_sub(1);
                    }
                    warn!(peer = peer_addr, "control packet failed at transport");
                }
            }
        }
    }
}

/// Receiver-not-ready: back the peer off and park the packet for
/// retransmit, failing the owner once the retry budget is gone.
fn handle_rnr(ep: &mut Endpoint, pkt_idx: usize) {
    let (peer_addr, owner, typ) = {
        let pkt = ep.tx_pool.get_mut(pkt_idx);
        pkt.rnr_retries += 1;
        pkt.state = PktState::RnrRetransmit;
        (pkt.peer, pkt.owner, pkt.typ)
    };
    let retries = ep.tx_pool.get(pkt_idx).rnr_retries;

    if retries > ep.cfg.rnr_retry_cap {
        warn!(peer = peer_addr, typ, retries, "RNR retries exhausted");
        ep.tx_pool.release(pkt_idx);
        match owner {
            PktOwner::Tx(tx_id) => {
                if let Some(tx) = ep.tx_entries.get_mut(tx_id) {
                    tx.pkts_in_flight = tx.pkts_in_flight.saturating_sub(1);
                    ep.fail_tx(tx_id, RdmError::Io);
                }
            }
            PktOwner::Rx(_) | PktOwner::None => {
                if let Some(peer) = ep.av.peer_mut(peer_addr) {
                    peer.outstanding_pkts = peer.outstanding_pkts.saturating_sub(1);
                }
            }
        }
        return;
    }

    let (initial, max) = (ep.cfg.rnr_backoff_initial_ms, ep.cfg.rnr_backoff_max_ms);
    if let Some(peer) = ep.av.peer_mut(peer_addr) {
        peer.rnr_backoff(initial, max);
        if !ep.backoff_peers.contains(&peer_addr) {
            ep.backoff_peers.push(peer_addr);
        }
    }

    match owner {
        PktOwner::Tx(tx_id) => {
            if let Some(tx) = ep.tx_entries.get_mut(tx_id) {
                tx.pkts_in_flight = tx.pkts_in_flight.saturating_sub(1);
                tx.queued_pkts.push(pkt_idx);
                tx.state =
                    if is_req(typ) { TxState::QueuedReqRnr } else { TxState::QueuedDataRnr };
                if !ep.queued_tx.contains(&tx_id) {
                    ep.queued_tx.push(tx_id);
                }
            } else {
                ep.tx_pool.release(pkt_idx);
            }
        }
        PktOwner::Rx(_) | PktOwner::None => {
            // Peer-owned control packet (grant/terminator/handshake).
            match ep.av.peer_mut(peer_addr) {
                Some(peer) => {
                    peer.outstanding_pkts = peer.outstanding_pkts.saturating_sub(1);
                    if typ == pkt_type::HANDSHAKE {
                        // Handshakes are re-encoded rather than retransmitted.
                        peer.handshake_pending = true;
                        ep.tx_pool.release(pkt_idx);
                    } else {
                        peer.queued_ctrl.push(pkt_idx);
                    }
                }
                None => ep.tx_pool.release(pkt_idx),
            }
        }
    }
}

fn handle_recv_completion(ep: &mut Endpoint, comp: TransportCompletion, via_shm: bool) {
    debug_assert!(!via_shm, "shm recvs are translated by the shm poller");
    let (kind, pkt_idx) = wrid::unpack(comp.wr_id);
    debug_assert_eq!(kind, wrid::KIND_RX_PKT);
    ep.rx_posted_wire = ep.rx_posted_wire.saturating_sub(1);

    if comp.status != CqStatus::Ok {
        ep.rx_pool.release(pkt_idx);
        return;
    }
    ep.rx_pool.get_mut(pkt_idx).len = comp.byte_len;
    let Some(src) = comp.src else {
        ep.rx_pool.release(pkt_idx);
        return;
    };
    proto::dispatch_ingress(ep, pkt_idx, proto::Ingress::Wire { ahn: src.ahn, qpn: src.qpn });
    ep.rx_pool.release(pkt_idx);
}

fn handle_read_completion(ep: &mut Endpoint, comp: TransportCompletion) {
    let (kind, read_id) = wrid::unpack(comp.wr_id);
    debug_assert_eq!(kind, wrid::KIND_READ);
    ep.outstanding_tx = ep.outstanding_tx.saturating_sub(1);

    let Some(read) = ep.read_entries.get_mut(read_id) else {
        return;
    };
    let owner = read.owner;
    if comp.status != CqStatus::Ok {
        match owner {
            ReadOwner::Tx(tx_id) => ep.fail_tx(tx_id, RdmError::Io),
            ReadOwner::Rx(rx_id) => ep.fail_rx(rx_id, RdmError::Io),
        }
        return;
    }
    read.on_read_completed(comp.byte_len);
    if read.finished() {
        match owner {
            ReadOwner::Rx(rx_id) => proto::longread::rx_reads_done(ep, rx_id),
            ReadOwner::Tx(tx_id) => proto::rma::tx_reads_done(ep, tx_id),
        }
    }
}

// =============================================================================
// STEP 3: RECEIVE BUFFER REPOSTING
// =============================================================================

fn refill_rx_buffers(ep: &mut Endpoint) {
    // Wire transport, bulk posted; only the last buffer flushes the batch.
    let want = ep.cfg.rx_posted_target.saturating_sub(ep.rx_posted_wire);
    let n = want.min(ep.rx_pool.available());
    for i in 0..n {
        let Ok(pkt_idx) = ep.rx_pool.alloc() else { break };
        let (seg, lkey) = ep.rx_pool.get(pkt_idx).recv_seg();
        let wr_id = wrid::pack(wrid::KIND_RX_PKT, pkt_idx);
        match ep.transport.post_recv(seg, lkey, wr_id, i + 1 < n) {
            Ok(()) => ep.rx_posted_wire += 1,
            Err(_) => {
                ep.rx_pool.release(pkt_idx);
                break;
            }
        }
    }

    if ep.shm.is_some() {
        let want = ep.cfg.rx_posted_target.saturating_sub(ep.rx_posted_shm);
        let n = want.min(ep.rx_pool.available());
        for _ in 0..n {
            let Ok(pkt_idx) = ep.rx_pool.alloc() else { break };
            let (seg, _) = ep.rx_pool.get(pkt_idx).recv_seg();
            let wr_id = wrid::pack(wrid::KIND_RX_PKT, pkt_idx);
            let shm = ep.shm.as_mut().expect("checked above");
            match shm.post_recv(seg, wr_id) {
                Ok(()) => {
                    ep.rx_pool.get_mut(pkt_idx).via_shm = true;
                    ep.rx_posted_shm += 1;
                }
                Err(_) => {
                    ep.rx_pool.release(pkt_idx);
                    break;
                }
            }
        }
    }
}

// =============================================================================
// STEP 4: BACKOFF EXPIRY
// =============================================================================

fn sweep_backoff(ep: &mut Endpoint) {
    if ep.backoff_peers.is_empty() {
        return;
    }
    let now = Instant::now();
    let mut still_waiting = Vec::new();
    for peer_addr in std::mem::take(&mut ep.backoff_peers) {
        let Some(peer) = ep.av.peer_mut(peer_addr) else {
            continue;
        };
        if peer.backoff_expired(now) {
            peer.clear_backoff();
            trace!(peer = peer_addr, "backoff cleared");
        } else {
            still_waiting.push(peer_addr);
        }
    }
    ep.backoff_peers = still_waiting;
}

// =============================================================================
// STEP 5: PEER-OWNED CONTROL RETRANSMITS (incl. HANDSHAKE)
// =============================================================================

fn drive_peer_ctrl(ep: &mut Endpoint) {
    for peer_addr in ep.av.peer_addrs() {
        // Handshake re-encode.
        if ep.av.peer(peer_addr).is_some_and(|p| p.handshake_pending) {
            match proto::handshake::post_handshake(ep, peer_addr) {
                Ok(()) => {
                    ep.av.peer_mut(peer_addr).expect("live peer").handshake_pending = false;
                }
                Err(RdmError::Again) | Err(RdmError::NoMemory) => {}
                Err(_) => {
                    // Non-fatal by design; stop retrying.
                    ep.av.peer_mut(peer_addr).expect("live peer").handshake_pending = false;
                }
            }
        }

        // RNR'd control packets.
        loop {
            let Some(peer) = ep.av.peer_mut(peer_addr) else { break };
            let Some(pkt_idx) = peer.queued_ctrl.pop() else { break };
            match ep.post_pkt(pkt_idx) {
                Ok(()) => {
                    ep.tx_pool.get_mut(pkt_idx).state = PktState::InUse;
                    ep.av.peer_mut(peer_addr).expect("live peer").outstanding_pkts += 1;
                }
                Err(RdmError::Again) => {
                    ep.av.peer_mut(peer_addr).expect("live peer").queued_ctrl.push(pkt_idx);
                    break;
                }
                Err(_) => {
                    ep.tx_pool.release(pkt_idx);
                }
            }
        }
    }
}

// =============================================================================
// STEP 6/7: ENTRY-QUEUED PACKETS
// =============================================================================

fn drive_queued_rx(ep: &mut Endpoint) {
    for rx_id in std::mem::take(&mut ep.queued_rx) {
        if ep.rx_entries.get(rx_id).is_none() {
            continue;
        }

        // Re-issue control packets that never got a buffer.
        let pending = std::mem::take(
            &mut ep.rx_entries.get_mut(rx_id).expect("live rx entry").pending_ctrl,
        );
        for typ in pending {
            if ep.rx_entries.get(rx_id).is_none() {
                break;
            }
            match typ {
                pkt_type::CTS => proto::longcts::send_cts(ep, rx_id),
                pkt_type::EOR => proto::longread::post_eor(ep, rx_id),
                pkt_type::RECEIPT => proto::receipt::post_receipt(ep, rx_id),
                _ => unreachable!("unexpected pending ctrl type"),
            }
        }
        if ep.rx_entries.get(rx_id).is_none() {
            continue;
        }

        // Encoded-but-unsent control packets: send in order, stop on EAGAIN.
        loop {
            let Some(rx) = ep.rx_entries.get_mut(rx_id) else { break };
            if rx.queued_pkts.is_empty() {
                break;
            }
            let pkt_idx = rx.queued_pkts.remove(0);
            match ep.post_pkt(pkt_idx) {
                Ok(()) => {
                    let pkt = ep.tx_pool.get_mut(pkt_idx);
                    pkt.state = PktState::InUse;
                    pkt.owner = PktOwner::None;
                    let peer = pkt.peer;
                    if let Some(peer) = ep.av.peer_mut(peer) {
                        peer.outstanding_pkts += 1;
                    }
                }
                Err(RdmError::Again) => {
                    ep.rx_entries.get_mut(rx_id).expect("live rx entry").queued_pkts.insert(0, pkt_idx);
                    break;
                }
                Err(_) => {
                    ep.tx_pool.release(pkt_idx);
                    ep.fail_rx(rx_id, RdmError::Io);
                    break;
                }
            }
        }

        let Some(rx) = ep.rx_entries.get_mut(rx_id) else { continue };
        if rx.queued_pkts.is_empty() && rx.pending_ctrl.is_empty() {
            if rx.state == RxState::QueuedCtrl {
                rx.state = RxState::Recv;
            }
            if rx.pending_completion {
                ep.complete_rx(rx_id);
            }
        } else if !ep.queued_rx.contains(&rx_id) {
            ep.queued_rx.push(rx_id);
        }
    }
}

fn drive_queued_tx(ep: &mut Endpoint) {
    for tx_id in std::mem::take(&mut ep.queued_tx) {
        loop {
            let Some(tx) = ep.tx_entries.get_mut(tx_id) else { break };
            if tx.queued_pkts.is_empty() {
                if tx.state == TxState::QueuedCtrl
                    || tx.state == TxState::QueuedReqRnr
                    || tx.state == TxState::QueuedDataRnr
                {
                    tx.state = TxState::Send;
                }
                break;
            }
            let pkt_idx = tx.queued_pkts.remove(0);
            match ep.post_pkt(pkt_idx) {
                Ok(()) => {
                    ep.tx_pool.get_mut(pkt_idx).state = PktState::InUse;
                    ep.tx_entries.get_mut(tx_id).expect("live tx entry").pkts_in_flight += 1;
                }
                Err(RdmError::Again) => {
                    let tx = ep.tx_entries.get_mut(tx_id).expect("live tx entry");
                    tx.queued_pkts.insert(0, pkt_idx);
                    if !ep.queued_tx.contains(&tx_id) {
                        ep.queued_tx.push(tx_id);
                    }
                    break;
                }
                Err(_) => {
                    ep.tx_pool.release(pkt_idx);
                    ep.fail_tx(tx_id, RdmError::Io);
                    break;
                }
            }
        }
    }
}

// =============================================================================
// STEP 8: WINDOWED DATA
// =============================================================================

fn drive_tx_pending(ep: &mut Endpoint) {
    for tx_id in std::mem::take(&mut ep.tx_pending_list) {
        if ep.tx_entries.get(tx_id).is_none() {
            continue;
        }
        if proto::longcts::send_data_pkts(ep, tx_id) && !ep.tx_pending_list.contains(&tx_id) {
            ep.tx_pending_list.push(tx_id);
        }
    }
}

// =============================================================================
// STEP 9: RDMA READS
// =============================================================================

fn drive_reads(ep: &mut Endpoint) {
    for read_id in std::mem::take(&mut ep.read_pending_list) {
        let mut keep = false;
        loop {
            if ep.outstanding_tx >= ep.transport.max_outstanding_tx() {
                keep = ep.read_entries.get(read_id).is_some();
                break;
            }
            let Some(read) = ep.read_entries.get(read_id) else { break };
            let Some((seg, lkey, raddr, rkey)) = read.next_chunk() else { break };
            let wr_id = wrid::pack(wrid::KIND_READ, read_id);
            match ep.transport.post_read(seg, lkey, raddr, rkey, wr_id) {
                Ok(()) => {
                    ep.outstanding_tx += 1;
                    ep.read_entries.get_mut(read_id).expect("live read entry").commit_chunk(seg.len);
                }
                Err(RdmError::Again) => {
                    keep = true;
                    break;
                }
                Err(_) => {
                    let owner = ep.read_entries.get(read_id).expect("live read entry").owner;
                    match owner {
                        ReadOwner::Tx(tx_id) => ep.fail_tx(tx_id, RdmError::Io),
                        ReadOwner::Rx(rx_id) => ep.fail_rx(rx_id, RdmError::Io),
                    }
                    break;
                }
            }
        }
        if keep && !ep.read_pending_list.contains(&read_id) {
            ep.read_pending_list.push(read_id);
        }
    }
}
