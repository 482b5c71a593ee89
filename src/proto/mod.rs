//! Sub-protocol drivers: one module per packet family, plus the receive
//! dispatch that routes every ingress packet to its handler.
//!
//! The send side picks a family from payload size and the peer's feature
//! bitmap; the receive side enforces per-peer message ordering through the
//! reorder window before a REQ reaches its family handler.

pub mod atomic;
pub mod eager;
pub mod handshake;
pub mod longcts;
pub mod longread;
pub mod medium;
pub mod receipt;
pub mod rma;

use crate::addr::FiAddr;
use crate::entry::{RxEntry, RxState, TxProto, iov_total};
use crate::ep::Endpoint;
use crate::error::RdmResult;
use crate::peer::ReorderVerdict;
use crate::wire::req::{ReqHdr, ReqView, decode_req};
use crate::wire::{ctrl, is_req, is_tagged_req};
use tracing::{debug, trace};

/// Which pool a received packet currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoolKind {
    Rx,
    Unexp,
}

pub(crate) fn pkt_bytes<'a>(ep: &'a Endpoint, pool: PoolKind, idx: usize) -> &'a [u8] {
    match pool {
        PoolKind::Rx => ep.rx_pool.get(idx).buf(),
        PoolKind::Unexp => ep.unexp_pool.get(idx).buf(),
    }
}

// =============================================================================
// SEND-SIDE FAMILY SELECTION
// =============================================================================

/// Pick the packet family for a two-sided send and kick it off.
pub(crate) fn start_msg_send(ep: &mut Endpoint, tx_id: usize) -> RdmResult<()> {
    let tx = ep.tx_entries.get(tx_id).expect("live tx entry");
    let peer = ep.av.peer(tx.peer).expect("send validated peer");

    let max_eager = eager::max_payload(ep, tx.peer, tx.tagged(), tx.dc, tx.cq_data.is_some());
    let len = tx.total_len;

    let proto = if len <= max_eager {
        TxProto::Eager
    } else if len <= ep.cfg.medium_threshold {
        TxProto::Medium
    } else if len >= ep.cfg.longread_threshold
        && peer.supports_rdma_read()
        && ep.transport.supports_rdma_read()
    {
        TxProto::LongRead
    } else {
        TxProto::LongCts
    };

    let msg_id = ep.av.peer_mut(tx.peer).expect("send validated peer").next_msg_id();
    let tx = ep.tx_entries.get_mut(tx_id).expect("live tx entry");
    tx.msg_id = msg_id;
    tx.proto = proto;
    trace!(tx = tx_id, ?proto, len, msg_id, "send dispatch");

    match proto {
        TxProto::Eager => eager::start(ep, tx_id),
        TxProto::Medium => medium::start(ep, tx_id),
        TxProto::LongCts => longcts::start(ep, tx_id),
        TxProto::LongRead => longread::start(ep, tx_id),
        _ => unreachable!("message sends only"),
    }
}

// =============================================================================
// INGRESS DISPATCH
// =============================================================================

pub(crate) enum Ingress {
    Wire { ahn: u16, qpn: u16 },
    Shm { src_addr: u64 },
}

/// Route one received packet. The packet stays in the rx pool; the caller
/// releases and reposts it afterwards.
pub(crate) fn dispatch_ingress(ep: &mut Endpoint, pkt_idx: usize, source: Ingress) {
    let bytes = ep.rx_pool.get(pkt_idx).buf();
    let Some(&typ) = bytes.first() else {
        ep.note_proto_error("empty packet", crate::addr::FI_ADDR_UNSPEC);
        return;
    };

    if is_req(typ) {
        let view = match decode_req(bytes) {
            Ok(view) => view,
            Err(_) => {
                ep.note_proto_error("malformed REQ", crate::addr::FI_ADDR_UNSPEC);
                return;
            }
        };
        dispatch_req(ep, pkt_idx, source, view);
    } else {
        let (view, payload_off) = match ctrl::decode_ctrl(bytes) {
            Ok(v) => v,
            Err(_) => {
                ep.note_proto_error("malformed control packet", crate::addr::FI_ADDR_UNSPEC);
                return;
            }
        };
        dispatch_ctrl(ep, pkt_idx, source, view, payload_off);
    }
}

fn resolve_source(ep: &Endpoint, source: &Ingress) -> Option<FiAddr> {
    match source {
        Ingress::Wire { ahn, qpn } => ep.av.reverse_lookup(*ahn, *qpn),
        Ingress::Shm { src_addr } => ep.av.shm_lookup(*src_addr),
    }
}

fn dispatch_req(ep: &mut Endpoint, pkt_idx: usize, source: Ingress, view: ReqView) {
    // Resolve the sender, inserting it from the raw-address header when this
    // is the first packet we see from it. A raw address carrying a fresh
    // connid on a known (AHN, QPN) is a recreated QP: re-inserting evicts
    // the stale peer.
    let peer_addr = match resolve_source(ep, &source) {
        Some(fi) => match view.opt.raw_addr {
            Some(raw) if ep.av.peer(fi).is_some_and(|p| p.raw.connid != raw.connid) => {
                match ep.av_insert(raw) {
                    Ok(new_fi) => new_fi,
                    Err(_) => {
                        ep.note_proto_error("stale peer re-insert failed", fi);
                        return;
                    }
                }
            }
            _ => fi,
        },
        None => match view.opt.raw_addr {
            Some(raw) => match ep.av_insert(raw) {
                Ok(fi) => fi,
                Err(err) => {
                    ep.note_proto_error("implicit AV insert failed", crate::addr::FI_ADDR_UNSPEC);
                    debug!(%err, "dropping REQ from uninsertable peer");
                    return;
                }
            },
            None => {
                ep.note_proto_error("REQ from unknown peer without raw address", crate::addr::FI_ADDR_UNSPEC);
                return;
            }
        },
    };

    {
        let peer = ep.av.peer_mut(peer_addr).expect("resolved peer");
        peer.on_pkt_recv(ep.rx_pool.get(pkt_idx).len);
        // A packet from a destroyed predecessor QP carries the old connid.
        let wire_connid = view.opt.connid.or(view.opt.raw_addr.map(|r| r.connid));
        if !peer.connid_matches(wire_connid) {
            return;
        }
    }
    ep.rx_pool.get_mut(pkt_idx).peer = peer_addr;

    // First contact triggers our half of the handshake.
    handshake::ensure_handshake(ep, peer_addr);

    match &view.hdr {
        ReqHdr::EagerRtm(_) | ReqHdr::MediumRtm(_) | ReqHdr::LongCtsRtm(_)
        | ReqHdr::LongReadRtm(_) => process_rtm(ep, peer_addr, pkt_idx, PoolKind::Rx, view),
        ReqHdr::EagerRtw(_) | ReqHdr::LongCtsRtw(_) | ReqHdr::LongReadRtw(_) => {
            rma::handle_rtw(ep, peer_addr, pkt_idx, view)
        }
        ReqHdr::Rtr(_) => rma::handle_rtr(ep, peer_addr, pkt_idx, view),
        ReqHdr::Rta(_) => atomic::handle_rta(ep, peer_addr, pkt_idx, view),
    }
}

fn dispatch_ctrl(
    ep: &mut Endpoint,
    pkt_idx: usize,
    source: Ingress,
    view: ctrl::CtrlView,
    payload_off: usize,
) {
    let Some(peer_addr) = resolve_source(ep, &source) else {
        // Control packets never carry a raw address; without a peer record
        // there is nothing to correlate them with.
        ep.note_proto_error("control packet from unknown peer", crate::addr::FI_ADDR_UNSPEC);
        return;
    };
    {
        let peer = ep.av.peer_mut(peer_addr).expect("resolved peer");
        peer.on_pkt_recv(ep.rx_pool.get(pkt_idx).len);
        if !peer.connid_matches(view.connid()) {
            return;
        }
    }
    ep.rx_pool.get_mut(pkt_idx).peer = peer_addr;

    // Any first contact obliges us to advertise our features, including a
    // handshake itself (the peer that spoke first has never seen ours).
    handshake::ensure_handshake(ep, peer_addr);

    match view {
        ctrl::CtrlView::Handshake(hdr) => handshake::handle_handshake(ep, peer_addr, hdr),
        ctrl::CtrlView::Cts(hdr) => longcts::handle_cts(ep, peer_addr, hdr),
        ctrl::CtrlView::Data(hdr) => longcts::handle_data(ep, peer_addr, pkt_idx, payload_off, hdr),
        ctrl::CtrlView::ReadRsp(hdr) => rma::handle_readrsp(ep, peer_addr, pkt_idx, payload_off, hdr),
        ctrl::CtrlView::AtomRsp(hdr) => atomic::handle_atomrsp(ep, peer_addr, pkt_idx, payload_off, hdr),
        ctrl::CtrlView::Eor(hdr) => longread::handle_eor(ep, peer_addr, hdr),
        ctrl::CtrlView::Receipt(hdr) => receipt::handle_receipt(ep, peer_addr, hdr),
    }
}

// =============================================================================
// RTM ORDERING AND MATCHING
// =============================================================================

pub(crate) fn rtm_msg_id(hdr: &ReqHdr) -> u32 {
    match hdr {
        ReqHdr::EagerRtm(h) => h.msg_id,
        ReqHdr::MediumRtm(h) => h.msg_id,
        ReqHdr::LongCtsRtm(h) => h.msg_id,
        ReqHdr::LongReadRtm(h) => h.msg_id,
        _ => unreachable!("not an RTM"),
    }
}

pub(crate) fn rtm_tag(hdr: &ReqHdr) -> Option<u64> {
    match hdr {
        ReqHdr::EagerRtm(h) => h.tag,
        ReqHdr::MediumRtm(h) => h.tag,
        ReqHdr::LongCtsRtm(h) => h.tag,
        ReqHdr::LongReadRtm(h) => h.tag,
        _ => None,
    }
}

/// Total message length announced by an RTM. Eager derives it from the
/// packet size.
fn rtm_total_len(view: &ReqView, pkt_len: usize) -> usize {
    match &view.hdr {
        ReqHdr::EagerRtm(_) => pkt_len - view.payload_off,
        ReqHdr::MediumRtm(h) => h.seg_length as usize,
        ReqHdr::LongCtsRtm(h) => h.msg_length as usize,
        ReqHdr::LongReadRtm(h) => h.msg_length as usize,
        _ => unreachable!("not an RTM"),
    }
}

/// Run a message RTM through the per-peer reorder window, then deliver it
/// and any queued successors that became in-order.
fn process_rtm(ep: &mut Endpoint, peer: FiAddr, pkt_idx: usize, pool: PoolKind, view: ReqView) {
    let msg_id = rtm_msg_id(&view.hdr);

    // Continuation segment of a message already being assembled: ordering
    // was already established by its first packet.
    if let Some(&rx_id) = ep.pkt_rx_map.get(&(peer, msg_id)) {
        deliver_continuation(ep, rx_id, pkt_idx, pool, view);
        return;
    }

    let verdict = ep.av.peer(peer).expect("resolved peer").reorder.check(msg_id);
    match verdict {
        ReorderVerdict::InOrder => {
            deliver_new_rtm(ep, peer, pkt_idx, pool, view);
            ep.av.peer_mut(peer).expect("resolved peer").reorder.advance();
            drain_reorder_queue(ep, peer);
        }
        ReorderVerdict::Queue => {
            let clone_idx = match pool {
                PoolKind::Rx => match ep.clone_rx_pkt(pkt_idx) {
                    Ok(idx) => idx,
                    Err(_) => {
                        ep.note_proto_error("reorder pool exhausted", peer);
                        return;
                    }
                },
                PoolKind::Unexp => pkt_idx,
            };
            ep.av.peer_mut(peer).expect("resolved peer").reorder.insert(msg_id, clone_idx);
            trace!(peer, msg_id, "queued out-of-order RTM");
        }
        ReorderVerdict::Duplicate => {
            trace!(peer, msg_id, "dropping duplicate RTM");
            if pool == PoolKind::Unexp {
                ep.unexp_pool.release(pkt_idx);
            }
        }
        ReorderVerdict::OutOfWindow => {
            // Beyond the reorder window: protocol error, drop and continue.
            ep.note_proto_error("msg id beyond reorder window", peer);
            if pool == PoolKind::Unexp {
                ep.unexp_pool.release(pkt_idx);
            }
        }
    }
}

/// After the expected id advanced, feed any queued packets that are now in
/// order. Queued packets live in the unexpected pool; a queued medium
/// message may have several of them.
fn drain_reorder_queue(ep: &mut Endpoint, peer: FiAddr) {
    loop {
        let Some(pkts) = ep.av.peer_mut(peer).expect("resolved peer").reorder.pop_expected()
        else {
            return;
        };
        for pkt in pkts {
            let view = match decode_req(ep.unexp_pool.get(pkt).buf()) {
                Ok(view) => view,
                Err(_) => {
                    ep.note_proto_error("malformed queued RTM", peer);
                    ep.unexp_pool.release(pkt);
                    continue;
                }
            };
            let msg_id = rtm_msg_id(&view.hdr);
            // Later segments of the message route through the map the first
            // one registered.
            if let Some(&rx_id) = ep.pkt_rx_map.get(&(peer, msg_id)) {
                deliver_continuation(ep, rx_id, pkt, PoolKind::Unexp, view);
            } else {
                deliver_new_rtm(ep, peer, pkt, PoolKind::Unexp, view);
            }
        }
        ep.av.peer_mut(peer).expect("resolved peer").reorder.advance();
    }
}

/// Deliver the first packet of a new in-order message: match it against the
/// posted receives or park it as unexpected.
fn deliver_new_rtm(ep: &mut Endpoint, peer: FiAddr, pkt_idx: usize, pool: PoolKind, view: ReqView) {
    let tagged = is_tagged_req(view.base.typ);
    let tag = rtm_tag(&view.hdr).unwrap_or(0);
    let pkt_len = match pool {
        PoolKind::Rx => ep.rx_pool.get(pkt_idx).len,
        PoolKind::Unexp => ep.unexp_pool.get(pkt_idx).len,
    };
    let total_len = rtm_total_len(&view, pkt_len);

    match match_posted(ep, peer, tagged, tag, total_len) {
        Some(rx_id) => {
            bind_rtm(ep, rx_id, peer, &view, total_len);
            deliver_first(ep, rx_id, pkt_idx, pool, view);
            if pool == PoolKind::Unexp {
                ep.unexp_pool.release(pkt_idx);
            }
        }
        None => park_unexpected(ep, peer, pkt_idx, pool, view, total_len),
    }
}

/// Find a posted receive for (peer, tag), slicing a multi-recv buffer when
/// that is what matches.
fn match_posted(
    ep: &mut Endpoint,
    peer: FiAddr,
    tagged: bool,
    tag: u64,
    total_len: usize,
) -> Option<usize> {
    let queue = if tagged { &ep.posted_trecvs } else { &ep.posted_recvs };
    let mut found = None;
    for &rx_id in queue {
        let rx = ep.rx_entries.get(rx_id).expect("posted list holds live entries");
        if rx.is_multi_recv {
            if rx.capacity - rx.consumed >= ep.cfg.min_multi_recv.max(1) {
                found = Some((rx_id, true));
                break;
            }
        } else if rx.matches(peer, tagged, tag) {
            found = Some((rx_id, false));
            break;
        }
    }
    let (rx_id, multi) = found?;
    if !multi {
        ep.posted_recvs.retain(|id| *id != rx_id);
        ep.posted_trecvs.retain(|id| *id != rx_id);
        return Some(rx_id);
    }
    Some(carve_multi_recv(ep, rx_id, total_len))
}

/// Slice the next message's bytes out of a multi-recv buffer, producing a
/// child entry that completes independently.
fn carve_multi_recv(ep: &mut Endpoint, parent_id: usize, total_len: usize) -> usize {
    let parent = ep.rx_entries.get_mut(parent_id).expect("live multi-recv parent");
    let offset = parent.consumed;
    let avail = parent.capacity - offset;
    let take = total_len.min(avail);
    parent.consumed += take;
    parent.active_children += 1;
    let seg = parent.iov[0];
    let desc = parent.desc.clone();
    let context = parent.context;
    let child_iov = vec![crate::transport::MemSeg::new(seg.addr + offset as u64, take)];

    let child_id = ep.rx_entries.insert_with(|id| {
        let mut child = RxEntry::new(id, crate::addr::FI_ADDR_UNSPEC, false, 0, 0, child_iov, desc, context);
        child.multi_parent = Some(parent_id);
        child
    });
    trace!(parent = parent_id, child = child_id, take, "sliced multi-recv buffer");
    child_id
}

/// Attach message metadata from the RTM to a matched rx entry.
fn bind_rtm(ep: &mut Endpoint, rx_id: usize, peer: FiAddr, view: &ReqView, total_len: usize) {
    let msg_id = rtm_msg_id(&view.hdr);
    let rx = ep.rx_entries.get_mut(rx_id).expect("live rx entry");
    rx.peer = Some(peer);
    rx.msg_id = Some(msg_id);
    rx.msg_length = total_len;
    rx.peer_send_id = match &view.hdr {
        ReqHdr::EagerRtm(h) => h.send_id,
        ReqHdr::MediumRtm(h) => h.send_id,
        ReqHdr::LongCtsRtm(h) => Some(h.send_id),
        ReqHdr::LongReadRtm(h) => Some(h.send_id),
        _ => None,
    };
    rx.rtm_typ = view.base.typ;
    rx.dc = crate::wire::is_dc(view.base.typ);
    rx.cq_data = view.opt.cq_data;
    if rx.tag == 0 && rx.tagged {
        rx.tag = rtm_tag(&view.hdr).unwrap_or(0);
    }
    rx.state = RxState::Matched;
    ep.av.peer_mut(peer).expect("resolved peer").track_rx(rx_id);
}

/// First-packet delivery, by family.
fn deliver_first(ep: &mut Endpoint, rx_id: usize, pkt_idx: usize, pool: PoolKind, view: ReqView) {
    match &view.hdr {
        ReqHdr::EagerRtm(_) => eager::deliver(ep, rx_id, pkt_idx, pool, &view),
        ReqHdr::MediumRtm(_) => medium::deliver_seg(ep, rx_id, pkt_idx, pool, &view),
        ReqHdr::LongCtsRtm(_) => longcts::deliver_start(ep, rx_id, pkt_idx, pool, &view),
        ReqHdr::LongReadRtm(_) => longread::deliver_start(ep, rx_id, &view),
        _ => unreachable!("not an RTM"),
    }
}

/// Continuation delivery (medium segments; also RTM packets arriving while
/// the entry is still unexpected).
fn deliver_continuation(ep: &mut Endpoint, rx_id: usize, pkt_idx: usize, pool: PoolKind, view: ReqView) {
    let state = ep.rx_entries.get(rx_id).expect("pkt_rx_map holds live entries").state;
    if state == RxState::Unexp {
        // Still unmatched: park alongside the first packet.
        let clone_idx = match pool {
            PoolKind::Rx => match ep.clone_rx_pkt(pkt_idx) {
                Ok(idx) => idx,
                Err(_) => {
                    let peer = ep.rx_entries.get(rx_id).and_then(|rx| rx.peer).unwrap_or_default();
                    ep.note_proto_error("unexpected pool exhausted", peer);
                    return;
                }
            },
            PoolKind::Unexp => pkt_idx,
        };
        ep.rx_entries.get_mut(rx_id).expect("live rx entry").held_pkts.push(clone_idx);
        return;
    }
    match &view.hdr {
        ReqHdr::MediumRtm(_) => {
            medium::deliver_seg(ep, rx_id, pkt_idx, pool, &view);
            if pool == PoolKind::Unexp {
                ep.unexp_pool.release(pkt_idx);
            }
        }
        _ => {
            let peer = ep.rx_entries.get(rx_id).and_then(|rx| rx.peer).unwrap_or_default();
            ep.note_proto_error("duplicate RTM for active message", peer);
            if pool == PoolKind::Unexp {
                ep.unexp_pool.release(pkt_idx);
            }
        }
    }
}

/// No posted receive matched: clone the packet and park the message on the
/// unexpected queue.
fn park_unexpected(
    ep: &mut Endpoint,
    peer: FiAddr,
    pkt_idx: usize,
    pool: PoolKind,
    view: ReqView,
    total_len: usize,
) {
    let clone_idx = match pool {
        PoolKind::Rx => match ep.clone_rx_pkt(pkt_idx) {
            Ok(idx) => idx,
            Err(_) => {
                ep.note_proto_error("unexpected pool exhausted", peer);
                return;
            }
        },
        PoolKind::Unexp => pkt_idx,
    };

    let tagged = is_tagged_req(view.base.typ);
    let msg_id = rtm_msg_id(&view.hdr);
    let rx_id = ep.rx_entries.insert_with(|id| {
        let mut rx = RxEntry::new(
            id,
            peer,
            tagged,
            rtm_tag(&view.hdr).unwrap_or(0),
            0,
            Vec::new(),
            Vec::new(),
            0,
        );
        rx.state = RxState::Unexp;
        rx.peer = Some(peer);
        rx.msg_id = Some(msg_id);
        rx.msg_length = total_len;
        rx.rtm_typ = view.base.typ;
        rx.dc = crate::wire::is_dc(view.base.typ);
        rx.cq_data = view.opt.cq_data;
        rx.held_pkts.push(clone_idx);
        rx
    });
    ep.pkt_rx_map.insert((peer, msg_id), rx_id);
    ep.av.peer_mut(peer).expect("resolved peer").track_rx(rx_id);
    if tagged {
        ep.unexp_tagged.push_back(rx_id);
    } else {
        ep.unexp_msgs.push_back(rx_id);
    }
    ep.stats.unexpected_msgs += 1;
    debug!(peer, msg_id, tagged, total_len, "unexpected message parked");
}

/// Match a freshly-posted receive against the unexpected queues. Returns
/// true when the posted entry was consumed by an unexpected message.
pub(crate) fn match_unexpected(ep: &mut Endpoint, posted_id: usize) -> RdmResult<bool> {
    let posted = ep.rx_entries.get(posted_id).expect("caller inserted entry");
    let tagged = posted.tagged;

    if posted.is_multi_recv {
        // Drain every matching unexpected untagged message into the buffer.
        loop {
            let Some(unexp_id) = next_unexp_match(ep, posted_id, false) else {
                break;
            };
            let total_len = ep.rx_entries.get(unexp_id).expect("live unexp entry").msg_length;
            let parent = ep.rx_entries.get(posted_id);
            let Some(parent) = parent else { break };
            if parent.capacity - parent.consumed < ep.cfg.min_multi_recv.max(1) {
                break;
            }
            let child_id = carve_multi_recv(ep, posted_id, total_len);
            transplant(ep, unexp_id, child_id);
            deliver_held(ep, unexp_id);
        }
        // The buffer itself stays posted.
        return Ok(false);
    }

    let Some(unexp_id) = next_unexp_match(ep, posted_id, tagged) else {
        return Ok(false);
    };
    transplant(ep, unexp_id, posted_id);
    deliver_held(ep, unexp_id);
    Ok(true)
}

fn next_unexp_match(ep: &Endpoint, posted_id: usize, tagged: bool) -> Option<usize> {
    let posted = ep.rx_entries.get(posted_id)?;
    let list = if tagged { &ep.unexp_tagged } else { &ep.unexp_msgs };
    list.iter()
        .copied()
        .find(|&unexp_id| {
            let unexp = ep.rx_entries.get(unexp_id).expect("unexp list holds live entries");
            let peer = unexp.peer.expect("unexp entries are bound to a peer");
            posted.matches(peer, unexp.tagged, unexp.tag) || posted.is_multi_recv
        })
}

/// Move the application buffer and context from the posted entry into the
/// unexpected entry, which then completes in its place.
fn transplant(ep: &mut Endpoint, unexp_id: usize, posted_id: usize) {
    let posted = ep.rx_entries.remove(posted_id).expect("live posted entry");
    let unexp = ep.rx_entries.get_mut(unexp_id).expect("live unexp entry");
    unexp.iov = posted.iov;
    unexp.desc = posted.desc;
    unexp.capacity = iov_total(&unexp.iov);
    unexp.context = posted.context;
    unexp.ignore = posted.ignore;
    unexp.multi_parent = posted.multi_parent;
    unexp.state = RxState::Matched;
    ep.unexp_msgs.retain(|id| *id != unexp_id);
    ep.unexp_tagged.retain(|id| *id != unexp_id);
    let peer = unexp.peer.expect("unexp entries are bound to a peer");
    trace!(unexp = unexp_id, peer, "unexpected message matched");
}

/// Feed the parked packets of a now-matched unexpected message through the
/// normal delivery path.
fn deliver_held(ep: &mut Endpoint, rx_id: usize) {
    let held = std::mem::take(&mut ep.rx_entries.get_mut(rx_id).expect("live rx entry").held_pkts);
    let mut first = true;
    for pkt in held {
        // The entry may have completed mid-drain (all segments landed).
        if ep.rx_entries.get(rx_id).is_none() {
            ep.unexp_pool.release(pkt);
            continue;
        }
        let view = match decode_req(ep.unexp_pool.get(pkt).buf()) {
            Ok(view) => view,
            Err(_) => {
                ep.unexp_pool.release(pkt);
                continue;
            }
        };
        if first {
            deliver_first(ep, rx_id, pkt, PoolKind::Unexp, view);
            first = false;
        } else if let ReqHdr::MediumRtm(_) = &view.hdr {
            medium::deliver_seg(ep, rx_id, pkt, PoolKind::Unexp, &view);
        }
        ep.unexp_pool.release(pkt);
    }
}

/// All data for `rx_id` has landed: send the delivery receipt when the
/// sender asked for one, then complete — immediately if nothing is queued,
/// otherwise once the progress loop drains the queued control packets.
pub(crate) fn finish_rx(ep: &mut Endpoint, rx_id: usize) {
    let rx = ep.rx_entries.get(rx_id).expect("live rx entry");
    if rx.dc && !rx.canceled {
        receipt::post_receipt(ep, rx_id);
    }
    let Some(rx) = ep.rx_entries.get_mut(rx_id) else {
        // Receipt posting hit a hard error and failed the entry.
        return;
    };
    if rx.queued_pkts.is_empty() && rx.pending_ctrl.is_empty() {
        ep.complete_rx(rx_id);
    } else {
        rx.pending_completion = true;
    }
}

/// The max payload a DATA packet can carry. Control packets always stamp a
/// connid, so both ends derive the same number.
pub(crate) fn max_data_payload(ep: &Endpoint, _peer: FiAddr) -> usize {
    let hdr = ctrl::DataHdr { recv_id: 0, data_length: 0, data_offset: 0, connid: Some(0) };
    ep.transport.mtu() - hdr.wire_len()
}

/// Build the optional-header set for a REQ toward `peer`.
pub(crate) fn req_opt_hdrs(ep: &Endpoint, peer: FiAddr, cq_data: Option<u64>) -> crate::wire::ReqOptHdrs {
    let p = ep.av.peer(peer).expect("live peer");
    crate::wire::ReqOptHdrs {
        raw_addr: if p.needs_raw_addr_hdr() { Some(ep.raw) } else { None },
        cq_data,
        connid: if p.wants_connid_hdr() { Some(ep.raw.connid) } else { None },
    }
}

/// Connid stamp for control packets: always included so a recreated QP can
/// never confuse its predecessor's traffic with ours.
pub(crate) fn ctrl_connid(ep: &Endpoint) -> Option<u32> {
    Some(ep.raw.connid)
}
