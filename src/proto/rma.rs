//! Emulated one-sided operations: write via RTW, read via RTR/READRSP, and
//! the direct-read fast path.
//!
//! One-sided traffic has no tag matching and no per-message ordering; the
//! responder validates every remote key against its registrations before
//! touching memory.

use super::PoolKind;
use crate::addr::FiAddr;
use crate::entry::{ReadEntry, ReadOwner, RxEntry, TxOp, TxProto, TxState};
use crate::entry::{copy_from_iov, copy_to_iov};
use crate::ep::Endpoint;
use crate::error::{RdmError, RdmResult};
use crate::transport::{MemSeg, access};
use crate::wire::ctrl::RspHdr;
use crate::wire::pkt_type;
use crate::wire::req::{
    EagerRtwHdr, LongCtsRtwHdr, LongReadRtwHdr, ReqHdr, ReqView, RtrHdr, encode_req, req_hdr_len,
};
use crate::wire::RmaIov;
use tracing::trace;

fn rma_total(iov: &[RmaIov]) -> u64 {
    iov.iter().map(|e| e.len).sum()
}

fn rma_segs(iov: &[RmaIov]) -> Vec<MemSeg> {
    iov.iter().map(|e| MemSeg::new(e.addr, e.len as usize)).collect()
}

/// Validate every region a peer asked us to touch.
fn check_rma_iov(ep: &Endpoint, iov: &[RmaIov], write: bool) -> bool {
    iov.iter().all(|e| ep.registrar.check(e.key, e.addr, e.len as usize, write))
}

// =============================================================================
// WRITE (REQUESTER)
// =============================================================================

pub(crate) fn start_write(ep: &mut Endpoint, tx_id: usize) -> RdmResult<()> {
    let tx = ep.tx_entries.get(tx_id).expect("live tx entry");
    let (peer, dc, total) = (tx.peer, tx.dc, tx.total_len);
    let peer_ref = ep.av.peer(peer).expect("send validated peer");

    let opt = super::req_opt_hdrs(ep, peer, tx.cq_data);
    let eager_probe = ReqHdr::EagerRtw(EagerRtwHdr {
        send_id: dc.then_some(0),
        rma_iov: tx.rma_iov.clone(),
    });
    let eager_typ = if dc { pkt_type::DC_EAGER_RTW } else { pkt_type::EAGER_RTW };
    let max_eager = ep.transport.mtu().saturating_sub(req_hdr_len(eager_typ, &eager_probe, &opt));

    let proto = if total <= max_eager {
        TxProto::Eager
    } else if !dc
        && total >= ep.cfg.longread_threshold
        && peer_ref.supports_rdma_read()
        && ep.transport.supports_rdma_read()
    {
        TxProto::LongRead
    } else {
        TxProto::LongCts
    };
    ep.tx_entries.get_mut(tx_id).expect("live tx entry").proto = proto;

    match proto {
        TxProto::Eager => start_eager_rtw(ep, tx_id, eager_typ),
        TxProto::LongCts => start_longcts_rtw(ep, tx_id),
        TxProto::LongRead => start_longread_rtw(ep, tx_id),
        _ => unreachable!("write families"),
    }
}

fn start_eager_rtw(ep: &mut Endpoint, tx_id: usize, typ: u8) -> RdmResult<()> {
    let tx = ep.tx_entries.get(tx_id).expect("live tx entry");
    let (peer, dc, total) = (tx.peer, tx.dc, tx.total_len);
    let hdr = ReqHdr::EagerRtw(EagerRtwHdr {
        send_id: dc.then_some(tx_id as u32),
        rma_iov: tx.rma_iov.clone(),
    });
    let opt = super::req_opt_hdrs(ep, peer, tx.cq_data);

    let pkt_idx = ep.tx_pool.alloc()?;
    let encode_res = {
        let tx = ep.tx_entries.get(tx_id).expect("live tx entry");
        let pkt = ep.tx_pool.get_mut(pkt_idx);
        encode_req(typ, &hdr, &opt, pkt.buf_mut()).and_then(|hlen| {
            copy_from_iov(&ep.hmem, &tx.iov, &tx.desc, 0, &mut pkt.buf_mut()[hlen..hlen + total])
                .map(|_| hlen)
        })
    };
    let hdr_len = match encode_res {
        Ok(len) => len,
        Err(err) => {
            ep.tx_pool.release(pkt_idx);
            return Err(err);
        }
    };
    {
        let pkt = ep.tx_pool.get_mut(pkt_idx);
        pkt.len = hdr_len + total;
        pkt.typ = typ;
        pkt.peer = peer;
        pkt.payload_len = total;
    }
    let tx = ep.tx_entries.get_mut(tx_id).expect("live tx entry");
    tx.state = TxState::Send;
    tx.mark_sent(total);
    ep.post_or_queue_tx(tx_id, pkt_idx);
    Ok(())
}

fn start_longcts_rtw(ep: &mut Endpoint, tx_id: usize) -> RdmResult<()> {
    let tx = ep.tx_entries.get(tx_id).expect("live tx entry");
    let (peer, dc, total) = (tx.peer, tx.dc, tx.total_len);
    let typ = if dc { pkt_type::DC_LONGCTS_RTW } else { pkt_type::LONGCTS_RTW };
    let credit_request = ep.cfg.tx_credits;
    let hdr = ReqHdr::LongCtsRtw(LongCtsRtwHdr {
        msg_length: total as u64,
        send_id: tx_id as u32,
        credit_request,
        rma_iov: tx.rma_iov.clone(),
    });
    let opt = super::req_opt_hdrs(ep, peer, tx.cq_data);

    let pkt_idx = ep.tx_pool.alloc()?;
    let encode_res = {
        let tx = ep.tx_entries.get(tx_id).expect("live tx entry");
        let pkt = ep.tx_pool.get_mut(pkt_idx);
        encode_req(typ, &hdr, &opt, pkt.buf_mut()).and_then(|hlen| {
            let chunk = (pkt.capacity() - hlen).min(total);
            copy_from_iov(&ep.hmem, &tx.iov, &tx.desc, 0, &mut pkt.buf_mut()[hlen..hlen + chunk])
                .map(|_| (hlen, chunk))
        })
    };
    let (hdr_len, chunk) = match encode_res {
        Ok(v) => v,
        Err(err) => {
            ep.tx_pool.release(pkt_idx);
            return Err(err);
        }
    };
    {
        let pkt = ep.tx_pool.get_mut(pkt_idx);
        pkt.len = hdr_len + chunk;
        pkt.typ = typ;
        pkt.peer = peer;
        pkt.payload_len = chunk;
    }
    let tx = ep.tx_entries.get_mut(tx_id).expect("live tx entry");
    tx.credit_request = credit_request;
    tx.state = TxState::Send;
    tx.mark_sent(chunk);
    ep.post_or_queue_tx(tx_id, pkt_idx);
    Ok(())
}

fn start_longread_rtw(ep: &mut Endpoint, tx_id: usize) -> RdmResult<()> {
    // Publish the local source regions for the responder to read.
    let read_iov = {
        let tx = ep.tx_entries.get(tx_id).expect("live tx entry");
        let segs: Vec<(MemSeg, Option<u64>)> = tx
            .iov
            .iter()
            .enumerate()
            .map(|(i, seg)| (*seg, tx.desc.get(i).and_then(|d| d.mem).map(|m| m.rkey)))
            .collect();
        let mut out = Vec::with_capacity(segs.len());
        let mut tmp = Vec::new();
        for (seg, rkey) in segs {
            let key = match rkey {
                Some(key) => key,
                None => {
                    let desc =
                        ep.registrar.register(seg, access::LOCAL_READ | access::REMOTE_READ)?;
                    tmp.push(desc.handle);
                    desc.rkey
                }
            };
            out.push(RmaIov { addr: seg.addr, len: seg.len as u64, key });
        }
        ep.tx_entries.get_mut(tx_id).expect("live tx entry").tmp_mr.extend(tmp);
        out
    };

    let tx = ep.tx_entries.get(tx_id).expect("live tx entry");
    let (peer, total) = (tx.peer, tx.total_len);
    let hdr = ReqHdr::LongReadRtw(LongReadRtwHdr {
        msg_length: total as u64,
        send_id: tx_id as u32,
        rma_iov: tx.rma_iov.clone(),
        read_iov,
    });
    let opt = super::req_opt_hdrs(ep, peer, tx.cq_data);

    let pkt_idx = ep.tx_pool.alloc()?;
    let hdr_len = match encode_req(pkt_type::LONGREAD_RTW, &hdr, &opt, ep.tx_pool.get_mut(pkt_idx).buf_mut())
    {
        Ok(len) => len,
        Err(err) => {
            ep.tx_pool.release(pkt_idx);
            return Err(err);
        }
    };
    {
        let pkt = ep.tx_pool.get_mut(pkt_idx);
        pkt.len = hdr_len;
        pkt.typ = pkt_type::LONGREAD_RTW;
        pkt.peer = peer;
        pkt.payload_len = 0;
    }
    let tx = ep.tx_entries.get_mut(tx_id).expect("live tx entry");
    tx.state = TxState::Send;
    tx.mark_sent(total);
    ep.post_or_queue_tx(tx_id, pkt_idx);
    Ok(())
}

// =============================================================================
// WRITE (RESPONDER)
// =============================================================================

pub(crate) fn handle_rtw(ep: &mut Endpoint, peer: FiAddr, pkt_idx: usize, view: ReqView) {
    match &view.hdr {
        ReqHdr::EagerRtw(hdr) => {
            if !check_rma_iov(ep, &hdr.rma_iov, true) {
                ep.note_proto_error("RTW to unregistered memory", peer);
                return;
            }
            let target = rma_segs(&hdr.rma_iov);
            let send_id = hdr.send_id;
            let cq_data = view.opt.cq_data;
            let written;
            {
                let bytes = super::pkt_bytes(ep, PoolKind::Rx, pkt_idx);
                let payload = &bytes[view.payload_off..];
                written = payload.len();
                let _ = copy_to_iov(&ep.hmem, &target, &[], 0, payload);
            }

            let rx_id = ep.rx_entries.insert_with(|id| {
                let mut rx = RxEntry::new_internal(id, peer);
                rx.peer_send_id = send_id;
                rx.dc = send_id.is_some();
                rx.cq_data = cq_data;
                rx.msg_length = written;
                rx.bytes_received = written;
                rx.bytes_copied = written;
                rx
            });
            ep.av.peer_mut(peer).expect("resolved peer").track_rx(rx_id);
            super::finish_rx(ep, rx_id);
        }
        ReqHdr::LongCtsRtw(hdr) => {
            if !check_rma_iov(ep, &hdr.rma_iov, true) {
                ep.note_proto_error("RTW to unregistered memory", peer);
                return;
            }
            let target = rma_segs(&hdr.rma_iov);
            let total = hdr.msg_length as usize;
            let send_id = hdr.send_id;
            let cq_data = view.opt.cq_data;
            let dc = view.base.typ == pkt_type::DC_LONGCTS_RTW;
            if (total as u64) > rma_total(&hdr.rma_iov) {
                ep.note_proto_error("RTW larger than target", peer);
                return;
            }

            let rx_id = ep.rx_entries.insert_with(|id| {
                let mut rx = RxEntry::new_internal(id, peer);
                rx.iov = target;
                rx.capacity = total;
                rx.msg_length = total;
                rx.peer_send_id = Some(send_id);
                rx.dc = dc;
                rx.cq_data = cq_data;
                rx
            });
            ep.av.peer_mut(peer).expect("resolved peer").track_rx(rx_id);

            let first_len;
            {
                let bytes = super::pkt_bytes(ep, PoolKind::Rx, pkt_idx);
                let payload = &bytes[view.payload_off..];
                first_len = payload.len();
                let rx = ep.rx_entries.get(rx_id).expect("live rx entry");
                let _ = copy_to_iov(&ep.hmem, &rx.iov, &rx.desc, 0, payload);
            }
            let rx = ep.rx_entries.get_mut(rx_id).expect("live rx entry");
            rx.bytes_received = first_len;
            rx.bytes_copied = first_len;
            if rx.bytes_received >= rx.msg_length {
                super::finish_rx(ep, rx_id);
            } else {
                super::longcts::send_cts(ep, rx_id);
            }
        }
        ReqHdr::LongReadRtw(hdr) => {
            if !check_rma_iov(ep, &hdr.rma_iov, true) {
                ep.note_proto_error("RTW to unregistered memory", peer);
                return;
            }
            let total = hdr.msg_length as usize;
            if (total as u64) > rma_total(&hdr.rma_iov)
                || (total as u64) > rma_total(&hdr.read_iov)
            {
                ep.note_proto_error("RTW larger than described regions", peer);
                return;
            }
            let target = rma_segs(&hdr.rma_iov);
            let remote = hdr.read_iov.clone();
            let send_id = hdr.send_id;
            let cq_data = view.opt.cq_data;

            let rx_id = ep.rx_entries.insert_with(|id| {
                let mut rx = RxEntry::new_internal(id, peer);
                rx.iov = target;
                rx.capacity = total;
                rx.msg_length = total;
                rx.peer_send_id = Some(send_id);
                rx.cq_data = cq_data;
                rx
            });
            ep.av.peer_mut(peer).expect("resolved peer").track_rx(rx_id);

            match super::longread::setup_reads(ep, rx_id, remote) {
                Ok(true) => {}
                Ok(false) => super::longread::rx_reads_done(ep, rx_id),
                Err(err) => ep.fail_rx(rx_id, err),
            }
        }
        _ => unreachable!("rtw dispatch"),
    }
}

// =============================================================================
// READ (REQUESTER)
// =============================================================================

pub(crate) fn start_read(ep: &mut Endpoint, tx_id: usize) -> RdmResult<()> {
    let tx = ep.tx_entries.get(tx_id).expect("live tx entry");
    let peer_ref = ep.av.peer(tx.peer).expect("send validated peer");

    if peer_ref.supports_rdma_read() && ep.transport.supports_rdma_read() {
        ep.tx_entries.get_mut(tx_id).expect("live tx entry").proto = TxProto::DirectRead;
        return start_direct_read(ep, tx_id);
    }
    ep.tx_entries.get_mut(tx_id).expect("live tx entry").proto = TxProto::EmulatedRead;
    start_emulated_read(ep, tx_id)
}

/// Both sides advertise RDMA read: satisfy fi_read with transport reads and
/// no protocol packets at all.
fn start_direct_read(ep: &mut Endpoint, tx_id: usize) -> RdmResult<()> {
    let (remote, local, total) = {
        let tx = ep.tx_entries.get(tx_id).expect("live tx entry");
        (tx.remote_iov.clone(), tx.iov.clone(), tx.total_len)
    };
    if total == 0 {
        let tx = ep.tx_entries.get_mut(tx_id).expect("live tx entry");
        tx.state = TxState::Send;
        ep.complete_tx(tx_id);
        return Ok(());
    }

    let mut keys = Vec::with_capacity(local.len());
    let mut tmp = Vec::new();
    {
        let tx = ep.tx_entries.get(tx_id).expect("live tx entry");
        let needed: Vec<Option<u64>> =
            (0..local.len()).map(|i| tx.desc.get(i).and_then(|d| d.mem).map(|m| m.lkey)).collect();
        for (seg, key) in local.iter().zip(needed) {
            match key {
                Some(k) => keys.push(k),
                None => {
                    let desc = ep.registrar.register(*seg, access::LOCAL_WRITE)?;
                    tmp.push(desc.handle);
                    keys.push(desc.lkey);
                }
            }
        }
    }

    let read_id = ep
        .read_entries
        .insert_with(|id| ReadEntry::new(id, ReadOwner::Tx(tx_id), remote, local, keys, total));
    let tx = ep.tx_entries.get_mut(tx_id).expect("live tx entry");
    tx.tmp_mr.extend(tmp);
    tx.read_entry = Some(read_id);
    tx.state = TxState::Send;
    tx.mark_sent(total);
    ep.read_pending_list.push(read_id);
    trace!(tx = tx_id, read = read_id, total, "direct read scheduled");
    Ok(())
}

/// All chunks of a tx-owned (direct) read completed.
pub(crate) fn tx_reads_done(ep: &mut Endpoint, tx_id: usize) {
    let tx = ep.tx_entries.get_mut(tx_id).expect("live tx entry");
    if let Some(read_id) = tx.read_entry.take() {
        ep.read_entries.remove(read_id);
        ep.read_pending_list.retain(|id| *id != read_id);
    }
    let tx = ep.tx_entries.get_mut(tx_id).expect("live tx entry");
    let remaining = tx.total_len - tx.bytes_acked;
    tx.mark_acked(remaining);
    ep.maybe_complete_tx(tx_id);
}

/// The peer cannot be read directly: ask it to send the data back through a
/// READRSP (short) or DATA (longcts) flow.
fn start_emulated_read(ep: &mut Endpoint, tx_id: usize) -> RdmResult<()> {
    let (peer, total, local_iov, local_desc, remote) = {
        let tx = ep.tx_entries.get(tx_id).expect("live tx entry");
        (tx.peer, tx.total_len, tx.iov.clone(), tx.desc.clone(), tx.remote_iov.clone())
    };

    // Internal entry that receives the response data.
    let rx_id = ep.rx_entries.insert_with(|id| {
        let mut rx = RxEntry::new_internal(id, peer);
        rx.iov = local_iov;
        rx.desc = local_desc;
        rx.capacity = total;
        rx.msg_length = total;
        rx.linked_tx = Some(tx_id);
        rx
    });
    ep.av.peer_mut(peer).expect("send validated peer").track_rx(rx_id);

    let rsp_probe = RspHdr { send_id: 0, recv_id: 0, data_length: 0, connid: Some(0) };
    let short = total <= ep.transport.mtu().saturating_sub(rsp_probe.wire_len());
    let typ = if short { pkt_type::SHORT_RTR } else { pkt_type::LONGCTS_RTR };

    let hdr = ReqHdr::Rtr(RtrHdr {
        recv_id: rx_id as u32,
        recv_length: total as u64,
        rma_iov: remote,
    });
    let opt = super::req_opt_hdrs(ep, peer, None);
    let pkt_idx = match ep.tx_pool.alloc() {
        Ok(idx) => idx,
        Err(err) => {
            ep.release_rx_entry(rx_id);
            return Err(err);
        }
    };
    let hdr_len = match encode_req(typ, &hdr, &opt, ep.tx_pool.get_mut(pkt_idx).buf_mut()) {
        Ok(len) => len,
        Err(err) => {
            ep.tx_pool.release(pkt_idx);
            ep.release_rx_entry(rx_id);
            return Err(err);
        }
    };
    {
        let pkt = ep.tx_pool.get_mut(pkt_idx);
        pkt.len = hdr_len;
        pkt.typ = typ;
        pkt.peer = peer;
        pkt.payload_len = 0;
    }
    let tx = ep.tx_entries.get_mut(tx_id).expect("live tx entry");
    tx.state = TxState::Send;
    ep.post_or_queue_tx(tx_id, pkt_idx);
    Ok(())
}

// =============================================================================
// READ (RESPONDER)
// =============================================================================

pub(crate) fn handle_rtr(ep: &mut Endpoint, peer: FiAddr, _pkt_idx: usize, view: ReqView) {
    let ReqHdr::Rtr(hdr) = &view.hdr else {
        unreachable!("rtr dispatch");
    };
    if !check_rma_iov(ep, &hdr.rma_iov, false) {
        ep.note_proto_error("RTR for unregistered memory", peer);
        return;
    }
    let total = (hdr.recv_length as usize).min(rma_total(&hdr.rma_iov) as usize);
    let source = rma_segs(&hdr.rma_iov);
    let recv_id = hdr.recv_id;

    // Responder-side entry that streams the data back. No application
    // completion: the requester owns the operation.
    let tx_id = ep.tx_entries.insert_with(|id| {
        let mut tx =
            crate::entry::TxEntry::new(id, TxOp::Read, peer, source, Vec::new(), total, 0);
        tx.suppress_completion = true;
        tx.proto = TxProto::EmulatedRead;
        tx.peer_recv_id = Some(recv_id);
        tx.state = TxState::Send;
        tx
    });
    ep.av.peer_mut(peer).expect("resolved peer").track_tx(tx_id);

    // First packet: READRSP with as much payload as fits; short requests
    // finish right here, long ones continue as DATA under the requester's
    // CTS windows.
    let rsp = RspHdr {
        send_id: tx_id as u32,
        recv_id,
        data_length: total as u64,
        connid: super::ctrl_connid(ep),
    };
    let pkt_idx = match ep.tx_pool.alloc() {
        Ok(idx) => idx,
        Err(_) => {
            ep.fail_tx(tx_id, RdmError::NoMemory);
            return;
        }
    };
    let encode_res = {
        let tx = ep.tx_entries.get(tx_id).expect("live tx entry");
        let pkt = ep.tx_pool.get_mut(pkt_idx);
        rsp.encode(pkt_type::READRSP, pkt.buf_mut()).and_then(|hlen| {
            let chunk = (pkt.capacity() - hlen).min(total);
            copy_from_iov(&ep.hmem, &tx.iov, &tx.desc, 0, &mut pkt.buf_mut()[hlen..hlen + chunk])
                .map(|_| (hlen, chunk))
        })
    };
    let (hdr_len, chunk) = match encode_res {
        Ok(v) => v,
        Err(_) => {
            ep.tx_pool.release(pkt_idx);
            ep.fail_tx(tx_id, RdmError::Io);
            return;
        }
    };
    {
        let pkt = ep.tx_pool.get_mut(pkt_idx);
        pkt.len = hdr_len + chunk;
        pkt.typ = pkt_type::READRSP;
        pkt.peer = peer;
        pkt.payload_len = chunk;
    }
    let tx = ep.tx_entries.get_mut(tx_id).expect("live tx entry");
    tx.mark_sent(chunk);
    ep.post_or_queue_tx(tx_id, pkt_idx);
}

/// Requester side: first response packet of an emulated read.
pub(crate) fn handle_readrsp(
    ep: &mut Endpoint,
    peer: FiAddr,
    pkt_idx: usize,
    payload_off: usize,
    hdr: RspHdr,
) {
    let Some(rx) = ep.rx_entries.get(hdr.recv_id as usize) else {
        ep.note_proto_error("READRSP for unknown rx entry", peer);
        return;
    };
    let rx_id = rx.id;
    if rx.peer != Some(peer) {
        ep.note_proto_error("READRSP from wrong peer", peer);
        return;
    }
    let payload_len;
    {
        let bytes = ep.rx_pool.get(pkt_idx).buf();
        let payload = &bytes[payload_off..];
        payload_len = payload.len();
        let rx = ep.rx_entries.get(rx_id).expect("live rx entry");
        let _ = copy_to_iov(&ep.hmem, &rx.iov, &rx.desc, 0, payload);
    }
    let rx = ep.rx_entries.get_mut(rx_id).expect("live rx entry");
    rx.peer_send_id = Some(hdr.send_id);
    rx.msg_length = hdr.data_length as usize;
    rx.bytes_received = payload_len;
    rx.bytes_copied = payload_len;
    rx.window = rx.window.saturating_sub(payload_len);

    if rx.bytes_received >= rx.msg_length {
        super::finish_rx(ep, rx_id);
    } else if rx.window == 0 {
        super::longcts::send_cts(ep, rx_id);
    }
}
