//! Long-read transfers: the receiver pulls the message straight into the
//! application buffer with RDMA reads, then terminates with EOR.
//!
//! Requires the peer to advertise the RDMA-read extra feature. The sender
//! parts with no payload at all; it only describes its registered regions.

use crate::addr::FiAddr;
use crate::entry::{ReadEntry, ReadOwner, RxState, TxState};
use crate::ep::Endpoint;
use crate::error::{RdmError, RdmResult};
use crate::transport::{MemSeg, access};
use crate::wire::ctrl::EorHdr;
use crate::wire::pkt_type;
use crate::wire::req::{LongReadRtmHdr, ReqHdr, ReqView, encode_req};
use crate::wire::RmaIov;
use tracing::trace;

pub(crate) fn rtm_type(tagged: bool, dc: bool) -> u8 {
    match (tagged, dc) {
        (false, false) => pkt_type::LONGREAD_MSGRTM,
        (true, false) => pkt_type::LONGREAD_TAGRTM,
        (false, true) => pkt_type::DC_LONGREAD_MSGRTM,
        (true, true) => pkt_type::DC_LONGREAD_TAGRTM,
    }
}

// =============================================================================
// SENDER
// =============================================================================

/// Describe the send buffer to the peer. Unregistered iov segments are
/// registered on the fly and released at completion.
pub(crate) fn start(ep: &mut Endpoint, tx_id: usize) -> RdmResult<()> {
    let read_iov = build_read_iov(ep, tx_id)?;

    let tx = ep.tx_entries.get(tx_id).expect("live tx entry");
    let (peer, tagged, dc, msg_id, total, tag) =
        (tx.peer, tx.tagged(), tx.dc, tx.msg_id, tx.total_len, tx.tag);
    let typ = rtm_type(tagged, dc);
    let hdr = ReqHdr::LongReadRtm(LongReadRtmHdr {
        msg_id,
        msg_length: total as u64,
        send_id: tx_id as u32,
        tag: tagged.then_some(tag),
        read_iov,
    });
    let opt = super::req_opt_hdrs(ep, peer, tx.cq_data);

    let pkt_idx = ep.tx_pool.alloc()?;
    let encode_res = encode_req(typ, &hdr, &opt, ep.tx_pool.get_mut(pkt_idx).buf_mut());
    let hdr_len = match encode_res {
        Ok(len) => len,
        Err(err) => {
            ep.tx_pool.release(pkt_idx);
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
    // The peer moves the bytes; they count as sent the moment the iov is
    // published.
    tx.mark_sent(total);
    ep.post_or_queue_tx(tx_id, pkt_idx);
    Ok(())
}

fn build_read_iov(ep: &mut Endpoint, tx_id: usize) -> RdmResult<Vec<RmaIov>> {
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
    Ok(out)
}

/// EOR from the receiver: every byte has been pulled; registrations can go.
pub(crate) fn handle_eor(ep: &mut Endpoint, peer: FiAddr, hdr: EorHdr) {
    let Some(tx) = ep.tx_entries.get_mut(hdr.send_id as usize) else {
        ep.note_proto_error("EOR for unknown tx entry", peer);
        return;
    };
    if tx.peer != peer {
        ep.note_proto_error("EOR from wrong peer", peer);
        return;
    }
    let tx_id = tx.id;
    let remaining = tx.total_len - tx.bytes_acked;
    tx.mark_acked(remaining);
    trace!(tx = tx_id, "EOR received");
    ep.maybe_complete_tx(tx_id);
}

// =============================================================================
// RECEIVER
// =============================================================================

/// First (and only) packet of a long-read message: set up the RDMA reads.
pub(crate) fn deliver_start(ep: &mut Endpoint, rx_id: usize, view: &ReqView) {
    let ReqHdr::LongReadRtm(hdr) = &view.hdr else {
        unreachable!("longread delivery requires a longread header");
    };
    let send_id = hdr.send_id;
    let remote = hdr.read_iov.clone();
    let remote_total: u64 = remote.iter().map(|e| e.len).sum();
    {
        let rx = ep.rx_entries.get_mut(rx_id).expect("live rx entry");
        rx.state = RxState::Recv;
        rx.peer_send_id = Some(send_id);
        if remote_total < rx.msg_length as u64 {
            let peer = rx.peer.unwrap_or_default();
            ep.note_proto_error("read iov shorter than message", peer);
            ep.fail_rx(rx_id, RdmError::Io);
            return;
        }
    }

    match setup_reads(ep, rx_id, remote) {
        Ok(true) => {}
        Ok(false) => {
            // Zero-length message: nothing to read.
            rx_reads_done(ep, rx_id);
        }
        Err(err) => {
            ep.fail_rx(rx_id, err);
        }
    }
}

/// Build the read entry pulling `remote` into the entry's buffer. Returns
/// false when there is nothing to read.
pub(crate) fn setup_reads(
    ep: &mut Endpoint,
    rx_id: usize,
    remote: Vec<RmaIov>,
) -> RdmResult<bool> {
    let rx = ep.rx_entries.get(rx_id).expect("live rx entry");
    let total = rx.msg_length.min(rx.capacity);
    if total == 0 {
        return Ok(false);
    }

    // Clamp the local iov to the bytes we will actually pull.
    let mut local = Vec::new();
    let mut need_keys = Vec::new();
    let mut left = total;
    for (i, seg) in rx.iov.iter().enumerate() {
        if left == 0 {
            break;
        }
        let take = seg.len.min(left);
        local.push(MemSeg::new(seg.addr, take));
        need_keys.push(rx.desc.get(i).and_then(|d| d.mem).map(|m| m.lkey));
        left -= take;
    }

    let mut keys = Vec::with_capacity(local.len());
    let mut tmp = Vec::new();
    for (seg, key) in local.iter().zip(&need_keys) {
        match key {
            Some(k) => keys.push(*k),
            None => {
                let desc = ep.registrar.register(*seg, access::LOCAL_WRITE)?;
                tmp.push(desc.handle);
                keys.push(desc.lkey);
            }
        }
    }

    let read_id = ep
        .read_entries
        .insert_with(|id| ReadEntry::new(id, ReadOwner::Rx(rx_id), remote, local, keys, total));
    let rx = ep.rx_entries.get_mut(rx_id).expect("live rx entry");
    rx.tmp_mr.extend(tmp);
    rx.read_entry = Some(read_id);
    ep.read_pending_list.push(read_id);
    trace!(rx = rx_id, read = read_id, total, "RDMA reads scheduled");
    Ok(true)
}

/// All reads for an rx-owned read entry completed: terminate with EOR and
/// finish the entry.
pub(crate) fn rx_reads_done(ep: &mut Endpoint, rx_id: usize) {
    {
        let rx = ep.rx_entries.get_mut(rx_id).expect("live rx entry");
        if let Some(read_id) = rx.read_entry.take() {
            ep.read_entries.remove(read_id);
            ep.read_pending_list.retain(|id| *id != read_id);
        }
        let rx = ep.rx_entries.get_mut(rx_id).expect("live rx entry");
        rx.bytes_received = rx.msg_length;
        rx.bytes_copied = rx.msg_length.min(rx.capacity);
    }
    post_eor(ep, rx_id);
    if ep.rx_entries.get(rx_id).is_some() {
        super::finish_rx(ep, rx_id);
    }
}

pub(crate) fn post_eor(ep: &mut Endpoint, rx_id: usize) {
    let rx = ep.rx_entries.get(rx_id).expect("live rx entry");
    let peer = rx.peer.expect("flowing entry has a peer");
    let hdr = EorHdr {
        send_id: rx.peer_send_id.expect("flowing entry saw the RTM"),
        recv_id: rx_id as u32,
        connid: super::ctrl_connid(ep),
    };
    match ep.alloc_ctrl_pkt(peer, pkt_type::EOR, |buf| hdr.encode(buf)) {
        Ok(pkt_idx) => {
            ep.post_or_queue_rx(rx_id, pkt_idx);
        }
        Err(_) => {
            let rx = ep.rx_entries.get_mut(rx_id).expect("live rx entry");
            rx.state = RxState::QueuedCtrl;
            rx.pending_ctrl.push(pkt_type::EOR);
            if !ep.queued_rx.contains(&rx_id) {
                ep.queued_rx.push(rx_id);
            }
        }
    }
}
