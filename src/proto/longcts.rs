//! Long-CTS transfers: arbitrary size under receiver-granted windows.
//!
//! The RTM carries the first chunk. Every CTS grants the sender a byte
//! window of at least one packet, the sender streams DATA segments until the
//! window is spent, and the receiver re-grants until the message is whole.

use super::PoolKind;
use crate::addr::FiAddr;
use crate::entry::{RxState, TxState, copy_from_iov, copy_to_iov};
use crate::ep::{Endpoint, PostOutcome};
use crate::error::{RdmError, RdmResult};
use crate::wire::ctrl::{CtsHdr, DataHdr};
use crate::wire::pkt_type;
use crate::wire::req::{LongCtsRtmHdr, ReqHdr, ReqView, encode_req};
use tracing::trace;

pub(crate) fn rtm_type(tagged: bool, dc: bool) -> u8 {
    match (tagged, dc) {
        (false, false) => pkt_type::LONGCTS_MSGRTM,
        (true, false) => pkt_type::LONGCTS_TAGRTM,
        (false, true) => pkt_type::DC_LONGCTS_MSGRTM,
        (true, true) => pkt_type::DC_LONGCTS_TAGRTM,
    }
}

// =============================================================================
// SENDER
// =============================================================================

/// Encode and post the RTM with as much payload as one packet holds.
pub(crate) fn start(ep: &mut Endpoint, tx_id: usize) -> RdmResult<()> {
    let tx = ep.tx_entries.get(tx_id).expect("live tx entry");
    let (peer, tagged, dc, msg_id, total, tag) =
        (tx.peer, tx.tagged(), tx.dc, tx.msg_id, tx.total_len, tx.tag);
    let typ = rtm_type(tagged, dc);
    let credit_request = ep.cfg.tx_credits;
    let hdr = ReqHdr::LongCtsRtm(LongCtsRtmHdr {
        msg_id,
        msg_length: total as u64,
        send_id: tx_id as u32,
        credit_request,
        tag: tagged.then_some(tag),
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

/// CTS from the receiver: open (or widen) the DATA window.
pub(crate) fn handle_cts(ep: &mut Endpoint, peer: FiAddr, hdr: CtsHdr) {
    let Some(tx) = ep.tx_entries.get_mut(hdr.send_id as usize) else {
        ep.note_proto_error("CTS for unknown tx entry", peer);
        return;
    };
    if tx.peer != peer {
        ep.note_proto_error("CTS from wrong peer", peer);
        return;
    }
    if hdr.recv_length == 0 {
        // A zero grant can never make progress.
        ep.note_proto_error("zero-length CTS grant", peer);
        return;
    }
    tx.peer_recv_id = Some(hdr.recv_id);
    tx.window = hdr.recv_length as usize;
    let tx_id = tx.id;
    trace!(tx = tx_id, window = hdr.recv_length, "CTS window opened");
    if !ep.tx_pending_list.contains(&tx_id) {
        ep.tx_pending_list.push(tx_id);
    }
}

/// Progress step: stream DATA packets while the window and the outstanding
/// cap allow. Returns false once the entry no longer needs the pending list.
pub(crate) fn send_data_pkts(ep: &mut Endpoint, tx_id: usize) -> bool {
    loop {
        let Some(tx) = ep.tx_entries.get(tx_id) else {
            return false;
        };
        if tx.bytes_sent >= tx.total_len {
            return false;
        }
        if tx.window == 0 {
            return true;
        }
        let max_data = super::max_data_payload(ep, tx.peer);
        let payload = max_data.min(tx.window).min(tx.total_len - tx.bytes_sent);
        let recv_id = tx.peer_recv_id.expect("window implies CTS seen");
        let offset = tx.bytes_sent;
        let peer = tx.peer;
        let hdr = DataHdr {
            recv_id,
            data_length: payload as u64,
            data_offset: offset as u64,
            connid: super::ctrl_connid(ep),
        };

        let Ok(pkt_idx) = ep.tx_pool.alloc() else {
            return true;
        };
        let encode_res = {
            let tx = ep.tx_entries.get(tx_id).expect("live tx entry");
            let pkt = ep.tx_pool.get_mut(pkt_idx);
            hdr.encode(pkt.buf_mut()).and_then(|hlen| {
                copy_from_iov(
                    &ep.hmem,
                    &tx.iov,
                    &tx.desc,
                    offset,
                    &mut pkt.buf_mut()[hlen..hlen + payload],
                )
                .map(|_| hlen)
            })
        };
        let hdr_len = match encode_res {
            Ok(len) => len,
            Err(_) => {
                ep.tx_pool.release(pkt_idx);
                ep.fail_tx(tx_id, RdmError::Io);
                return false;
            }
        };
        {
            let pkt = ep.tx_pool.get_mut(pkt_idx);
            pkt.len = hdr_len + payload;
            pkt.typ = pkt_type::DATA;
            pkt.peer = peer;
            pkt.payload_len = payload;
        }

        match ep.post_or_queue_tx(tx_id, pkt_idx) {
            PostOutcome::Posted => {
                let tx = ep.tx_entries.get_mut(tx_id).expect("live tx entry");
                tx.mark_sent(payload);
                tx.window -= payload;
            }
            PostOutcome::Queued => {
                // The packet is committed once it leaves the queue; account
                // for it now so it is not encoded twice.
                let tx = ep.tx_entries.get_mut(tx_id).expect("live tx entry");
                tx.mark_sent(payload);
                tx.window -= payload;
                return true;
            }
            PostOutcome::Failed => return false,
        }
    }
}

// =============================================================================
// RECEIVER
// =============================================================================

/// First packet of a long-CTS message on a matched entry: place the first
/// chunk and grant the opening window.
pub(crate) fn deliver_start(
    ep: &mut Endpoint,
    rx_id: usize,
    pkt_idx: usize,
    pool: PoolKind,
    view: &ReqView,
) {
    let ReqHdr::LongCtsRtm(hdr) = &view.hdr else {
        unreachable!("longcts delivery requires a longcts header");
    };
    let send_id = hdr.send_id;
    let payload_len;
    {
        let bytes = super::pkt_bytes(ep, pool, pkt_idx);
        let payload = &bytes[view.payload_off..];
        payload_len = payload.len();
        let rx = ep.rx_entries.get(rx_id).expect("live rx entry");
        if !rx.canceled {
            let _ = copy_to_iov(&ep.hmem, &rx.iov, &rx.desc, 0, payload);
        }
    }

    let rx = ep.rx_entries.get_mut(rx_id).expect("live rx entry");
    rx.state = RxState::Recv;
    rx.peer_send_id = Some(send_id);
    rx.bytes_received = payload_len;
    rx.bytes_copied = payload_len.min(rx.capacity);

    if rx.bytes_received >= rx.msg_length {
        super::finish_rx(ep, rx_id);
    } else {
        send_cts(ep, rx_id);
    }
}

/// Grant the sender another window. Always at least one packet's worth.
pub(crate) fn send_cts(ep: &mut Endpoint, rx_id: usize) {
    let rx = ep.rx_entries.get(rx_id).expect("live rx entry");
    let peer = rx.peer.expect("flowing entry has a peer");
    let remaining = rx.msg_length - rx.bytes_received;
    let max_data = super::max_data_payload(ep, peer);
    let window = remaining.min(ep.cfg.cts_window_pkts.max(1) * max_data);
    debug_assert!(window > 0, "CTS must grant progress");

    let hdr = CtsHdr {
        send_id: rx.peer_send_id.expect("flowing entry saw the RTM"),
        recv_id: rx_id as u32,
        recv_length: window as u64,
        connid: super::ctrl_connid(ep),
    };
    let pkt = ep.alloc_ctrl_pkt(peer, pkt_type::CTS, |buf| hdr.encode(buf));
    match pkt {
        Ok(pkt_idx) => {
            ep.rx_entries.get_mut(rx_id).expect("live rx entry").window = window;
            trace!(rx = rx_id, window, "CTS granted");
            ep.post_or_queue_rx(rx_id, pkt_idx);
        }
        Err(_) => {
            // Pool pressure: the progress loop's queued-entry sweep retries.
            let rx = ep.rx_entries.get_mut(rx_id).expect("live rx entry");
            rx.state = RxState::QueuedCtrl;
            rx.pending_ctrl.push(pkt_type::CTS);
            if !ep.queued_rx.contains(&rx_id) {
                ep.queued_rx.push(rx_id);
            }
        }
    }
}

/// One DATA segment: place it and re-grant when the window closes.
pub(crate) fn handle_data(
    ep: &mut Endpoint,
    peer: FiAddr,
    pkt_idx: usize,
    payload_off: usize,
    hdr: DataHdr,
) {
    let Some(rx) = ep.rx_entries.get(hdr.recv_id as usize) else {
        ep.note_proto_error("DATA for unknown rx entry", peer);
        return;
    };
    let rx_id = rx.id;
    if rx.peer != Some(peer) {
        ep.note_proto_error("DATA from wrong peer", peer);
        return;
    }
    let payload_len;
    {
        let bytes = ep.rx_pool.get(pkt_idx).buf();
        let payload = &bytes[payload_off..];
        payload_len = payload.len();
        let rx = ep.rx_entries.get(rx_id).expect("live rx entry");
        if payload_len as u64 != hdr.data_length
            || hdr.data_offset.checked_add(hdr.data_length).is_none_or(|end| end > rx.msg_length as u64)
        {
            ep.note_proto_error("DATA outside message bounds", peer);
            ep.fail_rx(rx_id, RdmError::Io);
            return;
        }
        if !rx.canceled {
            let _ = copy_to_iov(&ep.hmem, &rx.iov, &rx.desc, hdr.data_offset as usize, payload);
        }
    }

    let rx = ep.rx_entries.get_mut(rx_id).expect("live rx entry");
    rx.bytes_received += payload_len;
    rx.bytes_copied = rx.bytes_received.min(rx.capacity);
    rx.window = rx.window.saturating_sub(payload_len);

    if rx.bytes_received >= rx.msg_length {
        super::finish_rx(ep, rx_id);
    } else if rx.window == 0 {
        // Full window consumed: next grant.
        send_cts(ep, rx_id);
    }
}
