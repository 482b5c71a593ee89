//! Eager messages: the whole payload rides in the REQ packet.

use super::PoolKind;
use crate::addr::FiAddr;
use crate::entry::{RxState, TxState, copy_from_iov, copy_to_iov};
use crate::ep::Endpoint;
use crate::error::{RdmError, RdmResult};
use crate::wire::req::{EagerRtmHdr, ReqHdr, ReqView, encode_req, req_hdr_len};
use crate::wire::pkt_type;

pub(crate) fn rtm_type(tagged: bool, dc: bool) -> u8 {
    match (tagged, dc) {
        (false, false) => pkt_type::EAGER_MSGRTM,
        (true, false) => pkt_type::EAGER_TAGRTM,
        (false, true) => pkt_type::DC_EAGER_MSGRTM,
        (true, true) => pkt_type::DC_EAGER_TAGRTM,
    }
}

/// Largest payload that still fits one packet toward this peer, given the
/// optional headers the peer currently requires.
pub(crate) fn max_payload(
    ep: &Endpoint,
    peer: FiAddr,
    tagged: bool,
    dc: bool,
    cq_data: bool,
) -> usize {
    let typ = rtm_type(tagged, dc);
    let hdr = ReqHdr::EagerRtm(EagerRtmHdr {
        msg_id: 0,
        send_id: dc.then_some(0),
        tag: if tagged { Some(0) } else { None },
    });
    let opt = super::req_opt_hdrs(ep, peer, if cq_data { Some(0) } else { None });
    ep.transport.mtu().saturating_sub(req_hdr_len(typ, &hdr, &opt))
}

/// Encode and post the single packet of an eager send.
pub(crate) fn start(ep: &mut Endpoint, tx_id: usize) -> RdmResult<()> {
    let tx = ep.tx_entries.get(tx_id).expect("live tx entry");
    let (peer, tagged, dc, msg_id, total) = (tx.peer, tx.tagged(), tx.dc, tx.msg_id, tx.total_len);
    let typ = rtm_type(tagged, dc);
    let hdr = ReqHdr::EagerRtm(EagerRtmHdr {
        msg_id,
        send_id: dc.then_some(tx_id as u32),
        tag: tagged.then_some(tx.tag),
    });
    let opt = super::req_opt_hdrs(ep, peer, tx.cq_data);

    let pkt_idx = ep.tx_pool.alloc()?;
    let hdr_len = {
        let buf = ep.tx_pool.get_mut(pkt_idx).buf_mut();
        match encode_req(typ, &hdr, &opt, buf) {
            Ok(len) => len,
            Err(err) => {
                ep.tx_pool.release(pkt_idx);
                return Err(err);
            }
        }
    };

    let copy_res = {
        let tx = ep.tx_entries.get(tx_id).expect("live tx entry");
        let pkt = ep.tx_pool.get_mut(pkt_idx);
        debug_assert!(hdr_len + total <= pkt.capacity());
        copy_from_iov(&ep.hmem, &tx.iov, &tx.desc, 0, &mut pkt.buf_mut()[hdr_len..hdr_len + total])
    };
    if let Err(err) = copy_res {
        ep.tx_pool.release(pkt_idx);
        return Err(err);
    }
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

/// Buffered eager send with no completion entry.
pub(crate) fn inject(ep: &mut Endpoint, peer: FiAddr, payload: &[u8]) -> RdmResult<()> {
    if ep.av.peer(peer).is_none() {
        return Err(RdmError::InvalidArg);
    }
    if payload.len() > max_payload(ep, peer, false, false, false) {
        return Err(RdmError::InvalidArg);
    }

    let msg_id = ep.av.peer_mut(peer).expect("validated above").next_msg_id();
    let tx_id = ep.tx_entries.insert_with(|id| {
        let mut tx = crate::entry::TxEntry::new(
            id,
            crate::entry::TxOp::Msg,
            peer,
            Vec::new(),
            Vec::new(),
            payload.len(),
            0,
        );
        tx.msg_id = msg_id;
        tx.suppress_completion = true;
        tx.state = TxState::Send;
        tx
    });
    ep.av.peer_mut(peer).expect("validated above").track_tx(tx_id);
    ep.stats.tx_started += 1;

    let typ = rtm_type(false, false);
    let hdr = ReqHdr::EagerRtm(EagerRtmHdr { msg_id, send_id: None, tag: None });
    let opt = super::req_opt_hdrs(ep, peer, None);

    let pkt_idx = match ep.tx_pool.alloc() {
        Ok(idx) => idx,
        Err(err) => {
            ep.fail_tx(tx_id, err);
            return Err(err);
        }
    };
    let encode_res = encode_req(typ, &hdr, &opt, ep.tx_pool.get_mut(pkt_idx).buf_mut());
    let hdr_len = match encode_res {
        Ok(len) => len,
        Err(err) => {
            ep.tx_pool.release(pkt_idx);
            ep.fail_tx(tx_id, err);
            return Err(err);
        }
    };
    {
        let pkt = ep.tx_pool.get_mut(pkt_idx);
        pkt.buf_mut()[hdr_len..hdr_len + payload.len()].copy_from_slice(payload);
        pkt.len = hdr_len + payload.len();
        pkt.typ = typ;
        pkt.peer = peer;
        pkt.payload_len = payload.len();
    }
    ep.tx_entries.get_mut(tx_id).expect("live tx entry").mark_sent(payload.len());
    ep.post_or_queue_tx(tx_id, pkt_idx);
    Ok(())
}

/// Receiver side: copy the payload into the application buffer and
/// complete. The matched entry's capacity truncates oversized messages.
pub(crate) fn deliver(
    ep: &mut Endpoint,
    rx_id: usize,
    pkt_idx: usize,
    pool: PoolKind,
    view: &ReqView,
) {
    let payload_total;
    {
        let bytes = super::pkt_bytes(ep, pool, pkt_idx);
        let payload = &bytes[view.payload_off..];
        payload_total = payload.len();
        let rx = ep.rx_entries.get(rx_id).expect("live rx entry");
        if !rx.canceled {
            let _ = copy_to_iov(&ep.hmem, &rx.iov, &rx.desc, 0, payload);
        }
    }
    let rx = ep.rx_entries.get_mut(rx_id).expect("live rx entry");
    rx.state = RxState::Recv;
    rx.msg_length = payload_total;
    rx.bytes_received = payload_total;
    rx.bytes_copied = payload_total.min(rx.capacity);
    super::finish_rx(ep, rx_id);
}
