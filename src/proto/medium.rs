//! Medium messages: a burst of independently-routed segments, reassembled
//! by offset.
//!
//! A partial burst (transport accepted some segments, pushed back on the
//! rest) is never aborted: the remaining segments stay queued on the entry
//! and the progress loop re-drives them.

use super::PoolKind;
use crate::entry::{RxState, TxState, copy_from_iov, copy_to_iov};
use crate::ep::Endpoint;
use crate::error::{RdmError, RdmResult};
use crate::wire::pkt_type;
use crate::wire::req::{MediumRtmHdr, ReqHdr, ReqView, encode_req};

pub(crate) fn rtm_type(tagged: bool, dc: bool) -> u8 {
    match (tagged, dc) {
        (false, false) => pkt_type::MEDIUM_MSGRTM,
        (true, false) => pkt_type::MEDIUM_TAGRTM,
        (false, true) => pkt_type::DC_MEDIUM_MSGRTM,
        (true, true) => pkt_type::DC_MEDIUM_TAGRTM,
    }
}

/// Encode every segment of the burst, then post until the transport pushes
/// back; the remainder waits on the progress loop.
pub(crate) fn start(ep: &mut Endpoint, tx_id: usize) -> RdmResult<()> {
    let tx = ep.tx_entries.get(tx_id).expect("live tx entry");
    let (peer, tagged, dc, msg_id, total, tag) =
        (tx.peer, tx.tagged(), tx.dc, tx.msg_id, tx.total_len, tx.tag);
    let typ = rtm_type(tagged, dc);
    let opt = super::req_opt_hdrs(ep, peer, tx.cq_data);

    // Fixed header size for every segment of this burst.
    let probe = ReqHdr::MediumRtm(MediumRtmHdr {
        msg_id,
        send_id: dc.then_some(tx_id as u32),
        seg_length: total as u64,
        seg_offset: 0,
        tag: tagged.then_some(tag),
    });
    let hdr_len = crate::wire::req::req_hdr_len(typ, &probe, &opt);
    let seg_payload = ep.transport.mtu() - hdr_len;

    let mut pkts = Vec::new();
    let mut offset = 0usize;
    while offset < total {
        let take = seg_payload.min(total - offset);
        let hdr = ReqHdr::MediumRtm(MediumRtmHdr {
            msg_id,
            send_id: dc.then_some(tx_id as u32),
            seg_length: total as u64,
            seg_offset: offset as u64,
            tag: tagged.then_some(tag),
        });
        let pkt_idx = match ep.tx_pool.alloc() {
            Ok(idx) => idx,
            Err(err) => {
                for pkt in pkts {
                    ep.tx_pool.release(pkt);
                }
                return Err(err);
            }
        };
        let encode_res = {
            let tx = ep.tx_entries.get(tx_id).expect("live tx entry");
            let pkt = ep.tx_pool.get_mut(pkt_idx);
            encode_req(typ, &hdr, &opt, pkt.buf_mut()).and_then(|hlen| {
                copy_from_iov(
                    &ep.hmem,
                    &tx.iov,
                    &tx.desc,
                    offset,
                    &mut pkt.buf_mut()[hlen..hlen + take],
                )
                .map(|_| hlen)
            })
        };
        match encode_res {
            Ok(hlen) => {
                let pkt = ep.tx_pool.get_mut(pkt_idx);
                pkt.len = hlen + take;
                pkt.typ = typ;
                pkt.peer = peer;
                pkt.payload_len = take;
                pkts.push(pkt_idx);
            }
            Err(err) => {
                ep.tx_pool.release(pkt_idx);
                for pkt in pkts {
                    ep.tx_pool.release(pkt);
                }
                return Err(err);
            }
        }
        offset += take;
    }

    let tx = ep.tx_entries.get_mut(tx_id).expect("live tx entry");
    tx.state = TxState::Send;
    tx.mark_sent(total);
    for pkt_idx in pkts {
        // un-postable segments stay queued on the entry for the progress
        // loop; the burst is never aborted mid-way
        ep.post_or_queue_tx(tx_id, pkt_idx);
    }
    Ok(())
}

/// Receiver side: place one segment. Segments arrive in any order; the
/// entry completes when every byte landed.
pub(crate) fn deliver_seg(
    ep: &mut Endpoint,
    rx_id: usize,
    pkt_idx: usize,
    pool: PoolKind,
    view: &ReqView,
) {
    let ReqHdr::MediumRtm(hdr) = &view.hdr else {
        unreachable!("medium delivery requires a medium header");
    };
    let seg_offset = hdr.seg_offset as usize;
    let payload_len;
    {
        let bytes = super::pkt_bytes(ep, pool, pkt_idx);
        let payload = &bytes[view.payload_off..];
        payload_len = payload.len();
        let rx = ep.rx_entries.get(rx_id).expect("live rx entry");
        if !seg_in_bounds(rx.msg_length as u64, hdr.seg_offset, payload_len) {
            let peer = rx.peer.unwrap_or_default();
            ep.note_proto_error("medium segment outside message", peer);
            ep.fail_rx(rx_id, RdmError::Io);
            return;
        }
        if !rx.canceled {
            let _ = copy_to_iov(&ep.hmem, &rx.iov, &rx.desc, seg_offset, payload);
        }
    }

    let rx = ep.rx_entries.get_mut(rx_id).expect("live rx entry");
    if rx.state == RxState::Matched {
        rx.state = RxState::Recv;
        if let Some(peer) = rx.peer {
            let msg_id = rx.msg_id.expect("bound rtm carries msg id");
            ep.pkt_rx_map.entry((peer, msg_id)).or_insert(rx_id);
        }
        let rx = ep.rx_entries.get_mut(rx_id).expect("live rx entry");
        rx.bytes_received += payload_len;
        rx.bytes_copied = rx.bytes_received.min(rx.capacity);
    } else {
        rx.bytes_received += payload_len;
        rx.bytes_copied = rx.bytes_received.min(rx.capacity);
    }

    let rx = ep.rx_entries.get(rx_id).expect("live rx entry");
    debug_assert!(rx.bytes_received <= rx.msg_length, "medium overrun");
    if rx.bytes_received >= rx.msg_length {
        super::finish_rx(ep, rx_id);
    }
}

/// A segment must stay inside the announced message.
fn seg_in_bounds(total: u64, seg_offset: u64, payload_len: usize) -> bool {
    seg_offset.checked_add(payload_len as u64).is_some_and(|end| end <= total)
}
