//! Delivery-complete receipts.
//!
//! Under DC the sender withholds the application completion until the
//! receiver confirms that the payload landed in the application buffer.

use crate::addr::FiAddr;
use crate::ep::Endpoint;
use crate::wire::ctrl::ReceiptHdr;
use crate::wire::pkt_type;
use tracing::trace;

/// Confirm delivery for a finished rx entry. Called after the payload copy
/// (or the RDMA reads) landed.
pub(crate) fn post_receipt(ep: &mut Endpoint, rx_id: usize) {
    let rx = ep.rx_entries.get(rx_id).expect("live rx entry");
    let peer = rx.peer.expect("dc entry has a peer");
    let hdr = ReceiptHdr {
        send_id: rx.peer_send_id.unwrap_or(0),
        msg_id: rx.msg_id.unwrap_or(0),
        connid: super::ctrl_connid(ep),
    };
    match ep.alloc_ctrl_pkt(peer, pkt_type::RECEIPT, |buf| hdr.encode(buf)) {
        Ok(pkt_idx) => {
            trace!(rx = rx_id, peer, "receipt posted");
            ep.post_or_queue_rx(rx_id, pkt_idx);
        }
        Err(_) => {
            let rx = ep.rx_entries.get_mut(rx_id).expect("live rx entry");
            rx.pending_ctrl.push(pkt_type::RECEIPT);
            if !ep.queued_rx.contains(&rx_id) {
                ep.queued_rx.push(rx_id);
            }
        }
    }
}

/// Sender side: the peer confirmed delivery; release the completion.
pub(crate) fn handle_receipt(ep: &mut Endpoint, peer: FiAddr, hdr: ReceiptHdr) {
    let Some(tx) = ep.tx_entries.get_mut(hdr.send_id as usize) else {
        ep.note_proto_error("RECEIPT for unknown tx entry", peer);
        return;
    };
    if tx.peer != peer {
        ep.note_proto_error("RECEIPT from wrong peer", peer);
        return;
    }
    let tx_id = tx.id;
    tx.receipt_received = true;
    trace!(tx = tx_id, "receipt received");
    ep.maybe_complete_tx(tx_id);
}
