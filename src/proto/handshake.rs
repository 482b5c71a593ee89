//! HANDSHAKE sub-protocol: feature bitmap exchange.
//!
//! The first REQ from a peer triggers exactly one HANDSHAKE back. Send
//! failures are non-fatal; the progress loop retries until it gets through.
//! Applications never observe handshake traffic.

use crate::addr::FiAddr;
use crate::ep::Endpoint;
use crate::error::{RdmError, RdmResult};
use crate::wire::ctrl::HandshakeHdr;
use tracing::{debug, trace};

/// Queue our HANDSHAKE toward `peer` if it has not been sent yet. Called on
/// every ingress packet from the peer.
pub(crate) fn ensure_handshake(ep: &mut Endpoint, peer: FiAddr) {
    let p = ep.av.peer(peer).expect("live peer");
    if p.handshake_sent {
        return;
    }
    match post_handshake(ep, peer) {
        Ok(()) => {
            let p = ep.av.peer_mut(peer).expect("live peer");
            p.handshake_sent = true;
            p.handshake_pending = false;
        }
        Err(RdmError::Again) | Err(RdmError::NoMemory) => {
            let p = ep.av.peer_mut(peer).expect("live peer");
            p.handshake_sent = true;
            p.handshake_pending = true;
        }
        Err(err) => {
            // Non-fatal: log and move on, the next packet retriggers us.
            debug!(peer, %err, "handshake send failed");
        }
    }
}

/// Encode and post one HANDSHAKE packet. `Again`/`NoMemory` leave the peer
/// flagged for the progress loop's retransmit sweep.
pub(crate) fn post_handshake(ep: &mut Endpoint, peer: FiAddr) -> RdmResult<()> {
    let hdr = HandshakeHdr { exinfo: vec![ep.features], connid: super::ctrl_connid(ep) };
    let pkt_idx =
        ep.alloc_ctrl_pkt(peer, crate::wire::pkt_type::HANDSHAKE, |buf| hdr.encode(buf))?;

    match ep.post_pkt(pkt_idx) {
        Ok(()) => {
            ep.av.peer_mut(peer).expect("live peer").outstanding_pkts += 1;
            trace!(peer, "handshake posted");
            Ok(())
        }
        Err(err) => {
            ep.tx_pool.release(pkt_idx);
            Err(err)
        }
    }
}

/// Incoming HANDSHAKE: latch the peer's feature bitmap. From here on REQs
/// stop carrying the raw-address header (unless the peer asked for stable
/// header lengths).
pub(crate) fn handle_handshake(ep: &mut Endpoint, peer: FiAddr, hdr: HandshakeHdr) {
    let p = ep.av.peer_mut(peer).expect("live peer");
    p.apply_handshake(hdr.exinfo);
    debug!(peer, "peer handshake applied");
}
