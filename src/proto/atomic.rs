//! Emulated atomics: RTA requests applied element-wise by the responder,
//! with ATOMRSP carrying original values back for fetching variants.

use crate::addr::FiAddr;
use crate::entry::{RxEntry, TxOp, TxProto, TxState, copy_from_iov, copy_to_iov, iov_total};
use crate::ep::Endpoint;
use crate::error::{RdmError, RdmResult};
use crate::transport::MemSeg;
use crate::wire::ctrl::RspHdr;
use crate::wire::pkt_type;
use crate::wire::req::{ReqHdr, ReqView, RtaHdr, encode_req, req_hdr_len};
use tracing::trace;

/// Integer datatypes supported by the emulated atomic engine. Values follow
/// the libfabric datatype numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicDatatype {
    Int32 = 4,
    Uint32 = 5,
    Int64 = 6,
    Uint64 = 7,
}

impl AtomicDatatype {
    pub fn size(self) -> usize {
        match self {
            AtomicDatatype::Int32 | AtomicDatatype::Uint32 => 4,
            AtomicDatatype::Int64 | AtomicDatatype::Uint64 => 8,
        }
    }

    pub fn from_wire(v: u32) -> RdmResult<Self> {
        match v {
            4 => Ok(AtomicDatatype::Int32),
            5 => Ok(AtomicDatatype::Uint32),
            6 => Ok(AtomicDatatype::Int64),
            7 => Ok(AtomicDatatype::Uint64),
            _ => Err(RdmError::NotSupported),
        }
    }
}

/// Atomic operations, libfabric op numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    Min = 0,
    Max = 1,
    Sum = 2,
    Bor = 6,
    Band = 7,
    Bxor = 9,
    Write = 11,
    Cswap = 12,
}

impl AtomicOp {
    pub fn from_wire(v: u32) -> RdmResult<Self> {
        match v {
            0 => Ok(AtomicOp::Min),
            1 => Ok(AtomicOp::Max),
            2 => Ok(AtomicOp::Sum),
            6 => Ok(AtomicOp::Bor),
            7 => Ok(AtomicOp::Band),
            9 => Ok(AtomicOp::Bxor),
            11 => Ok(AtomicOp::Write),
            12 => Ok(AtomicOp::Cswap),
            _ => Err(RdmError::NotSupported),
        }
    }
}

/// Parameters carried by an atomic tx entry.
#[derive(Debug, Clone)]
pub struct AtomicParams {
    pub datatype: AtomicDatatype,
    pub op: AtomicOp,
    pub count: usize,
    pub compare_iov: Vec<MemSeg>,
    pub result_iov: Vec<MemSeg>,
    pub result_desc: Vec<crate::entry::BufDesc>,
}

// =============================================================================
// REQUESTER
// =============================================================================

pub(crate) fn start(ep: &mut Endpoint, tx_id: usize) -> RdmResult<()> {
    let tx = ep.tx_entries.get(tx_id).expect("live tx entry");
    let (peer, op, dc, total) = (tx.peer, tx.op, tx.dc, tx.total_len);
    let params = tx.atomic.as_ref().expect("atomic entry has params");
    let (datatype, aop) = (params.datatype, params.op);

    let typ = match op {
        TxOp::AtomicWrite if dc => pkt_type::DC_WRITE_RTA,
        TxOp::AtomicWrite => pkt_type::WRITE_RTA,
        TxOp::AtomicFetch => pkt_type::FETCH_RTA,
        TxOp::AtomicCompare => pkt_type::COMPARE_RTA,
        _ => unreachable!("atomic ops only"),
    };

    // Fetch/compare responses land on an internal entry linked back to us.
    let recv_id = match op {
        TxOp::AtomicFetch | TxOp::AtomicCompare => {
            let (result_iov, result_desc) = {
                let params = tx.atomic.as_ref().expect("atomic entry has params");
                (params.result_iov.clone(), params.result_desc.clone())
            };
            let rx_id = ep.rx_entries.insert_with(|id| {
                let mut rx = RxEntry::new_internal(id, peer);
                rx.iov = result_iov;
                rx.desc = result_desc;
                rx.capacity = total;
                rx.msg_length = total;
                rx.linked_tx = Some(tx_id);
                rx
            });
            ep.av.peer_mut(peer).expect("send validated peer").track_rx(rx_id);
            Some(rx_id as u32)
        }
        TxOp::AtomicWrite if dc => Some(tx_id as u32),
        _ => None,
    };

    let msg_id = ep.av.peer_mut(peer).expect("send validated peer").next_rta_id();
    let hdr = ReqHdr::Rta(RtaHdr {
        msg_id,
        datatype: datatype as u32,
        op: aop as u32,
        recv_id,
        rma_iov: ep.tx_entries.get(tx_id).expect("live tx entry").rma_iov.clone(),
    });
    let opt = super::req_opt_hdrs(ep, peer, None);

    // Operands (and the compare buffer) must fit one packet.
    let compare_len =
        if op == TxOp::AtomicCompare { total } else { 0 };
    if req_hdr_len(typ, &hdr, &opt) + total + compare_len > ep.transport.mtu() {
        if let Some(rx_id) = recv_id.filter(|_| op != TxOp::AtomicWrite) {
            ep.release_rx_entry(rx_id as usize);
        }
        return Err(RdmError::InvalidArg);
    }

    let pkt_idx = ep.tx_pool.alloc()?;
    let encode_res = {
        let tx = ep.tx_entries.get(tx_id).expect("live tx entry");
        let params = tx.atomic.as_ref().expect("atomic entry has params");
        let pkt = ep.tx_pool.get_mut(pkt_idx);
        encode_req(typ, &hdr, &opt, pkt.buf_mut()).and_then(|hlen| {
            copy_from_iov(&ep.hmem, &tx.iov, &tx.desc, 0, &mut pkt.buf_mut()[hlen..hlen + total])?;
            if compare_len > 0 {
                copy_from_iov(
                    &ep.hmem,
                    &params.compare_iov,
                    &[],
                    0,
                    &mut pkt.buf_mut()[hlen + total..hlen + total + compare_len],
                )?;
            }
            Ok(hlen)
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
        pkt.len = hdr_len + total + compare_len;
        pkt.typ = typ;
        pkt.peer = peer;
        pkt.payload_len = total;
    }
    let tx = ep.tx_entries.get_mut(tx_id).expect("live tx entry");
    tx.msg_id = msg_id;
    tx.proto = TxProto::Atomic;
    tx.state = TxState::Send;
    tx.mark_sent(total);
    trace!(tx = tx_id, ?typ, "atomic dispatched");
    ep.post_or_queue_tx(tx_id, pkt_idx);
    Ok(())
}

/// ATOMRSP: original values for a fetching atomic.
pub(crate) fn handle_atomrsp(
    ep: &mut Endpoint,
    peer: FiAddr,
    pkt_idx: usize,
    payload_off: usize,
    hdr: RspHdr,
) {
    let Some(rx) = ep.rx_entries.get(hdr.recv_id as usize) else {
        ep.note_proto_error("ATOMRSP for unknown rx entry", peer);
        return;
    };
    let rx_id = rx.id;
    if rx.peer != Some(peer) {
        ep.note_proto_error("ATOMRSP from wrong peer", peer);
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
    rx.bytes_received = payload_len;
    rx.bytes_copied = payload_len;
    super::finish_rx(ep, rx_id);
}

// =============================================================================
// RESPONDER
// =============================================================================

pub(crate) fn handle_rta(ep: &mut Endpoint, peer: FiAddr, pkt_idx: usize, view: ReqView) {
    let ReqHdr::Rta(hdr) = &view.hdr else {
        unreachable!("rta dispatch");
    };
    let (datatype, op) = match (AtomicDatatype::from_wire(hdr.datatype), AtomicOp::from_wire(hdr.op))
    {
        (Ok(d), Ok(o)) => (d, o),
        _ => {
            ep.note_proto_error("unsupported atomic datatype/op", peer);
            return;
        }
    };
    if !hdr.rma_iov.iter().all(|e| ep.registrar.check(e.key, e.addr, e.len as usize, true)) {
        ep.note_proto_error("RTA to unregistered memory", peer);
        return;
    }
    let typ = view.base.typ;
    let fetching = matches!(typ, pkt_type::FETCH_RTA | pkt_type::COMPARE_RTA);
    let target: Vec<MemSeg> = hdr.rma_iov.iter().map(|e| MemSeg::new(e.addr, e.len as usize)).collect();
    let target_cap = iov_total(&target);
    let recv_id = hdr.recv_id;

    // Pull operands (and compare values) out of the packet.
    let (operand, compare) = {
        let bytes = super::pkt_bytes(ep, super::PoolKind::Rx, pkt_idx);
        let payload = &bytes[view.payload_off..];
        let elsize = datatype.size();
        let op_len = if typ == pkt_type::COMPARE_RTA { payload.len() / 2 } else { payload.len() };
        if op_len == 0 || op_len % elsize != 0 || op_len > target_cap {
            ep.note_proto_error("malformed atomic payload", peer);
            return;
        }
        (payload[..op_len].to_vec(), payload[op_len..].to_vec())
    };

    // Read current target values, stage them for the response, apply.
    let mut current = vec![0u8; operand.len()];
    if copy_from_iov(&ep.hmem, &target, &[], 0, &mut current).is_err() {
        ep.note_proto_error("atomic target read failed", peer);
        return;
    }
    let mut updated = current.clone();
    apply(datatype, op, &mut updated, &operand, &compare);
    let _ = copy_to_iov(&ep.hmem, &target, &[], 0, &updated);

    if fetching {
        respond_atomrsp(ep, peer, recv_id.expect("fetching RTA carries recv id"), current);
    } else if typ == pkt_type::DC_WRITE_RTA {
        // Delivery-complete write: confirm once the update landed.
        let rx_id = ep.rx_entries.insert_with(|id| {
            let mut rx = RxEntry::new_internal(id, peer);
            rx.peer_send_id = recv_id;
            rx.dc = true;
            rx.bytes_received = operand.len();
            rx.msg_length = operand.len();
            rx
        });
        ep.av.peer_mut(peer).expect("resolved peer").track_rx(rx_id);
        super::finish_rx(ep, rx_id);
    }
}

fn respond_atomrsp(ep: &mut Endpoint, peer: FiAddr, recv_id: u32, original: Vec<u8>) {
    let tx_id = ep.tx_entries.insert_with(|id| {
        let mut tx = crate::entry::TxEntry::new(
            id,
            TxOp::Read,
            peer,
            Vec::new(),
            Vec::new(),
            original.len(),
            0,
        );
        tx.suppress_completion = true;
        tx.proto = TxProto::Atomic;
        tx.state = TxState::Send;
        tx
    });
    ep.av.peer_mut(peer).expect("resolved peer").track_tx(tx_id);

    let hdr = RspHdr {
        send_id: tx_id as u32,
        recv_id,
        data_length: original.len() as u64,
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
        let pkt = ep.tx_pool.get_mut(pkt_idx);
        hdr.encode(pkt_type::ATOMRSP, pkt.buf_mut()).map(|hlen| {
            pkt.buf_mut()[hlen..hlen + original.len()].copy_from_slice(&original);
            hlen
        })
    };
    let hdr_len = match encode_res {
        Ok(len) => len,
        Err(_) => {
            ep.tx_pool.release(pkt_idx);
            ep.fail_tx(tx_id, RdmError::Io);
            return;
        }
    };
    {
        let pkt = ep.tx_pool.get_mut(pkt_idx);
        pkt.len = hdr_len + original.len();
        pkt.typ = pkt_type::ATOMRSP;
        pkt.peer = peer;
        pkt.payload_len = original.len();
    }
    let tx = ep.tx_entries.get_mut(tx_id).expect("live tx entry");
    tx.mark_sent(original.len());
    ep.post_or_queue_tx(tx_id, pkt_idx);
}

// =============================================================================
// ELEMENT-WISE APPLY
// =============================================================================

fn apply(datatype: AtomicDatatype, op: AtomicOp, target: &mut [u8], operand: &[u8], compare: &[u8]) {
    match datatype {
        AtomicDatatype::Uint32 => apply_typed::<u32, 4>(op, target, operand, compare, u32::from_le_bytes, |v| v.to_le_bytes()),
        AtomicDatatype::Int32 => apply_typed::<i32, 4>(op, target, operand, compare, i32::from_le_bytes, |v| v.to_le_bytes()),
        AtomicDatatype::Uint64 => apply_typed::<u64, 8>(op, target, operand, compare, u64::from_le_bytes, |v| v.to_le_bytes()),
        AtomicDatatype::Int64 => apply_typed::<i64, 8>(op, target, operand, compare, i64::from_le_bytes, |v| v.to_le_bytes()),
    }
}

trait AtomicInt: Copy + Ord {
    fn wrapping_sum(self, other: Self) -> Self;
    fn bit_or(self, other: Self) -> Self;
    fn bit_and(self, other: Self) -> Self;
    fn bit_xor(self, other: Self) -> Self;
}

macro_rules! impl_atomic_int {
    ($($ty:ty),*) => {$(
        impl AtomicInt for $ty {
            fn wrapping_sum(self, other: Self) -> Self { self.wrapping_add(other) }
            fn bit_or(self, other: Self) -> Self { self | other }
            fn bit_and(self, other: Self) -> Self { self & other }
            fn bit_xor(self, other: Self) -> Self { self ^ other }
        }
    )*};
}

impl_atomic_int!(u32, i32, u64, i64);

fn apply_typed<T: AtomicInt, const N: usize>(
    op: AtomicOp,
    target: &mut [u8],
    operand: &[u8],
    compare: &[u8],
    decode: fn([u8; N]) -> T,
    encode: fn(T) -> [u8; N],
) {
    let count = operand.len() / N;
    for i in 0..count {
        let off = i * N;
        let cur = decode(target[off..off + N].try_into().unwrap());
        let opv = decode(operand[off..off + N].try_into().unwrap());
        let new = match op {
            AtomicOp::Min => cur.min(opv),
            AtomicOp::Max => cur.max(opv),
            AtomicOp::Sum => cur.wrapping_sum(opv),
            AtomicOp::Bor => cur.bit_or(opv),
            AtomicOp::Band => cur.bit_and(opv),
            AtomicOp::Bxor => cur.bit_xor(opv),
            AtomicOp::Write => opv,
            AtomicOp::Cswap => {
                let cmp = decode(compare[off..off + N].try_into().unwrap());
                if cur == cmp { opv } else { cur }
            }
        };
        target[off..off + N].copy_from_slice(&encode(new));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_sum_u64() {
        let mut target = 5u64.to_le_bytes().to_vec();
        let operand = 7u64.to_le_bytes().to_vec();
        apply(AtomicDatatype::Uint64, AtomicOp::Sum, &mut target, &operand, &[]);
        assert_eq!(u64::from_le_bytes(target.try_into().unwrap()), 12);
    }

    #[test]
    fn test_apply_cswap() {
        let mut target = 5u32.to_le_bytes().to_vec();
        let operand = 9u32.to_le_bytes().to_vec();
        // mismatching compare leaves the target alone
        apply(AtomicDatatype::Uint32, AtomicOp::Cswap, &mut target, &operand, &4u32.to_le_bytes());
        assert_eq!(u32::from_le_bytes(target.clone().try_into().unwrap()), 5);
        apply(AtomicDatatype::Uint32, AtomicOp::Cswap, &mut target, &operand, &5u32.to_le_bytes());
        assert_eq!(u32::from_le_bytes(target.try_into().unwrap()), 9);
    }

    #[test]
    fn test_apply_signed_min() {
        let mut target = (-3i32).to_le_bytes().to_vec();
        let operand = (-9i32).to_le_bytes().to_vec();
        apply(AtomicDatatype::Int32, AtomicOp::Min, &mut target, &operand, &[]);
        assert_eq!(i32::from_le_bytes(target.try_into().unwrap()), -9);
    }

    #[test]
    fn test_wire_mappings() {
        assert_eq!(AtomicDatatype::from_wire(5), Ok(AtomicDatatype::Uint32));
        assert_eq!(AtomicDatatype::from_wire(99), Err(RdmError::NotSupported));
        assert_eq!(AtomicOp::from_wire(12), Ok(AtomicOp::Cswap));
        assert_eq!(AtomicOp::from_wire(3), Err(RdmError::NotSupported));
        assert_eq!(AtomicDatatype::Uint32.size(), 4);
        assert_eq!(AtomicDatatype::Int64.size(), 8);
    }
}
