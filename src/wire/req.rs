//! Mandatory headers of REQ packets (types >= 64).
//!
//! A REQ packet is the initial packet of a sub-protocol: base header,
//! mandatory header, optional headers, payload. Payload length is never
//! carried for eager packets; it is derived from packet size minus header
//! length.

use super::{
    BaseHeader, Reader, ReqOptHdrs, RmaIov, Writer, decode_iov_array, encode_iov_array, is_dc,
    is_req, is_tagged_req, pkt_type, req_class_flags,
};
use crate::error::{RdmError, RdmResult};

/// Eager RTM: the whole message rides in one packet. DC variants carry the
/// sender's entry id for the RECEIPT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EagerRtmHdr {
    pub msg_id: u32,
    pub send_id: Option<u32>,
    pub tag: Option<u64>,
}

/// Medium RTM: one segment of a message split across a few packets,
/// reassembled by offset. `seg_length` is the full message length; the
/// segment's own length is derived from the packet size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediumRtmHdr {
    pub msg_id: u32,
    pub send_id: Option<u32>,
    pub seg_length: u64,
    pub seg_offset: u64,
    pub tag: Option<u64>,
}

/// Long-CTS RTM: first chunk plus the parameters of the credit loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongCtsRtmHdr {
    pub msg_id: u32,
    pub msg_length: u64,
    pub send_id: u32,
    pub credit_request: u32,
    pub tag: Option<u64>,
}

/// Long-read RTM: no payload; the receiver pulls the message by RDMA read
/// from the sender's registered regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongReadRtmHdr {
    pub msg_id: u32,
    pub msg_length: u64,
    pub send_id: u32,
    pub tag: Option<u64>,
    pub read_iov: Vec<RmaIov>,
}

/// Eager RTW: emulated write, payload embedded. DC variants carry the
/// sender's entry id for the RECEIPT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EagerRtwHdr {
    pub send_id: Option<u32>,
    pub rma_iov: Vec<RmaIov>,
}

/// Long-CTS RTW: same credit loop as the message flavor, no tag matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongCtsRtwHdr {
    pub msg_length: u64,
    pub send_id: u32,
    pub credit_request: u32,
    pub rma_iov: Vec<RmaIov>,
}

/// Long-read RTW: target regions on the responder, source regions on the
/// requester for the responder to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongReadRtwHdr {
    pub msg_length: u64,
    pub send_id: u32,
    pub rma_iov: Vec<RmaIov>,
    pub read_iov: Vec<RmaIov>,
}

/// RTR: the requester asks the responder to send the described regions
/// back, via READRSP (short) or a DATA flow (longcts).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtrHdr {
    pub recv_id: u32,
    pub recv_length: u64,
    pub rma_iov: Vec<RmaIov>,
}

/// RTA: atomic request. Operands follow as payload. FETCH/COMPARE carry the
/// requester's entry id for the ATOMRSP; DC_WRITE carries the sender's
/// entry id for the RECEIPT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtaHdr {
    pub msg_id: u32,
    pub datatype: u32,
    pub op: u32,
    pub recv_id: Option<u32>,
    pub rma_iov: Vec<RmaIov>,
}

fn rta_has_recv_id(typ: u8) -> bool {
    matches!(typ, pkt_type::FETCH_RTA | pkt_type::COMPARE_RTA | pkt_type::DC_WRITE_RTA)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReqHdr {
    EagerRtm(EagerRtmHdr),
    MediumRtm(MediumRtmHdr),
    LongCtsRtm(LongCtsRtmHdr),
    LongReadRtm(LongReadRtmHdr),
    EagerRtw(EagerRtwHdr),
    LongCtsRtw(LongCtsRtwHdr),
    LongReadRtw(LongReadRtwHdr),
    Rtr(RtrHdr),
    Rta(RtaHdr),
}

impl ReqHdr {
    /// Mandatory-header wire length for packet type `typ`.
    pub fn wire_len(&self, typ: u8) -> usize {
        let tag_len = if is_tagged_req(typ) { 8 } else { 0 };
        match self {
            ReqHdr::EagerRtm(h) => 4 + if h.send_id.is_some() { 4 } else { 0 } + tag_len,
            ReqHdr::MediumRtm(h) => {
                4 + if h.send_id.is_some() { 4 } else { 0 } + 8 + 8 + tag_len
            }
            ReqHdr::LongCtsRtm(_) => 4 + 8 + 4 + 4 + tag_len,
            ReqHdr::LongReadRtm(h) => 4 + 8 + 4 + 4 + tag_len + h.read_iov.len() * RmaIov::SIZE,
            ReqHdr::EagerRtw(h) => {
                4 + if h.send_id.is_some() { 4 } else { 0 } + h.rma_iov.len() * RmaIov::SIZE
            }
            ReqHdr::LongCtsRtw(h) => 4 + 8 + 4 + 4 + h.rma_iov.len() * RmaIov::SIZE,
            ReqHdr::LongReadRtw(h) => {
                4 + 8 + 4 + 4 + (h.rma_iov.len() + h.read_iov.len()) * RmaIov::SIZE
            }
            ReqHdr::Rtr(h) => 4 + 4 + 8 + h.rma_iov.len() * RmaIov::SIZE,
            ReqHdr::Rta(h) => {
                4 + 4 + 4 + 4
                    + if h.recv_id.is_some() { 4 } else { 0 }
                    + h.rma_iov.len() * RmaIov::SIZE
            }
        }
    }
}

fn put_tag(typ: u8, tag: Option<u64>, w: &mut Writer<'_>) -> RdmResult<()> {
    match (is_tagged_req(typ), tag) {
        (true, Some(t)) => w.put_u64(t),
        (false, None) => Ok(()),
        _ => Err(RdmError::InvalidArg),
    }
}

fn get_tag(typ: u8, r: &mut Reader<'_>) -> RdmResult<Option<u64>> {
    if is_tagged_req(typ) { Ok(Some(r.u64()?)) } else { Ok(None) }
}

/// Total header length (base + mandatory + optional) for a REQ packet.
pub fn req_hdr_len(typ: u8, hdr: &ReqHdr, opt: &ReqOptHdrs) -> usize {
    BaseHeader::SIZE + hdr.wire_len(typ) + opt.wire_len()
}

/// Encode a REQ packet's headers into `buf`, returning the payload offset.
pub fn encode_req(typ: u8, hdr: &ReqHdr, opt: &ReqOptHdrs, buf: &mut [u8]) -> RdmResult<usize> {
    debug_assert!(is_req(typ));
    let base = BaseHeader::new(typ, req_class_flags(typ) | opt.flag_bits());
    let mut w = Writer::new(buf);
    base.encode(&mut w)?;
    match hdr {
        ReqHdr::EagerRtm(h) => {
            debug_assert_eq!(h.send_id.is_some(), is_dc(typ));
            w.put_u32(h.msg_id)?;
            if let Some(send_id) = h.send_id {
                w.put_u32(send_id)?;
            }
            put_tag(typ, h.tag, &mut w)?;
        }
        ReqHdr::MediumRtm(h) => {
            debug_assert_eq!(h.send_id.is_some(), is_dc(typ));
            w.put_u32(h.msg_id)?;
            if let Some(send_id) = h.send_id {
                w.put_u32(send_id)?;
            }
            w.put_u64(h.seg_length)?;
            w.put_u64(h.seg_offset)?;
            put_tag(typ, h.tag, &mut w)?;
        }
        ReqHdr::LongCtsRtm(h) => {
            w.put_u32(h.msg_id)?;
            w.put_u64(h.msg_length)?;
            w.put_u32(h.send_id)?;
            w.put_u32(h.credit_request)?;
            put_tag(typ, h.tag, &mut w)?;
        }
        ReqHdr::LongReadRtm(h) => {
            w.put_u32(h.msg_id)?;
            w.put_u64(h.msg_length)?;
            w.put_u32(h.send_id)?;
            w.put_u32(h.read_iov.len() as u32)?;
            put_tag(typ, h.tag, &mut w)?;
            encode_iov_array(&h.read_iov, &mut w)?;
        }
        ReqHdr::EagerRtw(h) => {
            debug_assert_eq!(h.send_id.is_some(), is_dc(typ));
            w.put_u32(h.rma_iov.len() as u32)?;
            if let Some(send_id) = h.send_id {
                w.put_u32(send_id)?;
            }
            encode_iov_array(&h.rma_iov, &mut w)?;
        }
        ReqHdr::LongCtsRtw(h) => {
            w.put_u32(h.rma_iov.len() as u32)?;
            w.put_u64(h.msg_length)?;
            w.put_u32(h.send_id)?;
            w.put_u32(h.credit_request)?;
            encode_iov_array(&h.rma_iov, &mut w)?;
        }
        ReqHdr::LongReadRtw(h) => {
            w.put_u32(h.rma_iov.len() as u32)?;
            w.put_u64(h.msg_length)?;
            w.put_u32(h.send_id)?;
            w.put_u32(h.read_iov.len() as u32)?;
            encode_iov_array(&h.rma_iov, &mut w)?;
            encode_iov_array(&h.read_iov, &mut w)?;
        }
        ReqHdr::Rtr(h) => {
            w.put_u32(h.rma_iov.len() as u32)?;
            w.put_u32(h.recv_id)?;
            w.put_u64(h.recv_length)?;
            encode_iov_array(&h.rma_iov, &mut w)?;
        }
        ReqHdr::Rta(h) => {
            debug_assert_eq!(h.recv_id.is_some(), rta_has_recv_id(typ));
            w.put_u32(h.rma_iov.len() as u32)?;
            w.put_u32(h.msg_id)?;
            w.put_u32(h.datatype)?;
            w.put_u32(h.op)?;
            if let Some(recv_id) = h.recv_id {
                w.put_u32(recv_id)?;
            }
            encode_iov_array(&h.rma_iov, &mut w)?;
        }
    }
    opt.encode(&mut w)?;
    Ok(w.pos())
}

/// Decoded view of a received REQ packet. `payload_off` points into the
/// packet buffer the view was decoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqView {
    pub base: BaseHeader,
    pub hdr: ReqHdr,
    pub opt: ReqOptHdrs,
    pub payload_off: usize,
}

pub fn decode_req(bytes: &[u8]) -> RdmResult<ReqView> {
    let mut r = Reader::new(bytes);
    let base = BaseHeader::decode(&mut r)?;
    if !is_req(base.typ) {
        return Err(RdmError::InvalidArg);
    }
    let typ = base.typ;
    use pkt_type::*;
    let hdr = match typ {
        EAGER_MSGRTM | EAGER_TAGRTM | DC_EAGER_MSGRTM | DC_EAGER_TAGRTM => {
            let msg_id = r.u32()?;
            let send_id = if is_dc(typ) { Some(r.u32()?) } else { None };
            ReqHdr::EagerRtm(EagerRtmHdr { msg_id, send_id, tag: get_tag(typ, &mut r)? })
        }
        MEDIUM_MSGRTM | MEDIUM_TAGRTM | DC_MEDIUM_MSGRTM | DC_MEDIUM_TAGRTM => {
            let msg_id = r.u32()?;
            let send_id = if is_dc(typ) { Some(r.u32()?) } else { None };
            let seg_length = r.u64()?;
            let seg_offset = r.u64()?;
            ReqHdr::MediumRtm(MediumRtmHdr {
                msg_id,
                send_id,
                seg_length,
                seg_offset,
                tag: get_tag(typ, &mut r)?,
            })
        }
        LONGCTS_MSGRTM | LONGCTS_TAGRTM | DC_LONGCTS_MSGRTM | DC_LONGCTS_TAGRTM => {
            let msg_id = r.u32()?;
            let msg_length = r.u64()?;
            let send_id = r.u32()?;
            let credit_request = r.u32()?;
            ReqHdr::LongCtsRtm(LongCtsRtmHdr {
                msg_id,
                msg_length,
                send_id,
                credit_request,
                tag: get_tag(typ, &mut r)?,
            })
        }
        LONGREAD_MSGRTM | LONGREAD_TAGRTM | DC_LONGREAD_MSGRTM | DC_LONGREAD_TAGRTM => {
            let msg_id = r.u32()?;
            let msg_length = r.u64()?;
            let send_id = r.u32()?;
            let read_iov_count = r.u32()? as usize;
            let tag = get_tag(typ, &mut r)?;
            let read_iov = decode_iov_array(&mut r, read_iov_count)?;
            ReqHdr::LongReadRtm(LongReadRtmHdr { msg_id, msg_length, send_id, tag, read_iov })
        }
        EAGER_RTW | DC_EAGER_RTW => {
            let rma_iov_count = r.u32()? as usize;
            let send_id = if is_dc(typ) { Some(r.u32()?) } else { None };
            let rma_iov = decode_iov_array(&mut r, rma_iov_count)?;
            ReqHdr::EagerRtw(EagerRtwHdr { send_id, rma_iov })
        }
        LONGCTS_RTW | DC_LONGCTS_RTW => {
            let rma_iov_count = r.u32()? as usize;
            let msg_length = r.u64()?;
            let send_id = r.u32()?;
            let credit_request = r.u32()?;
            let rma_iov = decode_iov_array(&mut r, rma_iov_count)?;
            ReqHdr::LongCtsRtw(LongCtsRtwHdr { msg_length, send_id, credit_request, rma_iov })
        }
        LONGREAD_RTW => {
            let rma_iov_count = r.u32()? as usize;
            let msg_length = r.u64()?;
            let send_id = r.u32()?;
            let read_iov_count = r.u32()? as usize;
            let rma_iov = decode_iov_array(&mut r, rma_iov_count)?;
            let read_iov = decode_iov_array(&mut r, read_iov_count)?;
            ReqHdr::LongReadRtw(LongReadRtwHdr { msg_length, send_id, rma_iov, read_iov })
        }
        SHORT_RTR | LONGCTS_RTR => {
            let rma_iov_count = r.u32()? as usize;
            let recv_id = r.u32()?;
            let recv_length = r.u64()?;
            let rma_iov = decode_iov_array(&mut r, rma_iov_count)?;
            ReqHdr::Rtr(RtrHdr { recv_id, recv_length, rma_iov })
        }
        WRITE_RTA | FETCH_RTA | COMPARE_RTA | DC_WRITE_RTA => {
            let rma_iov_count = r.u32()? as usize;
            let msg_id = r.u32()?;
            let datatype = r.u32()?;
            let op = r.u32()?;
            let recv_id = if rta_has_recv_id(typ) { Some(r.u32()?) } else { None };
            let rma_iov = decode_iov_array(&mut r, rma_iov_count)?;
            ReqHdr::Rta(RtaHdr { msg_id, datatype, op, recv_id, rma_iov })
        }
        _ => return Err(RdmError::InvalidArg),
    };
    let opt = ReqOptHdrs::decode(&mut r, base.flags)?;
    Ok(ReqView { base, hdr, opt, payload_off: r.pos() })
}
