//! Control and data packet headers (types 3..=10).
//!
//! These are the follow-up packets of the sub-protocols: flow-control
//! grants, data segments, read/atomic responses, transfer terminators, and
//! the handshake. Each type embeds an optional trailing connid gated by the
//! `PKT_CONNID_HDR` flag bit.

use super::{BaseHeader, Reader, Writer, flags, pkt_type};
use crate::error::{RdmError, RdmResult};

fn connid_flag(connid: Option<u32>) -> u16 {
    if connid.is_some() { flags::PKT_CONNID_HDR } else { 0 }
}

fn put_connid(connid: Option<u32>, w: &mut Writer<'_>) -> RdmResult<()> {
    match connid {
        Some(id) => w.put_u32(id),
        None => Ok(()),
    }
}

fn get_connid(pkt_flags: u16, r: &mut Reader<'_>) -> RdmResult<Option<u32>> {
    if pkt_flags & flags::PKT_CONNID_HDR != 0 { Ok(Some(r.u32()?)) } else { Ok(None) }
}

/// HANDSHAKE: advertises the endpoint's extra-feature/request bitmap.
///
/// The wire carries `nex_p3` = number of exinfo u64s plus 3. The +3 is
/// historical skew from a retired header revision and is preserved verbatim
/// for wire compatibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeHdr {
    pub exinfo: Vec<u64>,
    pub connid: Option<u32>,
}

impl HandshakeHdr {
    pub fn wire_len(&self) -> usize {
        BaseHeader::SIZE + 4 + self.exinfo.len() * 8 + if self.connid.is_some() { 4 } else { 0 }
    }

    pub fn encode(&self, buf: &mut [u8]) -> RdmResult<usize> {
        let base = BaseHeader::new(pkt_type::HANDSHAKE, connid_flag(self.connid));
        let mut w = Writer::new(buf);
        base.encode(&mut w)?;
        w.put_u32(self.exinfo.len() as u32 + 3)?;
        for word in &self.exinfo {
            w.put_u64(*word)?;
        }
        put_connid(self.connid, &mut w)?;
        Ok(w.pos())
    }

    pub(crate) fn decode(base: BaseHeader, r: &mut Reader<'_>) -> RdmResult<Self> {
        let nex_p3 = r.u32()?;
        if nex_p3 < 3 {
            return Err(RdmError::InvalidArg);
        }
        let count = (nex_p3 - 3) as usize;
        let mut exinfo = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            exinfo.push(r.u64()?);
        }
        Ok(Self { exinfo, connid: get_connid(base.flags, r)? })
    }
}

/// CTS: grants the sender a window of `recv_length` bytes. Always at least
/// one packet's worth, so a granted transfer can never stall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtsHdr {
    pub send_id: u32,
    pub recv_id: u32,
    pub recv_length: u64,
    pub connid: Option<u32>,
}

impl CtsHdr {
    pub fn wire_len(&self) -> usize {
        BaseHeader::SIZE + 4 + 4 + 4 + 8 + if self.connid.is_some() { 4 } else { 0 }
    }

    pub fn encode(&self, buf: &mut [u8]) -> RdmResult<usize> {
        let base = BaseHeader::new(pkt_type::CTS, connid_flag(self.connid));
        let mut w = Writer::new(buf);
        base.encode(&mut w)?;
        w.put_u32(0)?; // pad
        w.put_u32(self.send_id)?;
        w.put_u32(self.recv_id)?;
        w.put_u64(self.recv_length)?;
        put_connid(self.connid, &mut w)?;
        Ok(w.pos())
    }

    pub(crate) fn decode(base: BaseHeader, r: &mut Reader<'_>) -> RdmResult<Self> {
        let _pad = r.u32()?;
        let send_id = r.u32()?;
        let recv_id = r.u32()?;
        let recv_length = r.u64()?;
        Ok(Self { send_id, recv_id, recv_length, connid: get_connid(base.flags, r)? })
    }
}

/// DATA: one segment of a long-CTS flow, reassembled by offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHdr {
    pub recv_id: u32,
    pub data_length: u64,
    pub data_offset: u64,
    pub connid: Option<u32>,
}

impl DataHdr {
    pub fn wire_len(&self) -> usize {
        BaseHeader::SIZE + 4 + 8 + 8 + if self.connid.is_some() { 4 } else { 0 }
    }

    pub fn encode(&self, buf: &mut [u8]) -> RdmResult<usize> {
        let base = BaseHeader::new(pkt_type::DATA, connid_flag(self.connid));
        let mut w = Writer::new(buf);
        base.encode(&mut w)?;
        w.put_u32(self.recv_id)?;
        w.put_u64(self.data_length)?;
        w.put_u64(self.data_offset)?;
        put_connid(self.connid, &mut w)?;
        Ok(w.pos())
    }

    pub(crate) fn decode(base: BaseHeader, r: &mut Reader<'_>) -> RdmResult<Self> {
        let recv_id = r.u32()?;
        let data_length = r.u64()?;
        let data_offset = r.u64()?;
        Ok(Self { recv_id, data_length, data_offset, connid: get_connid(base.flags, r)? })
    }
}

/// READRSP / ATOMRSP: responder-to-requester payload of an emulated read or
/// fetching atomic. Same layout, distinguished by packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RspHdr {
    pub send_id: u32,
    pub recv_id: u32,
    pub data_length: u64,
    pub connid: Option<u32>,
}

impl RspHdr {
    pub fn wire_len(&self) -> usize {
        BaseHeader::SIZE + 4 + 4 + 4 + 8 + if self.connid.is_some() { 4 } else { 0 }
    }

    pub fn encode(&self, typ: u8, buf: &mut [u8]) -> RdmResult<usize> {
        debug_assert!(matches!(typ, pkt_type::READRSP | pkt_type::ATOMRSP));
        let base = BaseHeader::new(typ, connid_flag(self.connid));
        let mut w = Writer::new(buf);
        base.encode(&mut w)?;
        w.put_u32(0)?; // pad
        w.put_u32(self.send_id)?;
        w.put_u32(self.recv_id)?;
        w.put_u64(self.data_length)?;
        put_connid(self.connid, &mut w)?;
        Ok(w.pos())
    }

    pub(crate) fn decode(base: BaseHeader, r: &mut Reader<'_>) -> RdmResult<Self> {
        let _pad = r.u32()?;
        let send_id = r.u32()?;
        let recv_id = r.u32()?;
        let data_length = r.u64()?;
        Ok(Self { send_id, recv_id, data_length, connid: get_connid(base.flags, r)? })
    }
}

/// EOR: all RDMA reads of a long-read transfer have completed; the sender
/// may release its registrations and complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EorHdr {
    pub send_id: u32,
    pub recv_id: u32,
    pub connid: Option<u32>,
}

impl EorHdr {
    pub fn wire_len(&self) -> usize {
        BaseHeader::SIZE + 4 + 4 + if self.connid.is_some() { 4 } else { 0 }
    }

    pub fn encode(&self, buf: &mut [u8]) -> RdmResult<usize> {
        let base = BaseHeader::new(pkt_type::EOR, connid_flag(self.connid));
        let mut w = Writer::new(buf);
        base.encode(&mut w)?;
        w.put_u32(self.send_id)?;
        w.put_u32(self.recv_id)?;
        put_connid(self.connid, &mut w)?;
        Ok(w.pos())
    }

    pub(crate) fn decode(base: BaseHeader, r: &mut Reader<'_>) -> RdmResult<Self> {
        let send_id = r.u32()?;
        let recv_id = r.u32()?;
        Ok(Self { send_id, recv_id, connid: get_connid(base.flags, r)? })
    }
}

/// RECEIPT: delivery-complete acknowledgement, sent after the payload has
/// landed in the application buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptHdr {
    pub send_id: u32,
    pub msg_id: u32,
    pub connid: Option<u32>,
}

impl ReceiptHdr {
    pub fn wire_len(&self) -> usize {
        BaseHeader::SIZE + 4 + 4 + 4 + if self.connid.is_some() { 4 } else { 0 }
    }

    pub fn encode(&self, buf: &mut [u8]) -> RdmResult<usize> {
        let base = BaseHeader::new(pkt_type::RECEIPT, connid_flag(self.connid));
        let mut w = Writer::new(buf);
        base.encode(&mut w)?;
        w.put_u32(self.send_id)?;
        w.put_u32(self.msg_id)?;
        w.put_u32(0)?; // pad
        put_connid(self.connid, &mut w)?;
        Ok(w.pos())
    }

    pub(crate) fn decode(base: BaseHeader, r: &mut Reader<'_>) -> RdmResult<Self> {
        let send_id = r.u32()?;
        let msg_id = r.u32()?;
        let _pad = r.u32()?;
        Ok(Self { send_id, msg_id, connid: get_connid(base.flags, r)? })
    }
}

/// Decoded view of a received control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtrlView {
    Handshake(HandshakeHdr),
    Cts(CtsHdr),
    Data(DataHdr),
    ReadRsp(RspHdr),
    AtomRsp(RspHdr),
    Eor(EorHdr),
    Receipt(ReceiptHdr),
}

impl CtrlView {
    pub fn connid(&self) -> Option<u32> {
        match self {
            CtrlView::Handshake(h) => h.connid,
            CtrlView::Cts(h) => h.connid,
            CtrlView::Data(h) => h.connid,
            CtrlView::ReadRsp(h) | CtrlView::AtomRsp(h) => h.connid,
            CtrlView::Eor(h) => h.connid,
            CtrlView::Receipt(h) => h.connid,
        }
    }
}

/// Decode a control packet, returning the view and the payload offset
/// (meaningful for DATA/READRSP/ATOMRSP).
pub fn decode_ctrl(bytes: &[u8]) -> RdmResult<(CtrlView, usize)> {
    let mut r = Reader::new(bytes);
    let base = BaseHeader::decode(&mut r)?;
    let view = match base.typ {
        pkt_type::HANDSHAKE => CtrlView::Handshake(HandshakeHdr::decode(base, &mut r)?),
        pkt_type::CTS => CtrlView::Cts(CtsHdr::decode(base, &mut r)?),
        pkt_type::DATA => CtrlView::Data(DataHdr::decode(base, &mut r)?),
        pkt_type::READRSP => CtrlView::ReadRsp(RspHdr::decode(base, &mut r)?),
        pkt_type::ATOMRSP => CtrlView::AtomRsp(RspHdr::decode(base, &mut r)?),
        pkt_type::EOR => CtrlView::Eor(EorHdr::decode(base, &mut r)?),
        pkt_type::RECEIPT => CtrlView::Receipt(ReceiptHdr::decode(base, &mut r)?),
        _ => return Err(RdmError::InvalidArg),
    };
    Ok((view, r.pos()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_roundtrip() {
        let hdr = HandshakeHdr { exinfo: vec![0b1011], connid: Some(0x5544aabb) };
        let mut buf = [0u8; 64];
        let len = hdr.encode(&mut buf).unwrap();
        assert_eq!(len, hdr.wire_len());
        // nex_p3 carries the +3 skew
        assert_eq!(u32::from_le_bytes(buf[4..8].try_into().unwrap()), 4);

        let (view, _) = decode_ctrl(&buf[..len]).unwrap();
        assert_eq!(view, CtrlView::Handshake(hdr));
    }

    #[test]
    fn test_handshake_bad_nex() {
        // nex_p3 = 2 is below the historical floor
        let buf = [pkt_type::HANDSHAKE, 4, 0, 0, 2, 0, 0, 0];
        assert!(decode_ctrl(&buf).is_err());
    }

    #[test]
    fn test_cts_roundtrip() {
        let hdr = CtsHdr { send_id: 1, recv_id: 2, recv_length: 1 << 20, connid: None };
        let mut buf = [0u8; 64];
        let len = hdr.encode(&mut buf).unwrap();
        assert_eq!(len, hdr.wire_len());
        let (view, off) = decode_ctrl(&buf[..len]).unwrap();
        assert_eq!(view, CtrlView::Cts(hdr));
        assert_eq!(off, len);
    }

    #[test]
    fn test_data_roundtrip_with_connid() {
        let hdr = DataHdr { recv_id: 3, data_length: 8000, data_offset: 16000, connid: Some(9) };
        let mut buf = [0u8; 64];
        let len = hdr.encode(&mut buf).unwrap();
        let (view, off) = decode_ctrl(&buf[..len]).unwrap();
        assert_eq!(view, CtrlView::Data(hdr));
        assert_eq!(off, hdr.wire_len());
    }

    #[test]
    fn test_eor_receipt_rsp_roundtrip() {
        let eor = EorHdr { send_id: 5, recv_id: 6, connid: Some(0xffffffff) };
        let mut buf = [0u8; 64];
        let len = eor.encode(&mut buf).unwrap();
        assert_eq!(decode_ctrl(&buf[..len]).unwrap().0, CtrlView::Eor(eor));

        let rcpt = ReceiptHdr { send_id: 7, msg_id: 8, connid: None };
        let len = rcpt.encode(&mut buf).unwrap();
        assert_eq!(decode_ctrl(&buf[..len]).unwrap().0, CtrlView::Receipt(rcpt));

        let rsp = RspHdr { send_id: 9, recv_id: 10, data_length: 64, connid: None };
        let len = rsp.encode(pkt_type::READRSP, &mut buf).unwrap();
        assert_eq!(decode_ctrl(&buf[..len]).unwrap().0, CtrlView::ReadRsp(rsp));
        let len = rsp.encode(pkt_type::ATOMRSP, &mut buf).unwrap();
        assert_eq!(decode_ctrl(&buf[..len]).unwrap().0, CtrlView::AtomRsp(rsp));
    }
}
