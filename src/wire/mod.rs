//! Packet codec: base header, optional headers, and the per-type mandatory
//! headers of every packet family.
//!
//! All wire fields are packed little-endian. The codec encodes into and
//! decodes from space borrowed from a packet entry; it never allocates the
//! payload buffer itself.

pub mod ctrl;
pub mod req;

use crate::addr::{RAW_ADDR_SIZE, RawAddress};
use crate::config::PROTOCOL_VERSION;
use crate::error::{RdmError, RdmResult};

// =============================================================================
// PACKET TYPE NAMESPACE
// =============================================================================
// Types 3..=10 are control/data packets; types >= 64 are REQ packets, the
// initial packet of a sub-protocol. REQ types at or above EXTRA_REQ_BASE
// require the matching peer extra feature.

pub mod pkt_type {
    pub const HANDSHAKE: u8 = 3;
    pub const CTS: u8 = 4;
    pub const DATA: u8 = 5;
    pub const READRSP: u8 = 6;
    pub const EOR: u8 = 8;
    pub const ATOMRSP: u8 = 9;
    pub const RECEIPT: u8 = 10;

    pub const REQ_BASE: u8 = 64;

    pub const EAGER_MSGRTM: u8 = 64;
    pub const EAGER_TAGRTM: u8 = 65;
    pub const MEDIUM_MSGRTM: u8 = 66;
    pub const MEDIUM_TAGRTM: u8 = 67;
    pub const LONGCTS_MSGRTM: u8 = 68;
    pub const LONGCTS_TAGRTM: u8 = 69;
    pub const EAGER_RTW: u8 = 70;
    pub const LONGCTS_RTW: u8 = 71;
    pub const SHORT_RTR: u8 = 72;
    pub const LONGCTS_RTR: u8 = 73;
    pub const WRITE_RTA: u8 = 74;
    pub const FETCH_RTA: u8 = 75;
    pub const COMPARE_RTA: u8 = 76;

    pub const EXTRA_REQ_BASE: u8 = 128;

    pub const LONGREAD_MSGRTM: u8 = 128;
    pub const LONGREAD_TAGRTM: u8 = 129;
    pub const LONGREAD_RTW: u8 = 130;

    pub const DC_EAGER_MSGRTM: u8 = 133;
    pub const DC_EAGER_TAGRTM: u8 = 134;
    pub const DC_MEDIUM_MSGRTM: u8 = 135;
    pub const DC_MEDIUM_TAGRTM: u8 = 136;
    pub const DC_LONGCTS_MSGRTM: u8 = 137;
    pub const DC_LONGCTS_TAGRTM: u8 = 138;
    pub const DC_EAGER_RTW: u8 = 139;
    pub const DC_LONGCTS_RTW: u8 = 140;
    pub const DC_WRITE_RTA: u8 = 141;
    pub const DC_LONGREAD_MSGRTM: u8 = 142;
    pub const DC_LONGREAD_TAGRTM: u8 = 143;
}

pub mod flags {
    /// REQ optional raw-address header present.
    pub const REQ_OPT_RAW_ADDR: u16 = 0x01;
    /// REQ optional 8-byte CQ-data header present.
    pub const REQ_OPT_CQ_DATA: u16 = 0x02;
    /// Untagged message operation.
    pub const REQ_MSG: u16 = 0x04;
    /// Tagged message operation.
    pub const REQ_TAGGED: u16 = 0x08;
    /// RMA operation.
    pub const REQ_RMA: u16 = 0x10;
    /// Atomic operation.
    pub const REQ_ATOMIC: u16 = 0x20;
    /// Connid header present. REQ packets carry it as the third optional
    /// header; control packets carry it as a trailing u32.
    pub const PKT_CONNID_HDR: u16 = 0x40;
}

pub fn is_req(typ: u8) -> bool {
    typ >= pkt_type::REQ_BASE
}

pub fn is_tagged_req(typ: u8) -> bool {
    use pkt_type::*;
    matches!(
        typ,
        EAGER_TAGRTM
            | MEDIUM_TAGRTM
            | LONGCTS_TAGRTM
            | LONGREAD_TAGRTM
            | DC_EAGER_TAGRTM
            | DC_MEDIUM_TAGRTM
            | DC_LONGCTS_TAGRTM
            | DC_LONGREAD_TAGRTM
    )
}

/// Delivery-complete variants: the receiver must send a RECEIPT once the
/// payload has landed in the application buffer.
pub fn is_dc(typ: u8) -> bool {
    use pkt_type::*;
    matches!(
        typ,
        DC_EAGER_MSGRTM
            | DC_EAGER_TAGRTM
            | DC_MEDIUM_MSGRTM
            | DC_MEDIUM_TAGRTM
            | DC_LONGCTS_MSGRTM
            | DC_LONGCTS_TAGRTM
            | DC_EAGER_RTW
            | DC_LONGCTS_RTW
            | DC_WRITE_RTA
            | DC_LONGREAD_MSGRTM
            | DC_LONGREAD_TAGRTM
    )
}

/// Operation-class flag bits implied by a REQ packet type.
pub fn req_class_flags(typ: u8) -> u16 {
    use pkt_type::*;
    let tagged = is_tagged_req(typ);
    match typ {
        EAGER_MSGRTM | MEDIUM_MSGRTM | LONGCTS_MSGRTM | LONGREAD_MSGRTM | DC_EAGER_MSGRTM
        | DC_MEDIUM_MSGRTM | DC_LONGCTS_MSGRTM | DC_LONGREAD_MSGRTM => flags::REQ_MSG,
        _ if tagged => flags::REQ_TAGGED,
        EAGER_RTW | LONGCTS_RTW | LONGREAD_RTW | SHORT_RTR | LONGCTS_RTR | DC_EAGER_RTW
        | DC_LONGCTS_RTW => flags::REQ_RMA,
        WRITE_RTA | FETCH_RTA | COMPARE_RTA | DC_WRITE_RTA => flags::REQ_ATOMIC,
        _ => 0,
    }
}

// =============================================================================
// CURSORS
// =============================================================================

pub(crate) struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn need(&self, n: usize) -> RdmResult<()> {
        if self.pos + n > self.buf.len() { Err(RdmError::InvalidArg) } else { Ok(()) }
    }

    pub fn put_u8(&mut self, v: u8) -> RdmResult<()> {
        self.need(1)?;
        self.buf[self.pos] = v;
        self.pos += 1;
        Ok(())
    }

    pub fn put_u16(&mut self, v: u16) -> RdmResult<()> {
        self.need(2)?;
        self.buf[self.pos..self.pos + 2].copy_from_slice(&v.to_le_bytes());
        self.pos += 2;
        Ok(())
    }

    pub fn put_u32(&mut self, v: u32) -> RdmResult<()> {
        self.need(4)?;
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
        Ok(())
    }

    pub fn put_u64(&mut self, v: u64) -> RdmResult<()> {
        self.need(8)?;
        self.buf[self.pos..self.pos + 8].copy_from_slice(&v.to_le_bytes());
        self.pos += 8;
        Ok(())
    }

    pub fn put_bytes(&mut self, v: &[u8]) -> RdmResult<()> {
        self.need(v.len())?;
        self.buf[self.pos..self.pos + v.len()].copy_from_slice(v);
        self.pos += v.len();
        Ok(())
    }

    pub fn pos(&self) -> usize {
        self.pos
    }
}

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn need(&self, n: usize) -> RdmResult<()> {
        if self.pos + n > self.buf.len() { Err(RdmError::InvalidArg) } else { Ok(()) }
    }

    pub fn u8(&mut self) -> RdmResult<u8> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn u16(&mut self) -> RdmResult<u16> {
        self.need(2)?;
        let v = u16::from_le_bytes(self.buf[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        Ok(v)
    }

    pub fn u32(&mut self) -> RdmResult<u32> {
        self.need(4)?;
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    pub fn u64(&mut self) -> RdmResult<u64> {
        self.need(8)?;
        let v = u64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    pub fn take(&mut self, n: usize) -> RdmResult<&'a [u8]> {
        self.need(n)?;
        let v = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(v)
    }

    pub fn pos(&self) -> usize {
        self.pos
    }
}

// =============================================================================
// BASE HEADER
// =============================================================================

/// 4-byte header at the front of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseHeader {
    pub typ: u8,
    pub version: u8,
    pub flags: u16,
}

impl BaseHeader {
    pub const SIZE: usize = 4;

    pub fn new(typ: u8, flags: u16) -> Self {
        Self { typ, version: PROTOCOL_VERSION, flags }
    }

    pub(crate) fn encode(&self, w: &mut Writer<'_>) -> RdmResult<()> {
        w.put_u8(self.typ)?;
        w.put_u8(self.version)?;
        w.put_u16(self.flags)
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> RdmResult<Self> {
        let typ = r.u8()?;
        let version = r.u8()?;
        let flags = r.u16()?;
        if version != PROTOCOL_VERSION {
            return Err(RdmError::InvalidArg);
        }
        Ok(Self { typ, version, flags })
    }
}

// =============================================================================
// REQ OPTIONAL HEADERS
// =============================================================================

/// The three REQ optional headers, in their fixed wire order: raw address,
/// CQ data, connid. Presence is signaled by base-header flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReqOptHdrs {
    pub raw_addr: Option<RawAddress>,
    pub cq_data: Option<u64>,
    pub connid: Option<u32>,
}

impl ReqOptHdrs {
    pub fn flag_bits(&self) -> u16 {
        let mut f = 0;
        if self.raw_addr.is_some() {
            f |= flags::REQ_OPT_RAW_ADDR;
        }
        if self.cq_data.is_some() {
            f |= flags::REQ_OPT_CQ_DATA;
        }
        if self.connid.is_some() {
            f |= flags::PKT_CONNID_HDR;
        }
        f
    }

    pub fn wire_len(&self) -> usize {
        let mut n = 0;
        if self.raw_addr.is_some() {
            n += 4 + RAW_ADDR_SIZE;
        }
        if self.cq_data.is_some() {
            n += 8;
        }
        if self.connid.is_some() {
            n += 4;
        }
        n
    }

    pub(crate) fn encode(&self, w: &mut Writer<'_>) -> RdmResult<()> {
        if let Some(raw) = &self.raw_addr {
            w.put_u32(RAW_ADDR_SIZE as u32)?;
            w.put_bytes(&raw.to_bytes())?;
        }
        if let Some(data) = self.cq_data {
            w.put_u64(data)?;
        }
        if let Some(connid) = self.connid {
            w.put_u32(connid)?;
        }
        Ok(())
    }

    pub(crate) fn decode(r: &mut Reader<'_>, pkt_flags: u16) -> RdmResult<Self> {
        let mut out = Self::default();
        if pkt_flags & flags::REQ_OPT_RAW_ADDR != 0 {
            let size = r.u32()? as usize;
            let bytes = r.take(size)?;
            out.raw_addr = Some(RawAddress::from_bytes(bytes)?);
        }
        if pkt_flags & flags::REQ_OPT_CQ_DATA != 0 {
            out.cq_data = Some(r.u64()?);
        }
        if pkt_flags & flags::PKT_CONNID_HDR != 0 {
            out.connid = Some(r.u32()?);
        }
        Ok(out)
    }
}

// =============================================================================
// RMA IOV
// =============================================================================

/// 24-byte wire descriptor of one registered remote region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmaIov {
    pub addr: u64,
    pub len: u64,
    pub key: u64,
}

impl RmaIov {
    pub const SIZE: usize = 24;

    pub(crate) fn encode(&self, w: &mut Writer<'_>) -> RdmResult<()> {
        w.put_u64(self.addr)?;
        w.put_u64(self.len)?;
        w.put_u64(self.key)
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> RdmResult<Self> {
        Ok(Self { addr: r.u64()?, len: r.u64()?, key: r.u64()? })
    }
}

pub(crate) fn encode_iov_array(iov: &[RmaIov], w: &mut Writer<'_>) -> RdmResult<()> {
    for e in iov {
        e.encode(w)?;
    }
    Ok(())
}

pub(crate) fn decode_iov_array(r: &mut Reader<'_>, count: usize) -> RdmResult<Vec<RmaIov>> {
    // count is attacker-controlled; bound it by what the buffer can hold
    if count > r.buf.len().saturating_sub(r.pos) / RmaIov::SIZE {
        return Err(RdmError::InvalidArg);
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(RmaIov::decode(r)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Gid;

    #[test]
    fn test_base_header_roundtrip() {
        let hdr = BaseHeader::new(pkt_type::EAGER_MSGRTM, flags::REQ_MSG | flags::REQ_OPT_RAW_ADDR);
        let mut buf = [0u8; 4];
        let mut w = Writer::new(&mut buf);
        hdr.encode(&mut w).unwrap();
        let mut r = Reader::new(&buf);
        assert_eq!(BaseHeader::decode(&mut r).unwrap(), hdr);
    }

    #[test]
    fn test_base_header_bad_version() {
        let buf = [pkt_type::CTS, 3, 0, 0];
        let mut r = Reader::new(&buf);
        assert_eq!(BaseHeader::decode(&mut r), Err(RdmError::InvalidArg));
    }

    #[test]
    fn test_opt_hdrs_roundtrip() {
        let opt = ReqOptHdrs {
            raw_addr: Some(RawAddress::new(Gid([9; 16]), 42, 0x01020304)),
            cq_data: Some(0xfeedface),
            connid: Some(0xabcd0123),
        };
        let mut buf = [0u8; 64];
        let mut w = Writer::new(&mut buf);
        opt.encode(&mut w).unwrap();
        assert_eq!(w.pos(), opt.wire_len());

        let mut r = Reader::new(&buf);
        let decoded = ReqOptHdrs::decode(&mut r, opt.flag_bits()).unwrap();
        assert_eq!(decoded, opt);
    }

    #[test]
    fn test_opt_hdrs_partial() {
        let opt = ReqOptHdrs { raw_addr: None, cq_data: None, connid: Some(7) };
        assert_eq!(opt.flag_bits(), flags::PKT_CONNID_HDR);
        assert_eq!(opt.wire_len(), 4);
    }

    #[test]
    fn test_req_class_flags() {
        assert_eq!(req_class_flags(pkt_type::EAGER_MSGRTM), flags::REQ_MSG);
        assert_eq!(req_class_flags(pkt_type::MEDIUM_TAGRTM), flags::REQ_TAGGED);
        assert_eq!(req_class_flags(pkt_type::LONGCTS_RTW), flags::REQ_RMA);
        assert_eq!(req_class_flags(pkt_type::COMPARE_RTA), flags::REQ_ATOMIC);
        assert_eq!(req_class_flags(pkt_type::DC_LONGREAD_TAGRTM), flags::REQ_TAGGED);
    }

    #[test]
    fn test_iov_array_count_bounded() {
        let buf = [0u8; 24];
        let mut r = Reader::new(&buf);
        assert!(decode_iov_array(&mut r, 2).is_err());
    }
}
