//! Raw peer addresses and the stable handles the AV hands out

use crate::error::{RdmError, RdmResult};
use std::fmt;

/// Serialized size of a raw peer address.
pub const RAW_ADDR_SIZE: usize = 32;

/// Length of the shm peer name derived from a raw address.
pub const SHM_NAME_SIZE: usize = 18;

/// Stable opaque address handle given to the application by the AV.
/// Always a table index in this implementation.
pub type FiAddr = u64;

/// "Any source" receive address.
pub const FI_ADDR_UNSPEC: FiAddr = u64::MAX;

/// 128-bit IPv6-format identifier for a hardware port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Raw peer address: GID, queue pair number, and the random connection id
/// chosen at endpoint startup. Two peers sharing GID+QPN but differing in
/// connid denote a destroyed-and-recreated QP and must not be conflated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawAddress {
    pub gid: Gid,
    pub qpn: u16,
    pub connid: u32,
}

impl RawAddress {
    pub fn new(gid: Gid, qpn: u16, connid: u32) -> Self {
        Self { gid, qpn, connid }
    }

    /// Serialize to the 32-byte wire form:
    /// gid[16], qpn u16, pad u16, connid u32, reserved u64.
    pub fn to_bytes(&self) -> [u8; RAW_ADDR_SIZE] {
        let mut out = [0u8; RAW_ADDR_SIZE];
        out[..16].copy_from_slice(&self.gid.0);
        out[16..18].copy_from_slice(&self.qpn.to_le_bytes());
        // bytes 18..20 pad
        out[20..24].copy_from_slice(&self.connid.to_le_bytes());
        // bytes 24..32 reserved
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> RdmResult<Self> {
        if bytes.len() < RAW_ADDR_SIZE {
            return Err(RdmError::InvalidArg);
        }
        let mut gid = [0u8; 16];
        gid.copy_from_slice(&bytes[..16]);
        let qpn = u16::from_le_bytes([bytes[16], bytes[17]]);
        let connid = u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
        Ok(Self { gid: Gid(gid), qpn, connid })
    }

    /// 18-byte `gid:qpn` name used to register the peer with the shm
    /// transport. The connid is excluded: shm peers are identified by their
    /// node-local queue, not their QP incarnation.
    pub fn shm_name(&self) -> [u8; SHM_NAME_SIZE] {
        let mut out = [0u8; SHM_NAME_SIZE];
        out[..16].copy_from_slice(&self.gid.0);
        out[16..18].copy_from_slice(&self.qpn.to_le_bytes());
        out
    }
}

impl fmt::Display for RawAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/qpn{}/cid{:08x}", self.gid, self.qpn, self.connid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_addr_roundtrip() {
        let addr = RawAddress::new(Gid([0xab; 16]), 0x1234, 0xdeadbeef);
        let bytes = addr.to_bytes();
        assert_eq!(bytes.len(), RAW_ADDR_SIZE);
        assert_eq!(RawAddress::from_bytes(&bytes).unwrap(), addr);
        // pad and reserved stay zero
        assert_eq!(&bytes[18..20], &[0, 0]);
        assert_eq!(&bytes[24..32], &[0; 8]);
    }

    #[test]
    fn test_raw_addr_short_buffer() {
        assert_eq!(RawAddress::from_bytes(&[0u8; 16]), Err(RdmError::InvalidArg));
    }

    #[test]
    fn test_shm_name_excludes_connid() {
        let a = RawAddress::new(Gid([7; 16]), 9, 1);
        let b = RawAddress::new(Gid([7; 16]), 9, 2);
        assert_eq!(a.shm_name(), b.shm_name());
    }
}
