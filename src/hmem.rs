//! Heterogeneous-memory copy dispatch.
//!
//! Accelerator copy paths are optional capability providers discovered at
//! endpoint construction. An absent provider yields `NotSupported` from the
//! copy path and `false` from address validation; the system path is always
//! present.

use crate::error::{RdmError, RdmResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmemIface {
    System,
    Cuda,
    Rocr,
    Ze,
    GdrCopy,
}

/// Copy between device memory and host staging buffers for one accelerator
/// interface.
pub trait HmemCopyProvider {
    /// Copy `src` into device memory at `dst`.
    fn copy_to(&self, device: u64, dst: u64, src: &[u8]) -> RdmResult<()>;
    /// Copy device memory at `src` into `dst`.
    fn copy_from(&self, device: u64, dst: &mut [u8], src: u64) -> RdmResult<()>;
    fn is_addr_valid(&self, addr: u64, len: usize) -> bool;
}

/// System-memory copies. The raw-pointer copies are sound only because every
/// address reaching them was supplied by the application as a buffer it owns
/// for the duration of the operation.
struct SystemCopy;

impl HmemCopyProvider for SystemCopy {
    fn copy_to(&self, _device: u64, dst: u64, src: &[u8]) -> RdmResult<()> {
        if src.is_empty() {
            return Ok(());
        }
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst as *mut u8, src.len());
        }
        Ok(())
    }

    fn copy_from(&self, _device: u64, dst: &mut [u8], src: u64) -> RdmResult<()> {
        if dst.is_empty() {
            return Ok(());
        }
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    fn is_addr_valid(&self, addr: u64, _len: usize) -> bool {
        addr != 0
    }
}

/// Sealed set of copy paths keyed by interface. Dispatch is a match, never a
/// table of nullable function pointers.
pub struct HmemRegistry {
    system: SystemCopy,
    cuda: Option<Box<dyn HmemCopyProvider>>,
    rocr: Option<Box<dyn HmemCopyProvider>>,
    ze: Option<Box<dyn HmemCopyProvider>>,
    gdrcopy: Option<Box<dyn HmemCopyProvider>>,
}

impl HmemRegistry {
    pub fn new() -> Self {
        Self { system: SystemCopy, cuda: None, rocr: None, ze: None, gdrcopy: None }
    }

    /// Attach an accelerator provider discovered at startup.
    pub fn attach(&mut self, iface: HmemIface, provider: Box<dyn HmemCopyProvider>) {
        match iface {
            HmemIface::System => {}
            HmemIface::Cuda => self.cuda = Some(provider),
            HmemIface::Rocr => self.rocr = Some(provider),
            HmemIface::Ze => self.ze = Some(provider),
            HmemIface::GdrCopy => self.gdrcopy = Some(provider),
        }
    }

    fn provider(&self, iface: HmemIface) -> RdmResult<&dyn HmemCopyProvider> {
        let p: Option<&Box<dyn HmemCopyProvider>> = match iface {
            HmemIface::System => return Ok(&self.system),
            HmemIface::Cuda => self.cuda.as_ref(),
            HmemIface::Rocr => self.rocr.as_ref(),
            HmemIface::Ze => self.ze.as_ref(),
            HmemIface::GdrCopy => self.gdrcopy.as_ref(),
        };
        p.map(|b| b.as_ref()).ok_or(RdmError::NotSupported)
    }

    /// Copy a packet payload slice into user memory.
    pub fn copy_to_user(
        &self,
        iface: HmemIface,
        device: u64,
        dst: u64,
        src: &[u8],
    ) -> RdmResult<()> {
        self.provider(iface)?.copy_to(device, dst, src)
    }

    /// Copy user memory into a packet buffer slice.
    pub fn copy_from_user(
        &self,
        iface: HmemIface,
        device: u64,
        dst: &mut [u8],
        src: u64,
    ) -> RdmResult<()> {
        self.provider(iface)?.copy_from(device, dst, src)
    }

    pub fn is_addr_valid(&self, iface: HmemIface, addr: u64, len: usize) -> bool {
        match self.provider(iface) {
            Ok(p) => p.is_addr_valid(addr, len),
            Err(_) => false,
        }
    }
}

impl Default for HmemRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_copy_roundtrip() {
        let reg = HmemRegistry::new();
        let src = vec![1u8, 2, 3, 4];
        let mut dst = vec![0u8; 4];
        reg.copy_to_user(HmemIface::System, 0, dst.as_mut_ptr() as u64, &src).unwrap();
        assert_eq!(dst, src);

        let mut out = vec![0u8; 4];
        reg.copy_from_user(HmemIface::System, 0, &mut out, src.as_ptr() as u64).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn test_absent_provider() {
        let reg = HmemRegistry::new();
        let mut buf = [0u8; 1];
        assert_eq!(
            reg.copy_from_user(HmemIface::Cuda, 0, &mut buf, 0x1000),
            Err(RdmError::NotSupported)
        );
        assert!(!reg.is_addr_valid(HmemIface::Rocr, 0x1000, 1));
    }
}
