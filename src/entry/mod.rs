//! Operation entries: one record per active send, receive, or RDMA-read.
//!
//! Entries live in index-based arenas and reference each other (and their
//! peer) by id, never by pointer. A peer's outstanding work is the set of
//! entry ids it tracks.

pub mod rx;
pub mod tx;

mod read;

pub use read::{ReadEntry, ReadOwner};
pub use rx::{RxEntry, RxState};
pub use tx::{TxEntry, TxOp, TxProto, TxState};

use crate::error::RdmResult;
use crate::hmem::{HmemIface, HmemRegistry};
use crate::transport::{MemDesc, MemSeg};

/// Per-iov memory descriptor: registration keys plus the owning memory
/// interface. Defaults to unregistered system memory.
#[derive(Debug, Clone, Copy)]
pub struct BufDesc {
    pub mem: Option<MemDesc>,
    pub iface: HmemIface,
    pub device: u64,
}

impl Default for BufDesc {
    fn default() -> Self {
        Self { mem: None, iface: HmemIface::System, device: 0 }
    }
}

impl BufDesc {
    pub fn system(mem: MemDesc) -> Self {
        Self { mem: Some(mem), iface: HmemIface::System, device: 0 }
    }
}

/// Index-based arena. Ids are stable for the lifetime of the entry and are
/// recycled after removal.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new() }
    }

    /// Insert an entry built from its own id.
    pub fn insert_with(&mut self, build: impl FnOnce(usize) -> T) -> usize {
        match self.free.pop() {
            Some(id) => {
                debug_assert!(self.slots[id].is_none());
                self.slots[id] = Some(build(id));
                id
            }
            None => {
                let id = self.slots.len();
                self.slots.push(Some(build(id)));
                id
            }
        }
    }

    pub fn get(&self, id: usize) -> Option<&T> {
        self.slots.get(id).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.slots.get_mut(id).and_then(|s| s.as_mut())
    }

    pub fn remove(&mut self, id: usize) -> Option<T> {
        let entry = self.slots.get_mut(id).and_then(|s| s.take());
        if entry.is_some() {
            self.free.push(id);
        }
        entry
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| i)
            .collect()
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub fn iov_total(iov: &[MemSeg]) -> usize {
    iov.iter().map(|s| s.len).sum()
}

fn desc_at(desc: &[BufDesc], idx: usize) -> BufDesc {
    desc.get(idx).copied().unwrap_or_default()
}

/// Gather `dst.len()` bytes from the iov starting at logical `offset`.
pub fn copy_from_iov(
    hmem: &HmemRegistry,
    iov: &[MemSeg],
    desc: &[BufDesc],
    mut offset: usize,
    dst: &mut [u8],
) -> RdmResult<usize> {
    let mut copied = 0;
    for (i, seg) in iov.iter().enumerate() {
        if offset >= seg.len {
            offset -= seg.len;
            continue;
        }
        let take = (seg.len - offset).min(dst.len() - copied);
        if take == 0 {
            break;
        }
        let d = desc_at(desc, i);
        hmem.copy_from_user(
            d.iface,
            d.device,
            &mut dst[copied..copied + take],
            seg.addr + offset as u64,
        )?;
        copied += take;
        offset = 0;
        if copied == dst.len() {
            break;
        }
    }
    Ok(copied)
}

/// Scatter `src` into the iov starting at logical `offset`. Bytes past the
/// iov's capacity are truncated; the caller accounts for them.
pub fn copy_to_iov(
    hmem: &HmemRegistry,
    iov: &[MemSeg],
    desc: &[BufDesc],
    mut offset: usize,
    src: &[u8],
) -> RdmResult<usize> {
    let mut copied = 0;
    for (i, seg) in iov.iter().enumerate() {
        if offset >= seg.len {
            offset -= seg.len;
            continue;
        }
        let take = (seg.len - offset).min(src.len() - copied);
        if take == 0 {
            break;
        }
        let d = desc_at(desc, i);
        hmem.copy_to_user(
            d.iface,
            d.device,
            seg.addr + offset as u64,
            &src[copied..copied + take],
        )?;
        copied += take;
        offset = 0;
        if copied == src.len() {
            break;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_recycles_ids() {
        let mut arena: Arena<u32> = Arena::new();
        let a = arena.insert_with(|_| 1);
        let b = arena.insert_with(|_| 2);
        assert_ne!(a, b);
        assert_eq!(arena.remove(a), Some(1));
        let c = arena.insert_with(|_| 3);
        assert_eq!(c, a);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_iov_gather_scatter() {
        let hmem = HmemRegistry::new();
        let src1 = vec![1u8; 10];
        let src2 = vec![2u8; 10];
        let iov = vec![
            MemSeg::new(src1.as_ptr() as u64, src1.len()),
            MemSeg::new(src2.as_ptr() as u64, src2.len()),
        ];

        let mut out = vec![0u8; 8];
        // crosses the segment boundary: 4 bytes of src1, 4 of src2
        let n = copy_from_iov(&hmem, &iov, &[], 6, &mut out).unwrap();
        assert_eq!(n, 8);
        assert_eq!(&out, &[1, 1, 1, 1, 2, 2, 2, 2]);

        let mut dst1 = vec![0u8; 4];
        let mut dst2 = vec![0u8; 4];
        let wiov = vec![
            MemSeg::new(dst1.as_mut_ptr() as u64, dst1.len()),
            MemSeg::new(dst2.as_mut_ptr() as u64, dst2.len()),
        ];
        let n = copy_to_iov(&hmem, &wiov, &[], 2, &[9, 9, 9]).unwrap();
        assert_eq!(n, 3);
        assert_eq!(dst1, vec![0, 0, 9, 9]);
        assert_eq!(dst2, vec![9, 0, 0, 0]);
    }

    #[test]
    fn test_iov_scatter_truncates() {
        let hmem = HmemRegistry::new();
        let mut dst = vec![0u8; 4];
        let wiov = vec![MemSeg::new(dst.as_mut_ptr() as u64, dst.len())];
        let n = copy_to_iov(&hmem, &wiov, &[], 0, &[7; 10]).unwrap();
        assert_eq!(n, 4);
        assert_eq!(dst, vec![7; 4]);
    }
}
