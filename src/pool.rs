//! Fixed-size slab pools of registered packet buffers.
//!
//! Every wire packet lives in a pool entry from encode to transport
//! completion. Entries alternate strictly FREE <-> IN_USE (with RNR
//! retransmit and copy-by-read as in-use sub-states); a released entry is
//! poisoned in debug builds so stale reads show up fast.

use crate::addr::{FI_ADDR_UNSPEC, FiAddr};
use crate::error::{RdmError, RdmResult};
use crate::transport::{MemDesc, MemSeg, MemoryRegistrar, access};

/// Debug poison written over released buffers.
pub const PKT_POISON: u8 = 0xdb;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PktState {
    Free,
    InUse,
    /// Held for retransmit after an RNR completion.
    RnrRetransmit,
    /// Pinned while its payload is still being copied out (unexpected or
    /// reorder-queued packets).
    CopyByRead,
}

/// Entry owning the packet, for completion dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PktOwner {
    None,
    Tx(usize),
    Rx(usize),
}

#[derive(Debug)]
pub struct PktEntry {
    pub state: PktState,
    buf: Vec<u8>,
    /// Valid bytes in `buf`.
    pub len: usize,
    pub desc: MemDesc,
    pub owner: PktOwner,
    /// Destination (tx) or source (rx) peer.
    pub peer: FiAddr,
    /// Wire type, cached from the header at encode/dispatch time.
    pub typ: u8,
    /// Payload bytes carried, for ack accounting on send completions.
    pub payload_len: usize,
    pub rnr_retries: u32,
    /// Posted to (or due for) the shm transport instead of the wire.
    pub via_shm: bool,
}

impl PktEntry {
    pub fn buf(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Segment/key pair for posting this entry to a transport.
    pub fn seg(&self) -> (MemSeg, u64) {
        (MemSeg::new(self.buf.as_ptr() as u64, self.len), self.desc.lkey)
    }

    /// Full-capacity segment for posting as a receive buffer.
    pub fn recv_seg(&self) -> (MemSeg, u64) {
        (MemSeg::new(self.buf.as_ptr() as u64, self.buf.len()), self.desc.lkey)
    }
}

#[derive(Debug)]
pub struct PktPool {
    entries: Vec<PktEntry>,
    free: Vec<usize>,
}

impl PktPool {
    /// Allocate `count` buffers of `entry_size` bytes, registering each with
    /// the transport's memory registrar.
    pub fn new(
        count: usize,
        entry_size: usize,
        registrar: &mut dyn MemoryRegistrar,
    ) -> RdmResult<Self> {
        let mut entries = Vec::with_capacity(count);
        let mut free = Vec::with_capacity(count);
        for i in 0..count {
            let buf = vec![0u8; entry_size];
            let desc = registrar.register(
                MemSeg::new(buf.as_ptr() as u64, buf.len()),
                access::LOCAL_READ | access::LOCAL_WRITE,
            )?;
            entries.push(PktEntry {
                state: PktState::Free,
                buf,
                len: 0,
                desc,
                owner: PktOwner::None,
                peer: FI_ADDR_UNSPEC,
                typ: 0,
                payload_len: 0,
                rnr_retries: 0,
                via_shm: false,
            });
            free.push(count - 1 - i);
        }
        Ok(Self { entries, free })
    }

    pub fn alloc(&mut self) -> RdmResult<usize> {
        let idx = self.free.pop().ok_or(RdmError::NoMemory)?;
        let entry = &mut self.entries[idx];
        debug_assert_eq!(entry.state, PktState::Free);
        entry.state = PktState::InUse;
        entry.len = 0;
        entry.owner = PktOwner::None;
        entry.peer = FI_ADDR_UNSPEC;
        entry.typ = 0;
        entry.payload_len = 0;
        entry.rnr_retries = 0;
        entry.via_shm = false;
        Ok(idx)
    }

    pub fn release(&mut self, idx: usize) {
        let entry = &mut self.entries[idx];
        debug_assert_ne!(entry.state, PktState::Free, "double release of pkt {idx}");
        if cfg!(debug_assertions) {
            entry.buf.fill(PKT_POISON);
        }
        entry.state = PktState::Free;
        entry.owner = PktOwner::None;
        self.free.push(idx);
    }

    pub fn get(&self, idx: usize) -> &PktEntry {
        &self.entries[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut PktEntry {
        &mut self.entries[idx]
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn in_use(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    /// Deregister every buffer. Called once at endpoint teardown.
    pub fn release_registrations(&mut self, registrar: &mut dyn MemoryRegistrar) {
        for entry in &self.entries {
            registrar.deregister(entry.desc.handle);
        }
    }
}
