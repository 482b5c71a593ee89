//! External collaborator seams: the wire transport, the intra-node shm
//! transport, and memory registration.
//!
//! The provider core never owns a socket or a verbs object. Everything it
//! needs from the device is expressed here, and every method that cannot
//! accept work right now returns `Again` so the progress engine can retry.

use crate::addr::Gid;
use crate::error::RdmResult;

/// One contiguous region of application or pool memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemSeg {
    pub addr: u64,
    pub len: usize,
}

impl MemSeg {
    pub fn new(addr: u64, len: usize) -> Self {
        Self { addr, len }
    }
}

/// Registration produced by [`MemoryRegistrar::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemDesc {
    pub lkey: u64,
    pub rkey: u64,
    /// Opaque registration handle, passed back to `deregister`.
    pub handle: u64,
}

pub mod access {
    pub const LOCAL_READ: u32 = 0x1;
    pub const LOCAL_WRITE: u32 = 0x2;
    pub const REMOTE_READ: u32 = 0x4;
    pub const REMOTE_WRITE: u32 = 0x8;
}

/// Address handle created from a GID. The device stamps `ahn` on every
/// packet received from a peer behind this handle.
#[derive(Debug, Clone, Copy)]
pub struct Ah {
    pub handle: u64,
    pub ahn: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqOpType {
    Send,
    Recv,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqStatus {
    Ok,
    /// Receiver-not-ready: soft failure, the packet may be retransmitted
    /// after peer-local backoff.
    Rnr,
    /// Hard transport failure.
    Err,
}

/// Source stamp on received packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PktSource {
    pub ahn: u16,
    pub qpn: u16,
}

/// One transport completion. `wr_id` is whatever the core passed at post
/// time; the core packs pool indices and entry ids into it.
#[derive(Debug, Clone, Copy)]
pub struct TransportCompletion {
    pub op: CqOpType,
    pub wr_id: u64,
    pub status: CqStatus,
    pub byte_len: usize,
    /// Present on recv completions.
    pub src: Option<PktSource>,
}

/// The EFA datagram device: unreliable, unordered, MTU-limited sends plus
/// optional RDMA read.
pub trait Transport {
    /// Maximum bytes per posted datagram, headers included.
    fn mtu(&self) -> usize;
    /// Cap on posted-but-uncompleted tx work requests.
    fn max_outstanding_tx(&self) -> usize;
    fn supports_rdma_read(&self) -> bool;

    fn local_gid(&self) -> Gid;
    fn local_qpn(&self) -> u16;

    fn create_ah(&mut self, gid: Gid) -> RdmResult<Ah>;
    fn destroy_ah(&mut self, handle: u64);

    fn post_send(
        &mut self,
        ah: u64,
        qpn: u16,
        iov: &[MemSeg],
        lkeys: &[u64],
        wr_id: u64,
        more: bool,
    ) -> RdmResult<()>;

    fn post_recv(&mut self, seg: MemSeg, lkey: u64, wr_id: u64, more: bool) -> RdmResult<()>;

    fn post_read(
        &mut self,
        local: MemSeg,
        lkey: u64,
        remote_addr: u64,
        rkey: u64,
        wr_id: u64,
    ) -> RdmResult<()>;

    fn poll_cq(&mut self, max: usize, out: &mut Vec<TransportCompletion>);

    /// Flush any batched (`more = true`) work to the device.
    fn flush(&mut self) {}
}

/// Completion from the shm transport. Sources are shm addresses, translated
/// back to EFA addresses through the AV.
#[derive(Debug, Clone, Copy)]
pub struct ShmCompletion {
    pub op: CqOpType,
    pub wr_id: u64,
    pub status: CqStatus,
    pub byte_len: usize,
    /// Present on recv completions.
    pub src_addr: Option<u64>,
}

/// Intra-node fast path with the same datagram semantics as the wire
/// transport, addressed by the 18-byte `gid:qpn` name.
pub trait ShmTransport {
    fn av_insert(&mut self, name: &[u8; crate::addr::SHM_NAME_SIZE]) -> RdmResult<u64>;
    fn av_remove(&mut self, shm_addr: u64);
    fn post_send(&mut self, shm_addr: u64, iov: &[MemSeg], wr_id: u64) -> RdmResult<()>;
    fn post_recv(&mut self, seg: MemSeg, wr_id: u64) -> RdmResult<()>;
    fn poll_cq(&mut self, max: usize, out: &mut Vec<ShmCompletion>);
}

/// Memory registration. `check` validates a remote key presented by a peer
/// in an emulated one-sided operation against the registered region.
pub trait MemoryRegistrar {
    fn register(&mut self, seg: MemSeg, acc: u32) -> RdmResult<MemDesc>;
    fn deregister(&mut self, handle: u64);
    fn check(&self, key: u64, addr: u64, len: usize, write: bool) -> bool;
}
