//! Reliable datagram (RDM) messaging provider over the Elastic Fabric
//! Adapter.
//!
//! EFA exposes unreliable, unordered, MTU-limited datagrams plus optional
//! RDMA read. This crate layers reliable, ordered, arbitrarily large
//! send/recv, emulated one-sided read/write, and atomics on top of it: a
//! wire protocol with a version-4 header and per-family sub-protocols, a
//! per-peer reliability state machine, a credit-based long-message loop, an
//! RDMA-read-backed zero-copy path, and an address vector that pins
//! connection identity across QP reuse.

pub mod addr;
pub mod av;
pub mod config;
pub mod cq;
pub mod entry;
pub mod ep;
pub mod error;
pub mod hmem;
pub mod peer;
pub mod pool;
pub mod proto;
pub mod transport;
pub mod wire;

mod progress;

pub use addr::{FI_ADDR_UNSPEC, FiAddr, Gid, RawAddress};
pub use av::AvStats;
pub use config::Config;
pub use cq::{CompletionQueue, CqEntry, CqErrEntry, comp_flags};
pub use entry::BufDesc;
pub use ep::{Endpoint, EndpointStats, SendOpts};
pub use error::{RdmError, RdmResult};
pub use hmem::{HmemCopyProvider, HmemIface, HmemRegistry};
pub use peer::{PeerStats, extra_feature};
pub use proto::atomic::{AtomicDatatype, AtomicOp};
pub use transport::{
    Ah, CqOpType, CqStatus, MemDesc, MemSeg, MemoryRegistrar, PktSource, ShmCompletion,
    ShmTransport, Transport, TransportCompletion, access,
};
pub use wire::RmaIov;
