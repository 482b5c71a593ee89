//! Endpoint tunables.
//!
//! Every limit here bounds a resource the progress engine cycles through.
//! Pools are fixed-size slabs: once a pool is empty, submissions fail with
//! `NoMemory` and internal control traffic is re-queued until buffers return.

use crate::addr::Gid;
use crate::peer::extra_feature;

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Wire protocol version stamped into every base header.
/// Peers with a different version are rejected at decode.
pub const PROTOCOL_VERSION: u8 = 4;

// =============================================================================
// DEFAULTS
// =============================================================================

/// Default reorder window, in message ids, per peer.
/// A REQ whose msg-id distance from the expected id is at or beyond this
/// window (but below 2^31) is a protocol error and is dropped.
pub const DEFAULT_RECVWIN_SIZE: usize = 16384;

/// Default completion-queue poll batch per progress invocation.
pub const DEFAULT_CQ_POLL_BATCH: usize = 50;

/// Default credit request carried in LONGCTS RTM packets.
pub const DEFAULT_TX_CREDITS: u32 = 16;

/// Default per-CTS grant, in packets. The receiver always grants at least
/// one packet per CTS regardless of this value.
pub const DEFAULT_CTS_WINDOW_PKTS: usize = 16;

/// RNR retransmits per packet before the owning entry fails with `Io`.
pub const DEFAULT_RNR_RETRY_CAP: u32 = 16;

/// Endpoint configuration. All fields have working defaults; construct with
/// `Config::default()` and override what the deployment needs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of registered tx packet buffers.
    pub tx_pool_size: usize,
    /// Number of registered rx packet buffers.
    pub rx_pool_size: usize,
    /// Buffers for cloned unexpected packets and reorder-queued packets.
    pub unexp_pool_size: usize,
    /// Target number of rx buffers kept posted at the transport. Progress
    /// bulk-reposts up to this count each invocation.
    pub rx_posted_target: usize,
    /// Transport CQ poll batch per progress invocation.
    pub cq_poll_batch: usize,
    /// Completion queue capacity (entries plus error entries).
    pub cq_size: usize,
    /// Per-peer reorder window in message ids.
    pub recvwin_size: usize,
    /// `credit_request` value sent in LONGCTS RTMs.
    pub tx_credits: u32,
    /// CTS grant size in packets.
    pub cts_window_pkts: usize,
    /// Payload cap for the medium-message family. Larger messages use a
    /// flow-controlled long protocol.
    pub medium_threshold: usize,
    /// Minimum size at which a send prefers LONGREAD over LONGCTS when the
    /// peer advertises RDMA read and descriptors carry remote keys.
    pub longread_threshold: usize,
    /// Initial RNR backoff.
    pub rnr_backoff_initial_ms: u64,
    /// RNR backoff ceiling.
    pub rnr_backoff_max_ms: u64,
    /// RNR retransmits per packet before the entry fails with `Io`.
    pub rnr_retry_cap: u32,
    /// Extra features advertised in our HANDSHAKE. RDMA read is masked off
    /// when the transport cannot post reads.
    pub features: u64,
    /// Route traffic to intra-node peers through the shm transport when one
    /// is attached.
    pub shm_enabled: bool,
    /// Minimum free space kept usable in a multi-recv buffer; below this the
    /// buffer is retired with a MULTI_RECV completion.
    pub min_multi_recv: usize,
    /// GIDs of this host besides the endpoint's own, for intra-node peer
    /// detection.
    pub local_gids: Vec<Gid>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tx_pool_size: 1024,
            rx_pool_size: 1024,
            unexp_pool_size: 512,
            rx_posted_target: 512,
            cq_poll_batch: DEFAULT_CQ_POLL_BATCH,
            cq_size: 8192,
            recvwin_size: DEFAULT_RECVWIN_SIZE,
            tx_credits: DEFAULT_TX_CREDITS,
            cts_window_pkts: DEFAULT_CTS_WINDOW_PKTS,
            medium_threshold: 65536,
            longread_threshold: 128 * 1024,
            rnr_backoff_initial_ms: 1,
            rnr_backoff_max_ms: 512,
            rnr_retry_cap: DEFAULT_RNR_RETRY_CAP,
            features: extra_feature::RDMA_READ
                | extra_feature::DELIVERY_COMPLETE
                | extra_feature::CONNID_HEADER,
            shm_enabled: true,
            min_multi_recv: 64,
            local_gids: Vec::new(),
        }
    }
}
