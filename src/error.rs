//! Error kinds observable through the public API and the completion queue

use thiserror::Error;

/// Provider error kinds.
///
/// `Again` is internal: an operation that cannot make progress right now is
/// re-queued and re-driven by the progress engine. It never reaches the
/// application as a completion error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RdmError {
    /// Malformed request or wire data.
    #[error("invalid argument")]
    InvalidArg,

    /// A packet pool or entry arena was exhausted at submission time.
    #[error("out of memory")]
    NoMemory,

    /// Unsupported attribute or flag.
    #[error("not implemented")]
    NotSupported,

    /// Retry expected. Internal only.
    #[error("resource temporarily unavailable")]
    Again,

    /// Transport failure, including unrecoverable RNR exhaustion.
    #[error("input/output error")]
    Io,

    /// A posted receive was cancelled.
    #[error("operation canceled")]
    Canceled,

    /// AV remove while tx/rx entries still reference the peer.
    #[error("device or resource busy")]
    Busy,

    /// The peer does not advertise a required extra feature.
    #[error("operation not supported by peer")]
    OpNotSupported,

    /// An EQ-requiring flag was used without an EQ bound.
    #[error("no event queue bound")]
    NoEventQueue,

    /// Zero GID or otherwise unusable address.
    #[error("address not available")]
    AddrNotAvail,
}

pub type RdmResult<T> = Result<T, RdmError>;
