//! Application-visible completion queue.
//!
//! Successful operations produce one `CqEntry`; failed operations produce
//! one `CqErrEntry` carrying the application context. The queue is bounded;
//! overflow drops the newest entry and counts it, which only happens when
//! the application stops reaping.

use crate::addr::{FI_ADDR_UNSPEC, FiAddr};
use crate::error::RdmError;
use std::collections::VecDeque;
use tracing::warn;

pub mod comp_flags {
    pub const RECV: u64 = 1 << 0;
    pub const SEND: u64 = 1 << 1;
    pub const MSG: u64 = 1 << 2;
    pub const TAGGED: u64 = 1 << 3;
    pub const RMA: u64 = 1 << 4;
    pub const ATOMIC: u64 = 1 << 5;
    pub const READ: u64 = 1 << 6;
    pub const WRITE: u64 = 1 << 7;
    /// 8-byte remote CQ data present in `data`.
    pub const REMOTE_CQ_DATA: u64 = 1 << 8;
    /// Final completion of a multi-recv buffer: the buffer is released back
    /// to the application.
    pub const MULTI_RECV: u64 = 1 << 9;
    /// Peer-side delivery confirmed (delivery-complete model).
    pub const DELIVERY_COMPLETE: u64 = 1 << 10;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqEntry {
    pub context: u64,
    pub flags: u64,
    pub len: usize,
    pub buf: u64,
    pub data: u64,
    pub tag: u64,
    pub src_addr: FiAddr,
}

impl CqEntry {
    pub fn new(context: u64, flags: u64) -> Self {
        Self { context, flags, len: 0, buf: 0, data: 0, tag: 0, src_addr: FI_ADDR_UNSPEC }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqErrEntry {
    pub context: u64,
    pub flags: u64,
    pub len: usize,
    pub tag: u64,
    pub err: RdmError,
}

#[derive(Debug)]
pub struct CompletionQueue {
    entries: VecDeque<CqEntry>,
    errors: VecDeque<CqErrEntry>,
    capacity: usize,
    overruns: u64,
}

impl CompletionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            errors: VecDeque::new(),
            capacity,
            overruns: 0,
        }
    }

    pub fn push(&mut self, entry: CqEntry) {
        if self.entries.len() >= self.capacity {
            self.overruns += 1;
            warn!("completion queue overrun, dropping entry (ctx {:#x})", entry.context);
            return;
        }
        self.entries.push_back(entry);
    }

    pub fn push_err(&mut self, entry: CqErrEntry) {
        if self.errors.len() >= self.capacity {
            self.overruns += 1;
            warn!("error queue overrun, dropping entry (ctx {:#x})", entry.context);
            return;
        }
        self.errors.push_back(entry);
    }

    /// Reap up to `max` completions into `out`, returning the count.
    pub fn read(&mut self, max: usize, out: &mut Vec<CqEntry>) -> usize {
        let n = max.min(self.entries.len());
        out.extend(self.entries.drain(..n));
        n
    }

    pub fn read_err(&mut self) -> Option<CqErrEntry> {
        self.errors.pop_front()
    }

    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    pub fn pending_errors(&self) -> usize {
        self.errors.len()
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cq_fifo() {
        let mut cq = CompletionQueue::new(8);
        cq.push(CqEntry::new(1, comp_flags::SEND));
        cq.push(CqEntry::new(2, comp_flags::SEND));
        let mut out = Vec::new();
        assert_eq!(cq.read(10, &mut out), 2);
        assert_eq!(out[0].context, 1);
        assert_eq!(out[1].context, 2);
        assert_eq!(cq.pending(), 0);
    }

    #[test]
    fn test_cq_overrun_counted() {
        let mut cq = CompletionQueue::new(1);
        cq.push(CqEntry::new(1, 0));
        cq.push(CqEntry::new(2, 0));
        assert_eq!(cq.pending(), 1);
        assert_eq!(cq.overruns(), 1);
    }

    #[test]
    fn test_err_queue() {
        let mut cq = CompletionQueue::new(4);
        cq.push_err(CqErrEntry { context: 9, flags: 0, len: 0, tag: 0, err: RdmError::Canceled });
        let e = cq.read_err().unwrap();
        assert_eq!(e.err, RdmError::Canceled);
        assert!(cq.read_err().is_none());
    }
}
