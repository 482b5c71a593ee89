//! RDMA-read bookkeeping for long-read transfers and direct reads.

use crate::transport::MemSeg;
use crate::wire::RmaIov;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOwner {
    Tx(usize),
    Rx(usize),
}

/// One RDMA-read-backed transfer: a remote iov pulled into a local iov,
/// posted chunk by chunk under the outstanding-tx cap.
#[derive(Debug)]
pub struct ReadEntry {
    pub id: usize,
    pub owner: ReadOwner,
    pub remote: Vec<RmaIov>,
    pub local: Vec<MemSeg>,
    /// lkey per local segment.
    pub local_keys: Vec<u64>,
    pub total: usize,
    pub bytes_submitted: usize,
    pub bytes_finished: usize,
    /// Posted reads not yet completed.
    pub outstanding: usize,

    // Cursors over the two iovs.
    remote_idx: usize,
    remote_off: u64,
    local_idx: usize,
    local_off: usize,
}

impl ReadEntry {
    pub fn new(
        id: usize,
        owner: ReadOwner,
        remote: Vec<RmaIov>,
        local: Vec<MemSeg>,
        local_keys: Vec<u64>,
        total: usize,
    ) -> Self {
        debug_assert_eq!(local.len(), local_keys.len());
        Self {
            id,
            owner,
            remote,
            local,
            local_keys,
            total,
            bytes_submitted: 0,
            bytes_finished: 0,
            outstanding: 0,
            remote_idx: 0,
            remote_off: 0,
            local_idx: 0,
            local_off: 0,
        }
    }

    /// Next contiguous chunk to post: (local seg, lkey, remote addr, rkey).
    /// Returns None once everything is submitted. The cursors only move in
    /// `commit_chunk`, so a failed post retries the same chunk.
    pub fn next_chunk(&self) -> Option<(MemSeg, u64, u64, u64)> {
        if self.bytes_submitted >= self.total {
            return None;
        }
        let remote = self.remote.get(self.remote_idx)?;
        let local = self.local.get(self.local_idx)?;
        let remote_rem = (remote.len - self.remote_off) as usize;
        let local_rem = local.len - self.local_off;
        let len = remote_rem.min(local_rem).min(self.total - self.bytes_submitted);
        Some((
            MemSeg::new(local.addr + self.local_off as u64, len),
            self.local_keys[self.local_idx],
            remote.addr + self.remote_off,
            remote.key,
        ))
    }

    /// Advance the cursors after a successful post of `len` bytes.
    pub fn commit_chunk(&mut self, len: usize) {
        self.bytes_submitted += len;
        self.outstanding += 1;

        self.remote_off += len as u64;
        if self.remote_idx < self.remote.len() && self.remote_off >= self.remote[self.remote_idx].len
        {
            self.remote_idx += 1;
            self.remote_off = 0;
        }
        self.local_off += len;
        if self.local_idx < self.local.len() && self.local_off >= self.local[self.local_idx].len {
            self.local_idx += 1;
            self.local_off = 0;
        }
    }

    pub fn on_read_completed(&mut self, byte_len: usize) {
        debug_assert!(self.outstanding > 0);
        self.outstanding -= 1;
        self.bytes_finished += byte_len;
        debug_assert!(self.bytes_finished <= self.total);
    }

    pub fn finished(&self) -> bool {
        self.bytes_finished >= self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_chunking_across_segments() {
        let remote = vec![
            RmaIov { addr: 0x1000, len: 100, key: 1 },
            RmaIov { addr: 0x9000, len: 50, key: 2 },
        ];
        let local = vec![MemSeg::new(0x5000, 150)];
        let mut entry = ReadEntry::new(0, ReadOwner::Rx(0), remote, local, vec![9], 150);

        let (seg, lkey, raddr, rkey) = entry.next_chunk().unwrap();
        assert_eq!((seg.addr, seg.len, lkey, raddr, rkey), (0x5000, 100, 9, 0x1000, 1));
        entry.commit_chunk(100);

        let (seg, _, raddr, rkey) = entry.next_chunk().unwrap();
        assert_eq!((seg.addr, seg.len, raddr, rkey), (0x5064, 50, 0x9000, 2));
        entry.commit_chunk(50);

        assert!(entry.next_chunk().is_none());
        entry.on_read_completed(100);
        assert!(!entry.finished());
        entry.on_read_completed(50);
        assert!(entry.finished());
        assert_eq!(entry.outstanding, 0);
    }
}
