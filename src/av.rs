//! Address vector: the table of known peers.
//!
//! `fi_addr` handles are table indices. Address handles are cached per GID
//! and refcounted so peers behind one GID share one hardware AH; the
//! (AHN, QPN) reverse map resolves incoming packets to peers in O(1).

use crate::addr::{FiAddr, Gid, RawAddress};
use crate::error::{RdmError, RdmResult};
use crate::peer::Peer;
use crate::transport::{ShmTransport, Transport};
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug)]
struct AhCacheEntry {
    handle: u64,
    ahn: u16,
    used: usize,
}

/// Address vector statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct AvStats {
    pub peers: usize,
    pub ah_entries: usize,
    pub stale_evictions: u64,
}

pub struct AddressVector {
    table: Vec<Option<Peer>>,
    free_slots: Vec<usize>,
    ah_cache: HashMap<Gid, AhCacheEntry>,
    /// (AHN, QPN) -> fi_addr, an injection onto live peers.
    reverse: HashMap<(u16, u16), FiAddr>,
    /// (GID, QPN) -> fi_addr for idempotent insert and stale detection.
    gid_qpn: HashMap<(Gid, u16), FiAddr>,
    /// shm address -> fi_addr for translating shm completions.
    shm_to_efa: HashMap<u64, FiAddr>,
    recvwin_size: usize,
    stale_evictions: u64,
}

impl AddressVector {
    pub fn new(recvwin_size: usize) -> Self {
        Self {
            table: Vec::new(),
            free_slots: Vec::new(),
            ah_cache: HashMap::new(),
            reverse: HashMap::new(),
            gid_qpn: HashMap::new(),
            shm_to_efa: HashMap::new(),
            recvwin_size,
            stale_evictions: 0,
        }
    }

    /// Insert a peer. Re-inserting an existing (GID, QPN, connid) returns
    /// the existing handle without allocating a new AH. A matching (GID,
    /// QPN) with a different connid is a destroyed-and-recreated QP: the
    /// stale peer is released first; its parked inbound packets land in
    /// `dropped_pkts` and its unsent control packets in `dropped_ctrl`, for
    /// the caller to recycle into the right pools.
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &mut self,
        transport: &mut dyn Transport,
        mut shm: Option<&mut (dyn ShmTransport + '_)>,
        shm_enabled: bool,
        own_raw: &RawAddress,
        local_gids: &[Gid],
        raw: RawAddress,
        dropped_pkts: &mut Vec<usize>,
        dropped_ctrl: &mut Vec<usize>,
    ) -> RdmResult<FiAddr> {
        if raw.gid.is_zero() {
            return Err(RdmError::AddrNotAvail);
        }

        if let Some(&existing) = self.gid_qpn.get(&(raw.gid, raw.qpn)) {
            let peer = self.table[existing as usize].as_ref().expect("gid_qpn maps live peer");
            if peer.raw.connid == raw.connid {
                return Ok(existing);
            }
            // Same GID+QPN, different connid: the QP was destroyed and
            // recreated. The old peer is unreachable; evict it.
            warn!(
                fi_addr = existing,
                old = format_args!("{:#010x}", peer.raw.connid),
                new = format_args!("{:#010x}", raw.connid),
                "evicting stale peer for recreated QP"
            );
            self.stale_evictions += 1;
            let (orphaned, ctrl) = self.release_peer(transport, shm.as_deref_mut(), existing);
            dropped_pkts.extend(orphaned);
            dropped_ctrl.extend(ctrl);
        }

        let ah = match self.ah_cache.get_mut(&raw.gid) {
            Some(entry) => {
                entry.used += 1;
                (entry.handle, entry.ahn)
            }
            None => {
                let ah = transport.create_ah(raw.gid)?;
                self.ah_cache
                    .insert(raw.gid, AhCacheEntry { handle: ah.handle, ahn: ah.ahn, used: 1 });
                (ah.handle, ah.ahn)
            }
        };

        let fi_addr = match self.free_slots.pop() {
            Some(slot) => slot as FiAddr,
            None => {
                self.table.push(None);
                (self.table.len() - 1) as FiAddr
            }
        };

        let mut peer = Peer::new(fi_addr, raw, ah.0, ah.1, self.recvwin_size);
        peer.is_self = raw.gid == own_raw.gid && raw.qpn == own_raw.qpn;
        peer.is_local = peer.is_self || raw.gid == own_raw.gid || local_gids.contains(&raw.gid);

        if peer.is_local
            && shm_enabled
            && let Some(shm) = shm.as_deref_mut()
        {
            match shm.av_insert(&raw.shm_name()) {
                Ok(shm_addr) => {
                    peer.shm_addr = Some(shm_addr);
                    self.shm_to_efa.insert(shm_addr, fi_addr);
                }
                Err(err) => {
                    // The peer stays reachable over the wire.
                    warn!(fi_addr, %err, "shm av insert failed, using wire path");
                }
            }
        }

        self.reverse.insert((ah.1, raw.qpn), fi_addr);
        self.gid_qpn.insert((raw.gid, raw.qpn), fi_addr);
        debug!(fi_addr, addr = %raw, local = peer.is_local, "inserted peer");
        self.table[fi_addr as usize] = Some(peer);
        Ok(fi_addr)
    }

    /// Remove a peer. Fails with `Busy` while any in-use tx/rx entry or
    /// in-flight packet still references it. On success, returns parked
    /// inbound and control packet indices for the caller to recycle.
    pub fn remove(
        &mut self,
        transport: &mut dyn Transport,
        shm: Option<&mut (dyn ShmTransport + '_)>,
        fi_addr: FiAddr,
    ) -> RdmResult<(Vec<usize>, Vec<usize>)> {
        let peer = self.peer(fi_addr).ok_or(RdmError::InvalidArg)?;
        if peer.use_cnt() > 0 {
            return Err(RdmError::Busy);
        }
        Ok(self.release_peer(transport, shm, fi_addr))
    }

    fn release_peer(
        &mut self,
        transport: &mut dyn Transport,
        shm: Option<&mut (dyn ShmTransport + '_)>,
        fi_addr: FiAddr,
    ) -> (Vec<usize>, Vec<usize>) {
        let mut peer = self.table[fi_addr as usize].take().expect("release of live peer");
        self.free_slots.push(fi_addr as usize);
        self.reverse.remove(&(peer.ahn, peer.raw.qpn));
        self.gid_qpn.remove(&(peer.raw.gid, peer.raw.qpn));

        if let Some(shm_addr) = peer.shm_addr {
            self.shm_to_efa.remove(&shm_addr);
            if let Some(shm) = shm {
                shm.av_remove(shm_addr);
            }
        }

        let cache = self.ah_cache.get_mut(&peer.raw.gid).expect("peer holds cached AH");
        cache.used -= 1;
        if cache.used == 0 {
            transport.destroy_ah(cache.handle);
            self.ah_cache.remove(&peer.raw.gid);
        }
        debug!(fi_addr, addr = %peer.raw, "released peer");
        (peer.reorder.drain(), std::mem::take(&mut peer.queued_ctrl))
    }

    /// O(1) handle-to-address lookup.
    pub fn lookup(&self, fi_addr: FiAddr) -> RdmResult<RawAddress> {
        self.peer(fi_addr).map(|p| p.raw).ok_or(RdmError::InvalidArg)
    }

    /// O(1) resolution of an incoming packet's source stamp.
    pub fn reverse_lookup(&self, ahn: u16, qpn: u16) -> Option<FiAddr> {
        self.reverse.get(&(ahn, qpn)).copied()
    }

    /// Translate an shm source address back to the EFA fi_addr.
    pub fn shm_lookup(&self, shm_addr: u64) -> Option<FiAddr> {
        self.shm_to_efa.get(&shm_addr).copied()
    }

    pub fn peer(&self, fi_addr: FiAddr) -> Option<&Peer> {
        self.table.get(fi_addr as usize).and_then(|slot| slot.as_ref())
    }

    pub fn peer_mut(&mut self, fi_addr: FiAddr) -> Option<&mut Peer> {
        self.table.get_mut(fi_addr as usize).and_then(|slot| slot.as_mut())
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.table.iter().filter_map(|slot| slot.as_ref())
    }

    pub fn peer_addrs(&self) -> Vec<FiAddr> {
        self.table.iter().enumerate().filter(|(_, s)| s.is_some()).map(|(i, _)| i as FiAddr).collect()
    }

    pub fn len(&self) -> usize {
        self.table.len() - self.free_slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> AvStats {
        AvStats {
            peers: self.len(),
            ah_entries: self.ah_cache.len(),
            stale_evictions: self.stale_evictions,
        }
    }

    /// Total AH refcount across the cache; equals the number of live peers.
    pub fn ah_used_total(&self) -> usize {
        self.ah_cache.values().map(|e| e.used).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Ah, MemSeg, TransportCompletion};

    /// Transport stub that only serves AH management.
    struct AhOnly {
        next_ahn: u16,
        live_ahs: usize,
    }

    impl AhOnly {
        fn new() -> Self {
            Self { next_ahn: 100, live_ahs: 0 }
        }
    }

    impl Transport for AhOnly {
        fn mtu(&self) -> usize {
            8192
        }
        fn max_outstanding_tx(&self) -> usize {
            64
        }
        fn supports_rdma_read(&self) -> bool {
            false
        }
        fn local_gid(&self) -> Gid {
            Gid([0xee; 16])
        }
        fn local_qpn(&self) -> u16 {
            1
        }
        fn create_ah(&mut self, _gid: Gid) -> RdmResult<Ah> {
            self.next_ahn += 1;
            self.live_ahs += 1;
            Ok(Ah { handle: self.next_ahn as u64, ahn: self.next_ahn })
        }
        fn destroy_ah(&mut self, _handle: u64) {
            self.live_ahs -= 1;
        }
        fn post_send(
            &mut self,
            _ah: u64,
            _qpn: u16,
            _iov: &[MemSeg],
            _lkeys: &[u64],
            _wr_id: u64,
            _more: bool,
        ) -> RdmResult<()> {
            unreachable!()
        }
        fn post_recv(&mut self, _seg: MemSeg, _lkey: u64, _wr_id: u64, _more: bool) -> RdmResult<()> {
            unreachable!()
        }
        fn post_read(
            &mut self,
            _local: MemSeg,
            _lkey: u64,
            _remote_addr: u64,
            _rkey: u64,
            _wr_id: u64,
        ) -> RdmResult<()> {
            unreachable!()
        }
        fn poll_cq(&mut self, _max: usize, _out: &mut Vec<TransportCompletion>) {}
    }

    fn own() -> RawAddress {
        RawAddress::new(Gid([0xee; 16]), 1, 42)
    }

    fn raw(gid_byte: u8, qpn: u16, connid: u32) -> RawAddress {
        RawAddress::new(Gid([gid_byte; 16]), qpn, connid)
    }

    #[test]
    fn test_insert_lookup_roundtrip() {
        let mut t = AhOnly::new();
        let mut av = AddressVector::new(16);
        let mut dropped = Vec::new();
        let addr = raw(1, 7, 0x111);
        let fi = av.insert(&mut t, None, false, &own(), &[], addr, &mut dropped, &mut Vec::new()).unwrap();
        assert_eq!(av.lookup(fi).unwrap(), addr);
        assert!(dropped.is_empty());
    }

    #[test]
    fn test_insert_zero_gid_rejected() {
        let mut t = AhOnly::new();
        let mut av = AddressVector::new(16);
        let mut dropped = Vec::new();
        let res = av.insert(&mut t, None, false, &own(), &[], raw(0, 7, 1), &mut dropped, &mut Vec::new());
        assert_eq!(res, Err(RdmError::AddrNotAvail));
    }

    #[test]
    fn test_insert_idempotent() {
        let mut t = AhOnly::new();
        let mut av = AddressVector::new(16);
        let mut dropped = Vec::new();
        let addr = raw(1, 7, 0x111);
        let fi1 = av.insert(&mut t, None, false, &own(), &[], addr, &mut dropped, &mut Vec::new()).unwrap();
        let fi2 = av.insert(&mut t, None, false, &own(), &[], addr, &mut dropped, &mut Vec::new()).unwrap();
        assert_eq!(fi1, fi2);
        assert_eq!(t.live_ahs, 1);
        assert_eq!(av.ah_used_total(), 1);
    }

    #[test]
    fn test_ah_shared_across_qpns() {
        let mut t = AhOnly::new();
        let mut av = AddressVector::new(16);
        let mut dropped = Vec::new();
        let a = av.insert(&mut t, None, false, &own(), &[], raw(1, 7, 1), &mut dropped, &mut Vec::new()).unwrap();
        let b = av.insert(&mut t, None, false, &own(), &[], raw(1, 8, 1), &mut dropped, &mut Vec::new()).unwrap();
        assert_ne!(a, b);
        assert_eq!(t.live_ahs, 1);
        assert_eq!(av.ah_used_total(), 2);
        assert_eq!(av.stats().ah_entries, 1);

        av.remove(&mut t, None, a).unwrap();
        assert_eq!(t.live_ahs, 1, "second peer still holds the AH");
        av.remove(&mut t, None, b).unwrap();
        assert_eq!(t.live_ahs, 0);
    }

    #[test]
    fn test_stale_qp_evicted() {
        let mut t = AhOnly::new();
        let mut av = AddressVector::new(16);
        let mut dropped = Vec::new();
        let old = av.insert(&mut t, None, false, &own(), &[], raw(1, 7, 0xc1), &mut dropped, &mut Vec::new()).unwrap();
        let ahn = av.peer(old).unwrap().ahn;
        let new = av.insert(&mut t, None, false, &own(), &[], raw(1, 7, 0xc2), &mut dropped, &mut Vec::new()).unwrap();
        assert!(av.peer(old).is_none() || old == new);
        assert_eq!(av.len(), 1);
        assert_eq!(av.reverse_lookup(ahn, 7), Some(new));
        assert_eq!(av.peer(new).unwrap().raw.connid, 0xc2);
        assert_eq!(av.stats().stale_evictions, 1);
        assert_eq!(av.ah_used_total(), 1);
    }

    #[test]
    fn test_remove_busy_peer() {
        let mut t = AhOnly::new();
        let mut av = AddressVector::new(16);
        let mut dropped = Vec::new();
        let fi = av.insert(&mut t, None, false, &own(), &[], raw(1, 7, 1), &mut dropped, &mut Vec::new()).unwrap();
        av.peer_mut(fi).unwrap().track_tx(0);
        assert_eq!(av.remove(&mut t, None, fi), Err(RdmError::Busy));
        av.peer_mut(fi).unwrap().untrack_tx(0);
        av.remove(&mut t, None, fi).unwrap();
        assert_eq!(av.len(), 0);
        assert_eq!(t.live_ahs, 0);
    }

    #[test]
    fn test_reverse_lookup() {
        let mut t = AhOnly::new();
        let mut av = AddressVector::new(16);
        let mut dropped = Vec::new();
        let fi = av.insert(&mut t, None, false, &own(), &[], raw(2, 9, 1), &mut dropped, &mut Vec::new()).unwrap();
        let peer = av.peer(fi).unwrap();
        assert_eq!(av.reverse_lookup(peer.ahn, 9), Some(fi));
        assert_eq!(av.reverse_lookup(peer.ahn, 10), None);
    }

    #[test]
    fn test_self_detection() {
        let mut t = AhOnly::new();
        let mut av = AddressVector::new(16);
        let mut dropped = Vec::new();
        let me = own();
        let fi = av.insert(&mut t, None, false, &me, &[], me, &mut dropped, &mut Vec::new()).unwrap();
        let peer = av.peer(fi).unwrap();
        assert!(peer.is_self);
        assert!(peer.is_local);
    }
}
