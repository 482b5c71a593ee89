//! End-to-end protocol tests over an in-process loopback fabric.
//!
//! Run with: cargo test --test rdm_test -- --nocapture

use efa_rdm::{
    AtomicDatatype, AtomicOp, Ah, BufDesc, Config, CqEntry, CqOpType, CqStatus, Endpoint, FiAddr,
    FI_ADDR_UNSPEC, Gid, HmemRegistry, MemDesc, MemSeg, MemoryRegistrar, PktSource, RawAddress,
    RdmError, RdmResult, RmaIov, SendOpts, ShmCompletion, ShmTransport, Transport,
    TransportCompletion, comp_flags,
};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

const MTU: usize = 8192;

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// =============================================================================
// LOOPBACK FABRIC
// =============================================================================

type NodeKey = ([u8; 16], u16);

struct Delivery {
    from: NodeKey,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct Node {
    posted: VecDeque<(u64, usize, u64)>,
    cq: VecDeque<TransportCompletion>,
    ahn_by_gid: HashMap<[u8; 16], u16>,
    held: VecDeque<Delivery>,
}

#[derive(Default)]
struct Hub {
    nodes: HashMap<NodeKey, Node>,
    /// Every packet that crossed the fabric: (from, to, bytes).
    log: Vec<(NodeKey, NodeKey, Vec<u8>)>,
    /// Sources whose deliveries are parked until `release_held`.
    hold_from: HashSet<NodeKey>,
    /// Remaining sends the fabric accepts; `Some(0)` pushes back with
    /// EAGAIN.
    accept_budget: Option<usize>,
}

impl Hub {
    fn deliver(&mut self, to: NodeKey, delivery: Delivery) -> CqStatus {
        let Some(node) = self.nodes.get_mut(&to) else {
            return CqStatus::Err;
        };
        let Some((addr, cap, wr_id)) = node.posted.pop_front() else {
            return CqStatus::Rnr;
        };
        let len = delivery.bytes.len().min(cap);
        unsafe {
            std::ptr::copy_nonoverlapping(delivery.bytes.as_ptr(), addr as *mut u8, len);
        }
        let ahn = node.ahn_by_gid.get(&delivery.from.0).copied().unwrap_or(0xffff);
        node.cq.push_back(TransportCompletion {
            op: CqOpType::Recv,
            wr_id,
            status: CqStatus::Ok,
            byte_len: len,
            src: Some(PktSource { ahn, qpn: delivery.from.1 }),
        });
        CqStatus::Ok
    }

    fn release_held(&mut self, at: NodeKey) {
        let held: Vec<Delivery> = match self.nodes.get_mut(&at) {
            Some(node) => node.held.drain(..).collect(),
            None => return,
        };
        for delivery in held {
            // Drops on RNR are fine here; held packets model stale traffic.
            let _ = self.deliver(at, delivery);
        }
    }
}

struct FakeTransport {
    hub: Rc<RefCell<Hub>>,
    gid: Gid,
    qpn: u16,
    rdma_read: bool,
    max_tx: usize,
    next_ah: u16,
    ah_gid: HashMap<u64, [u8; 16]>,
}

impl FakeTransport {
    fn new(hub: &Rc<RefCell<Hub>>, gid_byte: u8, qpn: u16, rdma_read: bool) -> Self {
        let gid = Gid([gid_byte; 16]);
        hub.borrow_mut().nodes.insert((gid.0, qpn), Node::default());
        Self {
            hub: hub.clone(),
            gid,
            qpn,
            rdma_read,
            max_tx: 256,
            next_ah: 100,
            ah_gid: HashMap::new(),
        }
    }

    fn key(&self) -> NodeKey {
        (self.gid.0, self.qpn)
    }
}

impl Transport for FakeTransport {
    fn mtu(&self) -> usize {
        MTU
    }
    fn max_outstanding_tx(&self) -> usize {
        self.max_tx
    }
    fn supports_rdma_read(&self) -> bool {
        self.rdma_read
    }
    fn local_gid(&self) -> Gid {
        self.gid
    }
    fn local_qpn(&self) -> u16 {
        self.qpn
    }

    fn create_ah(&mut self, gid: Gid) -> RdmResult<Ah> {
        self.next_ah += 1;
        let ahn = self.next_ah;
        self.ah_gid.insert(ahn as u64, gid.0);
        let mut hub = self.hub.borrow_mut();
        let node = hub.nodes.get_mut(&self.key()).expect("node registered");
        node.ahn_by_gid.insert(gid.0, ahn);
        Ok(Ah { handle: ahn as u64, ahn })
    }

    fn destroy_ah(&mut self, handle: u64) {
        if let Some(gid) = self.ah_gid.remove(&handle) {
            let mut hub = self.hub.borrow_mut();
            if let Some(node) = hub.nodes.get_mut(&self.key()) {
                node.ahn_by_gid.remove(&gid);
            }
        }
    }

    fn post_send(
        &mut self,
        ah: u64,
        qpn: u16,
        iov: &[MemSeg],
        _lkeys: &[u64],
        wr_id: u64,
        _more: bool,
    ) -> RdmResult<()> {
        let mut hub = self.hub.borrow_mut();
        if let Some(budget) = hub.accept_budget {
            if budget == 0 {
                return Err(RdmError::Again);
            }
            hub.accept_budget = Some(budget - 1);
        }
        let dst_gid = *self.ah_gid.get(&ah).ok_or(RdmError::InvalidArg)?;
        let to = (dst_gid, qpn);

        let mut bytes = Vec::new();
        for seg in iov {
            let slice = unsafe { std::slice::from_raw_parts(seg.addr as *const u8, seg.len) };
            bytes.extend_from_slice(slice);
        }
        hub.log.push((self.key(), to, bytes.clone()));

        let byte_len = bytes.len();
        let delivery = Delivery { from: self.key(), bytes };
        let status = if hub.hold_from.contains(&self.key()) {
            hub.nodes.get_mut(&to).expect("dest registered").held.push_back(delivery);
            CqStatus::Ok
        } else {
            match hub.deliver(to, delivery) {
                CqStatus::Ok => CqStatus::Ok,
                CqStatus::Rnr => CqStatus::Rnr,
                CqStatus::Err => CqStatus::Err,
            }
        };
        let node = hub.nodes.get_mut(&self.key()).expect("node registered");
        node.cq.push_back(TransportCompletion {
            op: CqOpType::Send,
            wr_id,
            status,
            byte_len,
            src: None,
        });
        Ok(())
    }

    fn post_recv(&mut self, seg: MemSeg, _lkey: u64, wr_id: u64, _more: bool) -> RdmResult<()> {
        let mut hub = self.hub.borrow_mut();
        let node = hub.nodes.get_mut(&self.key()).expect("node registered");
        node.posted.push_back((seg.addr, seg.len, wr_id));
        Ok(())
    }

    fn post_read(
        &mut self,
        local: MemSeg,
        _lkey: u64,
        remote_addr: u64,
        _rkey: u64,
        wr_id: u64,
    ) -> RdmResult<()> {
        unsafe {
            std::ptr::copy_nonoverlapping(remote_addr as *const u8, local.addr as *mut u8, local.len);
        }
        let mut hub = self.hub.borrow_mut();
        let node = hub.nodes.get_mut(&self.key()).expect("node registered");
        node.cq.push_back(TransportCompletion {
            op: CqOpType::Read,
            wr_id,
            status: CqStatus::Ok,
            byte_len: local.len,
            src: None,
        });
        Ok(())
    }

    fn poll_cq(&mut self, max: usize, out: &mut Vec<TransportCompletion>) {
        let mut hub = self.hub.borrow_mut();
        let node = hub.nodes.get_mut(&self.key()).expect("node registered");
        for _ in 0..max {
            match node.cq.pop_front() {
                Some(comp) => out.push(comp),
                None => break,
            }
        }
    }
}

// =============================================================================
// SHM LOOPBACK
// =============================================================================

type ShmName = [u8; 18];

#[derive(Default)]
struct ShmNode {
    posted: VecDeque<(u64, usize, u64)>,
    cq: VecDeque<ShmCompletion>,
    av: HashMap<ShmName, u64>,
    next_addr: u64,
}

#[derive(Default)]
struct ShmHub {
    nodes: HashMap<ShmName, ShmNode>,
    delivered: usize,
}

struct FakeShm {
    hub: Rc<RefCell<ShmHub>>,
    name: ShmName,
}

impl FakeShm {
    fn new(hub: &Rc<RefCell<ShmHub>>, name: ShmName) -> Self {
        hub.borrow_mut().nodes.insert(name, ShmNode::default());
        Self { hub: hub.clone(), name }
    }
}

impl ShmTransport for FakeShm {
    fn av_insert(&mut self, name: &ShmName) -> RdmResult<u64> {
        let mut hub = self.hub.borrow_mut();
        let node = hub.nodes.get_mut(&self.name).expect("node registered");
        if let Some(&addr) = node.av.get(name) {
            return Ok(addr);
        }
        node.next_addr += 1;
        let addr = node.next_addr;
        node.av.insert(*name, addr);
        Ok(addr)
    }

    fn av_remove(&mut self, shm_addr: u64) {
        let mut hub = self.hub.borrow_mut();
        let node = hub.nodes.get_mut(&self.name).expect("node registered");
        node.av.retain(|_, addr| *addr != shm_addr);
    }

    fn post_send(&mut self, shm_addr: u64, iov: &[MemSeg], wr_id: u64) -> RdmResult<()> {
        let mut hub = self.hub.borrow_mut();
        let me = hub.nodes.get(&self.name).expect("node registered");
        let dest_name = *me
            .av
            .iter()
            .find(|(_, addr)| **addr == shm_addr)
            .map(|(name, _)| name)
            .ok_or(RdmError::InvalidArg)?;

        let mut bytes = Vec::new();
        for seg in iov {
            let slice = unsafe { std::slice::from_raw_parts(seg.addr as *const u8, seg.len) };
            bytes.extend_from_slice(slice);
        }
        let byte_len = bytes.len();

        let dest = hub.nodes.get_mut(&dest_name).ok_or(RdmError::InvalidArg)?;
        let status = match dest.posted.pop_front() {
            Some((addr, cap, recv_wr)) => {
                let len = byte_len.min(cap);
                unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, len);
                }
                let src_addr = dest.av.get(&self.name).copied();
                dest.cq.push_back(ShmCompletion {
                    op: CqOpType::Recv,
                    wr_id: recv_wr,
                    status: CqStatus::Ok,
                    byte_len: len,
                    src_addr,
                });
                CqStatus::Ok
            }
            None => CqStatus::Rnr,
        };
        hub.delivered += 1;
        let me = hub.nodes.get_mut(&self.name).expect("node registered");
        me.cq.push_back(ShmCompletion { op: CqOpType::Send, wr_id, status, byte_len, src_addr: None });
        Ok(())
    }

    fn post_recv(&mut self, seg: MemSeg, wr_id: u64) -> RdmResult<()> {
        let mut hub = self.hub.borrow_mut();
        let node = hub.nodes.get_mut(&self.name).expect("node registered");
        node.posted.push_back((seg.addr, seg.len, wr_id));
        Ok(())
    }

    fn poll_cq(&mut self, max: usize, out: &mut Vec<ShmCompletion>) {
        let mut hub = self.hub.borrow_mut();
        let node = hub.nodes.get_mut(&self.name).expect("node registered");
        for _ in 0..max {
            match node.cq.pop_front() {
                Some(comp) => out.push(comp),
                None => break,
            }
        }
    }
}

// =============================================================================
// REGISTRAR
// =============================================================================

struct FakeRegistrar {
    next: u64,
    live: Rc<RefCell<HashSet<u64>>>,
}

impl FakeRegistrar {
    fn new() -> (Self, Rc<RefCell<HashSet<u64>>>) {
        let live = Rc::new(RefCell::new(HashSet::new()));
        (Self { next: 1000, live: live.clone() }, live)
    }
}

impl MemoryRegistrar for FakeRegistrar {
    fn register(&mut self, _seg: MemSeg, _acc: u32) -> RdmResult<MemDesc> {
        self.next += 1;
        self.live.borrow_mut().insert(self.next);
        Ok(MemDesc { lkey: self.next, rkey: self.next, handle: self.next })
    }
    fn deregister(&mut self, handle: u64) {
        self.live.borrow_mut().remove(&handle);
    }
    fn check(&self, _key: u64, _addr: u64, _len: usize, _write: bool) -> bool {
        true
    }
}

// =============================================================================
// HARNESS
// =============================================================================

struct TestNode {
    ep: Endpoint,
    raw: RawAddress,
}

fn open_node(hub: &Rc<RefCell<Hub>>, gid_byte: u8, qpn: u16, rdma_read: bool, cfg: Config) -> TestNode {
    let transport = FakeTransport::new(hub, gid_byte, qpn, rdma_read);
    let (registrar, _live) = FakeRegistrar::new();
    let ep = Endpoint::new(cfg, Box::new(transport), None, Box::new(registrar), HmemRegistry::new())
        .expect("endpoint open");
    let raw = ep.raw_addr();
    TestNode { ep, raw }
}

fn pump2(a: &mut Endpoint, b: &mut Endpoint, rounds: usize) {
    for _ in 0..rounds {
        a.progress();
        b.progress();
    }
}

fn drain(ep: &mut Endpoint) -> Vec<CqEntry> {
    let mut out = Vec::new();
    ep.cq_read(usize::MAX, &mut out);
    out
}

fn seg_of(buf: &[u8]) -> MemSeg {
    MemSeg::new(buf.as_ptr() as u64, buf.len())
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

/// Establish the feature handshake in both directions with a ping-pong.
fn handshake(a: &mut TestNode, b: &mut TestNode, a_addr_of_b: FiAddr, b_addr_of_a: FiAddr) {
    let ping = b"hs";
    let mut buf = [0u8; 8];
    a.ep.recv(FI_ADDR_UNSPEC, MemSeg::new(buf.as_mut_ptr() as u64, buf.len()), BufDesc::default(), 901)
        .unwrap();
    b.ep.send(b_addr_of_a, seg_of(ping), BufDesc::default(), 902).unwrap();
    pump2(&mut a.ep, &mut b.ep, 4);
    let mut buf2 = [0u8; 8];
    b.ep.recv(FI_ADDR_UNSPEC, MemSeg::new(buf2.as_mut_ptr() as u64, buf2.len()), BufDesc::default(), 903)
        .unwrap();
    a.ep.send(a_addr_of_b, seg_of(ping), BufDesc::default(), 904).unwrap();
    pump2(&mut a.ep, &mut b.ep, 4);
    drain(&mut a.ep);
    drain(&mut b.ep);
}

// =============================================================================
// TESTS
// =============================================================================

#[test]
fn test_eager_ping_pong() {
    init_logging();
    let hub = Rc::new(RefCell::new(Hub::default()));
    let mut a = open_node(&hub, 1, 1, false, Config::default());
    let mut b = open_node(&hub, 2, 2, false, Config::default());

    let b_at_a = a.ep.av_insert(b.raw).unwrap();
    let a_at_b = b.ep.av_insert(a.raw).unwrap();

    let payload = b"ABCDEFGHIJKLMNOP";
    let mut rbuf = [0u8; 16];
    a.ep.recv(FI_ADDR_UNSPEC, MemSeg::new(rbuf.as_mut_ptr() as u64, 16), BufDesc::default(), 11)
        .unwrap();
    b.ep.send(a_at_b, seg_of(payload), BufDesc::default(), 22).unwrap();
    pump2(&mut a.ep, &mut b.ep, 4);

    let a_comps = drain(&mut a.ep);
    assert_eq!(a_comps.len(), 1);
    assert_eq!(a_comps[0].context, 11);
    assert_eq!(a_comps[0].len, 16);
    assert_eq!(a_comps[0].src_addr, b_at_a);
    assert_eq!(&rbuf, payload);

    let b_comps = drain(&mut b.ep);
    assert_eq!(b_comps.len(), 1);
    assert_eq!(b_comps[0].context, 22);
    assert!(b_comps[0].flags & comp_flags::SEND != 0);

    // The first REQ from B carried the raw-address header.
    let first = hub
        .borrow()
        .log
        .iter()
        .find(|(from, _, bytes)| *from == (b.raw.gid.0, b.raw.qpn) && bytes[0] >= 64)
        .map(|(_, _, bytes)| bytes.clone())
        .expect("B sent a REQ");
    let flags = u16::from_le_bytes([first[2], first[3]]);
    assert_eq!(flags & 0x04, 0x04, "msg class flag");
    assert_eq!(flags & 0x01, 0x01, "raw address header present pre-handshake");

    // Reverse direction: A now knows B's handshake, so its REQ drops the
    // raw-address header.
    let mut rbuf2 = [0u8; 16];
    b.ep.recv(FI_ADDR_UNSPEC, MemSeg::new(rbuf2.as_mut_ptr() as u64, 16), BufDesc::default(), 33)
        .unwrap();
    a.ep.send(b_at_a, seg_of(payload), BufDesc::default(), 44).unwrap();
    pump2(&mut a.ep, &mut b.ep, 4);
    assert_eq!(&rbuf2, payload);

    let a_req = hub
        .borrow()
        .log
        .iter()
        .filter(|(from, _, bytes)| *from == (a.raw.gid.0, a.raw.qpn) && bytes[0] >= 64)
        .map(|(_, _, bytes)| bytes.clone())
        .next_back()
        .expect("A sent a REQ");
    let flags = u16::from_le_bytes([a_req[2], a_req[3]]);
    assert_eq!(flags & 0x01, 0, "raw address header cleared post-handshake");
    assert_eq!(flags & 0x40, 0x40, "connid header requested by peer");
}

#[test]
fn test_longcts_one_mib() {
    init_logging();
    let hub = Rc::new(RefCell::new(Hub::default()));
    let mut a = open_node(&hub, 1, 1, false, Config::default());
    let mut b = open_node(&hub, 2, 2, false, Config::default());
    let b_at_a = a.ep.av_insert(b.raw).unwrap();
    let a_at_b = b.ep.av_insert(a.raw).unwrap();
    handshake(&mut a, &mut b, b_at_a, a_at_b);
    hub.borrow_mut().log.clear();

    let payload = pattern(1 << 20);
    let mut rbuf = vec![0u8; 1 << 20];
    a.ep.recv(FI_ADDR_UNSPEC, MemSeg::new(rbuf.as_mut_ptr() as u64, rbuf.len()), BufDesc::default(), 1)
        .unwrap();
    b.ep.send(a_at_b, seg_of(&payload), BufDesc::default(), 2).unwrap();
    pump2(&mut a.ep, &mut b.ep, 300);

    assert_eq!(drain(&mut a.ep).len(), 1);
    assert_eq!(drain(&mut b.ep).len(), 1);
    assert_eq!(rbuf, payload, "1 MiB reassembled byte-exactly");

    // Wire accounting: one LONGCTS RTM, at least one CTS, and exactly
    // ceil((total - first_chunk) / data_payload) DATA packets.
    let log = hub.borrow();
    let rtms: Vec<&Vec<u8>> =
        log.log.iter().filter(|(_, _, b)| b[0] == 68).map(|(_, _, b)| b).collect();
    assert_eq!(rtms.len(), 1);
    let cts_count = log.log.iter().filter(|(_, _, b)| b[0] == 4).count();
    assert!(cts_count >= 1, "at least one CTS round");

    let first_chunk = MTU - (4 + 20 + 4); // base + longcts mandatory + connid
    let data_payload = MTU - (4 + 20 + 4); // base + data mandatory + connid
    let expected_data = ((1 << 20) - first_chunk).div_ceil(data_payload);
    let data_count = log.log.iter().filter(|(_, _, b)| b[0] == 5).count();
    assert_eq!(data_count, expected_data);
}

#[test]
fn test_longread_delivery_complete() {
    init_logging();
    let hub = Rc::new(RefCell::new(Hub::default()));
    let mut a = open_node(&hub, 1, 1, true, Config::default());
    let mut b = open_node(&hub, 2, 2, true, Config::default());
    let b_at_a = a.ep.av_insert(b.raw).unwrap();
    let a_at_b = b.ep.av_insert(a.raw).unwrap();
    handshake(&mut a, &mut b, b_at_a, a_at_b);
    hub.borrow_mut().log.clear();

    let payload = pattern(256 * 1024);
    let mut rbuf = vec![0u8; 256 * 1024];
    a.ep.recv(FI_ADDR_UNSPEC, MemSeg::new(rbuf.as_mut_ptr() as u64, rbuf.len()), BufDesc::default(), 1)
        .unwrap();
    b.ep.send_with_opts(
        a_at_b,
        &[seg_of(&payload)],
        &[BufDesc::default()],
        SendOpts { delivery_complete: true, ..Default::default() },
        2,
    )
    .unwrap();
    pump2(&mut a.ep, &mut b.ep, 50);

    assert_eq!(rbuf, payload);
    let a_comps = drain(&mut a.ep);
    assert_eq!(a_comps.len(), 1);
    let b_comps = drain(&mut b.ep);
    assert_eq!(b_comps.len(), 1);
    assert!(b_comps[0].flags & comp_flags::DELIVERY_COMPLETE != 0);

    let log = hub.borrow();
    assert!(log.log.iter().any(|(_, _, b)| b[0] == 142), "DC longread RTM on the wire");
    assert!(log.log.iter().any(|(_, _, b)| b[0] == 8), "EOR terminates the reads");
    assert!(log.log.iter().any(|(_, _, b)| b[0] == 10), "RECEIPT confirms delivery");
    assert!(!log.log.iter().any(|(_, _, b)| b[0] == 5), "no DATA packets in a longread flow");
}

#[test]
fn test_unexpected_eager() {
    init_logging();
    let hub = Rc::new(RefCell::new(Hub::default()));
    let mut a = open_node(&hub, 1, 1, false, Config::default());
    let mut b = open_node(&hub, 2, 2, false, Config::default());
    let _ = a.ep.av_insert(b.raw).unwrap();
    let a_at_b = b.ep.av_insert(a.raw).unwrap();

    let payload = pattern(512);
    b.ep.send(a_at_b, seg_of(&payload), BufDesc::default(), 7).unwrap();
    pump2(&mut a.ep, &mut b.ep, 4);
    assert!(drain(&mut a.ep).is_empty(), "nothing posted yet");

    let mut rbuf = vec![0u8; 512];
    a.ep.recv(FI_ADDR_UNSPEC, MemSeg::new(rbuf.as_mut_ptr() as u64, 512), BufDesc::default(), 8)
        .unwrap();
    let comps = drain(&mut a.ep);
    assert_eq!(comps.len(), 1, "completion written from parked data");
    assert_eq!(comps[0].len, 512);
    assert_eq!(rbuf, payload);
    assert_eq!(a.ep.stats().unexpected_msgs, 1);
}

#[test]
fn test_qp_reuse_stale_connid_dropped() {
    init_logging();
    let hub = Rc::new(RefCell::new(Hub::default()));
    let mut a = open_node(&hub, 1, 1, false, Config::default());
    let mut b1 = open_node(&hub, 2, 2, false, Config::default());
    let b1_at_a = a.ep.av_insert(b1.raw).unwrap();
    let a_at_b1 = b1.ep.av_insert(a.raw).unwrap();
    // Handshake first: the stale traffic below carries connid-only headers.
    handshake(&mut a, &mut b1, b1_at_a, a_at_b1);

    // Three messages leave the old QP but stall in flight.
    hub.borrow_mut().hold_from.insert((b1.raw.gid.0, b1.raw.qpn));
    for i in 0..3 {
        b1.ep.send(a_at_b1, seg_of(b"stale"), BufDesc::default(), 100 + i).unwrap();
        b1.ep.progress();
    }

    // The QP is destroyed and recreated: same GID and QPN, fresh connid.
    // Packets already in flight stay parked until released below.
    hub.borrow_mut().hold_from.clear();
    let mut b2 = open_node(&hub, 2, 2, false, Config::default());
    assert_ne!(b1.raw.connid, b2.raw.connid);
    let a_at_b2 = b2.ep.av_insert(a.raw).unwrap();

    let mut rbuf = [0u8; 16];
    a.ep.recv(FI_ADDR_UNSPEC, MemSeg::new(rbuf.as_mut_ptr() as u64, 16), BufDesc::default(), 1)
        .unwrap();
    b2.ep.send(a_at_b2, seg_of(b"fresh"), BufDesc::default(), 2).unwrap();
    pump2(&mut a.ep, &mut b2.ep, 4);

    // Now the three stale packets arrive, each carrying the old connid.
    hub.borrow_mut().release_held((a.raw.gid.0, a.raw.qpn));
    for _ in 0..4 {
        a.ep.progress();
    }

    let comps = drain(&mut a.ep);
    assert_eq!(comps.len(), 1, "only the fresh message completes");
    assert_eq!(&rbuf[..5], b"fresh");

    // Every stale packet carried the old connid and was silently dropped.
    let b_fi = comps[0].src_addr;
    let stats = a.ep.peer_stats(b_fi).expect("fresh peer inserted");
    assert_eq!(stats.dropped_connid, 3);
}

#[test]
fn test_av_remove_while_busy() {
    init_logging();
    let hub = Rc::new(RefCell::new(Hub::default()));
    let mut a = open_node(&hub, 1, 1, false, Config::default());
    let mut b = open_node(&hub, 2, 2, false, Config::default());
    let _ = a.ep.av_insert(b.raw).unwrap();
    let a_at_b = b.ep.av_insert(a.raw).unwrap();

    let mut rbuf = [0u8; 32];
    a.ep.recv(FI_ADDR_UNSPEC, MemSeg::new(rbuf.as_mut_ptr() as u64, 32), BufDesc::default(), 1)
        .unwrap();

    // Hold the fabric so the send stays outstanding.
    hub.borrow_mut().accept_budget = Some(0);
    let payload = pattern(32);
    b.ep.send(a_at_b, seg_of(&payload), BufDesc::default(), 2).unwrap();
    assert_eq!(b.ep.av_remove(a_at_b), Err(RdmError::Busy));

    hub.borrow_mut().accept_budget = None;
    pump2(&mut a.ep, &mut b.ep, 6);
    assert_eq!(drain(&mut b.ep).len(), 1);

    b.ep.av_remove(a_at_b).expect("no references remain");
    assert_eq!(b.ep.av_stats().peers, 0);
    assert_eq!(b.ep.av_stats().ah_entries, 0, "AH refcount reached zero");
}

#[test]
fn test_medium_partial_send_redriven() {
    init_logging();
    let hub = Rc::new(RefCell::new(Hub::default()));
    let mut a = open_node(&hub, 1, 1, false, Config::default());
    let mut b = open_node(&hub, 2, 2, false, Config::default());
    let _ = a.ep.av_insert(b.raw).unwrap();
    let a_at_b = b.ep.av_insert(a.raw).unwrap();

    // Four segments; the fabric accepts all but the last.
    let total = 4 * (MTU - 64);
    let payload = pattern(total);
    let mut rbuf = vec![0u8; total];
    a.ep.recv(FI_ADDR_UNSPEC, MemSeg::new(rbuf.as_mut_ptr() as u64, total), BufDesc::default(), 1)
        .unwrap();

    hub.borrow_mut().accept_budget = Some(3);
    b.ep.send(a_at_b, seg_of(&payload), BufDesc::default(), 2).unwrap();
    a.ep.progress();
    b.ep.progress();
    assert!(drain(&mut a.ep).is_empty(), "message incomplete while a segment is queued");

    // Budget restored: the progress loop re-drives the queued segment.
    hub.borrow_mut().accept_budget = None;
    pump2(&mut a.ep, &mut b.ep, 6);
    assert_eq!(drain(&mut a.ep).len(), 1);
    assert_eq!(drain(&mut b.ep).len(), 1);
    assert_eq!(rbuf, payload);
}

#[test]
fn test_tagged_matching_with_ignore() {
    init_logging();
    let hub = Rc::new(RefCell::new(Hub::default()));
    let mut a = open_node(&hub, 1, 1, false, Config::default());
    let mut b = open_node(&hub, 2, 2, false, Config::default());
    let _ = a.ep.av_insert(b.raw).unwrap();
    let a_at_b = b.ep.av_insert(a.raw).unwrap();

    let mut rbuf = [0u8; 16];
    // Match any tag in the 0xAB00 series.
    a.ep.trecv(
        FI_ADDR_UNSPEC,
        MemSeg::new(rbuf.as_mut_ptr() as u64, 16),
        BufDesc::default(),
        0xab00,
        0x00ff,
        1,
    )
    .unwrap();
    b.ep.tsend(a_at_b, seg_of(b"tagged-payload!!"), BufDesc::default(), 0xab42, 2).unwrap();
    pump2(&mut a.ep, &mut b.ep, 4);

    let comps = drain(&mut a.ep);
    assert_eq!(comps.len(), 1);
    assert!(comps[0].flags & comp_flags::TAGGED != 0);
    assert_eq!(comps[0].tag, 0xab00, "posted tag reported");
    assert_eq!(&rbuf, b"tagged-payload!!");
}

#[test]
fn test_cancel_after_match_before_data() {
    init_logging();
    let hub = Rc::new(RefCell::new(Hub::default()));
    let mut a = open_node(&hub, 1, 1, false, Config::default());
    let mut b = open_node(&hub, 2, 2, false, Config::default());
    let b_at_a = a.ep.av_insert(b.raw).unwrap();
    let a_at_b = b.ep.av_insert(a.raw).unwrap();
    handshake(&mut a, &mut b, b_at_a, a_at_b);

    let total = 1 << 20;
    let payload = pattern(total);
    let mut rbuf = vec![0u8; total];
    a.ep.recv(FI_ADDR_UNSPEC, MemSeg::new(rbuf.as_mut_ptr() as u64, total), BufDesc::default(), 77)
        .unwrap();
    b.ep.send(a_at_b, seg_of(&payload), BufDesc::default(), 88).unwrap();

    // One round: the RTM lands and the entry matches, data still flowing.
    b.ep.progress();
    a.ep.progress();
    a.ep.cancel(77).unwrap();

    pump2(&mut a.ep, &mut b.ep, 300);
    assert!(drain(&mut a.ep).is_empty(), "no data completion after cancel");
    let err = a.ep.cq_readerr().expect("exactly one canceled entry");
    assert_eq!(err.context, 77);
    assert_eq!(err.err, RdmError::Canceled);
    assert!(a.ep.cq_readerr().is_none());
}

#[test]
fn test_inject() {
    init_logging();
    let hub = Rc::new(RefCell::new(Hub::default()));
    let mut a = open_node(&hub, 1, 1, false, Config::default());
    let mut b = open_node(&hub, 2, 2, false, Config::default());
    let _ = a.ep.av_insert(b.raw).unwrap();
    let a_at_b = b.ep.av_insert(a.raw).unwrap();

    let mut rbuf = [0u8; 6];
    a.ep.recv(FI_ADDR_UNSPEC, MemSeg::new(rbuf.as_mut_ptr() as u64, 6), BufDesc::default(), 1)
        .unwrap();
    {
        // Buffer may be reused immediately after inject returns.
        let transient = b"inject".to_vec();
        b.ep.inject(a_at_b, &transient).unwrap();
    }
    pump2(&mut a.ep, &mut b.ep, 4);

    assert_eq!(&rbuf, b"inject");
    assert_eq!(drain(&mut a.ep).len(), 1);
    assert!(drain(&mut b.ep).is_empty(), "inject writes no completion");
}

#[test]
fn test_multi_recv_slices() {
    init_logging();
    let hub = Rc::new(RefCell::new(Hub::default()));
    let mut a = open_node(&hub, 1, 1, false, Config::default());
    let mut b = open_node(&hub, 2, 2, false, Config::default());
    let _ = a.ep.av_insert(b.raw).unwrap();
    let a_at_b = b.ep.av_insert(a.raw).unwrap();

    let mut big = vec![0u8; 80];
    a.ep.recv_multi(MemSeg::new(big.as_mut_ptr() as u64, 80), BufDesc::default(), 5).unwrap();

    b.ep.send(a_at_b, seg_of(b"first-message-xx"), BufDesc::default(), 1).unwrap();
    pump2(&mut a.ep, &mut b.ep, 4);
    b.ep.send(a_at_b, seg_of(b"second-message-x"), BufDesc::default(), 2).unwrap();
    pump2(&mut a.ep, &mut b.ep, 4);

    let comps = drain(&mut a.ep);
    // Two per-message completions; the buffer is retired once remaining
    // space drops under the multi-recv minimum (80 - 32 = 48 < 64).
    assert_eq!(comps.len(), 3);
    assert_eq!(comps[0].len, 16);
    assert_eq!(comps[1].len, 16);
    assert!(comps[2].flags & comp_flags::MULTI_RECV != 0);
    assert_eq!(comps[2].len, 32, "consumed bytes reported at retirement");
    assert_eq!(&big[..16], b"first-message-xx");
    assert_eq!(&big[16..32], b"second-message-x");
}

#[test]
fn test_emulated_write_with_cq_data() {
    init_logging();
    let hub = Rc::new(RefCell::new(Hub::default()));
    let mut a = open_node(&hub, 1, 1, false, Config::default());
    let mut b = open_node(&hub, 2, 2, false, Config::default());
    let _ = a.ep.av_insert(b.raw).unwrap();
    let a_at_b = b.ep.av_insert(a.raw).unwrap();

    let mut target = vec![0u8; 256];
    let payload = pattern(256);
    let rma = [RmaIov { addr: target.as_mut_ptr() as u64, len: 256, key: 99 }];
    b.ep.write_with_data(a_at_b, &[seg_of(&payload)], &[BufDesc::default()], &rma, 0xfeed, 3)
        .unwrap();
    pump2(&mut a.ep, &mut b.ep, 6);

    assert_eq!(target, payload, "payload landed in the target region");
    let b_comps = drain(&mut b.ep);
    assert_eq!(b_comps.len(), 1);
    assert!(b_comps[0].flags & comp_flags::WRITE != 0);

    let a_comps = drain(&mut a.ep);
    assert_eq!(a_comps.len(), 1, "remote CQ data surfaces at the target");
    assert!(a_comps[0].flags & comp_flags::REMOTE_CQ_DATA != 0);
    assert_eq!(a_comps[0].data, 0xfeed);
}

#[test]
fn test_longcts_write() {
    init_logging();
    let hub = Rc::new(RefCell::new(Hub::default()));
    let mut a = open_node(&hub, 1, 1, false, Config::default());
    let mut b = open_node(&hub, 2, 2, false, Config::default());
    let b_at_a = a.ep.av_insert(b.raw).unwrap();
    let a_at_b = b.ep.av_insert(a.raw).unwrap();
    handshake(&mut a, &mut b, b_at_a, a_at_b);

    let total = 200 * 1024;
    let mut target = vec![0u8; total];
    let payload = pattern(total);
    let rma = [RmaIov { addr: target.as_mut_ptr() as u64, len: total as u64, key: 7 }];
    b.ep.write(a_at_b, &[seg_of(&payload)], &[BufDesc::default()], &rma, 9).unwrap();
    pump2(&mut a.ep, &mut b.ep, 100);

    assert_eq!(target, payload);
    assert_eq!(drain(&mut b.ep).len(), 1);
}

#[test]
fn test_emulated_read() {
    init_logging();
    let hub = Rc::new(RefCell::new(Hub::default()));
    let mut a = open_node(&hub, 1, 1, false, Config::default());
    let mut b = open_node(&hub, 2, 2, false, Config::default());
    let _ = a.ep.av_insert(b.raw).unwrap();
    let a_at_b = b.ep.av_insert(a.raw).unwrap();

    // B reads 100 KiB straight out of A's registered region.
    let source = pattern(100 * 1024);
    let mut dest = vec![0u8; 100 * 1024];
    let rma = [RmaIov { addr: source.as_ptr() as u64, len: source.len() as u64, key: 55 }];
    b.ep.read(a_at_b, &[MemSeg::new(dest.as_mut_ptr() as u64, dest.len())], &[BufDesc::default()], &rma, 4)
        .unwrap();
    pump2(&mut a.ep, &mut b.ep, 100);

    assert_eq!(dest, source);
    let comps = drain(&mut b.ep);
    assert_eq!(comps.len(), 1);
    assert!(comps[0].flags & comp_flags::READ != 0);
}

#[test]
fn test_direct_read() {
    init_logging();
    let hub = Rc::new(RefCell::new(Hub::default()));
    let mut a = open_node(&hub, 1, 1, true, Config::default());
    let mut b = open_node(&hub, 2, 2, true, Config::default());
    let b_at_a = a.ep.av_insert(b.raw).unwrap();
    let a_at_b = b.ep.av_insert(a.raw).unwrap();
    handshake(&mut a, &mut b, b_at_a, a_at_b);
    hub.borrow_mut().log.clear();

    let source = pattern(64 * 1024);
    let mut dest = vec![0u8; 64 * 1024];
    let rma = [RmaIov { addr: source.as_ptr() as u64, len: source.len() as u64, key: 55 }];
    b.ep.read(a_at_b, &[MemSeg::new(dest.as_mut_ptr() as u64, dest.len())], &[BufDesc::default()], &rma, 4)
        .unwrap();
    pump2(&mut a.ep, &mut b.ep, 20);

    assert_eq!(dest, source);
    assert_eq!(drain(&mut b.ep).len(), 1);
    assert!(hub.borrow().log.is_empty(), "direct read sends no protocol packets");
}

#[test]
fn test_atomic_fetch_add_and_cswap() {
    init_logging();
    let hub = Rc::new(RefCell::new(Hub::default()));
    let mut a = open_node(&hub, 1, 1, false, Config::default());
    let mut b = open_node(&hub, 2, 2, false, Config::default());
    let _ = a.ep.av_insert(b.raw).unwrap();
    let a_at_b = b.ep.av_insert(a.raw).unwrap();

    let mut counter = 40u64.to_le_bytes();
    let rma = [RmaIov { addr: counter.as_mut_ptr() as u64, len: 8, key: 3 }];

    // fetch-add 2
    let operand = 2u64.to_le_bytes();
    let mut fetched = [0u8; 8];
    b.ep.atomic_fetch(
        a_at_b,
        AtomicDatatype::Uint64,
        AtomicOp::Sum,
        &[seg_of(&operand)],
        &[BufDesc::default()],
        &rma,
        &[MemSeg::new(fetched.as_mut_ptr() as u64, 8)],
        &[BufDesc::default()],
        1,
    )
    .unwrap();
    pump2(&mut a.ep, &mut b.ep, 6);
    assert_eq!(u64::from_le_bytes(fetched), 40, "original value fetched");
    assert_eq!(u64::from_le_bytes(counter), 42, "sum applied");
    let comps = drain(&mut b.ep);
    assert_eq!(comps.len(), 1);
    assert!(comps[0].flags & comp_flags::ATOMIC != 0);

    // compare-and-swap: expect 42, install 100
    let desired = 100u64.to_le_bytes();
    let expect = 42u64.to_le_bytes();
    let mut prev = [0u8; 8];
    b.ep.atomic_compare(
        a_at_b,
        AtomicDatatype::Uint64,
        &[seg_of(&desired)],
        &[BufDesc::default()],
        &rma,
        &[seg_of(&expect)],
        &[MemSeg::new(prev.as_mut_ptr() as u64, 8)],
        &[BufDesc::default()],
        2,
    )
    .unwrap();
    pump2(&mut a.ep, &mut b.ep, 6);
    assert_eq!(u64::from_le_bytes(prev), 42);
    assert_eq!(u64::from_le_bytes(counter), 100);
    assert_eq!(drain(&mut b.ep).len(), 1);
}

#[test]
fn test_dc_requires_peer_support() {
    init_logging();
    let hub = Rc::new(RefCell::new(Hub::default()));
    let mut cfg_no_dc = Config::default();
    cfg_no_dc.features = 0;
    let mut a = open_node(&hub, 1, 1, false, cfg_no_dc);
    let mut b = open_node(&hub, 2, 2, false, Config::default());
    let b_at_a = a.ep.av_insert(b.raw).unwrap();
    let a_at_b = b.ep.av_insert(a.raw).unwrap();
    handshake(&mut a, &mut b, b_at_a, a_at_b);

    let payload = pattern(64);
    let err = b.ep.send_with_opts(
        a_at_b,
        &[seg_of(&payload)],
        &[BufDesc::default()],
        SendOpts { delivery_complete: true, ..Default::default() },
        1,
    );
    assert_eq!(err, Err(RdmError::OpNotSupported));
}

#[test]
fn test_shm_fast_path() {
    init_logging();
    let hub = Rc::new(RefCell::new(Hub::default()));
    let shm_hub = Rc::new(RefCell::new(ShmHub::default()));

    let ta = FakeTransport::new(&hub, 1, 1, false);
    let tb = FakeTransport::new(&hub, 2, 2, false);
    let sa = FakeShm::new(&shm_hub, RawAddress::new(Gid([1; 16]), 1, 0).shm_name());
    let sb = FakeShm::new(&shm_hub, RawAddress::new(Gid([2; 16]), 2, 0).shm_name());

    let mut cfg_a = Config::default();
    cfg_a.local_gids = vec![Gid([2; 16])];
    let mut cfg_b = Config::default();
    cfg_b.local_gids = vec![Gid([1; 16])];

    let (reg_a, _) = FakeRegistrar::new();
    let (reg_b, _) = FakeRegistrar::new();
    let mut a = Endpoint::new(cfg_a, Box::new(ta), Some(Box::new(sa)), Box::new(reg_a), HmemRegistry::new())
        .unwrap();
    let mut b = Endpoint::new(cfg_b, Box::new(tb), Some(Box::new(sb)), Box::new(reg_b), HmemRegistry::new())
        .unwrap();

    let a_raw = a.raw_addr();
    let b_raw = b.raw_addr();
    let _ = a.av_insert(b_raw).unwrap();
    let a_at_b = b.av_insert(a_raw).unwrap();

    let mut rbuf = [0u8; 9];
    a.recv(FI_ADDR_UNSPEC, MemSeg::new(rbuf.as_mut_ptr() as u64, 9), BufDesc::default(), 1).unwrap();
    b.send(a_at_b, seg_of(b"intranode"), BufDesc::default(), 2).unwrap();
    pump2(&mut a, &mut b, 4);

    assert_eq!(&rbuf, b"intranode");
    assert_eq!(drain(&mut a).len(), 1);
    assert_eq!(drain(&mut b).len(), 1);
    assert!(shm_hub.borrow().delivered > 0, "traffic rode the shm path");
    assert!(hub.borrow().log.is_empty(), "nothing crossed the wire transport");
}

#[test]
fn test_reinsert_returns_same_handle() {
    init_logging();
    let hub = Rc::new(RefCell::new(Hub::default()));
    let mut a = open_node(&hub, 1, 1, false, Config::default());
    let b = open_node(&hub, 2, 2, false, Config::default());

    let first = a.ep.av_insert(b.raw).unwrap();
    let second = a.ep.av_insert(b.raw).unwrap();
    assert_eq!(first, second);
    assert_eq!(a.ep.av_lookup(first).unwrap(), b.raw);
    assert_eq!(a.ep.av_stats().ah_entries, 1);
}
