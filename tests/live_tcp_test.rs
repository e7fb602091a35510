//! Live TCP test: two peers on localhost
//!
//! Usage:
//!   cargo test --release --test live_tcp_test -- --nocapture

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use repnet::core::{KindInfo, KindTable, Nid, TypeTag};
use repnet::network::{
    Acceptor, Connection, ConnectionStatus, P2pAcceptor, P2pTransport, PeerId, SessionReceiver,
    TcpTransport,
};
use repnet::protocol::{
    BinaryReader, BinaryWriter, ConnectReason, MessageHeader, MessageId, Reader, Writer,
};
use repnet::{NetworkProfiler, TransportConfig};

const UNIT: TypeTag = TypeTag(4);
static ROWS: [KindInfo; 1] = [KindInfo::new(UNIT, "Unit", true)];
static KINDS: KindTable = KindTable::new(&ROWS);

fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

#[derive(Default)]
struct Collector {
    connected: Mutex<Vec<Arc<dyn Connection>>>,
    updates: Mutex<Vec<(u32, Vec<u8>)>>,
}

impl SessionReceiver for Collector {
    fn on_connected(&self, connection: Arc<dyn Connection>) {
        self.connected.lock().push(connection);
    }

    fn on_message(&self, _connection: &dyn Connection, message: &[u8]) {
        let mut reader = BinaryReader::new(message).with_kinds(KINDS);
        let header = reader.read_message_header().unwrap();
        let body = reader.read_bytes("body").unwrap();
        self.updates.lock().push((header.nid.id(), body));
    }
}

fn update(id: u32, len: usize) -> Vec<u8> {
    let nid = Nid::new(UNIT, 1, id).unwrap();
    let mut writer = BinaryWriter::new().with_kinds(KINDS);
    writer
        .write_message_header(&MessageHeader::new(MessageId::ObjectUpdate, nid))
        .unwrap();
    writer.write_bytes("body", &update_body(id, len)).unwrap();
    writer.into_bytes()
}

#[test]
fn test_raw_packets_over_tcp() {
    let a = TcpTransport::bind(PeerId(10), localhost()).unwrap();
    let b = TcpTransport::bind(PeerId(20), localhost()).unwrap();
    a.add_peer(PeerId(20), b.local_addr());

    a.send(PeerId(20), 3, b"hello").unwrap();
    a.send(PeerId(20), 4, &vec![7u8; 100_000]).unwrap();
    wait_until("packets", || b.available(3).is_some() && b.available(4).is_some());

    let mut small = [0u8; 8];
    assert_eq!(b.read(3, &mut small), Some((PeerId(10), 5)));
    assert_eq!(&small[..5], b"hello");

    // Too small a buffer leaves the packet queued
    assert_eq!(b.read(4, &mut small), None);
    assert_eq!(b.available(4), Some(100_000));
    let mut big = vec![0u8; 100_000];
    assert_eq!(b.read(4, &mut big), Some((PeerId(10), 100_000)));
    assert!(big.iter().all(|&x| x == 7));

    // The accepted link routes replies without an address
    b.send(PeerId(10), 3, b"back").unwrap();
    wait_until("reply", || a.available(3).is_some());
    assert_eq!(b.connected_peers(), vec![PeerId(10)]);

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_sessions_over_tcp() {
    let config = TransportConfig::default()
        .with_chunk_size(256)
        .with_poll_interval(Duration::from_millis(1));

    let ta = Arc::new(TcpTransport::bind(PeerId(1), localhost()).unwrap());
    let tb = Arc::new(TcpTransport::bind(PeerId(2), localhost()).unwrap());
    ta.add_peer(PeerId(2), tb.local_addr());

    let profiler = Arc::new(NetworkProfiler::new(64, KINDS));
    let alice = Arc::new(Collector::default());
    let bob = Arc::new(Collector::default());
    let a = P2pAcceptor::new(ta.clone(), alice.clone(), config.clone(), Some(profiler.clone())).unwrap();
    let b = P2pAcceptor::new(tb.clone(), bob.clone(), config, None).unwrap();
    a.start().unwrap();
    b.start().unwrap();

    let conn = a.connect(PeerId(2), ConnectReason::Session).unwrap();
    wait_until("handshake", || conn.status() == ConnectionStatus::Connected);

    const MESSAGES: u32 = 500;
    let mut expected = Vec::new();
    for id in 1..=MESSAGES {
        let len = (id as usize * 37) % 1500;
        let message = update(id, len);
        expected.push((id, update_body(id, len)));
        assert!(conn.send(&message));
    }

    wait_until("all updates", || bob.updates.lock().len() == MESSAGES as usize);
    assert_eq!(*bob.updates.lock(), expected);

    let (sent, _) = profiler.totals();
    assert!(sent > 0);
    let by_type = profiler.stats();
    let updates = by_type
        .iter()
        .find(|(key, _)| key.tag == UNIT)
        .map(|(_, stat)| stat.count)
        .unwrap();
    assert_eq!(updates, u64::from(MESSAGES));

    a.stop();
    b.stop();
    ta.shutdown();
    tb.shutdown();
}

fn update_body(id: u32, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u32 ^ id) as u8).collect()
}
