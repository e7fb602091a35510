//! Channel handshake over the in-process transport

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use repnet::network::{
    Acceptor, Connection, ConnectionStatus, LoopbackNetwork, LoopbackTransport, P2pAcceptor,
    P2pTransport, PeerHandle, PeerId, Role, SessionReceiver, HANDSHAKE_CHANNEL,
};
use repnet::protocol::{
    encode_frame, Accepted, Connect, ConnectReason, FrameDecoder, IncorrectChannel, MessageId,
};
use repnet::TransportConfig;

#[derive(Default)]
struct Session {
    connected: Mutex<Vec<Arc<dyn Connection>>>,
    messages: Mutex<Vec<(PeerId, Vec<u8>)>>,
    disconnected: AtomicUsize,
}

impl SessionReceiver for Session {
    fn on_connected(&self, connection: Arc<dyn Connection>) {
        self.connected.lock().push(connection);
    }

    fn on_message(&self, connection: &dyn Connection, message: &[u8]) {
        self.messages.lock().push((connection.peer(), message.to_vec()));
    }

    fn on_disconnected(&self, _connection: &dyn Connection) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

fn config() -> TransportConfig {
    TransportConfig::default().with_poll_interval(Duration::from_millis(1))
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Next frame arriving on `channel`, decoded from raw packets.
fn recv_frame(transport: &LoopbackTransport, channel: u32) -> Vec<u8> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut decoder = FrameDecoder::new(1 << 16);
    loop {
        if let Some(size) = transport.available(channel) {
            let mut packet = vec![0u8; size];
            let (_, n) = transport.read(channel, &mut packet).unwrap();
            decoder.push(&packet[..n]);
            if let Some(frame) = decoder.next_frame().unwrap() {
                return frame.to_vec();
            }
        }
        assert!(Instant::now() < deadline, "no frame on channel {channel}");
        thread::sleep(Duration::from_millis(1));
    }
}

fn send_frame(transport: &LoopbackTransport, to: PeerId, channel: u32, message: &[u8]) {
    transport.send(to, channel, &encode_frame(message)).unwrap();
}

#[test]
fn test_acceptor_enforces_increasing_channels() {
    let net = LoopbackNetwork::new();
    let session = Arc::new(Session::default());
    let server = P2pAcceptor::new(
        Arc::new(net.endpoint(PeerId(1))),
        session.clone(),
        config(),
        None,
    )
    .unwrap();
    server.start().unwrap();
    let client = net.endpoint(PeerId(2));
    let connect = |channel| {
        Connect {
            reason: ConnectReason::Session,
            channel,
        }
        .encode()
    };

    send_frame(&client, PeerId(1), HANDSHAKE_CHANNEL, &connect(5));
    let first = Accepted::decode(&recv_frame(&client, 5)).unwrap();

    send_frame(&client, PeerId(1), HANDSHAKE_CHANNEL, &connect(3));
    let reply = recv_frame(&client, HANDSHAKE_CHANNEL);
    assert_eq!(
        IncorrectChannel::decode(&reply),
        Some(IncorrectChannel { last_valid: 5 })
    );

    send_frame(&client, PeerId(1), HANDSHAKE_CHANNEL, &connect(7));
    let second = Accepted::decode(&recv_frame(&client, 7)).unwrap();
    assert!(second.channel > first.channel);

    // The connection on channel 5 was replaced and said goodbye
    assert_eq!(recv_frame(&client, 5), vec![MessageId::Disconnect as u8]);
    wait_until("replacement", || session.connected.lock().len() == 2);
    let handle = PeerHandle {
        peer: PeerId(2),
        reason: ConnectReason::Session,
    };
    let current = server.connection(handle).unwrap();
    assert_eq!(current.target_channel(), Some(7));
    assert_eq!(current.own_channel(), second.channel);
    assert_eq!(current.role(), Role::Server);
    assert_eq!(session.disconnected.load(Ordering::SeqCst), 1);

    server.stop();
}

#[test]
fn test_client_and_server_exchange_messages() {
    let net = LoopbackNetwork::new();
    let alice = Arc::new(Session::default());
    let bob = Arc::new(Session::default());
    let a = P2pAcceptor::new(Arc::new(net.endpoint(PeerId(1))), alice.clone(), config(), None).unwrap();
    let b = P2pAcceptor::new(Arc::new(net.endpoint(PeerId(2))), bob.clone(), config(), None).unwrap();
    a.start().unwrap();
    b.start().unwrap();

    let conn = a.connect(PeerId(2), ConnectReason::Lobby).unwrap();
    assert_eq!(conn.role(), Role::Client);
    wait_until("client connected", || conn.status() == ConnectionStatus::Connected);
    wait_until("server connected", || bob.connected.lock().len() == 1);
    wait_until("client callback", || alice.connected.lock().len() == 1);

    let update = [MessageId::ObjectUpdate as u8, 2, 9, 9];
    assert!(conn.send(&update));
    wait_until("server received", || bob.messages.lock().len() == 1);
    assert_eq!(bob.messages.lock()[0], (PeerId(1), update.to_vec()));

    let reply = [MessageId::ObjectDestroy as u8, 2, 9];
    let server_side = bob.connected.lock()[0].clone();
    assert_eq!(server_side.target_channel(), Some(conn.own_channel()));
    assert!(server_side.send(&reply));
    wait_until("client received", || alice.messages.lock().len() == 1);
    assert_eq!(alice.messages.lock()[0], (PeerId(2), reply.to_vec()));

    conn.shutdown();
    wait_until("server notified", || bob.disconnected.load(Ordering::SeqCst) == 1);
    assert_eq!(server_side.status(), ConnectionStatus::NotConnected);
    assert!(!conn.send(&update));

    a.stop();
    b.stop();
}

#[test]
fn test_client_retries_on_incorrect_channel() {
    let net = LoopbackNetwork::new();
    let session = Arc::new(Session::default());
    let client = P2pAcceptor::new(
        Arc::new(net.endpoint(PeerId(1))),
        session.clone(),
        config(),
        None,
    )
    .unwrap();
    client.start().unwrap();
    let server = net.endpoint(PeerId(2));

    let conn = client.open(PeerId(2), ConnectReason::Session).unwrap();
    let first = Connect::decode(&recv_frame(&server, HANDSHAKE_CHANNEL)).unwrap();
    assert_eq!(first.channel, conn.own_channel());

    send_frame(
        &server,
        PeerId(1),
        HANDSHAKE_CHANNEL,
        &IncorrectChannel { last_valid: 9 }.encode(),
    );
    let retry = Connect::decode(&recv_frame(&server, HANDSHAKE_CHANNEL)).unwrap();
    assert_eq!(retry.channel, 10);
    assert_eq!(conn.status(), ConnectionStatus::Connecting);

    send_frame(&server, PeerId(1), 10, &Accepted { channel: 4 }.encode());
    wait_until("connected", || session.connected.lock().len() == 1);
    assert_eq!(conn.status(), ConnectionStatus::Connected);
    assert_eq!(conn.target_channel(), Some(4));

    client.stop();
}

#[test]
fn test_client_gives_up_after_max_attempts() {
    let net = LoopbackNetwork::new();
    let session = Arc::new(Session::default());
    let client = P2pAcceptor::new(
        Arc::new(net.endpoint(PeerId(1))),
        session.clone(),
        config().with_max_handshake_attempts(2),
        None,
    )
    .unwrap();
    client.start().unwrap();
    let server = net.endpoint(PeerId(2));

    let conn = client.open(PeerId(2), ConnectReason::Spectate).unwrap();
    for last_valid in [20, 30] {
        Connect::decode(&recv_frame(&server, HANDSHAKE_CHANNEL)).unwrap();
        send_frame(
            &server,
            PeerId(1),
            HANDSHAKE_CHANNEL,
            &IncorrectChannel { last_valid }.encode(),
        );
    }

    wait_until("abandoned", || conn.status() == ConnectionStatus::NotConnected);
    wait_until("disconnect callback", || {
        session.disconnected.load(Ordering::SeqCst) == 1
    });
    assert!(session.connected.lock().is_empty());
    assert_eq!(net.pending(PeerId(2)), 0);

    client.stop();
}

#[test]
fn test_packets_from_other_peers_are_ignored() {
    let net = LoopbackNetwork::new();
    let alice = Arc::new(Session::default());
    let bob = Arc::new(Session::default());
    let a = P2pAcceptor::new(Arc::new(net.endpoint(PeerId(1))), alice.clone(), config(), None).unwrap();
    let b = P2pAcceptor::new(Arc::new(net.endpoint(PeerId(2))), bob.clone(), config(), None).unwrap();
    a.start().unwrap();
    b.start().unwrap();
    let mallory = net.endpoint(PeerId(3));

    let conn = a.open(PeerId(2), ConnectReason::Session).unwrap();
    wait_until("connected", || conn.status() == ConnectionStatus::Connected);
    wait_until("server connected", || bob.connected.lock().len() == 1);

    send_frame(
        &mallory,
        PeerId(1),
        conn.own_channel(),
        &[MessageId::ObjectUpdate as u8, 6, 6],
    );
    let genuine = [MessageId::ObjectUpdate as u8, 1];
    bob.connected.lock()[0].send(&genuine);
    wait_until("genuine message", || alice.messages.lock().len() == 1);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(*alice.messages.lock(), vec![(PeerId(2), genuine.to_vec())]);

    a.stop();
    b.stop();
}
