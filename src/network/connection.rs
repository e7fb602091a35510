//! Connection contract and the P2P connection
//!
//! A connection receives on its own channel and sends on the target channel
//! chosen by the other side during the handshake:
//!
//! ```text
//! NotConnected ──connect──▶ Connecting ──Accepted──▶ Connected
//!       ▲                        │                       │
//!       └── shutdown / Disconnect / handshake abandoned ─┘
//! ```
//!
//! Steady-state receive runs on a dedicated polling thread that sleeps
//! `poll_interval` between checks; shutdown wakes it through a condvar.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use super::sender::{AsyncSender, FrameSink, SenderStats};
use super::transport::{P2pTransport, PeerId};
use crate::config::TransportConfig;
use crate::core::{Buffer, BufferPool, PoolStats};
use crate::profiler::NetworkProfiler;
use crate::protocol::{encode_frame, Accepted, Connect, ConnectReason, FrameDecoder, MessageId, Probe};

/// Channel reserved for handshake traffic.
pub const HANDSHAKE_CHANNEL: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Initiated the handshake
    Client,
    /// Built by an acceptor in answer to a Connect
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    NotConnected,
    Connecting,
    Connected,
}

/// Transport-agnostic view of a connection.
pub trait Connection: Send + Sync {
    fn role(&self) -> Role;
    fn status(&self) -> ConnectionStatus;
    fn peer(&self) -> PeerId;
    fn reason(&self) -> ConnectReason;
    fn own_channel(&self) -> u32;
    /// `None` until configured, and again after shutdown.
    fn target_channel(&self) -> Option<u32>;

    /// Queue one message (id byte first). Fire-and-forget: returns `false`
    /// only when the message is refused by the connection state.
    fn send(&self, message: &[u8]) -> bool;

    /// Close the connection. Idempotent.
    fn shutdown(&self);
}

/// Session-side callbacks. Invoked from polling threads.
pub trait SessionReceiver: Send + Sync {
    fn on_connected(&self, connection: Arc<dyn Connection>);

    /// One complete frame payload, id byte first.
    fn on_message(&self, connection: &dyn Connection, message: &[u8]);

    fn on_disconnected(&self, _connection: &dyn Connection) {}
}

/// Everything needed to start a [`P2pConnection`].
pub struct ConnectionParams {
    pub role: Role,
    pub peer: PeerId,
    pub reason: ConnectReason,
    pub status: ConnectionStatus,
    pub own_channel: u32,
    pub target_channel: Option<u32>,
    pub transport: Arc<dyn P2pTransport>,
    pub receiver: Arc<dyn SessionReceiver>,
    pub config: TransportConfig,
    pub profiler: Option<Arc<NetworkProfiler>>,
}

#[derive(Debug)]
struct LinkState {
    status: ConnectionStatus,
    own_channel: u32,
    target_channel: Option<u32>,
    /// Connect messages sent so far
    handshake_attempts: u32,
}

/// Connection over a [`P2pTransport`].
pub struct P2pConnection {
    me: Weak<P2pConnection>,
    role: Role,
    peer: PeerId,
    reason: ConnectReason,
    link: Mutex<LinkState>,
    transport: Arc<dyn P2pTransport>,
    receiver: Arc<dyn SessionReceiver>,
    sender: AsyncSender,
    config: TransportConfig,
    profiler: Option<Arc<NetworkProfiler>>,
    running: Mutex<bool>,
    wake: Condvar,
    poller: Mutex<Option<JoinHandle<()>>>,
    next_ping: Mutex<u32>,
    pings: Mutex<HashMap<u32, Instant>>,
    rtt: Mutex<Option<Duration>>,
}

impl P2pConnection {
    /// Build the connection and start its polling thread.
    pub fn start(params: ConnectionParams) -> io::Result<Arc<Self>> {
        let ConnectionParams {
            role,
            peer,
            reason,
            status,
            own_channel,
            target_channel,
            transport,
            receiver,
            config,
            profiler,
        } = params;

        let pool = Arc::new(BufferPool::new(config.chunk_size, config.pool_baseline));
        let conn = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            role,
            peer,
            reason,
            link: Mutex::new(LinkState {
                status,
                own_channel,
                target_channel,
                handshake_attempts: 0,
            }),
            transport,
            receiver,
            sender: AsyncSender::new(pool),
            config,
            profiler,
            running: Mutex::new(true),
            wake: Condvar::new(),
            poller: Mutex::new(None),
            next_ping: Mutex::new(0),
            pings: Mutex::new(HashMap::new()),
            rtt: Mutex::new(None),
        });

        let weak = Arc::downgrade(&conn);
        let handle = thread::Builder::new()
            .name(format!("repnet-conn-{own_channel}"))
            .spawn(move || poll_loop(weak))?;
        *conn.poller.lock() = Some(handle);

        debug!(peer = %peer, ?role, own_channel, ?target_channel, "connection started");
        Ok(conn)
    }

    fn is_running(&self) -> bool {
        *self.running.lock()
    }

    /// Send a keep-alive probe; the answer updates [`rtt`](Self::rtt).
    pub fn ping(&self) -> bool {
        let seq = {
            let mut next = self.next_ping.lock();
            *next = next.wrapping_add(1);
            *next
        };
        // Recorded first: the answer may arrive before send returns
        self.pings.lock().insert(seq, Instant::now());
        let sent = self.send(&Probe { seq }.encode(MessageId::Ping));
        if !sent {
            self.pings.lock().remove(&seq);
        }
        sent
    }

    /// Round trip of the latest answered ping.
    pub fn rtt(&self) -> Option<Duration> {
        *self.rtt.lock()
    }

    pub fn sender_stats(&self) -> SenderStats {
        self.sender.stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.sender.pool().stats()
    }

    /// Start the handshake. Client side only.
    pub(crate) fn begin_handshake(&self) -> bool {
        let own = {
            let mut link = self.link.lock();
            link.handshake_attempts = 1;
            link.own_channel
        };
        self.send(
            &Connect {
                reason: self.reason,
                channel: own,
            }
            .encode(),
        )
    }

    /// Resend Connect on a fresh own channel after "incorrect channel".
    /// Gives up, closing the connection, once `max_attempts` Connects were
    /// sent.
    pub(crate) fn retry_handshake(&self, own_channel: u32, max_attempts: u32) -> bool {
        let attempt = {
            let mut link = self.link.lock();
            if link.status != ConnectionStatus::Connecting {
                return false;
            }
            if link.handshake_attempts >= max_attempts {
                None
            } else {
                link.handshake_attempts += 1;
                link.own_channel = own_channel;
                Some(link.handshake_attempts)
            }
        };

        match attempt {
            Some(attempt) => {
                info!(peer = %self.peer, channel = own_channel, attempt, "retrying handshake");
                self.send(
                    &Connect {
                        reason: self.reason,
                        channel: own_channel,
                    }
                    .encode(),
                )
            }
            None => {
                warn!(peer = %self.peer, attempts = max_attempts, "handshake abandoned");
                self.close(false);
                false
            }
        }
    }

    /// Read everything waiting on the own channel.
    fn drain_inbound(&self, buffer: &mut Vec<u8>, decoder: &mut FrameDecoder) {
        let own = self.link.lock().own_channel;
        while let Some(size) = self.transport.available(own) {
            if size > buffer.len() {
                debug!(size, "growing receive buffer");
                buffer.resize(size, 0);
            }
            let Some((from, n)) = self.transport.read(own, buffer) else {
                break;
            };
            if !from.same_account(self.peer) {
                warn!(expected = %self.peer, from = %from, channel = own, "dropping packet from unexpected peer");
                continue;
            }

            decoder.push(&buffer[..n]);
            let mut corrupt = false;
            loop {
                match decoder.next_frame() {
                    Ok(Some(frame)) => self.handle_frame(frame),
                    Ok(None) => break,
                    Err(e) => {
                        error!(peer = %self.peer, error = %e, "receive stream corrupt");
                        corrupt = true;
                        break;
                    }
                }
            }
            if corrupt {
                decoder.reset();
            }
            if !self.is_running() {
                break;
            }
        }
    }

    fn handle_frame(&self, frame: &[u8]) {
        if let Some(profiler) = &self.profiler {
            profiler.record_received(frame);
        }
        let Some(&id) = frame.first() else {
            trace!(peer = %self.peer, "empty frame");
            return;
        };

        match MessageId::from_u8(id) {
            Some(MessageId::Accepted) => match Accepted::decode(frame) {
                Some(accepted) => self.on_accepted(accepted.channel),
                None => warn!(peer = %self.peer, "malformed Accepted"),
            },
            Some(MessageId::Ping) => {
                if let Some(probe) = Probe::decode(frame, MessageId::Ping) {
                    self.send(&probe.encode(MessageId::Pong));
                }
            }
            Some(MessageId::Pong) => {
                if let Some(probe) = Probe::decode(frame, MessageId::Pong) {
                    let mut pings = self.pings.lock();
                    if let Some(sent_at) = pings.remove(&probe.seq) {
                        *self.rtt.lock() = Some(sent_at.elapsed());
                    }
                    // Ordered delivery: earlier pings will not be answered
                    pings.retain(|&seq, _| (seq.wrapping_sub(probe.seq) as i32) > 0);
                }
            }
            Some(MessageId::Disconnect) => {
                info!(peer = %self.peer, "peer disconnected");
                self.close(false);
            }
            Some(MessageId::Connect | MessageId::IncorrectChannel) => {
                debug!(peer = %self.peer, msg = id, "handshake message on session channel ignored");
            }
            _ => {
                if self.status() == ConnectionStatus::Connected {
                    self.receiver.on_message(self, frame);
                } else {
                    debug!(peer = %self.peer, msg = id, "message before handshake completed dropped");
                }
            }
        }
    }

    fn on_accepted(&self, channel: u32) {
        let connected = {
            let mut link = self.link.lock();
            if self.role == Role::Client && link.status == ConnectionStatus::Connecting {
                link.target_channel = Some(channel);
                link.status = ConnectionStatus::Connected;
                true
            } else {
                false
            }
        };
        if !connected {
            debug!(peer = %self.peer, channel, "unexpected Accepted ignored");
            return;
        }
        info!(peer = %self.peer, target = channel, "connected");
        if let Some(me) = self.me.upgrade() {
            self.receiver.on_connected(me);
        }
    }

    /// Tear down; `notify_peer` sends a best-effort Disconnect first.
    fn close(&self, notify_peer: bool) {
        {
            let mut running = self.running.lock();
            if !*running {
                return;
            }
            *running = false;
        }
        self.wake.notify_all();

        let (previous, target) = {
            let mut link = self.link.lock();
            let previous = link.status;
            let target = link.target_channel.take();
            link.status = ConnectionStatus::NotConnected;
            (previous, target)
        };

        if notify_peer && previous == ConnectionStatus::Connected {
            if let Some(channel) = target {
                let frame = encode_frame(&[MessageId::Disconnect as u8]);
                if let Err(e) = self.transport.send(self.peer, channel, &frame) {
                    debug!(peer = %self.peer, error = %e, "disconnect notice not delivered");
                }
            }
        }

        let handle = self.poller.lock().take();
        if let Some(handle) = handle {
            // Closing from inside a callback runs on the poller itself
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!(peer = %self.peer, "polling thread panicked");
            }
        }

        let dropped = self.sender.clear();
        self.sender.pool().clean_pool();
        self.pings.lock().clear();
        info!(peer = %self.peer, role = ?self.role, dropped, "connection closed");

        if previous != ConnectionStatus::NotConnected {
            self.receiver.on_disconnected(self);
        }
    }
}

impl Connection for P2pConnection {
    fn role(&self) -> Role {
        self.role
    }

    fn status(&self) -> ConnectionStatus {
        self.link.lock().status
    }

    fn peer(&self) -> PeerId {
        self.peer
    }

    fn reason(&self) -> ConnectReason {
        self.reason
    }

    fn own_channel(&self) -> u32 {
        self.link.lock().own_channel
    }

    fn target_channel(&self) -> Option<u32> {
        self.link.lock().target_channel
    }

    fn send(&self, message: &[u8]) -> bool {
        let Some(&id) = message.first() else {
            warn!(peer = %self.peer, "empty message not sent");
            return false;
        };
        let (status, target) = {
            let link = self.link.lock();
            (link.status, link.target_channel)
        };

        match status {
            ConnectionStatus::NotConnected => {
                debug!(peer = %self.peer, msg = id, "send on closed connection refused");
                return false;
            }
            ConnectionStatus::Connecting
                if !MessageId::from_u8(id).is_some_and(MessageId::is_handshake) =>
            {
                warn!(peer = %self.peer, msg = id, "only handshake messages may be sent while connecting");
                return false;
            }
            _ => {}
        }

        let Some(target) = target else {
            error!(peer = %self.peer, msg = id, "send on unconfigured channel");
            return false;
        };
        if target == HANDSHAKE_CHANNEL && id != MessageId::Connect as u8 {
            warn!(peer = %self.peer, msg = id, "only Connect may use the handshake channel");
            return false;
        }

        if let Some(profiler) = &self.profiler {
            profiler.record_sent(message);
        }
        self.sender.send(message, self);
        true
    }

    fn shutdown(&self) {
        self.close(true);
    }
}

impl FrameSink for P2pConnection {
    fn transmit(&self, sender: &AsyncSender, buffer: Buffer) {
        let target = self.link.lock().target_channel;
        let sent = match target {
            Some(channel) => match self.transport.send(self.peer, channel, buffer.as_bytes()) {
                Ok(()) => buffer.len(),
                Err(e) => {
                    warn!(peer = %self.peer, channel, error = %e, "transport send failed");
                    0
                }
            },
            None => 0,
        };
        sender.on_sent(buffer, sent, self);
    }

    fn is_connected(&self) -> bool {
        self.status() != ConnectionStatus::NotConnected
    }
}

fn poll_loop(weak: Weak<P2pConnection>) {
    let (interval, receive_size, max_frame_len) = match weak.upgrade() {
        Some(conn) => (
            conn.config.poll_interval,
            conn.config.receive_buffer_size,
            conn.config.max_frame_len,
        ),
        None => return,
    };
    let mut buffer = vec![0u8; receive_size];
    let mut decoder = FrameDecoder::new(max_frame_len);

    loop {
        let Some(conn) = weak.upgrade() else {
            break;
        };
        conn.drain_inbound(&mut buffer, &mut decoder);

        let mut running = conn.running.lock();
        if !*running {
            break;
        }
        conn.wake.wait_for(&mut running, interval);
        if !*running {
            break;
        }
    }
    trace!("connection polling thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{LoopbackNetwork, LoopbackTransport};

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<Vec<u8>>>,
        disconnects: Mutex<usize>,
    }

    impl SessionReceiver for Recorder {
        fn on_connected(&self, _connection: Arc<dyn Connection>) {}

        fn on_message(&self, _connection: &dyn Connection, message: &[u8]) {
            self.messages.lock().push(message.to_vec());
        }

        fn on_disconnected(&self, _connection: &dyn Connection) {
            *self.disconnects.lock() += 1;
        }
    }

    fn open(
        transport: LoopbackTransport,
        peer: PeerId,
        status: ConnectionStatus,
        target: Option<u32>,
        receiver: Arc<Recorder>,
    ) -> Arc<P2pConnection> {
        P2pConnection::start(ConnectionParams {
            role: Role::Server,
            peer,
            reason: ConnectReason::Session,
            status,
            own_channel: 3,
            target_channel: target,
            transport: Arc::new(transport),
            receiver,
            config: TransportConfig::default(),
            profiler: None,
        })
        .unwrap()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_send_rules() {
        let net = LoopbackNetwork::new();
        let local = net.endpoint(PeerId(1));
        let _remote = net.endpoint(PeerId(2));
        let receiver = Arc::new(Recorder::default());

        let connecting = open(local.clone(), PeerId(2), ConnectionStatus::Connecting, Some(0), receiver.clone());
        assert!(!connecting.send(&[MessageId::ObjectUpdate as u8]));
        assert!(!connecting.send(&Accepted { channel: 1 }.encode()));
        assert!(connecting.send(&Connect { reason: ConnectReason::Session, channel: 3 }.encode()));
        connecting.shutdown();
        assert!(!connecting.send(&Connect { reason: ConnectReason::Session, channel: 3 }.encode()));

        let unconfigured = open(local, PeerId(2), ConnectionStatus::Connected, None, receiver);
        assert!(!unconfigured.send(&[MessageId::ObjectUpdate as u8]));
        unconfigured.shutdown();
        assert_eq!(net.pending(PeerId(2)), 1);
    }

    #[test]
    fn test_receives_and_validates_sender() {
        let net = LoopbackNetwork::new();
        let local = net.endpoint(PeerId(1));
        let remote = net.endpoint(PeerId(0x0100_0000_0000_0002));
        let stranger = net.endpoint(PeerId(9));
        let receiver = Arc::new(Recorder::default());
        let conn = open(local, PeerId(2), ConnectionStatus::Connected, Some(5), receiver.clone());

        stranger.send(PeerId(1), 3, &encode_frame(&[MessageId::ObjectUpdate as u8, 1])).unwrap();
        // Same account in the low bits; frame split across two packets
        let frame = encode_frame(&[MessageId::ObjectUpdate as u8, 2, 3]);
        remote.send(PeerId(1), 3, &frame[..2]).unwrap();
        remote.send(PeerId(1), 3, &frame[2..]).unwrap();

        assert!(wait_until(|| !receiver.messages.lock().is_empty()));
        assert_eq!(*receiver.messages.lock(), vec![vec![MessageId::ObjectUpdate as u8, 2, 3]]);
        conn.shutdown();
    }

    #[test]
    fn test_ping_and_remote_disconnect() {
        let net = LoopbackNetwork::new();
        let receiver = Arc::new(Recorder::default());
        let a = open(net.endpoint(PeerId(1)), PeerId(2), ConnectionStatus::Connected, Some(3), receiver.clone());
        let b = open(net.endpoint(PeerId(2)), PeerId(1), ConnectionStatus::Connected, Some(3), receiver.clone());

        assert!(a.ping());
        assert!(wait_until(|| a.rtt().is_some()));

        b.shutdown();
        assert!(wait_until(|| *receiver.disconnects.lock() == 2));
        assert_eq!(a.status(), ConnectionStatus::NotConnected);
        a.shutdown();
        assert_eq!(*receiver.disconnects.lock(), 2);
    }

    #[test]
    fn test_unanswered_pings_are_not_kept() {
        let net = LoopbackNetwork::new();
        let local = net.endpoint(PeerId(1));
        let remote = net.endpoint(PeerId(2));
        let receiver = Arc::new(Recorder::default());

        let connecting = open(local.clone(), PeerId(2), ConnectionStatus::Connecting, Some(0), receiver.clone());
        assert!(!connecting.ping());
        assert!(connecting.pings.lock().is_empty());
        connecting.shutdown();

        let conn = open(local, PeerId(2), ConnectionStatus::Connected, Some(7), receiver);
        assert!(conn.ping());
        assert!(conn.ping());
        assert!(conn.ping());
        assert_eq!(conn.pings.lock().len(), 3);

        // Answering the second ping settles the first
        remote
            .send(PeerId(1), 3, &encode_frame(&Probe { seq: 2 }.encode(MessageId::Pong)))
            .unwrap();
        assert!(wait_until(|| conn.rtt().is_some()));
        assert_eq!(conn.pings.lock().keys().copied().collect::<Vec<_>>(), vec![3]);

        conn.shutdown();
        assert!(conn.pings.lock().is_empty());
    }
}
