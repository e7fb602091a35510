//! Handshake acceptor
//!
//! Listens on the handshake channel. A `Connect { reason, channel }` opens a
//! server-side connection whose target is the proposed channel, provided the
//! channel is newer than the last one accepted from that peer; stale
//! proposals are answered with `IncorrectChannel { last_valid }` so the
//! client can pick a higher channel and retry.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use super::connection::{
    Connection, ConnectionParams, ConnectionStatus, P2pConnection, Role, SessionReceiver,
    HANDSHAKE_CHANNEL,
};
use super::transport::{P2pTransport, PeerId};
use crate::config::TransportConfig;
use crate::error::{ConfigError, Error};
use crate::profiler::NetworkProfiler;
use crate::protocol::{
    encode_frame, Accepted, Connect, ConnectReason, FrameDecoder, IncorrectChannel, MessageId,
};

/// Logical peer: who, and why they connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    pub peer: PeerId,
    pub reason: ConnectReason,
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.peer, self.reason)
    }
}

/// Accepts inbound connections and opens outbound ones.
pub trait Acceptor: Send + Sync {
    fn start(&self) -> io::Result<()>;
    fn stop(&self);
    fn connect(&self, peer: PeerId, reason: ConnectReason) -> Result<Arc<dyn Connection>, Error>;
    fn connection(&self, handle: PeerHandle) -> Option<Arc<dyn Connection>>;
}

/// Acceptor over a [`P2pTransport`].
pub struct P2pAcceptor {
    me: Weak<P2pAcceptor>,
    transport: Arc<dyn P2pTransport>,
    receiver: Arc<dyn SessionReceiver>,
    config: TransportConfig,
    profiler: Option<Arc<NetworkProfiler>>,
    /// Lowest channel not yet handed out
    next_channel: Mutex<u32>,
    /// Last channel accepted per inbound peer
    last_channel: Mutex<HashMap<PeerHandle, u32>>,
    /// Partial handshake frames per sending peer
    decoders: Mutex<HashMap<PeerId, FrameDecoder>>,
    inbound: Mutex<HashMap<PeerHandle, Arc<P2pConnection>>>,
    outbound: Mutex<HashMap<PeerHandle, Arc<P2pConnection>>>,
    running: Mutex<bool>,
    wake: Condvar,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl P2pAcceptor {
    pub fn new(
        transport: Arc<dyn P2pTransport>,
        receiver: Arc<dyn SessionReceiver>,
        config: TransportConfig,
        profiler: Option<Arc<NetworkProfiler>>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            transport,
            receiver,
            config,
            profiler,
            next_channel: Mutex::new(HANDSHAKE_CHANNEL + 1),
            last_channel: Mutex::new(HashMap::new()),
            decoders: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            outbound: Mutex::new(HashMap::new()),
            running: Mutex::new(false),
            wake: Condvar::new(),
            poller: Mutex::new(None),
        }))
    }

    pub fn local_peer(&self) -> PeerId {
        self.transport.local_peer()
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock()
    }

    /// Concrete connection for `handle`, inbound first.
    pub fn p2p_connection(&self, handle: PeerHandle) -> Option<Arc<P2pConnection>> {
        if let Some(conn) = self.inbound.lock().get(&handle) {
            return Some(Arc::clone(conn));
        }
        self.outbound.lock().get(&handle).cloned()
    }

    /// Open a client connection and send the first Connect.
    pub fn open(&self, peer: PeerId, reason: ConnectReason) -> Result<Arc<P2pConnection>, Error> {
        let own_channel = self.allocate_channel();
        let conn = P2pConnection::start(ConnectionParams {
            role: Role::Client,
            peer,
            reason,
            status: ConnectionStatus::Connecting,
            own_channel,
            target_channel: Some(HANDSHAKE_CHANNEL),
            transport: Arc::clone(&self.transport),
            receiver: Arc::clone(&self.receiver),
            config: self.config.clone(),
            profiler: self.profiler.clone(),
        })?;

        let handle = PeerHandle { peer, reason };
        let previous = self.outbound.lock().insert(handle, Arc::clone(&conn));
        if let Some(previous) = previous {
            previous.shutdown();
        }

        info!(peer = %peer, ?reason, channel = own_channel, "connecting");
        conn.begin_handshake();
        Ok(conn)
    }

    /// Number of live inbound and outbound connections.
    pub fn connection_count(&self) -> usize {
        let live = |map: &HashMap<PeerHandle, Arc<P2pConnection>>| {
            map.values()
                .filter(|c| c.status() != ConnectionStatus::NotConnected)
                .count()
        };
        live(&self.inbound.lock()) + live(&self.outbound.lock())
    }

    fn allocate_channel(&self) -> u32 {
        let mut next = self.next_channel.lock();
        let channel = *next;
        *next += 1;
        channel
    }

    /// Make sure later allocations exceed `channel`.
    fn bump_channels_above(&self, channel: u32) {
        let mut next = self.next_channel.lock();
        *next = (*next).max(channel.saturating_add(1));
    }

    fn drain_handshakes(&self, buffer: &mut Vec<u8>) {
        while let Some(size) = self.transport.available(HANDSHAKE_CHANNEL) {
            if size > buffer.len() {
                debug!(size, "growing handshake buffer");
                buffer.resize(size, 0);
            }
            let Some((from, n)) = self.transport.read(HANDSHAKE_CHANNEL, buffer) else {
                break;
            };

            // Taken out of the map so no lock is held across callbacks
            let taken = self.decoders.lock().remove(&from);
            let mut decoder = taken.unwrap_or_else(|| FrameDecoder::new(self.config.max_frame_len));
            decoder.push(&buffer[..n]);
            let mut corrupt = false;
            loop {
                match decoder.next_frame() {
                    Ok(Some(frame)) => self.handle_handshake(from, frame),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(peer = %from, error = %e, "handshake stream corrupt");
                        corrupt = true;
                        break;
                    }
                }
            }
            // Only peers with a partial frame keep a decoder
            if !corrupt && decoder.buffered() > 0 && self.is_running() {
                self.decoders.lock().insert(from, decoder);
            }
        }
    }

    fn handle_handshake(&self, from: PeerId, frame: &[u8]) {
        if let Some(profiler) = &self.profiler {
            profiler.record_received(frame);
        }
        match frame.first().copied().and_then(MessageId::from_u8) {
            Some(MessageId::Connect) => match Connect::decode(frame) {
                Some(connect) => self.on_connect(from, connect),
                None => warn!(peer = %from, "malformed Connect"),
            },
            Some(MessageId::IncorrectChannel) => match IncorrectChannel::decode(frame) {
                Some(incorrect) => self.on_incorrect_channel(from, incorrect),
                None => warn!(peer = %from, "malformed IncorrectChannel"),
            },
            other => warn!(peer = %from, msg = ?other, "unexpected message on handshake channel"),
        }
    }

    fn on_connect(&self, from: PeerId, connect: Connect) {
        let handle = PeerHandle {
            peer: from,
            reason: connect.reason,
        };

        let last_valid = self
            .last_channel
            .lock()
            .get(&handle)
            .copied()
            .unwrap_or(HANDSHAKE_CHANNEL);
        if connect.channel <= last_valid {
            info!(peer = %handle, proposed = connect.channel, last_valid, "rejecting stale channel");
            self.reply_handshake(from, &IncorrectChannel { last_valid }.encode());
            return;
        }

        let own_channel = self.allocate_channel();
        let conn = match P2pConnection::start(ConnectionParams {
            role: Role::Server,
            peer: from,
            reason: connect.reason,
            status: ConnectionStatus::Connected,
            own_channel,
            target_channel: Some(connect.channel),
            transport: Arc::clone(&self.transport),
            receiver: Arc::clone(&self.receiver),
            config: self.config.clone(),
            profiler: self.profiler.clone(),
        }) {
            Ok(conn) => conn,
            Err(e) => {
                error!(peer = %handle, error = %e, "failed to start connection");
                return;
            }
        };

        self.last_channel.lock().insert(handle, connect.channel);
        conn.send(&Accepted { channel: own_channel }.encode());
        let previous = self.inbound.lock().insert(handle, Arc::clone(&conn));
        if let Some(previous) = previous {
            debug!(peer = %handle, old = previous.own_channel(), "replacing connection");
            previous.shutdown();
        }

        info!(peer = %handle, own_channel, target = connect.channel, "accepted");
        self.receiver.on_connected(conn);
    }

    fn on_incorrect_channel(&self, from: PeerId, incorrect: IncorrectChannel) {
        let pending: Vec<Arc<P2pConnection>> = self
            .outbound
            .lock()
            .iter()
            .filter(|(handle, conn)| {
                handle.peer.same_account(from) && conn.status() == ConnectionStatus::Connecting
            })
            .map(|(_, conn)| Arc::clone(conn))
            .collect();
        if pending.is_empty() {
            debug!(peer = %from, "IncorrectChannel without a pending handshake");
            return;
        }

        for conn in pending {
            self.bump_channels_above(incorrect.last_valid);
            let own_channel = self.allocate_channel();
            conn.retry_handshake(own_channel, self.config.max_handshake_attempts);
        }
    }

    fn reply_handshake(&self, to: PeerId, message: &[u8]) {
        if let Some(profiler) = &self.profiler {
            profiler.record_sent(message);
        }
        if let Err(e) = self.transport.send(to, HANDSHAKE_CHANNEL, &encode_frame(message)) {
            warn!(peer = %to, error = %e, "handshake reply not delivered");
        }
    }
}

impl Acceptor for P2pAcceptor {
    fn start(&self) -> io::Result<()> {
        {
            let mut running = self.running.lock();
            if *running {
                return Ok(());
            }
            *running = true;
        }

        let weak = self.me.clone();
        let spawned = thread::Builder::new()
            .name("repnet-acceptor".to_owned())
            .spawn(move || poll_loop(weak));
        match spawned {
            Ok(handle) => {
                *self.poller.lock() = Some(handle);
                info!(local = %self.local_peer(), "acceptor started");
                Ok(())
            }
            Err(e) => {
                *self.running.lock() = false;
                Err(e)
            }
        }
    }

    fn stop(&self) {
        *self.running.lock() = false;
        self.wake.notify_all();
        let handle = self.poller.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("acceptor thread panicked");
            }
        }

        let mut closing: Vec<Arc<P2pConnection>> =
            self.inbound.lock().drain().map(|(_, c)| c).collect();
        closing.extend(self.outbound.lock().drain().map(|(_, c)| c));
        let count = closing.len();
        for conn in closing {
            conn.shutdown();
        }
        self.last_channel.lock().clear();
        self.decoders.lock().clear();
        info!(closed = count, "acceptor stopped");
    }

    fn connect(&self, peer: PeerId, reason: ConnectReason) -> Result<Arc<dyn Connection>, Error> {
        let conn: Arc<dyn Connection> = self.open(peer, reason)?;
        Ok(conn)
    }

    fn connection(&self, handle: PeerHandle) -> Option<Arc<dyn Connection>> {
        self.p2p_connection(handle).map(|c| c as Arc<dyn Connection>)
    }
}

fn poll_loop(weak: Weak<P2pAcceptor>) {
    let (interval, receive_size) = match weak.upgrade() {
        Some(acceptor) => (acceptor.config.poll_interval, acceptor.config.receive_buffer_size),
        None => return,
    };
    let mut buffer = vec![0u8; receive_size];

    loop {
        let Some(acceptor) = weak.upgrade() else {
            break;
        };
        acceptor.drain_handshakes(&mut buffer);

        let mut running = acceptor.running.lock();
        if !*running {
            break;
        }
        acceptor.wake.wait_for(&mut running, interval);
        if !*running {
            break;
        }
    }
    trace!("acceptor thread exiting");
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::network::LoopbackNetwork;

    struct Quiet;

    impl SessionReceiver for Quiet {
        fn on_connected(&self, _connection: Arc<dyn Connection>) {}
        fn on_message(&self, _connection: &dyn Connection, _message: &[u8]) {}
    }

    fn acceptor(net: &Arc<LoopbackNetwork>, peer: u64) -> Arc<P2pAcceptor> {
        P2pAcceptor::new(
            Arc::new(net.endpoint(PeerId(peer))),
            Arc::new(Quiet),
            TransportConfig::default(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_channels_are_monotonic() {
        let net = LoopbackNetwork::new();
        let a = acceptor(&net, 1);
        assert_eq!(a.allocate_channel(), 1);
        a.bump_channels_above(9);
        assert_eq!(a.allocate_channel(), 10);
        a.bump_channels_above(4);
        assert_eq!(a.allocate_channel(), 11);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let net = LoopbackNetwork::new();
        let result = P2pAcceptor::new(
            Arc::new(net.endpoint(PeerId(1))),
            Arc::new(Quiet),
            TransportConfig::default().with_chunk_size(0),
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_stop_closes_connections() {
        let net = LoopbackNetwork::new();
        let a = acceptor(&net, 1);
        let _b = net.endpoint(PeerId(2));
        a.start().unwrap();
        let conn = a.open(PeerId(2), ConnectReason::Lobby).unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Connecting);
        assert_eq!(a.connection_count(), 1);

        a.stop();
        assert!(!a.is_running());
        assert_eq!(conn.status(), ConnectionStatus::NotConnected);
        assert_eq!(a.connection_count(), 0);
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
    fn test_partial_handshakes_hold_decoders_until_complete() {
        let net = LoopbackNetwork::new();
        let a = acceptor(&net, 1);
        let peer = net.endpoint(PeerId(2));
        let other = net.endpoint(PeerId(3));
        a.start().unwrap();

        let frame = encode_frame(&Connect { reason: ConnectReason::Session, channel: 5 }.encode());
        peer.send(PeerId(1), HANDSHAKE_CHANNEL, &frame[..2]).unwrap();
        assert!(wait_until(|| a.decoders.lock().contains_key(&PeerId(2))));
        peer.send(PeerId(1), HANDSHAKE_CHANNEL, &frame[2..]).unwrap();
        assert!(wait_until(|| a.connection_count() == 1));
        assert!(a.decoders.lock().is_empty());
        assert_eq!(a.last_channel.lock().values().copied().collect::<Vec<_>>(), vec![5]);

        other.send(PeerId(1), HANDSHAKE_CHANNEL, &frame[..1]).unwrap();
        assert!(wait_until(|| a.decoders.lock().len() == 1));
        a.stop();
        assert!(a.decoders.lock().is_empty());
    }
}
