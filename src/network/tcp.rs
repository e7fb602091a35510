//! TCP implementation of [`P2pTransport`]
//!
//! One mio-driven IO thread accepts sockets and reads every link; senders
//! write directly from the calling thread. Outbound links are opened lazily
//! on the first send to a peer registered with [`TcpTransport::add_peer`].
//!
//! Stream layout:
//! - connecting side first writes its peer id, 8 bytes little-endian
//! - then packets `[var channel][var length][payload]` in both directions

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{self, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use super::transport::{P2pTransport, PeerId};
use crate::error::TransportError;
use crate::protocol::varint;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_LINK: usize = 2;

const EVENTS_CAPACITY: usize = 256;
const POLL_TIMEOUT: Duration = Duration::from_millis(10);
const READ_CHUNK: usize = 64 * 1024;
const SOCKET_BUFFER: usize = 256 * 1024;
const MAX_PACKET_LEN: usize = 16 * 1024 * 1024;
const HELLO_LEN: usize = 8;

/// One socket, readable by the IO thread and writable by senders.
#[derive(Debug)]
struct Link {
    stream: TcpStream,
    write_lock: Mutex<()>,
}

impl Link {
    /// Write a whole packet on a non-blocking socket.
    fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        let _guard = self.write_lock.lock();
        let mut written = 0;
        while written < packet.len() {
            match (&self.stream).write(&packet[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_micros(100));
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

struct Shared {
    local: PeerId,
    registry: Registry,
    waker: Waker,
    running: AtomicBool,
    next_token: AtomicUsize,
    addresses: Mutex<HashMap<PeerId, SocketAddr>>,
    routes: Mutex<HashMap<PeerId, Arc<Link>>>,
    /// Outbound links registered by senders, picked up by the IO thread
    pending: Mutex<Vec<(Token, PeerId, Arc<Link>)>>,
    inbox: Mutex<HashMap<u32, VecDeque<(PeerId, Vec<u8>)>>>,
}

impl Shared {
    fn deliver(&self, from: PeerId, channel: u32, packet: Vec<u8>) {
        trace!(from = %from, channel, len = packet.len(), "tcp packet");
        self.inbox
            .lock()
            .entry(channel)
            .or_default()
            .push_back((from, packet));
    }

    /// Existing route to `peer`, or a fresh outbound link.
    fn route(&self, peer: PeerId) -> Result<Arc<Link>, TransportError> {
        if let Some(link) = self.routes.lock().get(&peer) {
            return Ok(Arc::clone(link));
        }
        let addr = self
            .addresses
            .lock()
            .get(&peer)
            .copied()
            .ok_or(TransportError::UnknownPeer(peer))?;

        let mut std_stream = net::TcpStream::connect(addr)?;
        std_stream.write_all(&self.local.0.to_le_bytes())?;
        std_stream.set_nonblocking(true)?;
        let mut stream = TcpStream::from_std(std_stream);
        tune_socket(&stream)?;

        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.registry.register(&mut stream, token, Interest::READABLE)?;
        let link = Arc::new(Link {
            stream,
            write_lock: Mutex::new(()),
        });

        let mut routes = self.routes.lock();
        if let Some(existing) = routes.get(&peer) {
            // Another sender connected meanwhile; ours closes on drop
            return Ok(Arc::clone(existing));
        }
        routes.insert(peer, Arc::clone(&link));
        self.pending.lock().push((token, peer, Arc::clone(&link)));
        drop(routes);
        info!(peer = %peer, %addr, "opened tcp link");
        Ok(link)
    }
}

/// Socket-level tuning shared by accepted and outbound links.
fn tune_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;

    // Best effort; not every platform honors these
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = stream.as_raw_fd();
        let optval = SOCKET_BUFFER as libc::c_int;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }
    Ok(())
}

/// Per-link read state kept by the IO thread.
struct LinkState {
    link: Arc<Link>,
    /// Unknown until the connecting side's hello arrives
    peer: Option<PeerId>,
    buffer: Vec<u8>,
}

impl LinkState {
    fn new(link: Arc<Link>, peer: Option<PeerId>) -> Self {
        Self {
            link,
            peer,
            buffer: Vec::new(),
        }
    }

    fn take_hello(&mut self) -> Option<PeerId> {
        if self.buffer.len() < HELLO_LEN {
            return None;
        }
        let mut raw = [0u8; HELLO_LEN];
        raw.copy_from_slice(&self.buffer[..HELLO_LEN]);
        self.buffer.drain(..HELLO_LEN);
        Some(PeerId(u64::from_le_bytes(raw)))
    }

    /// Next complete `(channel, payload)` packet.
    fn next_packet(&mut self) -> io::Result<Option<(u32, Vec<u8>)>> {
        let corrupt = |_| io::Error::new(io::ErrorKind::InvalidData, "corrupt packet header");
        let Some((channel, a)) = varint::read_u32(&self.buffer).map_err(corrupt)? else {
            return Ok(None);
        };
        let Some((len, b)) = varint::read_u32(&self.buffer[a..]).map_err(corrupt)? else {
            return Ok(None);
        };
        let len = len as usize;
        if len > MAX_PACKET_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "packet too large"));
        }
        let start = a + b;
        if self.buffer.len() < start + len {
            return Ok(None);
        }
        let payload = self.buffer[start..start + len].to_vec();
        self.buffer.drain(..start + len);
        Ok(Some((channel, payload)))
    }
}

/// mio-backed TCP transport.
pub struct TcpTransport {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    io_thread: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Listen on `addr` and start the IO thread.
    pub fn bind(local: PeerId, addr: SocketAddr) -> Result<Self, TransportError> {
        let poll = Poll::new()?;

        let std_listener = net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(std_listener);
        let local_addr = listener.local_addr()?;

        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER)?;

        let shared = Arc::new(Shared {
            local,
            registry: poll.registry().try_clone()?,
            waker,
            running: AtomicBool::new(true),
            next_token: AtomicUsize::new(FIRST_LINK),
            addresses: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            inbox: Mutex::new(HashMap::new()),
        });

        let io_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("repnet-tcp-io".into())
            .spawn(move || run_io(poll, listener, io_shared))?;

        info!(peer = %local, addr = %local_addr, "tcp transport listening");
        Ok(Self {
            shared,
            local_addr,
            io_thread: Mutex::new(Some(handle)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Record where `peer` listens; the link opens on first send.
    pub fn add_peer(&self, peer: PeerId, addr: SocketAddr) {
        self.shared.addresses.lock().insert(peer, addr);
    }

    /// Peers with an open link.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.shared.routes.lock().keys().copied().collect()
    }

    /// Stop the IO thread and close every link. Idempotent.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.shared.waker.wake() {
            warn!(error = %e, "failed to wake tcp io thread");
        }
        if let Some(handle) = self.io_thread.lock().take() {
            if handle.join().is_err() {
                error!("tcp io thread panicked");
            }
        }
        self.shared.routes.lock().clear();
        debug!(peer = %self.shared.local, "tcp transport shut down");
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl P2pTransport for TcpTransport {
    fn local_peer(&self) -> PeerId {
        self.shared.local
    }

    fn send(&self, to: PeerId, channel: u32, data: &[u8]) -> Result<(), TransportError> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let link = self.shared.route(to)?;

        let mut packet = Vec::with_capacity(2 * varint::MAX_VARINT_LEN + data.len());
        varint::write_u32(&mut packet, channel);
        varint::write_u32(&mut packet, data.len() as u32);
        packet.extend_from_slice(data);

        link.write_packet(&packet).map_err(|source| {
            // Drop the broken route so the next send reconnects
            let mut routes = self.shared.routes.lock();
            if routes.get(&to).is_some_and(|l| Arc::ptr_eq(l, &link)) {
                routes.remove(&to);
            }
            TransportError::Send {
                peer: to,
                channel,
                source,
            }
        })
    }

    fn available(&self, channel: u32) -> Option<usize> {
        let inbox = self.shared.inbox.lock();
        inbox.get(&channel)?.front().map(|(_, p)| p.len())
    }

    fn read(&self, channel: u32, buf: &mut [u8]) -> Option<(PeerId, usize)> {
        let mut inbox = self.shared.inbox.lock();
        let queue = inbox.get_mut(&channel)?;
        if queue.front()?.1.len() > buf.len() {
            return None;
        }
        let (from, packet) = queue.pop_front()?;
        buf[..packet.len()].copy_from_slice(&packet);
        Some((from, packet.len()))
    }
}

fn run_io(mut poll: Poll, listener: TcpListener, shared: Arc<Shared>) {
    let mut events = Events::with_capacity(EVENTS_CAPACITY);
    let mut links: HashMap<Token, LinkState> = HashMap::new();
    let mut read_buf = vec![0u8; READ_CHUNK].into_boxed_slice();

    while shared.running.load(Ordering::Acquire) {
        if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "tcp poll failed");
            break;
        }

        // Read adopted links once; data may have arrived before adoption
        let adopted: Vec<Token> = shared
            .pending
            .lock()
            .drain(..)
            .map(|(token, peer, link)| {
                links.insert(token, LinkState::new(link, Some(peer)));
                token
            })
            .collect();
        for token in adopted {
            if !read_link(token, &mut links, &shared, &mut read_buf) {
                close_link(token, &mut links, &shared);
            }
        }

        for event in events.iter() {
            match event.token() {
                LISTENER => accept_links(&listener, poll.registry(), &shared, &mut links),
                WAKER => {}
                token => {
                    if !read_link(token, &mut links, &shared, &mut read_buf) {
                        close_link(token, &mut links, &shared);
                    }
                }
            }
        }
    }
    debug!(links = links.len(), "tcp io thread exiting");
}

fn accept_links(
    listener: &TcpListener,
    registry: &Registry,
    shared: &Shared,
    links: &mut HashMap<Token, LinkState>,
) {
    loop {
        match listener.accept() {
            Ok((mut stream, addr)) => {
                if let Err(e) = tune_socket(&stream) {
                    warn!(%addr, error = %e, "socket tuning failed");
                }
                let token = Token(shared.next_token.fetch_add(1, Ordering::Relaxed));
                if let Err(e) = registry.register(&mut stream, token, Interest::READABLE) {
                    error!(%addr, error = %e, "failed to register accepted link");
                    continue;
                }
                let link = Arc::new(Link {
                    stream,
                    write_lock: Mutex::new(()),
                });
                links.insert(token, LinkState::new(link, None));
                debug!(%addr, ?token, "accepted tcp link");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                error!(error = %e, "accept failed");
                break;
            }
        }
    }
}

/// Drain a readable link. Returns `false` when the link must be closed.
fn read_link(token: Token, links: &mut HashMap<Token, LinkState>, shared: &Shared, read_buf: &mut [u8]) -> bool {
    let Some(state) = links.get_mut(&token) else {
        return true;
    };

    let mut open = true;
    loop {
        match (&state.link.stream).read(read_buf) {
            Ok(0) => {
                open = false;
                break;
            }
            Ok(n) => state.buffer.extend_from_slice(&read_buf[..n]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!(?token, error = %e, "tcp read failed");
                open = false;
                break;
            }
        }
    }

    if state.peer.is_none() {
        if let Some(peer) = state.take_hello() {
            state.peer = Some(peer);
            shared
                .routes
                .lock()
                .entry(peer)
                .or_insert_with(|| Arc::clone(&state.link));
            info!(peer = %peer, ?token, "tcp peer identified");
        }
    }

    if let Some(peer) = state.peer {
        loop {
            match state.next_packet() {
                Ok(Some((channel, payload))) => shared.deliver(peer, channel, payload),
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "dropping tcp link");
                    return false;
                }
            }
        }
    }
    open
}

fn close_link(token: Token, links: &mut HashMap<Token, LinkState>, shared: &Shared) {
    let Some(state) = links.remove(&token) else {
        return;
    };
    if let Some(peer) = state.peer {
        let mut routes = shared.routes.lock();
        if routes.get(&peer).is_some_and(|l| Arc::ptr_eq(l, &state.link)) {
            routes.remove(&peer);
        }
        info!(peer = %peer, "tcp link closed");
    }
}
