//! repnet peer: TCP demo of the replication transport
//!
//! Binds a TCP transport, accepts handshakes and optionally connects to other
//! peers, then streams ObjectUpdate messages for a fixed duration and prints
//! the profiler's bandwidth breakdown.
//!
//! Usage:
//!   repnet_peer --peer-id 1 --bind 127.0.0.1:7001
//!   repnet_peer --peer-id 2 --bind 127.0.0.1:7002 --connect 1@127.0.0.1:7001

use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use repnet::core::{KindInfo, KindTable, Nid, TypeTag};
use repnet::network::{
    Acceptor, Connection, ConnectionStatus, P2pAcceptor, P2pConnection, PeerId, SessionReceiver,
    TcpTransport,
};
use repnet::protocol::{
    BinaryReader, BinaryWriter, ConnectReason, MessageHeader, MessageId, Point, Reader, Writer,
};
use repnet::{NetworkProfiler, TransportConfig};

const ARMY: TypeTag = TypeTag(1);
const CITY: TypeTag = TypeTag(2);
static DEMO_ROWS: [KindInfo; 2] = [
    KindInfo::new(ARMY, "Army", true),
    KindInfo::new(CITY, "City", false),
];
static DEMO_KINDS: KindTable = KindTable::new(&DEMO_ROWS);

/// Replication transport demo peer.
#[derive(Parser)]
#[command(name = "repnet_peer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Local peer id
    #[arg(long)]
    peer_id: u64,

    /// Listen address
    #[arg(short, long, default_value = "127.0.0.1:0")]
    bind: SocketAddr,

    /// Remote peer to connect to, as ID@ADDR (repeatable)
    #[arg(short, long, value_parser = parse_remote)]
    connect: Vec<Remote>,

    /// Updates sent per second on each connection
    #[arg(short, long, default_value_t = 100)]
    messages: u32,

    /// Seconds to run
    #[arg(short, long, default_value_t = 10)]
    duration: u64,

    /// Send buffer size in bytes
    #[arg(long, default_value_t = 1024)]
    chunk_size: usize,

    /// Write the bandwidth breakdown here instead of stdout
    #[arg(long)]
    csv: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
struct Remote {
    peer: PeerId,
    addr: SocketAddr,
}

fn parse_remote(s: &str) -> Result<Remote, String> {
    let (id, addr) = s
        .split_once('@')
        .ok_or_else(|| format!("expected ID@ADDR, got {s:?}"))?;
    let id = id.parse::<u64>().map_err(|e| format!("bad peer id {id:?}: {e}"))?;
    let addr = addr
        .parse::<SocketAddr>()
        .map_err(|e| format!("bad address {addr:?}: {e}"))?;
    Ok(Remote {
        peer: PeerId(id),
        addr,
    })
}

/// Counts and decodes incoming updates.
#[derive(Default)]
struct PeerSession {
    received: AtomicU64,
    dropped: AtomicU64,
    connections: Mutex<Vec<Arc<dyn Connection>>>,
}

impl SessionReceiver for PeerSession {
    fn on_connected(&self, connection: Arc<dyn Connection>) {
        info!(peer = %connection.peer(), role = ?connection.role(), "session connected");
        self.connections.lock().push(connection);
    }

    fn on_message(&self, connection: &dyn Connection, message: &[u8]) {
        let mut reader = BinaryReader::new(message).with_kinds(DEMO_KINDS);
        let decoded = reader.read_message_header().and_then(|header| {
            if header.is_dropped() {
                return Ok(None);
            }
            let pos = reader.read_point("pos")?;
            let hp = reader.read_var_i32("hp")?;
            Ok(Some((header, pos, hp)))
        });
        match decoded {
            Ok(Some((header, pos, hp))) => {
                self.received.fetch_add(1, Ordering::Relaxed);
                debug!(
                    peer = %connection.peer(),
                    nid = %header.nid.to_string_with(&DEMO_KINDS),
                    x = pos.x,
                    y = pos.y,
                    hp,
                    "update"
                );
            }
            Ok(None) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(peer = %connection.peer(), error = %e, "undecodable message");
            }
        }
    }

    fn on_disconnected(&self, connection: &dyn Connection) {
        info!(peer = %connection.peer(), "session disconnected");
    }
}

fn encode_update(pid: u32, id: u32, tick: u64) -> Result<Vec<u8>> {
    let nid = Nid::new(ARMY, pid, id)?;
    let mut writer = BinaryWriter::with_capacity(32).with_kinds(DEMO_KINDS);
    writer.write_message_header(&MessageHeader::new(MessageId::ObjectUpdate, nid))?;
    let t = tick as f32 * 0.1;
    writer.write_point("pos", Point::new(t.cos() * 10.0, t.sin() * 10.0))?;
    writer.write_var_i32("hp", 100 - (tick % 100) as i32)?;
    Ok(writer.into_bytes())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("repnet={level},repnet_peer={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = TransportConfig::default().with_chunk_size(cli.chunk_size);
    config.validate()?;

    let local = PeerId(cli.peer_id);
    let transport = Arc::new(
        TcpTransport::bind(local, cli.bind).with_context(|| format!("binding {}", cli.bind))?,
    );
    info!(peer = %local, addr = %transport.local_addr(), "listening");
    for remote in &cli.connect {
        transport.add_peer(remote.peer, remote.addr);
    }

    let profiler = Arc::new(NetworkProfiler::new(config.profiler_window, DEMO_KINDS));
    let session = Arc::new(PeerSession::default());
    let acceptor = P2pAcceptor::new(
        transport.clone(),
        session.clone(),
        config,
        Some(profiler.clone()),
    )?;
    acceptor.start()?;

    let mut outgoing: Vec<Arc<P2pConnection>> = Vec::new();
    for remote in &cli.connect {
        outgoing.push(acceptor.open(remote.peer, ConnectReason::Session)?);
    }

    let pid = (cli.peer_id % 1024) as u32;
    let interval = Duration::from_secs(1) / cli.messages.max(1);
    let deadline = Instant::now() + Duration::from_secs(cli.duration);
    let mut next_report = Instant::now() + Duration::from_secs(1);
    let mut tick = 0u64;

    while Instant::now() < deadline {
        let update = encode_update(pid, (tick % 64) as u32 + 1, tick)?;
        let live: Vec<Arc<dyn Connection>> = session
            .connections
            .lock()
            .iter()
            .filter(|c| c.status() == ConnectionStatus::Connected)
            .cloned()
            .collect();
        for conn in &live {
            conn.send(&update);
        }
        tick += 1;

        if Instant::now() >= next_report {
            let rates = profiler.rates();
            info!(
                connections = live.len(),
                sent_bps = rates.sent_bytes_per_sec.round(),
                recv_bps = rates.received_bytes_per_sec.round(),
                received = session.received.load(Ordering::Relaxed),
                "stats"
            );
            for conn in &outgoing {
                conn.ping();
                if let Some(rtt) = conn.rtt() {
                    debug!(peer = %conn.peer(), rtt_us = rtt.as_micros() as u64, "rtt");
                }
            }
            next_report += Duration::from_secs(1);
        }
        thread::sleep(interval);
    }

    acceptor.stop();
    transport.shutdown();

    let (sent, received) = profiler.totals();
    info!(
        sent,
        received,
        updates = session.received.load(Ordering::Relaxed),
        dropped = session.dropped.load(Ordering::Relaxed),
        "done"
    );
    match &cli.csv {
        Some(path) => {
            let mut file =
                File::create(path).with_context(|| format!("creating {}", path.display()))?;
            profiler.report_csv(&mut file)?;
        }
        None => profiler.report_csv(&mut io::stdout().lock())?,
    }
    Ok(())
}
