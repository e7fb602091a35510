//! repnet - replication transport layer
//!
//! Architecture:
//! - core: NID addressing, type table, object registry, buffer pool
//! - protocol: keyed serialization (binary wire / tree debug), varints,
//!   message ids and length-prefixed framing
//! - network: channel-addressed P2P transports, single-flight send pump,
//!   handshake acceptor and connections
//! - profiler: bandwidth rates and per-kind message statistics

pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod profiler;
pub mod protocol;

pub use config::TransportConfig;
pub use error::{Error, Result};
pub use network::{Acceptor, Connection, ConnectionStatus, P2pAcceptor, PeerId, SessionReceiver};
pub use profiler::NetworkProfiler;
