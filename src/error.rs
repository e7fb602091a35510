//! Error types
//!
//! One enum per concern, aggregated by [`Error`]. Nothing in this crate panics
//! across the connection boundary; these errors surface from the explicit
//! encode/decode/transport calls only.

use std::io;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// NID construction and parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NidError {
    #[error("partition id {0} out of range (max 1023)")]
    PidOutOfRange(u32),
    #[error("local id {0} out of range (max 4194303)")]
    IdOutOfRange(u32),
    #[error("malformed nid string {0:?}")]
    Malformed(String),
    #[error("unknown object type {0:?}")]
    UnknownType(String),
}

/// Failures raised by the serialization backends.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SerializeError {
    #[error("unexpected end of data reading {what} at offset {offset}")]
    UnexpectedEof { what: &'static str, offset: usize },
    #[error("varint longer than 5 bytes at offset {0}")]
    VarintOverflow(usize),
    #[error("invalid utf-8 in string field {0:?}")]
    InvalidUtf8(String),
    #[error("string table index {0} not defined")]
    UnknownStringIndex(u32),
    #[error("missing field {0:?}")]
    MissingField(String),
    #[error("field {key:?} holds {found}, expected {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("section {0:?} closed without being opened")]
    UnbalancedSection(String),
    #[error("tree text line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("tree render failed: {0}")]
    Render(String),
    #[error(transparent)]
    Nid(#[from] NidError),
}

/// Stream framing failures on the receive path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds limit {max}")]
    TooLarge { len: usize, max: usize },
    #[error("corrupt length prefix")]
    CorruptPrefix,
}

/// Failures reported by a [`P2pTransport`](crate::network::P2pTransport).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} has no known route")]
    UnknownPeer(crate::network::PeerId),
    #[error("transport is shut down")]
    Closed,
    #[error("send to {peer} on channel {channel} failed: {source}")]
    Send {
        peer: crate::network::PeerId,
        channel: u32,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Invalid [`TransportConfig`](crate::config::TransportConfig) values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("chunk_size must be at least 1")]
    ZeroChunkSize,
    #[error("poll_interval must be non-zero")]
    ZeroPollInterval,
    #[error("receive_buffer_size {receive} is smaller than chunk_size {chunk}")]
    ReceiveBufferTooSmall { receive: usize, chunk: usize },
    #[error("max_handshake_attempts must be at least 1")]
    ZeroHandshakeAttempts,
    #[error("profiler_window must hold at least 2 samples")]
    ProfilerWindowTooSmall,
}

/// Aggregate error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Nid(#[from] NidError),
    #[error(transparent)]
    Serialize(#[from] SerializeError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
}
