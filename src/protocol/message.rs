//! Message ids and connection-control bodies
//!
//! Every frame payload starts with a message id byte:
//! ┌──────────────┬────────────────┬──────────────────────────────┐
//! │ var length   │ message id (1) │ type-specific body           │
//! └──────────────┴────────────────┴──────────────────────────────┘
//!
//! Control bodies:
//! - Connect (3):          `[reason byte][var proposed channel]`
//! - IncorrectChannel (4): `[var last valid channel]`
//! - Accepted (5):         `[var acceptor channel]`
//! - Ping/Pong (1/2):      `[var sequence]`

use super::varint;

/// Message id, first byte of every frame payload.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// Keep-alive probe
    Ping = 1,
    /// Answer to a ping, same sequence
    Pong = 2,
    /// Handshake request, sent on channel 0
    Connect = 3,
    /// Negative acknowledgement of a stale Connect
    IncorrectChannel = 4,
    /// Handshake completion, carries the acceptor's channel
    Accepted = 5,
    /// Orderly close
    Disconnect = 6,
    ObjectCreate = 16,
    ObjectUpdate = 17,
    ObjectDestroy = 18,
    SubstateUpdate = 19,
}

impl MessageId {
    #[inline(always)]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Ping),
            2 => Some(Self::Pong),
            3 => Some(Self::Connect),
            4 => Some(Self::IncorrectChannel),
            5 => Some(Self::Accepted),
            6 => Some(Self::Disconnect),
            16 => Some(Self::ObjectCreate),
            17 => Some(Self::ObjectUpdate),
            18 => Some(Self::ObjectDestroy),
            19 => Some(Self::SubstateUpdate),
            _ => None,
        }
    }

    /// Ids allowed while a connection is still negotiating.
    #[inline(always)]
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            Self::Connect | Self::IncorrectChannel | Self::Accepted
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ping => "Ping",
            Self::Pong => "Pong",
            Self::Connect => "Connect",
            Self::IncorrectChannel => "IncorrectChannel",
            Self::Accepted => "Accepted",
            Self::Disconnect => "Disconnect",
            Self::ObjectCreate => "ObjectCreate",
            Self::ObjectUpdate => "ObjectUpdate",
            Self::ObjectDestroy => "ObjectDestroy",
            Self::SubstateUpdate => "SubstateUpdate",
        }
    }
}

/// Why a peer is connecting; part of the acceptor's peer handle.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectReason {
    Session = 0,
    Lobby = 1,
    Spectate = 2,
}

impl ConnectReason {
    #[inline(always)]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Session),
            1 => Some(Self::Lobby),
            2 => Some(Self::Spectate),
            _ => None,
        }
    }
}

/// Handshake request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connect {
    pub reason: ConnectReason,
    /// Channel the connecting peer will receive on
    pub channel: u32,
}

/// Reply to a Connect whose channel is not above the last accepted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncorrectChannel {
    pub last_valid: u32,
}

/// Acceptor's answer to a valid Connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    /// Channel the acceptor receives on for this connection
    pub channel: u32,
}

/// Ping or Pong body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub seq: u32,
}

fn with_id(id: MessageId, capacity: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + capacity);
    out.push(id as u8);
    out
}

/// Split a message into its id and body, checking the id.
#[inline]
fn body_of(message: &[u8], id: MessageId) -> Option<&[u8]> {
    match message.split_first() {
        Some((&first, body)) if first == id as u8 => Some(body),
        _ => None,
    }
}

/// Body holding a single varint and nothing else.
fn single_var(body: &[u8]) -> Option<u32> {
    match varint::read_u32(body) {
        Ok(Some((value, used))) if used == body.len() => Some(value),
        _ => None,
    }
}

impl Connect {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = with_id(MessageId::Connect, 1 + varint::MAX_VARINT_LEN);
        out.push(self.reason as u8);
        varint::write_u32(&mut out, self.channel);
        out
    }

    pub fn decode(message: &[u8]) -> Option<Self> {
        let body = body_of(message, MessageId::Connect)?;
        let (&reason, rest) = body.split_first()?;
        Some(Self {
            reason: ConnectReason::from_u8(reason)?,
            channel: single_var(rest)?,
        })
    }
}

impl IncorrectChannel {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = with_id(MessageId::IncorrectChannel, varint::MAX_VARINT_LEN);
        varint::write_u32(&mut out, self.last_valid);
        out
    }

    pub fn decode(message: &[u8]) -> Option<Self> {
        let body = body_of(message, MessageId::IncorrectChannel)?;
        Some(Self {
            last_valid: single_var(body)?,
        })
    }
}

impl Accepted {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = with_id(MessageId::Accepted, varint::MAX_VARINT_LEN);
        varint::write_u32(&mut out, self.channel);
        out
    }

    pub fn decode(message: &[u8]) -> Option<Self> {
        let body = body_of(message, MessageId::Accepted)?;
        Some(Self {
            channel: single_var(body)?,
        })
    }
}

impl Probe {
    pub fn encode(&self, id: MessageId) -> Vec<u8> {
        let mut out = with_id(id, varint::MAX_VARINT_LEN);
        varint::write_u32(&mut out, self.seq);
        out
    }

    pub fn decode(message: &[u8], id: MessageId) -> Option<Self> {
        let body = body_of(message, id)?;
        Some(Self {
            seq: single_var(body)?,
        })
    }
}
