//! In-process transport
//!
//! Every endpoint of a [`LoopbackNetwork`] owns a set of per-channel queues;
//! `send` appends to the destination's queue under one mutex. Used by the
//! integration tests and for single-process sessions.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::transport::{P2pTransport, PeerId};
use crate::error::TransportError;

type Inbox = HashMap<u32, VecDeque<(PeerId, Vec<u8>)>>;

#[derive(Debug, Default)]
pub struct LoopbackNetwork {
    inboxes: Mutex<HashMap<PeerId, Inbox>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `peer` and return its endpoint.
    pub fn endpoint(self: &Arc<Self>, peer: PeerId) -> LoopbackTransport {
        self.inboxes.lock().entry(peer).or_default();
        LoopbackTransport {
            network: Arc::clone(self),
            local: peer,
        }
    }

    /// Unregister `peer`; later sends to it fail with `UnknownPeer`.
    pub fn remove(&self, peer: PeerId) {
        self.inboxes.lock().remove(&peer);
    }

    /// Packets queued for `peer` across all channels.
    pub fn pending(&self, peer: PeerId) -> usize {
        self.inboxes
            .lock()
            .get(&peer)
            .map_or(0, |inbox| inbox.values().map(VecDeque::len).sum())
    }
}

/// One peer's view of a [`LoopbackNetwork`].
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
    local: PeerId,
}

impl P2pTransport for LoopbackTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    fn send(&self, to: PeerId, channel: u32, data: &[u8]) -> Result<(), TransportError> {
        let mut inboxes = self.network.inboxes.lock();
        let inbox = inboxes.get_mut(&to).ok_or(TransportError::UnknownPeer(to))?;
        inbox
            .entry(channel)
            .or_default()
            .push_back((self.local, data.to_vec()));
        trace!(from = %self.local, to = %to, channel, len = data.len(), "loopback packet");
        Ok(())
    }

    fn available(&self, channel: u32) -> Option<usize> {
        let inboxes = self.network.inboxes.lock();
        inboxes
            .get(&self.local)?
            .get(&channel)?
            .front()
            .map(|(_, packet)| packet.len())
    }

    fn read(&self, channel: u32, buf: &mut [u8]) -> Option<(PeerId, usize)> {
        let mut inboxes = self.network.inboxes.lock();
        let queue = inboxes.get_mut(&self.local)?.get_mut(&channel)?;
        if queue.front()?.1.len() > buf.len() {
            return None;
        }
        let (from, packet) = queue.pop_front()?;
        buf[..packet.len()].copy_from_slice(&packet);
        Some((from, packet.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channels_are_separate_queues() {
        let net = LoopbackNetwork::new();
        let a = net.endpoint(PeerId(1));
        let b = net.endpoint(PeerId(2));

        a.send(PeerId(2), 0, b"hello").unwrap();
        a.send(PeerId(2), 4, b"data").unwrap();
        assert_eq!(net.pending(PeerId(2)), 2);

        let mut buf = [0u8; 16];
        assert_eq!(b.available(4), Some(4));
        assert_eq!(b.read(4, &mut buf), Some((PeerId(1), 4)));
        assert_eq!(&buf[..4], b"data");
        assert_eq!(b.read(4, &mut buf), None);
        assert_eq!(b.read(0, &mut buf), Some((PeerId(1), 5)));
    }

    #[test]
    fn test_small_buffer_keeps_packet() {
        let net = LoopbackNetwork::new();
        let a = net.endpoint(PeerId(1));
        let b = net.endpoint(PeerId(2));
        a.send(PeerId(2), 1, &[9u8; 32]).unwrap();

        let mut small = [0u8; 8];
        assert_eq!(b.read(1, &mut small), None);
        assert_eq!(b.available(1), Some(32));
    }

    #[test]
    fn test_unknown_peer() {
        let net = LoopbackNetwork::new();
        let a = net.endpoint(PeerId(1));
        assert!(matches!(
            a.send(PeerId(7), 0, b"x"),
            Err(TransportError::UnknownPeer(PeerId(7)))
        ));
    }
}
