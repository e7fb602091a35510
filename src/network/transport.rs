//! Injected P2P substrate
//!
//! Connections and acceptors only see this trait: numbered channels carrying
//! reliable, ordered packets between peers. Ordering holds per channel and
//! per sender; nothing stronger is assumed.

use std::fmt;

use crate::error::TransportError;

/// Platform peer identity. The low 32 bits are the account; the upper bits
/// carry a platform instance suffix that may differ between the id a peer
/// announces and the id packets arrive from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl PeerId {
    #[inline(always)]
    pub fn account_id(self) -> u32 {
        self.0 as u32
    }

    /// Identity check tolerant of a suffix mismatch.
    #[inline]
    pub fn same_account(self, other: PeerId) -> bool {
        self.account_id() == other.account_id()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Reliable-ordered packet transport with numbered channels.
pub trait P2pTransport: Send + Sync {
    fn local_peer(&self) -> PeerId;

    /// Queue one packet for `to` on `channel`.
    fn send(&self, to: PeerId, channel: u32, data: &[u8]) -> Result<(), TransportError>;

    /// Size of the next packet waiting on `channel`, if any.
    fn available(&self, channel: u32) -> Option<usize>;

    /// Copy the next packet on `channel` into `buf`.
    ///
    /// Returns `None` when nothing is waiting or `buf` is smaller than the
    /// packet; in the latter case the packet stays queued.
    fn read(&self, channel: u32, buf: &mut [u8]) -> Option<(PeerId, usize)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_suffix_tolerated() {
        let announced = PeerId(0x0110_0001_0000_002A);
        let observed = PeerId(0x0110_0002_0000_002A);
        assert_ne!(announced, observed);
        assert!(announced.same_account(observed));
        assert!(!announced.same_account(PeerId(0x2B)));
        assert_eq!(announced.account_id(), 42);
    }
}
