//! Network layer
//!
//! - [`P2pTransport`]: connectionless, channel-addressed packet delivery
//!   (in-process [`LoopbackTransport`] or mio-based [`TcpTransport`])
//! - [`AsyncSender`]: length-prefixed framing into pooled buffers, one
//!   write in flight at a time
//! - [`P2pConnection`] / [`P2pAcceptor`]: channel handshake and session
//!   traffic on top of a transport

mod acceptor;
mod connection;
mod loopback;
mod sender;
mod tcp;
mod transport;

pub use acceptor::{Acceptor, P2pAcceptor, PeerHandle};
pub use connection::{
    Connection, ConnectionParams, ConnectionStatus, P2pConnection, Role, SessionReceiver,
    HANDSHAKE_CHANNEL,
};
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use sender::{AsyncSender, FrameSink, SenderStats};
pub use tcp::TcpTransport;
pub use transport::{P2pTransport, PeerId};
