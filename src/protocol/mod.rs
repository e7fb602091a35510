//! Protocol layer: serialization and framing
//!
//! - Keyed read/write contract with a binary wire backend and a tree debug
//!   backend
//! - 7-bit varints and the session string table
//! - Message ids, handshake bodies and length-prefixed framing

pub mod binary;
mod contract;
mod encoder;
pub mod message;
mod string_table;
pub mod tree;
pub mod varint;

pub use binary::{BinaryReader, BinaryWriter, DesyncHandler};
pub use contract::{
    Desync, Key, MessageHeader, NidForm, PathPos, Point, PrimitiveKind, Reader, Substate, Writer,
};
pub use encoder::{encode_frame, FrameDecoder, FrameIter};
pub use message::{Accepted, Connect, ConnectReason, IncorrectChannel, MessageId, Probe};
pub use string_table::{Interned, StringTable};
pub use tree::{Field, TreeReader, TreeWriter, Value};
