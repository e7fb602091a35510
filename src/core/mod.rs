//! Core module: object addressing and buffer management
//!
//! - NID packing, string forms and the static type table
//! - Session-scoped object registry
//! - Pooled fixed-size send buffers
//! - Fixed-capacity ring used by the profiler window

pub mod kind;
pub mod nid;
pub mod pool;
pub mod registry;
mod ring_buffer;

pub use kind::{Factory, KindInfo, KindTable, TypeTag};
pub use nid::{Nid, NidContext};
pub use pool::{Buffer, BufferPool, PoolStats};
pub use registry::{ObjectRegistry, Replicated};
pub use ring_buffer::RingBuffer;
