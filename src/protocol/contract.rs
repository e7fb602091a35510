//! Serialization contract shared by the wire and tree backends
//!
//! Every primitive is written and read under a key, inside the currently open
//! section. Both ends must issue the same sequence of calls; a mismatch is a
//! protocol bug, diagnosed (not prevented) by the binary backend's debug
//! headers.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::message::MessageId;
use crate::core::{KindTable, Nid, TypeTag};
use crate::error::SerializeError;

/// Field name plus optional element index for array-like fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key<'a> {
    pub name: &'a str,
    pub index: Option<u32>,
}

impl<'a> Key<'a> {
    pub const fn new(name: &'a str) -> Self {
        Self { name, index: None }
    }

    pub const fn indexed(name: &'a str, index: u32) -> Self {
        Self {
            name,
            index: Some(index),
        }
    }
}

impl<'a> From<&'a str> for Key<'a> {
    fn from(name: &'a str) -> Self {
        Key::new(name)
    }
}

impl<'a> From<(&'a str, u32)> for Key<'a> {
    fn from((name, index): (&'a str, u32)) -> Self {
        Key::indexed(name, index)
    }
}

impl fmt::Display for Key<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(i) => write!(f, "{}[{}]", self.name, i),
            None => f.write_str(self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Position on the pathfinding grid together with the area it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PathPos {
    pub point: Point,
    pub area: u32,
}

/// What the call site statically knows about a NID's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NidForm {
    /// Type is implied by the field; the tag is not on the wire
    Typed(TypeTag),
    /// Type varies; the tag is written after the id
    Tagged,
}

/// Names of the primitives, as written in debug headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Open,
    Close,
    Bool,
    U8,
    VarU32,
    VarI32,
    Str,
    UniqueStr,
    F32,
    Point,
    PathPos,
    Bytes,
    Nid,
}

impl PrimitiveKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::Bool => "bool",
            Self::U8 => "byte",
            Self::VarU32 => "uint",
            Self::VarI32 => "int",
            Self::Str => "string",
            Self::UniqueStr => "ustring",
            Self::F32 => "float",
            Self::Point => "point",
            Self::PathPos => "pathpos",
            Self::Bytes => "bytes",
            Self::Nid => "nid",
        }
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Debug-header mismatch between what the reader expected and what the
/// writer declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Desync {
    pub offset: usize,
    pub expected_kind: &'static str,
    pub found_kind: String,
    pub expected_key: String,
    pub found_key: String,
}

impl fmt::Display for Desync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "at {}: expected {} {:?}, found {} {:?}",
            self.offset, self.expected_kind, self.expected_key, self.found_kind, self.found_key
        )
    }
}

/// Sub-object addressed inside a replicated object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Substate {
    pub id: u8,
    pub index: u32,
}

/// Routing header of a replication message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub msg: u8,
    pub nid: Nid,
    pub substate: Option<Substate>,
}

impl MessageHeader {
    pub fn new(msg: MessageId, nid: Nid) -> Self {
        Self {
            msg: msg as u8,
            nid,
            substate: None,
        }
    }

    pub fn with_substate(mut self, id: u8, index: u32) -> Self {
        self.substate = Some(Substate { id, index });
        self
    }

    pub fn message_id(&self) -> Option<MessageId> {
        MessageId::from_u8(self.msg)
    }

    /// True when the object type was not recognized and the body must be
    /// skipped.
    pub fn is_dropped(&self) -> bool {
        self.nid.tag() == TypeTag::NONE
    }
}

/// Write side of the contract.
pub trait Writer {
    fn kinds(&self) -> &KindTable;

    fn open_section<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<(), SerializeError>;
    fn close_section<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<(), SerializeError>;

    fn write_bool<'k>(&mut self, key: impl Into<Key<'k>>, value: bool) -> Result<(), SerializeError>;
    fn write_u8<'k>(&mut self, key: impl Into<Key<'k>>, value: u8) -> Result<(), SerializeError>;
    fn write_var_u32<'k>(&mut self, key: impl Into<Key<'k>>, value: u32) -> Result<(), SerializeError>;
    fn write_var_i32<'k>(&mut self, key: impl Into<Key<'k>>, value: i32) -> Result<(), SerializeError>;
    fn write_str<'k>(&mut self, key: impl Into<Key<'k>>, value: &str) -> Result<(), SerializeError>;
    /// Interned through the session string table when one is attached.
    fn write_unique_str<'k>(&mut self, key: impl Into<Key<'k>>, value: &str) -> Result<(), SerializeError>;
    fn write_f32<'k>(&mut self, key: impl Into<Key<'k>>, value: f32) -> Result<(), SerializeError>;
    fn write_point<'k>(&mut self, key: impl Into<Key<'k>>, value: Point) -> Result<(), SerializeError>;
    fn write_path_pos<'k>(&mut self, key: impl Into<Key<'k>>, value: PathPos) -> Result<(), SerializeError>;
    fn write_bytes<'k>(&mut self, key: impl Into<Key<'k>>, value: &[u8]) -> Result<(), SerializeError>;
    fn write_nid<'k>(&mut self, key: impl Into<Key<'k>>, nid: Nid, form: NidForm) -> Result<(), SerializeError>;

    /// First byte of a message. The wire backend writes it raw, outside any
    /// debug header, so the transport can route on it.
    fn write_message_id(&mut self, msg: u8) -> Result<(), SerializeError>;

    /// Message id, `type`, `id`, then `substate`/`substate_index` for
    /// [`MessageId::SubstateUpdate`].
    fn write_message_header(&mut self, header: &MessageHeader) -> Result<(), SerializeError> {
        self.write_message_id(header.msg)?;
        self.write_u8("type", header.nid.tag().0)?;
        self.write_var_u32("id", header.nid.packed())?;
        if header.msg == MessageId::SubstateUpdate as u8 {
            let substate = header.substate.unwrap_or(Substate { id: 0, index: 0 });
            self.write_u8("substate", substate.id)?;
            self.write_var_u32("substate_index", substate.index)?;
        }
        Ok(())
    }
}

/// Read side of the contract.
pub trait Reader {
    fn kinds(&self) -> &KindTable;

    fn open_section<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<(), SerializeError>;
    fn close_section<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<(), SerializeError>;

    fn read_bool<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<bool, SerializeError>;
    fn read_u8<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<u8, SerializeError>;
    fn read_var_u32<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<u32, SerializeError>;
    fn read_var_i32<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<i32, SerializeError>;
    fn read_str<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<String, SerializeError>;
    fn read_unique_str<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<String, SerializeError>;
    fn read_f32<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<f32, SerializeError>;
    fn read_point<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<Point, SerializeError>;
    fn read_path_pos<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<PathPos, SerializeError>;
    fn read_bytes<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<Vec<u8>, SerializeError>;
    fn read_nid<'k>(&mut self, key: impl Into<Key<'k>>, form: NidForm) -> Result<Nid, SerializeError>;

    fn read_message_id(&mut self) -> Result<u8, SerializeError>;

    /// Counterpart of [`Writer::write_message_header`].
    ///
    /// A type tag missing from the kind table is logged and reported as the
    /// sentinel header (`TypeTag::NONE`, null id); see
    /// [`MessageHeader::is_dropped`].
    fn read_message_header(&mut self) -> Result<MessageHeader, SerializeError> {
        let msg = self.read_message_id()?;
        let tag = TypeTag(self.read_u8("type")?);
        let packed = self.read_var_u32("id")?;
        let substate = if msg == MessageId::SubstateUpdate as u8 {
            let id = self.read_u8("substate")?;
            let index = self.read_var_u32("substate_index")?;
            Some(Substate { id, index })
        } else {
            None
        };

        let nid = if self.kinds().contains(tag) {
            Nid::from_packed(tag, packed)
        } else {
            warn!(msg, tag = tag.0, packed, "message references unregistered object type");
            Nid::NULL
        };

        Ok(MessageHeader { msg, nid, substate })
    }
}
