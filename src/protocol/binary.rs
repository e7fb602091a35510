//! Binary wire backend
//!
//! Primitive encodings:
//! - bool, u8:          1 byte
//! - var_u32, var_i32:  varint (signed zig-zag folded)
//! - f32:               4 bytes little-endian
//! - point:             two f32
//! - path_pos:          point, var area
//! - str, bytes:        var length, raw bytes
//! - unique str:        string-table form when a table is attached, else str
//! - nid:               var id; if non-zero, `[u8 tag]` for `NidForm::Tagged`,
//!                      then `var pid` when the kind is partitioned
//!
//! With debug headers enabled, each primitive and each section boundary is
//! preceded by its primitive name, key name and `var(index + 1)` (0 = no
//! index). Names go through the string table when one is attached.

use tracing::warn;

use super::contract::{Desync, Key, NidForm, PathPos, Point, PrimitiveKind, Reader, Writer};
use super::string_table::{Interned, StringTable};
use super::varint;
use crate::core::{KindTable, Nid, TypeTag};
use crate::error::SerializeError;

/// Appends the encoded form of every call to a growable buffer.
pub struct BinaryWriter<'a> {
    out: Vec<u8>,
    kinds: KindTable,
    strings: Option<&'a mut StringTable>,
    debug_headers: bool,
    sections: Vec<String>,
}

impl<'a> BinaryWriter<'a> {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            out: Vec::with_capacity(capacity),
            kinds: KindTable::EMPTY,
            strings: None,
            debug_headers: false,
            sections: Vec::new(),
        }
    }

    pub fn with_kinds(mut self, kinds: KindTable) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn with_debug_headers(mut self, enabled: bool) -> Self {
        self.debug_headers = enabled;
        self
    }

    pub fn with_string_table(mut self, table: &'a mut StringTable) -> Self {
        self.strings = Some(table);
        self
    }

    #[inline(always)]
    pub fn position(&self) -> usize {
        self.out.len()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.out.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.out
    }

    pub fn into_bytes(self) -> Vec<u8> {
        if !self.sections.is_empty() {
            warn!(open = ?self.sections, "writer finished with unclosed sections");
        }
        self.out
    }

    #[inline]
    fn put_var(&mut self, value: u32) {
        varint::write_u32(&mut self.out, value);
    }

    fn put_raw_str(&mut self, value: &str) {
        self.put_var(value.len() as u32);
        self.out.extend_from_slice(value.as_bytes());
    }

    fn put_interned(&mut self, value: &str) {
        let Some(table) = self.strings.as_deref_mut() else {
            self.put_raw_str(value);
            return;
        };
        match table.intern(value) {
            Interned::New(_) => {
                self.put_var(0);
                self.put_raw_str(value);
            }
            Interned::Known(index) => self.put_var(index + 1),
        }
    }

    fn header(&mut self, kind: PrimitiveKind, key: Key<'_>) {
        if !self.debug_headers {
            return;
        }
        self.put_interned(kind.name());
        self.put_interned(key.name);
        self.put_var(key.index.map_or(0, |i| i + 1));
    }

    #[inline]
    fn put_f32(&mut self, value: f32) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }
}

impl Default for BinaryWriter<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Writer for BinaryWriter<'_> {
    fn kinds(&self) -> &KindTable {
        &self.kinds
    }

    fn open_section<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<(), SerializeError> {
        let key = key.into();
        self.header(PrimitiveKind::Open, key);
        self.sections.push(key.name.to_owned());
        Ok(())
    }

    fn close_section<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<(), SerializeError> {
        let key = key.into();
        match self.sections.pop() {
            Some(open) if open == key.name => {}
            Some(open) => warn!(open = %open, close = %key, "section closed under a different key"),
            None => return Err(SerializeError::UnbalancedSection(key.name.to_owned())),
        }
        self.header(PrimitiveKind::Close, key);
        Ok(())
    }

    fn write_bool<'k>(&mut self, key: impl Into<Key<'k>>, value: bool) -> Result<(), SerializeError> {
        self.header(PrimitiveKind::Bool, key.into());
        self.out.push(value as u8);
        Ok(())
    }

    fn write_u8<'k>(&mut self, key: impl Into<Key<'k>>, value: u8) -> Result<(), SerializeError> {
        self.header(PrimitiveKind::U8, key.into());
        self.out.push(value);
        Ok(())
    }

    fn write_var_u32<'k>(&mut self, key: impl Into<Key<'k>>, value: u32) -> Result<(), SerializeError> {
        self.header(PrimitiveKind::VarU32, key.into());
        self.put_var(value);
        Ok(())
    }

    fn write_var_i32<'k>(&mut self, key: impl Into<Key<'k>>, value: i32) -> Result<(), SerializeError> {
        self.header(PrimitiveKind::VarI32, key.into());
        varint::write_i32(&mut self.out, value);
        Ok(())
    }

    fn write_str<'k>(&mut self, key: impl Into<Key<'k>>, value: &str) -> Result<(), SerializeError> {
        self.header(PrimitiveKind::Str, key.into());
        self.put_raw_str(value);
        Ok(())
    }

    fn write_unique_str<'k>(&mut self, key: impl Into<Key<'k>>, value: &str) -> Result<(), SerializeError> {
        self.header(PrimitiveKind::UniqueStr, key.into());
        self.put_interned(value);
        Ok(())
    }

    fn write_f32<'k>(&mut self, key: impl Into<Key<'k>>, value: f32) -> Result<(), SerializeError> {
        self.header(PrimitiveKind::F32, key.into());
        self.put_f32(value);
        Ok(())
    }

    fn write_point<'k>(&mut self, key: impl Into<Key<'k>>, value: Point) -> Result<(), SerializeError> {
        self.header(PrimitiveKind::Point, key.into());
        self.put_f32(value.x);
        self.put_f32(value.y);
        Ok(())
    }

    fn write_path_pos<'k>(&mut self, key: impl Into<Key<'k>>, value: PathPos) -> Result<(), SerializeError> {
        self.header(PrimitiveKind::PathPos, key.into());
        self.put_f32(value.point.x);
        self.put_f32(value.point.y);
        self.put_var(value.area);
        Ok(())
    }

    fn write_bytes<'k>(&mut self, key: impl Into<Key<'k>>, value: &[u8]) -> Result<(), SerializeError> {
        self.header(PrimitiveKind::Bytes, key.into());
        self.put_var(value.len() as u32);
        self.out.extend_from_slice(value);
        Ok(())
    }

    fn write_nid<'k>(&mut self, key: impl Into<Key<'k>>, nid: Nid, form: NidForm) -> Result<(), SerializeError> {
        let key = key.into();
        self.header(PrimitiveKind::Nid, key);
        self.put_var(nid.id());
        if nid.is_null() {
            return Ok(());
        }
        let tag = match form {
            NidForm::Typed(tag) => {
                if nid.tag() != tag && nid.tag() != TypeTag::NONE {
                    warn!(key = %key, expected = tag.0, actual = nid.tag().0, "nid written under a different static type");
                }
                tag
            }
            NidForm::Tagged => {
                self.out.push(nid.tag().0);
                nid.tag()
            }
        };
        if self.kinds.is_partitioned(tag) {
            self.put_var(nid.pid());
        } else if nid.pid() != 0 {
            warn!(key = %key, pid = nid.pid(), "pid dropped for non-partitioned type");
        }
        Ok(())
    }

    fn write_message_id(&mut self, msg: u8) -> Result<(), SerializeError> {
        self.out.push(msg);
        Ok(())
    }
}

/// Callback invoked once per debug-header mismatch.
pub type DesyncHandler<'a> = Box<dyn FnMut(&Desync) + 'a>;

/// Decodes a byte slice produced by [`BinaryWriter`] with the same flags.
pub struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
    kinds: KindTable,
    strings: Option<&'a mut StringTable>,
    debug_headers: bool,
    on_desync: Option<DesyncHandler<'a>>,
    desyncs: usize,
    sections: Vec<String>,
}

impl<'a> BinaryReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            kinds: KindTable::EMPTY,
            strings: None,
            debug_headers: false,
            on_desync: None,
            desyncs: 0,
            sections: Vec::new(),
        }
    }

    pub fn with_kinds(mut self, kinds: KindTable) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn with_debug_headers(mut self, enabled: bool) -> Self {
        self.debug_headers = enabled;
        self
    }

    pub fn with_string_table(mut self, table: &'a mut StringTable) -> Self {
        self.strings = Some(table);
        self
    }

    pub fn on_desync(mut self, handler: impl FnMut(&Desync) + 'a) -> Self {
        self.on_desync = Some(Box::new(handler));
        self
    }

    #[inline(always)]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Debug-header mismatches seen so far.
    pub fn desync_count(&self) -> usize {
        self.desyncs
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], SerializeError> {
        let data = self.data;
        if data.len() - self.pos < n {
            return Err(SerializeError::UnexpectedEof {
                what,
                offset: self.pos,
            });
        }
        let slice = &data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_var(&mut self, what: &'static str) -> Result<u32, SerializeError> {
        let start = self.pos;
        match varint::read_u32(&self.data[start..]) {
            Ok(Some((value, used))) => {
                self.pos += used;
                Ok(value)
            }
            Ok(None) => Err(SerializeError::UnexpectedEof { what, offset: start }),
            Err(SerializeError::VarintOverflow(at)) => Err(SerializeError::VarintOverflow(start + at)),
            Err(e) => Err(e),
        }
    }

    fn take_raw_str(&mut self, what: &'static str) -> Result<String, SerializeError> {
        let len = self.take_var(what)? as usize;
        let bytes = self.take(len, what)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| SerializeError::InvalidUtf8(what.to_owned()))
    }

    fn take_interned(&mut self, what: &'static str) -> Result<String, SerializeError> {
        if self.strings.is_none() {
            return self.take_raw_str(what);
        }
        let tag = self.take_var(what)?;
        if tag == 0 {
            let value = self.take_raw_str(what)?;
            if let Some(table) = self.strings.as_deref_mut() {
                table.define(&value);
            }
            return Ok(value);
        }
        self.strings
            .as_deref()
            .and_then(|table| table.get(tag - 1))
            .map(str::to_owned)
            .ok_or(SerializeError::UnknownStringIndex(tag - 1))
    }

    fn take_f32(&mut self, what: &'static str) -> Result<f32, SerializeError> {
        let bytes = self.take(4, what)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Consume and check a debug header. A mismatch is reported, never fatal.
    fn header(&mut self, kind: PrimitiveKind, key: Key<'_>) -> Result<(), SerializeError> {
        if !self.debug_headers {
            return Ok(());
        }
        let offset = self.pos;
        let found_kind = self.take_interned("debug header")?;
        let found_name = self.take_interned("debug header")?;
        let found_index = match self.take_var("debug header")? {
            0 => None,
            i => Some(i - 1),
        };
        if found_kind == kind.name() && found_name == key.name && found_index == key.index {
            return Ok(());
        }

        let found_key = Key {
            name: &found_name,
            index: found_index,
        }
        .to_string();
        let desync = Desync {
            offset,
            expected_kind: kind.name(),
            found_kind,
            expected_key: key.to_string(),
            found_key,
        };
        warn!(%desync, "serialization desync");
        self.desyncs += 1;
        if let Some(handler) = self.on_desync.as_mut() {
            handler(&desync);
        }
        Ok(())
    }
}

impl Reader for BinaryReader<'_> {
    fn kinds(&self) -> &KindTable {
        &self.kinds
    }

    fn open_section<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<(), SerializeError> {
        let key = key.into();
        self.header(PrimitiveKind::Open, key)?;
        self.sections.push(key.name.to_owned());
        Ok(())
    }

    fn close_section<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<(), SerializeError> {
        let key = key.into();
        match self.sections.pop() {
            Some(open) if open == key.name => {}
            Some(open) => warn!(open = %open, close = %key, "section closed under a different key"),
            None => return Err(SerializeError::UnbalancedSection(key.name.to_owned())),
        }
        self.header(PrimitiveKind::Close, key)
    }

    fn read_bool<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<bool, SerializeError> {
        self.header(PrimitiveKind::Bool, key.into())?;
        Ok(self.take(1, "bool")?[0] != 0)
    }

    fn read_u8<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<u8, SerializeError> {
        self.header(PrimitiveKind::U8, key.into())?;
        Ok(self.take(1, "byte")?[0])
    }

    fn read_var_u32<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<u32, SerializeError> {
        self.header(PrimitiveKind::VarU32, key.into())?;
        self.take_var("uint")
    }

    fn read_var_i32<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<i32, SerializeError> {
        self.header(PrimitiveKind::VarI32, key.into())?;
        Ok(varint::unzigzag(self.take_var("int")?))
    }

    fn read_str<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<String, SerializeError> {
        self.header(PrimitiveKind::Str, key.into())?;
        self.take_raw_str("string")
    }

    fn read_unique_str<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<String, SerializeError> {
        self.header(PrimitiveKind::UniqueStr, key.into())?;
        self.take_interned("ustring")
    }

    fn read_f32<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<f32, SerializeError> {
        self.header(PrimitiveKind::F32, key.into())?;
        self.take_f32("float")
    }

    fn read_point<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<Point, SerializeError> {
        self.header(PrimitiveKind::Point, key.into())?;
        let x = self.take_f32("point")?;
        let y = self.take_f32("point")?;
        Ok(Point::new(x, y))
    }

    fn read_path_pos<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<PathPos, SerializeError> {
        self.header(PrimitiveKind::PathPos, key.into())?;
        let x = self.take_f32("pathpos")?;
        let y = self.take_f32("pathpos")?;
        let area = self.take_var("pathpos")?;
        Ok(PathPos {
            point: Point::new(x, y),
            area,
        })
    }

    fn read_bytes<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<Vec<u8>, SerializeError> {
        self.header(PrimitiveKind::Bytes, key.into())?;
        let len = self.take_var("bytes")? as usize;
        Ok(self.take(len, "bytes")?.to_vec())
    }

    fn read_nid<'k>(&mut self, key: impl Into<Key<'k>>, form: NidForm) -> Result<Nid, SerializeError> {
        self.header(PrimitiveKind::Nid, key.into())?;
        let id = self.take_var("nid")?;
        if id == 0 {
            return Ok(Nid::NULL);
        }
        let tag = match form {
            NidForm::Typed(tag) => tag,
            NidForm::Tagged => TypeTag(self.take(1, "nid tag")?[0]),
        };
        let pid = if self.kinds.is_partitioned(tag) {
            self.take_var("nid pid")?
        } else {
            0
        };
        Ok(Nid::new(tag, pid, id)?)
    }

    fn read_message_id(&mut self) -> Result<u8, SerializeError> {
        Ok(self.take(1, "message id")?[0])
    }
}
