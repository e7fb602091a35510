//! Tree backend for debugging and round-trip tests
//!
//! The same call sequence that produces wire bytes builds (or consumes) a
//! named field tree instead. Sections become child fields; primitives become
//! leaf values. The backend is diagnostic: key mismatches on section close are
//! warnings, and integers read from float fields are rounded.
//!
//! The text form is pretty-printed JSON: a list of fields, sections carrying
//! their `children`, byte values as hex.
//!
//! ```text
//! [
//!   { "key": "msg", "value": { "type": "int", "value": 17 } },
//!   {
//!     "key": "army",
//!     "children": [
//!       { "key": "slot", "index": 2, "value": { "type": "int", "value": 9 } },
//!       { "key": "blob", "value": { "type": "bytes", "value": "0aff" } }
//!     ]
//!   }
//! ]
//! ```

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::contract::{Key, NidForm, PathPos, Point, Reader, Writer};
use crate::core::{KindTable, Nid, NidContext, TypeTag};
use crate::error::SerializeError;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Sections and empty fields
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Point(Point),
    PathPos(PathPos),
    Bytes(#[serde(with = "hex")] Vec<u8>),
    /// NID in its string form
    Nid(String),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Point(_) => "point",
            Value::PathPos(_) => "pathpos",
            Value::Bytes(_) => "bytes",
            Value::Nid(_) => "nid",
        }
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }
}

/// Named node of the tree. A document is a root field (empty key) whose
/// children are the top-level fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Field {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Value::is_none")]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Field>,
}

impl Field {
    pub fn new(key: Key<'_>) -> Self {
        Self {
            key: key.name.to_owned(),
            index: key.index,
            ..Self::default()
        }
    }

    pub fn root() -> Self {
        Self::default()
    }

    #[inline]
    fn matches(&self, key: &Key<'_>) -> bool {
        self.key == key.name && self.index == key.index
    }

    pub fn child<'k>(&self, key: impl Into<Key<'k>>) -> Option<&Field> {
        let key = key.into();
        self.children.iter().find(|f| f.matches(&key))
    }

    fn child_or_insert(&mut self, key: Key<'_>) -> &mut Field {
        let pos = match self.children.iter().position(|f| f.matches(&key)) {
            Some(pos) => pos,
            None => {
                self.children.push(Field::new(key));
                self.children.len() - 1
            }
        };
        &mut self.children[pos]
    }

    /// Text form of this field's children.
    ///
    /// Non-finite floats render as `null` and do not parse back.
    pub fn render(&self) -> Result<String, SerializeError> {
        serde_json::to_string_pretty(&self.children).map_err(|e| SerializeError::Render(e.to_string()))
    }

    /// Parse the text form produced by [`Field::render`] into a root field.
    pub fn parse(text: &str) -> Result<Field, SerializeError> {
        let children = serde_json::from_str(text).map_err(|e| SerializeError::Parse {
            line: e.line(),
            reason: e.to_string(),
        })?;
        Ok(Field {
            children,
            ..Field::root()
        })
    }
}

/// Builds a field tree from write calls.
pub struct TreeWriter {
    root: Field,
    /// Child positions from the root to the open section
    path: Vec<usize>,
    kinds: KindTable,
}

impl TreeWriter {
    pub fn new() -> Self {
        Self {
            root: Field::root(),
            path: Vec::new(),
            kinds: KindTable::EMPTY,
        }
    }

    pub fn with_kinds(mut self, kinds: KindTable) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn into_root(self) -> Field {
        if !self.path.is_empty() {
            warn!(depth = self.path.len(), "tree writer finished with unclosed sections");
        }
        self.root
    }

    fn current(&mut self) -> &mut Field {
        let mut field = &mut self.root;
        for &i in &self.path {
            field = &mut field.children[i];
        }
        field
    }

    fn set(&mut self, key: Key<'_>, value: Value) -> Result<(), SerializeError> {
        self.current().child_or_insert(key).value = value;
        Ok(())
    }
}

impl Default for TreeWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Writer for TreeWriter {
    fn kinds(&self) -> &KindTable {
        &self.kinds
    }

    fn open_section<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<(), SerializeError> {
        let key = key.into();
        let parent = self.current();
        let pos = match parent.children.iter().position(|f| f.matches(&key)) {
            Some(pos) => pos,
            None => {
                parent.children.push(Field::new(key));
                parent.children.len() - 1
            }
        };
        self.path.push(pos);
        Ok(())
    }

    fn close_section<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<(), SerializeError> {
        let key = key.into();
        if self.path.is_empty() {
            return Err(SerializeError::UnbalancedSection(key.name.to_owned()));
        }
        let open = self.current();
        if !open.matches(&key) {
            warn!(open = %open.key, close = %key, "section closed under a different key");
        }
        self.path.pop();
        Ok(())
    }

    fn write_bool<'k>(&mut self, key: impl Into<Key<'k>>, value: bool) -> Result<(), SerializeError> {
        self.set(key.into(), Value::Bool(value))
    }

    fn write_u8<'k>(&mut self, key: impl Into<Key<'k>>, value: u8) -> Result<(), SerializeError> {
        self.set(key.into(), Value::Int(value.into()))
    }

    fn write_var_u32<'k>(&mut self, key: impl Into<Key<'k>>, value: u32) -> Result<(), SerializeError> {
        self.set(key.into(), Value::Int(value.into()))
    }

    fn write_var_i32<'k>(&mut self, key: impl Into<Key<'k>>, value: i32) -> Result<(), SerializeError> {
        self.set(key.into(), Value::Int(value.into()))
    }

    fn write_str<'k>(&mut self, key: impl Into<Key<'k>>, value: &str) -> Result<(), SerializeError> {
        self.set(key.into(), Value::Str(value.to_owned()))
    }

    fn write_unique_str<'k>(&mut self, key: impl Into<Key<'k>>, value: &str) -> Result<(), SerializeError> {
        self.set(key.into(), Value::Str(value.to_owned()))
    }

    fn write_f32<'k>(&mut self, key: impl Into<Key<'k>>, value: f32) -> Result<(), SerializeError> {
        self.set(key.into(), Value::Float(value.into()))
    }

    fn write_point<'k>(&mut self, key: impl Into<Key<'k>>, value: Point) -> Result<(), SerializeError> {
        self.set(key.into(), Value::Point(value))
    }

    fn write_path_pos<'k>(&mut self, key: impl Into<Key<'k>>, value: PathPos) -> Result<(), SerializeError> {
        self.set(key.into(), Value::PathPos(value))
    }

    fn write_bytes<'k>(&mut self, key: impl Into<Key<'k>>, value: &[u8]) -> Result<(), SerializeError> {
        self.set(key.into(), Value::Bytes(value.to_vec()))
    }

    fn write_nid<'k>(&mut self, key: impl Into<Key<'k>>, nid: Nid, _form: NidForm) -> Result<(), SerializeError> {
        let text = if nid.is_null() {
            "0".to_owned()
        } else {
            nid.to_string_with(&self.kinds)
        };
        self.set(key.into(), Value::Nid(text))
    }

    fn write_message_id(&mut self, msg: u8) -> Result<(), SerializeError> {
        self.set(Key::new("msg"), Value::Int(msg.into()))
    }
}

/// Reads values back out of a field tree.
pub struct TreeReader<'a> {
    root: &'a Field,
    stack: Vec<&'a Field>,
    kinds: KindTable,
}

impl<'a> TreeReader<'a> {
    pub fn new(root: &'a Field) -> Self {
        Self {
            root,
            stack: Vec::new(),
            kinds: KindTable::EMPTY,
        }
    }

    pub fn with_kinds(mut self, kinds: KindTable) -> Self {
        self.kinds = kinds;
        self
    }

    fn current(&self) -> &'a Field {
        self.stack.last().copied().unwrap_or(self.root)
    }

    fn field(&self, key: &Key<'_>) -> Result<&'a Field, SerializeError> {
        self.current()
            .children
            .iter()
            .find(|f| f.matches(key))
            .ok_or_else(|| SerializeError::MissingField(key.to_string()))
    }

    fn mismatch(key: &Key<'_>, expected: &'static str, found: &Value) -> SerializeError {
        SerializeError::TypeMismatch {
            key: key.to_string(),
            expected,
            found: found.type_name(),
        }
    }

    fn int(&self, key: Key<'_>) -> Result<i64, SerializeError> {
        let field = self.field(&key)?;
        match field.value {
            Value::Int(v) => Ok(v),
            Value::Bool(v) => Ok(v as i64),
            Value::Float(v) => {
                let rounded = v.round() as i64;
                warn!(key = %key, value = v, rounded, "integer read from float field");
                Ok(rounded)
            }
            ref other => Err(Self::mismatch(&key, "int", other)),
        }
    }

    fn int_in<T: TryFrom<i64>>(&self, key: Key<'_>) -> Result<T, SerializeError> {
        let v = self.int(key)?;
        T::try_from(v).map_err(|_| SerializeError::TypeMismatch {
            key: key.to_string(),
            expected: std::any::type_name::<T>(),
            found: "out-of-range int",
        })
    }
}

impl Reader for TreeReader<'_> {
    fn kinds(&self) -> &KindTable {
        &self.kinds
    }

    fn open_section<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<(), SerializeError> {
        let field = self.field(&key.into())?;
        self.stack.push(field);
        Ok(())
    }

    fn close_section<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<(), SerializeError> {
        let key = key.into();
        match self.stack.pop() {
            Some(open) if open.matches(&key) => Ok(()),
            Some(open) => {
                warn!(open = %open.key, close = %key, "section closed under a different key");
                Ok(())
            }
            None => Err(SerializeError::UnbalancedSection(key.name.to_owned())),
        }
    }

    fn read_bool<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<bool, SerializeError> {
        let key = key.into();
        match self.field(&key)?.value {
            Value::Bool(v) => Ok(v),
            Value::Int(v) => Ok(v != 0),
            ref other => Err(Self::mismatch(&key, "bool", other)),
        }
    }

    fn read_u8<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<u8, SerializeError> {
        self.int_in(key.into())
    }

    fn read_var_u32<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<u32, SerializeError> {
        self.int_in(key.into())
    }

    fn read_var_i32<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<i32, SerializeError> {
        self.int_in(key.into())
    }

    fn read_str<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<String, SerializeError> {
        let key = key.into();
        match &self.field(&key)?.value {
            Value::Str(v) => Ok(v.clone()),
            other => Err(Self::mismatch(&key, "str", other)),
        }
    }

    fn read_unique_str<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<String, SerializeError> {
        self.read_str(key)
    }

    fn read_f32<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<f32, SerializeError> {
        let key = key.into();
        match self.field(&key)?.value {
            Value::Float(v) => Ok(v as f32),
            Value::Int(v) => Ok(v as f32),
            ref other => Err(Self::mismatch(&key, "float", other)),
        }
    }

    fn read_point<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<Point, SerializeError> {
        let key = key.into();
        match self.field(&key)?.value {
            Value::Point(p) => Ok(p),
            ref other => Err(Self::mismatch(&key, "point", other)),
        }
    }

    fn read_path_pos<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<PathPos, SerializeError> {
        let key = key.into();
        match self.field(&key)?.value {
            Value::PathPos(p) => Ok(p),
            ref other => Err(Self::mismatch(&key, "pathpos", other)),
        }
    }

    fn read_bytes<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<Vec<u8>, SerializeError> {
        let key = key.into();
        match &self.field(&key)?.value {
            Value::Bytes(v) => Ok(v.clone()),
            other => Err(Self::mismatch(&key, "bytes", other)),
        }
    }

    fn read_nid<'k>(&mut self, key: impl Into<Key<'k>>, form: NidForm) -> Result<Nid, SerializeError> {
        let key = key.into();
        let text = match &self.field(&key)?.value {
            Value::Nid(v) => v,
            other => return Err(Self::mismatch(&key, "nid", other)),
        };
        let ctx = NidContext {
            tag: match form {
                NidForm::Typed(tag) => tag,
                NidForm::Tagged => TypeTag::NONE,
            },
            pid: 0,
        };
        let nid = Nid::parse(text, &self.kinds, ctx)?;
        Ok(if nid.is_null() { Nid::NULL } else { nid })
    }

    fn read_message_id(&mut self) -> Result<u8, SerializeError> {
        self.int_in(Key::new("msg"))
    }
}
