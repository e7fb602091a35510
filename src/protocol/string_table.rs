//! Session-wide unique-string dictionary
//!
//! Wire form of an interned string:
//! - `var(0) var(len) bytes` the first time a string is seen; it is assigned
//!   the next index
//! - `var(index + 1)` on every later occurrence
//!
//! Writer and reader grow their tables in call order, so a table is only valid
//! for the exact stream it was built from and cannot be joined mid-stream.

use std::collections::HashMap;
use std::sync::Arc;

/// Result of interning on the write side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interned {
    /// First occurrence, now assigned this index
    New(u32),
    /// Already known under this index
    Known(u32),
}

/// Dictionary shared by one direction of one connection.
#[derive(Debug, Default, Clone)]
pub struct StringTable {
    by_index: Vec<Arc<str>>,
    by_value: HashMap<Arc<str>, u32>,
}

impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writer side: look up or assign an index.
    pub fn intern(&mut self, value: &str) -> Interned {
        if let Some(&index) = self.by_value.get(value) {
            return Interned::Known(index);
        }
        let index = self.by_index.len() as u32;
        let shared: Arc<str> = Arc::from(value);
        self.by_index.push(shared.clone());
        self.by_value.insert(shared, index);
        Interned::New(index)
    }

    /// Reader side: record a string that arrived in full.
    pub fn define(&mut self, value: &str) -> u32 {
        match self.intern(value) {
            Interned::New(index) | Interned::Known(index) => index,
        }
    }

    pub fn get(&self, index: u32) -> Option<&str> {
        self.by_index.get(index as usize).map(|s| &**s)
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_index.clear();
        self.by_value.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_occurrence_order() {
        let mut table = StringTable::new();
        assert_eq!(table.intern("gold"), Interned::New(0));
        assert_eq!(table.intern("food"), Interned::New(1));
        assert_eq!(table.intern("gold"), Interned::Known(0));
        assert_eq!(table.get(1), Some("food"));
        assert_eq!(table.get(2), None);
    }

    #[test]
    fn test_reader_mirrors_writer() {
        let mut writer = StringTable::new();
        let mut reader = StringTable::new();
        for word in ["a", "b", "a", "c", "b"] {
            if let Interned::New(index) = writer.intern(word) {
                assert_eq!(reader.define(word), index);
            }
        }
        assert_eq!(writer.len(), reader.len());
        assert_eq!(reader.get(2), Some("c"));
    }
}
