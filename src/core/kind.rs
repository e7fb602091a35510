//! Static object-type table
//!
//! Replicated object types are declared once, at compile time, as rows of a
//! `KindTable`. Each row maps a wire tag to a name, says whether the type uses
//! a partitioned id space, and optionally carries a factory used by the
//! session registry to instantiate remote objects.

use std::sync::Arc;

use super::nid::Nid;
use super::registry::Replicated;

/// Wire tag of a replicated object type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TypeTag(pub u8);

impl TypeTag {
    /// Sentinel for "no type" / "unknown type".
    pub const NONE: TypeTag = TypeTag(0);
}

/// Builds a fresh object for a NID received from a peer.
pub type Factory = fn(Nid) -> Arc<dyn Replicated>;

/// One row of the type table.
#[derive(Debug, Clone, Copy)]
pub struct KindInfo {
    pub tag: TypeTag,
    pub name: &'static str,
    /// Dynamic types carry a pid on the wire.
    pub partitioned: bool,
    pub factory: Option<Factory>,
}

impl KindInfo {
    pub const fn new(tag: TypeTag, name: &'static str, partitioned: bool) -> Self {
        Self {
            tag,
            name,
            partitioned,
            factory: None,
        }
    }

    pub const fn with_factory(mut self, factory: Factory) -> Self {
        self.factory = Some(factory);
        self
    }
}

/// Compile-time list of replicated types.
#[derive(Debug, Clone, Copy)]
pub struct KindTable {
    kinds: &'static [KindInfo],
}

impl KindTable {
    pub const EMPTY: KindTable = KindTable { kinds: &[] };

    pub const fn new(kinds: &'static [KindInfo]) -> Self {
        Self { kinds }
    }

    #[inline]
    pub fn get(&self, tag: TypeTag) -> Option<&'static KindInfo> {
        self.kinds.iter().find(|k| k.tag == tag)
    }

    pub fn by_name(&self, name: &str) -> Option<&'static KindInfo> {
        self.kinds.iter().find(|k| k.name == name)
    }

    #[inline]
    pub fn name(&self, tag: TypeTag) -> Option<&'static str> {
        self.get(tag).map(|k| k.name)
    }

    /// Unknown tags are treated as non-partitioned.
    #[inline]
    pub fn is_partitioned(&self, tag: TypeTag) -> bool {
        self.get(tag).is_some_and(|k| k.partitioned)
    }

    pub fn contains(&self, tag: TypeTag) -> bool {
        self.get(tag).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static KindInfo> {
        self.kinds.iter()
    }
}

impl Default for KindTable {
    fn default() -> Self {
        Self::EMPTY
    }
}
