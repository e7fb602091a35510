//! Session-scoped object registry
//!
//! Resolves NIDs to live objects. One registry per session, passed by
//! reference; there is no global instance.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use super::kind::{KindTable, TypeTag};
use super::nid::Nid;

/// Upcast helper so registry entries can be downcast to their concrete type.
pub trait AsAnyArc {
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAnyArc for T {
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A live object addressable by NID.
pub trait Replicated: AsAnyArc + Send + Sync {
    fn nid(&self) -> Nid;
}

type Key = (TypeTag, u32);

/// NID -> object map for one session.
pub struct ObjectRegistry {
    kinds: KindTable,
    objects: RwLock<HashMap<Key, Arc<dyn Replicated>>>,
}

impl ObjectRegistry {
    pub fn new(kinds: KindTable) -> Self {
        Self {
            kinds,
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub fn kinds(&self) -> &KindTable {
        &self.kinds
    }

    /// Register an object under its own NID. Returns the object it replaced.
    pub fn insert(&self, object: Arc<dyn Replicated>) -> Option<Arc<dyn Replicated>> {
        let nid = object.nid();
        if nid.is_null() {
            warn!(nid = %nid, "refusing to register object with null nid");
            return None;
        }
        self.objects.write().insert((nid.tag(), nid.packed()), object)
    }

    pub fn remove(&self, nid: Nid) -> Option<Arc<dyn Replicated>> {
        self.objects.write().remove(&(nid.tag(), nid.packed()))
    }

    pub fn get_dyn(&self, nid: Nid) -> Option<Arc<dyn Replicated>> {
        if nid.is_null() {
            return None;
        }
        self.objects.read().get(&(nid.tag(), nid.packed())).cloned()
    }

    /// Resolve to a concrete type. Null NIDs resolve to `None`; a registered
    /// object of another type is logged and also resolves to `None`.
    pub fn get<T: Replicated + 'static>(&self, nid: Nid) -> Option<Arc<T>> {
        let object = self.get_dyn(nid)?;
        match object.into_any_arc().downcast::<T>() {
            Ok(typed) => Some(typed),
            Err(_) => {
                warn!(
                    nid = %nid.to_string_with(&self.kinds),
                    expected = std::any::type_name::<T>(),
                    "nid resolves to an object of another type"
                );
                None
            }
        }
    }

    /// Look up or build the object for a NID received from a peer.
    pub fn instantiate(&self, nid: Nid) -> Option<Arc<dyn Replicated>> {
        if nid.is_null() {
            return None;
        }
        if let Some(existing) = self.get_dyn(nid) {
            return Some(existing);
        }
        let Some(factory) = self.kinds.get(nid.tag()).and_then(|k| k.factory) else {
            warn!(nid = %nid, "no factory for object type");
            return None;
        };
        let object = factory(nid);
        let mut objects = self.objects.write();
        Some(objects.entry((nid.tag(), nid.packed())).or_insert(object).clone())
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    pub fn clear(&self) {
        self.objects.write().clear();
    }
}
