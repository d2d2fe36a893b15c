//! Object heap of one sandbox.
//!
//! Objects are class instances with named fields. They are referenced through
//! [`ObjectRef`] handles whose ids come from one process-wide counter and are never reused,
//! so an id stays a valid side-table key for as long as the heap lives and a handle minted
//! by one sandbox is unknown to every other heap. No garbage collection is simulated;
//! [`Heap::clear`] drops everything at teardown.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::DashMap;

use crate::{
    runtime::{ObjectRef, Value},
    DispatchError, Result,
};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct HeapObject {
    class: Arc<str>,
    fields: HashMap<String, Value>,
}

/// Concurrent object store.
#[derive(Debug, Default)]
pub struct Heap {
    objects: DashMap<u64, HeapObject>,
}

impl Heap {
    /// Creates an empty heap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an instance of `class` with no fields set.
    pub fn alloc(&self, class: &str) -> ObjectRef {
        let id = NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed);
        self.objects.insert(
            id,
            HeapObject {
                class: Arc::from(class),
                fields: HashMap::new(),
            },
        );
        ObjectRef(id)
    }

    /// Runtime class of `obj`.
    ///
    /// # Errors
    /// Returns [`DispatchError::UnknownObject`] if `obj` is not on this heap.
    pub fn class_of(&self, obj: ObjectRef) -> Result<Arc<str>> {
        self.objects
            .get(&obj.id())
            .map(|o| o.class.clone())
            .ok_or_else(|| DispatchError::UnknownObject(obj.id()).into())
    }

    /// Reads a field. Fields that were never written read as null.
    ///
    /// # Errors
    /// Returns [`DispatchError::UnknownObject`] if `obj` is not on this heap.
    pub fn get_field(&self, obj: ObjectRef, field: &str) -> Result<Value> {
        let object = self
            .objects
            .get(&obj.id())
            .ok_or(DispatchError::UnknownObject(obj.id()))?;
        Ok(object.fields.get(field).cloned().unwrap_or(Value::Null))
    }

    /// Writes a field.
    ///
    /// # Errors
    /// Returns [`DispatchError::UnknownObject`] if `obj` is not on this heap.
    pub fn set_field(&self, obj: ObjectRef, field: &str, value: Value) -> Result<()> {
        let mut object = self
            .objects
            .get_mut(&obj.id())
            .ok_or(DispatchError::UnknownObject(obj.id()))?;
        object.fields.insert(field.to_string(), value);
        Ok(())
    }

    /// Returns `true` if `obj` is on this heap.
    #[must_use]
    pub fn contains(&self, obj: ObjectRef) -> bool {
        self.objects.contains_key(&obj.id())
    }

    /// Number of live objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Drops every object. Ids are not reset.
    pub fn clear(&self) {
        self.objects.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_fields_read_as_null() {
        let heap = Heap::new();
        let obj = heap.alloc("app.Point");
        assert_eq!(heap.get_field(obj, "x").unwrap(), Value::Null);
        heap.set_field(obj, "x", Value::Int(3)).unwrap();
        assert_eq!(heap.get_field(obj, "x").unwrap(), Value::Int(3));
        assert_eq!(&*heap.class_of(obj).unwrap(), "app.Point");
    }

    #[test]
    fn ids_survive_clear() {
        let heap = Heap::new();
        let first = heap.alloc("app.A");
        heap.clear();
        assert!(!heap.contains(first));
        assert!(heap.class_of(first).is_err());
        let second = heap.alloc("app.A");
        assert_ne!(first, second);
    }

    #[test]
    fn foreign_refs_are_unknown() {
        let a = Heap::new();
        let b = Heap::new();
        let obj = a.alloc("app.A");
        b.alloc("app.A");
        assert!(!b.contains(obj));
        assert!(matches!(
            b.get_field(obj, "x"),
            Err(crate::Error::Dispatch(DispatchError::UnknownObject(_)))
        ));
        assert!(b.set_field(obj, "x", Value::Int(1)).is_err());
    }
}
