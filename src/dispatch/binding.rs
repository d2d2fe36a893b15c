//! Real-object to shadow-instance bindings.
//!
//! Bindings live in a side table owned by the dispatch handler rather than in the real
//! objects, so rewritten object layout never depends on shadow layout. The table is an
//! arena of shadow instances addressed by stable integer ids, plus a concurrent index from
//! [`BindingKey`] to id. Creation is serialized per key through the index's entry API:
//! the first creator wins and every concurrent creator observes and reuses its instance.

use std::{
    any::Any,
    fmt,
    sync::{Arc, Mutex, RwLock},
};

use dashmap::{mapref::entry::Entry, DashMap};

use crate::{runtime::ObjectRef, shadow::ShadowClass, DispatchError, Error, Result};

/// What a shadow instance is bound to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BindingKey {
    /// One real object
    Instance(ObjectRef),
    /// A real class, for static calls
    Class(String),
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingKey::Instance(obj) => write!(f, "instance {obj}"),
            BindingKey::Class(name) => write!(f, "class {name}"),
        }
    }
}

/// A live shadow instance.
pub struct ShadowInstance {
    id: usize,
    key: BindingKey,
    class: Arc<ShadowClass>,
    state: Mutex<Box<dyn Any + Send>>,
}

impl ShadowInstance {
    /// Stable arena id.
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// What this instance is bound to.
    #[must_use]
    pub fn key(&self) -> &BindingKey {
        &self.key
    }

    /// The shadow class.
    #[must_use]
    pub fn class(&self) -> &Arc<ShadowClass> {
        &self.class
    }

    /// Runs `f` on the instance state while holding its lock.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the lock was poisoned, and
    /// [`DispatchError::ShadowStateType`] if the state is not a `T`.
    pub fn with_state<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let mut guard = self.state.lock().map_err(|_| Error::LockError)?;
        let state = guard
            .downcast_mut::<T>()
            .ok_or_else(|| DispatchError::ShadowStateType(self.class.name().to_string()))?;
        Ok(f(state))
    }
}

impl fmt::Debug for ShadowInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowInstance")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("class", &self.class.name())
            .finish_non_exhaustive()
    }
}

/// Arena plus index of shadow instances.
#[derive(Default)]
pub struct BindingTable {
    arena: RwLock<Vec<Arc<ShadowInstance>>>,
    index: DashMap<BindingKey, usize>,
}

impl BindingTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the instance bound to `key`, creating it from `class` if there is none.
    ///
    /// The flag is `true` if this call created the instance.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the arena lock was poisoned.
    pub fn get_or_bind(
        &self,
        key: BindingKey,
        class: &Arc<ShadowClass>,
    ) -> Result<(Arc<ShadowInstance>, bool)> {
        match self.index.entry(key) {
            Entry::Occupied(entry) => {
                let arena = self.arena.read().map_err(|_| Error::LockError)?;
                let instance = arena.get(*entry.get()).cloned().ok_or(Error::LockError)?;
                Ok((instance, false))
            }
            Entry::Vacant(entry) => {
                let mut arena = self.arena.write().map_err(|_| Error::LockError)?;
                let instance = Arc::new(ShadowInstance {
                    id: arena.len(),
                    key: entry.key().clone(),
                    class: class.clone(),
                    state: Mutex::new(class.new_state()),
                });
                arena.push(instance.clone());
                entry.insert(instance.id);
                Ok((instance, true))
            }
        }
    }

    /// The instance bound to `key`, if any.
    #[must_use]
    pub fn get(&self, key: &BindingKey) -> Option<Arc<ShadowInstance>> {
        let id = *self.index.get(key)?;
        let arena = self.arena.read().ok()?;
        arena.get(id).cloned()
    }

    /// Number of live bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns `true` if nothing is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Drops every binding.
    pub fn clear(&self) {
        self.index.clear();
        if let Ok(mut arena) = self.arena.write() {
            arena.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn shadow() -> Arc<ShadowClass> {
        Arc::new(ShadowClass::new("test.S", "app.R").state(|| 0_i64))
    }

    #[test]
    fn binding_is_reused() {
        let table = BindingTable::new();
        let class = shadow();
        let key = BindingKey::Instance(ObjectRef(7));
        let (first, created) = table.get_or_bind(key.clone(), &class).unwrap();
        assert!(created);
        let (second, created) = table.get_or_bind(key.clone(), &class).unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.get(&key).unwrap().id(), first.id());
    }

    #[test]
    fn concurrent_binders_share_one_instance() {
        let table = Arc::new(BindingTable::new());
        let class = shadow();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                let class = class.clone();
                thread::spawn(move || {
                    let (instance, created) = table
                        .get_or_bind(BindingKey::Class("app.R".into()), &class)
                        .unwrap();
                    instance.with_state(|n: &mut i64| *n += 1).unwrap();
                    (instance.id(), created)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
        assert!(results.iter().all(|(id, _)| *id == results[0].0));
        assert_eq!(table.len(), 1);

        let instance = table.get(&BindingKey::Class("app.R".into())).unwrap();
        assert_eq!(instance.with_state(|n: &mut i64| *n).unwrap(), 8);
    }

    #[test]
    fn wrong_state_type() {
        let table = BindingTable::new();
        let (instance, _) = table
            .get_or_bind(BindingKey::Instance(ObjectRef(1)), &shadow())
            .unwrap();
        assert!(matches!(
            instance.with_state(|_: &mut String| ()),
            Err(Error::Dispatch(DispatchError::ShadowStateType(_)))
        ));
    }

    #[test]
    fn clear_drops_everything() {
        let table = BindingTable::new();
        table
            .get_or_bind(BindingKey::Instance(ObjectRef(1)), &shadow())
            .unwrap();
        table.clear();
        assert!(table.is_empty());
        assert!(table.get(&BindingKey::Instance(ObjectRef(1))).is_none());
    }
}
