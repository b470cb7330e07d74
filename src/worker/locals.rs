use crate::{sync::Mutex, types::HashMap};
use std::{any::Any, sync::Arc};

type LocalValue = Arc<dyn Any + Send + Sync>;

/// String-keyed table of values of arbitrary type.
///
/// Clones share the same table. Use [`snapshot`](Self::snapshot) to obtain an
/// independent copy, e.g. to seed a child worker.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    table: Arc<Mutex<HashMap<String, LocalValue>>>,
}

impl Default for LocalStorage {
    fn default() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::default())),
        }
    }
}

impl LocalStorage {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.table.lock().insert(key.into(), Arc::new(value));
    }

    /// Returns the value under `key` if present and of type `T`.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.table.lock().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Removes the value under `key`. Returns `true` if there was one.
    pub fn remove(&self, key: &str) -> bool {
        self.table.lock().remove(key).is_some()
    }

    /// Returns `true` if a value of any type is stored under `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.table.lock().contains_key(key)
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Independent copy of the table. Values are shared, entries are not.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        let table = self.table.lock().clone();
        Self {
            table: Arc::new(Mutex::new(table)),
        }
    }

    /// Copies every entry of `other` into this table, overwriting equal keys.
    pub fn copy_from(&self, other: &Self) {
        if Arc::ptr_eq(&self.table, &other.table) {
            return;
        }
        let entries = other.table.lock().clone();
        self.table.lock().extend(entries);
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::LocalStorage;

    #[test]
    fn typed_lookup_rejects_other_types() {
        let locals = LocalStorage::new();
        locals.set("request_id", 42u64);
        assert_eq!(locals.get::<u64>("request_id").as_deref(), Some(&42));
        assert!(locals.get::<String>("request_id").is_none());
        assert!(locals.get::<u64>("missing").is_none());
    }

    #[test]
    fn snapshot_is_independent() {
        let parent = LocalStorage::new();
        parent.set("a", 1i32);
        let child = parent.snapshot();
        child.set("b", 2i32);
        parent.remove("a");
        assert!(child.contains("a"));
        assert!(!parent.contains("b"));
        assert_eq!(child.len(), 2);
    }

    #[test]
    fn copy_from_self_is_a_no_op() {
        let locals = LocalStorage::new();
        locals.set("a", 1i32);
        locals.copy_from(&locals.clone());
        assert_eq!(locals.len(), 1);
    }
}
