//! In-memory datastore for testing.

use crate::backend::{Batch, BatchOp, Datastore, Entry, Query, QueryIter};
use crate::error::{StorageError, StorageResult};
use crate::key::Key;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// An in-memory datastore.
///
/// This datastore keeps every entry in an ordered map and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral databases that don't need persistence
///
/// Closing the datastore keeps its contents, so a close/open cycle behaves
/// like a process restart against persistent storage.
///
/// # Example
///
/// ```rust
/// use threaddb_storage::{Datastore, InMemoryDatastore, Key, Query};
///
/// let store = InMemoryDatastore::new();
/// store.open().unwrap();
/// store.put(&Key::new("/a/1"), vec![1]).unwrap();
/// store.put(&Key::new("/b/1"), vec![2]).unwrap();
/// assert_eq!(store.query(&Query::prefix("/a")).unwrap().count(), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryDatastore {
    data: RwLock<BTreeMap<Key, Vec<u8>>>,
    open: AtomicBool,
}

impl InMemoryDatastore {
    /// Creates a new empty, closed datastore.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored entries, regardless of open state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::NotOpen)
        }
    }
}

/// Collects the entries of an ordered map that match `query`.
pub(crate) fn scan(data: &BTreeMap<Key, Vec<u8>>, query: &Query) -> Vec<Entry> {
    match &query.prefix {
        // Keys sharing a string prefix are contiguous in lexicographic order.
        Some(prefix) if !prefix.is_root() => data
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.as_str().starts_with(prefix.as_str()))
            .filter(|(key, _)| query.matches(key))
            .map(|(key, value)| Entry {
                key: key.clone(),
                value: value.clone(),
            })
            .collect(),
        _ => data
            .iter()
            .filter(|(key, _)| query.matches(key))
            .map(|(key, value)| Entry {
                key: key.clone(),
                value: value.clone(),
            })
            .collect(),
    }
}

/// Applies batch operations to an ordered map.
pub(crate) fn apply(data: &mut BTreeMap<Key, Vec<u8>>, ops: Vec<BatchOp>) {
    for op in ops {
        match op {
            BatchOp::Put { key, value } => {
                data.insert(key, value);
            }
            BatchOp::Delete { key } => {
                data.remove(&key);
            }
        }
    }
}

impl Datastore for InMemoryDatastore {
    fn open(&self) -> StorageResult<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn get(&self, key: &Key) -> StorageResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &Key, value: Vec<u8>) -> StorageResult<()> {
        self.ensure_open()?;
        self.data.write().insert(key.clone(), value);
        Ok(())
    }

    fn delete(&self, key: &Key) -> StorageResult<()> {
        self.ensure_open()?;
        self.data.write().remove(key);
        Ok(())
    }

    fn has(&self, key: &Key) -> StorageResult<bool> {
        self.ensure_open()?;
        Ok(self.data.read().contains_key(key))
    }

    fn query(&self, query: &Query) -> StorageResult<QueryIter> {
        self.ensure_open()?;
        let entries = scan(&self.data.read(), query);
        Ok(query.finish(entries))
    }

    fn commit(&self, batch: Batch) -> StorageResult<()> {
        self.ensure_open()?;
        apply(&mut self.data.write(), batch.into_ops());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> InMemoryDatastore {
        let store = InMemoryDatastore::new();
        store.open().unwrap();
        store
    }

    #[test]
    fn memory_new_is_closed_and_empty() {
        let store = InMemoryDatastore::new();
        assert!(!store.is_open());
        assert!(store.is_empty());
        assert!(matches!(
            store.get(&Key::new("/a")),
            Err(StorageError::NotOpen)
        ));
    }

    #[test]
    fn memory_put_get_delete() {
        let store = open_store();
        let key = Key::new("/a");

        store.put(&key, b"hello".to_vec()).unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(b"hello".to_vec()));
        assert!(store.has(&key).unwrap());

        store.delete(&key).unwrap();
        assert_eq!(store.get(&key).unwrap(), None);
        assert!(!store.has(&key).unwrap());
    }

    #[test]
    fn memory_delete_missing_is_ok() {
        let store = open_store();
        assert!(store.delete(&Key::new("/missing")).is_ok());
    }

    #[test]
    fn memory_query_prefix_is_ordered_and_scoped() {
        let store = open_store();
        store.put(&Key::new("/q/2"), vec![2]).unwrap();
        store.put(&Key::new("/q/1"), vec![1]).unwrap();
        store.put(&Key::new("/q-other/1"), vec![9]).unwrap();
        store.put(&Key::new("/r/1"), vec![3]).unwrap();

        let keys: Vec<Key> = store
            .query(&Query::prefix("/q"))
            .unwrap()
            .map(|entry| entry.unwrap().key)
            .collect();
        assert_eq!(keys, vec![Key::new("/q/1"), Key::new("/q/2")]);
    }

    #[test]
    fn memory_query_limit_and_offset() {
        let store = open_store();
        for i in 0..10u8 {
            store.put(&Key::new(format!("/n/{i}")), vec![i]).unwrap();
        }
        let values: Vec<u8> = store
            .query(&Query::prefix("/n").with_offset(2).with_limit(3))
            .unwrap()
            .map(|entry| entry.unwrap().value[0])
            .collect();
        assert_eq!(values, vec![2, 3, 4]);
    }

    #[test]
    fn memory_batch_commit() {
        let store = open_store();
        store.put(&Key::new("/gone"), vec![0]).unwrap();

        let mut batch = Batch::new();
        batch
            .put(Key::new("/x"), vec![1])
            .put(Key::new("/y"), vec![2])
            .delete(Key::new("/gone"));
        store.commit(batch).unwrap();

        assert_eq!(store.len(), 2);
        assert!(!store.has(&Key::new("/gone")).unwrap());
    }

    #[test]
    fn memory_close_keeps_data() {
        let store = open_store();
        store.put(&Key::new("/kept"), vec![7]).unwrap();
        store.close().unwrap();
        assert!(store.put(&Key::new("/other"), vec![]).is_err());

        store.open().unwrap();
        assert_eq!(store.get(&Key::new("/kept")).unwrap(), Some(vec![7]));
    }
}
