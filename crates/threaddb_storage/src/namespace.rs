//! Prefix-scoped datastore views.

use crate::backend::{Batch, BatchOp, Datastore, Entry, Query, QueryIter};
use crate::error::{StorageError, StorageResult};
use crate::key::Key;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A datastore view restricted to the keys below a prefix.
///
/// Keys passed to the view are relative: `put("/x")` on a view with prefix
/// `/db/people` writes `/db/people/x` in the parent. Query results are
/// translated back to relative keys.
///
/// The view has its own open flag. Opening it opens the parent if needed;
/// closing it only closes the view, so components sharing one parent can be
/// shut down independently.
pub struct NamespacedDatastore {
    inner: Arc<dyn Datastore>,
    prefix: Key,
    open: AtomicBool,
}

impl NamespacedDatastore {
    /// Creates a closed view of `inner` scoped to `prefix`.
    pub fn new(inner: Arc<dyn Datastore>, prefix: impl Into<Key>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
            open: AtomicBool::new(false),
        }
    }

    /// Returns the prefix of this view.
    #[must_use]
    pub fn prefix(&self) -> &Key {
        &self.prefix
    }

    /// Returns the parent datastore.
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn Datastore> {
        &self.inner
    }

    fn absolute(&self, key: &Key) -> Key {
        if key.is_root() {
            return self.prefix.clone();
        }
        Key::new(format!("{}{}", self.prefix, key))
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.open.load(Ordering::SeqCst) && self.inner.is_open() {
            Ok(())
        } else {
            Err(StorageError::NotOpen)
        }
    }
}

impl std::fmt::Debug for NamespacedDatastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespacedDatastore")
            .field("prefix", &self.prefix)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Datastore for NamespacedDatastore {
    fn open(&self) -> StorageResult<()> {
        if !self.inner.is_open() {
            self.inner.open()?;
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.inner.is_open()
    }

    fn get(&self, key: &Key) -> StorageResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        self.inner.get(&self.absolute(key))
    }

    fn put(&self, key: &Key, value: Vec<u8>) -> StorageResult<()> {
        self.ensure_open()?;
        self.inner.put(&self.absolute(key), value)
    }

    fn delete(&self, key: &Key) -> StorageResult<()> {
        self.ensure_open()?;
        self.inner.delete(&self.absolute(key))
    }

    fn has(&self, key: &Key) -> StorageResult<bool> {
        self.ensure_open()?;
        self.inner.has(&self.absolute(key))
    }

    fn query(&self, query: &Query) -> StorageResult<QueryIter> {
        self.ensure_open()?;
        let scoped = Query {
            prefix: Some(match &query.prefix {
                Some(prefix) => self.absolute(prefix),
                None => self.prefix.clone(),
            }),
            ..query.clone()
        };
        let prefix = self.prefix.clone();
        let results = self.inner.query(&scoped)?.map(move |entry| {
            let Entry { key, value } = entry?;
            let key = key
                .strip_prefix(&prefix)
                .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
            Ok(Entry { key, value })
        });
        Ok(Box::new(results))
    }

    fn commit(&self, batch: Batch) -> StorageResult<()> {
        self.ensure_open()?;
        let mut scoped = Batch::new();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => scoped.put(self.absolute(&key), value),
                BatchOp::Delete { key } => scoped.delete(self.absolute(&key)),
            };
        }
        self.inner.commit(scoped)
    }
}
