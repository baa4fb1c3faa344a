//! Datastore trait definition.

use crate::error::StorageResult;
use crate::key::Key;

/// A single key/value pair yielded by a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The entry key.
    pub key: Key,
    /// The stored bytes. Empty when the query was `keys_only`.
    pub value: Vec<u8>,
}

/// A lazy, single-pass sequence of query results.
pub type QueryIter = Box<dyn Iterator<Item = StorageResult<Entry>> + Send>;

/// A prefix-scoped scan over a datastore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    /// Only keys equal to or below this prefix are returned.
    pub prefix: Option<Key>,
    /// Number of matching entries to skip.
    pub offset: usize,
    /// Maximum number of entries to return.
    pub limit: Option<usize>,
    /// Whether to omit values from the results.
    pub keys_only: bool,
}

impl Query {
    /// Creates a query over the whole datastore.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Creates a query over everything below `prefix`.
    #[must_use]
    pub fn prefix(prefix: impl Into<Key>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ..Self::default()
        }
    }

    /// Sets the result limit.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the result offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Requests keys without values.
    #[must_use]
    pub const fn keys_only(mut self) -> Self {
        self.keys_only = true;
        self
    }

    /// Returns true if `key` falls inside this query's prefix.
    #[must_use]
    pub fn matches(&self, key: &Key) -> bool {
        match &self.prefix {
            Some(prefix) => prefix.is_ancestor_of(key),
            None => true,
        }
    }

    /// Applies offset, limit and `keys_only` to an ordered list of entries.
    pub(crate) fn finish(&self, entries: Vec<Entry>) -> QueryIter {
        let keys_only = self.keys_only;
        let limit = self.limit.unwrap_or(usize::MAX);
        Box::new(
            entries
                .into_iter()
                .skip(self.offset)
                .take(limit)
                .map(move |mut entry| {
                    if keys_only {
                        entry.value.clear();
                    }
                    Ok(entry)
                }),
        )
    }
}

/// A single write inside a [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite a key.
    Put {
        /// Target key.
        key: Key,
        /// New value.
        value: Vec<u8>,
    },
    /// Remove a key. Removing a missing key is not an error.
    Delete {
        /// Target key.
        key: Key,
    },
}

impl BatchOp {
    /// Returns the key this operation targets.
    #[must_use]
    pub fn key(&self) -> &Key {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Delete { key } => key,
        }
    }
}

/// An ordered set of writes committed atomically by [`Datastore::commit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a put.
    pub fn put(&mut self, key: Key, value: Vec<u8>) -> &mut Self {
        self.ops.push(BatchOp::Put { key, value });
        self
    }

    /// Queues a delete.
    pub fn delete(&mut self, key: Key) -> &mut Self {
        self.ops.push(BatchOp::Delete { key });
        self
    }

    /// Returns the queued operations.
    #[must_use]
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Consumes the batch, returning its operations.
    #[must_use]
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }

    /// Returns the number of queued operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// An ordered key-value datastore.
///
/// Datastores are **opaque byte stores**. Every component of threaddb (the
/// queue, collections, database metadata) shares one datastore, isolated by
/// key prefix.
///
/// # Invariants
///
/// - `query` yields entries in ascending key order
/// - `commit` applies every operation of a batch or none of them
/// - Every operation other than `open`/`is_open` fails with
///   [`crate::StorageError::NotOpen`] until `open` has been called
/// - `close` keeps data; a later `open` sees everything written before
pub trait Datastore: Send + Sync {
    /// Opens the datastore. Opening an open datastore is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage cannot be loaded.
    fn open(&self) -> StorageResult<()>;

    /// Closes the datastore. Closing a closed datastore is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if pending writes cannot be flushed.
    fn close(&self) -> StorageResult<()>;

    /// Returns true if the datastore is open.
    fn is_open(&self) -> bool;

    /// Reads the value stored at `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the datastore is closed or an I/O error occurs.
    fn get(&self, key: &Key) -> StorageResult<Option<Vec<u8>>>;

    /// Writes `value` at `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the datastore is closed or an I/O error occurs.
    fn put(&self, key: &Key, value: Vec<u8>) -> StorageResult<()>;

    /// Removes `key`. Removing a missing key succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the datastore is closed or an I/O error occurs.
    fn delete(&self, key: &Key) -> StorageResult<()>;

    /// Returns true if `key` is present.
    ///
    /// # Errors
    ///
    /// Returns an error if the datastore is closed.
    fn has(&self, key: &Key) -> StorageResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Scans entries matching `query` in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the datastore is closed.
    fn query(&self, query: &Query) -> StorageResult<QueryIter>;

    /// Applies a batch atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the datastore is closed or an I/O error occurs;
    /// in that case no operation of the batch is visible.
    fn commit(&self, batch: Batch) -> StorageResult<()>;
}
