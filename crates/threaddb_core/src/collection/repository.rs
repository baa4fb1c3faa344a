//! Collection and read-only collection views.

use super::document::Document;
use super::lock::{NamedMutex, NamedRwLock};
use super::query::{FindOptions, Query};
use super::schema::Schema;
use super::store::{PatchStore, Write};
use super::ID_FIELD;
use crate::error::{CoreError, CoreResult};
use crate::types::new_id;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use threaddb_storage::{Datastore, Key, NamespacedDatastore};
use tracing::debug;

/// One query result.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Instance id.
    pub key: String,
    /// Instance value.
    pub value: Value,
}

/// A single-pass sequence of query results.
///
/// Unsorted finds stream from the datastore; sorted finds materialise the
/// matches first. Calling `find` again re-scans.
pub struct Cursor {
    inner: Box<dyn Iterator<Item = CoreResult<Entry>> + Send>,
}

impl Cursor {
    fn new(inner: impl Iterator<Item = CoreResult<Entry>> + Send + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    /// Collects every remaining entry, stopping at the first error.
    pub fn collect_entries(self) -> CoreResult<Vec<Entry>> {
        self.collect()
    }
}

impl Iterator for Cursor {
    type Item = CoreResult<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor").finish_non_exhaustive()
    }
}

struct Inner {
    name: String,
    schema: Schema,
    store: PatchStore,
    transaction: NamedRwLock,
    insert: NamedMutex,
    lock_timeout: Option<Duration>,
}

/// A named, schema-validated instance store.
///
/// Cloning is cheap; clones share storage and locks.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<Inner>,
}

impl Collection {
    /// Creates a collection whose instances live under `/db/<name>` in
    /// `root`. The root datastore is opened if needed.
    ///
    /// `lock_timeout` is used by transactions that don't pass their own.
    pub fn new(
        name: impl Into<String>,
        schema: Value,
        root: Arc<dyn Datastore>,
        lock_timeout: Option<Duration>,
    ) -> CoreResult<Self> {
        let name = name.into();
        if name.is_empty() || name.contains(['/', '.']) {
            return Err(CoreError::invalid_operation(format!(
                "invalid collection name {name:?}"
            )));
        }
        let schema = Schema::compile(schema)?;
        let partition = NamespacedDatastore::new(root, Key::new("/db").child(&name));
        partition.open()?;

        Ok(Self {
            inner: Arc::new(Inner {
                store: PatchStore::new(name.clone(), Arc::new(partition)),
                name,
                schema,
                transaction: NamedRwLock::new("transaction"),
                insert: NamedMutex::new("insert"),
                lock_timeout,
            }),
        })
    }

    /// Returns the collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the schema document.
    #[must_use]
    pub fn schema(&self) -> &Value {
        self.inner.schema.source()
    }

    pub(crate) fn store(&self) -> &PatchStore {
        &self.inner.store
    }

    /// Assigns an id if missing, applies defaults and validates.
    fn prepare(&self, mut value: Value) -> CoreResult<(String, Value)> {
        let Value::Object(map) = &mut value else {
            return Err(self.invalid("", "type", "instance must be an object"));
        };
        let id = match map.get(ID_FIELD) {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) if id.is_empty() => None,
            Some(Value::String(id)) => Some(id.clone()),
            Some(_) => return Err(self.invalid("/_id", "type", "must be string")),
        };
        let id = id.unwrap_or_else(|| {
            let id = new_id();
            map.insert(ID_FIELD.to_owned(), Value::String(id.clone()));
            id
        });

        self.inner.schema.apply_defaults(&mut value);
        let failures = self.inner.schema.validate(&value);
        if !failures.is_empty() {
            return Err(CoreError::Validation {
                collection: self.inner.name.clone(),
                failures,
            });
        }
        Ok((id, value))
    }

    fn invalid(&self, path: &str, keyword: &str, message: &str) -> CoreError {
        CoreError::Validation {
            collection: self.inner.name.clone(),
            failures: vec![crate::error::ValidationFailure {
                path: path.to_owned(),
                keyword: keyword.to_owned(),
                message: message.to_owned(),
            }],
        }
    }

    /// Validates `data` and wraps it as a document. Nothing is stored until
    /// [`Document::save`].
    pub fn new_instance(&self, data: Value) -> CoreResult<Document> {
        let (_, value) = self.prepare(data)?;
        Ok(Document::new(self.clone(), value))
    }

    /// Validates and upserts every instance in one atomic batch. Returns the
    /// ids in input order.
    ///
    /// If any instance fails validation nothing is written.
    pub fn save(&self, instances: impl IntoIterator<Item = Value>) -> CoreResult<Vec<String>> {
        let prepared = instances
            .into_iter()
            .map(|value| self.prepare(value))
            .collect::<CoreResult<Vec<_>>>()?;
        let ids = prepared.iter().map(|(id, _)| id.clone()).collect();
        let writes = prepared
            .into_iter()
            .map(|(id, value)| Write::Put { id, value })
            .collect();
        self.inner.store.commit(writes)?;
        Ok(ids)
    }

    /// Deletes instances by id. Missing ids are ignored.
    pub fn delete<I, S>(&self, ids: I) -> CoreResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let writes = ids
            .into_iter()
            .map(|id| Write::Delete {
                id: id.as_ref().to_owned(),
            })
            .collect();
        self.inner.store.commit(writes)?;
        Ok(())
    }

    /// Like [`save`](Self::save) but fails with [`CoreError::ExistingKey`]
    /// if any id is already stored, in which case nothing is written.
    pub fn insert(&self, instances: impl IntoIterator<Item = Value>) -> CoreResult<Vec<String>> {
        let prepared = instances
            .into_iter()
            .map(|value| self.prepare(value))
            .collect::<CoreResult<Vec<_>>>()?;

        let _guard = self.inner.insert.lock(self.inner.lock_timeout)?;
        let mut seen = std::collections::HashSet::new();
        for (id, _) in &prepared {
            if !seen.insert(id.as_str()) || self.inner.store.has(id)? {
                debug!(collection = %self.inner.name, id = %id, "insert rejected");
                return Err(CoreError::ExistingKey {
                    collection: self.inner.name.clone(),
                    id: id.clone(),
                });
            }
        }

        let ids = prepared.iter().map(|(id, _)| id.clone()).collect();
        let writes = prepared
            .into_iter()
            .map(|(id, value)| Write::Put { id, value })
            .collect();
        self.inner.store.commit(writes)?;
        Ok(ids)
    }

    /// Returns the instances matching `query`.
    pub fn find(&self, query: &Query, options: &FindOptions) -> CoreResult<Cursor> {
        let query = query.clone();
        let matches = self.inner.store.scan()?.filter_map(move |item| match item {
            Ok((key, value)) if query.matches(&value) => Some(Ok(Entry { key, value })),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        });

        let limit = options.limit.unwrap_or(usize::MAX);
        if options.sort.is_empty() {
            return Ok(Cursor::new(matches.skip(options.offset).take(limit)));
        }

        let mut entries = matches.collect::<CoreResult<Vec<_>>>()?;
        entries.sort_by(|a, b| options.compare(&a.value, &b.value));
        Ok(Cursor::new(
            entries.into_iter().skip(options.offset).take(limit).map(Ok),
        ))
    }

    /// Returns the first instance matching `query`, in id order.
    pub fn find_one(&self, query: &Query) -> CoreResult<Option<Entry>> {
        self.find(query, &FindOptions::new().limit(1))?
            .next()
            .transpose()
    }

    /// Counts the instances matching `query`.
    pub fn count(&self, query: &Query) -> CoreResult<usize> {
        self.find(query, &FindOptions::new())?
            .try_fold(0, |n, entry| entry.map(|_| n + 1))
    }

    /// Returns the instance stored under `id`.
    pub fn find_by_id(&self, id: &str) -> CoreResult<Value> {
        self.inner
            .store
            .get(id)?
            .ok_or_else(|| CoreError::NotFound {
                collection: self.inner.name.clone(),
                id: id.to_owned(),
            })
    }

    /// Returns true if an instance is stored under `id`.
    pub fn has(&self, id: &str) -> CoreResult<bool> {
        self.inner.store.has(id)
    }

    /// Runs `f` against a read-only view while holding the shared
    /// `transaction` lock. Read transactions overlap each other but not a
    /// write transaction.
    ///
    /// Fails with [`CoreError::LockTimeout`] if the lock is not acquired
    /// within `timeout` (or the collection default).
    pub fn read_transaction<R>(
        &self,
        f: impl FnOnce(&ReadonlyCollection<'_>) -> CoreResult<R>,
        timeout: Option<Duration>,
    ) -> CoreResult<R> {
        let _guard = self
            .inner
            .transaction
            .read(timeout.or(self.inner.lock_timeout))?;
        f(&ReadonlyCollection { collection: self })
    }

    /// Runs `f` while holding the exclusive `transaction` lock.
    pub fn write_transaction<R>(
        &self,
        f: impl FnOnce(&Collection) -> CoreResult<R>,
        timeout: Option<Duration>,
    ) -> CoreResult<R> {
        let _guard = self
            .inner
            .transaction
            .write(timeout.or(self.inner.lock_timeout))?;
        f(self)
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

/// Read-only access to a collection inside a read transaction.
#[derive(Debug, Clone, Copy)]
pub struct ReadonlyCollection<'a> {
    collection: &'a Collection,
}

impl ReadonlyCollection<'_> {
    /// Returns the collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.collection.name()
    }

    /// See [`Collection::find`].
    pub fn find(&self, query: &Query, options: &FindOptions) -> CoreResult<Cursor> {
        self.collection.find(query, options)
    }

    /// See [`Collection::find_one`].
    pub fn find_one(&self, query: &Query) -> CoreResult<Option<Entry>> {
        self.collection.find_one(query)
    }

    /// See [`Collection::count`].
    pub fn count(&self, query: &Query) -> CoreResult<usize> {
        self.collection.count(query)
    }

    /// See [`Collection::find_by_id`].
    pub fn find_by_id(&self, id: &str) -> CoreResult<Value> {
        self.collection.find_by_id(id)
    }

    /// See [`Collection::has`].
    pub fn has(&self, id: &str) -> CoreResult<bool> {
        self.collection.has(id)
    }
}
