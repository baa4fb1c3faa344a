//! Patch-aware instance store.
//!
//! Instances are stored as JSON under `/<id>` inside the collection's
//! datastore partition. Every committed write is translated into an [`Op`]
//! carrying a JSON patch, and the ops are reported to the registered
//! [`CollectionObserver`].

use crate::codec::{from_json, to_json};
use crate::error::{CoreError, CoreResult};
use crate::patch::Patch;
use crate::types::{Event, Op, OpType, Update};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use threaddb_storage::{Batch, Datastore, Key, Query as KeyQuery};
use tracing::{debug, warn};

/// Receives the mutations committed to a collection.
pub trait CollectionObserver: Send + Sync {
    /// Called once per applied op, for local and remote mutations alike.
    fn on_update(&self, update: &Update);

    /// Called once per local commit with every op it produced. Remote
    /// mutations applied through [`PatchStore::reduce`] are not reported.
    fn on_events(&self, collection: &str, ops: &[Op]);
}

/// A write requested by a collection.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Create or overwrite an instance.
    Put {
        /// Instance id.
        id: String,
        /// Full new value.
        value: Value,
    },
    /// Remove an instance if present.
    Delete {
        /// Instance id.
        id: String,
    },
}

/// Instance storage for one collection.
pub struct PatchStore {
    collection: String,
    store: Arc<dyn Datastore>,
    observer: RwLock<Option<Arc<dyn CollectionObserver>>>,
}

/// Ids become a datastore key segment and a segment of the `coll.id.Type`
/// update path, so neither `/` nor `.` may appear in them.
pub(crate) fn instance_key(id: &str) -> CoreResult<Key> {
    if id.is_empty() || id.contains(['/', '.']) {
        return Err(CoreError::invalid_operation(format!(
            "invalid instance id {id:?}"
        )));
    }
    Ok(Key::root().child(id))
}

impl PatchStore {
    /// Creates a store over an opened datastore partition.
    pub fn new(collection: impl Into<String>, store: Arc<dyn Datastore>) -> Self {
        Self {
            collection: collection.into(),
            store,
            observer: RwLock::new(None),
        }
    }

    /// Sets the observer notified of committed ops.
    pub fn set_observer(&self, observer: Arc<dyn CollectionObserver>) {
        *self.observer.write() = Some(observer);
    }

    /// Removes the observer.
    pub fn clear_observer(&self) {
        *self.observer.write() = None;
    }

    /// Returns the stored instance.
    pub fn get(&self, id: &str) -> CoreResult<Option<Value>> {
        self.store
            .get(&instance_key(id)?)?
            .map(|bytes| from_json(&bytes))
            .transpose()
    }

    /// Returns true if an instance is stored under `id`.
    pub fn has(&self, id: &str) -> CoreResult<bool> {
        Ok(self.store.has(&instance_key(id)?)?)
    }

    /// Iterates over all instances in id order.
    pub fn scan(&self) -> CoreResult<impl Iterator<Item = CoreResult<(String, Value)>>> {
        let entries = self.store.query(&KeyQuery::all())?;
        Ok(entries.map(|entry| {
            let entry = entry?;
            Ok((entry.key.name().to_owned(), from_json(&entry.value)?))
        }))
    }

    /// Commits writes as one atomic batch and returns the resulting ops.
    ///
    /// Writes that change nothing (saving an identical value, deleting a
    /// missing id) produce no op and no datastore write.
    pub fn commit(&self, writes: Vec<Write>) -> CoreResult<Vec<Op>> {
        let mut batch = Batch::new();
        let mut ops = Vec::new();
        let mut pending: HashMap<String, Option<Value>> = HashMap::new();

        for write in writes {
            let id = match &write {
                Write::Put { id, .. } | Write::Delete { id } => id.clone(),
            };
            let key = instance_key(&id)?;
            let current = match pending.get(&id) {
                Some(value) => value.clone(),
                None => self.get(&id)?,
            };

            match write {
                Write::Put { value, .. } => {
                    let (op_type, patch) = match &current {
                        None => (OpType::Create, Patch::root(value.clone())),
                        Some(old) => {
                            let patch = Patch::diff(old, &value);
                            if patch.is_empty() {
                                continue;
                            }
                            (OpType::Save, patch)
                        }
                    };
                    batch.put(key, to_json(&value)?);
                    ops.push(self.op(id.clone(), op_type, Some(patch)));
                    pending.insert(id, Some(value));
                }
                Write::Delete { .. } => {
                    if current.is_none() {
                        continue;
                    }
                    batch.delete(key);
                    ops.push(self.op(id.clone(), OpType::Delete, None));
                    pending.insert(id, None);
                }
            }
        }

        if ops.is_empty() {
            return Ok(ops);
        }
        self.store.commit(batch)?;
        debug!(collection = %self.collection, ops = ops.len(), "committed");

        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            for op in &ops {
                observer.on_update(&Update::from_op(op, false));
            }
            observer.on_events(&self.collection, &ops);
        }
        Ok(ops)
    }

    /// Applies a remote event.
    ///
    /// Ops for other collections are ignored. The event is applied as a
    /// whole: if any patch cannot be applied to the stored value, nothing is
    /// written and the error is returned so the record can be merged on a
    /// later delivery.
    pub fn reduce(&self, event: &Event) -> CoreResult<Vec<Op>> {
        let mut batch = Batch::new();
        let mut applied = Vec::new();
        let mut pending: HashMap<String, Option<Value>> = HashMap::new();

        for op in event.ops.iter().filter(|op| op.collection == self.collection) {
            let key = instance_key(&op.id)?;
            match op.op_type {
                OpType::Create | OpType::Save => {
                    let base = match (op.op_type, pending.get(&op.id)) {
                        (OpType::Create, _) => None,
                        (_, Some(value)) => value.clone(),
                        _ => self.get(&op.id)?,
                    };
                    let patch = op.patch.clone().unwrap_or_default();
                    let value = patch
                        .applied(&base.unwrap_or(Value::Null))
                        .inspect_err(|e| {
                            warn!(collection = %self.collection, id = %op.id, error = %e, "remote op not applicable");
                        })?;
                    batch.put(key, to_json(&value)?);
                    pending.insert(op.id.clone(), Some(value));
                }
                OpType::Delete => {
                    batch.delete(key);
                    pending.insert(op.id.clone(), None);
                }
            }
            applied.push(op.clone());
        }

        if applied.is_empty() {
            return Ok(applied);
        }
        self.store.commit(batch)?;
        debug!(collection = %self.collection, ops = applied.len(), "reduced remote event");

        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            for op in &applied {
                observer.on_update(&Update::from_op(op, true));
            }
        }
        Ok(applied)
    }

    fn op(&self, id: String, op_type: OpType, patch: Option<Patch>) -> Op {
        Op {
            collection: self.collection.clone(),
            id,
            op_type,
            patch,
        }
    }
}

impl std::fmt::Debug for PatchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchStore")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use threaddb_storage::InMemoryDatastore;

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<Update>>,
        events: Mutex<Vec<Vec<Op>>>,
    }

    impl CollectionObserver for Recorder {
        fn on_update(&self, update: &Update) {
            self.updates.lock().push(update.clone());
        }
        fn on_events(&self, _collection: &str, ops: &[Op]) {
            self.events.lock().push(ops.to_vec());
        }
    }

    fn store() -> (PatchStore, Arc<Recorder>) {
        let ds = Arc::new(InMemoryDatastore::new());
        ds.open().unwrap();
        let store = PatchStore::new("people", ds);
        let recorder = Arc::new(Recorder::default());
        store.set_observer(recorder.clone());
        (store, recorder)
    }

    fn put(id: &str, value: Value) -> Write {
        Write::Put {
            id: id.into(),
            value,
        }
    }

    #[test]
    fn create_save_delete_ops() {
        let (store, recorder) = store();
        let ops = store.commit(vec![put("a", json!({"_id": "a", "n": 1}))]).unwrap();
        assert_eq!(ops[0].op_type, OpType::Create);
        assert_eq!(ops[0].patch, Some(Patch::root(json!({"_id": "a", "n": 1}))));

        let ops = store.commit(vec![put("a", json!({"_id": "a", "n": 2}))]).unwrap();
        assert_eq!(ops[0].op_type, OpType::Save);

        let ops = store.commit(vec![Write::Delete { id: "a".into() }]).unwrap();
        assert_eq!(ops[0].op_type, OpType::Delete);
        assert!(ops[0].patch.is_none());
        assert!(!store.has("a").unwrap());

        assert_eq!(recorder.updates.lock().len(), 3);
        assert_eq!(recorder.events.lock().len(), 3);
    }

    #[test]
    fn unchanged_writes_are_silent() {
        let (store, recorder) = store();
        store.commit(vec![put("a", json!({"_id": "a"}))]).unwrap();
        assert!(store.commit(vec![put("a", json!({"_id": "a"}))]).unwrap().is_empty());
        assert!(store.commit(vec![Write::Delete { id: "zz".into() }]).unwrap().is_empty());
        assert_eq!(recorder.events.lock().len(), 1);
    }

    #[test]
    fn repeated_ids_in_one_batch() {
        let (store, _) = store();
        let ops = store
            .commit(vec![
                put("a", json!({"_id": "a", "n": 1})),
                put("a", json!({"_id": "a", "n": 2})),
                Write::Delete { id: "a".into() },
            ])
            .unwrap();
        let types: Vec<OpType> = ops.iter().map(|op| op.op_type).collect();
        assert_eq!(types, vec![OpType::Create, OpType::Save, OpType::Delete]);
        assert!(!store.has("a").unwrap());
    }

    #[test]
    fn reduce_updates_but_does_not_requeue() {
        let (source, _) = store();
        let ops = source.commit(vec![put("a", json!({"_id": "a", "n": 1}))]).unwrap();
        let mut all = ops;
        all.extend(source.commit(vec![put("a", json!({"_id": "a", "n": 5}))]).unwrap());

        let (replica, recorder) = store();
        let applied = replica.reduce(&Event::new("people", all)).unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(replica.get("a").unwrap(), Some(json!({"_id": "a", "n": 5})));

        let updates = recorder.updates.lock();
        assert_eq!(updates.len(), 2);
        assert!(updates.iter().all(|u| u.remote));
        assert!(recorder.events.lock().is_empty());
    }

    #[test]
    fn reduce_is_all_or_nothing() {
        let (source, _) = store();
        let create = source.commit(vec![put("a", json!({"_id": "a", "n": 1}))]).unwrap();
        let save = source.commit(vec![put("a", json!({"_id": "a", "n": 2}))]).unwrap();
        let other = source.commit(vec![put("b", json!({"_id": "b"}))]).unwrap();

        let (replica, recorder) = store();
        let mut early = other.clone();
        early.extend(save.clone());
        assert!(replica.reduce(&Event::new("people", early.clone())).is_err());
        assert!(!replica.has("b").unwrap());
        assert!(recorder.updates.lock().is_empty());

        replica.reduce(&Event::new("people", create)).unwrap();
        assert_eq!(replica.reduce(&Event::new("people", early)).unwrap().len(), 2);
        assert_eq!(replica.get("a").unwrap(), Some(json!({"_id": "a", "n": 2})));
        assert!(replica.has("b").unwrap());
    }

    #[test]
    fn scan_in_id_order() {
        let (store, _) = store();
        store
            .commit(vec![put("b", json!({"_id": "b"})), put("a", json!({"_id": "a"}))])
            .unwrap();
        let ids: Vec<String> = store.scan().unwrap().map(|r| r.unwrap().0).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn rejects_bad_ids() {
        let (store, _) = store();
        assert!(store.commit(vec![put("a/b", json!({}))]).is_err());
        assert!(store.commit(vec![put("a.b", json!({}))]).is_err());
        assert!(store.get("").is_err());
    }
}
