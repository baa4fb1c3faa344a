//! Inbound event dispatch.
//!
//! The dispatcher keeps one reducer per collection. An inbound event is
//! persisted under `/<record id>` in the dispatcher's datastore partition
//! once it has been reduced. A record delivered again after a successful
//! merge is ignored; a record whose reduce failed is reduced again on its
//! next delivery.

use crate::codec::to_cbor;
use crate::collection::Collection;
use crate::error::CoreResult;
use crate::types::Event;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use threaddb_storage::{Datastore, Key, Query};
use tracing::debug;

/// Applies remote events to local state.
pub trait Reducer: Send + Sync {
    /// Applies `event`.
    fn reduce(&self, event: &Event) -> CoreResult<()>;
}

impl Reducer for Collection {
    fn reduce(&self, event: &Event) -> CoreResult<()> {
        self.store().reduce(event).map(|_| ())
    }
}

/// Routes inbound events to collection reducers.
pub struct Dispatcher {
    store: Arc<dyn Datastore>,
    reducers: RwLock<HashMap<String, Arc<dyn Reducer>>>,
    serial: Mutex<()>,
}

impl Dispatcher {
    /// Creates a dispatcher persisting into `store`.
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        Self {
            store,
            reducers: RwLock::new(HashMap::new()),
            serial: Mutex::new(()),
        }
    }

    /// Opens the backing datastore.
    pub fn open(&self) -> CoreResult<()> {
        Ok(self.store.open()?)
    }

    /// Closes the backing datastore and drops all reducers.
    pub fn close(&self) -> CoreResult<()> {
        self.reducers.write().clear();
        Ok(self.store.close()?)
    }

    /// Registers the reducer for `collection`, replacing any previous one.
    pub fn register(&self, collection: impl Into<String>, reducer: Arc<dyn Reducer>) {
        self.reducers.write().insert(collection.into(), reducer);
    }

    /// Reduces an event and then persists it under its record id.
    ///
    /// Returns false without side effects if the record was already
    /// dispatched or no reducer handles the event's collection. A reduce
    /// error leaves no marker behind.
    pub fn dispatch(&self, record_id: &str, event: &Event) -> CoreResult<bool> {
        let Some(reducer) = self.reducers.read().get(&event.collection).cloned() else {
            debug!(collection = %event.collection, "no reducer for event");
            return Ok(false);
        };

        let _serial = self.serial.lock();
        let key = Key::root().child(record_id);
        if self.store.has(&key)? {
            debug!(record = record_id, "record already dispatched");
            return Ok(false);
        }
        reducer.reduce(event)?;
        self.store.put(&key, to_cbor(event)?)?;
        Ok(true)
    }

    /// Returns the number of persisted events.
    pub fn len(&self) -> CoreResult<usize> {
        Ok(self.store.query(&Query::all().keys_only())?.count())
    }

    /// Returns true if no events were dispatched.
    pub fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("reducers", &self.reducers.read().len())
            .finish_non_exhaustive()
    }
}
