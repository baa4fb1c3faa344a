//! Database orchestration.
//!
//! A [`Database`] owns the live collections of one datastore and binds them
//! to a replication thread:
//!
//! - local commits are emitted on the database's wildcard emitter under
//!   `<collection>.<id>.<type>` and queued on the [`EventBus`] for delivery
//! - inbound records for the active thread are decoded and merged into the
//!   matching collection through the [`Dispatcher`], unless they come from
//!   this database's own log
//!
//! ## Persisted layout
//!
//! | Prefix              | Contents                                  |
//! |---------------------|-------------------------------------------|
//! | `/meta/threadid`    | resolved thread id                        |
//! | `/meta/schema/<c>`  | schema of collection `c` (CBOR)           |
//! | `/db/<c>/<id>`      | instance `id` of collection `c` (JSON)    |
//! | `/dispatcher/<rid>` | inbound event carried by record `rid`     |
//! | `/eventbus/<job>`   | outbound event waiting for delivery       |

use crate::codec::{from_cbor, to_cbor};
use crate::collection::{Collection, CollectionObserver, Schema};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::emitter::{Emitter, ListenerId};
use crate::error::{CoreError, CoreResult, NetworkError};
use crate::eventbus::{EventBus, EventJob};
use crate::network::{
    CborEventCodec, Credentials, EventCodec, Identity, LogInfo, Record, ReplicationService,
    ThreadInfo, ThreadOptions, Token,
};
use crate::types::{Event, Op, ThreadId, Update};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use threaddb_storage::{Datastore, FileDatastore, Key, NamespacedDatastore, Query};
use tracing::{debug, info, warn};

const THREAD_ID_KEY: &str = "/threadid";
const SCHEMA_PREFIX: &str = "/schema";

/// A collection to register when the database starts.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionConfig {
    /// Collection name.
    pub name: String,
    /// JSON schema document.
    pub schema: Value,
}

impl CollectionConfig {
    /// Creates a collection config.
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }
}

/// Options for [`Database::open`] and the `start*` entry points.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Identity to authenticate as.
    pub identity: Option<Identity>,
    /// Thread to bind to. Must match a previously persisted thread id.
    pub thread_id: Option<ThreadId>,
    /// Key material to create or join the thread with.
    pub thread_key: Option<Vec<u8>>,
    /// Collections to register in addition to the persisted ones.
    pub collections: Vec<CollectionConfig>,
}

impl OpenOptions {
    /// Creates empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the identity.
    #[must_use]
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Requests a specific thread id.
    #[must_use]
    pub fn thread_id(mut self, thread_id: ThreadId) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    /// Sets the thread key material.
    #[must_use]
    pub fn thread_key(mut self, key: Vec<u8>) -> Self {
        self.thread_key = Some(key);
        self
    }

    /// Adds a collection to register on start.
    #[must_use]
    pub fn collection(mut self, name: impl Into<String>, schema: Value) -> Self {
        self.collections.push(CollectionConfig::new(name, schema));
        self
    }
}

/// How the thread is chosen on start.
enum ThreadSource<'a> {
    /// Persisted, requested or newly created.
    Resolve,
    /// Join by address.
    Address(&'a str),
    /// Join from shared thread info.
    Info(&'a ThreadInfo),
}

struct Session {
    thread_id: ThreadId,
    info: ThreadInfo,
    log_id: String,
    credentials: Arc<Credentials>,
    record_listener: ListenerId,
}

/// Forwards collection notifications to the emitter and the event bus.
struct Router {
    emitter: Arc<Emitter<Update>>,
    event_bus: Arc<EventBus>,
    codec: Arc<dyn EventCodec>,
    info: ThreadInfo,
}

impl CollectionObserver for Router {
    fn on_update(&self, update: &Update) {
        self.emitter.emit(&update.path(), update);
    }

    fn on_events(&self, collection: &str, ops: &[Op]) {
        let event = Event::new(collection, ops.to_vec());
        let queued = self.codec.encode(&event, &self.info).and_then(|body| {
            self.event_bus.push(EventJob {
                thread_id: self.info.id.to_string(),
                body,
            })
        });
        // The local write already succeeded; only replication lags.
        if let Err(e) = queued {
            warn!(collection, error = %e, "failed to queue outbound event");
        }
    }
}

struct DbInner {
    root: Arc<dyn Datastore>,
    network: Arc<dyn ReplicationService>,
    codec: Arc<dyn EventCodec>,
    config: Config,
    meta: NamespacedDatastore,
    collections: RwLock<BTreeMap<String, Collection>>,
    emitter: Arc<Emitter<Update>>,
    dispatcher: Dispatcher,
    event_bus: Arc<EventBus>,
    session: RwLock<Option<Session>>,
    lifecycle: Mutex<()>,
}

/// A set of replicated collections stored in one datastore.
///
/// Cloning is cheap; clones share the same state.
///
/// # Example
///
/// ```rust
/// use serde_json::json;
/// use std::sync::Arc;
/// use threaddb_core::{Config, Database, Identity, LoopbackNetwork, OpenOptions};
/// use threaddb_storage::InMemoryDatastore;
///
/// let db = Database::new(
///     Arc::new(InMemoryDatastore::new()),
///     Arc::new(LoopbackNetwork::new()),
///     Config::default(),
/// );
/// db.start(Identity::new("alice"), OpenOptions::new()).unwrap();
///
/// let people = db
///     .new_collection("people", json!({"type": "object", "properties": {"name": {"type": "string"}}}))
///     .unwrap();
/// let ids = people.insert([json!({"name": "Ada"})]).unwrap();
/// assert!(people.has(&ids[0]).unwrap());
///
/// db.close().unwrap();
/// ```
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    /// Creates a closed database over `root`, encoding events as CBOR.
    pub fn new(
        root: Arc<dyn Datastore>,
        network: Arc<dyn ReplicationService>,
        config: Config,
    ) -> Self {
        Self::with_codec(root, network, Arc::new(CborEventCodec), config)
    }

    /// Creates a closed database with a custom event codec.
    pub fn with_codec(
        root: Arc<dyn Datastore>,
        network: Arc<dyn ReplicationService>,
        codec: Arc<dyn EventCodec>,
        config: Config,
    ) -> Self {
        let event_bus = EventBus::new(
            Arc::new(NamespacedDatastore::new(Arc::clone(&root), "/eventbus")),
            Arc::clone(&network),
            config.retry.clone(),
            config.queue_batch_size,
        );
        let inner = DbInner {
            meta: NamespacedDatastore::new(Arc::clone(&root), "/meta"),
            dispatcher: Dispatcher::new(Arc::new(NamespacedDatastore::new(
                Arc::clone(&root),
                "/dispatcher",
            ))),
            event_bus: Arc::new(event_bus),
            root,
            network,
            codec,
            config,
            collections: RwLock::new(BTreeMap::new()),
            emitter: Arc::new(Emitter::new()),
            session: RwLock::new(None),
            lifecycle: Mutex::new(()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Creates a closed database persisted in the file at `path`.
    pub fn open_path(
        path: &Path,
        network: Arc<dyn ReplicationService>,
        config: Config,
    ) -> Self {
        let root = FileDatastore::new(path).sync_on_write(config.sync_on_write);
        Self::new(Arc::new(root), network, config)
    }

    /// Opens the database as `options.identity`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Authentication`] if no identity is given or the
    ///   service rejects it
    /// - [`CoreError::ThreadMismatch`] if `options.thread_id` differs from
    ///   the persisted thread id
    /// - [`CoreError::InvalidOperation`] if the database is already started
    pub fn open(&self, options: OpenOptions) -> CoreResult<()> {
        let identity = options
            .identity
            .clone()
            .ok_or_else(|| CoreError::authentication("identity required"))?;
        self.inner.start(identity, ThreadSource::Resolve, options)
    }

    /// Opens the database as `identity`.
    pub fn start(&self, identity: Identity, options: OpenOptions) -> CoreResult<()> {
        self.inner.start(identity, ThreadSource::Resolve, options)
    }

    /// Opens the database by joining the thread at `addr`.
    ///
    /// Fails with [`CoreError::ThreadMismatch`] if a thread id is already
    /// persisted.
    pub fn start_from_address(
        &self,
        identity: Identity,
        addr: &str,
        options: OpenOptions,
    ) -> CoreResult<()> {
        self.inner
            .start(identity, ThreadSource::Address(addr), options)
    }

    /// Opens the database by joining the thread described by `info`.
    ///
    /// Fails with [`CoreError::ThreadMismatch`] if a thread id is already
    /// persisted.
    pub fn start_from_info(
        &self,
        identity: Identity,
        info: &ThreadInfo,
        options: OpenOptions,
    ) -> CoreResult<()> {
        self.inner.start(identity, ThreadSource::Info(info), options)
    }

    /// Stops replication and closes the datastore. Persisted data and
    /// schemas remain for the next start. Closing a closed database is a
    /// no-op.
    pub fn close(&self) -> CoreResult<()> {
        self.inner.close()
    }

    /// Returns true between a successful start and `close`.
    pub fn is_started(&self) -> bool {
        self.inner.session.read().is_some()
    }

    /// Returns the active thread id.
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.inner.session.read().as_ref().map(|s| s.thread_id)
    }

    /// Returns the thread info peers need to join this database's thread.
    pub fn get_info(&self) -> CoreResult<ThreadInfo> {
        let (thread_id, token) = self.inner.session_token()?;
        Ok(self.inner.network.get_thread(thread_id, &token)?)
    }

    /// Asks the replication service to sync the active thread.
    pub fn pull(&self) -> CoreResult<()> {
        let (thread_id, token) = self.inner.session_token()?;
        Ok(self.inner.network.pull_thread(thread_id, &token)?)
    }

    /// Registers a collection and persists its schema.
    ///
    /// # Errors
    ///
    /// - [`CoreError::DuplicateCollection`] if the name is already live
    /// - [`CoreError::InvalidSchema`] if the schema cannot be compiled
    /// - [`CoreError::NotOpen`] if the database is not started
    pub fn new_collection(&self, name: &str, schema: Value) -> CoreResult<Collection> {
        self.inner.register(name, schema)
    }

    /// Registers a collection whose schema is inferred from `sample`.
    pub fn new_collection_from_object(&self, name: &str, sample: &Value) -> CoreResult<Collection> {
        self.inner.register(name, Schema::infer(sample))
    }

    /// Returns a live collection.
    pub fn get_collection(&self, name: &str) -> CoreResult<Collection> {
        self.inner
            .collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::CollectionNotFound { name: name.into() })
    }

    /// Returns the names of the live collections in order.
    pub fn collection_names(&self) -> Vec<String> {
        self.inner.collections.read().keys().cloned().collect()
    }

    /// Listens for updates whose `<collection>.<id>.<type>` path matches
    /// `pattern`. Remote updates are reported too.
    pub fn on<F>(&self, pattern: &str, callback: F) -> ListenerId
    where
        F: Fn(&str, &Update) + Send + Sync + 'static,
    {
        self.inner.emitter.on(pattern, callback)
    }

    /// Removes an update listener.
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.emitter.off(id)
    }

    /// Removes every update listener.
    pub fn remove_all_listeners(&self) {
        self.inner.emitter.remove_all_listeners();
    }

    /// Returns the number of outbound events not yet delivered.
    pub fn pending_events(&self) -> usize {
        self.inner.event_bus.queue().len()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("thread_id", &self.thread_id())
            .field("collections", &self.collection_names())
            .finish_non_exhaustive()
    }
}

impl DbInner {
    fn start(
        self: &Arc<Self>,
        identity: Identity,
        source: ThreadSource<'_>,
        options: OpenOptions,
    ) -> CoreResult<()> {
        let _lifecycle = self.lifecycle.lock();
        if self.session.read().is_some() {
            return Err(CoreError::invalid_operation("database already started"));
        }

        let credentials = Arc::new(Credentials::new(identity, self.config.token_ttl));
        let token = credentials
            .token(self.network.as_ref())
            .map_err(|e| CoreError::authentication(e.to_string()))?;

        let connected = self
            .open_stores()
            .and_then(|()| self.connect(source, &options, &token));
        let (info, log) = match connected {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(error = %e, "database start failed");
                self.close_stores();
                return Err(e);
            }
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let record_listener = self.event_bus.on_record(move |record| {
            if let Some(inner) = weak.upgrade() {
                inner.on_record(record);
            }
        });
        let thread_id = info.id;
        info!(thread = %thread_id, log = %log.id, "database thread resolved");
        *self.session.write() = Some(Session {
            thread_id,
            info,
            log_id: log.id,
            credentials: Arc::clone(&credentials),
            record_listener,
        });

        let started = self
            .rehydrate(&options)
            .and_then(|()| self.event_bus.start(Some(thread_id), credentials));
        if let Err(e) = started {
            warn!(error = %e, "database start failed");
            if let Err(close_error) = self.teardown() {
                warn!(error = %close_error, "failed to roll back database start");
            }
            return Err(e);
        }
        Ok(())
    }

    fn open_stores(&self) -> CoreResult<()> {
        self.root.open()?;
        self.meta.open()?;
        Ok(())
    }

    /// Closes every datastore opened by a start that did not complete.
    fn close_stores(&self) {
        let closed = self
            .dispatcher
            .close()
            .and_then(|()| Ok(self.meta.close()?))
            .and_then(|()| Ok(self.root.close()?));
        if let Err(e) = closed {
            warn!(error = %e, "failed to close datastores after start failure");
        }
    }

    /// Resolves the thread and this database's log on it. The thread id is
    /// persisted only once both are known.
    fn connect(
        &self,
        source: ThreadSource<'_>,
        options: &OpenOptions,
        token: &Token,
    ) -> CoreResult<(ThreadInfo, LogInfo)> {
        let persisted = self.persisted_thread_id()?;
        let info = match source {
            ThreadSource::Resolve => self.resolve_thread(persisted, options, token)?,
            ThreadSource::Address(addr) => {
                if let Some(persisted) = persisted {
                    return Err(CoreError::thread_mismatch(persisted, addr));
                }
                let opts = ThreadOptions {
                    token: token.clone(),
                    key: options.thread_key.clone(),
                };
                self.network.add_thread(addr, &opts)?
            }
            ThreadSource::Info(info) => {
                if let Some(persisted) = persisted {
                    return Err(CoreError::thread_mismatch(persisted, info.id));
                }
                let addr = info.addrs.first().ok_or_else(|| {
                    CoreError::invalid_operation("thread info carries no address")
                })?;
                let opts = ThreadOptions {
                    token: token.clone(),
                    key: info.key.clone().or_else(|| options.thread_key.clone()),
                };
                self.network.add_thread(addr, &opts)?
            }
        };
        let log = self.network.get_own_log(&info, true, token)?;
        self.dispatcher.open()?;
        if persisted.is_none() {
            self.meta
                .put(&Key::new(THREAD_ID_KEY), to_cbor(&info.id.to_string())?)?;
        }
        Ok((info, log))
    }

    fn persisted_thread_id(&self) -> CoreResult<Option<ThreadId>> {
        match self.meta.get(&Key::new(THREAD_ID_KEY))? {
            Some(bytes) => {
                let raw: String = from_cbor(&bytes)?;
                Ok(Some(raw.parse()?))
            }
            None => Ok(None),
        }
    }

    fn resolve_thread(
        &self,
        persisted: Option<ThreadId>,
        options: &OpenOptions,
        token: &Token,
    ) -> CoreResult<ThreadInfo> {
        let thread_id = match (persisted, options.thread_id) {
            (Some(persisted), Some(requested)) if persisted != requested => {
                return Err(CoreError::thread_mismatch(persisted, requested));
            }
            (Some(id), _) | (None, Some(id)) => id,
            (None, None) => ThreadId::random(),
        };
        match self.network.get_thread(thread_id, token) {
            Ok(info) => Ok(info),
            Err(NetworkError::ThreadNotFound(_)) => {
                debug!(thread = %thread_id, "creating thread");
                let opts = ThreadOptions {
                    token: token.clone(),
                    key: options.thread_key.clone(),
                };
                Ok(self.network.create_thread(thread_id, &opts)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Brings back persisted collections, then registers the configured ones
    /// that are not live yet.
    fn rehydrate(&self, options: &OpenOptions) -> CoreResult<()> {
        let schemas = self
            .meta
            .query(&Query::prefix(Key::new(SCHEMA_PREFIX)))?
            .map(|entry| {
                let entry = entry?;
                Ok((entry.key.name().to_owned(), from_cbor::<Value>(&entry.value)?))
            })
            .collect::<CoreResult<Vec<_>>>()?;
        for (name, schema) in schemas {
            self.register(&name, schema)?;
        }

        for config in &options.collections {
            if self.collections.read().contains_key(&config.name) {
                debug!(collection = %config.name, "collection already live");
                continue;
            }
            self.register(&config.name, config.schema.clone())?;
        }
        debug!(collections = self.collections.read().len(), "collections rehydrated");
        Ok(())
    }

    fn register(&self, name: &str, schema: Value) -> CoreResult<Collection> {
        let session = self.session.read();
        let session = session.as_ref().ok_or(CoreError::not_open("database"))?;
        let mut collections = self.collections.write();
        if collections.contains_key(name) {
            return Err(CoreError::DuplicateCollection { name: name.into() });
        }

        let collection = Collection::new(
            name,
            schema,
            Arc::clone(&self.root),
            self.config.lock_timeout,
        )?;
        let key = Key::new(SCHEMA_PREFIX).child(name);
        if !self.meta.has(&key)? {
            self.meta.put(&key, to_cbor(collection.schema())?)?;
        }

        collection.store().set_observer(Arc::new(Router {
            emitter: Arc::clone(&self.emitter),
            event_bus: Arc::clone(&self.event_bus),
            codec: Arc::clone(&self.codec),
            info: session.info.clone(),
        }));
        self.dispatcher
            .register(name, Arc::new(collection.clone()));
        collections.insert(name.to_owned(), collection.clone());
        debug!(collection = name, "collection registered");
        Ok(collection)
    }

    fn on_record(&self, record: &Record) {
        let info = {
            let session = self.session.read();
            let Some(session) = session.as_ref() else {
                return;
            };
            if record.thread_id != session.thread_id {
                return;
            }
            if record.log_id == session.log_id {
                debug!(record = %record.id, "skipping record from own log");
                return;
            }
            session.info.clone()
        };

        let event = match self.codec.decode(record, &info) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(record = %record.id, "no key material for record");
                return;
            }
            Err(e) => {
                warn!(record = %record.id, error = %e, "failed to decode record");
                return;
            }
        };
        match self.dispatcher.dispatch(&record.id, &event) {
            Ok(true) => debug!(record = %record.id, collection = %event.collection, "record merged"),
            Ok(false) => {}
            Err(e) => warn!(record = %record.id, error = %e, "failed to merge record"),
        }
    }

    fn session_token(&self) -> CoreResult<(ThreadId, Token)> {
        let (thread_id, credentials) = {
            let session = self.session.read();
            let session = session.as_ref().ok_or(CoreError::NotStarted)?;
            (session.thread_id, Arc::clone(&session.credentials))
        };
        let token = credentials.token(self.network.as_ref())?;
        Ok((thread_id, token))
    }

    fn close(&self) -> CoreResult<()> {
        let _lifecycle = self.lifecycle.lock();
        if self.session.read().is_none() {
            return Ok(());
        }
        self.teardown()?;
        info!("database closed");
        Ok(())
    }

    fn teardown(&self) -> CoreResult<()> {
        if let Some(session) = self.session.write().take() {
            self.event_bus.off_record(session.record_listener);
        }
        self.event_bus.stop()?;
        for (_, collection) in std::mem::take(&mut *self.collections.write()) {
            collection.store().clear_observer();
        }
        self.dispatcher.close()?;
        self.meta.close()?;
        self.root.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{LoopbackNetwork, NetworkResult, RecordCallback, Subscription};
    use crate::types::OpType;
    use serde_json::json;
    use std::time::{Duration, Instant};
    use threaddb_storage::InMemoryDatastore;

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "_id": {"type": "string"},
                "name": {"type": "string"},
                "age": {"type": "integer", "minimum": 0}
            },
            "required": ["name"]
        })
    }

    struct Fixture {
        root: Arc<InMemoryDatastore>,
        network: Arc<LoopbackNetwork>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                root: Arc::new(InMemoryDatastore::new()),
                network: Arc::new(LoopbackNetwork::new()),
            }
        }

        fn db(&self) -> Database {
            Database::new(self.root.clone(), self.network.clone(), Config::default())
        }
    }

    fn alice() -> Identity {
        Identity::new("alice")
    }

    #[test]
    fn open_requires_identity() {
        let f = Fixture::new();
        let db = f.db();
        let err = db.open(OpenOptions::new()).unwrap_err();
        assert!(matches!(err, CoreError::Authentication { .. }));
        assert!(!db.is_started());
    }

    #[test]
    fn start_twice_is_rejected() {
        let f = Fixture::new();
        let db = f.db();
        db.start(alice(), OpenOptions::new()).unwrap();
        let err = db.start(alice(), OpenOptions::new()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));
        db.close().unwrap();
    }

    #[test]
    fn collections_require_a_started_database() {
        let f = Fixture::new();
        let db = f.db();
        let err = db.new_collection("people", schema()).unwrap_err();
        assert!(matches!(err, CoreError::NotOpen { .. }));
        assert!(matches!(db.get_info().unwrap_err(), CoreError::NotStarted));
    }

    #[test]
    fn duplicate_collections_are_rejected() {
        let f = Fixture::new();
        let db = f.db();
        db.start(alice(), OpenOptions::new()).unwrap();
        db.new_collection("people", schema()).unwrap();
        let err = db.new_collection("people", schema()).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateCollection { .. }));
        assert_eq!(db.collection_names(), vec!["people".to_string()]);
        db.close().unwrap();
    }

    #[test]
    fn thread_id_survives_reopen() {
        let f = Fixture::new();
        let db = f.db();
        db.start(alice(), OpenOptions::new()).unwrap();
        let thread = db.thread_id().unwrap();
        db.close().unwrap();
        assert!(db.thread_id().is_none());

        db.start(alice(), OpenOptions::new()).unwrap();
        assert_eq!(db.thread_id(), Some(thread));
        db.close().unwrap();
    }

    #[test]
    fn mismatched_thread_id_fails_without_touching_state() {
        let f = Fixture::new();
        let db = f.db();
        db.start(alice(), OpenOptions::new()).unwrap();
        let thread = db.thread_id().unwrap();
        db.close().unwrap();

        let err = db
            .start(alice(), OpenOptions::new().thread_id(ThreadId::random()))
            .unwrap_err();
        assert!(matches!(err, CoreError::ThreadMismatch { .. }));
        assert!(!db.is_started());
        assert!(!f.root.is_open());

        db.start(alice(), OpenOptions::new().thread_id(thread)).unwrap();
        assert_eq!(db.thread_id(), Some(thread));
        db.close().unwrap();
    }

    #[test]
    fn joining_is_forbidden_once_a_thread_is_persisted() {
        let f = Fixture::new();
        let db = f.db();
        db.start(alice(), OpenOptions::new()).unwrap();
        let info = db.get_info().unwrap();
        db.close().unwrap();

        let err = db
            .start_from_address(alice(), &info.addrs[0], OpenOptions::new())
            .unwrap_err();
        assert!(matches!(err, CoreError::ThreadMismatch { .. }));
        let err = db.start_from_info(alice(), &info, OpenOptions::new()).unwrap_err();
        assert!(matches!(err, CoreError::ThreadMismatch { .. }));
        assert!(!f.root.is_open());
    }

    /// Loopback network that refuses to hand out logs.
    struct NoLogNetwork(LoopbackNetwork);

    impl ReplicationService for NoLogNetwork {
        fn get_token(&self, identity: &Identity) -> NetworkResult<Token> {
            self.0.get_token(identity)
        }
        fn create_thread(&self, id: ThreadId, opts: &ThreadOptions) -> NetworkResult<ThreadInfo> {
            self.0.create_thread(id, opts)
        }
        fn add_thread(&self, addr: &str, opts: &ThreadOptions) -> NetworkResult<ThreadInfo> {
            self.0.add_thread(addr, opts)
        }
        fn get_thread(&self, id: ThreadId, token: &Token) -> NetworkResult<ThreadInfo> {
            self.0.get_thread(id, token)
        }
        fn get_own_log(&self, _: &ThreadInfo, _: bool, _: &Token) -> NetworkResult<LogInfo> {
            Err(NetworkError::Service("log store offline".into()))
        }
        fn create_record(&self, thread_id: ThreadId, body: &[u8], token: &Token) -> NetworkResult<Record> {
            self.0.create_record(thread_id, body, token)
        }
        fn subscribe(
            &self,
            callback: RecordCallback,
            thread_ids: &[ThreadId],
            token: &Token,
        ) -> NetworkResult<Subscription> {
            self.0.subscribe(callback, thread_ids, token)
        }
        fn pull_thread(&self, thread_id: ThreadId, token: &Token) -> NetworkResult<()> {
            self.0.pull_thread(thread_id, token)
        }
    }

    #[test]
    fn failed_start_persists_nothing_and_closes_stores() {
        let root = Arc::new(InMemoryDatastore::new());
        let broken = Database::new(
            root.clone(),
            Arc::new(NoLogNetwork(LoopbackNetwork::new())),
            Config::default(),
        );
        let err = broken.start(alice(), OpenOptions::new()).unwrap_err();
        assert!(matches!(err, CoreError::Network(NetworkError::Service(_))));
        assert!(!broken.is_started());
        assert!(!root.is_open());

        let db = Database::new(root.clone(), Arc::new(LoopbackNetwork::new()), Config::default());
        let requested = ThreadId::random();
        db.start(alice(), OpenOptions::new().thread_id(requested)).unwrap();
        assert_eq!(db.thread_id(), Some(requested));
        db.close().unwrap();
    }

    #[test]
    fn local_writes_are_emitted_and_queued() {
        let f = Fixture::new();
        let db = f.db();
        db.start(alice(), OpenOptions::new()).unwrap();
        let people = db.new_collection("people", schema()).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        db.on("people.**", move |path, update| {
            assert!(!update.remote);
            sink.lock().push(path.to_owned());
        });

        let ids = people.insert([json!({"name": "Ada"})]).unwrap();
        people.delete([&ids[0]]).unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                format!("people.{}.{}", ids[0], OpType::Create),
                format!("people.{}.{}", ids[0], OpType::Delete),
            ]
        );
        let thread = db.thread_id().unwrap();
        assert!(wait_until(|| f.network.records(thread).len() == 2));
        db.close().unwrap();
    }

    #[test]
    fn option_collections_are_registered_once() {
        let f = Fixture::new();
        let db = f.db();
        let options = OpenOptions::new().collection("people", schema());
        db.start(alice(), options.clone()).unwrap();
        assert!(db.get_collection("people").is_ok());
        db.close().unwrap();

        db.start(alice(), options).unwrap();
        assert_eq!(db.collection_names(), vec!["people".to_string()]);
        db.close().unwrap();
    }

    #[test]
    fn closed_database_forgets_collections() {
        let f = Fixture::new();
        let db = f.db();
        db.start(alice(), OpenOptions::new()).unwrap();
        db.new_collection_from_object("pets", &json!({"name": "Rex", "legs": 4}))
            .unwrap();
        db.close().unwrap();
        assert!(matches!(
            db.get_collection("pets").unwrap_err(),
            CoreError::CollectionNotFound { .. }
        ));
        db.close().unwrap();
    }
}
