//! Test fixtures and database helpers.
//!
//! Provides started databases, shared networks and the polling helpers
//! needed to observe background event delivery.

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use threaddb_core::{
    Collection, Config, Database, Identity, LoopbackNetwork, OpenOptions, RetryConfig,
};
use threaddb_storage::{Datastore, InMemoryDatastore};

/// Default time `wait_until` polls before giving up.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Installs a `tracing` subscriber honouring `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Polls `condition` until it holds or [`WAIT_TIMEOUT`] elapses.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Configuration with millisecond retries and unsynced file writes.
pub fn test_config() -> Config {
    Config::default()
        .retry(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(10))
                .with_jitter(false),
        )
        .lock_timeout(Duration::from_secs(2))
        .sync_on_write(false)
}

/// Schema for the `person` instances used throughout the tests.
pub fn person_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "_id": {"type": "string"},
            "name": {"type": "string", "minLength": 1},
            "age": {"type": "integer", "minimum": 0},
            "email": {"type": "string"}
        },
        "required": ["name", "age"]
    })
}

/// Builds a person instance without an id.
pub fn person(name: &str, age: i64) -> Value {
    json!({"name": name, "age": age})
}

/// A started test database with automatic cleanup.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
    /// The network the database replicates through.
    pub network: Arc<LoopbackNetwork>,
    /// The identity the database was started as.
    pub identity: Identity,
    root: Option<Arc<dyn Datastore>>,
    path: Option<PathBuf>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestDatabase {
    /// Starts an in-memory database on a fresh network.
    pub fn memory() -> Self {
        Self::memory_on(Arc::new(LoopbackNetwork::new()), "alice")
    }

    /// Starts an in-memory database on `network` as `identity`.
    pub fn memory_on(network: Arc<LoopbackNetwork>, identity: &str) -> Self {
        let root: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::new());
        let db = Database::new(Arc::clone(&root), network.clone(), test_config());
        let test_db = Self {
            db,
            network,
            identity: Identity::new(identity),
            root: Some(root),
            path: None,
            _temp_dir: None,
        };
        test_db.start();
        test_db
    }

    /// Starts a file-backed database on a fresh network.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("threaddb.log");
        let network = Arc::new(LoopbackNetwork::new());
        let db = Database::open_path(&path, network.clone(), test_config());
        let test_db = Self {
            db,
            network,
            identity: Identity::new("alice"),
            root: None,
            path: Some(path),
            _temp_dir: Some(temp_dir),
        };
        test_db.start();
        test_db
    }

    fn start(&self) {
        self.db
            .start(self.identity.clone(), OpenOptions::new())
            .expect("Failed to start test database");
    }

    /// Closes and starts the database again over the same datastore.
    pub fn restart(&self) {
        self.db.close().expect("Failed to close test database");
        self.start();
    }

    /// Opens a second database over the same persisted state, sharing the
    /// network. The returned database is not started.
    ///
    /// The current database must be closed first.
    pub fn reopen(&self) -> Database {
        match (&self.path, &self.root) {
            (Some(path), _) => Database::open_path(path, self.network.clone(), test_config()),
            (None, Some(root)) => {
                Database::new(Arc::clone(root), self.network.clone(), test_config())
            }
            (None, None) => unreachable!("test databases have a path or a root"),
        }
    }

    /// Returns the log file path if file-based, None if in-memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        let _ = self.db.close();
    }
}

/// Runs a test with a started in-memory database.
///
/// # Example
///
/// ```rust
/// use threaddb_testkit::{person_schema, with_temp_db};
///
/// with_temp_db(|db| {
///     db.new_collection("people", person_schema()).unwrap();
///     assert_eq!(db.collection_names(), vec!["people".to_string()]);
/// });
/// ```
pub fn with_temp_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database) -> R,
{
    let test_db = TestDatabase::memory();
    f(&test_db.db)
}

/// Runs a test with a started file-backed database.
pub fn with_file_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database, &Path) -> R,
{
    let test_db = TestDatabase::file();
    let path = test_db
        .path()
        .expect("File database should have a path")
        .to_path_buf();
    f(&test_db.db, &path)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Names and ages of the people in [`populated_people`].
    pub const PEOPLE: [(&str, i64); 7] = [
        ("Lucas", 56),
        ("Clyde", 55),
        ("Mike", 52),
        ("Micheal", 52),
        ("Duke", 2),
        ("Michelle", 2),
        ("Michelangelo", 55),
    ];

    /// Creates a `people` collection holding [`PEOPLE`].
    pub fn populated_people(db: &Database) -> Collection {
        let people = db
            .new_collection("people", person_schema())
            .expect("Failed to create people collection");
        people
            .insert(PEOPLE.iter().map(|(name, age)| person(name, *age)))
            .expect("Failed to insert people");
        people
    }

    /// Starts `count` in-memory databases on one network, all joined to the
    /// first database's thread.
    pub fn peers(count: usize) -> Vec<TestDatabase> {
        let network = Arc::new(LoopbackNetwork::new());
        let first = TestDatabase::memory_on(network.clone(), "peer0");
        let thread = first.thread_id().expect("Started database has a thread");
        let mut peers = vec![first];
        for i in 1..count {
            let root: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::new());
            let identity = Identity::new(format!("peer{i}"));
            let db = Database::new(Arc::clone(&root), network.clone(), test_config());
            db.start(identity.clone(), OpenOptions::new().thread_id(thread))
                .expect("Failed to join thread");
            peers.push(TestDatabase {
                db,
                network: network.clone(),
                identity,
                root: Some(root),
                path: None,
                _temp_dir: None,
            });
        }
        peers
    }
}
