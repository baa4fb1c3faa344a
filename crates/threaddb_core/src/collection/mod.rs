//! Schema-validated collections.
//!
//! A [`Collection`] validates instances against its JSON schema, stores
//! them under `db/<name>` and reports every committed change to its
//! [`CollectionObserver`]. [`Document`] wraps one instance, and
//! [`ReadonlyCollection`] is the view handed to read transactions.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use threaddb_core::collection::{Collection, Query};
//! use threaddb_storage::{Datastore, InMemoryDatastore};
//!
//! let root: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::new());
//! let people = Collection::new(
//!     "people",
//!     json!({"type": "object", "properties": {"age": {"type": "integer"}}}),
//!     root,
//!     None,
//! )
//! .unwrap();
//!
//! people.save(vec![json!({"age": 7}), json!({"age": 70})]).unwrap();
//! let adults = Query::parse(&json!({"age": {"$gte": 18}})).unwrap();
//! assert_eq!(people.count(&adults).unwrap(), 1);
//! ```

mod document;
mod lock;
mod query;
mod repository;
mod schema;
mod store;

pub use document::Document;
pub use lock::{NamedMutex, NamedRwLock};
pub use query::{FindOptions, Query, SortKey};
pub use repository::{Collection, Cursor, Entry, ReadonlyCollection};
pub use schema::Schema;
pub use store::{CollectionObserver, PatchStore, Write};

/// Name of the instance id field.
pub const ID_FIELD: &str = "_id";
