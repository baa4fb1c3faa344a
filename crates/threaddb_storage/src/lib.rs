//! # threaddb Storage
//!
//! Ordered key-value datastores for threaddb.
//!
//! This crate provides the lowest-level persistence abstraction. Datastores
//! are **opaque byte stores** keyed by hierarchical [`Key`]s - they do not
//! interpret the values they hold.
//!
//! ## Design Principles
//!
//! - Keys are `/`-separated paths and iterate in lexicographic order
//! - Prefix queries are the only scan primitive
//! - Batches commit atomically
//! - Must be `Send + Sync` for concurrent access
//!
//! ## Available Datastores
//!
//! - [`InMemoryDatastore`] - For testing and ephemeral storage
//! - [`FileDatastore`] - Append-log persistence that tolerates torn writes
//! - [`NamespacedDatastore`] - A prefix-scoped view over another datastore
//!
//! ## Example
//!
//! ```rust
//! use threaddb_storage::{Datastore, InMemoryDatastore, Key};
//!
//! let store = InMemoryDatastore::new();
//! store.open().unwrap();
//! store.put(&Key::new("/greeting"), b"hello".to_vec()).unwrap();
//! assert_eq!(store.get(&Key::new("/greeting")).unwrap(), Some(b"hello".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod key;
mod memory;
mod namespace;

pub use backend::{Batch, BatchOp, Datastore, Entry, Query, QueryIter};
pub use error::{StorageError, StorageResult};
pub use file::FileDatastore;
pub use key::Key;
pub use memory::InMemoryDatastore;
pub use namespace::NamespacedDatastore;
