//! # threaddb Core
//!
//! Local-first collections replicated through append-only threads.
//!
//! This crate provides:
//! - [`Collection`]s of JSON instances validated against a JSON schema,
//!   with Mongo-style queries and read/write transactions
//! - A durable FIFO [`Queue`] persisted in a [`Datastore`] partition
//! - An [`EventBus`] that delivers local mutations to a
//!   [`ReplicationService`] with backoff and relays inbound records
//! - A [`Database`] that wires collections, the event bus and a wildcard
//!   update [`Emitter`] to one replication thread
//!
//! ## Write path
//!
//! 1. A collection commits a batch to its `/db/<name>` partition
//! 2. Each changed instance yields an [`Op`] carrying a JSON patch
//! 3. Ops are emitted locally as `<collection>.<id>.<type>` and queued as
//!    one encoded [`Event`] on the event bus
//! 4. The event bus appends the event to the thread as a record
//!
//! Remote records travel the opposite way: the [`Dispatcher`] persists the
//! event and reduces it into the matching collection exactly once.
//!
//! ## Key Invariants
//!
//! - A write is done once it is persisted locally; replication failures
//!   never reach the writer
//! - Outbound events are delivered in queue order, except that an event
//!   exhausting its retries is deferred to the next hydration pass
//! - Records from the database's own log are never re-applied
//!
//! [`Datastore`]: threaddb_storage::Datastore

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod codec;
pub mod collection;
mod config;
mod database;
mod dispatcher;
mod emitter;
mod error;
mod eventbus;
pub mod network;
mod patch;
pub mod queue;
mod types;

pub use cache::Memo;
pub use codec::{from_cbor, from_json, to_cbor, to_json};
pub use collection::{
    Collection, CollectionObserver, Cursor, Document, Entry, FindOptions, NamedMutex, NamedRwLock,
    PatchStore, Query, ReadonlyCollection, Schema, SortKey, Write, ID_FIELD,
};
pub use config::{Config, RetryConfig, DEFAULT_DELIVERY_ATTEMPTS, DEFAULT_QUEUE_BATCH_SIZE};
pub use database::{CollectionConfig, Database, OpenOptions};
pub use dispatcher::{Dispatcher, Reducer};
pub use emitter::{Emitter, ListenerId};
pub use error::{CoreError, CoreResult, NetworkError, ValidationFailure};
pub use eventbus::{EventBus, EventJob};
pub use network::{
    CborEventCodec, Credentials, EventCodec, Identity, LogInfo, LoopbackNetwork, Record,
    ReplicationService, Subscription, ThreadInfo, ThreadOptions, Token,
};
pub use patch::{Patch, PatchOp};
pub use queue::{Job, Queue, QueueEvent};
pub use types::{new_id, Event, Op, OpType, ThreadId, Update};
