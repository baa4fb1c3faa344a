//! Core type definitions for threaddb.

use crate::error::{CoreError, CoreResult};
use crate::patch::Patch;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::{Generator, Ulid};
use uuid::Uuid;

static ID_GENERATOR: Mutex<Generator> = Mutex::new(Generator::new());

/// Returns a fresh, lexicographically sortable unique identifier.
///
/// Identifiers produced by one process are strictly increasing, so datastore
/// keys built from them iterate in creation order.
pub fn new_id() -> String {
    let mut generator = ID_GENERATOR.lock();
    generator
        .generate()
        .unwrap_or_else(|_| Ulid::new())
        .to_string()
}

/// Identifier of a replication thread.
///
/// Thread IDs are 128-bit UUIDs that are:
/// - Unique per replicated log set
/// - Immutable once assigned
/// - Persisted under `meta/threadid`
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThreadId([u8; 16]);

impl ThreadId {
    /// Creates a thread ID from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Creates a new random thread ID.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Converts to a UUID.
    #[must_use]
    pub fn to_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.0)
    }

    /// Creates a thread ID from a slice.
    ///
    /// Returns `None` if the slice is not exactly 16 bytes.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        <[u8; 16]>::try_from(slice).ok().map(Self)
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadId({})", self.to_uuid().simple())
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uuid().simple())
    }
}

impl FromStr for ThreadId {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        Uuid::parse_str(s)
            .map(|uuid| Self(uuid.into_bytes()))
            .map_err(|e| CoreError::codec(format!("invalid thread id {s:?}: {e}")))
    }
}

impl From<Uuid> for ThreadId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.into_bytes())
    }
}

/// Kind of mutation applied to one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    /// The instance did not exist before.
    Create,
    /// An existing instance was changed.
    Save,
    /// The instance was removed.
    Delete,
}

impl OpType {
    /// Returns the name used in event paths.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            OpType::Create => "Create",
            OpType::Save => "Save",
            OpType::Delete => "Delete",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One mutation of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    /// Owning collection.
    pub collection: String,
    /// Instance id.
    pub id: String,
    /// Kind of mutation.
    #[serde(rename = "type")]
    pub op_type: OpType,
    /// Changes to apply. `None` for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<Patch>,
}

/// A mutation as delivered to local listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    /// Owning collection.
    pub collection: String,
    /// Instance id.
    pub id: String,
    /// Kind of mutation.
    pub op_type: OpType,
    /// Changes that were applied.
    pub patch: Option<Patch>,
    /// Whether the mutation arrived from a remote peer.
    pub remote: bool,
}

impl Update {
    /// Builds an update from an op.
    #[must_use]
    pub fn from_op(op: &Op, remote: bool) -> Self {
        Self {
            collection: op.collection.clone(),
            id: op.id.clone(),
            op_type: op.op_type,
            patch: op.patch.clone(),
            remote,
        }
    }

    /// Returns the hierarchical event path `<collection>.<id>.<type>`.
    #[must_use]
    pub fn path(&self) -> String {
        format!("{}.{}.{}", self.collection, self.id, self.op_type)
    }
}

/// A batch of ops against one collection, as replicated between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Target collection.
    pub collection: String,
    /// Ops in application order.
    pub ops: Vec<Op>,
    /// Creation time in Unix milliseconds.
    pub timestamp: u64,
}

impl Event {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(collection: impl Into<String>, ops: Vec<Op>) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            collection: collection.into(),
            ops,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let ids: Vec<String> = (0..100).map(|_| new_id()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn thread_id_parse_roundtrip() {
        let id = ThreadId::random();
        let parsed: ThreadId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-thread".parse::<ThreadId>().is_err());
    }

    #[test]
    fn thread_id_from_slice() {
        assert!(ThreadId::from_slice(&[0u8; 16]).is_some());
        assert!(ThreadId::from_slice(&[0u8; 15]).is_none());
    }

    #[test]
    fn update_path() {
        let op = Op {
            collection: "people".into(),
            id: "p1".into(),
            op_type: OpType::Save,
            patch: None,
        };
        assert_eq!(Update::from_op(&op, false).path(), "people.p1.Save");
    }
}
