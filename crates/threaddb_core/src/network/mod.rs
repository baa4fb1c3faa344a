//! Replication collaborator interface.
//!
//! The database never talks to the network directly. It depends on a
//! [`ReplicationService`] that manages threads and logs, appends records and
//! streams records back, plus an [`EventCodec`] that turns events into record
//! bodies and back.

mod loopback;

pub use loopback::LoopbackNetwork;

use crate::cache::Memo;
use crate::codec::{from_cbor, to_cbor};
use crate::error::{CoreResult, NetworkError};
use crate::types::{Event, ThreadId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Result type for replication calls.
pub type NetworkResult<T> = Result<T, NetworkError>;

/// The identity a database acts as.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(String);

impl Identity {
    /// Creates an identity.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the identity as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An authorisation token issued for an identity.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    /// Wraps a raw token.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(..)")
    }
}

/// Sharable description of a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInfo {
    /// Thread id.
    pub id: ThreadId,
    /// Addresses other peers can join through.
    pub addrs: Vec<String>,
    /// Key material needed to read records. `None` if unavailable.
    pub key: Option<Vec<u8>>,
}

/// The log a database appends its records to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogInfo {
    /// Log id.
    pub id: String,
}

/// One replicated record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Unique record id.
    pub id: String,
    /// Thread the record belongs to.
    pub thread_id: ThreadId,
    /// Log the record was appended to.
    pub log_id: String,
    /// Encoded event.
    pub body: Vec<u8>,
}

/// Options for creating or joining a thread.
#[derive(Debug, Clone)]
pub struct ThreadOptions {
    /// Token of the calling identity.
    pub token: Token,
    /// Key material to use or expect.
    pub key: Option<Vec<u8>>,
}

/// Callback receiving inbound records.
pub type RecordCallback = Arc<dyn Fn(&Record) + Send + Sync>;

/// Handle for an inbound record subscription. Dropping it unsubscribes.
pub struct Subscription {
    closer: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wraps a function that ends the subscription.
    pub fn new(closer: impl FnOnce() + Send + 'static) -> Self {
        Self {
            closer: Some(Box::new(closer)),
        }
    }

    /// Ends the subscription.
    pub fn close(mut self) {
        self.run_closer();
    }

    fn run_closer(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_closer();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.closer.is_some())
            .finish()
    }
}

/// A remote replication service.
///
/// Implementations must be thread-safe; the event bus calls
/// `create_record` from its delivery thread.
pub trait ReplicationService: Send + Sync {
    /// Issues a token for `identity`.
    fn get_token(&self, identity: &Identity) -> NetworkResult<Token>;

    /// Creates a thread with a caller-chosen id.
    fn create_thread(&self, id: ThreadId, opts: &ThreadOptions) -> NetworkResult<ThreadInfo>;

    /// Joins an existing thread by address.
    fn add_thread(&self, addr: &str, opts: &ThreadOptions) -> NetworkResult<ThreadInfo>;

    /// Returns the description of a thread.
    fn get_thread(&self, id: ThreadId, token: &Token) -> NetworkResult<ThreadInfo>;

    /// Returns the caller's own log in a thread, creating it when
    /// `bootstrap` is set.
    fn get_own_log(&self, info: &ThreadInfo, bootstrap: bool, token: &Token) -> NetworkResult<LogInfo>;

    /// Appends a record to the caller's log.
    fn create_record(&self, thread_id: ThreadId, body: &[u8], token: &Token) -> NetworkResult<Record>;

    /// Streams records from `thread_ids` (all threads when empty).
    fn subscribe(
        &self,
        callback: RecordCallback,
        thread_ids: &[ThreadId],
        token: &Token,
    ) -> NetworkResult<Subscription>;

    /// Asks the service to sync a thread. Records arrive through
    /// subscriptions.
    fn pull_thread(&self, thread_id: ThreadId, token: &Token) -> NetworkResult<()>;
}

/// An identity plus its cached token.
pub struct Credentials {
    identity: Identity,
    token: Memo<Token>,
}

impl Credentials {
    /// Creates credentials whose token is reused for `ttl`.
    pub fn new(identity: Identity, ttl: Duration) -> Self {
        Self {
            identity,
            token: Memo::new(ttl),
        }
    }

    /// Returns the identity.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Returns a valid token, asking `network` when the cached one expired.
    pub fn token(&self, network: &dyn ReplicationService) -> NetworkResult<Token> {
        self.token
            .get_or_try_insert(|| network.get_token(&self.identity))
    }

    /// Forgets the cached token.
    pub fn invalidate(&self) {
        self.token.invalidate();
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Converts events to record bodies and back.
pub trait EventCodec: Send + Sync {
    /// Encodes an outbound event.
    fn encode(&self, event: &Event, info: &ThreadInfo) -> CoreResult<Vec<u8>>;

    /// Decodes an inbound record. Returns `None` when the thread's key
    /// material is unavailable.
    fn decode(&self, record: &Record, info: &ThreadInfo) -> CoreResult<Option<Event>>;
}

/// CBOR event bodies.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborEventCodec;

impl EventCodec for CborEventCodec {
    fn encode(&self, event: &Event, _info: &ThreadInfo) -> CoreResult<Vec<u8>> {
        to_cbor(event)
    }

    fn decode(&self, record: &Record, info: &ThreadInfo) -> CoreResult<Option<Event>> {
        if info.key.is_none() {
            return Ok(None);
        }
        from_cbor(&record.body).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::Patch;
    use crate::types::{Op, OpType};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn info(key: Option<Vec<u8>>) -> ThreadInfo {
        ThreadInfo {
            id: ThreadId::random(),
            addrs: Vec::new(),
            key,
        }
    }

    #[test]
    fn cbor_codec_roundtrip() {
        let event = Event::new(
            "people",
            vec![Op {
                collection: "people".into(),
                id: "p1".into(),
                op_type: OpType::Create,
                patch: Some(Patch::root(json!({"_id": "p1", "age": 3}))),
            }],
        );
        let info = info(Some(vec![1; 32]));
        let body = CborEventCodec.encode(&event, &info).unwrap();
        let record = Record {
            id: "r1".into(),
            thread_id: info.id,
            log_id: "log".into(),
            body,
        };
        assert_eq!(CborEventCodec.decode(&record, &info).unwrap(), Some(event));
    }

    #[test]
    fn codec_without_key_yields_none() {
        let record = Record {
            id: "r1".into(),
            thread_id: ThreadId::random(),
            log_id: "log".into(),
            body: vec![0xff],
        };
        assert_eq!(CborEventCodec.decode(&record, &info(None)).unwrap(), None);
    }

    #[test]
    fn subscription_closes_once() {
        let closed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closed);
        let sub = Subscription::new(move || {
            assert!(!flag.swap(true, Ordering::SeqCst));
        });
        sub.close();
        assert!(closed.load(Ordering::SeqCst));

        let flag = Arc::clone(&closed);
        flag.store(false, Ordering::SeqCst);
        drop(Subscription::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(closed.load(Ordering::SeqCst));
    }
}
