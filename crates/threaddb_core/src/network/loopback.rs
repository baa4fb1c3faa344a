//! In-process replication service.

use super::{
    Identity, LogInfo, NetworkResult, Record, RecordCallback, ReplicationService, Subscription,
    ThreadInfo, ThreadOptions, Token,
};
use crate::error::NetworkError;
use crate::types::{new_id, ThreadId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

const ADDR_PREFIX: &str = "/loopback/thread/";

struct Subscriber {
    id: u64,
    identity: Identity,
    threads: Vec<ThreadId>,
    callback: RecordCallback,
}

impl Subscriber {
    fn wants(&self, thread_id: ThreadId) -> bool {
        self.threads.is_empty() || self.threads.contains(&thread_id)
    }
}

#[derive(Default)]
struct Registry {
    tokens: HashMap<Token, Identity>,
    threads: HashMap<ThreadId, ThreadInfo>,
    logs: HashMap<(ThreadId, Identity), LogInfo>,
    records: HashMap<ThreadId, Vec<Record>>,
}

/// A replication service shared by databases in one process.
///
/// Records are delivered synchronously to every matching subscriber,
/// including the one belonging to the writer. Several databases sharing one
/// `LoopbackNetwork` behave like peers replicating through a remote service.
#[derive(Default)]
pub struct LoopbackNetwork {
    registry: Mutex<Registry>,
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
    next_subscriber: AtomicU64,
    failures: AtomicU32,
    attempts: AtomicU64,
}

impl LoopbackNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` `create_record` calls fail with a retryable error.
    pub fn fail_next_records(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Returns how many times `create_record` was called.
    pub fn record_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Returns the records stored for a thread.
    pub fn records(&self, thread_id: ThreadId) -> Vec<Record> {
        self.registry
            .lock()
            .records
            .get(&thread_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn identity(&self, token: &Token) -> NetworkResult<Identity> {
        self.registry
            .lock()
            .tokens
            .get(token)
            .cloned()
            .ok_or_else(|| NetworkError::Unauthorized("unknown token".into()))
    }

    fn address(id: ThreadId) -> String {
        format!("{ADDR_PREFIX}{id}")
    }

    fn deliver(&self, record: &Record, only: Option<&Identity>) {
        // Callbacks run without holding any lock so they may call back in.
        let targets: Vec<RecordCallback> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| s.wants(record.thread_id))
            .filter(|s| only.map_or(true, |identity| &s.identity == identity))
            .map(|s| Arc::clone(&s.callback))
            .collect();
        for callback in targets {
            callback(record);
        }
    }
}

impl std::fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackNetwork")
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

impl ReplicationService for LoopbackNetwork {
    fn get_token(&self, identity: &Identity) -> NetworkResult<Token> {
        if identity.as_str().is_empty() {
            return Err(NetworkError::Unauthorized("empty identity".into()));
        }
        let token = Token::new(format!("{identity}:{}", new_id()));
        self.registry
            .lock()
            .tokens
            .insert(token.clone(), identity.clone());
        Ok(token)
    }

    fn create_thread(&self, id: ThreadId, opts: &ThreadOptions) -> NetworkResult<ThreadInfo> {
        self.identity(&opts.token)?;
        let mut registry = self.registry.lock();
        let info = registry
            .threads
            .entry(id)
            .or_insert_with(|| ThreadInfo {
                id,
                addrs: vec![Self::address(id)],
                key: Some(
                    opts.key
                        .clone()
                        .unwrap_or_else(|| (0..32).map(|_| rand::random::<u8>()).collect()),
                ),
            })
            .clone();
        debug!(thread = %id, "thread created");
        Ok(info)
    }

    fn add_thread(&self, addr: &str, opts: &ThreadOptions) -> NetworkResult<ThreadInfo> {
        self.identity(&opts.token)?;
        let id: ThreadId = addr
            .strip_prefix(ADDR_PREFIX)
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| NetworkError::Service(format!("invalid address {addr}")))?;
        let registry = self.registry.lock();
        let info = registry
            .threads
            .get(&id)
            .ok_or_else(|| NetworkError::ThreadNotFound(id.to_string()))?;
        if opts.key.as_ref().is_some_and(|key| info.key.as_ref() != Some(key)) {
            return Err(NetworkError::Unauthorized("thread key mismatch".into()));
        }
        Ok(info.clone())
    }

    fn get_thread(&self, id: ThreadId, token: &Token) -> NetworkResult<ThreadInfo> {
        self.identity(token)?;
        self.registry
            .lock()
            .threads
            .get(&id)
            .cloned()
            .ok_or_else(|| NetworkError::ThreadNotFound(id.to_string()))
    }

    fn get_own_log(&self, info: &ThreadInfo, bootstrap: bool, token: &Token) -> NetworkResult<LogInfo> {
        let identity = self.identity(token)?;
        let mut registry = self.registry.lock();
        if !registry.threads.contains_key(&info.id) {
            return Err(NetworkError::ThreadNotFound(info.id.to_string()));
        }
        let slot = (info.id, identity);
        if let Some(log) = registry.logs.get(&slot) {
            return Ok(log.clone());
        }
        if !bootstrap {
            return Err(NetworkError::Service("no own log in thread".into()));
        }
        let log = LogInfo { id: new_id() };
        registry.logs.insert(slot, log.clone());
        Ok(log)
    }

    fn create_record(&self, thread_id: ThreadId, body: &[u8], token: &Token) -> NetworkResult<Record> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(NetworkError::transport_retryable("injected failure"));
        }

        let identity = self.identity(token)?;
        let record = {
            let mut registry = self.registry.lock();
            if !registry.threads.contains_key(&thread_id) {
                return Err(NetworkError::ThreadNotFound(thread_id.to_string()));
            }
            let log_id = registry
                .logs
                .entry((thread_id, identity))
                .or_insert_with(|| LogInfo { id: new_id() })
                .id
                .clone();
            let record = Record {
                id: new_id(),
                thread_id,
                log_id,
                body: body.to_vec(),
            };
            registry
                .records
                .entry(thread_id)
                .or_default()
                .push(record.clone());
            record
        };

        self.deliver(&record, None);
        Ok(record)
    }

    fn subscribe(
        &self,
        callback: RecordCallback,
        thread_ids: &[ThreadId],
        token: &Token,
    ) -> NetworkResult<Subscription> {
        let identity = self.identity(token)?;
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push(Subscriber {
            id,
            identity,
            threads: thread_ids.to_vec(),
            callback,
        });

        let subscribers = Arc::clone(&self.subscribers);
        Ok(Subscription::new(move || {
            subscribers.write().retain(|s| s.id != id);
        }))
    }

    fn pull_thread(&self, thread_id: ThreadId, token: &Token) -> NetworkResult<()> {
        let identity = self.identity(token)?;
        let records = self.records(thread_id);
        debug!(thread = %thread_id, records = records.len(), "pulling thread");
        for record in &records {
            self.deliver(record, Some(&identity));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(network: &LoopbackNetwork, name: &str) -> Token {
        network.get_token(&Identity::new(name)).unwrap()
    }

    #[test]
    fn threads_and_logs() {
        let network = LoopbackNetwork::new();
        let token = setup(&network, "alice");
        let id = ThreadId::random();
        let opts = ThreadOptions {
            token: token.clone(),
            key: None,
        };
        let info = network.create_thread(id, &opts).unwrap();
        assert!(info.key.is_some());
        assert_eq!(network.get_thread(id, &token).unwrap(), info);
        assert_eq!(network.add_thread(&info.addrs[0], &opts).unwrap(), info);

        assert!(network.get_own_log(&info, false, &token).is_err());
        let log = network.get_own_log(&info, true, &token).unwrap();
        assert_eq!(network.get_own_log(&info, false, &token).unwrap(), log);

        let bob = setup(&network, "bob");
        assert_ne!(network.get_own_log(&info, true, &bob).unwrap(), log);
    }

    #[test]
    fn unknown_tokens_and_threads() {
        let network = LoopbackNetwork::new();
        assert!(network.get_token(&Identity::new("")).is_err());
        let bogus = Token::new("nope");
        assert!(matches!(
            network.get_thread(ThreadId::random(), &bogus),
            Err(NetworkError::Unauthorized(_))
        ));
        let token = setup(&network, "alice");
        assert!(matches!(
            network.get_thread(ThreadId::random(), &token),
            Err(NetworkError::ThreadNotFound(_))
        ));
        let opts = ThreadOptions { token, key: None };
        assert!(network.add_thread("garbage", &opts).is_err());
    }

    #[test]
    fn records_fan_out_and_unsubscribe() {
        let network = LoopbackNetwork::new();
        let token = setup(&network, "alice");
        let id = ThreadId::random();
        network
            .create_thread(id, &ThreadOptions { token: token.clone(), key: None })
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = network
            .subscribe(
                Arc::new(move |r: &Record| sink.lock().push(r.body.clone())),
                &[id],
                &token,
            )
            .unwrap();

        network.create_record(id, b"one", &token).unwrap();
        sub.close();
        network.create_record(id, b"two", &token).unwrap();

        assert_eq!(*seen.lock(), vec![b"one".to_vec()]);
        assert_eq!(network.records(id).len(), 2);
        assert_eq!(network.subscriber_count(), 0);
    }

    #[test]
    fn injected_failures_are_retryable() {
        let network = LoopbackNetwork::new();
        let token = setup(&network, "alice");
        let id = ThreadId::random();
        network
            .create_thread(id, &ThreadOptions { token: token.clone(), key: None })
            .unwrap();

        network.fail_next_records(2);
        for _ in 0..2 {
            let err = network.create_record(id, b"x", &token).unwrap_err();
            assert!(err.is_retryable());
        }
        assert!(network.create_record(id, b"x", &token).is_ok());
        assert_eq!(network.record_attempts(), 3);
    }

    #[test]
    fn pull_redelivers_to_caller_only() {
        let network = LoopbackNetwork::new();
        let alice = setup(&network, "alice");
        let bob = setup(&network, "bob");
        let id = ThreadId::random();
        network
            .create_thread(id, &ThreadOptions { token: alice.clone(), key: None })
            .unwrap();
        network.create_record(id, b"early", &alice).unwrap();

        let counts: Vec<Arc<Mutex<usize>>> = (0..2).map(|_| Arc::new(Mutex::new(0))).collect();
        let mut subs = Vec::new();
        for (token, count) in [(&alice, &counts[0]), (&bob, &counts[1])] {
            let count = Arc::clone(count);
            subs.push(
                network
                    .subscribe(Arc::new(move |_: &Record| *count.lock() += 1), &[], token)
                    .unwrap(),
            );
        }

        network.pull_thread(id, &bob).unwrap();
        assert_eq!(*counts[0].lock(), 0);
        assert_eq!(*counts[1].lock(), 1);
    }
}
