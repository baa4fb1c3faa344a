//! Durable FIFO job queue.
//!
//! Jobs are persisted under `/<job id>` in the backing datastore before they
//! become visible to the consumer. A window of at most `batch_size` jobs is
//! held in memory; when it runs dry and jobs remain on disk, the next batch
//! is hydrated from the datastore in key order.
//!
//! Exactly one job is in flight at a time. The consumer receives it as a
//! [`QueueEvent::Next`] and must answer with [`Queue::done`] (or
//! [`Queue::abort`]) before the queue advances.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use threaddb_core::queue::{Queue, QueueEvent};
//! use threaddb_storage::{Datastore, InMemoryDatastore};
//!
//! let store: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::new());
//! let queue: Queue<String> = Queue::new(store, 10);
//! let events = queue.subscribe();
//!
//! queue.open().unwrap();
//! queue.push("hello".to_string(), None).unwrap();
//! queue.start().unwrap();
//!
//! let next = events.try_iter().find_map(QueueEvent::into_job).unwrap();
//! assert_eq!(next.job, "hello");
//! queue.done(false).unwrap();
//! assert_eq!(queue.len(), 0);
//! ```

mod events;

pub use events::{Job, QueueEvent};

use crate::codec::{from_cbor, to_cbor};
use crate::error::{CoreError, CoreResult};
use crate::types::new_id;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use threaddb_storage::{Datastore, Key, Query};
use tracing::{debug, warn};

struct State<T> {
    open: bool,
    running: bool,
    empty: bool,
    in_flight: bool,
    length: usize,
    window: VecDeque<Job<T>>,
}

impl<T> Default for State<T> {
    fn default() -> Self {
        Self {
            open: false,
            running: false,
            empty: false,
            in_flight: false,
            length: 0,
            window: VecDeque::new(),
        }
    }
}

/// A durable FIFO queue of serializable jobs.
pub struct Queue<T> {
    store: Arc<dyn Datastore>,
    batch_size: usize,
    state: Mutex<State<T>>,
    subscribers: RwLock<Vec<Sender<QueueEvent<T>>>>,
}

impl<T> Queue<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    /// Creates a closed queue over `store`.
    pub fn new(store: Arc<dyn Datastore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            state: Mutex::new(State::default()),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribes to queue notifications.
    pub fn subscribe(&self) -> Receiver<QueueEvent<T>> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    fn emit(&self, event: QueueEvent<T>) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn key(id: &str) -> Key {
        Key::root().child(id)
    }

    /// Opens the datastore, counts persisted jobs and hydrates the first
    /// batch. Returns the hydrated jobs.
    pub fn open(&self) -> CoreResult<Vec<Job<T>>> {
        let mut state = self.state.lock();
        self.store.open()?;
        let length = self.store.query(&Query::all().keys_only())?.count();

        state.open = true;
        state.length = length;
        state.window.clear();
        state.in_flight = false;
        self.hydrate(&mut state);
        state.empty = state.window.is_empty();
        debug!(length, hydrated = state.window.len(), "queue opened");

        self.emit(QueueEvent::Open);
        Ok(state.window.iter().cloned().collect())
    }

    /// Stops processing, drops the in-memory window and closes the datastore.
    pub fn close(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Ok(());
        }
        if state.running {
            state.running = false;
            self.emit(QueueEvent::Stop);
        }
        state.open = false;
        state.in_flight = false;
        state.window.clear();
        self.store.close()?;
        self.emit(QueueEvent::Close);
        Ok(())
    }

    /// Persists a job and returns its id. A fresh id is generated when `id`
    /// is `None`.
    ///
    /// If the queue was empty and is running, the job is handed to the
    /// consumer immediately.
    pub fn push(&self, job: T, id: Option<String>) -> CoreResult<String> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;

        let id = id.unwrap_or_else(new_id);
        self.store.put(&Self::key(&id), to_cbor(&job)?)?;
        state.length += 1;
        self.emit(QueueEvent::Push(id.clone()));

        if state.empty {
            state.empty = false;
            self.trigger_next(&mut state);
        }
        Ok(id)
    }

    /// Starts handing jobs to the consumer.
    pub fn start(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        state.running = true;
        self.emit(QueueEvent::Start);
        self.trigger_next(&mut state);
        Ok(())
    }

    /// Stops handing jobs to the consumer. The window and persisted jobs are
    /// kept; the head job is offered again after the next `start`.
    pub fn stop(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        state.running = false;
        state.in_flight = false;
        self.emit(QueueEvent::Stop);
        Ok(())
    }

    /// Gives up on the in-flight job without losing its position.
    pub fn abort(&self) -> CoreResult<()> {
        self.stop()
    }

    /// Completes the in-flight job.
    ///
    /// With `skip == false` the job is removed from disk. With `skip == true`
    /// it only leaves the in-memory window and is offered again on a later
    /// hydration pass, behind the jobs already in the window.
    ///
    /// Returns false if no job was in flight.
    pub fn done(&self, skip: bool) -> CoreResult<bool> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if !state.in_flight {
            return Ok(false);
        }
        state.in_flight = false;

        if let Some(head) = state.window.pop_front() {
            if skip {
                debug!(id = %head.id, "job skipped");
            } else if let Err(e) = self.remove_persisted(&mut state, &head.id) {
                warn!(id = %head.id, error = %e, "failed to remove completed job");
                self.emit(QueueEvent::Error(e.to_string()));
            }
        }
        self.trigger_next(&mut state);
        Ok(true)
    }

    /// Removes a job wherever it is. Returns false if it did not exist.
    pub fn delete(&self, id: &str) -> CoreResult<bool> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;

        // The in-flight head stays in the window until the consumer calls
        // `done`, which then finds it already gone from disk.
        let head_in_flight = state.in_flight && state.window.front().is_some_and(|j| j.id == id);
        let in_window = state.window.iter().position(|j| j.id == id);
        if let (Some(index), false) = (in_window, head_in_flight) {
            state.window.remove(index);
        }

        match self.remove_persisted(&mut state, id) {
            Ok(removed) => Ok(removed || in_window.is_some()),
            Err(e) => {
                self.emit(QueueEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Returns true if a job with `id` is persisted.
    pub fn has(&self, id: &str) -> CoreResult<bool> {
        let state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.window.iter().any(|j| j.id == id) {
            return Ok(true);
        }
        Ok(self.store.has(&Self::key(id))?)
    }

    /// Returns the ids of every persisted job whose payload equals `job`.
    pub fn get_job_ids(&self, job: &T) -> CoreResult<Vec<String>> {
        let state = self.state.lock();
        Self::ensure_open(&state)?;
        let needle = to_cbor(job)?;
        self.search(&needle, usize::MAX)
    }

    /// Returns the id of the first job whose payload equals `job`.
    pub fn get_first_job_id(&self, job: &T) -> CoreResult<Option<String>> {
        let state = self.state.lock();
        Self::ensure_open(&state)?;
        let needle = to_cbor(job)?;

        for entry in &state.window {
            if to_cbor(&entry.job)? == needle {
                return Ok(Some(entry.id.clone()));
            }
        }
        Ok(self.search(&needle, 1)?.into_iter().next())
    }

    /// Returns the number of persisted jobs not yet done.
    pub fn len(&self) -> usize {
        self.state.lock().length
    }

    /// Returns true if no jobs are persisted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the queue is open.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Returns true if the queue is handing out jobs.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    #[cfg(test)]
    fn window_len(&self) -> usize {
        self.state.lock().window.len()
    }

    fn ensure_open(state: &State<T>) -> CoreResult<()> {
        if state.open {
            Ok(())
        } else {
            Err(CoreError::not_open("queue"))
        }
    }

    fn search(&self, needle: &[u8], limit: usize) -> CoreResult<Vec<String>> {
        let result: CoreResult<Vec<String>> = (|| {
            let mut ids = Vec::new();
            for entry in self.store.query(&Query::all())? {
                let entry = entry?;
                if entry.value == needle {
                    ids.push(entry.key.name().to_owned());
                    if ids.len() >= limit {
                        break;
                    }
                }
            }
            Ok(ids)
        })();
        if let Err(e) = &result {
            self.emit(QueueEvent::Error(e.to_string()));
        }
        result
    }

    fn remove_persisted(&self, state: &mut State<T>, id: &str) -> CoreResult<bool> {
        let key = Self::key(id);
        if !self.store.has(&key)? {
            return Ok(false);
        }
        self.store.delete(&key)?;
        state.length = state.length.saturating_sub(1);
        Ok(true)
    }

    /// Loads the next batch of persisted jobs into the window.
    fn hydrate(&self, state: &mut State<T>) {
        let query = Query::all().with_limit(self.batch_size);
        let entries = match self.store.query(&query) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "queue hydration failed");
                self.emit(QueueEvent::Error(e.to_string()));
                return;
            }
        };
        for entry in entries {
            let decoded = entry
                .map_err(CoreError::from)
                .and_then(|entry| Ok((entry.key.name().to_owned(), from_cbor(&entry.value)?)));
            match decoded {
                Ok((id, job)) => state.window.push_back(Job { id, job }),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable job");
                    self.emit(QueueEvent::Error(e.to_string()));
                }
            }
        }
        debug!(hydrated = state.window.len(), "queue window hydrated");
    }

    fn trigger_next(&self, state: &mut State<T>) {
        if !state.running || state.empty || state.in_flight {
            return;
        }
        if state.window.is_empty() && state.length > 0 {
            self.hydrate(state);
        }
        match state.window.front() {
            Some(head) => {
                state.in_flight = true;
                self.emit(QueueEvent::Next(head.clone()));
            }
            None => {
                state.empty = true;
                self.emit(QueueEvent::Empty);
            }
        }
    }
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Queue")
            .field("open", &state.open)
            .field("running", &state.running)
            .field("length", &state.length)
            .field("window", &state.window.len())
            .finish()
    }
}
