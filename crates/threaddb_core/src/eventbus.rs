//! Outbound replication and inbound record relay.
//!
//! The event bus owns a [`Queue`] of encoded events. A delivery thread
//! drains it one job at a time, calling
//! [`ReplicationService::create_record`] with exponential backoff. A job
//! that still fails after the last attempt is skipped: it stays on disk and
//! is offered again on a later hydration pass.
//!
//! Inbound records from the replication service are re-emitted to
//! listeners registered with [`EventBus::on_record`].

use crate::config::RetryConfig;
use crate::emitter::{Emitter, ListenerId};
use crate::error::{CoreError, CoreResult};
use crate::network::{Credentials, Record, ReplicationService, Subscription};
use crate::queue::{Job, Queue, QueueEvent};
use crate::types::ThreadId;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use threaddb_storage::Datastore;
use tracing::{debug, error, info, warn};

const RECORD: &str = "record";

/// An outbound event waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventJob {
    /// Target thread, as its string form.
    pub thread_id: String,
    /// Encoded event body.
    pub body: Vec<u8>,
}

/// Wakes the delivery thread out of a backoff sleep.
#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    fn stop(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }

    fn reset(&self) {
        *self.stopped.lock() = false;
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleeps for `duration` or until stopped. Returns true if stopped.
    fn sleep(&self, duration: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped && !duration.is_zero() {
            self.cond.wait_for(&mut stopped, duration);
        }
        *stopped
    }
}

struct Running {
    worker: JoinHandle<()>,
    subscription: Subscription,
}

/// Bridge between the local job queue and the replication service.
pub struct EventBus {
    queue: Arc<Queue<EventJob>>,
    network: Arc<dyn ReplicationService>,
    retry: RetryConfig,
    records: Arc<Emitter<Record>>,
    signal: Arc<StopSignal>,
    running: Mutex<Option<Running>>,
}

impl EventBus {
    /// Creates a stopped event bus whose queue lives in `store`.
    pub fn new(
        store: Arc<dyn Datastore>,
        network: Arc<dyn ReplicationService>,
        retry: RetryConfig,
        batch_size: usize,
    ) -> Self {
        Self {
            queue: Arc::new(Queue::new(store, batch_size)),
            network,
            retry,
            records: Arc::new(Emitter::new()),
            signal: Arc::new(StopSignal::default()),
            running: Mutex::new(None),
        }
    }

    /// Returns the underlying queue.
    pub fn queue(&self) -> &Arc<Queue<EventJob>> {
        &self.queue
    }

    /// Returns true if the delivery thread is running.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Opens the queue, starts delivery and subscribes to inbound records
    /// for `thread_id` (all threads if `None`).
    pub fn start(&self, thread_id: Option<ThreadId>, credentials: Arc<Credentials>) -> CoreResult<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(CoreError::invalid_operation("event bus already started"));
        }

        let token = credentials.token(self.network.as_ref())?;
        self.signal.reset();
        self.queue.open()?;
        let events = self.queue.subscribe();

        let worker = {
            let delivery = Delivery {
                queue: Arc::clone(&self.queue),
                network: Arc::clone(&self.network),
                credentials,
                retry: self.retry.clone(),
                signal: Arc::clone(&self.signal),
            };
            std::thread::Builder::new()
                .name("threaddb-eventbus".into())
                .spawn(move || delivery.run(events))
                .map_err(|e| CoreError::invalid_operation(format!("spawn delivery thread: {e}")))?
        };

        let records = Arc::clone(&self.records);
        let threads: Vec<ThreadId> = thread_id.into_iter().collect();
        let subscription = self.network.subscribe(
            Arc::new(move |record: &Record| {
                records.emit(RECORD, record);
            }),
            &threads,
            &token,
        );
        let subscription = match subscription {
            Ok(subscription) => subscription,
            Err(e) => {
                self.shutdown(worker);
                return Err(e.into());
            }
        };

        if let Err(e) = self.queue.start() {
            self.shutdown(worker);
            return Err(e);
        }
        info!(thread = ?thread_id, pending = self.queue.len(), "event bus started");
        *running = Some(Running {
            worker,
            subscription,
        });
        Ok(())
    }

    /// Unsubscribes from records, stops delivery and closes the queue.
    pub fn stop(&self) -> CoreResult<()> {
        let Some(Running {
            worker,
            subscription,
        }) = self.running.lock().take()
        else {
            return Ok(());
        };
        subscription.close();
        self.shutdown(worker);
        info!("event bus stopped");
        Ok(())
    }

    fn shutdown(&self, worker: JoinHandle<()>) {
        self.signal.stop();
        if let Err(e) = self.queue.close() {
            warn!(error = %e, "failed to close event queue");
        }
        if worker.join().is_err() {
            error!("event bus delivery thread panicked");
        }
    }

    /// Queues an event for delivery and returns its job id.
    pub fn push(&self, job: EventJob) -> CoreResult<String> {
        self.queue.push(job, None)
    }

    /// Registers a listener for inbound records.
    pub fn on_record<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&Record) + Send + Sync + 'static,
    {
        self.records.on(RECORD, move |_, record| callback(record))
    }

    /// Removes a record listener.
    pub fn off_record(&self, id: ListenerId) -> bool {
        self.records.off(id)
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "failed to stop event bus");
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("queue", &self.queue)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// State owned by the delivery thread.
struct Delivery {
    queue: Arc<Queue<EventJob>>,
    network: Arc<dyn ReplicationService>,
    credentials: Arc<Credentials>,
    retry: RetryConfig,
    signal: Arc<StopSignal>,
}

enum Outcome {
    Delivered,
    Failed,
    Stopped,
}

impl Delivery {
    fn run(self, events: Receiver<QueueEvent<EventJob>>) {
        for event in events {
            match event {
                QueueEvent::Next(job) => self.handle(job),
                QueueEvent::Error(message) => warn!(%message, "event queue error"),
                QueueEvent::Close => break,
                _ => {}
            }
        }
        debug!("delivery thread exiting");
    }

    fn handle(&self, job: Job<EventJob>) {
        let skip = match job.job.thread_id.parse::<ThreadId>() {
            Err(e) => {
                error!(id = %job.id, error = %e, "dropping job with malformed thread id");
                false
            }
            Ok(thread_id) => match self.deliver(thread_id, &job) {
                Outcome::Delivered => false,
                Outcome::Failed => true,
                Outcome::Stopped => return,
            },
        };
        if let Err(e) = self.queue.done(skip) {
            debug!(id = %job.id, error = %e, "queue closed before job completed");
        }
    }

    fn deliver(&self, thread_id: ThreadId, job: &Job<EventJob>) -> Outcome {
        for attempt in 0..self.retry.max_attempts {
            if self.signal.sleep(self.retry.delay_for_attempt(attempt)) {
                return Outcome::Stopped;
            }
            let result = self
                .credentials
                .token(self.network.as_ref())
                .and_then(|token| self.network.create_record(thread_id, &job.job.body, &token));
            match result {
                Ok(record) => {
                    debug!(id = %job.id, record = %record.id, "event delivered");
                    return Outcome::Delivered;
                }
                Err(e) if e.is_retryable() => {
                    warn!(id = %job.id, attempt = attempt + 1, error = %e, "delivery failed");
                }
                Err(e) => {
                    warn!(id = %job.id, error = %e, "delivery failed permanently");
                    break;
                }
            }
        }
        if self.signal.is_stopped() {
            return Outcome::Stopped;
        }
        warn!(id = %job.id, "skipping job after exhausting retries");
        Outcome::Failed
    }
}
