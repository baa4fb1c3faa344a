//! Queue jobs and notifications.

use serde::{Deserialize, Serialize};

/// A job held by the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job<T> {
    /// Unique, sortable job id. Also the datastore key.
    pub id: String,
    /// Opaque payload.
    pub job: T,
}

/// Notification emitted by a [`Queue`](super::Queue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent<T> {
    /// The queue was opened and hydrated.
    Open,
    /// A job was persisted. Carries the job id.
    Push(String),
    /// Processing was started.
    Start,
    /// Processing was stopped.
    Stop,
    /// The head job is ready for the consumer.
    Next(Job<T>),
    /// No jobs remain. Emitted once per transition into the empty state.
    Empty,
    /// A datastore failure occurred while hydrating, searching or removing.
    Error(String),
    /// The queue was closed.
    Close,
}

impl<T> QueueEvent<T> {
    /// Returns the job if this is a `Next` event.
    pub fn into_job(self) -> Option<Job<T>> {
        match self {
            QueueEvent::Next(job) => Some(job),
            _ => None,
        }
    }
}
