//! Integration tests for queue durability over a file datastore.

use std::sync::Arc;
use tempfile::TempDir;
use threaddb_core::queue::{Queue, QueueEvent};
use threaddb_storage::{Datastore, FileDatastore};

fn file_queue(dir: &TempDir, batch_size: usize) -> Queue<String> {
    let store: Arc<dyn Datastore> = Arc::new(FileDatastore::new(&dir.path().join("queue.log")));
    Queue::new(store, batch_size)
}

#[test]
fn pending_jobs_survive_reopen_in_order() {
    let dir = TempDir::new().unwrap();
    let queue = file_queue(&dir, 2);
    queue.open().unwrap();
    for job in ["a", "b", "c", "d"] {
        queue.push(job.to_string(), None).unwrap();
    }

    let events = queue.subscribe();
    queue.start().unwrap();
    let first = events.try_iter().find_map(QueueEvent::into_job).unwrap();
    assert_eq!(first.job, "a");
    queue.done(false).unwrap();
    queue.close().unwrap();

    let queue = file_queue(&dir, 2);
    let hydrated = queue.open().unwrap();
    assert_eq!(queue.len(), 3);
    let jobs: Vec<_> = hydrated.into_iter().map(|j| j.job).collect();
    assert_eq!(jobs, vec!["b", "c"]);

    let events = queue.subscribe();
    queue.start().unwrap();
    let mut seen = Vec::new();
    while let Some(job) = events.try_iter().find_map(QueueEvent::into_job) {
        seen.push(job.job);
        queue.done(false).unwrap();
    }
    assert_eq!(seen, vec!["b", "c", "d"]);
    assert!(queue.is_empty());
    queue.close().unwrap();
}

#[test]
fn skipped_jobs_are_offered_again() {
    let dir = TempDir::new().unwrap();
    let queue = file_queue(&dir, 10);
    queue.open().unwrap();
    let events = queue.subscribe();
    for job in ["a", "b"] {
        queue.push(job.to_string(), None).unwrap();
    }
    queue.start().unwrap();

    let head = events.try_iter().find_map(QueueEvent::into_job).unwrap();
    assert_eq!(head.job, "a");
    queue.done(true).unwrap();
    assert_eq!(queue.len(), 2);

    let mut seen = Vec::new();
    while let Some(job) = events.try_iter().find_map(QueueEvent::into_job) {
        seen.push(job.job);
        queue.done(false).unwrap();
    }
    assert_eq!(seen, vec!["b", "a"]);
    assert!(queue.is_empty());
    queue.close().unwrap();
}
