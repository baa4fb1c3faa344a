//! Wildcard event emitter.
//!
//! Event paths are dot-separated, e.g. `people.01HX.Save`. Listener patterns
//! use the same syntax, where `*` matches exactly one segment and `**`
//! matches any number of segments, including none.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle returned by [`Emitter::on`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<T> = Arc<dyn Fn(&str, &T) + Send + Sync>;

struct Listener<T> {
    id: ListenerId,
    pattern: Vec<String>,
    callback: Callback<T>,
}

/// Synchronous publish/subscribe over hierarchical paths.
///
/// Listeners run on the emitting thread, in registration order. A listener
/// may register or remove listeners; the change applies to the next emit.
pub struct Emitter<T> {
    listeners: RwLock<Vec<Listener<T>>>,
    next_id: AtomicU64,
}

impl<T> Emitter<T> {
    /// Creates an emitter with no listeners.
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers `callback` for every path matching `pattern`.
    pub fn on<F>(&self, pattern: &str, callback: F) -> ListenerId
    where
        F: Fn(&str, &T) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(Listener {
            id,
            pattern: split(pattern),
            callback: Arc::new(callback),
        });
        id
    }

    /// Removes a listener. Returns false if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    /// Removes every listener.
    pub fn remove_all_listeners(&self) {
        self.listeners.write().clear();
    }

    /// Returns the number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Delivers `event` to all listeners whose pattern matches `path`.
    ///
    /// Returns the number of listeners invoked.
    pub fn emit(&self, path: &str, event: &T) -> usize {
        let segments = split(path);
        let matched: Vec<Callback<T>> = self
            .listeners
            .read()
            .iter()
            .filter(|l| matches(&l.pattern, &segments))
            .map(|l| Arc::clone(&l.callback))
            .collect();
        for callback in &matched {
            callback(path, event);
        }
        matched.len()
    }
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

fn split(path: &str) -> Vec<String> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn matches(pattern: &[String], path: &[String]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((head, rest)) if head == "**" => {
            (0..=path.len()).any(|skip| matches(rest, &path[skip..]))
        }
        Some((head, rest)) => match path.split_first() {
            Some((segment, tail)) => (head == "*" || head == segment) && matches(rest, tail),
            None => false,
        },
    }
}
