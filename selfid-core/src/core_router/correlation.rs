/*
    Correlation - pending waits keyed by message id or conversation id

    A caller registers a wait *before* the frame that will be answered is
    written, then suspends on the returned `Waiter`. Whoever sees the answer
    (the dispatcher, the sweep, or a terminal close) removes the entry and
    resolves it exactly once.

    Workflow:

    1. begin_wait(key) -> Waiter
        - fails with AlreadyPending if the key is taken
        - deadline = now + registry timeout (or an explicit deadline)

    2. Resolution (first one wins, entry removed under the lock):
        - fulfill(key, value)   -> Outcome::Completed
        - reject(key, reason)   -> Outcome::Rejected
        - sweep(now)            -> Outcome::TimedOut for every expired entry
        - close_all()           -> Outcome::Disconnected for every entry

    3. Waiter::wait() awaits the oneshot outside the lock and, on exit,
       removes its own entry if it is still there. Entries carry a ticket so a
       stale waiter never removes a newer registration under the same key.
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::metrics;

/// Result of a correlated wait
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Completed(T),
    /// The relay answered with an error frame
    Rejected(Rejection),
    TimedOut,
    /// The connection closed for good while waiting
    Disconnected,
}

impl<T> Outcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Completed(_) => "completed",
            Outcome::Rejected(_) => "rejected",
            Outcome::TimedOut => "timed_out",
            Outcome::Disconnected => "disconnected",
        }
    }

    /// Same outcome with the completed value replaced
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Completed(value) => Outcome::Completed(f(value)),
            Outcome::Rejected(r) => Outcome::Rejected(r),
            Outcome::TimedOut => Outcome::TimedOut,
            Outcome::Disconnected => Outcome::Disconnected,
        }
    }
}

/// Relay error frame contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub id: String,
    pub sender: String,
    pub reason: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("A wait is already pending for {0}")]
    AlreadyPending(String),
}

struct PendingWait<T> {
    ticket: u64,
    deadline: Instant,
    tx: oneshot::Sender<Outcome<T>>,
}

/// One map of pending waits with a default deadline
pub struct CorrelationRegistry<T> {
    name: &'static str,
    entries: Arc<Mutex<HashMap<String, PendingWait<T>>>>,
    next_ticket: AtomicU64,
    timeout: Duration,
}

impl<T: Send + 'static> CorrelationRegistry<T> {
    pub fn new(name: &'static str, timeout: Duration) -> Self {
        Self {
            name,
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_ticket: AtomicU64::new(1),
            timeout,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a wait with the registry's default deadline
    pub async fn begin_wait(&self, key: impl Into<String>) -> Result<Waiter<T>, CorrelationError> {
        self.begin_wait_until(key, Instant::now() + self.timeout).await
    }

    pub async fn begin_wait_until(
        &self,
        key: impl Into<String>,
        deadline: Instant,
    ) -> Result<Waiter<T>, CorrelationError> {
        let key = key.into();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let mut entries = self.entries.lock().await;
        if entries.contains_key(&key) {
            return Err(CorrelationError::AlreadyPending(key));
        }
        entries.insert(key.clone(), PendingWait { ticket, deadline, tx });
        metrics::set_pending_waits(self.name, entries.len());
        drop(entries);

        debug!(registry = self.name, key = %key, "wait registered");

        Ok(Waiter {
            key,
            ticket,
            rx,
            entries: Arc::clone(&self.entries),
            registry: self.name,
        })
    }

    /// Resolve a wait as completed. Returns false if nobody was waiting.
    pub async fn fulfill(&self, key: &str, value: T) -> bool {
        self.offer(key, value).await.is_ok()
    }

    /// Like `fulfill`, but hands the value back when nobody was waiting
    pub async fn offer(&self, key: &str, value: T) -> Result<(), T> {
        match self.take(key).await {
            Some(entry) => {
                self.send(entry, Outcome::Completed(value));
                Ok(())
            }
            None => Err(value),
        }
    }

    /// Resolve a wait as rejected by the relay
    pub async fn reject(&self, key: &str, rejection: Rejection) -> bool {
        match self.take(key).await {
            Some(entry) => {
                self.send(entry, Outcome::Rejected(rejection));
                true
            }
            None => false,
        }
    }

    async fn take(&self, key: &str) -> Option<PendingWait<T>> {
        let mut entries = self.entries.lock().await;
        let entry = entries.remove(key);
        metrics::set_pending_waits(self.name, entries.len());
        entry
    }

    fn send(&self, entry: PendingWait<T>, outcome: Outcome<T>) {
        metrics::wait_resolved(self.name, outcome.label());
        // The waiter may have been dropped; that is not an error.
        let _ = entry.tx.send(outcome);
    }

    /// Time out every entry whose deadline is at or before `now`
    pub async fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<(String, PendingWait<T>)> = {
            let mut entries = self.entries.lock().await;
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, wait)| wait.deadline <= now)
                .map(|(key, _)| key.clone())
                .collect();
            let expired = keys
                .into_iter()
                .filter_map(|key| entries.remove(&key).map(|wait| (key, wait)))
                .collect();
            metrics::set_pending_waits(self.name, entries.len());
            expired
        };

        for (key, wait) in &expired {
            warn!(registry = self.name, key = %key, ticket = wait.ticket, "wait timed out");
        }
        let count = expired.len();
        for (_, wait) in expired {
            self.send(wait, Outcome::TimedOut);
        }
        count
    }

    /// Release every waiter as disconnected
    pub async fn close_all(&self) -> usize {
        let drained: Vec<PendingWait<T>> = {
            let mut entries = self.entries.lock().await;
            let drained = entries.drain().map(|(_, wait)| wait).collect();
            metrics::set_pending_waits(self.name, 0);
            drained
        };

        let count = drained.len();
        for wait in drained {
            self.send(wait, Outcome::Disconnected);
        }
        if count > 0 {
            debug!(registry = self.name, count, "released pending waits");
        }
        count
    }

    /// Drop an entry without resolving it
    pub async fn cancel(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().await;
        let removed = entries.remove(key).is_some();
        metrics::set_pending_waits(self.name, entries.len());
        removed
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    pub async fn pending_count(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Handle returned by `begin_wait`
pub struct Waiter<T> {
    key: String,
    ticket: u64,
    rx: oneshot::Receiver<Outcome<T>>,
    entries: Arc<Mutex<HashMap<String, PendingWait<T>>>>,
    registry: &'static str,
}

impl<T> Waiter<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Suspend until the wait is resolved
    pub async fn wait(self) -> Outcome<T> {
        let Waiter {
            key,
            ticket,
            rx,
            entries,
            registry,
        } = self;

        // A dropped sender means the registry itself went away.
        let outcome = rx.await.unwrap_or(Outcome::Disconnected);

        let mut entries = entries.lock().await;
        if entries.get(&key).map(|wait| wait.ticket) == Some(ticket) {
            entries.remove(&key);
            metrics::set_pending_waits(registry, entries.len());
        }

        outcome
    }
}

impl<T> std::fmt::Debug for Waiter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("registry", &self.registry)
            .field("key", &self.key)
            .field("ticket", &self.ticket)
            .finish()
    }
}
