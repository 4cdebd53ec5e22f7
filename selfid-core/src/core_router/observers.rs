//! Observer registration for unsolicited messages.
//!
//! Two tables: one-shot observers keyed by conversation id and persistent
//! observers keyed by message kind. A message is delivered to at most one
//! of them, id first. Callbacks run on tokio's blocking pool so a slow
//! callback never stalls the read loop.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core_proto::{InboundMessage, MessageKind};

/// Persistent callback for every message of one kind
pub type TypeObserver = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// One-shot callback for a single conversation
pub type IdObserver = Box<dyn FnOnce(InboundMessage) + Send>;

#[derive(Default)]
pub struct ObserverRegistry {
    by_kind: Mutex<HashMap<MessageKind, TypeObserver>>,
    by_id: Mutex<HashMap<String, IdObserver>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the observer for `kind`, replacing any previous one
    pub async fn subscribe<F>(&self, kind: MessageKind, callback: F)
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        self.by_kind.lock().await.insert(kind, Arc::new(callback));
    }

    /// Install a one-shot observer for conversation `cid`
    pub async fn set_observer<F>(&self, cid: impl Into<String>, callback: F)
    where
        F: FnOnce(InboundMessage) + Send + 'static,
    {
        self.by_id.lock().await.insert(cid.into(), Box::new(callback));
    }

    pub async fn unsubscribe(&self, kind: MessageKind) -> bool {
        self.by_kind.lock().await.remove(&kind).is_some()
    }

    pub async fn has_observer(&self, cid: &str) -> bool {
        self.by_id.lock().await.contains_key(cid)
    }

    /// Drop the one-shot observer for `cid` without calling it
    pub async fn remove(&self, cid: &str) -> bool {
        self.by_id.lock().await.remove(cid).is_some()
    }

    /// One-shot observers still waiting for their message
    pub async fn pending_count(&self) -> usize {
        self.by_id.lock().await.len()
    }

    /// Drop every one-shot observer. Kind observers stay installed.
    pub async fn clear(&self) -> usize {
        let mut by_id = self.by_id.lock().await;
        let dropped = by_id.len();
        by_id.clear();
        dropped
    }

    /// Hand `message` to its observer. Returns the task running the
    /// callback, or `None` when nobody observes it.
    pub async fn notify(&self, message: InboundMessage) -> Option<JoinHandle<()>> {
        let by_id = self.by_id.lock().await.remove(message.cid());
        if let Some(callback) = by_id {
            debug!(cid = %message.cid(), "notifying conversation observer");
            return Some(tokio::task::spawn_blocking(move || callback(message)));
        }

        let kind = message.kind()?;
        let by_kind = self.by_kind.lock().await.get(&kind).cloned();
        match by_kind {
            Some(callback) => {
                debug!(kind = %kind, id = %message.id, "notifying kind observer");
                Some(tokio::task::spawn_blocking(move || callback(message)))
            }
            None => None,
        }
    }
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry").finish_non_exhaustive()
    }
}
