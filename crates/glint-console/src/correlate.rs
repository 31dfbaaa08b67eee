//! Id-keyed one-shot reply registry.
//!
//! The engine has two unrelated reply mechanisms that both boil down to
//! "remember who asked, hand them the answer when it shows up": the
//! node-index-matched `expand_table` pushes and the injected RPC
//! channel. Each gets its own `Correlator` instance; the key spaces
//! never mix.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

use tokio::sync::oneshot;

/// One-shot reply registry keyed by an opaque request id.
///
/// Every registered id is resolved or cancelled exactly once and then
/// purged. Resolving an unknown or already-resolved id is a silent
/// no-op; late replies from a stale halt must not be an error.
#[derive(Debug)]
pub struct Correlator<K, V> {
    pending: Mutex<HashMap<K, oneshot::Sender<V>>>,
}

impl<K, V> Correlator<K, V>
where
    K: Eq + Hash + std::fmt::Debug,
{
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a pending request and return the receiver for its reply.
    ///
    /// Registering the same key twice drops the earlier waiter; its
    /// receiver resolves to a channel error.
    pub fn register(&self, key: K) -> oneshot::Receiver<V> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.insert(key, tx);
        rx
    }

    /// Resolve a pending request. Returns `true` if a waiter was found.
    pub fn resolve(&self, key: &K, value: V) -> bool {
        let sender = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(key)
        };
        match sender {
            Some(tx) => {
                // A dropped receiver (caller timed out) is fine.
                let _ = tx.send(value);
                true
            }
            None => {
                tracing::trace!(?key, "reply for unknown or stale request id, dropped");
                false
            }
        }
    }

    /// Forget one pending request without resolving it.
    pub fn cancel(&self, key: &K) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(key).is_some()
    }

    /// Drop every pending request; their receivers resolve to an error.
    ///
    /// Called when a new callstack invalidates everything in flight.
    pub fn cancel_all(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.clear();
    }

    /// Number of requests still awaiting a reply.
    pub fn pending_count(&self) -> usize {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.len()
    }
}

impl<K, V> Default for Correlator<K, V>
where
    K: Eq + Hash + std::fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}
