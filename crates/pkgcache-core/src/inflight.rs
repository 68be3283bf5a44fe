//! Keyed in-flight deduplication.
//!
//! The first caller for a key becomes the leader and performs the work; every
//! caller that arrives before the leader finishes is queued and receives a
//! clone of the leader's result, in registration order. The key is removed
//! once the result has been delivered, so a later call starts fresh work.

use crate::error::{CacheError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::trace;

type Waiters<T> = Vec<oneshot::Sender<Result<T>>>;

/// Process-wide map of keys to queued waiters.
pub struct Inflight<T> {
    pending: Arc<Mutex<HashMap<String, Waiters<T>>>>,
}

impl<T> Default for Inflight<T> {
    fn default() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> Clone for Inflight<T> {
    fn clone(&self) -> Self {
        Self {
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<T> std::fmt::Debug for Inflight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("Inflight").field("keys", &keys).finish()
    }
}

/// Outcome of [`Inflight::claim`].
pub enum Claim<T: Clone> {
    /// Nobody else is working on the key; do the work and call [`Leader::finish`].
    Leader(Leader<T>),
    /// Someone else is; await the receiver for their result.
    Waiter(oneshot::Receiver<Result<T>>),
}

/// Ownership of an in-flight key.
///
/// Dropping a leader without finishing releases the key and wakes every
/// waiter with [`CacheError::Abandoned`].
pub struct Leader<T: Clone> {
    key: String,
    pending: Arc<Mutex<HashMap<String, Waiters<T>>>>,
    finished: bool,
}

impl<T: Clone> Leader<T> {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Deliver `result` to every queued waiter and release the key.
    pub fn finish(mut self, result: &Result<T>) {
        self.finished = true;
        let waiters = take_waiters(&self.pending, &self.key);
        trace!(key = %self.key, waiters = waiters.len(), "inflight finish");
        for tx in waiters {
            // A waiter that stopped listening is not an error
            let _ = tx.send(result.clone());
        }
    }
}

impl<T: Clone> Drop for Leader<T> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let waiters = take_waiters(&self.pending, &self.key);
        for tx in waiters {
            let _ = tx.send(Err(CacheError::Abandoned {
                key: self.key.clone(),
            }));
        }
    }
}

fn take_waiters<T>(pending: &Mutex<HashMap<String, Waiters<T>>>, key: &str) -> Waiters<T> {
    pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(key)
        .unwrap_or_default()
}

impl<T: Clone> Inflight<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `key`.
    pub fn claim(&self, key: &str) -> Claim<T> {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(waiters) = pending.get_mut(key) {
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            trace!(key = %key, queued = waiters.len(), "inflight join");
            return Claim::Waiter(rx);
        }

        pending.insert(key.to_string(), Vec::new());
        Claim::Leader(Leader {
            key: key.to_string(),
            pending: Arc::clone(&self.pending),
            finished: false,
        })
    }

    /// Run `work` unless an operation for `key` is already running, in which
    /// case wait for and share its result.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.claim(key) {
            Claim::Leader(leader) => {
                let result = work().await;
                leader.finish(&result);
                result
            }
            Claim::Waiter(rx) => rx.await.unwrap_or_else(|_| {
                Err(CacheError::Abandoned {
                    key: key.to_string(),
                })
            }),
        }
    }

    /// Whether an operation for `key` is currently running.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Number of keys currently in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
