//! In-flight call coalescing.
//!
//! Concurrent calls sharing a key trigger exactly one execution of the
//! producer; every caller registered while it runs receives the same result:
//! - The first caller for a key becomes the leader and its producer is
//!   spawned.
//! - Later callers join the pending call. Their producers are dropped unrun.
//! - On completion every waiter is invoked, in registration order, after the
//!   registry lock has been released.
//!
//! Nothing is remembered once a call completes. A call issued afterwards runs
//! its producer again.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A registered continuation for a pending call.
pub type Completion<T> = Box<dyn FnOnce(T) + Send + 'static>;

/// Identifies one execution of a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(u64);

/// Outcome of registering a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// No call was pending; the caller owns the execution.
    Leader(CallId),
    /// A call was already pending; `position` is the waiter's index in it.
    Joined { call: CallId, position: usize },
}

impl Registration {
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader(_))
    }

    pub fn call_id(&self) -> CallId {
        match self {
            Self::Leader(call) | Self::Joined { call, .. } => *call,
        }
    }
}

/// The leader's producer finished without publishing a result (it panicked
/// or its task was aborted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallAbandoned;

impl std::fmt::Display for CallAbandoned {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("in-flight call was abandoned before completing")
    }
}

impl std::error::Error for CallAbandoned {}

struct PendingCall<T> {
    id: CallId,
    waiters: Vec<Completion<T>>,
}

struct Registry<K, T> {
    pending: HashMap<K, PendingCall<T>>,
    /// Calls detached from their key by `invalidate`. They still deliver to
    /// the waiters they already had.
    detached: HashMap<CallId, Vec<Completion<T>>>,
    next_id: u64,
}

impl<K, T> Registry<K, T>
where
    K: Hash + Eq,
{
    fn take_waiters(&mut self, key: &K, call: CallId) -> Option<Vec<Completion<T>>> {
        if self.pending.get(key).is_some_and(|pending| pending.id == call) {
            return self.pending.remove(key).map(|pending| pending.waiters);
        }
        self.detached.remove(&call)
    }
}

/// Fingerprint-keyed call coalescer. Clones share the same registry.
pub struct Coalescer<K, T> {
    registry: Arc<Mutex<Registry<K, T>>>,
}

impl<K, T> Clone for Coalescer<K, T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<K, T> Default for Coalescer<K, T>
where
    K: Hash + Eq + Clone + Send + std::fmt::Debug + 'static,
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> std::fmt::Debug for Coalescer<K, T>
where
    K: Hash + Eq + Clone + Send + std::fmt::Debug + 'static,
    T: Clone + Send + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coalescer")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl<K, T> Coalescer<K, T>
where
    K: Hash + Eq + Clone + Send + std::fmt::Debug + 'static,
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                pending: HashMap::new(),
                detached: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    /// Register `completion` against `key`.
    ///
    /// A [`Registration::Leader`] obliges the caller to eventually call
    /// [`Coalescer::complete`] (or [`Coalescer::abandon`]) with the returned id.
    pub fn register(&self, key: K, completion: Completion<T>) -> Registration {
        let mut registry = self.lock();
        if let Some(pending) = registry.pending.get_mut(&key) {
            pending.waiters.push(completion);
            let registration = Registration::Joined {
                call: pending.id,
                position: pending.waiters.len() - 1,
            };
            debug!(key = ?key, "Joined in-flight call");
            return registration;
        }

        let id = CallId(registry.next_id);
        registry.next_id += 1;
        registry.pending.insert(
            key.clone(),
            PendingCall {
                id,
                waiters: vec![completion],
            },
        );
        debug!(key = ?key, "Started new call");
        Registration::Leader(id)
    }

    /// Publish `result` to every waiter of `call` and forget it.
    ///
    /// Waiters run on the calling task, in registration order, with the
    /// registry lock released. Returns how many were invoked.
    pub fn complete(&self, key: &K, call: CallId, result: T) -> usize {
        let waiters = self.lock().take_waiters(key, call);
        let Some(mut waiters) = waiters else {
            warn!(key = ?key, "Completion for unknown call");
            return 0;
        };

        let count = waiters.len();
        let last = waiters.pop();
        for waiter in waiters {
            waiter(result.clone());
        }
        if let Some(last) = last {
            last(result);
        }
        count
    }

    /// Drop `call` and its waiters without a result.
    pub fn abandon(&self, key: &K, call: CallId) {
        let waiters = self.lock().take_waiters(key, call);
        if let Some(waiters) = waiters {
            warn!(key = ?key, waiters = waiters.len(), "Abandoned in-flight call");
        }
    }

    /// Detach the pending call for `key`, if any.
    ///
    /// The detached call still delivers to the waiters it already has, but
    /// the next registration for `key` starts a new call.
    pub fn invalidate(&self, key: &K) -> bool {
        let mut registry = self.lock();
        match registry.pending.remove(key) {
            Some(pending) => {
                registry.detached.insert(pending.id, pending.waiters);
                debug!(key = ?key, "Detached in-flight call");
                true
            }
            None => false,
        }
    }

    /// Register `completion` and, when leading, spawn `producer` on the
    /// current Tokio runtime.
    ///
    /// The producer of a joining caller is dropped without being called.
    pub fn submit<F, Fut, C>(&self, key: K, producer: F, completion: C) -> Registration
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        C: FnOnce(T) + Send + 'static,
    {
        let registration = self.register(key.clone(), Box::new(completion));
        if let Registration::Leader(call) = registration {
            let future = producer();
            let mut guard = LeaderGuard {
                coalescer: self.clone(),
                key: Some(key),
                call,
            };
            tokio::spawn(async move {
                let result = future.await;
                if let Some(key) = guard.key.take() {
                    guard.coalescer.complete(&key, call, result);
                }
            });
        }
        registration
    }

    /// Coalesce and wait for the shared result.
    pub async fn execute<F, Fut>(&self, key: K, producer: F) -> Result<T, CallAbandoned>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(key, producer, move |result| {
            let _ = tx.send(result);
        });
        rx.await.map_err(|_| CallAbandoned)
    }

    /// Number of calls currently pending, detached ones included.
    pub fn in_flight(&self) -> usize {
        let registry = self.lock();
        registry.pending.len() + registry.detached.len()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.lock().pending.contains_key(key)
    }

    fn lock(&self) -> MutexGuard<'_, Registry<K, T>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Abandons the leader's call if its task ends without completing.
struct LeaderGuard<K, T>
where
    K: Hash + Eq + Clone + Send + std::fmt::Debug + 'static,
    T: Clone + Send + 'static,
{
    coalescer: Coalescer<K, T>,
    key: Option<K>,
    call: CallId,
}

impl<K, T> Drop for LeaderGuard<K, T>
where
    K: Hash + Eq + Clone + Send + std::fmt::Debug + 'static,
    T: Clone + Send + 'static,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.coalescer.abandon(&key, self.call);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
