//! Keyed registry of live timers.
//!
//! One entry per key, each backed by a Tokio task that sleeps until the due
//! instant and then runs the caller's fire future. The map stores only
//! cancellation tokens; the tasks own everything else.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What a finished fire asks the registry to do with its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rearm {
    /// One-shot (or abandoned) event: drop the entry.
    Done,
    /// Recurring event: arm the same key again for this instant.
    At(DateTime<Utc>),
}

struct TimerEntry {
    generation: u64,
    due_at: DateTime<Utc>,
    cancel: CancellationToken,
}

struct Inner<K> {
    name: &'static str,
    timers: RwLock<HashMap<K, TimerEntry>>,
    generations: AtomicU64,
}

/// Map from event key to its pending timer.
///
/// Invariants:
/// - at most one entry per key; `schedule` cancels and replaces,
/// - a task only touches the map entry carrying its own generation, so a
///   fire that finishes after its key was re-scheduled or cancelled never
///   removes or resurrects the newer state,
/// - cancellation stops a timer that is still waiting; a fire that already
///   started runs to completion.
pub struct TimerRegistry<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for TimerRegistry<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> TimerRegistry<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// `name` is only used in log lines.
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                timers: RwLock::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Arm `key` to run `fire` at `due_at`, replacing any timer already held
    /// for the key. A `due_at` in the past fires on a fresh task straight away.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn schedule<F, Fut>(&self, key: K, due_at: DateTime<Utc>, fire: F)
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Rearm> + Send + 'static,
    {
        let (generation, token) = self.arm(&key, due_at);
        let registry = self.clone();
        tokio::spawn(async move {
            registry.run(key, generation, token, due_at, fire).await;
        });
    }

    /// Disarm `key`. Returns whether a timer was registered.
    pub fn cancel(&self, key: &K) -> bool {
        match self.write().remove(key) {
            Some(entry) => {
                entry.cancel.cancel();
                debug!(registry = self.inner.name, ?key, "timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Disarm every key matching `predicate`; returns how many were removed.
    pub fn cancel_where(&self, predicate: impl Fn(&K) -> bool) -> usize {
        let mut timers = self.write();
        let before = timers.len();
        timers.retain(|key, entry| {
            if predicate(key) {
                entry.cancel.cancel();
                false
            } else {
                true
            }
        });
        before - timers.len()
    }

    /// Disarm everything. In-flight fires are not rolled back.
    pub fn stop_all(&self) -> usize {
        let mut timers = self.write();
        let n = timers.len();
        for (_, entry) in timers.drain() {
            entry.cancel.cancel();
        }
        n
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.read().contains_key(key)
    }

    pub fn due_at(&self, key: &K) -> Option<DateTime<Utc>> {
        self.read().get(key).map(|entry| entry.due_at)
    }

    // --- private helpers ---------------------------------------------------

    fn arm(&self, key: &K, due_at: DateTime<Utc>) -> (u64, CancellationToken) {
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        let previous = self.write().insert(
            key.clone(),
            TimerEntry {
                generation,
                due_at,
                cancel: token.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
            debug!(registry = self.inner.name, ?key, "replaced existing timer");
        }
        (generation, token)
    }

    /// Timer task body. Loops for as long as the fire keeps asking to re-arm.
    async fn run<F, Fut>(
        self,
        key: K,
        mut generation: u64,
        mut token: CancellationToken,
        mut due_at: DateTime<Utc>,
        fire: F,
    ) where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Rearm> + Send + 'static,
    {
        loop {
            // Negative remaining time fails `to_std`, which means "due now".
            let delay = (due_at - Utc::now()).to_std().unwrap_or_default();
            if !delay.is_zero() {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if token.is_cancelled() {
                return;
            }

            let rearm = fire(key.clone()).await;

            match self.settle(&key, generation, rearm) {
                Some((next_generation, next_token, next_due)) => {
                    generation = next_generation;
                    token = next_token;
                    due_at = next_due;
                }
                None => return,
            }
        }
    }

    /// Apply a fire's [`Rearm`] if the entry for `key` is still ours.
    fn settle(
        &self,
        key: &K,
        generation: u64,
        rearm: Rearm,
    ) -> Option<(u64, CancellationToken, DateTime<Utc>)> {
        let mut timers = self.write();
        match timers.get(key) {
            Some(entry) if entry.generation == generation => {}
            _ => {
                debug!(
                    registry = self.inner.name,
                    ?key,
                    "timer superseded while firing; leaving registry untouched"
                );
                return None;
            }
        }

        match rearm {
            Rearm::Done => {
                timers.remove(key);
                None
            }
            Rearm::At(next_due) => {
                let next_generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
                let token = CancellationToken::new();
                timers.insert(
                    key.clone(),
                    TimerEntry {
                        generation: next_generation,
                        due_at: next_due,
                        cancel: token.clone(),
                    },
                );
                Some((next_generation, token, next_due))
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<K, TimerEntry>> {
        self.inner
            .timers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<K, TimerEntry>> {
        self.inner
            .timers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
