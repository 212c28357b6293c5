//! Coalescing, short-lived cache for asynchronous provider queries.
//!
//! Concurrent [`TaskCache::fetch`] calls for one key share a single loader call.
//! The load runs on its own tokio task and publishes its outcome through a
//! `watch` channel, so a waiter giving up never cancels the shared load.
//! Only successful results are cached; they expire after the configured ttl.
use std::{
    collections::HashMap,
    fmt,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{sync::watch, time::Instant};
use tracing::trace;

use crate::metrics::{CacheLookup, MetricsHandle, noop_metrics};

/// The query a [`TaskCache`] deduplicates.
#[async_trait]
pub trait TaskLoader<K, V>: Send + Sync + 'static {
    type Error;

    async fn load(&self, key: K) -> Result<V, Self::Error>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError<E> {
    #[error("fetch failed: {0}")]
    Fetch(#[source] E),

    /// The loading task ended without reporting a result.
    #[error("fetch abandoned before completion")]
    Abandoned,
}

type Outcome<V, E> = Option<Result<V, CacheError<E>>>;

struct CacheEntry<V> {
    value: V,
    fetched_at: Instant,
}

struct InFlight<V, E> {
    id: u64,
    rx: watch::Receiver<Outcome<V, E>>,
}

struct CacheState<K, V, E> {
    entries: HashMap<K, CacheEntry<V>>,
    in_flight: HashMap<K, InFlight<V, E>>,
    next_id: u64,
}

impl<K, V, E> Default for CacheState<K, V, E> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            in_flight: HashMap::new(),
            next_id: 0,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keyed cache with at most one loader call in flight per key.
pub struct TaskCache<K, V, L>
where
    L: TaskLoader<K, V>,
{
    name: String,
    loader: Arc<L>,
    ttl: Duration,
    state: Arc<Mutex<CacheState<K, V, L::Error>>>,
    metrics: MetricsHandle,
}

impl<K, V, L> fmt::Debug for TaskCache<K, V, L>
where
    L: TaskLoader<K, V>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCache")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl<K, V, L> TaskCache<K, V, L>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    L: TaskLoader<K, V>,
    L::Error: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, loader: L, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            loader: Arc::new(loader),
            ttl,
            state: Arc::new(Mutex::new(CacheState::default())),
            metrics: noop_metrics(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached value for `key` if it is still fresh.
    ///
    /// Never waits and never starts a load.
    pub fn get_from_cache(&self, key: &K) -> Option<V> {
        let st = lock(&self.state);
        let fresh = st
            .entries
            .get(key)
            .filter(|e| e.fetched_at.elapsed() < self.ttl)
            .map(|e| e.value.clone());
        drop(st);

        let lookup = if fresh.is_some() {
            CacheLookup::Hit
        } else {
            CacheLookup::Miss
        };
        trace!(cache = %self.name, ?key, result = lookup.as_label(), "cache lookup");
        self.metrics.record_cache_lookup(&self.name, lookup);
        fresh
    }

    /// Fresh cached value, or the result of [`TaskCache::fetch`].
    pub async fn get(&self, key: K) -> Result<V, CacheError<L::Error>> {
        match self.get_from_cache(&key) {
            Some(value) => Ok(value),
            None => self.fetch(key).await,
        }
    }

    /// Load `key`, joining the load already in flight if there is one.
    ///
    /// A failure is delivered to every waiter of that load and is not cached.
    pub async fn fetch(&self, key: K) -> Result<V, CacheError<L::Error>> {
        let mut rx = {
            let mut st = lock(&self.state);
            match st.in_flight.get(&key) {
                Some(flight) => {
                    trace!(cache = %self.name, ?key, "joining in-flight fetch");
                    self.metrics
                        .record_cache_lookup(&self.name, CacheLookup::Coalesced);
                    flight.rx.clone()
                }
                None => self.spawn_load(&mut st, key),
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome
            .or_else(|| rx.borrow().clone())
            .unwrap_or(Err(CacheError::Abandoned))
    }

    /// Drop the cached entry for `key` and detach any load in flight.
    ///
    /// A detached load still answers the callers already waiting on it, but its
    /// result is not cached and later fetches start a new load.
    pub fn invalidate(&self, key: &K) {
        let mut st = lock(&self.state);
        let dropped = st.entries.remove(key).is_some();
        let detached = st.in_flight.remove(key).is_some();
        if dropped || detached {
            trace!(cache = %self.name, ?key, detached, "cache entry invalidated");
        }
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        lock(&self.state).in_flight.contains_key(key)
    }

    fn spawn_load(
        &self,
        st: &mut CacheState<K, V, L::Error>,
        key: K,
    ) -> watch::Receiver<Outcome<V, L::Error>> {
        let id = st.next_id;
        st.next_id = st.next_id.wrapping_add(1);

        let (tx, rx) = watch::channel(None);
        st.in_flight.insert(
            key.clone(),
            InFlight {
                id,
                rx: rx.clone(),
            },
        );
        trace!(cache = %self.name, ?key, "starting fetch");

        let loader = Arc::clone(&self.loader);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let mut guard = FlightGuard {
                state: &state,
                key: &key,
                id,
                armed: true,
            };
            let result = loader.load(key.clone()).await.map_err(CacheError::Fetch);

            let mut st = lock(&state);
            let current = st.in_flight.get(&key).is_some_and(|f| f.id == id);
            if current {
                st.in_flight.remove(&key);
                if let Ok(value) = &result {
                    st.entries.insert(
                        key.clone(),
                        CacheEntry {
                            value: value.clone(),
                            fetched_at: Instant::now(),
                        },
                    );
                }
            }
            tx.send_replace(Some(result));
            drop(st);
            guard.armed = false;
        });
        rx
    }
}

/// Clears the in-flight marker when a load task dies without publishing.
struct FlightGuard<'a, K: Eq + Hash, V, E> {
    state: &'a Mutex<CacheState<K, V, E>>,
    key: &'a K,
    id: u64,
    armed: bool,
}

impl<K: Eq + Hash, V, E> Drop for FlightGuard<'_, K, V, E> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut st = lock(self.state);
        if st.in_flight.get(self.key).is_some_and(|f| f.id == self.id) {
            st.in_flight.remove(self.key);
        }
    }
}
