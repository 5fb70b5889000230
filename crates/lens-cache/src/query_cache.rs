//! Keyed cache with staleness windows, retention windows, in-flight
//! de-duplication, and prefix invalidation.
//!
//! Every entry carries an invalidation epoch. A value is servable only while
//! it was fetched under the entry's current epoch, so a fetch that was already
//! running when [`QueryCache::invalidate`] returned can never satisfy a later
//! `get`.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::{sync::oneshot, task::JoinHandle, time::Instant};

use crate::{error::FetchError, key::CacheKey};

const DEFAULT_STALE_TIME: Duration = Duration::from_secs(30);
const DEFAULT_RETAIN_TIME: Duration = Duration::from_secs(300);

pub type FetchResult<V> = Result<Arc<V>, FetchError>;
type SharedFetch<V> = Shared<BoxFuture<'static, FetchResult<V>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Freshness and retention windows applied to one entry.
pub struct CachePolicy {
    pub stale_time: Duration,
    pub retain_time: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            stale_time: DEFAULT_STALE_TIME,
            retain_time: DEFAULT_RETAIN_TIME,
        }
    }
}

/// Seam used by components that only need to invalidate.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate_prefix(&self, prefix: &CacheKey) -> usize;
}

struct InFlight<V> {
    id: u64,
    epoch: u64,
    fetch: SharedFetch<V>,
}

struct CacheEntry<V> {
    epoch: u64,
    value: Option<Arc<V>>,
    value_epoch: u64,
    value_fetch_id: u64,
    stale_at: Instant,
    retain_until: Instant,
    in_flight: Option<InFlight<V>>,
    last_error: Option<FetchError>,
}

enum Lookup<V> {
    Fresh(Arc<V>),
    Stale { value: Arc<V>, refreshing: bool },
    InFlight(SharedFetch<V>),
    Missing,
}

enum Pending<V> {
    Ready(Arc<V>),
    Wait(SharedFetch<V>),
}

impl<V> CacheEntry<V> {
    fn new(epoch: u64, now: Instant) -> Self {
        Self {
            epoch,
            value: None,
            value_epoch: 0,
            value_fetch_id: 0,
            stale_at: now,
            retain_until: now,
            in_flight: None,
            last_error: None,
        }
    }

    fn touch(&mut self, now: Instant, retain_time: Duration) {
        let candidate = now + retain_time;
        if candidate > self.retain_until {
            self.retain_until = candidate;
        }
    }

    fn current_fetch(&self) -> Option<SharedFetch<V>> {
        self.in_flight
            .as_ref()
            .filter(|in_flight| in_flight.epoch == self.epoch)
            .map(|in_flight| in_flight.fetch.clone())
    }

    fn lookup(&self, now: Instant) -> Lookup<V> {
        let servable = self
            .value
            .as_ref()
            .filter(|_| self.value_epoch == self.epoch)
            .cloned();
        match servable {
            Some(value) if now < self.stale_at => Lookup::Fresh(value),
            Some(value) => Lookup::Stale {
                value,
                refreshing: self.current_fetch().is_some(),
            },
            None => match self.current_fetch() {
                Some(fetch) => Lookup::InFlight(fetch),
                None => Lookup::Missing,
            },
        }
    }

    fn store(&mut self, value: Arc<V>, fetch_id: u64, now: Instant, policy: CachePolicy) {
        self.value = Some(value);
        self.value_epoch = self.epoch;
        self.value_fetch_id = fetch_id;
        self.stale_at = now + policy.stale_time;
        self.last_error = None;
        self.touch(now, policy.retain_time);
    }

    fn finish(&mut self, fetch_id: u64) {
        if self
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.id == fetch_id)
        {
            self.in_flight = None;
        }
    }
}

struct CacheState<V> {
    entries: HashMap<CacheKey, CacheEntry<V>>,
    sequence: u64,
}

impl<V> CacheState<V> {
    fn next_sequence(&mut self) -> u64 {
        self.sequence = self.sequence.saturating_add(1);
        self.sequence
    }
}

fn lock_state<V>(state: &Mutex<CacheState<V>>) -> MutexGuard<'_, CacheState<V>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared query cache. Clones share the same entries.
pub struct QueryCache<V> {
    state: Arc<Mutex<CacheState<V>>>,
    default_policy: CachePolicy,
}

impl<V> Clone for QueryCache<V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            default_policy: self.default_policy,
        }
    }
}

impl<V> Default for QueryCache<V>
where
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(CachePolicy::default())
    }
}

impl<V> QueryCache<V>
where
    V: Send + Sync + 'static,
{
    pub fn new(default_policy: CachePolicy) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                sequence: 0,
            })),
            default_policy,
        }
    }

    pub fn default_policy(&self) -> CachePolicy {
        self.default_policy
    }

    /// Returns the cached value for `key`, fetching it when absent or
    /// invalidated.
    ///
    /// A stale value is returned immediately while a background refresh runs.
    /// Concurrent callers for the same key share one fetch.
    pub async fn get<F, Fut>(&self, key: &CacheKey, policy: CachePolicy, fetcher: F) -> FetchResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
    {
        let pending = {
            let now = Instant::now();
            let mut state = lock_state(&self.state);
            let candidate_epoch = state.next_sequence();
            let fetch_id = state.next_sequence();
            let entry = state
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(candidate_epoch, now));
            entry.touch(now, policy.retain_time);
            match entry.lookup(now) {
                Lookup::Fresh(value) => {
                    tracing::debug!(key = %key, "cache hit");
                    Pending::Ready(value)
                }
                Lookup::Stale { value, refreshing } => {
                    if !refreshing {
                        tracing::debug!(key = %key, "serving stale value; refreshing in background");
                        let fetch = self.spawn_fetch(entry, key, fetch_id, policy, fetcher);
                        tokio::spawn(fetch.map(|_| ()));
                    }
                    Pending::Ready(value)
                }
                Lookup::InFlight(fetch) => {
                    tracing::debug!(key = %key, "joining in-flight fetch");
                    Pending::Wait(fetch)
                }
                Lookup::Missing => {
                    tracing::debug!(key = %key, "cache miss");
                    Pending::Wait(self.spawn_fetch(entry, key, fetch_id, policy, fetcher))
                }
            }
        };

        match pending {
            Pending::Ready(value) => Ok(value),
            Pending::Wait(fetch) => fetch.await,
        }
    }

    fn spawn_fetch<F, Fut>(
        &self,
        entry: &mut CacheEntry<V>,
        key: &CacheKey,
        fetch_id: u64,
        policy: CachePolicy,
        fetcher: F,
    ) -> SharedFetch<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
    {
        let epoch = entry.epoch;
        let request = fetcher();
        let task_state = Arc::clone(&self.state);
        let task_key = key.clone();
        // Spawned so the fetch finishes even if the caller that started it is dropped.
        let task: JoinHandle<FetchResult<V>> = tokio::spawn(async move {
            let result = request.await;
            complete_fetch(&task_state, &task_key, fetch_id, epoch, policy, result)
        });

        let cleanup_state = Arc::clone(&self.state);
        let cleanup_key = key.clone();
        let fetch = async move {
            match task.await {
                Ok(result) => result,
                Err(error) => {
                    let mut state = lock_state(&cleanup_state);
                    if let Some(entry) = state.entries.get_mut(&cleanup_key) {
                        entry.finish(fetch_id);
                    }
                    Err(FetchError::Aborted(error.to_string()))
                }
            }
        }
        .boxed()
        .shared();

        entry.in_flight = Some(InFlight {
            id: fetch_id,
            epoch,
            fetch: fetch.clone(),
        });
        fetch
    }

    /// Marks every entry under `prefix` stale. The next `get` for each of
    /// them fetches synchronously.
    pub fn invalidate(&self, prefix: &CacheKey) -> usize {
        let mut state = lock_state(&self.state);
        let epoch = state.next_sequence();
        let mut invalidated = 0_usize;
        for (key, entry) in state.entries.iter_mut() {
            if key.starts_with(prefix) {
                entry.epoch = epoch;
                invalidated = invalidated.saturating_add(1);
            }
        }
        tracing::debug!(prefix = %prefix, invalidated, "cache entries invalidated");
        invalidated
    }

    /// Populates `key` directly, typically with a mutation's response.
    pub fn write(&self, key: &CacheKey, value: V) -> Arc<V> {
        self.write_with_policy(key, value, self.default_policy)
    }

    pub fn write_with_policy(&self, key: &CacheKey, value: V, policy: CachePolicy) -> Arc<V> {
        let now = Instant::now();
        let value = Arc::new(value);
        let mut state = lock_state(&self.state);
        let candidate_epoch = state.next_sequence();
        let write_id = state.next_sequence();
        let entry = state
            .entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(candidate_epoch, now));
        entry.store(Arc::clone(&value), write_id, now, policy);
        value
    }

    /// Last-known-good value regardless of freshness.
    pub fn peek(&self, key: &CacheKey) -> Option<Arc<V>> {
        let state = lock_state(&self.state);
        state.entries.get(key).and_then(|entry| entry.value.clone())
    }

    /// True when `key` holds a value a `get` would return without fetching.
    pub fn is_fresh(&self, key: &CacheKey) -> bool {
        let now = Instant::now();
        let state = lock_state(&self.state);
        state
            .entries
            .get(key)
            .is_some_and(|entry| matches!(entry.lookup(now), Lookup::Fresh(_)))
    }

    pub fn last_error(&self, key: &CacheKey) -> Option<FetchError> {
        let state = lock_state(&self.state);
        state
            .entries
            .get(key)
            .and_then(|entry| entry.last_error.clone())
    }

    pub fn remove(&self, key: &CacheKey) -> Option<Arc<V>> {
        let mut state = lock_state(&self.state);
        state.entries.remove(key).and_then(|entry| entry.value)
    }

    /// Drops every entry. Fetches still in flight return to their waiters but
    /// are not cached.
    pub fn clear(&self) -> usize {
        let mut state = lock_state(&self.state);
        let cleared = state.entries.len();
        state.entries.clear();
        cleared
    }

    pub fn len(&self) -> usize {
        lock_state(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops entries unused past their retention window. Entries with a fetch
    /// in flight are kept.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = lock_state(&self.state);
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| entry.in_flight.is_some() || now < entry.retain_until);
        let evicted = before.saturating_sub(state.entries.len());
        if evicted > 0 {
            tracing::debug!(evicted, "expired cache entries evicted");
        }
        evicted
    }

    /// Runs [`Self::evict_expired`] every `interval` until the handle is shut
    /// down or dropped.
    pub fn spawn_janitor(&self, interval: Duration) -> JanitorHandle {
        let cache = self.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let period = interval.max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.evict_expired();
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });
        JanitorHandle {
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

impl<V> CacheInvalidator for QueryCache<V>
where
    V: Send + Sync + 'static,
{
    fn invalidate_prefix(&self, prefix: &CacheKey) -> usize {
        self.invalidate(prefix)
    }
}

fn complete_fetch<V>(
    state: &Mutex<CacheState<V>>,
    key: &CacheKey,
    fetch_id: u64,
    epoch: u64,
    policy: CachePolicy,
    result: Result<V, FetchError>,
) -> FetchResult<V> {
    let now = Instant::now();
    let mut state = lock_state(state);
    let entry = state.entries.get_mut(key);
    match result {
        Ok(value) => {
            let value = Arc::new(value);
            match entry {
                Some(entry) => {
                    entry.finish(fetch_id);
                    if entry.epoch != epoch {
                        tracing::debug!(key = %key, "fetch predates invalidation; not cached");
                    } else if fetch_id > entry.value_fetch_id {
                        entry.store(Arc::clone(&value), fetch_id, now, policy);
                    }
                }
                None => tracing::debug!(key = %key, "fetch completed after eviction"),
            }
            Ok(value)
        }
        Err(error) => {
            if let Some(entry) = entry {
                entry.finish(fetch_id);
                if entry.epoch == epoch {
                    entry.last_error = Some(error.clone());
                }
            }
            tracing::warn!(key = %key, %error, "cache fetch failed; keeping last known value");
            Err(error)
        }
    }
}

/// Owns the eviction loop started by [`QueryCache::spawn_janitor`].
#[derive(Debug)]
pub struct JanitorHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl JanitorHandle {
    pub fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for JanitorHandle {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}
