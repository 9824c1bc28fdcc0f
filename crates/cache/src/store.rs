//! The shared keyed store.
//!
//! Every mutation is a short synchronous critical section, so callers on the
//! event path never suspend while holding the store. Only
//! [`CacheStore::read_through`] awaits, and it does so without the lock held.

use crate::entry::{CacheEntry, StalePolicy};
use crate::key::{CacheKey, EntityClass};
use crate::source::DataSource;
use crate::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default capacity of the change-notification channel.
const DEFAULT_NOTIFICATION_CAPACITY: usize = 256;

/// Default time an untouched entry is kept before garbage collection.
const DEFAULT_RETENTION: Duration = Duration::from_secs(300);

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheChange {
    /// A new value was stored.
    Written,
    /// The value was marked for refetch.
    Invalidated,
    /// The entry was deleted because its entity was deleted.
    Removed,
    /// The entry was dropped by the retention sweep.
    Evicted,
}

/// Change notification delivered to UI subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNotification {
    /// Affected key.
    pub key: CacheKey,
    /// Kind of change.
    pub change: CacheChange,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Entries currently held.
    pub entries: usize,
    /// Entries currently marked invalidated.
    pub invalidated: usize,
    /// Reads currently waiting on the data source.
    pub in_flight: usize,
    /// Reads served from the cache.
    pub hits: u64,
    /// Reads that went to the data source.
    pub misses: u64,
    /// Successful data source fetches.
    pub fetches: u64,
    /// Failed data source fetches.
    pub fetch_errors: u64,
    /// Reads cancelled before completion.
    pub cancelled: u64,
}

/// Construction options for a [`CacheStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Per-class freshness windows.
    pub stale: StalePolicy,
    /// How long an entry may go unread and unwritten before it is collected.
    pub retention: Duration,
    /// Buffer size of the notification channel.
    pub notification_capacity: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            stale: StalePolicy::default(),
            retention: DEFAULT_RETENTION,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}

struct InFlight {
    key: CacheKey,
    token: CancellationToken,
    /// Invalidated while the fetch was running; the result is stored stale.
    invalidated: bool,
    /// A direct write or removal landed first; the result is not stored.
    superseded: bool,
}

/// Drops the in-flight record of a read whose future was abandoned mid-fetch.
struct PendingRead<'a, V> {
    inner: &'a StoreInner<V>,
    id: u64,
    armed: bool,
}

impl<V> PendingRead<'_, V> {
    const fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<V> Drop for PendingRead<'_, V> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(flight) = state.in_flight.remove(&self.id) {
            state.counters.cancelled += 1;
            tracing::debug!(key = %flight.key, "Read abandoned by caller");
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    fetches: u64,
    fetch_errors: u64,
    cancelled: u64,
}

struct State<V> {
    entries: HashMap<CacheKey, CacheEntry<V>>,
    in_flight: HashMap<u64, InFlight>,
    next_read: u64,
    counters: Counters,
}

struct StoreInner<V> {
    state: Mutex<State<V>>,
    options: StoreOptions,
    notify: broadcast::Sender<CacheNotification>,
}

/// Keyed entity cache shared between the sync engine and the UI.
///
/// Cloning yields another handle to the same store. All operations are total:
/// absent keys are no-ops.
pub struct CacheStore<V = serde_json::Value> {
    inner: Arc<StoreInner<V>>,
}

impl<V> Clone for CacheStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a store with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(StoreOptions::default())
    }

    /// Create a store with the given options.
    #[must_use]
    pub fn with_options(options: StoreOptions) -> Self {
        let (notify, _) = broadcast::channel(options.notification_capacity.max(1));
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(State {
                    entries: HashMap::new(),
                    in_flight: HashMap::new(),
                    next_read: 0,
                    counters: Counters::default(),
                }),
                options,
                notify,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<V>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, key: CacheKey, change: CacheChange) {
        // No receivers is the common case outside the UI
        let _ = self.inner.notify.send(CacheNotification { key, change });
    }

    /// Options this store was built with.
    #[must_use]
    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    /// Current entry for `key`, without fetching.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let mut state = self.state();
        let entry = state.entries.get_mut(key)?;
        entry.touch(Instant::now());
        Some(entry.clone())
    }

    /// Current value for `key`, without fetching.
    #[must_use]
    pub fn get_value(&self, key: &CacheKey) -> Option<V> {
        self.get(key).map(CacheEntry::into_value)
    }

    /// Whether an entry exists for exactly `key`.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state().entries.contains_key(key)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    /// Whether the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state().entries.is_empty()
    }

    /// All keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self.state().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Overwrite the entry for `key`, clearing any invalidation.
    ///
    /// A read for the same key that is still in flight will not overwrite
    /// this value when it completes.
    pub fn write(&self, key: CacheKey, value: V) {
        let stale_after = self.inner.options.stale.stale_after(key.class);
        {
            let mut guard = self.state();
            let state = &mut *guard;
            for flight in state.in_flight.values_mut() {
                if flight.key == key {
                    flight.superseded = true;
                }
            }
            state
                .entries
                .insert(key.clone(), CacheEntry::new(value, stale_after, Instant::now()));
        }
        tracing::trace!(key = %key, "Cache entry written");
        self.emit(key, CacheChange::Written);
    }

    /// Mark `key` and every key it covers as invalidated.
    ///
    /// Values are kept so the UI can render last-known-good data while the
    /// refetch runs. Reads of covered keys already in flight will store their
    /// result as invalidated. Returns the number of entries newly marked.
    pub fn invalidate(&self, key: &CacheKey) -> usize {
        let marked: Vec<CacheKey> = {
            let mut guard = self.state();
            let state = &mut *guard;
            let marked = state
                .entries
                .iter_mut()
                .filter(|(entry_key, _)| key.covers(entry_key))
                .filter_map(|(entry_key, entry)| entry.invalidate().then(|| entry_key.clone()))
                .collect();
            for flight in state.in_flight.values_mut() {
                if key.covers(&flight.key) {
                    flight.invalidated = true;
                }
            }
            marked
        };

        tracing::debug!(key = %key, marked = marked.len(), "Invalidated cache family");
        let count = marked.len();
        for key in marked {
            self.emit(key, CacheChange::Invalidated);
        }
        count
    }

    /// Invalidate every key of `class`, including the "all" key.
    pub fn invalidate_class(&self, class: EntityClass) -> usize {
        self.invalidate(&CacheKey::all(class))
    }

    /// Invalidate every entry in the store.
    pub fn invalidate_all(&self) -> usize {
        let count: usize = EntityClass::ALL
            .into_iter()
            .map(|class| self.invalidate_class(class))
            .sum();
        tracing::info!(marked = count, "Invalidated entire cache");
        count
    }

    /// Hard-delete exactly `key`. Returns whether an entry existed.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let removed = {
            let mut guard = self.state();
            let state = &mut *guard;
            for flight in state.in_flight.values_mut() {
                if flight.key == *key {
                    flight.superseded = true;
                }
            }
            state.entries.remove(key).is_some()
        };
        if removed {
            tracing::debug!(key = %key, "Cache entry removed");
            self.emit(key.clone(), CacheChange::Removed);
        }
        removed
    }

    /// Cancel in-flight reads of `key` and every key it covers.
    ///
    /// Cancelled reads return [`Error::Cancelled`] and store nothing.
    /// Returns the number of reads cancelled.
    pub fn cancel_reads(&self, key: &CacheKey) -> usize {
        let state = self.state();
        let mut count = 0;
        for flight in state.in_flight.values() {
            if key.covers(&flight.key) && !flight.token.is_cancelled() {
                flight.token.cancel();
                count += 1;
            }
        }
        if count > 0 {
            tracing::debug!(key = %key, cancelled = count, "Cancelled in-flight reads");
        }
        count
    }

    /// Serve `key` from the cache, or fetch it from `source`.
    ///
    /// The cached value is returned only if it is neither invalidated nor
    /// stale. Fetch failures leave any last-known value in place.
    ///
    /// # Errors
    ///
    /// Returns the data source's error, or [`Error::Cancelled`] if
    /// [`CacheStore::cancel_reads`] covered this key while it was in flight.
    ///
    /// Dropping the returned future mid-fetch releases the read.
    pub async fn read_through<S>(&self, key: &CacheKey, source: &S) -> Result<V>
    where
        S: DataSource<V> + ?Sized,
    {
        let (id, token) = {
            let mut guard = self.state();
            let state = &mut *guard;
            let now = Instant::now();
            if let Some(entry) = state.entries.get_mut(key)
                && !entry.needs_refetch_at(now)
            {
                entry.touch(now);
                state.counters.hits += 1;
                return Ok(entry.value().clone());
            }

            state.counters.misses += 1;
            let id = state.next_read;
            state.next_read += 1;
            let token = CancellationToken::new();
            state.in_flight.insert(
                id,
                InFlight {
                    key: key.clone(),
                    token: token.clone(),
                    invalidated: false,
                    superseded: false,
                },
            );
            (id, token)
        };

        let mut pending = PendingRead {
            inner: &*self.inner,
            id,
            armed: true,
        };
        tracing::debug!(key = %key, "Cache miss, fetching");
        let result = tokio::select! {
            biased;
            () = token.cancelled() => Err(Error::cancelled(key)),
            result = source.fetch(key) => result,
        };
        pending.disarm();
        self.finish_read(id, key, result)
    }

    fn finish_read(&self, id: u64, key: &CacheKey, result: Result<V>) -> Result<V> {
        let value = {
            let mut guard = self.state();
            let state = &mut *guard;

            let Some(flight) = state
                .in_flight
                .remove(&id)
                .filter(|flight| !flight.token.is_cancelled())
            else {
                state.counters.cancelled += 1;
                tracing::debug!(key = %key, "Read cancelled");
                return Err(Error::cancelled(key));
            };

            let value = match result {
                Ok(value) => value,
                Err(e) => {
                    state.counters.fetch_errors += 1;
                    tracing::warn!(key = %key, error = %e, "Fetch failed");
                    return Err(e);
                }
            };
            state.counters.fetches += 1;

            if flight.superseded {
                tracing::debug!(key = %key, "Fetched value superseded by a newer write");
                return Ok(state
                    .entries
                    .get(key)
                    .map_or(value, |entry| entry.value().clone()));
            }

            let stale_after = self.inner.options.stale.stale_after(key.class);
            let mut entry = CacheEntry::new(value.clone(), stale_after, Instant::now());
            if flight.invalidated {
                tracing::debug!(key = %key, "Key invalidated during fetch; storing as invalidated");
                entry = entry.mark_invalidated();
            }
            state.entries.insert(key.clone(), entry);
            value
        };

        self.emit(key.clone(), CacheChange::Written);
        Ok(value)
    }

    /// Subscribe to change notifications.
    #[must_use]
    pub fn notifications(&self) -> broadcast::Receiver<CacheNotification> {
        self.inner.notify.subscribe()
    }

    /// Drop entries that were neither read nor written within the retention
    /// window. Returns the number of entries evicted.
    pub fn collect_garbage(&self) -> usize {
        let now = Instant::now();
        let retention = self.inner.options.retention;
        let mut evicted = Vec::new();
        self.state().entries.retain(|key, entry| {
            let keep = now.saturating_duration_since(entry.last_accessed()) < retention;
            if !keep {
                evicted.push(key.clone());
            }
            keep
        });

        if !evicted.is_empty() {
            tracing::debug!(evicted = evicted.len(), "Garbage collected cache entries");
        }
        let count = evicted.len();
        for key in evicted {
            self.emit(key, CacheChange::Evicted);
        }
        count
    }

    /// Run [`CacheStore::collect_garbage`] every `interval` until `cancel` fires.
    pub fn spawn_gc(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        store.collect_garbage();
                    }
                }
            }
            tracing::debug!("Cache GC stopped");
        })
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.state();
        CacheStats {
            entries: state.entries.len(),
            invalidated: state.entries.values().filter(|e| e.is_invalidated()).count(),
            in_flight: state.in_flight.len(),
            hits: state.counters.hits,
            misses: state.counters.misses,
            fetches: state.counters.fetches,
            fetch_errors: state.counters.fetch_errors,
            cancelled: state.counters.cancelled,
        }
    }
}

impl CacheStore<serde_json::Value> {
    /// Current value for `key` decoded as `T`, without fetching.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the cached JSON does not match `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>> {
        self.get_value(key)
            .map(|value| {
                serde_json::from_value(value).map_err(|e| Error::decode(key, e.to_string()))
            })
            .transpose()
    }
}

impl<V> Default for CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for CacheStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .inner
            .state
            .lock()
            .map_or(0, |state| state.entries.len());
        f.debug_struct("CacheStore")
            .field("entries", &entries)
            .field("retention", &self.inner.options.retention)
            .finish()
    }
}
