//! Fixed-window coalescing of invalidation requests.
//!
//! Each entity class has at most one pending batch and one timer. The timer is
//! armed by the first request and never pushed back by later ones, so a burst
//! of any length is applied at most one window after it began.

use crate::lifecycle::Lifecycle;
use crate::sink::CacheSink;
use pipedash_cache::{CacheKey, EntityClass, Qualifier};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;

/// Requests accumulated for one class during the current window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingBatch {
    qualifiers: BTreeSet<Qualifier>,
    invalidate_all: bool,
    generation: u64,
}

impl PendingBatch {
    /// Qualifiers scheduled individually.
    pub fn qualifiers(&self) -> impl Iterator<Item = &Qualifier> {
        self.qualifiers.iter()
    }

    /// Whether the whole class will be invalidated.
    #[must_use]
    pub const fn invalidate_all(&self) -> bool {
        self.invalidate_all
    }
}

#[derive(Default)]
struct Pending {
    batches: HashMap<EntityClass, PendingBatch>,
    next_generation: u64,
}

struct BatcherInner {
    sink: Arc<dyn CacheSink>,
    window: Duration,
    lifecycle: Arc<Lifecycle>,
    pending: Mutex<Pending>,
    runtime: Option<Handle>,
}

impl BatcherInner {
    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply the batch for `class` if it is still the one armed as `generation`.
    fn flush_generation(&self, class: EntityClass, generation: u64) {
        let batch = {
            let mut pending = self.pending();
            match pending.batches.get(&class) {
                Some(batch) if batch.generation == generation => pending.batches.remove(&class),
                _ => None,
            }
        };
        if let Some(batch) = batch {
            self.apply(class, batch);
        }
    }

    fn apply(&self, class: EntityClass, batch: PendingBatch) {
        if batch.invalidate_all {
            tracing::debug!(
                class = %class,
                superseded = batch.qualifiers.len(),
                "Flushing batched class invalidation"
            );
            self.sink.invalidate_class(class);
            return;
        }

        tracing::debug!(
            class = %class,
            qualifiers = batch.qualifiers.len(),
            "Flushing batched invalidations"
        );
        for qualifier in batch.qualifiers {
            self.sink.invalidate(&CacheKey::qualified(class, qualifier));
        }
    }
}

/// Coalesces invalidations per entity class over a fixed window.
///
/// Cloning yields another handle to the same pending state.
#[derive(Clone)]
pub struct InvalidationBatcher {
    inner: Arc<BatcherInner>,
}

impl InvalidationBatcher {
    /// Create a batcher flushing into `sink` every `window`.
    ///
    /// Timers run on the current tokio runtime, or on the runtime the batcher
    /// was created in. Without any runtime, requests are applied immediately.
    #[must_use]
    pub fn new(sink: Arc<dyn CacheSink>, window: Duration, lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                sink,
                window,
                lifecycle,
                pending: Mutex::new(Pending::default()),
                runtime: Handle::try_current().ok(),
            }),
        }
    }

    /// The coalescing window.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// Schedule invalidation of `qualifier` within `class`.
    ///
    /// An empty qualifier is the whole class.
    pub fn schedule_qualifier(&self, class: EntityClass, qualifier: Qualifier) {
        if qualifier.is_empty() {
            self.schedule_all(class);
            return;
        }
        self.schedule(class, |batch| {
            batch.qualifiers.insert(qualifier);
        });
    }

    /// Schedule invalidation of every key of `class`.
    ///
    /// Supersedes any qualifiers already pending for the class.
    pub fn schedule_all(&self, class: EntityClass) {
        self.schedule(class, |batch| batch.invalidate_all = true);
    }

    fn schedule(&self, class: EntityClass, update: impl FnOnce(&mut PendingBatch)) {
        if self.inner.lifecycle.is_cancelled() {
            tracing::trace!(class = %class, "Batcher stopped; dropping request");
            return;
        }

        let armed = {
            let mut guard = self.inner.pending();
            let pending = &mut *guard;
            let fresh = !pending.batches.contains_key(&class);
            let generation = pending.next_generation;
            let batch = pending.batches.entry(class).or_insert_with(|| PendingBatch {
                generation,
                ..PendingBatch::default()
            });
            update(batch);
            if fresh {
                pending.next_generation += 1;
            }
            fresh.then_some(generation)
        };

        if let Some(generation) = armed {
            self.arm(class, generation);
        }
    }

    fn arm(&self, class: EntityClass, generation: u64) {
        let Some(runtime) = Handle::try_current().ok().or_else(|| self.inner.runtime.clone())
        else {
            tracing::trace!(class = %class, "No runtime for batch timer; flushing now");
            self.inner.flush_generation(class, generation);
            return;
        };

        tracing::trace!(
            class = %class,
            window_ms = self.inner.window.as_millis(),
            "Batch timer armed"
        );
        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            let token = inner.lifecycle.token().clone();
            tokio::select! {
                biased;
                () = token.cancelled() => {}
                () = tokio::time::sleep(inner.window) => {
                    if let Some(_section) = inner.lifecycle.enter() {
                        inner.flush_generation(class, generation);
                    }
                }
            }
        });
    }

    /// Apply the pending batch for `class` now.
    pub fn flush(&self, class: EntityClass) {
        let batch = self.inner.pending().batches.remove(&class);
        if let Some(batch) = batch {
            self.inner.apply(class, batch);
        }
    }

    /// Apply every pending batch now. Returns the number of classes flushed.
    pub fn flush_all(&self) -> usize {
        let mut batches: Vec<(EntityClass, PendingBatch)> =
            self.inner.pending().batches.drain().collect();
        batches.sort_by_key(|(class, _)| *class);
        let count = batches.len();
        for (class, batch) in batches {
            self.inner.apply(class, batch);
        }
        count
    }

    /// Snapshot of the batch pending for `class`.
    #[must_use]
    pub fn pending(&self, class: EntityClass) -> Option<PendingBatch> {
        self.inner.pending().batches.get(&class).cloned()
    }

    /// Classes with a pending batch, sorted.
    #[must_use]
    pub fn pending_classes(&self) -> Vec<EntityClass> {
        let mut classes: Vec<EntityClass> = self.inner.pending().batches.keys().copied().collect();
        classes.sort();
        classes
    }
}

impl fmt::Debug for InvalidationBatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationBatcher")
            .field("window", &self.inner.window)
            .field("pending", &self.pending_classes())
            .finish_non_exhaustive()
    }
}
