//! The mutation surface the engine drives.

use pipedash_cache::{CacheKey, CacheStore, EntityClass};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Cache mutations issued by the router, batcher and reconnect policy.
///
/// [`CacheStore`] is the production implementation; [`RecordingSink`] logs
/// each call for tests and replay summaries.
pub trait CacheSink: Send + Sync {
    /// Overwrite `key` with an authoritative value.
    fn write(&self, key: CacheKey, value: Value);
    /// Invalidate `key` and the keys it covers.
    fn invalidate(&self, key: &CacheKey);
    /// Invalidate every key of `class`.
    fn invalidate_class(&self, class: EntityClass);
    /// Invalidate every key.
    fn invalidate_all(&self);
    /// Delete exactly `key`.
    fn remove(&self, key: &CacheKey);
}

impl CacheSink for CacheStore<Value> {
    fn write(&self, key: CacheKey, value: Value) {
        Self::write(self, key, value);
    }

    fn invalidate(&self, key: &CacheKey) {
        Self::invalidate(self, key);
    }

    fn invalidate_class(&self, class: EntityClass) {
        Self::invalidate_class(self, class);
    }

    fn invalidate_all(&self) {
        Self::invalidate_all(self);
    }

    fn remove(&self, key: &CacheKey) {
        Self::remove(self, key);
    }
}

impl<T: CacheSink + ?Sized> CacheSink for Arc<T> {
    fn write(&self, key: CacheKey, value: Value) {
        (**self).write(key, value);
    }

    fn invalidate(&self, key: &CacheKey) {
        (**self).invalidate(key);
    }

    fn invalidate_class(&self, class: EntityClass) {
        (**self).invalidate_class(class);
    }

    fn invalidate_all(&self) {
        (**self).invalidate_all();
    }

    fn remove(&self, key: &CacheKey) {
        (**self).remove(key);
    }
}

/// One recorded [`CacheSink`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SinkOp {
    /// `write(key, value)`
    Write {
        /// Target key.
        key: CacheKey,
        /// Written value.
        value: Value,
    },
    /// `invalidate(key)`
    Invalidate {
        /// Target key.
        key: CacheKey,
    },
    /// `invalidate_class(class)`
    InvalidateClass {
        /// Target class.
        class: EntityClass,
    },
    /// `invalidate_all()`
    InvalidateAll,
    /// `remove(key)`
    Remove {
        /// Target key.
        key: CacheKey,
    },
}

impl SinkOp {
    /// Short operation name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Write { .. } => "write",
            Self::Invalidate { .. } => "invalidate",
            Self::InvalidateClass { .. } => "invalidate_class",
            Self::InvalidateAll => "invalidate_all",
            Self::Remove { .. } => "remove",
        }
    }
}

/// A [`CacheSink`] that records every call, optionally forwarding it.
#[derive(Default)]
pub struct RecordingSink {
    ops: Mutex<Vec<SinkOp>>,
    inner: Option<Arc<dyn CacheSink>>,
}

impl RecordingSink {
    /// Record only.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record, then forward each call to `inner`.
    #[must_use]
    pub fn forwarding(inner: Arc<dyn CacheSink>) -> Self {
        Self {
            ops: Mutex::new(Vec::new()),
            inner: Some(inner),
        }
    }

    fn ops_mut(&self) -> MutexGuard<'_, Vec<SinkOp>> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, op: SinkOp) {
        self.ops_mut().push(op);
    }

    /// Snapshot of every call so far.
    #[must_use]
    pub fn ops(&self) -> Vec<SinkOp> {
        self.ops_mut().clone()
    }

    /// Drain the recorded calls.
    pub fn take(&self) -> Vec<SinkOp> {
        std::mem::take(&mut *self.ops_mut())
    }

    /// Number of calls recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops_mut().len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops_mut().is_empty()
    }

    /// Number of recorded calls equal to `op`.
    #[must_use]
    pub fn count(&self, op: &SinkOp) -> usize {
        self.ops_mut().iter().filter(|o| *o == op).count()
    }
}

impl CacheSink for RecordingSink {
    fn write(&self, key: CacheKey, value: Value) {
        self.record(SinkOp::Write {
            key: key.clone(),
            value: value.clone(),
        });
        if let Some(inner) = &self.inner {
            inner.write(key, value);
        }
    }

    fn invalidate(&self, key: &CacheKey) {
        self.record(SinkOp::Invalidate { key: key.clone() });
        if let Some(inner) = &self.inner {
            inner.invalidate(key);
        }
    }

    fn invalidate_class(&self, class: EntityClass) {
        self.record(SinkOp::InvalidateClass { class });
        if let Some(inner) = &self.inner {
            inner.invalidate_class(class);
        }
    }

    fn invalidate_all(&self) {
        self.record(SinkOp::InvalidateAll);
        if let Some(inner) = &self.inner {
            inner.invalidate_all();
        }
    }

    fn remove(&self, key: &CacheKey) {
        self.record(SinkOp::Remove { key: key.clone() });
        if let Some(inner) = &self.inner {
            inner.remove(key);
        }
    }
}

impl std::fmt::Debug for RecordingSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingSink")
            .field("ops", &self.len())
            .field("forwarding", &self.inner.is_some())
            .finish()
    }
}
