//! Cached values and their freshness metadata.

use crate::key::EntityClass;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Last-known value for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    value: V,
    fetched_at: Instant,
    updated_at: DateTime<Utc>,
    stale_after: Duration,
    invalidated: bool,
    last_accessed: Instant,
}

impl<V> CacheEntry<V> {
    pub(crate) fn new(value: V, stale_after: Duration, now: Instant) -> Self {
        Self {
            value,
            fetched_at: now,
            updated_at: Utc::now(),
            stale_after,
            invalidated: false,
            last_accessed: now,
        }
    }

    /// The cached value.
    #[must_use]
    pub const fn value(&self) -> &V {
        &self.value
    }

    /// Consume the entry, returning the value.
    #[must_use]
    pub fn into_value(self) -> V {
        self.value
    }

    /// Monotonic time of the last write.
    #[must_use]
    pub const fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    /// Wall-clock time of the last write, for display.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Freshness window applied to this entry.
    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Whether the entry was explicitly invalidated since its last write.
    #[must_use]
    pub const fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// Whether the freshness window has elapsed at `now`.
    #[must_use]
    pub fn is_stale_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) >= self.stale_after
    }

    /// Whether a read at `now` must go to the data source.
    ///
    /// Invalidation wins over the freshness window.
    #[must_use]
    pub fn needs_refetch_at(&self, now: Instant) -> bool {
        self.invalidated || self.is_stale_at(now)
    }

    pub(crate) const fn last_accessed(&self) -> Instant {
        self.last_accessed
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_accessed = now;
    }

    /// Mark invalidated. Returns `true` if the flag was newly set.
    pub(crate) fn invalidate(&mut self) -> bool {
        !std::mem::replace(&mut self.invalidated, true)
    }

    pub(crate) fn mark_invalidated(mut self) -> Self {
        self.invalidated = true;
        self
    }
}

/// Per-class freshness windows.
#[derive(Debug, Clone, Default)]
pub struct StalePolicy {
    overrides: HashMap<EntityClass, Duration>,
}

impl StalePolicy {
    /// Policy using [`EntityClass::default_stale_after`] for every class.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the window for one class.
    #[must_use]
    pub fn with_override(mut self, class: EntityClass, stale_after: Duration) -> Self {
        self.overrides.insert(class, stale_after);
        self
    }

    /// Window applied to entries of `class`.
    #[must_use]
    pub fn stale_after(&self, class: EntityClass) -> Duration {
        self.overrides
            .get(&class)
            .copied()
            .unwrap_or_else(|| class.default_stale_after())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_goes_stale_after_window() {
        let now = Instant::now();
        let entry = CacheEntry::new(1, Duration::from_secs(10), now);

        assert!(!entry.is_stale_at(now));
        assert!(!entry.needs_refetch_at(now + Duration::from_secs(9)));
        assert!(entry.needs_refetch_at(now + Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidation_dominates_freshness() {
        let now = Instant::now();
        let mut entry = CacheEntry::new("v", Duration::from_secs(3600), now);

        assert!(entry.invalidate());
        assert!(!entry.invalidate());
        assert!(entry.is_invalidated());
        assert!(!entry.is_stale_at(now));
        assert!(entry.needs_refetch_at(now));
        assert_eq!(*entry.value(), "v");
    }

    #[test]
    fn test_stale_policy_overrides() {
        let policy = StalePolicy::new().with_override(EntityClass::Runs, Duration::from_secs(1));
        assert_eq!(policy.stale_after(EntityClass::Runs), Duration::from_secs(1));
        assert_eq!(
            policy.stale_after(EntityClass::Plugins),
            EntityClass::Plugins.default_stale_after()
        );
    }
}
