//! Shared start/stop state for the engine's components.
//!
//! Every cache mutation made from a callback runs inside [`Lifecycle::enter`].
//! [`Lifecycle::shutdown`] cancels the token and then waits for callbacks that
//! already entered, so once it returns no further mutation can happen.

use pipedash_events::{EventChannel, Handler, Subscription};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;

/// Cancellation token plus a gate that `shutdown` drains.
#[derive(Debug, Default)]
pub struct Lifecycle {
    cancel: CancellationToken,
    gate: RwLock<()>,
}

impl Lifecycle {
    /// A live lifecycle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled by [`Lifecycle::shutdown`].
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Enter a mutation section, or `None` once shutdown has begun.
    ///
    /// Hold the guard for the whole mutation.
    #[must_use]
    pub fn enter(&self) -> Option<RwLockReadGuard<'_, ()>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let guard = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        // Re-check: shutdown may have started while we waited
        (!self.cancel.is_cancelled()).then_some(guard)
    }

    /// Cancel, then wait for every entered section to finish.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        drop(self.gate.write().unwrap_or_else(PoisonError::into_inner));
    }
}

/// Result of registering a component's handlers with a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registration {
    /// Event types now observed.
    pub subscribed: Vec<String>,
    /// Event types whose registration failed; they stay unobserved.
    pub failed: Vec<String>,
    /// Teardown began before every registration finished.
    pub interrupted: bool,
}

impl Registration {
    /// Fold `other` into `self`.
    pub fn merge(&mut self, other: Self) {
        self.subscribed.extend(other.subscribed);
        self.failed.extend(other.failed);
        self.interrupted |= other.interrupted;
    }

    /// Whether every attempted registration succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && !self.interrupted
    }
}

/// Active subscriptions owned by one component.
///
/// Registration is asynchronous; a registration that completes after
/// [`SubscriptionSet::teardown`] is released immediately instead of stored.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    active: Mutex<Vec<Subscription>>,
}

impl SubscriptionSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn active(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe `handler` to `event_type` and keep the handle.
    ///
    /// Returns `Ok(false)` if `lifecycle` was shut down while the channel was
    /// registering; the new subscription has then already been released.
    ///
    /// # Errors
    ///
    /// Returns the channel's error if registration fails.
    pub async fn add<C>(
        &self,
        channel: &C,
        lifecycle: &Lifecycle,
        event_type: &str,
        handler: Handler,
    ) -> pipedash_events::Result<bool>
    where
        C: EventChannel + ?Sized,
    {
        let subscription = channel.subscribe(event_type, handler).await?;

        let mut active = self.active();
        if lifecycle.is_cancelled() {
            drop(active);
            tracing::debug!(event_type, "Registration completed after teardown; releasing");
            subscription.unsubscribe();
            return Ok(false);
        }
        active.push(subscription);
        Ok(true)
    }

    /// Unsubscribe everything. Returns the number released.
    pub fn teardown(&self) -> usize {
        let drained: Vec<Subscription> = std::mem::take(&mut *self.active());
        let count = drained.len();
        for subscription in drained {
            subscription.unsubscribe();
        }
        count
    }

    /// Number of held subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.active().len()
    }

    /// Whether no subscriptions are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipedash_events::{EventBus, handler};

    #[test]
    fn test_enter_refused_after_shutdown() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.enter().is_some());

        lifecycle.shutdown();
        assert!(lifecycle.is_cancelled());
        assert!(lifecycle.enter().is_none());
    }

    #[test]
    fn test_shutdown_waits_for_entered_section() {
        let lifecycle = std::sync::Arc::new(Lifecycle::new());
        let guard = lifecycle.enter().unwrap();

        let stopper = {
            let lifecycle = std::sync::Arc::clone(&lifecycle);
            std::thread::spawn(move || lifecycle.shutdown())
        };

        // Shutdown cannot finish while the section is held
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!stopper.is_finished());

        drop(guard);
        stopper.join().unwrap();
        assert!(lifecycle.enter().is_none());
    }

    #[tokio::test]
    async fn test_subscription_set_teardown_releases_all() {
        let bus = EventBus::new();
        let lifecycle = Lifecycle::new();
        let set = SubscriptionSet::new();

        assert!(set.add(&bus, &lifecycle, "a", handler(|_| {})).await.unwrap());
        assert!(set.add(&bus, &lifecycle, "b", handler(|_| {})).await.unwrap());
        assert_eq!(set.len(), 2);
        assert_eq!(bus.total_subscribers(), 2);

        lifecycle.shutdown();
        assert_eq!(set.teardown(), 2);
        assert!(set.is_empty());
        assert_eq!(bus.total_subscribers(), 0);
    }

    #[tokio::test]
    async fn test_add_after_shutdown_releases_immediately() {
        let bus = EventBus::new();
        let lifecycle = Lifecycle::new();
        let set = SubscriptionSet::new();
        lifecycle.shutdown();

        assert!(!set.add(&bus, &lifecycle, "a", handler(|_| {})).await.unwrap());
        assert!(set.is_empty());
        assert_eq!(bus.total_subscribers(), 0);
    }
}
