//! The engine owning router, batcher and reconnect policy.

use crate::batcher::InvalidationBatcher;
use crate::config::SyncConfig;
use crate::lifecycle::{Lifecycle, Registration};
use crate::reconnect::ReconnectPolicy;
use crate::router::EventRouter;
use crate::sink::CacheSink;
use crate::{Error, Result};
use pipedash_cache::CacheStore;
use pipedash_events::EventChannel;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Stopped,
}

/// Keeps a cache consistent with backend push notifications.
///
/// Lifecycle is explicit: [`SyncEngine::start`] registers with a channel and
/// [`SyncEngine::stop`] tears everything down. An engine is single-use.
pub struct SyncEngine {
    config: SyncConfig,
    lifecycle: Arc<Lifecycle>,
    batcher: InvalidationBatcher,
    router: EventRouter,
    reconnect: ReconnectPolicy,
    store: Option<CacheStore<Value>>,
    state: Mutex<State>,
    gc: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Build an engine driving `sink`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` fails validation.
    pub fn new(sink: Arc<dyn CacheSink>, config: SyncConfig) -> Result<Self> {
        Self::build(sink, None, config)
    }

    /// Build an engine driving `store`, also running its retention GC while
    /// started.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` fails validation.
    pub fn with_store(store: CacheStore<Value>, config: SyncConfig) -> Result<Self> {
        Self::build(Arc::new(store.clone()), Some(store), config)
    }

    fn build(
        sink: Arc<dyn CacheSink>,
        store: Option<CacheStore<Value>>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;

        let lifecycle = Arc::new(Lifecycle::new());
        let batcher = InvalidationBatcher::new(
            Arc::clone(&sink),
            config.batch_window(),
            Arc::clone(&lifecycle),
        );
        let router = EventRouter::new(Arc::clone(&sink), batcher.clone(), Arc::clone(&lifecycle));
        let reconnect = ReconnectPolicy::new(
            sink,
            batcher.clone(),
            Arc::clone(&lifecycle),
            config.critical_classes.iter().copied(),
        );

        Ok(Self {
            config,
            lifecycle,
            batcher,
            router,
            reconnect,
            store,
            state: Mutex::new(State::Idle),
            gc: Mutex::new(None),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to `channel` and begin applying events.
    ///
    /// Individual subscription failures do not fail the start; they are
    /// logged and listed in the returned [`Registration`]. If [`SyncEngine::stop`]
    /// runs while registrations are in flight, those registrations are
    /// released as they complete and the report is marked interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] if running, [`Error::Stopped`] if
    /// the engine was stopped.
    pub async fn start<C>(&self, channel: &C) -> Result<Registration>
    where
        C: EventChannel + ?Sized,
    {
        {
            let mut state = self.state();
            match *state {
                State::Idle => *state = State::Running,
                State::Running => return Err(Error::AlreadyStarted),
                State::Stopped => return Err(Error::Stopped),
            }
        }

        tracing::info!(
            batch_window_ms = self.config.batch_window_ms,
            critical = ?self.reconnect.critical_classes(),
            "Starting sync engine"
        );

        if let Some(store) = &self.store
            && tokio::runtime::Handle::try_current().is_ok()
        {
            let handle = store.spawn_gc(self.config.gc_interval(), self.lifecycle.token().clone());
            *self.gc.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }

        // Connection status first so a drop during setup is not missed
        let mut report = self.reconnect.register(channel).await;
        report.merge(self.router.register(channel).await);

        if report.failed.is_empty() {
            tracing::info!(subscribed = report.subscribed.len(), "Sync engine started");
        } else {
            tracing::warn!(
                subscribed = report.subscribed.len(),
                failed = ?report.failed,
                "Sync engine started with unobserved event types"
            );
        }
        Ok(report)
    }

    /// Stop the engine.
    ///
    /// When this returns, no handler or timer will touch the cache again and
    /// every subscription, including ones still registering, is released.
    /// Invalidations still pending in the batcher are applied before return.
    /// Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.state();
            if *state == State::Stopped {
                return;
            }
            *state = State::Stopped;
        }

        self.lifecycle.shutdown();
        let released = self.router.teardown() + self.reconnect.teardown();
        let flushed = self.batcher.flush_all();
        if let Some(gc) = self.gc.lock().unwrap_or_else(PoisonError::into_inner).take() {
            // Exits on the cancelled token; detach
            drop(gc);
        }

        tracing::info!(released, flushed, "Sync engine stopped");
    }

    /// Whether [`SyncEngine::start`] succeeded and [`SyncEngine::stop`] has not run.
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.state() == State::Running
    }

    /// Active subscriptions across router and reconnect policy.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.router.active_subscriptions() + self.reconnect.active_subscriptions()
    }

    /// The effective configuration.
    #[must_use]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The event router.
    #[must_use]
    pub const fn router(&self) -> &EventRouter {
        &self.router
    }

    /// The reconnect policy.
    #[must_use]
    pub const fn reconnect(&self) -> &ReconnectPolicy {
        &self.reconnect
    }

    /// The invalidation batcher.
    #[must_use]
    pub const fn batcher(&self) -> &InvalidationBatcher {
        &self.batcher
    }

    /// The store, when built with [`SyncEngine::with_store`].
    #[must_use]
    pub const fn store(&self) -> Option<&CacheStore<Value>> {
        self.store.as_ref()
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("state", &*self.state())
            .field("config", &self.config)
            .field("subscriptions", &self.active_subscriptions())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipedash_events::EventBus;

    #[test]
    fn test_rejects_invalid_config() {
        let config = SyncConfig {
            batch_window_ms: 0,
            ..SyncConfig::default()
        };
        let err = SyncEngine::with_store(CacheStore::new(), config).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_start_twice_and_restart_after_stop() {
        let bus = EventBus::new();
        let engine = SyncEngine::with_store(CacheStore::new(), SyncConfig::default()).unwrap();

        let report = engine.start(&bus).await.unwrap();
        assert!(report.is_complete());
        assert!(engine.is_running());
        assert!(matches!(engine.start(&bus).await, Err(Error::AlreadyStarted)));

        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
        assert!(matches!(engine.start(&bus).await, Err(Error::Stopped)));
    }

    #[tokio::test]
    async fn test_drop_releases_subscriptions() {
        let bus = EventBus::new();
        {
            let engine = SyncEngine::with_store(CacheStore::new(), SyncConfig::default()).unwrap();
            engine.start(&bus).await.unwrap();
            assert!(bus.total_subscribers() > 0);
        }
        assert_eq!(bus.total_subscribers(), 0);
    }
}
