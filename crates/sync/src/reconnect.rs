//! Resynchronization after connectivity gaps.
//!
//! Events pushed while the channel was down are lost. The policy does not try
//! to work out which; on reconnect it invalidates broadly so every view
//! converges on its next read.

use crate::batcher::InvalidationBatcher;
use crate::lifecycle::{Lifecycle, Registration, SubscriptionSet};
use crate::sink::CacheSink;
use pipedash_cache::EntityClass;
use pipedash_events::{
    CONNECTION_STATUS_EVENT, ConnectionStatus, ConnectionStatusPayload, EventChannel, handler,
};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

struct ReconnectCore {
    sink: Arc<dyn CacheSink>,
    batcher: InvalidationBatcher,
    lifecycle: Arc<Lifecycle>,
    critical: Vec<EntityClass>,
    was_disconnected: AtomicBool,
    passes: AtomicU64,
}

impl ReconnectCore {
    fn observe(&self, status: ConnectionStatus) -> bool {
        let Some(_section) = self.lifecycle.enter() else {
            return false;
        };

        match status {
            ConnectionStatus::Disconnected | ConnectionStatus::Reconnecting => {
                if !self.was_disconnected.swap(true, Ordering::SeqCst) {
                    tracing::info!(status = %status, "Event channel lost; resync armed");
                }
                false
            }
            ConnectionStatus::Connected => {
                if !self.was_disconnected.swap(false, Ordering::SeqCst) {
                    tracing::debug!("Event channel connected; no gap to recover");
                    return false;
                }
                self.resync();
                true
            }
        }
    }

    fn resync(&self) {
        let pass = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            pass,
            critical = ?self.critical,
            "Reconnected after a gap; forcing resynchronization"
        );

        for class in &self.critical {
            self.sink.invalidate_class(*class);
        }
        for class in EntityClass::ALL {
            if !self.critical.contains(&class) {
                self.batcher.schedule_all(class);
            }
        }
    }

    fn handle_payload(&self, payload: &Value) -> bool {
        let status = ConnectionStatusPayload::from_value(payload).map_or_else(
            || {
                tracing::warn!(%payload, "Malformed connection status; assuming disconnected");
                ConnectionStatus::Disconnected
            },
            |parsed| {
                tracing::debug!(
                    status = %parsed.status,
                    reconnect_attempts = parsed.reconnect_attempts,
                    "Connection status received"
                );
                parsed.status
            },
        );
        self.observe(status)
    }
}

/// Watches the connection-status stream and forces a resync after any gap.
///
/// Only the derived `was_disconnected` flag is kept. The first `connected`
/// at startup does nothing; the first `connected` after a `disconnected` or
/// `reconnecting` triggers exactly one pass.
#[derive(Clone)]
pub struct ReconnectPolicy {
    core: Arc<ReconnectCore>,
    subscriptions: Arc<SubscriptionSet>,
}

impl ReconnectPolicy {
    /// Create a policy invalidating `critical` immediately on reconnect and
    /// every other class through `batcher`.
    ///
    /// [`EntityClass::Providers`] is always treated as critical.
    #[must_use]
    pub fn new(
        sink: Arc<dyn CacheSink>,
        batcher: InvalidationBatcher,
        lifecycle: Arc<Lifecycle>,
        critical: impl IntoIterator<Item = EntityClass>,
    ) -> Self {
        let mut critical: Vec<EntityClass> = critical.into_iter().collect();
        critical.push(EntityClass::Providers);
        critical.sort();
        critical.dedup();

        Self {
            core: Arc::new(ReconnectCore {
                sink,
                batcher,
                lifecycle,
                critical,
                was_disconnected: AtomicBool::new(false),
                passes: AtomicU64::new(0),
            }),
            subscriptions: Arc::new(SubscriptionSet::new()),
        }
    }

    /// Feed one status transition. Returns whether a resync pass ran.
    pub fn observe(&self, status: ConnectionStatus) -> bool {
        self.core.observe(status)
    }

    /// Feed one raw connection-status payload.
    ///
    /// A payload that does not parse is treated as `disconnected`, so the
    /// next `connected` resyncs.
    pub fn handle_payload(&self, payload: &Value) -> bool {
        self.core.handle_payload(payload)
    }

    /// Whether a gap is currently being tracked.
    #[must_use]
    pub fn was_disconnected(&self) -> bool {
        self.core.was_disconnected.load(Ordering::SeqCst)
    }

    /// Number of resync passes run so far.
    #[must_use]
    pub fn passes(&self) -> u64 {
        self.core.passes.load(Ordering::SeqCst)
    }

    /// Classes invalidated immediately on reconnect.
    #[must_use]
    pub fn critical_classes(&self) -> &[EntityClass] {
        &self.core.critical
    }

    /// Subscribe to [`CONNECTION_STATUS_EVENT`] on `channel`.
    pub async fn register<C>(&self, channel: &C) -> Registration
    where
        C: EventChannel + ?Sized,
    {
        let mut report = Registration::default();
        if self.core.lifecycle.is_cancelled() {
            report.interrupted = true;
            return report;
        }

        let core = Arc::clone(&self.core);
        let on_status = handler(move |payload| {
            core.handle_payload(&payload);
        });
        match self
            .subscriptions
            .add(channel, &self.core.lifecycle, CONNECTION_STATUS_EVENT, on_status)
            .await
        {
            Ok(true) => report.subscribed.push(CONNECTION_STATUS_EVENT.to_string()),
            Ok(false) => report.interrupted = true,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Failed to subscribe to connection status; reconnects will not resync"
                );
                report.failed.push(CONNECTION_STATUS_EVENT.to_string());
            }
        }
        report
    }

    /// Unsubscribe. Returns the number of subscriptions released.
    pub fn teardown(&self) -> usize {
        self.subscriptions.teardown()
    }

    /// Number of subscriptions currently held.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }
}

impl fmt::Debug for ReconnectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectPolicy")
            .field("critical", &self.core.critical)
            .field("was_disconnected", &self.was_disconnected())
            .field("passes", &self.passes())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{RecordingSink, SinkOp};
    use serde_json::json;
    use std::time::Duration;

    fn policy() -> (ReconnectPolicy, Arc<RecordingSink>, InvalidationBatcher) {
        let sink = Arc::new(RecordingSink::new());
        let lifecycle = Arc::new(Lifecycle::new());
        let batcher = InvalidationBatcher::new(
            sink.clone(),
            Duration::from_millis(300),
            Arc::clone(&lifecycle),
        );
        let policy = ReconnectPolicy::new(
            sink.clone(),
            batcher.clone(),
            lifecycle,
            [EntityClass::Pipelines],
        );
        (policy, sink, batcher)
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_connected_does_nothing() {
        let (policy, sink, batcher) = policy();
        assert!(!policy.observe(ConnectionStatus::Connected));
        assert!(!policy.observe(ConnectionStatus::Connected));
        assert!(sink.is_empty());
        assert!(batcher.pending_classes().is_empty());
        assert_eq!(policy.passes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_triggers_exactly_one_pass() {
        let (policy, sink, batcher) = policy();
        policy.observe(ConnectionStatus::Connected);
        policy.observe(ConnectionStatus::Disconnected);
        policy.observe(ConnectionStatus::Reconnecting);
        assert!(policy.was_disconnected());

        assert!(policy.observe(ConnectionStatus::Connected));
        assert!(!policy.observe(ConnectionStatus::Connected));
        assert_eq!(policy.passes(), 1);
        assert!(!policy.was_disconnected());

        // Critical classes immediately, in sorted order
        assert_eq!(
            sink.ops(),
            vec![
                SinkOp::InvalidateClass {
                    class: EntityClass::Pipelines
                },
                SinkOp::InvalidateClass {
                    class: EntityClass::Providers
                },
            ]
        );
        // Everything else through the batcher
        assert_eq!(batcher.pending_classes().len(), EntityClass::ALL.len() - 2);
        assert!(batcher.pending(EntityClass::Runs).unwrap().invalidate_all());
    }

    #[tokio::test(start_paused = true)]
    async fn test_providers_always_critical() {
        let sink = Arc::new(RecordingSink::new());
        let lifecycle = Arc::new(Lifecycle::new());
        let batcher = InvalidationBatcher::new(
            sink.clone(),
            Duration::from_millis(300),
            Arc::clone(&lifecycle),
        );
        let policy = ReconnectPolicy::new(sink, batcher, lifecycle, []);
        assert_eq!(policy.critical_classes(), &[EntityClass::Providers]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_parsing() {
        let (policy, _, _) = policy();
        assert!(!policy.handle_payload(&json!({"status": "connected", "reconnectAttempts": 0})));
        assert!(!policy.handle_payload(&json!({"status": "reconnecting", "reconnectAttempts": 2})));
        assert!(policy.handle_payload(&json!({"status": "connected"})));
        assert_eq!(policy.passes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_counts_as_disconnect() {
        let (policy, _, _) = policy();
        assert!(!policy.handle_payload(&json!({"status": "flaky"})));
        assert!(policy.was_disconnected());
        assert!(policy.handle_payload(&json!({"status": "connected"})));
    }
}
