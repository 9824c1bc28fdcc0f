//! In-process `EventBus` implementing [`EventChannel`].
//!
//! Handlers are invoked synchronously from [`EventBus::publish`], in
//! registration order, so delivery within one subscription is FIFO by
//! construction. Transports that receive events over a socket feed them into
//! a bus (see [`crate::bridge`]).

use crate::channel::{EventChannel, Handler, Subscription};
use crate::event::{CONNECTION_STATUS_EVENT, ConnectionStatusPayload};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

struct Registered {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
struct BusInner {
    handlers: Mutex<HashMap<String, Vec<Registered>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl BusInner {
    fn handlers(&self) -> MutexGuard<'_, HashMap<String, Vec<Registered>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, event_type: &str, id: u64) {
        let mut handlers = self.handlers();
        if let Some(list) = handlers.get_mut(event_type) {
            list.retain(|r| r.id != id);
            if list.is_empty() {
                handlers.remove(event_type);
            }
        }
    }
}

/// Multi-subscriber event bus keyed by event type.
///
/// Cloning the bus yields another handle to the same subscriptions.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler without going through the async trait.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after [`EventBus::shutdown`].
    pub fn subscribe_now(&self, event_type: &str, handler: Handler) -> Result<Subscription> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers()
            .entry(event_type.to_string())
            .or_default()
            .push(Registered { id, handler });

        tracing::trace!(event_type, id, "Handler registered");

        let weak: Weak<BusInner> = Arc::downgrade(&self.inner);
        let key = event_type.to_string();
        Ok(Subscription::new(event_type, id, move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove(&key, id);
                tracing::trace!(event_type = %key, id, "Handler unregistered");
            }
        }))
    }

    /// Deliver `payload` to every handler registered for `event_type`.
    ///
    /// Returns the number of handlers invoked. The handler list is snapshotted
    /// before delivery, so handlers may subscribe or unsubscribe re-entrantly.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after [`EventBus::shutdown`].
    pub fn publish(&self, event_type: &str, payload: serde_json::Value) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let targets: Vec<Handler> = self
            .inner
            .handlers()
            .get(event_type)
            .map(|list| list.iter().map(|r| Arc::clone(&r.handler)).collect())
            .unwrap_or_default();

        if targets.is_empty() {
            tracing::trace!(event_type, "No handlers for event");
        }

        for handler in &targets {
            handler(payload.clone());
        }
        Ok(targets.len())
    }

    /// Publish a connection-state transition on [`CONNECTION_STATUS_EVENT`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after [`EventBus::shutdown`].
    pub fn publish_status(&self, status: ConnectionStatusPayload) -> Result<usize> {
        tracing::debug!(
            status = %status.status,
            reconnect_attempts = status.reconnect_attempts,
            "Connection status changed"
        );
        self.publish(CONNECTION_STATUS_EVENT, status.to_value())
    }

    /// Shut the bus down and drop every registered handler.
    ///
    /// Safe to call multiple times.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.handlers().clear();
    }

    /// Whether [`EventBus::shutdown`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of handlers registered for `event_type`.
    #[must_use]
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.inner.handlers().get(event_type).map_or(0, Vec::len)
    }

    /// Number of handlers registered across all event types.
    #[must_use]
    pub fn total_subscribers(&self) -> usize {
        self.inner.handlers().values().map(Vec::len).sum()
    }
}

#[async_trait]
impl EventChannel for EventBus {
    async fn subscribe(&self, event_type: &str, handler: Handler) -> Result<Subscription> {
        self.subscribe_now(event_type, handler)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.total_subscribers())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::handler;
    use serde_json::json;

    fn recording() -> (Handler, Arc<Mutex<Vec<serde_json::Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let h = handler(move |payload| sink.lock().unwrap().push(payload));
        (h, seen)
    }

    #[test]
    fn test_publish_reaches_matching_handlers_only() {
        let bus = EventBus::new();
        let (h1, seen1) = recording();
        let (h2, seen2) = recording();
        let _a = bus.subscribe_now("pipelines-updated", h1).unwrap();
        let _b = bus.subscribe_now("provider-added", h2).unwrap();

        let delivered = bus
            .publish("pipelines-updated", json!({"providerId": 1}))
            .unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(seen1.lock().unwrap().len(), 1);
        assert!(seen2.lock().unwrap().is_empty());
    }

    #[test]
    fn test_delivery_is_fifo_within_subscription() {
        let bus = EventBus::new();
        let (h, seen) = recording();
        let _sub = bus.subscribe_now("run-history-updated", h).unwrap();

        for n in 0..5 {
            bus.publish("run-history-updated", json!({"pipelineId": n}))
                .unwrap();
        }

        let ids: Vec<i64> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|v| v["pipelineId"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (h, seen) = recording();
        let sub = bus.subscribe_now("metrics-updated", h).unwrap();
        assert_eq!(bus.subscriber_count("metrics-updated"), 1);

        sub.unsubscribe();
        assert_eq!(bus.subscriber_count("metrics-updated"), 0);
        assert_eq!(bus.publish("metrics-updated", json!({})).unwrap(), 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_subscription_outliving_bus_is_harmless() {
        let sub = {
            let bus = EventBus::new();
            bus.subscribe_now("x", handler(|_| {})).unwrap()
        };
        // Bus is gone; unsubscribing must not panic.
        sub.unsubscribe();
    }

    #[test]
    fn test_handler_may_unsubscribe_reentrantly() {
        let bus = EventBus::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_in_handler = Arc::clone(&slot);
        let sub = bus
            .subscribe_now(
                "provider-removed",
                handler(move |_| {
                    slot_in_handler.lock().unwrap().take();
                }),
            )
            .unwrap();
        *slot.lock().unwrap() = Some(sub);

        assert_eq!(bus.publish("provider-removed", json!({})).unwrap(), 1);
        assert_eq!(bus.subscriber_count("provider-removed"), 0);
    }

    #[test]
    fn test_shutdown_rejects_new_work() {
        let bus = EventBus::new();
        let _sub = bus.subscribe_now("x", handler(|_| {})).unwrap();
        bus.shutdown();
        bus.shutdown();

        assert!(bus.is_closed());
        assert_eq!(bus.total_subscribers(), 0);
        assert!(matches!(bus.publish("x", json!(1)), Err(Error::Closed)));
        assert!(matches!(
            bus.subscribe_now("x", handler(|_| {})),
            Err(Error::Closed)
        ));
    }

    #[test]
    fn test_publish_status_uses_reserved_event_type() {
        let bus = EventBus::new();
        let (h, seen) = recording();
        let _sub = bus.subscribe_now(CONNECTION_STATUS_EVENT, h).unwrap();

        bus.publish_status(ConnectionStatusPayload::reconnecting(2))
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen[0],
            json!({"status": "reconnecting", "reconnectAttempts": 2})
        );
    }

    #[tokio::test]
    async fn test_trait_subscribe_matches_subscribe_now() {
        let bus = EventBus::new();
        let channel: &dyn EventChannel = &bus;
        let sub = channel
            .subscribe("plugins-changed", handler(|_| {}))
            .await
            .unwrap();
        assert_eq!(sub.event_type(), "plugins-changed");
        assert_eq!(bus.subscriber_count("plugins-changed"), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count("plugins-changed"), 0);
    }

    #[test]
    fn test_event_bus_debug() {
        let bus = EventBus::new();
        let debug_str = format!("{bus:?}");
        assert!(debug_str.contains("EventBus"));
        assert!(debug_str.contains("subscribers: 0"));
    }
}
