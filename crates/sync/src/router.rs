//! Per-event-type dispatch into the cache.
//!
//! Each payload is validated before use. A payload that cannot be trusted is
//! never an error: the router invalidates more broadly instead.

use crate::batcher::InvalidationBatcher;
use crate::kind::EventKind;
use crate::lifecycle::{Lifecycle, Registration, SubscriptionSet};
use crate::sink::CacheSink;
use pipedash_cache::{CacheKey, EntityClass, Qualifier, QualifierValue};
use pipedash_events::{EventChannel, handler};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// What the router did with one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The event's own strategy was applied.
    Applied,
    /// The payload was malformed; a broader invalidation was applied instead.
    Fallback,
    /// The router was stopped; nothing was touched.
    Ignored,
}

fn identifier(payload: &Value, field: &str) -> Option<QualifierValue> {
    payload.get(field).and_then(QualifierValue::from_json)
}

fn qualifier(payload: &Value, field: &str) -> Option<Qualifier> {
    identifier(payload, field).map(|value| Qualifier::of(field, value))
}

struct RouterCore {
    sink: Arc<dyn CacheSink>,
    batcher: InvalidationBatcher,
    lifecycle: Arc<Lifecycle>,
}

impl RouterCore {
    fn handle(&self, kind: EventKind, payload: &Value) -> Outcome {
        let Some(_section) = self.lifecycle.enter() else {
            tracing::trace!(event_type = %kind, "Router stopped; ignoring event");
            return Outcome::Ignored;
        };
        tracing::debug!(event_type = %kind, "Routing event");
        self.dispatch(kind, payload)
    }

    fn dispatch(&self, kind: EventKind, payload: &Value) -> Outcome {
        match kind {
            EventKind::PipelinesUpdated => {
                self.direct_write(kind, payload, Some("providerId"), "pipelines", Value::is_array)
            }
            EventKind::CacheStatsUpdated => {
                self.direct_write(kind, payload, None, "stats", Value::is_object)
            }
            EventKind::TablePreferencesChanged => {
                self.direct_write(kind, payload, Some("tableId"), "preferences", Value::is_object)
            }
            EventKind::PipelineStatusChanged => {
                let Some(provider) = qualifier(payload, "providerId") else {
                    return self.fallback(kind, "providerId");
                };
                self.batcher
                    .schedule_qualifier(EntityClass::Pipelines, provider);
                match payload.get("pipelineId") {
                    None | Some(Value::Null) => Outcome::Applied,
                    Some(raw) => {
                        if let Some(id) = QualifierValue::from_json(raw) {
                            let pipeline = Qualifier::of("pipelineId", id);
                            self.batcher
                                .schedule_qualifier(EntityClass::Runs, pipeline.clone());
                            self.batcher
                                .schedule_qualifier(EntityClass::Metrics, pipeline);
                            Outcome::Applied
                        } else {
                            tracing::warn!(
                                event_type = %kind,
                                field = "pipelineId",
                                "Malformed pipeline identifier; invalidating runs and metrics"
                            );
                            self.batcher.schedule_all(EntityClass::Runs);
                            self.batcher.schedule_all(EntityClass::Metrics);
                            Outcome::Fallback
                        }
                    }
                }
            }
            EventKind::RunHistoryUpdated | EventKind::MetricsUpdated => {
                let Some(pipeline) = qualifier(payload, "pipelineId") else {
                    return self.fallback(kind, "pipelineId");
                };
                self.batcher
                    .schedule_qualifier(kind.entity_class(), pipeline);
                Outcome::Applied
            }
            EventKind::ProviderAdded => {
                if identifier(payload, "providerId").is_none() {
                    return self.fallback(kind, "providerId");
                }
                // The new provider contributes to every aggregated pipeline list
                self.sink.invalidate_class(EntityClass::Providers);
                self.sink.invalidate_class(EntityClass::Pipelines);
                Outcome::Applied
            }
            EventKind::ProviderUpdated => {
                let Some(provider) = qualifier(payload, "providerId") else {
                    return self.fallback(kind, "providerId");
                };
                self.sink.invalidate_class(EntityClass::Providers);
                self.sink
                    .invalidate(&CacheKey::qualified(EntityClass::Pipelines, provider));
                Outcome::Applied
            }
            EventKind::ProviderRemoved => {
                let Some(provider) = qualifier(payload, "providerId") else {
                    return self.fallback(kind, "providerId");
                };
                self.sink
                    .remove(&CacheKey::qualified(EntityClass::Providers, provider.clone()));
                self.sink
                    .remove(&CacheKey::qualified(EntityClass::Pipelines, provider));
                // Paged views and aggregated lists may still hold its pipelines
                self.sink.invalidate_class(EntityClass::Providers);
                self.sink.invalidate_class(EntityClass::Pipelines);
                Outcome::Applied
            }
            EventKind::PluginsChanged | EventKind::VaultStatusChanged => {
                self.sink.invalidate_class(kind.entity_class());
                Outcome::Applied
            }
            EventKind::StorageChanged => {
                // A storage backend switch can change any entity
                self.sink.invalidate_all();
                Outcome::Applied
            }
        }
    }

    fn direct_write(
        &self,
        kind: EventKind,
        payload: &Value,
        id_field: Option<&'static str>,
        value_field: &str,
        well_formed: fn(&Value) -> bool,
    ) -> Outcome {
        let class = kind.entity_class();
        let key = match id_field {
            None => CacheKey::all(class),
            Some(field) => match qualifier(payload, field) {
                Some(qualifier) => CacheKey::qualified(class, qualifier),
                None => return self.fallback(kind, field),
            },
        };

        match payload.get(value_field) {
            Some(value) if well_formed(value) => {
                self.sink.write(key, value.clone());
                Outcome::Applied
            }
            _ => {
                tracing::warn!(
                    event_type = %kind,
                    key = %key,
                    field = value_field,
                    "Malformed replacement value; invalidating instead of writing"
                );
                self.sink.invalidate(&key);
                Outcome::Fallback
            }
        }
    }

    fn fallback(&self, kind: EventKind, field: &str) -> Outcome {
        let class = kind.entity_class();
        tracing::warn!(
            event_type = %kind,
            field,
            class = %class,
            "Event payload missing identifier; invalidating whole class"
        );
        match kind {
            EventKind::ProviderAdded | EventKind::ProviderUpdated | EventKind::ProviderRemoved => {
                self.sink.invalidate_class(EntityClass::Providers);
                self.sink.invalidate_class(EntityClass::Pipelines);
            }
            _ if kind.is_batched() => self.batcher.schedule_all(class),
            _ => self.sink.invalidate_class(class),
        }
        Outcome::Fallback
    }
}

/// Subscribes to every [`EventKind`] and applies its strategy.
///
/// Cloning yields another handle to the same router and subscriptions.
#[derive(Clone)]
pub struct EventRouter {
    core: Arc<RouterCore>,
    subscriptions: Arc<SubscriptionSet>,
}

impl EventRouter {
    /// Create a router writing to `sink` and batching through `batcher`.
    #[must_use]
    pub fn new(
        sink: Arc<dyn CacheSink>,
        batcher: InvalidationBatcher,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self {
            core: Arc::new(RouterCore {
                sink,
                batcher,
                lifecycle,
            }),
            subscriptions: Arc::new(SubscriptionSet::new()),
        }
    }

    /// Apply one event.
    ///
    /// Safe to call repeatedly with the same event.
    pub fn handle(&self, kind: EventKind, payload: &Value) -> Outcome {
        self.core.handle(kind, payload)
    }

    /// Apply one event given its wire name. Returns `None` for unknown types.
    pub fn handle_named(&self, event_type: &str, payload: &Value) -> Option<Outcome> {
        event_type
            .parse::<EventKind>()
            .ok()
            .map(|kind| self.handle(kind, payload))
    }

    /// Subscribe a handler for every event kind on `channel`.
    ///
    /// Failures are logged and reported; the remaining kinds are still
    /// registered. Registration stops early once the lifecycle is shut down.
    pub async fn register<C>(&self, channel: &C) -> Registration
    where
        C: EventChannel + ?Sized,
    {
        let mut report = Registration::default();
        for kind in EventKind::ALL {
            if self.core.lifecycle.is_cancelled() {
                report.interrupted = true;
                break;
            }

            let core = Arc::clone(&self.core);
            let on_event = handler(move |payload| {
                core.handle(kind, &payload);
            });

            match self
                .subscriptions
                .add(channel, &self.core.lifecycle, kind.as_str(), on_event)
                .await
            {
                Ok(true) => report.subscribed.push(kind.as_str().to_string()),
                Ok(false) => {
                    report.interrupted = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        event_type = %kind,
                        error = %e,
                        "Failed to subscribe; event type stays unobserved"
                    );
                    report.failed.push(kind.as_str().to_string());
                }
            }
        }

        tracing::debug!(
            subscribed = report.subscribed.len(),
            failed = report.failed.len(),
            interrupted = report.interrupted,
            "Event router registered"
        );
        report
    }

    /// Unsubscribe every handler. Returns the number released.
    pub fn teardown(&self) -> usize {
        self.subscriptions.teardown()
    }

    /// Number of subscriptions currently held.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRouter")
            .field("subscriptions", &self.active_subscriptions())
            .field("stopped", &self.core.lifecycle.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{RecordingSink, SinkOp};
    use serde_json::json;
    use std::time::Duration;

    const WINDOW: Duration = Duration::from_millis(300);

    struct Fixture {
        router: EventRouter,
        sink: Arc<RecordingSink>,
        batcher: InvalidationBatcher,
        lifecycle: Arc<Lifecycle>,
    }

    fn fixture() -> Fixture {
        let sink = Arc::new(RecordingSink::new());
        let lifecycle = Arc::new(Lifecycle::new());
        let batcher = InvalidationBatcher::new(sink.clone(), WINDOW, Arc::clone(&lifecycle));
        let router = EventRouter::new(sink.clone(), batcher.clone(), Arc::clone(&lifecycle));
        Fixture {
            router,
            sink,
            batcher,
            lifecycle,
        }
    }

    fn key(class: EntityClass, field: &str, value: impl Into<QualifierValue>) -> CacheKey {
        CacheKey::qualified(class, Qualifier::of(field, value))
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipelines_updated_writes_list() {
        let f = fixture();
        let payload = json!({"providerId": 1, "pipelines": [{"id": "p1"}]});

        assert_eq!(
            f.router.handle(EventKind::PipelinesUpdated, &payload),
            Outcome::Applied
        );
        assert_eq!(
            f.sink.ops(),
            vec![SinkOp::Write {
                key: key(EntityClass::Pipelines, "providerId", 1),
                value: json!([{"id": "p1"}]),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_string_and_numeric_ids_address_same_key() {
        let f = fixture();
        f.router.handle(
            EventKind::PipelinesUpdated,
            &json!({"providerId": "7", "pipelines": []}),
        );
        f.router.handle(
            EventKind::PipelinesUpdated,
            &json!({"providerId": 7, "pipelines": []}),
        );

        let write = SinkOp::Write {
            key: key(EntityClass::Pipelines, "providerId", 7),
            value: json!([]),
        };
        assert_eq!(f.sink.count(&write), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_value_invalidates_single_key() {
        let f = fixture();
        let outcome = f.router.handle(
            EventKind::PipelinesUpdated,
            &json!({"providerId": 2, "pipelines": "oops"}),
        );

        assert_eq!(outcome, Outcome::Fallback);
        assert_eq!(
            f.sink.ops(),
            vec![SinkOp::Invalidate {
                key: key(EntityClass::Pipelines, "providerId", 2)
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_identifier_on_direct_write_invalidates_class() {
        let f = fixture();
        for payload in [json!({"pipelines": []}), json!(null), json!({"providerId": {}})] {
            assert_eq!(
                f.router.handle(EventKind::PipelinesUpdated, &payload),
                Outcome::Fallback
            );
        }
        assert_eq!(
            f.sink.count(&SinkOp::InvalidateClass {
                class: EntityClass::Pipelines
            }),
            3
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_stats_and_table_preferences() {
        let f = fixture();
        f.router
            .handle(EventKind::CacheStatsUpdated, &json!({"stats": {"hits": 3}}));
        f.router.handle(
            EventKind::TablePreferencesChanged,
            &json!({"tableId": "runs", "preferences": {"columns": ["status"]}}),
        );
        assert_eq!(
            f.router.handle(EventKind::CacheStatsUpdated, &json!({})),
            Outcome::Fallback
        );

        assert_eq!(
            f.sink.ops(),
            vec![
                SinkOp::Write {
                    key: CacheKey::all(EntityClass::CacheStats),
                    value: json!({"hits": 3}),
                },
                SinkOp::Write {
                    key: key(EntityClass::TablePreferences, "tableId", "runs"),
                    value: json!({"columns": ["status"]}),
                },
                SinkOp::Invalidate {
                    key: CacheKey::all(EntityClass::CacheStats)
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_status_changed_is_batched_across_classes() {
        let f = fixture();
        let payload = json!({"providerId": 1, "pipelineId": "gh__org/repo"});
        for _ in 0..3 {
            assert_eq!(
                f.router.handle(EventKind::PipelineStatusChanged, &payload),
                Outcome::Applied
            );
        }
        assert!(f.sink.is_empty());
        assert_eq!(
            f.batcher.pending_classes(),
            vec![EntityClass::Pipelines, EntityClass::Runs, EntityClass::Metrics]
        );

        tokio::time::sleep(WINDOW + Duration::from_millis(1)).await;
        let ops = f.sink.ops();
        assert_eq!(ops.len(), 3);
        assert!(ops.contains(&SinkOp::Invalidate {
            key: key(EntityClass::Runs, "pipelineId", "gh__org/repo")
        }));
        assert!(ops.contains(&SinkOp::Invalidate {
            key: key(EntityClass::Pipelines, "providerId", 1)
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_pipeline_id_on_status_change_widens_to_classes() {
        let f = fixture();
        for bad in [json!({"id": 5}), json!(1.5)] {
            assert_eq!(
                f.router.handle(
                    EventKind::PipelineStatusChanged,
                    &json!({"providerId": 1, "pipelineId": bad}),
                ),
                Outcome::Fallback
            );
        }

        tokio::time::sleep(WINDOW + Duration::from_millis(1)).await;
        let ops = f.sink.ops();
        assert_eq!(ops.len(), 3);
        assert!(ops.contains(&SinkOp::Invalidate {
            key: key(EntityClass::Pipelines, "providerId", 1)
        }));
        assert!(ops.contains(&SinkOp::InvalidateClass {
            class: EntityClass::Runs
        }));
        assert!(ops.contains(&SinkOp::InvalidateClass {
            class: EntityClass::Metrics
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batched_fallback_schedules_class() {
        let f = fixture();
        f.router
            .handle(EventKind::RunHistoryUpdated, &json!({"pipelineId": "a"}));
        assert_eq!(
            f.router.handle(EventKind::RunHistoryUpdated, &json!({})),
            Outcome::Fallback
        );

        tokio::time::sleep(WINDOW + Duration::from_millis(1)).await;
        assert_eq!(
            f.sink.ops(),
            vec![SinkOp::InvalidateClass {
                class: EntityClass::Runs
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_lifecycle_events_apply_immediately() {
        let f = fixture();
        f.router
            .handle(EventKind::ProviderAdded, &json!({"providerId": 4}));
        f.router
            .handle(EventKind::ProviderUpdated, &json!({"providerId": 4}));
        f.router
            .handle(EventKind::ProviderRemoved, &json!({"providerId": 4}));

        assert_eq!(
            f.sink.ops(),
            vec![
                SinkOp::InvalidateClass {
                    class: EntityClass::Providers
                },
                SinkOp::InvalidateClass {
                    class: EntityClass::Pipelines
                },
                SinkOp::InvalidateClass {
                    class: EntityClass::Providers
                },
                SinkOp::Invalidate {
                    key: key(EntityClass::Pipelines, "providerId", 4)
                },
                SinkOp::Remove {
                    key: key(EntityClass::Providers, "providerId", 4)
                },
                SinkOp::Remove {
                    key: key(EntityClass::Pipelines, "providerId", 4)
                },
                SinkOp::InvalidateClass {
                    class: EntityClass::Providers
                },
                SinkOp::InvalidateClass {
                    class: EntityClass::Pipelines
                },
            ]
        );
        assert!(f.batcher.pending_classes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_events() {
        let f = fixture();
        f.router.handle(EventKind::PluginsChanged, &json!(null));
        f.router
            .handle(EventKind::VaultStatusChanged, &json!({"locked": true}));
        f.router.handle(EventKind::StorageChanged, &json!({}));

        assert_eq!(
            f.sink.ops(),
            vec![
                SinkOp::InvalidateClass {
                    class: EntityClass::Plugins
                },
                SinkOp::InvalidateClass {
                    class: EntityClass::Vault
                },
                SinkOp::InvalidateAll,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_router_ignores_events() {
        let f = fixture();
        f.lifecycle.shutdown();
        assert_eq!(
            f.router.handle(EventKind::StorageChanged, &json!({})),
            Outcome::Ignored
        );
        assert!(f.sink.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_named() {
        let f = fixture();
        assert_eq!(
            f.router.handle_named("plugins-changed", &json!({})),
            Some(Outcome::Applied)
        );
        assert_eq!(f.router.handle_named("unknown-event", &json!({})), None);
    }
}
