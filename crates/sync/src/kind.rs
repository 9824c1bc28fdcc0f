//! The closed set of entity-change events and their update strategies.

use pipedash_cache::EntityClass;
use std::fmt;
use std::str::FromStr;

/// How an event updates the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// The payload carries the replacement value for one key.
    DirectWrite,
    /// The payload identifies what changed; the affected keys are invalidated.
    TargetedInvalidate {
        /// Coalesced through the batcher rather than applied immediately.
        batched: bool,
    },
    /// The whole class is invalidated regardless of payload.
    GlobalFallback,
}

/// Entity-change event types pushed by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// `pipelines-updated`: `{providerId, pipelines: [..]}`
    PipelinesUpdated,
    /// `cache-stats-updated`: `{stats: {..}}`
    CacheStatsUpdated,
    /// `table-preferences-changed`: `{tableId, preferences: {..}}`
    TablePreferencesChanged,
    /// `pipeline-status-changed`: `{providerId, pipelineId?}`
    PipelineStatusChanged,
    /// `run-history-updated`: `{pipelineId}`
    RunHistoryUpdated,
    /// `metrics-updated`: `{pipelineId}`
    MetricsUpdated,
    /// `provider-added`: `{providerId}`
    ProviderAdded,
    /// `provider-updated`: `{providerId}`
    ProviderUpdated,
    /// `provider-removed`: `{providerId}`
    ProviderRemoved,
    /// `plugins-changed`
    PluginsChanged,
    /// `vault-status-changed`
    VaultStatusChanged,
    /// `storage-changed`
    StorageChanged,
}

impl EventKind {
    /// Every event kind, in subscription order.
    pub const ALL: [Self; 12] = [
        Self::PipelinesUpdated,
        Self::CacheStatsUpdated,
        Self::TablePreferencesChanged,
        Self::PipelineStatusChanged,
        Self::RunHistoryUpdated,
        Self::MetricsUpdated,
        Self::ProviderAdded,
        Self::ProviderUpdated,
        Self::ProviderRemoved,
        Self::PluginsChanged,
        Self::VaultStatusChanged,
        Self::StorageChanged,
    ];

    /// Wire name of the event type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PipelinesUpdated => "pipelines-updated",
            Self::CacheStatsUpdated => "cache-stats-updated",
            Self::TablePreferencesChanged => "table-preferences-changed",
            Self::PipelineStatusChanged => "pipeline-status-changed",
            Self::RunHistoryUpdated => "run-history-updated",
            Self::MetricsUpdated => "metrics-updated",
            Self::ProviderAdded => "provider-added",
            Self::ProviderUpdated => "provider-updated",
            Self::ProviderRemoved => "provider-removed",
            Self::PluginsChanged => "plugins-changed",
            Self::VaultStatusChanged => "vault-status-changed",
            Self::StorageChanged => "storage-changed",
        }
    }

    /// Class the event primarily concerns; the target of its fallback.
    #[must_use]
    pub const fn entity_class(self) -> EntityClass {
        match self {
            Self::PipelinesUpdated | Self::PipelineStatusChanged => EntityClass::Pipelines,
            Self::CacheStatsUpdated => EntityClass::CacheStats,
            Self::TablePreferencesChanged => EntityClass::TablePreferences,
            Self::RunHistoryUpdated => EntityClass::Runs,
            Self::MetricsUpdated => EntityClass::Metrics,
            Self::ProviderAdded | Self::ProviderUpdated | Self::ProviderRemoved => {
                EntityClass::Providers
            }
            Self::PluginsChanged => EntityClass::Plugins,
            Self::VaultStatusChanged => EntityClass::Vault,
            Self::StorageChanged => EntityClass::Storage,
        }
    }

    /// Update strategy applied to a valid payload.
    #[must_use]
    pub const fn strategy(self) -> Strategy {
        match self {
            Self::PipelinesUpdated | Self::CacheStatsUpdated | Self::TablePreferencesChanged => {
                Strategy::DirectWrite
            }
            Self::PipelineStatusChanged | Self::RunHistoryUpdated | Self::MetricsUpdated => {
                Strategy::TargetedInvalidate { batched: true }
            }
            Self::ProviderAdded | Self::ProviderUpdated | Self::ProviderRemoved => {
                Strategy::TargetedInvalidate { batched: false }
            }
            Self::PluginsChanged | Self::VaultStatusChanged | Self::StorageChanged => {
                Strategy::GlobalFallback
            }
        }
    }

    /// Whether fallbacks for this kind go through the batcher.
    #[must_use]
    pub const fn is_batched(self) -> bool {
        matches!(self.strategy(), Strategy::TargetedInvalidate { batched: true })
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("Unknown event type: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_wire_names_are_unique_and_parse_back() {
        let names: HashSet<&str> = EventKind::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(names.len(), EventKind::ALL.len());
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!("connection-status".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_strategies() {
        assert_eq!(EventKind::PipelinesUpdated.strategy(), Strategy::DirectWrite);
        assert!(EventKind::RunHistoryUpdated.is_batched());
        assert!(!EventKind::ProviderRemoved.is_batched());
        assert_eq!(EventKind::StorageChanged.strategy(), Strategy::GlobalFallback);
    }

    #[test]
    fn test_entity_classes() {
        assert_eq!(
            EventKind::TablePreferencesChanged.entity_class(),
            EntityClass::TablePreferences
        );
        assert_eq!(EventKind::ProviderAdded.entity_class(), EntityClass::Providers);
        assert_eq!(EventKind::MetricsUpdated.entity_class(), EntityClass::Metrics);
    }
}
