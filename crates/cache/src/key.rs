//! Cache keys: an entity class plus an optional structured qualifier.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Closed set of cached entity categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityClass {
    /// Pipelines, usually qualified by provider.
    #[serde(rename = "pipelines")]
    Pipelines,
    /// Configured CI providers.
    #[serde(rename = "providers")]
    Providers,
    /// Run history, usually qualified by pipeline and page.
    #[serde(rename = "runs")]
    Runs,
    /// Aggregated pipeline metrics.
    #[serde(rename = "metrics")]
    Metrics,
    /// Storage backend configuration and state.
    #[serde(rename = "storage")]
    Storage,
    /// Vault lock state.
    #[serde(rename = "vault")]
    Vault,
    /// Table column schemas.
    #[serde(rename = "tableSchema")]
    TableSchema,
    /// Cache statistics reported by the backend.
    #[serde(rename = "cache-stats")]
    CacheStats,
    /// Installed provider plugins.
    #[serde(rename = "plugins")]
    Plugins,
    /// Workflow dispatch parameters.
    #[serde(rename = "workflow-parameters")]
    WorkflowParameters,
    /// Per-table user preferences.
    #[serde(rename = "table-preferences")]
    TablePreferences,
}

impl EntityClass {
    /// Every entity class.
    pub const ALL: [Self; 11] = [
        Self::Pipelines,
        Self::Providers,
        Self::Runs,
        Self::Metrics,
        Self::Storage,
        Self::Vault,
        Self::TableSchema,
        Self::CacheStats,
        Self::Plugins,
        Self::WorkflowParameters,
        Self::TablePreferences,
    ];

    /// Canonical name, as used in configuration and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pipelines => "pipelines",
            Self::Providers => "providers",
            Self::Runs => "runs",
            Self::Metrics => "metrics",
            Self::Storage => "storage",
            Self::Vault => "vault",
            Self::TableSchema => "tableSchema",
            Self::CacheStats => "cache-stats",
            Self::Plugins => "plugins",
            Self::WorkflowParameters => "workflow-parameters",
            Self::TablePreferences => "table-preferences",
        }
    }

    /// How long a freshly fetched value is served without refetching.
    ///
    /// Frequently changing classes are short; near-static ones are long.
    #[must_use]
    pub const fn default_stale_after(self) -> Duration {
        match self {
            Self::Runs | Self::Pipelines => Duration::from_secs(10),
            Self::Metrics | Self::CacheStats => Duration::from_secs(30),
            Self::Providers => Duration::from_secs(60),
            Self::Storage | Self::Vault | Self::WorkflowParameters => Duration::from_secs(300),
            Self::TableSchema | Self::Plugins | Self::TablePreferences => {
                Duration::from_secs(3600)
            }
        }
    }
}

impl fmt::Display for EntityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| format!("Unknown entity class: {s}"))
    }
}

/// One field value inside a [`Qualifier`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QualifierValue {
    /// Numeric identifier or page number.
    Int(i64),
    /// Opaque string identifier.
    Str(String),
    /// Flag.
    Bool(bool),
}

impl QualifierValue {
    /// Convert a JSON scalar, normalizing integer-looking strings to integers
    /// so that `"7"` and `7` address the same entry.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_i64().map(Self::Int),
            serde_json::Value::String(s) if s.is_empty() => None,
            serde_json::Value::String(s) => Some(
                s.parse::<i64>()
                    .map_or_else(|_| Self::Str(s.clone()), Self::Int),
            ),
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            _ => None,
        }
    }
}

impl fmt::Display for QualifierValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => f.write_str(s),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<i64> for QualifierValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for QualifierValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for QualifierValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for QualifierValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for QualifierValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for QualifierValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// Structured discriminator within one entity class, e.g. `{providerId: 1}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Qualifier(BTreeMap<String, QualifierValue>);

impl Qualifier {
    /// An empty qualifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for a single-field qualifier.
    #[must_use]
    pub fn of(field: impl Into<String>, value: impl Into<QualifierValue>) -> Self {
        Self::new().with(field, value)
    }

    /// Add or replace a field.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<QualifierValue>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// Look up a field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&QualifierValue> {
        self.0.get(field)
    }

    /// Whether no fields are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether every field of `other` is present in `self` with the same value.
    ///
    /// `{pipelineId: 5, page: 2}` refines `{pipelineId: 5}`; every qualifier
    /// refines itself.
    #[must_use]
    pub fn refines(&self, other: &Self) -> bool {
        other.0.iter().all(|(field, value)| self.0.get(field) == Some(value))
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (field, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{field}={value}")?;
        }
        f.write_str("}")
    }
}

/// Address of one cache entry.
///
/// A key without a qualifier denotes "all of this class". Used as a filter,
/// a key covers itself and every key whose qualifier refines its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    /// Entity class.
    pub class: EntityClass,
    /// Optional discriminator within the class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualifier: Option<Qualifier>,
}

impl CacheKey {
    /// The "all of this class" key.
    #[must_use]
    pub const fn all(class: EntityClass) -> Self {
        Self {
            class,
            qualifier: None,
        }
    }

    /// A qualified key. An empty qualifier yields the "all" key.
    #[must_use]
    pub fn qualified(class: EntityClass, qualifier: Qualifier) -> Self {
        Self {
            class,
            qualifier: (!qualifier.is_empty()).then_some(qualifier),
        }
    }

    /// Whether this is the unqualified "all" key.
    #[must_use]
    pub const fn is_all(&self) -> bool {
        self.qualifier.is_none()
    }

    /// Whether `other` belongs to the family this key addresses.
    #[must_use]
    pub fn covers(&self, other: &Self) -> bool {
        if self.class != other.class {
            return false;
        }
        match (&self.qualifier, &other.qualifier) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(mine), Some(theirs)) => theirs.refines(mine),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "{}{q}", self.class),
            None => write!(f, "{}", self.class),
        }
    }
}

impl From<EntityClass> for CacheKey {
    fn from(class: EntityClass) -> Self {
        Self::all(class)
    }
}
