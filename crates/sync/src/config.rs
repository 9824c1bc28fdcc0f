//! Engine configuration.
//!
//! Resolution order (later wins):
//! 1) built-in defaults
//! 2) TOML file (`SyncConfig::load`)
//! 3) `PIPEDASH_*` environment variables (`SyncConfig::with_env_overrides`)

use crate::{Error, Result};
use pipedash_cache::{EntityClass, StalePolicy, StoreOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Default batch window, in milliseconds.
pub const DEFAULT_BATCH_WINDOW_MS: u64 = 300;

/// Environment variable overriding [`SyncConfig::batch_window_ms`].
pub const ENV_BATCH_WINDOW_MS: &str = "PIPEDASH_BATCH_WINDOW_MS";
/// Environment variable overriding [`SyncConfig::gc_interval_ms`].
pub const ENV_GC_INTERVAL_MS: &str = "PIPEDASH_GC_INTERVAL_MS";
/// Environment variable overriding [`SyncConfig::retention_ms`].
pub const ENV_RETENTION_MS: &str = "PIPEDASH_RETENTION_MS";

/// Sync engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Fixed coalescing window for batched invalidations.
    pub batch_window_ms: u64,
    /// Classes invalidated immediately after a reconnect.
    pub critical_classes: Vec<EntityClass>,
    /// Per-class freshness overrides.
    pub stale_after_ms: BTreeMap<EntityClass, u64>,
    /// Interval between cache retention sweeps.
    pub gc_interval_ms: u64,
    /// How long an untouched entry survives.
    pub retention_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_window_ms: DEFAULT_BATCH_WINDOW_MS,
            critical_classes: vec![EntityClass::Providers, EntityClass::Pipelines],
            stale_after_ms: BTreeMap::new(),
            gc_interval_ms: 60_000,
            retention_ms: 300_000,
        }
    }
}

impl SyncConfig {
    /// Parse a TOML document and validate it.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for malformed TOML, unknown keys, or
    /// values rejected by [`SyncConfig::validate`].
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| Error::configuration(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, otherwise as
    /// [`SyncConfig::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| Error::io(e, path))?;
        tracing::debug!(path = %path.display(), "Loading sync configuration");
        Self::from_toml_str(&source)
    }

    /// Apply `PIPEDASH_*` environment overrides.
    ///
    /// Empty variables are ignored.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a variable is not a non-negative
    /// integer, or if the result fails validation.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(ms) = env_millis(ENV_BATCH_WINDOW_MS)? {
            self.batch_window_ms = ms;
        }
        if let Some(ms) = env_millis(ENV_GC_INTERVAL_MS)? {
            self.gc_interval_ms = ms;
        }
        if let Some(ms) = env_millis(ENV_RETENTION_MS)? {
            self.retention_ms = ms;
        }
        self.validate()?;
        Ok(self)
    }

    /// Check invariants between fields.
    ///
    /// # Errors
    ///
    /// Rejects a zero batch window or GC interval, and a retention shorter
    /// than the GC interval.
    pub fn validate(&self) -> Result<()> {
        if self.batch_window_ms == 0 {
            return Err(Error::configuration("batch_window_ms must be greater than 0"));
        }
        if self.gc_interval_ms == 0 {
            return Err(Error::configuration("gc_interval_ms must be greater than 0"));
        }
        if self.retention_ms < self.gc_interval_ms {
            return Err(Error::configuration(format!(
                "retention_ms ({}) must not be shorter than gc_interval_ms ({})",
                self.retention_ms, self.gc_interval_ms
            )));
        }
        Ok(())
    }

    /// Batch window as a [`Duration`].
    #[must_use]
    pub const fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    /// GC interval as a [`Duration`].
    #[must_use]
    pub const fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    /// Freshness policy with this config's overrides applied.
    #[must_use]
    pub fn stale_policy(&self) -> StalePolicy {
        self.stale_after_ms
            .iter()
            .fold(StalePolicy::new(), |policy, (class, ms)| {
                policy.with_override(*class, Duration::from_millis(*ms))
            })
    }

    /// Options for building a matching [`pipedash_cache::CacheStore`].
    #[must_use]
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            stale: self.stale_policy(),
            retention: Duration::from_millis(self.retention_ms),
            ..StoreOptions::default()
        }
    }
}

fn env_millis(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw.trim().parse::<u64>().map(Some).map_err(|e| {
            Error::configuration(format!("{name} must be a number of milliseconds: {e}"))
        }),
        Err(_) => Ok(None),
    }
}
