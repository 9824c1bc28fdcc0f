//! Keyed entity cache for pipedash
//!
//! This crate holds the client's locally cached view of server-side entities:
//! - Keys made of an entity class and an optional structured qualifier
//! - Per-class freshness windows with explicit invalidation that always wins
//! - Read-through population from a [`DataSource`], with in-flight cancellation
//! - Change notifications for UI subscribers and a retention-based GC
//!
//! # Invalidation
//!
//! Invalidating a key marks it (and every key whose qualifier refines it) for
//! refetch without discarding the value, so the UI keeps rendering
//! last-known-good data. Only [`CacheStore::remove`] deletes.

mod entry;
mod error;
mod key;
mod source;
mod store;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use entry::{CacheEntry, StalePolicy};
pub use key::{CacheKey, EntityClass, Qualifier, QualifierValue};
pub use source::{DataSource, FnSource, fn_source};
pub use store::{CacheChange, CacheNotification, CacheStats, CacheStore, StoreOptions};
