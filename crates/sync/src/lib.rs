//! Event-driven cache synchronization for pipedash.
//!
//! Keeps a [`pipedash_cache::CacheStore`] consistent with the backend by
//! applying push notifications from a [`pipedash_events::EventChannel`]:
//!
//! - [`EventRouter`]: validates each event and picks one of three strategies
//!   ([`Strategy::DirectWrite`], [`Strategy::TargetedInvalidate`],
//!   [`Strategy::GlobalFallback`])
//! - [`InvalidationBatcher`]: coalesces invalidations per class over a fixed
//!   window
//! - [`ReconnectPolicy`]: invalidates broadly after any connectivity gap
//! - [`SyncEngine`]: owns the three and exposes `start`/`stop`
//!
//! # Usage
//!
//! ```rust,ignore
//! use pipedash_cache::CacheStore;
//! use pipedash_events::EventBus;
//! use pipedash_sync::{SyncConfig, SyncEngine};
//!
//! let store = CacheStore::new();
//! let engine = SyncEngine::with_store(store.clone(), SyncConfig::default())?;
//! let bus = EventBus::new();
//! engine.start(&bus).await?;
//! // ... bus.publish(..) from the transport ...
//! engine.stop();
//! ```

pub mod batcher;
pub mod config;
pub mod engine;
mod error;
pub mod kind;
pub mod lifecycle;
pub mod reconnect;
pub mod router;
pub mod sink;

pub use batcher::{InvalidationBatcher, PendingBatch};
pub use config::SyncConfig;
pub use engine::SyncEngine;
pub use error::{Error, Result};
pub use kind::{EventKind, Strategy};
pub use lifecycle::{Lifecycle, Registration, SubscriptionSet};
pub use reconnect::ReconnectPolicy;
pub use router::{EventRouter, Outcome};
pub use sink::{CacheSink, RecordingSink, SinkOp};
