//! Push-notification channel for pipedash.
//!
//! The backend pushes typed entity-change notifications over a persistent
//! connection and reports connection-state transitions on a reserved event
//! type. This crate defines the boundary the cache synchronization engine
//! consumes:
//!
//! - [`EventChannel`]: `subscribe(event_type, handler) -> Subscription`
//! - [`EventBus`]: in-process fan-out implementation, also used as a test fake
//! - [`ConnectionStatusPayload`]: shape of the [`CONNECTION_STATUS_EVENT`] stream
//! - [`bridge`]: newline-delimited JSON transport feeding a bus
//!
//! # Usage
//!
//! ```rust,ignore
//! use pipedash_events::{EventBus, EventChannel, handler};
//!
//! let bus = EventBus::new();
//! let sub = bus.subscribe("provider-added", handler(|payload| {
//!     tracing::info!(%payload, "provider added");
//! })).await?;
//! bus.publish("provider-added", serde_json::json!({"providerId": 3}))?;
//! sub.unsubscribe();
//! ```

pub mod bridge;
pub mod bus;
pub mod channel;
mod error;
pub mod event;

pub use bridge::{BridgeStats, WireMessage, run_bridge};
pub use bus::EventBus;
pub use channel::{EventChannel, Handler, Subscription, handler};
pub use error::{Error, Result};
pub use event::{CONNECTION_STATUS_EVENT, ConnectionStatus, ConnectionStatusPayload};
