//! The subscription contract every event transport implements.

use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Callback invoked with each payload delivered for a subscribed event type.
pub type Handler = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Wrap a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(serde_json::Value) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A source of typed push notifications.
///
/// Delivery is FIFO within one subscription. No ordering is promised between
/// different event types.
#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Register `handler` for `event_type`.
    ///
    /// Registration may suspend (for example while a remote listener is set up).
    /// The returned [`Subscription`] stops delivery when unsubscribed or dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport refuses the registration or is closed.
    async fn subscribe(&self, event_type: &str, handler: Handler) -> Result<Subscription>;
}

#[async_trait]
impl<T: EventChannel + ?Sized> EventChannel for Arc<T> {
    async fn subscribe(&self, event_type: &str, handler: Handler) -> Result<Subscription> {
        (**self).subscribe(event_type, handler).await
    }
}

/// Handle to an active registration.
///
/// Dropping the handle unsubscribes.
pub struct Subscription {
    event_type: String,
    id: u64,
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Create a handle that runs `unsubscribe` exactly once.
    pub fn new(
        event_type: impl Into<String>,
        id: u64,
        unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            id,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Event type this subscription listens to.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Transport-assigned identifier.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Stop delivery.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("event_type", &self.event_type)
            .field("id", &self.id)
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}
