//! The data source consulted on cache misses.

use crate::Result;
use crate::key::CacheKey;
use async_trait::async_trait;
use std::future::Future;

/// Authoritative reader for cached entities.
///
/// Implementations typically dispatch on [`CacheKey::class`] to one backend
/// call per entity class.
#[async_trait]
pub trait DataSource<V>: Send + Sync {
    /// Return the current authoritative value for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot produce the value.
    async fn fetch(&self, key: &CacheKey) -> Result<V>;
}

/// A [`DataSource`] backed by an async closure.
pub struct FnSource<F>(F);

/// Wrap an async closure as a [`DataSource`].
pub const fn fn_source<F>(f: F) -> FnSource<F> {
    FnSource(f)
}

#[async_trait]
impl<V, F, Fut> DataSource<V> for FnSource<F>
where
    V: Send + 'static,
    F: Fn(CacheKey) -> Fut + Send + Sync,
    Fut: Future<Output = Result<V>> + Send,
{
    async fn fetch(&self, key: &CacheKey) -> Result<V> {
        (self.0)(key.clone()).await
    }
}
