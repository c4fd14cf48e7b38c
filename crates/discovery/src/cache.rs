//! Time-bounded caching of another discovery's answers.

use crate::Discovery;
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Default lifetime of a cached answer.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// Wraps a [`Discovery`] and caches successful lookups for `max_age`.
/// Failures are never cached.
#[derive(Debug)]
pub struct CachedDiscovery<D> {
    inner: D,
    max_age: Duration,
    entries: DashMap<String, (String, Instant)>,
}

impl<D: Discovery> CachedDiscovery<D> {
    /// Cache `inner` with the default max age.
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            max_age: DEFAULT_MAX_AGE,
            entries: DashMap::new(),
        }
    }

    /// Set how long answers are kept.
    #[must_use]
    pub const fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Forget the cached answer for `service`.
    pub fn invalidate(&self, service: &str) {
        self.entries.remove(service);
    }

    /// Forget every cached answer.
    pub fn clear(&self) {
        self.entries.clear();
    }

    fn cached(&self, service: &str) -> Option<String> {
        let entry = self.entries.get(service)?;
        let (addr, stored) = entry.value();
        (stored.elapsed() < self.max_age).then(|| addr.clone())
    }
}

#[async_trait]
impl<D: Discovery> Discovery for CachedDiscovery<D> {
    async fn find(&self, service: &str) -> Result<String> {
        if let Some(addr) = self.cached(service) {
            return Ok(addr);
        }

        let addr = self.inner.find(service).await?;
        debug!("Caching {} -> {}", service, addr);
        self.entries
            .insert(service.to_string(), (addr.clone(), Instant::now()));
        Ok(addr)
    }
}
