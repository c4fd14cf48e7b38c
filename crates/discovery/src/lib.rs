//! Service discovery: map a service name to a dialable address.
//!
//! - [`StaticDiscovery`]: a fixed table.
//! - [`DnsDiscovery`]: `<prefix><service><suffix>` through the system
//!   resolver.
//! - [`CachedDiscovery`]: remembers another discovery's answers for a while.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod cache;
mod dns;
mod error;

pub use cache::CachedDiscovery;
pub use dns::DnsDiscovery;
pub use error::{DiscoveryError, Result};

use async_trait::async_trait;
use std::collections::HashMap;

/// Resolves service names to addresses.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Find the address serving `service`.
    async fn find(&self, service: &str) -> Result<String>;
}

/// Discovery from a fixed service-to-address table.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    services: HashMap<String, String>,
}

impl StaticDiscovery {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `addr` for `service`.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>, addr: impl Into<String>) -> Self {
        self.services.insert(service.into(), addr.into());
        self
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn find(&self, service: &str) -> Result<String> {
        self.services
            .get(service)
            .cloned()
            .ok_or_else(|| DiscoveryError::NotFound(service.to_string()))
    }
}
