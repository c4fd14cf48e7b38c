//! Error types for service discovery.

use thiserror::Error;

/// Result type alias for discovery operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Discovery errors.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// No address is known for the service.
    #[error("Service not found: {0}")]
    NotFound(String),

    /// The service resolved to more than one address.
    #[error("Service {service} resolved to {count} addresses, expected one")]
    Ambiguous {
        /// The service name.
        service: String,
        /// How many addresses were found.
        count: usize,
    },

    /// The resolver could not be created or the lookup failed.
    #[error("Failed to resolve {service}: {reason}")]
    Resolve {
        /// The name that was looked up.
        service: String,
        /// The resolver's error.
        reason: String,
    },
}
