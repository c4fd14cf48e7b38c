//! DNS-backed discovery.

use crate::error::{DiscoveryError, Result};
use crate::Discovery;
use async_trait::async_trait;
use hickory_resolver::Resolver;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, error};

/// Resolves `<prefix><service><suffix>` and expects exactly one address.
///
/// With a port configured the result is `ip:port`, otherwise the bare IP.
#[derive(Debug, Clone, Default)]
pub struct DnsDiscovery {
    prefix: String,
    suffix: String,
    port: Option<u16>,
}

impl DnsDiscovery {
    /// Discovery that looks up service names unchanged.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend `prefix` to every service name.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Append `suffix` to every service name, e.g. `.svc.cluster.local`.
    #[must_use]
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Append `port` to every resolved address.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// The host name looked up for `service`.
    #[must_use]
    pub fn hostname(&self, service: &str) -> String {
        format!("{}{}{}", self.prefix, service, self.suffix)
    }

    fn address(&self, service: &str, ips: &[IpAddr]) -> Result<String> {
        match ips {
            [] => Err(DiscoveryError::NotFound(service.to_string())),
            [ip] => Ok(self.port.map_or_else(
                || ip.to_string(),
                |port| SocketAddr::new(*ip, port).to_string(),
            )),
            _ => Err(DiscoveryError::Ambiguous {
                service: service.to_string(),
                count: ips.len(),
            }),
        }
    }
}

#[async_trait]
impl Discovery for DnsDiscovery {
    async fn find(&self, service: &str) -> Result<String> {
        let hostname = self.hostname(service);

        let resolver = Resolver::tokio_from_system_conf().map_err(|e| {
            error!("Failed to create DNS resolver: {}", e);
            DiscoveryError::Resolve {
                service: hostname.clone(),
                reason: e.to_string(),
            }
        })?;

        let lookup = resolver
            .lookup_ip(hostname.as_str())
            .await
            .map_err(|e| DiscoveryError::Resolve {
                service: hostname.clone(),
                reason: e.to_string(),
            })?;
        let ips: Vec<IpAddr> = lookup.iter().collect();
        debug!("Resolved {} to {:?}", hostname, ips);

        self.address(&hostname, &ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_hostname() {
        let discovery = DnsDiscovery::new()
            .with_prefix("mice-")
            .with_suffix(".default.svc.cluster.local");
        assert_eq!(
            discovery.hostname("users"),
            "mice-users.default.svc.cluster.local"
        );
    }

    #[test]
    fn test_single_address() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
        assert_eq!(DnsDiscovery::new().address("svc", &[ip]).unwrap(), "10.0.0.7");
        assert_eq!(
            DnsDiscovery::new()
                .with_port(7000)
                .address("svc", &[ip])
                .unwrap(),
            "10.0.0.7:7000"
        );

        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert_eq!(
            DnsDiscovery::new()
                .with_port(7000)
                .address("svc", &[v6])
                .unwrap(),
            "[::1]:7000"
        );
    }

    #[test]
    fn test_ambiguous_and_empty() {
        let ips = [
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        ];
        assert!(matches!(
            DnsDiscovery::new().address("svc", &ips),
            Err(DiscoveryError::Ambiguous { count: 2, .. })
        ));
        assert!(matches!(
            DnsDiscovery::new().address("svc", &[]),
            Err(DiscoveryError::NotFound(_))
        ));
    }
}
