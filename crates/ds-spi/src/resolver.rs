//! Name resolution and local-interface detection.

use std::net::{IpAddr, SocketAddr, UdpSocket};

use async_trait::async_trait;
use tracing::trace;

use crate::error::{SpiError, SpiResult};

/// Resolves server names and recognises addresses owned by this host.
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Resolves `host` to socket addresses on `port`.
    async fn resolve(&self, host: &str, port: u16) -> SpiResult<Vec<SocketAddr>>;

    /// Returns whether `ip` is assigned to a local interface.
    fn is_local(&self, ip: &IpAddr) -> bool;
}

/// Resolver backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> SpiResult<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| SpiError::Resolve(format!("{host}: {e}")))?
            .collect();
        trace!(host = %host, count = addrs.len(), "resolved host");
        if addrs.is_empty() {
            return Err(SpiError::Resolve(format!("{host}: no addresses")));
        }
        Ok(addrs)
    }

    fn is_local(&self, ip: &IpAddr) -> bool {
        // Binding succeeds only for addresses assigned to this host.
        ip.is_loopback() || UdpSocket::bind((*ip, 0)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_is_local() {
        let resolver = SystemResolver;
        assert!(resolver.is_local(&"127.0.0.1".parse().unwrap()));
        assert!(resolver.is_local(&"::1".parse().unwrap()));
        assert!(!resolver.is_local(&"192.0.2.77".parse().unwrap()));
    }

    #[tokio::test]
    async fn literal_addresses_resolve_without_dns() {
        let addrs = SystemResolver.resolve("127.0.0.1", 389).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:389".parse().unwrap()]);
    }
}
