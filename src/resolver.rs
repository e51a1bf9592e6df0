//! DNS collaborator contract
//!
//! Hostname resolution belongs to a separate subsystem. The dialer only needs
//! `lookup_first`/`lookup_all` and forwards the caller's `DnsOptions` through.
//! `SystemResolver` is the stock implementation backed by the OS resolver.

use crate::filter::AddressFilter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::net::lookup_host;
use tracing::debug;

/// DnsOptions are forwarded untouched to the resolver
#[derive(Debug, Clone, Default)]
pub struct DnsOptions {
    /// Specific DNS servers, for resolvers that speak DNS themselves
    pub servers: Vec<String>,
    pub disable_system_resolver: bool,
    pub timeout: Option<Duration>,
    /// Domains that must never be resolved
    pub disallowed_domains: AddressFilter,
    /// Static host overrides consulted before any lookup
    pub hosts: HashMap<String, IpAddr>,
}

/// Resolver is the DNS collaborator consumed by the dialer
#[async_trait]
pub trait Resolver: Send + Sync {
    /// lookup_all returns every address for `host`, an IP literal unchanged
    async fn lookup_all(&self, host: &str, opts: &DnsOptions) -> Vec<IpAddr>;

    /// lookup_first returns the first address for `host`
    async fn lookup_first(&self, host: &str, opts: &DnsOptions) -> Option<IpAddr> {
        self.lookup_all(host, opts).await.into_iter().next()
    }
}

/// SystemResolver resolves through the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

/// Timeout used when the caller gave none
const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_all(&self, host: &str, opts: &DnsOptions) -> Vec<IpAddr> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return vec![ip];
        }
        if let Some(ip) = opts.hosts.get(&host.to_ascii_lowercase()) {
            return vec![*ip];
        }
        if opts.disallowed_domains.contains(host) {
            debug!("dns lookup of {} refused by domain filter", host);
            return Vec::new();
        }
        if opts.disable_system_resolver {
            debug!("system resolver disabled, {} left unresolved", host);
            return Vec::new();
        }

        let timeout = opts.timeout.unwrap_or(DEFAULT_LOOKUP_TIMEOUT);
        match tokio::time::timeout(timeout, lookup_host((host, 0))).await {
            Ok(Ok(addrs)) => {
                let mut seen = Vec::new();
                for addr in addrs {
                    if !seen.contains(&addr.ip()) {
                        seen.push(addr.ip());
                    }
                }
                seen
            }
            Ok(Err(e)) => {
                debug!("dns lookup of {} failed: {}", host, e);
                Vec::new()
            }
            Err(_) => {
                debug!("dns lookup of {} timed out after {:?}", host, timeout);
                Vec::new()
            }
        }
    }
}
