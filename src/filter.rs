//! Address policy filter (deny-lists)

use ipnet::IpNet;
use std::collections::HashSet;
use std::net::IpAddr;

/// AddressFilter matches IPs, CIDR networks, exact hostnames and `*.suffix`
/// wildcards
#[derive(Debug, Clone, Default)]
pub struct AddressFilter {
    ips: HashSet<IpAddr>,
    nets: Vec<IpNet>,
    hosts: HashSet<String>,
    suffixes: Vec<String>,
}

impl AddressFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// from_entries builds a filter from `insert`-style entries
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::new();
        for entry in entries {
            filter.insert(entry.as_ref());
        }
        filter
    }

    /// insert adds one entry: `10.0.0.1`, `10.0.0.0/8`, `example.com` or
    /// `*.example.com`
    pub fn insert(&mut self, entry: &str) {
        let entry = entry.trim().trim_start_matches('[').trim_end_matches(']');
        if entry.is_empty() {
            return;
        }
        if let Ok(ip) = entry.parse::<IpAddr>() {
            self.ips.insert(ip);
        } else if let Ok(net) = entry.parse::<IpNet>() {
            self.nets.push(net);
        } else if let Some(suffix) = entry.strip_prefix("*.") {
            self.suffixes.push(suffix.to_ascii_lowercase());
        } else {
            self.hosts.insert(entry.trim_end_matches('.').to_ascii_lowercase());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty() && self.nets.is_empty() && self.hosts.is_empty() && self.suffixes.is_empty()
    }

    /// contains reports whether an IP literal or hostname is covered
    pub fn contains(&self, ip_or_host: &str) -> bool {
        let value = ip_or_host.trim().trim_start_matches('[').trim_end_matches(']');
        match value.parse::<IpAddr>() {
            Ok(ip) => self.contains_ip(ip),
            Err(_) => {
                let host = value.trim_end_matches('.').to_ascii_lowercase();
                self.hosts.contains(&host)
                    || self.suffixes.iter().any(|suffix| {
                        host.len() > suffix.len()
                            && host.ends_with(suffix.as_str())
                            && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
                    })
            }
        }
    }

    pub fn contains_ip(&self, ip: IpAddr) -> bool {
        self.ips.contains(&ip) || self.nets.iter().any(|net| net.contains(&ip))
    }
}
