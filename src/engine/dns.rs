//! Source-bound DNS resolution for the HTTP client.
//!
//! When `dns_bind_source` is set, name lookups must leave through the same
//! local address as the measurement traffic. reqwest's default resolver
//! offers no control over that, so we install a trust-dns resolver whose
//! nameserver sockets bind to the configured source.

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use std::net::{IpAddr, SocketAddr};
use trust_dns_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

pub struct SourceBoundResolver {
    resolver: TokioAsyncResolver,
}

impl SourceBoundResolver {
    pub fn new(source: IpAddr) -> Self {
        let bind = SocketAddr::new(source, 0);
        let mut config = ResolverConfig::new();
        for ns in system_nameservers() {
            let mut entry = NameServerConfig::new(SocketAddr::new(ns, 53), Protocol::Udp);
            entry.bind_addr = Some(bind);
            config.add_name_server(entry);
        }
        let resolver = TokioAsyncResolver::tokio(config, ResolverOpts::default());
        Self { resolver }
    }
}

impl Resolve for SourceBoundResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = self.resolver.clone();
        Box::pin(async move {
            let lookup = resolver.lookup_ip(name.as_str()).await?;
            let addrs: Addrs = Box::new(lookup.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok(addrs)
        })
    }
}

/// Nameservers from the system configuration, with public resolvers as the
/// fallback when nothing is configured.
fn system_nameservers() -> Vec<IpAddr> {
    let mut servers = nameservers_from_resolv_conf();
    if servers.is_empty() {
        servers = vec!["1.1.1.1".parse().unwrap(), "8.8.8.8".parse().unwrap()];
    }
    servers
}

fn nameservers_from_resolv_conf() -> Vec<IpAddr> {
    let Ok(content) = std::fs::read_to_string("/etc/resolv.conf") else {
        return Vec::new();
    };
    parse_resolv_conf(&content)
}

fn parse_resolv_conf(content: &str) -> Vec<IpAddr> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.starts_with('#') || line.starts_with(';') {
                return None;
            }
            let mut parts = line.split_whitespace();
            if parts.next() != Some("nameserver") {
                return None;
            }
            parts.next()?.parse::<IpAddr>().ok()
        })
        .collect()
}
