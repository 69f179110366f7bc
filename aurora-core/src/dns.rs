//! Remote-address resolution for DNS-bound rules.
//!
//! Order of preference: IP literals pass through verbatim; otherwise the
//! operator-pinned server (`DNS_SERVER`), then the DoH providers in
//! listed order, then the OS resolver. The first non-empty answer wins
//! and IPv4 is preferred over IPv6.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{
    NameServerConfig, Protocol, ResolverConfig, ResolverOpts,
};
use serde::Deserialize;
use tracing::{debug, warn};

use aurora_model::is_ip;

use crate::error::{CoreError, Result};

const DOH_PROVIDERS: [&str; 2] = [
    "https://cloudflare-dns.com/dns-query",
    "https://dns.alidns.com/resolve",
];

const DOH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    data: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DnsResolver {
    pinned: Option<String>,
    http: reqwest::Client,
}

impl DnsResolver {
    pub fn new(pinned: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DOH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { pinned, http }
    }

    /// Resolve a hostname per the policy above. IP literals come back
    /// unchanged regardless of resolver availability.
    pub async fn resolve(&self, hostname: &str) -> Result<String> {
        let hostname = hostname.trim();
        if hostname.is_empty() {
            return Err(CoreError::validation("empty remote address"));
        }
        if is_ip(hostname) {
            return Ok(hostname.to_string());
        }

        if let Some(pinned) = &self.pinned {
            if let Some(ip) = self.query_pinned(pinned, hostname).await {
                return Ok(ip);
            }
        }
        for provider in DOH_PROVIDERS {
            if let Some(ip) = self.query_doh(provider, hostname, "A").await {
                return Ok(ip);
            }
        }
        if let Some(ip) = self.query_system(hostname).await {
            return Ok(ip);
        }
        for provider in DOH_PROVIDERS {
            if let Some(ip) =
                self.query_doh(provider, hostname, "AAAA").await
            {
                return Ok(ip);
            }
        }

        Err(CoreError::transport(format!(
            "could not resolve {hostname}"
        )))
    }

    async fn query_pinned(
        &self,
        pinned: &str,
        hostname: &str,
    ) -> Option<String> {
        let (server, port) = match pinned.split_once(':') {
            Some((server, port)) => (server, port.parse().ok()?),
            None => (pinned, 53),
        };
        let ip: IpAddr = match server.parse() {
            Ok(ip) => ip,
            Err(_) => {
                warn!("DNS_SERVER is not an IP literal: {server}");
                return None;
            }
        };

        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new(
            SocketAddr::new(ip, port),
            Protocol::Udp,
        ));
        let resolver =
            TokioAsyncResolver::tokio(config, ResolverOpts::default());

        let lookup = resolver.ipv4_lookup(hostname).await.ok()?;
        let answer = lookup.iter().next()?.to_string();
        debug!("Pinned resolver answered {hostname} -> {answer}");
        Some(answer)
    }

    async fn query_doh(
        &self,
        provider: &str,
        hostname: &str,
        record_type: &str,
    ) -> Option<String> {
        let response = self
            .http
            .get(provider)
            .query(&[("name", hostname), ("type", record_type)])
            .header("accept", "application/dns-json")
            .send()
            .await
            .ok()?;
        let body: DohResponse = response.json().await.ok()?;

        let answer = body.answer.last()?.data.clone()?;
        if !is_ip(&answer) {
            return None;
        }
        debug!("DoH {provider} answered {hostname} -> {answer}");
        Some(answer)
    }

    async fn query_system(&self, hostname: &str) -> Option<String> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().ok()?;
        let lookup = resolver.lookup_ip(hostname).await.ok()?;
        let answer = lookup
            .iter()
            .find(IpAddr::is_ipv4)
            .map(|ip| ip.to_string())?;
        debug!("System resolver answered {hostname} -> {answer}");
        Some(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literals_bypass_every_resolver() {
        // No resolver is reachable in tests; literals must still pass.
        let resolver = DnsResolver::new(Some("192.0.2.53".to_string()));
        assert_eq!(resolver.resolve("1.2.3.4").await.unwrap(), "1.2.3.4");
        assert_eq!(
            resolver.resolve("2001:db8::1").await.unwrap(),
            "2001:db8::1"
        );
        assert_eq!(
            resolver.resolve("  1.2.3.4  ").await.unwrap(),
            "1.2.3.4"
        );
    }

    #[tokio::test]
    async fn empty_hostname_is_invalid() {
        let resolver = DnsResolver::new(None);
        assert!(resolver.resolve("").await.is_err());
    }
}
