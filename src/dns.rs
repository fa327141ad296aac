//! DNS reachability probe used by health checks.

use reqwest::Url;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use crate::config::{ConfigStore, NetworkSettings};
use crate::driver::Driver;
use crate::error::NetworkError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsResolution {
    pub hostname: String,
    pub addresses: Vec<IpAddr>,
    /// True when the hostname was already an IPv4 literal and no lookup ran.
    pub synthetic: bool,
}

pub struct DnsProbe {
    driver: Arc<dyn Driver>,
    store: Arc<dyn ConfigStore>,
}

impl DnsProbe {
    pub fn new(driver: Arc<dyn Driver>, store: Arc<dyn ConfigStore>) -> Self {
        Self { driver, store }
    }

    /// The name probed when the caller does not pick one: the host of the
    /// configured API server, else the configured default probe name.
    pub fn default_hostname(&self) -> String {
        let settings = NetworkSettings::from_store(self.store.as_ref());
        settings
            .api_server_url
            .as_deref()
            .and_then(url_host)
            .unwrap_or(settings.default_dns_name)
    }

    /// Resolve `hostname` (or the default probe name) once.
    ///
    /// The local resolver cache is flushed first so a stale answer cannot
    /// satisfy the probe. Resolution failures come back as
    /// [`NetworkError::Resolution`]; retrying is up to the caller.
    pub async fn test_dns(&self, hostname: Option<&str>) -> Result<DnsResolution, NetworkError> {
        let hostname = match hostname.map(str::trim).filter(|h| !h.is_empty()) {
            Some(h) => h.to_string(),
            None => self.default_hostname(),
        };

        if let Err(e) = self.driver.clear_resolver_cache().await {
            tracing::warn!("failed to clear resolver cache: {e}");
        }

        if let Ok(ip) = hostname.parse::<Ipv4Addr>() {
            tracing::debug!(%hostname, "IPv4 literal, skipping lookup");
            return Ok(DnsResolution {
                hostname,
                addresses: vec![IpAddr::V4(ip)],
                synthetic: true,
            });
        }

        let addresses = self.driver.resolve_hostname(&hostname).await?;
        tracing::debug!(%hostname, count = addresses.len(), "resolved");
        Ok(DnsResolution {
            hostname,
            addresses,
            synthetic: false,
        })
    }
}

fn url_host(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()?
        .host_str()
        .filter(|h| !h.is_empty())
        .map(str::to_string)
}
