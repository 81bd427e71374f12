//! Asset enrichment: reverse DNS
//!
//! A background ticker picks up assets that still lack a hostname and
//! resolves them via PTR lookups. Lookups are bounded by a semaphore,
//! carry a hard timeout, and go through a size- and TTL-bounded cache.
//! A failed lookup is cached too, so quiet address space isn't
//! re-queried every pass.

use crate::config::EnrichmentSettings;
use crate::storage::{AssetStore, StorageError};
use dashmap::DashMap;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::defaults::ENRICHMENT_CONCURRENCY;

/// Assets examined per enrichment pass.
const ASSETS_PER_PASS: usize = 200;

/// Pass cadence (seconds).
const PASS_INTERVAL_SECS: u64 = 60;

#[derive(Clone)]
struct CachedName {
    hostname: Option<String>,
    cached_at: Instant,
}

/// Reverse resolver with a bounded TTL cache.
pub struct DnsResolver {
    resolver: Option<TokioAsyncResolver>,
    cache: DashMap<IpAddr, CachedName>,
    cache_size: usize,
    cache_ttl: Duration,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl DnsResolver {
    pub fn new(settings: &EnrichmentSettings) -> Self {
        let resolver = if settings.dns_servers.is_empty() {
            match TokioAsyncResolver::tokio_from_system_conf() {
                Ok(resolver) => Some(resolver),
                Err(e) => {
                    warn!(error = %e, "System resolver unavailable — DNS enrichment disabled");
                    None
                }
            }
        } else {
            let mut config = ResolverConfig::new();
            for server in &settings.dns_servers {
                match server.parse() {
                    Ok(addr) => {
                        config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));
                    }
                    Err(_) => match format!("{server}:53").parse() {
                        Ok(addr) => {
                            config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));
                        }
                        Err(e) => {
                            warn!(server = %server, error = %e, "Ignoring malformed DNS server");
                        }
                    },
                }
            }
            Some(TokioAsyncResolver::tokio(config, ResolverOpts::default()))
        };

        Self {
            resolver,
            cache: DashMap::new(),
            cache_size: settings.dns_cache_size.max(1),
            cache_ttl: Duration::from_secs(settings.dns_cache_ttl_secs),
            timeout: Duration::from_millis(settings.dns_timeout_ms),
            permits: Arc::new(Semaphore::new(ENRICHMENT_CONCURRENCY)),
        }
    }

    /// Reverse-resolve one IP, consulting the cache first.
    ///
    /// Returns `None` both for cache misses that fail and when no
    /// resolver is configured.
    pub async fn reverse(&self, ip: IpAddr) -> Option<String> {
        if let Some(cached) = self.cache_get(ip) {
            return cached;
        }
        let resolver = self.resolver.as_ref()?;

        // Bounded in-flight lookups; a closed semaphore never happens
        let _permit = self.permits.clone().acquire_owned().await.ok()?;

        let hostname = match tokio::time::timeout(self.timeout, resolver.reverse_lookup(ip)).await
        {
            Ok(Ok(names)) => names
                .iter()
                .next()
                .map(|name| name.to_string().trim_end_matches('.').to_string()),
            Ok(Err(e)) => {
                debug!(ip = %ip, error = %e, "Reverse lookup failed");
                None
            }
            Err(_) => {
                debug!(ip = %ip, timeout_ms = self.timeout.as_millis() as u64, "Reverse lookup timed out");
                None
            }
        };

        self.cache_put(ip, hostname.clone());
        hostname
    }

    fn cache_get(&self, ip: IpAddr) -> Option<Option<String>> {
        let entry = self.cache.get(&ip)?;
        if entry.cached_at.elapsed() >= self.cache_ttl {
            drop(entry);
            self.cache.remove(&ip);
            return None;
        }
        Some(entry.hostname.clone())
    }

    fn cache_put(&self, ip: IpAddr, hostname: Option<String>) {
        if self.cache.len() >= self.cache_size {
            // Drop the stalest tenth to make room
            let mut by_age: Vec<(IpAddr, Instant)> = self
                .cache
                .iter()
                .map(|e| (*e.key(), e.value().cached_at))
                .collect();
            by_age.sort_by_key(|(_, at)| *at);
            for (old_ip, _) in by_age.into_iter().take((self.cache_size / 10).max(1)) {
                self.cache.remove(&old_ip);
            }
        }
        self.cache.insert(
            ip,
            CachedName {
                hostname,
                cached_at: Instant::now(),
            },
        );
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

/// Background task filling in missing hostnames.
pub struct DnsEnricher {
    assets: Arc<AssetStore>,
    resolver: Arc<DnsResolver>,
}

impl DnsEnricher {
    pub fn new(assets: Arc<AssetStore>, resolver: Arc<DnsResolver>) -> Self {
        Self { assets, resolver }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("DNS enricher started");
        let mut ticker = tokio::time::interval(Duration::from_secs(PASS_INTERVAL_SECS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.enrich_pass().await {
                        warn!(error = %e, "Enrichment pass failed");
                    }
                }
            }
        }
        info!("DNS enricher stopped");
    }

    /// Resolve hostnames for a bounded slice of nameless assets.
    async fn enrich_pass(&self) -> Result<(), StorageError> {
        let candidates: Vec<_> = self
            .assets
            .list_active()?
            .into_iter()
            .filter(|a| a.hostname.is_none())
            .take(ASSETS_PER_PASS)
            .collect();

        let mut resolved = 0usize;
        for mut asset in candidates {
            if let Some(hostname) = self.resolver.reverse(asset.ip_address).await {
                asset.hostname = Some(hostname.clone());
                if asset.display_name.is_none() {
                    asset.display_name = Some(hostname);
                }
                self.assets.update(&asset)?;
                resolved += 1;
            }
        }

        if resolved > 0 {
            info!(resolved = resolved, "Hostnames enriched");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(cache_size: usize, ttl_secs: u64) -> DnsResolver {
        // No resolver backend: cache-only behavior under test
        DnsResolver {
            resolver: None,
            cache: DashMap::new(),
            cache_size,
            cache_ttl: Duration::from_secs(ttl_secs),
            timeout: Duration::from_millis(100),
            permits: Arc::new(Semaphore::new(4)),
        }
    }

    #[tokio::test]
    async fn test_no_backend_returns_none() {
        let r = resolver(100, 60);
        assert_eq!(r.reverse("10.0.0.1".parse().unwrap()).await, None);
    }

    #[tokio::test]
    async fn test_cache_round_trip_including_negative() {
        let r = resolver(100, 60);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        r.cache_put(ip, Some("db-01.internal".to_string()));
        assert_eq!(
            r.reverse(ip).await,
            Some("db-01.internal".to_string())
        );

        // Negative result is cached too
        let quiet: IpAddr = "10.0.0.2".parse().unwrap();
        r.cache_put(quiet, None);
        assert_eq!(r.reverse(quiet).await, None);
        assert_eq!(r.cache_len(), 2);
    }

    #[tokio::test]
    async fn test_cache_expiry() {
        let r = resolver(100, 0); // zero TTL: everything expires instantly
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        r.cache_put(ip, Some("host".to_string()));
        // Expired entry is dropped and (with no backend) yields None
        assert_eq!(r.reverse(ip).await, None);
    }

    #[tokio::test]
    async fn test_cache_bounded() {
        let r = resolver(10, 60);
        for i in 0..30u8 {
            r.cache_put(format!("10.0.0.{i}").parse().unwrap(), None);
        }
        assert!(r.cache_len() <= 10);
    }
}
