use dashmap::DashMap;
use log::debug;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// How long a PTR lookup may take before it counts as a miss
const LOOKUP_TIMEOUT: Duration = Duration::from_millis(500);
const HIT_TTL: Duration = Duration::from_secs(600);
const MISS_TTL: Duration = Duration::from_secs(60);
/// Cache entries kept before expired and soonest-expiring ones are dropped
const CACHE_LIMIT: usize = 8192;

#[derive(Debug, Clone)]
struct CacheEntry {
    hostname: Option<String>,
    expires: Instant,
}

/// Reverse DNS with a per-address cache.
///
/// Misses and timeouts are cached too, for a shorter time, so a map full of
/// unresolvable addresses does not keep the resolver busy.
pub struct ReverseDns {
    resolver: TokioAsyncResolver,
    cache: DashMap<IpAddr, CacheEntry>,
    limit: usize,
}

impl ReverseDns {
    /// Use the system resolver configuration, falling back to Google DNS
    pub fn new() -> Self {
        Self::with_limit(CACHE_LIMIT)
    }

    /// Like [`ReverseDns::new`], caching at most `limit` addresses
    pub fn with_limit(limit: usize) -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            debug!("No system resolver configuration ({}), using Google DNS", e);
            TokioAsyncResolver::tokio(ResolverConfig::google(), ResolverOpts::default())
        });

        Self {
            resolver,
            cache: DashMap::new(),
            limit: limit.max(1),
        }
    }

    /// Hostname for `ip`, if its PTR record resolves in time
    pub async fn reverse_resolve(&self, ip: IpAddr) -> Option<String> {
        if let Some(entry) = self.cache.get(&ip) {
            if entry.expires > Instant::now() {
                return entry.hostname.clone();
            }
        }

        let hostname = match tokio::time::timeout(LOOKUP_TIMEOUT, self.resolver.reverse_lookup(ip)).await {
            Ok(Ok(lookup)) => lookup
                .iter()
                .next()
                .map(|name| name.to_string().trim_end_matches('.').to_string()),
            Ok(Err(e)) => {
                debug!("Reverse lookup failed for {}: {}", ip, e);
                None
            }
            Err(_) => {
                debug!("Reverse lookup timed out for {}", ip);
                None
            }
        };

        let ttl = if hostname.is_some() { HIT_TTL } else { MISS_TTL };
        self.store(ip, hostname.clone(), Instant::now() + ttl);
        hostname
    }

    fn store(&self, ip: IpAddr, hostname: Option<String>, expires: Instant) {
        if !self.cache.contains_key(&ip) && self.cache.len() >= self.limit {
            self.purge_expired();
        }
        while self.cache.len() >= self.limit && !self.cache.contains_key(&ip) {
            let soonest = self
                .cache
                .iter()
                .min_by_key(|entry| entry.expires)
                .map(|entry| *entry.key());
            match soonest {
                Some(oldest) => {
                    self.cache.remove(&oldest);
                }
                None => break,
            }
        }

        self.cache.insert(ip, CacheEntry { hostname, expires });
    }

    /// Drop expired cache entries
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let before = self.cache.len();
        self.cache.retain(|_, entry| entry.expires > now);

        let purged = before.saturating_sub(self.cache.len());
        if purged > 0 {
            debug!("Purged {} expired reverse DNS entries", purged);
        }
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

impl Default for ReverseDns {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cached_answer_skips_lookup() {
        let dns = ReverseDns::new();
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        dns.cache.insert(
            ip,
            CacheEntry {
                hostname: Some("edge.example.net".into()),
                expires: Instant::now() + HIT_TTL,
            },
        );

        assert_eq!(dns.reverse_resolve(ip).await.as_deref(), Some("edge.example.net"));
    }

    #[tokio::test]
    async fn purge_drops_expired_entries() {
        let dns = ReverseDns::new();
        let now = Instant::now();
        dns.cache.insert(
            "192.0.2.1".parse().unwrap(),
            CacheEntry {
                hostname: None,
                expires: now,
            },
        );
        dns.cache.insert(
            "192.0.2.2".parse().unwrap(),
            CacheEntry {
                hostname: None,
                expires: now + MISS_TTL,
            },
        );

        dns.purge_expired();
        assert_eq!(dns.cached(), 1);
    }

    #[tokio::test]
    async fn full_cache_makes_room() {
        let dns = ReverseDns::with_limit(2);
        let now = Instant::now();
        let addr = |last: u8| IpAddr::from([192, 0, 2, last]);

        dns.store(addr(1), None, now);
        dns.store(addr(2), Some("b.example.net".into()), now + HIT_TTL);
        dns.store(addr(3), None, now + MISS_TTL);

        // The expired entry goes first
        assert_eq!(dns.cached(), 2);
        assert!(!dns.cache.contains_key(&addr(1)));

        // Then whichever expires soonest
        dns.store(addr(4), None, now + MISS_TTL * 2);
        assert_eq!(dns.cached(), 2);
        assert!(dns.cache.contains_key(&addr(2)));
        assert!(dns.cache.contains_key(&addr(4)));

        // Refreshing a cached address never evicts another
        dns.store(addr(4), Some("d.example.net".into()), now + HIT_TTL);
        assert_eq!(dns.cached(), 2);
    }
}
