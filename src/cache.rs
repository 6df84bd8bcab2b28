//! Single-flight, TTL-based resolution cache sitting in front of the
//! catalog client.
//!
//! The cache mutex is held only for bookkeeping (lookup/insert/evict) and is
//! never held across a catalog query — concurrent misses for the same key
//! coalesce onto a single [`futures_util::future::Shared`] future instead,
//! which is what keeps the mutex short-held even under a thundering herd.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;

use crate::catalog::{CatalogClient, CatalogError, Endpoint};
use crate::host::ServiceKey;

/// A resolution in flight, shared by every caller that observed the miss.
type InflightFuture = Shared<BoxFuture<'static, Result<Arc<[Endpoint]>, CatalogError>>>;

/// Default soft cap on the number of cache entries — a reasonable default
/// for a single-process router.
const DEFAULT_CAPACITY: usize = 10_000;

struct Slot {
    endpoints: Arc<[Endpoint]>,
    deadline: Instant,
    inflight: Option<InflightFuture>,
    /// Last time this slot was written with a successful resolution — used
    /// for least-recently-resolved eviction, distinct from read recency.
    last_resolved: Instant,
}

impl Slot {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.deadline
    }
}

/// Memoizes catalog answers by [`ServiceKey`] with a TTL, coalescing
/// concurrent misses into a single in-flight catalog query per key.
#[derive(Clone)]
pub struct ResolutionCache {
    slots: Arc<Mutex<HashMap<ServiceKey, Slot>>>,
    catalog: CatalogClient,
    ttl: Duration,
    capacity: usize,
}

impl ResolutionCache {
    pub fn new(catalog: CatalogClient, ttl: Duration) -> Self {
        Self::with_capacity(catalog, ttl, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(catalog: CatalogClient, ttl: Duration, capacity: usize) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            catalog,
            ttl,
            capacity,
        }
    }

    /// Resolves `key`, returning a fresh-enough endpoint set or an error.
    ///
    /// On catalog failure with a non-expired prior entry, this is
    /// stale-if-error: the prior endpoints are returned and the deadline is
    /// left untouched. On catalog failure with no usable prior entry, the
    /// error propagates and no negative entry is written, so the next
    /// caller retries.
    pub async fn resolve(&self, key: &ServiceKey) -> Result<Arc<[Endpoint]>, CatalogError> {
        let now = Instant::now();
        let inflight = {
            let mut slots = self.slots.lock();
            match slots.get(key) {
                Some(slot) if slot.is_fresh(now) && slot.inflight.is_none() => {
                    return Ok(slot.endpoints.clone());
                }
                Some(slot) if slot.inflight.is_some() => slot.inflight.clone().unwrap(),
                _ => {
                    // Expired-or-absent with no refresh running: launch one.
                    let prior = slots.get(key).map(|slot| slot.endpoints.clone());
                    let fut = self.spawn_refresh(key.clone(), prior);
                    slots
                        .entry(key.clone())
                        .or_insert_with(|| Slot {
                            endpoints: Arc::from(Vec::new()),
                            deadline: now,
                            inflight: None,
                            last_resolved: now,
                        })
                        .inflight = Some(fut.clone());
                    fut
                }
            }
        };

        inflight.await
    }

    /// Builds the shared future that performs the catalog query and commits
    /// its result back into the slot table. Stored as the slot's `inflight`
    /// handle so concurrent callers attach to this single execution.
    fn spawn_refresh(
        &self,
        key: ServiceKey,
        prior: Option<Arc<[Endpoint]>>,
    ) -> InflightFuture {
        let catalog = self.catalog.clone();
        let slots = self.slots.clone();
        let ttl = self.ttl;
        let capacity = self.capacity;

        let fut: BoxFuture<'static, Result<Arc<[Endpoint]>, CatalogError>> = Box::pin(async move {
            let result = catalog.lookup(&key).await;
            let mut table = slots.lock();

            match result {
                Ok(endpoints) => {
                    let endpoints: Arc<[Endpoint]> = Arc::from(endpoints);
                    let now = Instant::now();
                    table.insert(
                        key.clone(),
                        Slot {
                            endpoints: endpoints.clone(),
                            deadline: now + ttl,
                            inflight: None,
                            last_resolved: now,
                        },
                    );
                    evict_if_over_capacity(&mut table, capacity);
                    Ok(endpoints)
                }
                Err(err) => {
                    // Clear the inflight handle; leave the slot's deadline
                    // untouched so the next caller retries immediately.
                    if let Some(slot) = table.get_mut(&key) {
                        slot.inflight = None;
                    }
                    match prior {
                        Some(endpoints) => Ok(endpoints),
                        None => Err(err),
                    }
                }
            }
        });

        fut.shared()
    }
}

/// Drops expired entries first, then least-recently-resolved ones, until the
/// table is at or under `capacity`. Never evicts an entry with an active
/// `inflight` handle.
fn evict_if_over_capacity(table: &mut HashMap<ServiceKey, Slot>, capacity: usize) {
    if table.len() <= capacity {
        return;
    }

    let now = Instant::now();
    let expired: Vec<ServiceKey> = table
        .iter()
        .filter(|(_, slot)| !slot.is_fresh(now) && slot.inflight.is_none())
        .map(|(key, _)| key.clone())
        .collect();
    for key in expired {
        if table.len() <= capacity {
            return;
        }
        table.remove(&key);
    }

    while table.len() > capacity {
        let oldest = table
            .iter()
            .filter(|(_, slot)| slot.inflight.is_none())
            .min_by_key(|(_, slot)| slot.last_resolved)
            .map(|(key, _)| key.clone());
        match oldest {
            Some(key) => {
                table.remove(&key);
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    struct CountingResponder {
        calls: Arc<AtomicUsize>,
        delay: Duration,
        body: serde_json::Value,
    }

    impl Respond for CountingResponder {
        fn respond(&self, _req: &Request) -> ResponseTemplate {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ResponseTemplate::new(200)
                .set_body_json(self.body.clone())
                .set_delay(self.delay)
        }
    }

    fn endpoint_body(addr: &str, port: u16) -> serde_json::Value {
        json!([{"Service": {"Address": addr, "Port": port, "Tags": []}}])
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_to_one_catalog_call() {
        let server = MockServer::start().await;
        let calls = Arc::new(AtomicUsize::new(0));
        Mock::given(method("GET"))
            .and(path("/v1/health/service/api"))
            .respond_with(CountingResponder {
                calls: calls.clone(),
                delay: Duration::from_millis(200),
                body: endpoint_body("10.0.0.1", 8001),
            })
            .mount(&server)
            .await;

        let catalog = CatalogClient::new(server.address().to_string().as_str(), Duration::from_secs(5));
        let cache = ResolutionCache::new(catalog, Duration::from_secs(10));
        let key = ServiceKey::new("api", "");

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { cache.resolve(&key).await }));
        }

        for handle in handles {
            let endpoints = handle.await.unwrap().unwrap();
            assert_eq!(endpoints.len(), 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fresh_entry_is_served_without_requerying() {
        let server = MockServer::start().await;
        let calls = Arc::new(AtomicUsize::new(0));
        Mock::given(method("GET"))
            .and(path("/v1/health/service/api"))
            .respond_with(CountingResponder {
                calls: calls.clone(),
                delay: Duration::ZERO,
                body: endpoint_body("10.0.0.1", 8001),
            })
            .mount(&server)
            .await;

        let catalog = CatalogClient::new(server.address().to_string().as_str(), Duration::from_secs(5));
        let cache = ResolutionCache::new(catalog, Duration::from_secs(10));
        let key = ServiceKey::new("api", "");

        cache.resolve(&key).await.unwrap();
        cache.resolve(&key).await.unwrap();
        cache.resolve(&key).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_result_is_cached_until_ttl_expiry() {
        let server = MockServer::start().await;
        let calls = Arc::new(AtomicUsize::new(0));
        Mock::given(method("GET"))
            .and(path("/v1/health/service/ghost"))
            .respond_with(CountingResponder {
                calls: calls.clone(),
                delay: Duration::ZERO,
                body: json!([]),
            })
            .mount(&server)
            .await;

        let catalog = CatalogClient::new(server.address().to_string().as_str(), Duration::from_secs(5));
        let cache = ResolutionCache::new(catalog, Duration::from_millis(50));
        let key = ServiceKey::new("ghost", "");

        let endpoints = cache.resolve(&key).await.unwrap();
        assert!(endpoints.is_empty());
        cache.resolve(&key).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        cache.resolve(&key).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_entry_is_served_when_refresh_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/health/service/api"))
            .respond_with(ResponseTemplate::new(200).set_body_json(endpoint_body("10.0.0.1", 8001)))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/health/service/api"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let catalog = CatalogClient::new(server.address().to_string().as_str(), Duration::from_secs(5));
        let cache = ResolutionCache::new(catalog, Duration::from_millis(30));
        let key = ServiceKey::new("api", "");

        let first = cache.resolve(&key).await.unwrap();
        assert_eq!(first.len(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;

        // Refresh fails (503 -> Unavailable), but the prior entry is served.
        let stale = cache.resolve(&key).await.unwrap();
        assert_eq!(stale[0].authority(), "10.0.0.1:8001");

        // And the slot is left expired, so the next call retries rather than
        // being blocked by a negative cache entry.
        let retried = cache.resolve(&key).await.unwrap();
        assert_eq!(retried[0].authority(), "10.0.0.1:8001");
    }

    #[tokio::test]
    async fn error_with_no_prior_entry_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/health/service/api"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let catalog = CatalogClient::new(server.address().to_string().as_str(), Duration::from_secs(5));
        let cache = ResolutionCache::new(catalog, Duration::from_secs(10));
        let key = ServiceKey::new("api", "");

        let result = cache.resolve(&key).await;
        assert!(result.is_err());
    }
}
