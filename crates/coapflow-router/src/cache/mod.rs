//! Proxy response cache
//!
//! Stores successful responses from origin servers keyed by target URI,
//! media type and request payload. A stored response is served while its
//! Max-Age lifetime lasts; every hit restarts the lifetime with whatever
//! was left of it. Stale entries go through the configured [`Revalidator`]
//! and are dropped when it does not confirm them.
//!
//! Independently of freshness, the cache holds at most `capacity` entries
//! and drops anything older than `max_residency` since it was written.

mod entry;
mod key;
mod revalidate;

pub use entry::{CacheStats, CachedEntry};
pub use key::CacheKey;
pub use revalidate::{NoRevalidation, Revalidator};

use coapflow_core::{Clock, Request, Response, ResponseCode, SystemClock};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::CacheConfig;

/// Cache errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cannot derive cache key: {0}")]
    InvalidUri(String),

    #[error("payload too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("caching is disabled")]
    Disabled,
}

impl From<coapflow_core::Error> for CacheError {
    fn from(err: coapflow_core::Error) -> Self {
        CacheError::InvalidUri(err.to_string())
    }
}

enum Lookup {
    Fresh(Response),
    Stale(CachedEntry),
    Aged,
}

/// Response cache for a forward proxy
pub struct ProxyCache {
    entries: DashMap<CacheKey, CachedEntry>,
    /// Keys in write order, tagged with the generation they were written at
    write_order: Mutex<VecDeque<(CacheKey, u64)>>,
    generation: AtomicU64,
    enabled: AtomicBool,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    revalidator: Arc<dyn Revalidator>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl ProxyCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            write_order: Mutex::new(VecDeque::new()),
            generation: AtomicU64::new(0),
            enabled: AtomicBool::new(config.enabled),
            config,
            clock,
            revalidator: Arc::new(NoRevalidation),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Replace the revalidation strategy
    pub fn with_revalidator(mut self, revalidator: Arc<dyn Revalidator>) -> Self {
        self.revalidator = revalidator;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        info!("Proxy cache {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Flip the enabled flag, returning the new state
    pub fn toggle(&self) -> bool {
        let enabled = !self.enabled.fetch_xor(true, Ordering::SeqCst);
        info!("Proxy cache {}", if enabled { "enabled" } else { "disabled" });
        enabled
    }

    /// Update the cache with a response received from an origin server
    pub fn cache_response(&self, request: &Request, response: &Response) {
        if !self.is_enabled() {
            return;
        }

        let code = response.code;
        if !code.is_success() {
            trace!("Not caching {} response for {}", code, request.path());
            return;
        }

        let key = match CacheKey::from_content_format(request, response) {
            Ok(key) => key,
            Err(e) => {
                warn!("Skipping cache update: {}", e);
                return;
            }
        };

        if code.is_state_changing() {
            if self.invalidate_key(&key) {
                debug!("Invalidated {} after {}", key, code);
            }
        } else if code == ResponseCode::Valid {
            match response.max_age {
                Some(max_age) => self.validated(&key, max_age),
                None => warn!("No Max-Age in 2.03 response for {}", key),
            }
        } else if code == ResponseCode::Content {
            let max_age = response.max_age.unwrap_or(self.config.default_max_age);
            if max_age == 0 {
                debug!("Zero lifetime response for {}, dropping stored variants", key);
                self.invalidate(request);
                return;
            }

            let mut stored = response.clone();
            stored.max_age = Some(max_age);
            match self.insert(key, &stored) {
                Ok(()) => debug!("Cached response for {}", request.path()),
                Err(e) => warn!("Failed to insert the response in the cache: {}", e),
            }
        } else {
            debug!("Response code {} is not cacheable", code);
        }
    }

    /// Look up a fresh response for a proxied request
    pub fn get_response(&self, request: &Request) -> Option<Response> {
        if !self.is_enabled() {
            return None;
        }

        let keys = match CacheKey::from_accept_options(request) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Cache lookup skipped: {}", e);
                return None;
            }
        };

        let now = self.clock.now();
        let max_residency = self.config.max_residency();

        for key in keys {
            let lookup = match self.entries.get_mut(&key) {
                None => continue,
                Some(mut entry) => {
                    if entry.residency(now) >= max_residency {
                        Lookup::Aged
                    } else {
                        let remaining = entry.remaining_lifetime(now);
                        if remaining > 0 {
                            entry.charge(now);
                            Lookup::Fresh(entry.response().clone())
                        } else {
                            Lookup::Stale(entry.clone())
                        }
                    }
                }
            };

            match lookup {
                Lookup::Fresh(response) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    trace!("Cache hit for {}", key);
                    return Some(response);
                }
                Lookup::Aged => {
                    self.evict(&key);
                }
                Lookup::Stale(entry) => {
                    debug!("Cached response for {} is stale", key);
                    return self.revalidate(&key, &entry, now);
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Drop every variant a request could be served from
    pub fn invalidate(&self, request: &Request) {
        match CacheKey::from_accept_options(request) {
            Ok(keys) => {
                for key in keys {
                    self.invalidate_key(&key);
                }
            }
            Err(e) => warn!("Cache invalidation skipped: {}", e),
        }
    }

    /// Drop one entry, returning whether it existed
    pub fn invalidate_key(&self, key: &CacheKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Drop everything
    pub fn flush_all(&self) {
        let mut order = self.write_order.lock();
        let count = self.entries.len();
        self.entries.clear();
        order.clear();
        info!("Flushed {} cached responses", count);
    }

    /// Store a response under an explicit key
    ///
    /// The response's Max-Age (or the default) becomes the lifetime, capped
    /// at `max_age_cap`.
    pub fn insert(&self, key: CacheKey, response: &Response) -> Result<(), CacheError> {
        if !self.is_enabled() {
            return Err(CacheError::Disabled);
        }

        let size = response.payload.len();
        if size > self.config.max_payload_bytes {
            return Err(CacheError::TooLarge {
                size,
                max: self.config.max_payload_bytes,
            });
        }

        let now = self.clock.now();
        let max_age = response
            .max_age
            .unwrap_or(self.config.default_max_age)
            .min(self.config.max_age_cap);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);

        let mut stored = response.clone();
        stored.max_age = Some(max_age);
        stored.timestamp = now;

        let entry = CachedEntry {
            key: key.clone(),
            response: stored,
            max_age,
            arrived_at: now,
            stored_at: now,
            generation,
        };

        let mut order = self.write_order.lock();
        self.entries.insert(key.clone(), entry);
        order.push_back((key, generation));
        self.evict_overflow(&mut order, now);

        Ok(())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stored keys with their remaining lifetime, ordered by URI
    pub fn entries(&self) -> Vec<(CacheKey, i64)> {
        let now = self.clock.now();
        let mut entries: Vec<(CacheKey, i64)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.remaining_lifetime(now)))
            .collect();
        entries.sort_by(|(a, _), (b, _)| {
            a.proxy_uri()
                .cmp(b.proxy_uri())
                .then(a.media_type().id().cmp(&b.media_type().id()))
        });
        entries
    }

    /// Evict entries past the residency bound, returning how many went
    pub fn sweep(&self) -> usize {
        let before = self.evictions.load(Ordering::Relaxed);
        let mut order = self.write_order.lock();
        self.evict_overflow(&mut order, self.clock.now());
        (self.evictions.load(Ordering::Relaxed) - before) as usize
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            size: self.entries.len(),
        }
    }

    /// Run [`sweep`](Self::sweep) periodically on the current runtime
    ///
    /// The task stops once the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let swept = cache.sweep();
                if swept > 0 {
                    debug!("Swept {} aged cache entries", swept);
                }
            }
        })
    }

    fn validated(&self, key: &CacheKey, max_age: u32) {
        let now = self.clock.now();
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.refresh(max_age.min(self.config.max_age_cap), now);
                debug!("Revalidated cached response for {}", key);
            }
            None => debug!("2.03 for {} which is not cached", key),
        }
    }

    fn revalidate(&self, key: &CacheKey, entry: &CachedEntry, now: Instant) -> Option<Response> {
        match self.revalidator.revalidate(key, entry) {
            Some(validation) => {
                let max_age = validation
                    .max_age
                    .unwrap_or(self.config.default_max_age)
                    .min(self.config.max_age_cap);
                let refreshed = self.entries.get_mut(key).map(|mut stored| {
                    stored.refresh(max_age, now);
                    stored.response().clone()
                });
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Validation successful for {}", key);
                Some(refreshed.unwrap_or(validation))
            }
            None => {
                self.invalidate_key(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!("Validation failed for {}", key);
                None
            }
        }
    }

    fn evict(&self, key: &CacheKey) {
        if self.entries.remove(key).is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("Evicted {}", key);
        }
    }

    /// Pop the oldest writes while over capacity or past residency
    fn evict_overflow(&self, order: &mut VecDeque<(CacheKey, u64)>, now: Instant) {
        let max_residency = self.config.max_residency();

        loop {
            let (key, generation) = match order.front() {
                Some((key, generation)) => (key.clone(), *generation),
                None => break,
            };

            let live = self
                .entries
                .get(&key)
                .filter(|entry| entry.generation == generation)
                .map(|entry| entry.stored_at);

            match live {
                // Overwritten or already removed
                None => {
                    order.pop_front();
                }
                Some(stored_at) => {
                    let over_capacity = self.entries.len() > self.config.capacity;
                    let aged = now.saturating_duration_since(stored_at) >= max_residency;
                    if !over_capacity && !aged {
                        break;
                    }
                    order.pop_front();
                    if self
                        .entries
                        .remove_if(&key, |_, entry| entry.generation == generation)
                        .is_some()
                    {
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        debug!("Evicted {}", key);
                    }
                }
            }
        }

        if order.len() > self.config.capacity.saturating_mul(2).max(64) {
            order.retain(|(key, generation)| {
                self.entries
                    .get(key)
                    .map_or(false, |entry| entry.generation == *generation)
            });
        }
    }
}

impl Default for ProxyCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coapflow_core::{ManualClock, MediaType};

    fn cache_with_clock() -> (ProxyCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let cache = ProxyCache::with_clock(CacheConfig::default(), clock.clone());
        (cache, clock)
    }

    fn proxied(uri: &str) -> Request {
        Request::get().with_proxy_uri(uri)
    }

    fn content(body: &str, max_age: u32) -> Response {
        Response::text(ResponseCode::Content, body).with_max_age(max_age)
    }

    #[test]
    fn test_store_and_hit() {
        let (cache, _clock) = cache_with_clock();
        let request = proxied("coap://ex/a");
        cache.cache_response(&request, &content("hello", 10));

        let hit = cache.get_response(&request).unwrap();
        assert_eq!(hit.payload_str(), "hello");
        assert_eq!(hit.max_age, Some(10));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_default_max_age() {
        let (cache, _clock) = cache_with_clock();
        let request = proxied("coap://ex/a");
        cache.cache_response(&request, &Response::text(ResponseCode::Content, "x"));
        assert_eq!(cache.get_response(&request).unwrap().max_age, Some(60));
    }

    #[test]
    fn test_error_responses_not_stored() {
        let (cache, _clock) = cache_with_clock();
        let request = proxied("coap://ex/a");
        cache.cache_response(&request, &Response::new(ResponseCode::NotFound));
        cache.cache_response(&request, &Response::new(ResponseCode::BadGateway));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_insert_too_large() {
        let clock = Arc::new(ManualClock::new());
        let config = CacheConfig {
            max_payload_bytes: 4,
            ..Default::default()
        };
        let cache = ProxyCache::with_clock(config, clock);
        let key = CacheKey::new("coap://ex/a", MediaType::TEXT_PLAIN, "");
        let err = cache
            .insert(key, &Response::text(ResponseCode::Content, "too big"))
            .unwrap_err();
        assert_eq!(err, CacheError::TooLarge { size: 7, max: 4 });
    }

    #[test]
    fn test_max_age_cap() {
        let clock = Arc::new(ManualClock::new());
        let config = CacheConfig {
            max_age_cap: 100,
            ..Default::default()
        };
        let cache = ProxyCache::with_clock(config, clock);
        let request = proxied("coap://ex/a");
        cache.cache_response(&request, &content("x", 5_000));
        assert_eq!(cache.get_response(&request).unwrap().max_age, Some(100));
    }

    #[test]
    fn test_toggle() {
        let (cache, _clock) = cache_with_clock();
        assert!(cache.is_enabled());
        assert!(!cache.toggle());
        assert!(!cache.is_enabled());
        assert!(cache.toggle());
    }

    #[test]
    fn test_overwrite_keeps_single_order_record_live() {
        let clock = Arc::new(ManualClock::new());
        let config = CacheConfig {
            capacity: 2,
            ..Default::default()
        };
        let cache = ProxyCache::with_clock(config, clock);
        let a = proxied("coap://ex/a");
        let b = proxied("coap://ex/b");

        cache.cache_response(&a, &content("a1", 10));
        cache.cache_response(&b, &content("b", 10));
        // Rewriting `a` makes `b` the oldest write
        cache.cache_response(&a, &content("a2", 10));
        cache.cache_response(&proxied("coap://ex/c"), &content("c", 10));

        assert!(cache.get_response(&b).is_none());
        assert_eq!(cache.get_response(&a).unwrap().payload_str(), "a2");
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_sweep_counts_aged_entries() {
        let clock = Arc::new(ManualClock::new());
        let config = CacheConfig {
            max_residency_secs: 30,
            ..Default::default()
        };
        let cache = ProxyCache::with_clock(config, clock.clone());
        cache.cache_response(&proxied("coap://ex/a"), &content("a", 600));
        clock.advance(Duration::from_secs(20));
        cache.cache_response(&proxied("coap://ex/b"), &content("b", 600));

        clock.advance(Duration::from_secs(10));
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);

        clock.advance(Duration::from_secs(20));
        assert_eq!(cache.sweep(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_entries_listing() {
        let (cache, clock) = cache_with_clock();
        cache.cache_response(&proxied("coap://ex/b"), &content("b", 30));
        cache.cache_response(
            &proxied("coap://ex/a"),
            &content("a", 20).with_content_format(MediaType::JSON),
        );
        clock.advance(Duration::from_secs(5));

        let entries = cache.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0.proxy_uri(), "coap://ex/a");
        assert_eq!(entries[0].0.media_type(), MediaType::JSON);
        assert_eq!(entries[0].1, 15);
        assert_eq!(entries[1].1, 25);
    }
}
