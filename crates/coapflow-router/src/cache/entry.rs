//! Stored cache entries and counters

use coapflow_core::time::round_secs;
use coapflow_core::Response;
use std::time::{Duration, Instant};

use super::CacheKey;

/// A stored response variant
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub(crate) key: CacheKey,
    pub(crate) response: Response,
    /// Freshness lifetime measured from `arrived_at`
    pub(crate) max_age: u32,
    /// Insertion or last validation
    pub(crate) arrived_at: Instant,
    /// Write time, for the residency bound
    pub(crate) stored_at: Instant,
    /// Write sequence, to recognise stale write-order records
    pub(crate) generation: u64,
}

impl CachedEntry {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn max_age(&self) -> u32 {
        self.max_age
    }

    pub fn arrived_at(&self) -> Instant {
        self.arrived_at
    }

    /// Seconds of freshness left at `now`; zero or negative means stale
    pub fn remaining_lifetime(&self, now: Instant) -> i64 {
        let in_cache = round_secs(now.saturating_duration_since(self.arrived_at));
        i64::from(self.max_age) - in_cache as i64
    }

    /// Time since the entry was written
    pub fn residency(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.stored_at)
    }

    /// Move the whole seconds spent in the cache from the clock into the lifetime
    ///
    /// The sub-second remainder stays on the clock, so frequent hits still
    /// age the entry.
    pub(crate) fn charge(&mut self, now: Instant) {
        let in_cache = round_secs(now.saturating_duration_since(self.arrived_at));
        let charged = u32::try_from(in_cache).unwrap_or(u32::MAX).min(self.max_age);
        self.max_age -= charged;
        self.arrived_at += Duration::from_secs(u64::from(charged));
        self.response.max_age = Some(self.max_age);
        self.response.timestamp = now;
    }

    /// Restart the freshness clock with a new lifetime
    pub(crate) fn refresh(&mut self, max_age: u32, now: Instant) {
        self.max_age = max_age;
        self.arrived_at = now;
        self.response.max_age = Some(max_age);
        self.response.timestamp = now;
    }
}

/// Snapshot of the cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Capacity and residency evictions
    pub evictions: u64,
    /// Explicit invalidations that removed an entry
    pub invalidations: u64,
    pub size: usize,
}

impl CacheStats {
    pub fn request_count(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        match self.request_count() {
            0 => 1.0,
            n => self.hits as f64 / n as f64,
        }
    }
}
