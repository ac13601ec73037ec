//! Revalidation of stale entries

use coapflow_core::Response;

use super::{CacheKey, CachedEntry};

/// Strategy consulted when a looked-up entry has run out of freshness
///
/// Returning a response means the origin confirmed the stored
/// representation; its Max-Age (or the default) becomes the new lifetime.
/// Returning `None` invalidates the entry.
pub trait Revalidator: Send + Sync {
    fn revalidate(&self, key: &CacheKey, entry: &CachedEntry) -> Option<Response>;
}

/// Never revalidates
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRevalidation;

impl Revalidator for NoRevalidation {
    fn revalidate(&self, _key: &CacheKey, _entry: &CachedEntry) -> Option<Response> {
        None
    }
}
