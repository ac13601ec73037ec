//! Cache administration resource
//!
//! - GET lists the commands and every cached key
//! - DELETE flushes the cache
//! - POST or PUT toggles caching

use coapflow_core::{Exchange, Response, ResponseCode};
use std::fmt::Write;
use std::sync::Arc;
use tracing::info;

use crate::cache::ProxyCache;
use crate::resource::Resource;

const COMMANDS: &str = "Available commands:\n \
    - GET: show cached values\n \
    - DELETE: empty the cache\n \
    - POST: enable/disable caching\n";

pub struct CacheAdminResource {
    cache: Arc<ProxyCache>,
}

impl CacheAdminResource {
    pub const NAME: &'static str = "cache";

    pub fn new(cache: Arc<ProxyCache>) -> Self {
        Self { cache }
    }

    /// Text served on GET
    pub fn listing(&self) -> String {
        let mut body = String::from(COMMANDS);
        body.push_str("\nCached values:\n");
        for (key, remaining) in self.cache.entries() {
            let media = key.media_type();
            let _ = writeln!(
                body,
                "{} ({}) > {} seconds | ({})",
                key.proxy_uri(),
                media.name(),
                remaining,
                media.id()
            );
        }
        body
    }

    fn toggle(&self, exchange: &Arc<Exchange>) {
        let enabled = self.cache.toggle();
        let body = if enabled { "Enabled" } else { "Disabled" };
        exchange.respond(Response::text(ResponseCode::Changed, body));
    }
}

impl Resource for CacheAdminResource {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn handle_get(&self, exchange: &Arc<Exchange>) {
        exchange.respond(Response::text(ResponseCode::Content, self.listing()));
    }

    fn handle_delete(&self, exchange: &Arc<Exchange>) {
        self.cache.flush_all();
        info!("Proxy cache flushed on request");
        exchange.respond(Response::new(ResponseCode::Deleted));
    }

    fn handle_post(&self, exchange: &Arc<Exchange>) {
        self.toggle(exchange);
    }

    fn handle_put(&self, exchange: &Arc<Exchange>) {
        self.toggle(exchange);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use coapflow_core::{ManualClock, MediaType, Request};

    fn admin() -> (CacheAdminResource, Arc<ProxyCache>) {
        let cache = Arc::new(ProxyCache::with_clock(
            CacheConfig::default(),
            Arc::new(ManualClock::new()),
        ));
        (CacheAdminResource::new(cache.clone()), cache)
    }

    #[test]
    fn test_listing_format() {
        let (admin, cache) = admin();
        cache.cache_response(
            &Request::get().with_proxy_uri("coap://ex/a"),
            &Response::text(ResponseCode::Content, "x")
                .with_content_format(MediaType::JSON)
                .with_max_age(30),
        );

        let listing = admin.listing();
        assert!(listing.starts_with("Available commands:\n - GET: show cached values\n"));
        assert!(listing.contains("coap://ex/a (application/json) > 30 seconds | (50)\n"));
    }

    #[test]
    fn test_toggle_and_flush() {
        let (admin, cache) = admin();
        cache.cache_response(
            &Request::get().with_proxy_uri("coap://ex/a"),
            &Response::text(ResponseCode::Content, "x"),
        );

        let exchange = Exchange::remote(Request::post());
        admin.process_request(&exchange);
        let response = exchange.response().unwrap();
        assert_eq!(response.code, ResponseCode::Changed);
        assert_eq!(response.payload_str(), "Disabled");
        assert_eq!(cache.len(), 1);

        let exchange = Exchange::remote(Request::delete());
        admin.process_request(&exchange);
        assert_eq!(exchange.response().unwrap().code, ResponseCode::Deleted);
        assert!(cache.is_empty());
    }
}
