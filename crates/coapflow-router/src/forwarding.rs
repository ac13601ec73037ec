//! Forwarding resources
//!
//! A forwarding resource answers every method by asking a [`Forwarder`] for
//! the response, typically by proxying the request to an origin server.

use async_trait::async_trait;
use coapflow_core::{Exchange, Method, Request, Response};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::cache::ProxyCache;
use crate::resource::Resource;

/// Produces the response for a forwarded request
///
/// Transport failures are reported as 5.xx responses.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward_request(&self, request: Request) -> Response;
}

/// Resource that answers through a [`Forwarder`]
pub struct ForwardingResource<F> {
    name: String,
    forwarder: Arc<F>,
    runtime: Handle,
    cache: Option<Arc<ProxyCache>>,
}

impl<F: Forwarder + 'static> ForwardingResource<F> {
    pub fn new(name: impl Into<String>, forwarder: Arc<F>, runtime: Handle) -> Self {
        Self {
            name: name.into(),
            forwarder,
            runtime,
            cache: None,
        }
    }

    /// Serve GETs from `cache` when possible and feed it forwarded responses
    pub fn with_cache(mut self, cache: Arc<ProxyCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache(&self) -> Option<&Arc<ProxyCache>> {
        self.cache.as_ref()
    }

    fn forward(&self, exchange: &Arc<Exchange>) {
        let Some(request) = exchange.request() else {
            warn!("Exchange {} has no request to forward", exchange.id());
            return;
        };

        if request.method == Method::Get {
            if let Some(hit) = self.cache.as_ref().and_then(|cache| cache.get_response(&request)) {
                debug!("Serving {} from the proxy cache", request.path());
                exchange.respond(hit);
                return;
            }
        }

        let forwarder = Arc::clone(&self.forwarder);
        let cache = self.cache.clone();
        let exchange = Arc::clone(exchange);

        self.runtime.spawn(async move {
            let response = forwarder.forward_request(request.clone()).await;
            if let Some(cache) = cache {
                cache.cache_response(&request, &response);
            }
            exchange.respond(response);
        });
    }
}

impl<F: Forwarder + 'static> Resource for ForwardingResource<F> {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle_get(&self, exchange: &Arc<Exchange>) {
        self.forward(exchange);
    }

    fn handle_post(&self, exchange: &Arc<Exchange>) {
        self.forward(exchange);
    }

    fn handle_put(&self, exchange: &Arc<Exchange>) {
        self.forward(exchange);
    }

    fn handle_delete(&self, exchange: &Arc<Exchange>) {
        self.forward(exchange);
    }
}
