//! Server message delivery
//!
//! The deliverer sits at the top of the chain. It resolves the request path
//! against the resource tree, registers or cancels observe relations, and
//! hands the exchange to the resource.

use coapflow_core::{
    EmptyMessage, Exchange, Method, RelationHandle, Request, Responder, Response, ResponseCode,
};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, trace, warn};

use crate::config::PathResolution;
use crate::error::{Result, RouterError};
use crate::observe::ObserveManager;
use crate::resource::Resource;
use crate::stage::{Stage, StageChain, StageContext, StageId, StageOp};

/// Routes requests to resources
pub struct ServerMessageDeliverer {
    root: Arc<dyn Resource>,
    observe: Arc<ObserveManager>,
    resolution: PathResolution,
}

impl ServerMessageDeliverer {
    pub fn new(root: Arc<dyn Resource>) -> Self {
        Self::with_observe_manager(root, Arc::new(ObserveManager::new()))
    }

    pub fn with_observe_manager(root: Arc<dyn Resource>, observe: Arc<ObserveManager>) -> Self {
        Self {
            root,
            observe,
            resolution: PathResolution::default(),
        }
    }

    pub fn with_resolution(mut self, resolution: PathResolution) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn root(&self) -> &Arc<dyn Resource> {
        &self.root
    }

    pub fn observe_manager(&self) -> &Arc<ObserveManager> {
        &self.observe
    }

    pub fn resolution(&self) -> PathResolution {
        self.resolution
    }

    /// Deliver the request bound to `exchange` to its resource
    ///
    /// Responds 4.04 when resolution does not get past the root.
    pub fn deliver_request(&self, exchange: &Arc<Exchange>) -> Result<()> {
        let request = exchange
            .request()
            .ok_or(RouterError::PreconditionViolated("exchange has no request"))?;

        match self.resolve(&request.uri_path) {
            Some((resource, depth)) if depth > 0 => {
                self.check_for_observe_option(exchange, &request, &resource);
                trace!("Delivering {} {} to {}", request.method, request.path(), resource.name());
                resource.process_request(exchange);
                Ok(())
            }
            _ => {
                info!("Did not find resource {} requested by {:?}", request.path(), request.source);
                exchange.respond(Response::new(ResponseCode::NotFound));
                Err(RouterError::ResourceNotFound(request.path()))
            }
        }
    }

    /// Register or cancel an observe relation for a GET
    ///
    /// Requests without a source address cannot be tracked and are served
    /// as plain GETs.
    fn check_for_observe_option(
        &self,
        exchange: &Arc<Exchange>,
        request: &Request,
        resource: &Arc<dyn Resource>,
    ) {
        if request.method != Method::Get {
            return;
        }
        let Some(source) = request.source else {
            if request.has_observe() {
                debug!("Observe request for {} has no source address", request.path());
            }
            return;
        };

        if request.has_observe() {
            if !resource.is_observable() {
                return;
            }
            let endpoint = self.observe.find_or_create_endpoint(source);
            let relation = endpoint.find_or_create_relation(&request.uri_path, resource);
            relation.set_exchange(exchange);
            let handle: Arc<dyn RelationHandle> = relation.clone();
            exchange.set_relation(Some(handle));
            exchange.set_orderer(Some(relation.orderer()));
            resource.add_observe_relation(relation);
            debug!("{} observes {}", source, request.path());
        } else if let Some(relation) = self
            .observe
            .endpoint(&source)
            .and_then(|endpoint| endpoint.relation(&request.uri_path))
        {
            relation.cancel();
        }
    }

    /// Resolve a path against the resource tree
    pub fn find_resource(&self, path: &[String]) -> Option<Arc<dyn Resource>> {
        self.resolve(path).map(|(resource, _)| resource)
    }

    /// Resolved resource and the number of segments that matched
    fn resolve(&self, path: &[String]) -> Option<(Arc<dyn Resource>, usize)> {
        let mut current = Arc::clone(&self.root);
        for (depth, segment) in path.iter().enumerate() {
            match current.get_child(segment) {
                Some(child) => current = child,
                None => {
                    return match self.resolution {
                        PathResolution::DeepestMatch => Some((current, depth)),
                        PathResolution::Exact => None,
                    }
                }
            }
        }
        Some((current, path.len()))
    }

    /// Complete a locally originated exchange with its response
    pub fn deliver_response(&self, exchange: Option<&Arc<Exchange>>, response: Option<Response>) -> Result<()> {
        let exchange = exchange.ok_or(RouterError::PreconditionViolated("exchange must not be null"))?;
        let response = response.ok_or(RouterError::PreconditionViolated("response must not be null"))?;
        if !exchange.has_request() {
            return Err(RouterError::PreconditionViolated("request must not be null"));
        }
        exchange.set_response(response);
        Ok(())
    }
}

impl std::fmt::Debug for ServerMessageDeliverer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerMessageDeliverer")
            .field("root", &self.root.name())
            .field("resolution", &self.resolution)
            .finish()
    }
}

/// Top-of-chain stage that feeds the deliverer
pub struct DelivererStage {
    deliverer: Arc<ServerMessageDeliverer>,
}

impl DelivererStage {
    pub fn new(deliverer: Arc<ServerMessageDeliverer>) -> Self {
        Self { deliverer }
    }

    pub fn deliverer(&self) -> &Arc<ServerMessageDeliverer> {
        &self.deliverer
    }
}

impl Stage for DelivererStage {
    fn name(&self) -> &str {
        "deliverer"
    }

    fn receive_request(&self, ctx: &StageContext<'_>, exchange: &Arc<Exchange>, request: Request) {
        exchange.set_request(request);
        if !exchange.has_responder() {
            exchange.set_responder(Arc::new(ChainResponder {
                chain: Arc::downgrade(ctx.chain()),
                from: ctx.id(),
            }));
        }

        match self.deliverer.deliver_request(exchange) {
            Ok(()) => {}
            Err(RouterError::ResourceNotFound(path)) => debug!("No resource for {}", path),
            Err(e) => warn!("Failed to deliver request of exchange {}: {}", exchange.id(), e),
        }
    }

    fn receive_response(&self, _ctx: &StageContext<'_>, exchange: &Arc<Exchange>, response: Response) {
        if let Err(e) = self.deliverer.deliver_response(Some(exchange), Some(response)) {
            error!("Failed to deliver response of exchange {}: {}", exchange.id(), e);
        }
    }

    fn receive_empty(&self, _ctx: &StageContext<'_>, exchange: &Arc<Exchange>, message: EmptyMessage) {
        trace!("{:?} for exchange {} reached the top of the chain", message.mtype, exchange.id());
    }
}

/// Sends responses back down the chain from the deliverer
struct ChainResponder {
    chain: Weak<StageChain>,
    from: StageId,
}

impl Responder for ChainResponder {
    fn send_response(&self, exchange: &Arc<Exchange>, response: Response) {
        match self.chain.upgrade() {
            Some(chain) => {
                if let Err(e) = chain.dispatch(self.from, exchange, StageOp::SendResponse(response)) {
                    warn!("Could not send response for exchange {}: {}", exchange.id(), e);
                }
            }
            None => warn!("Chain dropped before exchange {} was answered", exchange.id()),
        }
    }
}
