//! Router assembly
//!
//! The [`Router`] owns everything one server instance shares: the resource
//! tree, the observe registry, the proxy cache and the deliverer. It also
//! assembles stage chains with the deliverer on top.
//!
//! ```no_run
//! use coapflow_router::{Router, RouterConfig};
//!
//! # fn main() -> coapflow_router::Result<()> {
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! let router = Router::new(RouterConfig::default());
//! let _pipeline = router.pipeline(Vec::new(), runtime.handle().clone())?;
//! # Ok(())
//! # }
//! ```

use coapflow_core::{Clock, SystemClock};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::info;

use crate::admin::CacheAdminResource;
use crate::cache::{NoRevalidation, ProxyCache, Revalidator};
use crate::config::RouterConfig;
use crate::deliverer::{DelivererStage, ServerMessageDeliverer};
use crate::error::Result;
use crate::observe::ObserveManager;
use crate::pipeline::Pipeline;
use crate::resource::{Resource, ResourceNode};
use crate::stage::{Stage, StageChain, StageId};

/// Name of the node the admin resource is mounted under
pub const DEBUG_NODE: &str = "debug";

/// A linked chain with the ids of its two ends
pub struct AssembledChain {
    pub chain: StageChain,
    pub bottom: StageId,
    pub top: StageId,
}

/// Shared state of one server instance
pub struct Router {
    config: RouterConfig,
    root: Arc<ResourceNode>,
    observe: Arc<ObserveManager>,
    cache: Arc<ProxyCache>,
    deliverer: Arc<ServerMessageDeliverer>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Router whose cache reads time from `clock`
    pub fn with_clock(config: RouterConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_revalidator(config, clock, Arc::new(NoRevalidation))
    }

    /// Router whose cache asks `revalidator` about stale entries
    pub fn with_revalidator(
        config: RouterConfig,
        clock: Arc<dyn Clock>,
        revalidator: Arc<dyn Revalidator>,
    ) -> Self {
        let root = Arc::new(ResourceNode::root());
        let cache = Arc::new(
            ProxyCache::with_clock(config.cache.clone(), clock).with_revalidator(revalidator),
        );

        if config.cache.admin_resource {
            let debug = ResourceNode::new(DEBUG_NODE);
            debug.add_child(Arc::new(CacheAdminResource::new(Arc::clone(&cache))));
            root.add_child(Arc::new(debug));
        }

        let observe = Arc::new(ObserveManager::new());
        let tree: Arc<dyn Resource> = root.clone();
        let deliverer = Arc::new(
            ServerMessageDeliverer::with_observe_manager(tree, Arc::clone(&observe))
                .with_resolution(config.resolution),
        );

        info!(
            "Router {} ready (resolution {:?}, cache capacity {})",
            config.name, config.resolution, config.cache.capacity
        );

        Self {
            config,
            root,
            observe,
            cache,
            deliverer,
        }
    }

    /// Router configured from a TOML document
    pub fn from_toml_str(input: &str) -> Result<Self> {
        Ok(Self::new(RouterConfig::from_toml_str(input)?))
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn root(&self) -> &Arc<ResourceNode> {
        &self.root
    }

    /// Mount a resource directly under the root
    pub fn add_resource(&self, resource: Arc<dyn Resource>) {
        info!("Mounted resource /{}", resource.name());
        self.root.add_child(resource);
    }

    pub fn cache(&self) -> &Arc<ProxyCache> {
        &self.cache
    }

    pub fn observe_manager(&self) -> &Arc<ObserveManager> {
        &self.observe
    }

    pub fn deliverer(&self) -> &Arc<ServerMessageDeliverer> {
        &self.deliverer
    }

    /// Link `stages` bottom to top with a deliverer stage on top
    pub fn build_chain(&self, stages: Vec<Arc<dyn Stage>>) -> Result<AssembledChain> {
        let mut chain = StageChain::new();
        let mut ids: Vec<StageId> = stages.into_iter().map(|stage| chain.add_shared(stage)).collect();
        let top = chain.add(DelivererStage::new(Arc::clone(&self.deliverer)));
        ids.push(top);
        chain.stack(&ids)?;

        Ok(AssembledChain {
            chain,
            bottom: ids[0],
            top,
        })
    }

    /// Assemble a chain and run it on `runtime`
    pub fn pipeline(&self, stages: Vec<Arc<dyn Stage>>, runtime: Handle) -> Result<Pipeline> {
        let AssembledChain { chain, bottom, top } = self.build_chain(stages)?;
        Ok(Pipeline::with_idle_timeout(
            Arc::new(chain),
            bottom,
            top,
            runtime,
            self.config.exchange_idle_timeout(),
        ))
    }

    /// Start the background cache sweep if one is configured
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_sweeper(&self) -> Option<JoinHandle<()>> {
        let interval = self.config.cache.sweep_interval()?;
        info!("Sweeping the proxy cache every {:?}", interval);
        Some(self.cache.spawn_sweeper(interval))
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("name", &self.config.name)
            .field("resources", &self.root.child_names())
            .field("cached", &self.cache.len())
            .finish()
    }
}
