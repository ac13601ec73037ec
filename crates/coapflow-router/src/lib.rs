//! Coapflow Router
//!
//! Message-handling core of a CoAP server and forward proxy:
//! - Stage chains that carry messages between transport and application
//! - Per-exchange ordered execution on a tokio runtime
//! - Request delivery to a resource tree, with observe relations
//! - A proxy response cache with freshness and revalidation rules
//! - Forwarding resources that proxy through the cache
//!
//! # Example
//!
//! ```no_run
//! use coapflow_core::{Exchange, Origin, Request};
//! use coapflow_router::{Router, RouterConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let router = Router::new(RouterConfig::default());
//!     let pipeline = router.pipeline(Vec::new(), tokio::runtime::Handle::current())?;
//!
//!     let exchange = Arc::new(Exchange::new(Origin::Remote));
//!     pipeline.receive_request(&exchange, Request::get().with_path("debug/cache"));
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod cache;
pub mod config;
pub mod deliverer;
pub mod error;
pub mod forwarding;
pub mod observe;
pub mod pipeline;
pub mod resource;
pub mod router;
pub mod stage;

pub use admin::CacheAdminResource;
pub use cache::{CacheError, CacheKey, CacheStats, CachedEntry, NoRevalidation, ProxyCache, Revalidator};
pub use config::{CacheConfig, PathResolution, RouterConfig};
pub use deliverer::{DelivererStage, ServerMessageDeliverer};
pub use error::{Result, RouterError};
pub use forwarding::{Forwarder, ForwardingResource};
pub use observe::{ObserveManager, ObserveRelation, ObserveRelations, ObservingEndpoint};
pub use pipeline::Pipeline;
pub use resource::{Resource, ResourceNode};
pub use router::{AssembledChain, Router};
pub use stage::{ChainStatsSnapshot, Direction, Stage, StageChain, StageContext, StageId, StageOp};
