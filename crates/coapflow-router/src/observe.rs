//! Observe relations
//!
//! A relation ties one remote endpoint to one resource path. Endpoints own
//! their relations by path; a relation only holds weak links back to its
//! endpoint and resource, so canceling is the single way one goes away.
//! An endpoint leaves the registry together with its last relation.

use coapflow_core::address::format_path;
use coapflow_core::{EndpointAddress, Exchange, ObserveOrderer, RelationHandle, Request, Response};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;
use uuid::Uuid;

use crate::resource::Resource;

type EndpointMap = DashMap<EndpointAddress, Arc<ObservingEndpoint>>;

/// Registry of endpoints that observe something
#[derive(Default)]
pub struct ObserveManager {
    endpoints: Arc<EndpointMap>,
}

impl ObserveManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_or_create_endpoint(&self, address: EndpointAddress) -> Arc<ObservingEndpoint> {
        self.endpoints
            .entry(address)
            .or_insert_with(|| {
                Arc::new(ObservingEndpoint {
                    address,
                    registry: Arc::downgrade(&self.endpoints),
                    relations: DashMap::new(),
                })
            })
            .clone()
    }

    /// Lookup without creating
    pub fn endpoint(&self, address: &EndpointAddress) -> Option<Arc<ObservingEndpoint>> {
        self.endpoints.get(address).map(|e| Arc::clone(e.value()))
    }

    /// Forget an endpoint and cancel all its relations
    pub fn remove_endpoint(&self, address: &EndpointAddress) -> usize {
        match self.endpoints.remove(address) {
            Some((_, endpoint)) => endpoint.cancel_all(),
            None => 0,
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn relation_count(&self) -> usize {
        self.endpoints.iter().map(|e| e.relation_count()).sum()
    }
}

/// A remote endpoint holding observe relations
pub struct ObservingEndpoint {
    address: EndpointAddress,
    registry: Weak<EndpointMap>,
    relations: DashMap<String, Arc<ObserveRelation>>,
}

impl ObservingEndpoint {
    /// Endpoint outside any registry
    pub fn new(address: EndpointAddress) -> Self {
        Self {
            address,
            registry: Weak::new(),
            relations: DashMap::new(),
        }
    }

    pub fn address(&self) -> EndpointAddress {
        self.address
    }

    /// Relation for `path`, created on first use
    pub fn find_or_create_relation(
        self: &Arc<Self>,
        path: &[String],
        resource: &Arc<dyn Resource>,
    ) -> Arc<ObserveRelation> {
        let key = format_path(path);
        let relation = self
            .relations
            .entry(key.clone())
            .or_insert_with(|| {
                debug!("New observe relation {} {}", self.address, key);
                Arc::new(ObserveRelation {
                    id: Uuid::new_v4(),
                    endpoint: Arc::downgrade(self),
                    address: self.address,
                    key,
                    path: path.to_vec(),
                    resource: Arc::downgrade(resource),
                    exchange: Mutex::new(None),
                    orderer: Arc::new(ObserveOrderer::new()),
                    canceled: AtomicBool::new(false),
                })
            })
            .clone();

        // Rejoin the registry if the last relation was canceled meanwhile
        if let Some(registry) = self.registry.upgrade() {
            registry
                .entry(self.address)
                .or_insert_with(|| Arc::clone(self));
        }
        relation
    }

    pub fn relation(&self, path: &[String]) -> Option<Arc<ObserveRelation>> {
        self.relations
            .get(&format_path(path))
            .map(|r| Arc::clone(r.value()))
    }

    pub fn relation_count(&self) -> usize {
        self.relations.len()
    }

    /// Cancel every relation of this endpoint
    pub fn cancel_all(&self) -> usize {
        let relations: Vec<Arc<ObserveRelation>> =
            self.relations.iter().map(|r| Arc::clone(r.value())).collect();
        for relation in &relations {
            relation.cancel();
        }
        relations.len()
    }

    fn remove_relation(self: &Arc<Self>, relation: &ObserveRelation) {
        self.relations.remove_if(&relation.key, |_, r| r.id == relation.id);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if(&self.address, |_, e| {
                Arc::ptr_eq(e, self) && e.relations.is_empty()
            });
        }
    }
}

impl std::fmt::Debug for ObservingEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservingEndpoint")
            .field("address", &self.address)
            .field("relations", &self.relations.len())
            .finish()
    }
}

/// Subscription of one endpoint to one resource path
pub struct ObserveRelation {
    id: Uuid,
    endpoint: Weak<ObservingEndpoint>,
    address: EndpointAddress,
    key: String,
    path: Vec<String>,
    resource: Weak<dyn Resource>,
    /// Exchange notifications are sent on
    exchange: Mutex<Option<Arc<Exchange>>>,
    orderer: Arc<ObserveOrderer>,
    canceled: AtomicBool,
}

impl ObserveRelation {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn address(&self) -> EndpointAddress {
        self.address
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn exchange(&self) -> Option<Arc<Exchange>> {
        self.exchange.lock().clone()
    }

    /// Rebind to the exchange of the latest registration
    pub fn set_exchange(&self, exchange: &Arc<Exchange>) {
        *self.exchange.lock() = Some(Arc::clone(exchange));
    }

    pub fn orderer(&self) -> Arc<ObserveOrderer> {
        Arc::clone(&self.orderer)
    }

    pub fn resource(&self) -> Option<Arc<dyn Resource>> {
        self.resource.upgrade()
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Cancel the relation
    ///
    /// Removes it from its endpoint and its resource and unbinds it from its
    /// exchange. Repeated calls do nothing.
    pub fn cancel(&self) {
        if self.canceled.swap(true, Ordering::SeqCst) {
            return;
        }

        let exchange = self.exchange.lock().take();
        if let Some(exchange) = exchange {
            exchange.set_relation(None);
        }

        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.remove_relation(self);
        }
        if let Some(resource) = self.resource.upgrade() {
            resource.remove_observe_relation(self);
        }
        debug!("Canceled observe relation {} {}", self.address, self.key);
    }
}

impl RelationHandle for ObserveRelation {
    fn cancel(&self) {
        ObserveRelation::cancel(self);
    }

    fn is_canceled(&self) -> bool {
        ObserveRelation::is_canceled(self)
    }
}

impl std::fmt::Debug for ObserveRelation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserveRelation")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("path", &self.key)
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// Relations held by an observable resource
#[derive(Default)]
pub struct ObserveRelations {
    relations: DashMap<Uuid, Arc<ObserveRelation>>,
}

impl ObserveRelations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, relation: Arc<ObserveRelation>) {
        self.relations.insert(relation.id(), relation);
    }

    pub fn remove(&self, relation: &ObserveRelation) -> bool {
        self.relations.remove(&relation.id()).is_some()
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    /// Send a notification to every live relation
    ///
    /// `build` gets the registering request of each relation. Returns the
    /// number of notifications sent.
    pub fn notify<F>(&self, build: F) -> usize
    where
        F: Fn(&Request) -> Response,
    {
        let relations: Vec<Arc<ObserveRelation>> =
            self.relations.iter().map(|r| Arc::clone(r.value())).collect();

        let mut sent = 0;
        for relation in relations {
            if relation.is_canceled() {
                self.remove(&relation);
                continue;
            }
            let Some(exchange) = relation.exchange() else {
                continue;
            };
            if let Some(request) = exchange.request() {
                exchange.respond(build(&request));
                sent += 1;
            }
        }
        sent
    }

    /// Cancel every relation, as when the resource goes away
    pub fn cancel_all(&self) {
        let relations: Vec<Arc<ObserveRelation>> =
            self.relations.iter().map(|r| Arc::clone(r.value())).collect();
        for relation in relations {
            relation.cancel();
            self.remove(&relation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceNode;
    use std::net::{IpAddr, Ipv4Addr};

    fn address(port: u16) -> EndpointAddress {
        EndpointAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn path(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_one_relation_per_path() {
        let manager = ObserveManager::new();
        let resource: Arc<dyn Resource> = Arc::new(ResourceNode::new("temp"));
        let endpoint = manager.find_or_create_endpoint(address(1000));

        let first = endpoint.find_or_create_relation(&path(&["temp"]), &resource);
        let second = endpoint.find_or_create_relation(&path(&["temp"]), &resource);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.relation_count(), 1);

        endpoint.find_or_create_relation(&path(&["other"]), &resource);
        assert_eq!(manager.relation_count(), 2);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let manager = ObserveManager::new();
        let resource: Arc<dyn Resource> = Arc::new(ResourceNode::new("temp"));
        let endpoint = manager.find_or_create_endpoint(address(1000));
        let relation = endpoint.find_or_create_relation(&path(&["temp"]), &resource);

        relation.cancel();
        relation.cancel();
        assert!(relation.is_canceled());
        assert!(endpoint.relation(&path(&["temp"])).is_none());

        // A fresh registration gets a new relation
        let again = endpoint.find_or_create_relation(&path(&["temp"]), &resource);
        assert!(!Arc::ptr_eq(&relation, &again));
        assert!(!again.is_canceled());
    }

    #[test]
    fn test_remove_endpoint_cancels() {
        let manager = ObserveManager::new();
        let resource: Arc<dyn Resource> = Arc::new(ResourceNode::new("temp"));
        let endpoint = manager.find_or_create_endpoint(address(1000));
        let a = endpoint.find_or_create_relation(&path(&["a"]), &resource);
        let b = endpoint.find_or_create_relation(&path(&["b"]), &resource);

        assert_eq!(manager.remove_endpoint(&address(1000)), 2);
        assert!(a.is_canceled() && b.is_canceled());
        assert_eq!(manager.endpoint_count(), 0);
    }

    #[test]
    fn test_last_relation_takes_endpoint_along() {
        let manager = ObserveManager::new();
        let resource: Arc<dyn Resource> = Arc::new(ResourceNode::new("temp"));
        let endpoint = manager.find_or_create_endpoint(address(1000));
        let a = endpoint.find_or_create_relation(&path(&["a"]), &resource);
        let b = endpoint.find_or_create_relation(&path(&["b"]), &resource);

        a.cancel();
        assert_eq!(manager.endpoint_count(), 1);
        b.cancel();
        assert_eq!(manager.endpoint_count(), 0);

        endpoint.find_or_create_relation(&path(&["a"]), &resource);
        assert_eq!(manager.endpoint_count(), 1);
        assert_eq!(manager.relation_count(), 1);
    }

    #[test]
    fn test_cancel_unbinds_exchange() {
        let manager = ObserveManager::new();
        let resource: Arc<dyn Resource> = Arc::new(ResourceNode::new("temp"));
        let endpoint = manager.find_or_create_endpoint(address(1000));
        let relation = endpoint.find_or_create_relation(&path(&["temp"]), &resource);

        let exchange = Exchange::remote(Request::get().with_observe(0));
        let handle: Arc<dyn RelationHandle> = relation.clone();
        exchange.set_relation(Some(handle));
        relation.set_exchange(&exchange);
        let weak = Arc::downgrade(&exchange);

        relation.cancel();
        assert!(relation.exchange().is_none());
        assert!(exchange.relation().is_none());
        drop(exchange);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_notify_skips_canceled() {
        let manager = ObserveManager::new();
        let resource: Arc<dyn Resource> = Arc::new(ResourceNode::new("temp"));
        let relations = ObserveRelations::new();

        for port in [1000, 1001] {
            let endpoint = manager.find_or_create_endpoint(address(port));
            let relation = endpoint.find_or_create_relation(&path(&["temp"]), &resource);
            let exchange = Exchange::remote(Request::get().with_observe(0));
            relation.set_exchange(&exchange);
            relations.add(relation);
        }

        let first = manager
            .endpoint(&address(1000))
            .and_then(|e| e.relation(&path(&["temp"])))
            .unwrap();
        first.cancel();

        let sent = relations.notify(|_| Response::text(coapflow_core::ResponseCode::Content, "21"));
        assert_eq!(sent, 1);
        assert_eq!(relations.len(), 1);
    }
}
