//! Resource tree
//!
//! Resources are addressed by URI-path segments. Each node can hold named
//! children; the deliverer walks the tree from the root.

use coapflow_core::{Exchange, Method, Response, ResponseCode};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::warn;

use crate::observe::ObserveRelation;

/// A server-side resource
pub trait Resource: Send + Sync {
    /// Path segment naming this resource under its parent
    fn name(&self) -> &str;

    /// Child resource by segment name
    fn get_child(&self, _name: &str) -> Option<Arc<dyn Resource>> {
        None
    }

    /// Whether GET requests with an Observe option establish relations
    fn is_observable(&self) -> bool {
        false
    }

    /// Handle a request bound to `exchange`
    ///
    /// The default dispatches on the request method.
    fn process_request(&self, exchange: &Arc<Exchange>) {
        let Some(request) = exchange.request() else {
            warn!("Exchange {} reached {} without a request", exchange.id(), self.name());
            return;
        };

        match request.method {
            Method::Get => self.handle_get(exchange),
            Method::Post => self.handle_post(exchange),
            Method::Put => self.handle_put(exchange),
            Method::Delete => self.handle_delete(exchange),
        }
    }

    fn handle_get(&self, exchange: &Arc<Exchange>) {
        exchange.respond(Response::new(ResponseCode::MethodNotAllowed));
    }

    fn handle_post(&self, exchange: &Arc<Exchange>) {
        exchange.respond(Response::new(ResponseCode::MethodNotAllowed));
    }

    fn handle_put(&self, exchange: &Arc<Exchange>) {
        exchange.respond(Response::new(ResponseCode::MethodNotAllowed));
    }

    fn handle_delete(&self, exchange: &Arc<Exchange>) {
        exchange.respond(Response::new(ResponseCode::MethodNotAllowed));
    }

    /// A relation was established on this resource
    fn add_observe_relation(&self, _relation: Arc<ObserveRelation>) {}

    /// A relation on this resource was canceled
    fn remove_observe_relation(&self, _relation: &ObserveRelation) {}
}

/// Plain container node
pub struct ResourceNode {
    name: String,
    children: DashMap<String, Arc<dyn Resource>>,
}

impl ResourceNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: DashMap::new(),
        }
    }

    /// Unnamed root node
    pub fn root() -> Self {
        Self::new("")
    }

    /// Attach a child, returning the one it replaced
    pub fn add_child(&self, child: Arc<dyn Resource>) -> Option<Arc<dyn Resource>> {
        self.children.insert(child.name().to_string(), child)
    }

    pub fn remove_child(&self, name: &str) -> Option<Arc<dyn Resource>> {
        self.children.remove(name).map(|(_, child)| child)
    }

    pub fn child(&self, name: &str) -> Option<Arc<dyn Resource>> {
        self.children.get(name).map(|child| Arc::clone(child.value()))
    }

    /// Child names, sorted
    pub fn child_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.children.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

impl Resource for ResourceNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_child(&self, name: &str) -> Option<Arc<dyn Resource>> {
        self.child(name)
    }
}

impl std::fmt::Debug for ResourceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceNode")
            .field("name", &self.name)
            .field("children", &self.child_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coapflow_core::Request;

    struct Hello;

    impl Resource for Hello {
        fn name(&self) -> &str {
            "hello"
        }

        fn handle_get(&self, exchange: &Arc<Exchange>) {
            exchange.respond(Response::text(ResponseCode::Content, "hi"));
        }
    }

    #[test]
    fn test_children() {
        let root = ResourceNode::root();
        assert!(root.add_child(Arc::new(Hello)).is_none());
        assert!(root.add_child(Arc::new(ResourceNode::new("debug"))).is_none());
        assert!(root.add_child(Arc::new(Hello)).is_some());

        assert_eq!(root.child_names(), vec!["debug", "hello"]);
        assert_eq!(root.get_child("hello").unwrap().name(), "hello");
        assert!(root.get_child("missing").is_none());
        assert!(root.remove_child("debug").is_some());
        assert_eq!(root.len(), 1);
    }

    #[test]
    fn test_method_dispatch() {
        let exchange = Exchange::remote(Request::get());
        Hello.process_request(&exchange);
        assert_eq!(exchange.response().unwrap().code, ResponseCode::Content);

        let exchange = Exchange::remote(Request::delete());
        Hello.process_request(&exchange);
        assert_eq!(exchange.response().unwrap().code, ResponseCode::MethodNotAllowed);
    }
}
