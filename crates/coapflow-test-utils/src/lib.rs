//! Common test helpers for coapflow tests
//!
//! - Condition-based waiting (no hardcoded sleeps)
//! - A recording stage to sit at the transport end of a chain
//! - Observable and forwarding test resources
//! - Request and address builders

use async_trait::async_trait;
use coapflow_core::{
    EmptyMessage, EndpointAddress, Exchange, ExchangeId, Request, Response, ResponseCode,
};
use coapflow_router::{
    Forwarder, ObserveRelation, ObserveRelations, Resource, Stage, StageContext,
};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::timeout;

/// Default test timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(5);

// ============================================================================
// Tracing
// ============================================================================

static TRACING: Once = Once::new();

/// Install a fmt subscriber driven by `RUST_LOG`, once per test binary
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Wait for a condition with timeout - condition-based, not time-based
pub async fn wait_for<F, Fut>(check: F, interval: Duration, max_wait: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Wait for an atomic counter to reach a target value
pub async fn wait_for_count(counter: &AtomicU32, target: u32, max_wait: Duration) -> bool {
    wait_for(
        || async { counter.load(Ordering::SeqCst) >= target },
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
    .await
}

/// Wait for a boolean flag to become true
pub async fn wait_for_flag(flag: &AtomicBool, max_wait: Duration) -> bool {
    wait_for(
        || async { flag.load(Ordering::SeqCst) },
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
    .await
}

/// Wait with notification - more efficient than polling
pub async fn wait_with_notify(notify: &Notify, max_wait: Duration) -> bool {
    timeout(max_wait, notify.notified()).await.is_ok()
}

// ============================================================================
// Builders
// ============================================================================

/// Loopback endpoint on `port`
pub fn endpoint(port: u16) -> EndpointAddress {
    EndpointAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// GET for `path` from a loopback client
pub fn get(path: &str, port: u16) -> Request {
    Request::get().with_path(path).with_source(endpoint(port))
}

/// Observe registration for `path` from a loopback client
pub fn observe(path: &str, port: u16) -> Request {
    get(path, port).with_observe(0)
}

/// GET addressed to a proxy
pub fn proxied_get(path: &str, target: &str) -> Request {
    Request::get().with_path(path).with_proxy_uri(target)
}

/// Fresh remote exchange without a bound request
pub fn remote_exchange() -> Arc<Exchange> {
    Arc::new(Exchange::new(coapflow_core::Origin::Remote))
}

// ============================================================================
// Recording Stage
// ============================================================================

/// One operation seen by a [`RecordingStage`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub exchange: ExchangeId,
    pub op: &'static str,
}

/// Transport-end stage that records what passes through it
///
/// Inbound operations are recorded and forwarded up. Outbound operations
/// end here, as if written to the wire.
#[derive(Default)]
pub struct RecordingStage {
    events: Mutex<Vec<Recorded>>,
    responses: Mutex<Vec<Response>>,
    empties: Mutex<Vec<EmptyMessage>>,
    count: AtomicU32,
    notify: Notify,
}

impl RecordingStage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().clone()
    }

    /// Responses that reached the transport
    pub fn responses(&self) -> Vec<Response> {
        self.responses.lock().clone()
    }

    pub fn last_response(&self) -> Option<Response> {
        self.responses.lock().last().cloned()
    }

    pub fn empties(&self) -> Vec<EmptyMessage> {
        self.empties.lock().clone()
    }

    pub fn response_count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait for at least `n` responses
    pub async fn wait_for_responses(&self, n: u32, max_wait: Duration) -> bool {
        wait_for_count(&self.count, n, max_wait).await
    }

    /// Wait until the next response arrives
    pub async fn wait_for_next(&self, max_wait: Duration) -> bool {
        wait_with_notify(&self.notify, max_wait).await
    }

    fn record(&self, exchange: &Arc<Exchange>, op: &'static str) {
        self.events.lock().push(Recorded {
            exchange: exchange.id(),
            op,
        });
    }
}

impl Stage for RecordingStage {
    fn name(&self) -> &str {
        "recorder"
    }

    fn send_request(&self, _: &StageContext<'_>, exchange: &Arc<Exchange>, _: Request) {
        self.record(exchange, "send request");
    }

    fn send_response(&self, _: &StageContext<'_>, exchange: &Arc<Exchange>, response: Response) {
        self.record(exchange, "send response");
        self.responses.lock().push(response);
        self.count.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn send_empty(&self, _: &StageContext<'_>, exchange: &Arc<Exchange>, message: EmptyMessage) {
        self.record(exchange, "send empty");
        self.empties.lock().push(message);
    }

    fn receive_request(&self, ctx: &StageContext<'_>, exchange: &Arc<Exchange>, request: Request) {
        self.record(exchange, "receive request");
        let _ = ctx.receive_request(exchange, request);
    }

    fn receive_response(&self, ctx: &StageContext<'_>, exchange: &Arc<Exchange>, response: Response) {
        self.record(exchange, "receive response");
        let _ = ctx.receive_response(exchange, response);
    }

    fn receive_empty(&self, ctx: &StageContext<'_>, exchange: &Arc<Exchange>, message: EmptyMessage) {
        self.record(exchange, "receive empty");
        let _ = ctx.receive_empty(exchange, message);
    }
}

// ============================================================================
// Test Resources
// ============================================================================

/// Observable resource holding a text value
pub struct TestResource {
    name: String,
    value: Mutex<String>,
    observable: bool,
    relations: ObserveRelations,
    requests: AtomicU32,
}

impl TestResource {
    pub fn new(name: &str, value: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            value: Mutex::new(value.to_string()),
            observable: true,
            relations: ObserveRelations::new(),
            requests: AtomicU32::new(0),
        })
    }

    /// Resource that refuses observe registrations
    pub fn plain(name: &str, value: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            value: Mutex::new(value.to_string()),
            observable: false,
            relations: ObserveRelations::new(),
            requests: AtomicU32::new(0),
        })
    }

    /// Change the value and notify every observer
    pub fn set(&self, value: &str) -> usize {
        *self.value.lock() = value.to_string();
        self.relations
            .notify(|_| Response::text(ResponseCode::Content, value))
    }

    pub fn relation_count(&self) -> usize {
        self.relations.len()
    }

    pub fn request_count(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Drop every observer, as when the resource is removed
    pub fn cancel_observers(&self) {
        self.relations.cancel_all();
    }
}

impl Resource for TestResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_observable(&self) -> bool {
        self.observable
    }

    fn handle_get(&self, exchange: &Arc<Exchange>) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let value = self.value.lock().clone();
        exchange.respond(Response::text(ResponseCode::Content, value));
    }

    fn handle_put(&self, exchange: &Arc<Exchange>) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(request) = exchange.request() {
            *self.value.lock() = String::from_utf8_lossy(&request.payload).into_owned();
        }
        exchange.respond(Response::new(ResponseCode::Changed));
    }

    fn add_observe_relation(&self, relation: Arc<ObserveRelation>) {
        self.relations.add(relation);
    }

    fn remove_observe_relation(&self, relation: &ObserveRelation) {
        self.relations.remove(relation);
    }
}

// ============================================================================
// Test Forwarder
// ============================================================================

/// Forwarder answering every request with a fixed response
pub struct StaticForwarder {
    response: Mutex<Response>,
    delay: Option<Duration>,
    calls: AtomicU32,
    seen: Mutex<Vec<Request>>,
}

impl StaticForwarder {
    pub fn new(response: Response) -> Arc<Self> {
        Arc::new(Self {
            response: Mutex::new(response),
            delay: None,
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Forwarder that waits `delay` before answering
    pub fn delayed(response: Response, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            response: Mutex::new(response),
            delay: Some(delay),
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn set_response(&self, response: Response) {
        *self.response.lock() = response;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_counter(&self) -> &AtomicU32 {
        &self.calls
    }

    /// Requests forwarded so far
    pub fn requests(&self) -> Vec<Request> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Forwarder for StaticForwarder {
    async fn forward_request(&self, request: Request) -> Response {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.seen.lock().push(request);
        let response = self.response.lock().clone();
        self.calls.fetch_add(1, Ordering::SeqCst);
        response
    }
}
