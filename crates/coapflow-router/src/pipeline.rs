//! Chain executor
//!
//! Every exchange gets its own unbounded queue drained by one task on the
//! runtime, so operations of one exchange run strictly in submission order
//! while different exchanges proceed concurrently.
//!
//! A queue is retired once a response has left the bottom of the chain for
//! an exchange without a live observe relation, or once it has been idle
//! for the idle timeout while not observing. Later operations on the same
//! exchange open a fresh queue.

use coapflow_core::{EmptyMessage, Exchange, ExchangeId, Request, Responder, Response};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::stage::{StageChain, StageId, StageOp};

/// Idle time after which a non-observing exchange loses its queue
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

type Job = (StageId, StageOp);

struct Queue {
    tx: mpsc::UnboundedSender<Job>,
    generation: u64,
}

type QueueMap = DashMap<ExchangeId, Queue>;

struct PipelineInner {
    chain: Arc<StageChain>,
    bottom: StageId,
    top: StageId,
    runtime: Handle,
    idle_timeout: Duration,
    queues: Arc<QueueMap>,
    generations: AtomicU64,
}

impl PipelineInner {
    fn submit(&self, exchange: &Arc<Exchange>, at: StageId, op: StageOp) {
        let sender = self
            .queues
            .entry(exchange.id())
            .or_insert_with(|| self.spawn_worker(exchange))
            .tx
            .clone();

        if let Err(mpsc::error::SendError((_, op))) = sender.send((at, op)) {
            warn!("Queue of exchange {} closed, dropping {}", exchange.id(), op.kind());
        }
    }

    fn spawn_worker(&self, exchange: &Arc<Exchange>) -> Queue {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let chain = Arc::clone(&self.chain);
        let queues = Arc::downgrade(&self.queues);
        let idle = self.idle_timeout;
        let exchange = Arc::clone(exchange);

        self.runtime.spawn(async move {
            let mut retired = false;
            loop {
                let job = if retired {
                    rx.recv().await
                } else {
                    match tokio::time::timeout(idle, rx.recv()).await {
                        Ok(job) => job,
                        Err(_) => {
                            if !exchange.is_observing() {
                                debug!("Exchange {} idle, retiring queue", exchange.id());
                                retire(&queues, &exchange, generation);
                                retired = true;
                            }
                            continue;
                        }
                    }
                };
                let Some((at, op)) = job else {
                    break;
                };

                let kind = op.kind();
                let answered = matches!(op, StageOp::SendResponse(_));
                if let Err(e) = chain.dispatch(at, &exchange, op) {
                    error!("Failed to {} on exchange {}: {}", kind, exchange.id(), e);
                }
                if answered && !retired && !exchange.is_observing() {
                    retire(&queues, &exchange, generation);
                    retired = true;
                }
            }
            debug!("Exchange {} queue drained", exchange.id());
        });

        Queue { tx, generation }
    }
}

/// Drop the map entry of this worker's queue, if it is still the current one
///
/// The worker keeps draining until the last sender is gone.
fn retire(queues: &Weak<QueueMap>, exchange: &Exchange, generation: u64) {
    if let Some(queues) = queues.upgrade() {
        queues.remove_if(&exchange.id(), |_, queue| queue.generation == generation);
    }
}

/// Runs a linked chain on a tokio runtime
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    /// `bottom` receives inbound traffic, `top` outbound
    pub fn new(chain: Arc<StageChain>, bottom: StageId, top: StageId, runtime: Handle) -> Self {
        Self::with_idle_timeout(chain, bottom, top, runtime, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(
        chain: Arc<StageChain>,
        bottom: StageId,
        top: StageId,
        runtime: Handle,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                chain,
                bottom,
                top,
                runtime,
                idle_timeout,
                queues: Arc::new(DashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn chain(&self) -> &Arc<StageChain> {
        &self.inner.chain
    }

    /// Inbound request from the transport
    ///
    /// Responses produced for it re-enter the pipeline at the top, on the
    /// same exchange queue.
    pub fn receive_request(&self, exchange: &Arc<Exchange>, request: Request) {
        if !exchange.has_responder() {
            exchange.set_responder(Arc::new(PipelineResponder {
                inner: Arc::downgrade(&self.inner),
            }));
        }
        self.inner
            .submit(exchange, self.inner.bottom, StageOp::ReceiveRequest(request));
    }

    pub fn receive_response(&self, exchange: &Arc<Exchange>, response: Response) {
        self.inner
            .submit(exchange, self.inner.bottom, StageOp::ReceiveResponse(response));
    }

    pub fn receive_empty(&self, exchange: &Arc<Exchange>, message: EmptyMessage) {
        self.inner
            .submit(exchange, self.inner.bottom, StageOp::ReceiveEmpty(message));
    }

    pub fn send_request(&self, exchange: &Arc<Exchange>, request: Request) {
        self.inner
            .submit(exchange, self.inner.top, StageOp::SendRequest(request));
    }

    pub fn send_response(&self, exchange: &Arc<Exchange>, response: Response) {
        self.inner
            .submit(exchange, self.inner.top, StageOp::SendResponse(response));
    }

    pub fn send_empty(&self, exchange: &Arc<Exchange>, message: EmptyMessage) {
        self.inner
            .submit(exchange, self.inner.top, StageOp::SendEmpty(message));
    }

    /// Release the queue of an exchange before it retires on its own
    ///
    /// Operations already queued still run.
    pub fn complete(&self, id: ExchangeId) -> bool {
        self.inner.queues.remove(&id).is_some()
    }

    /// Exchanges with an open queue
    pub fn active_exchanges(&self) -> usize {
        self.inner.queues.len()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("bottom", &self.inner.bottom)
            .field("top", &self.inner.top)
            .field("active_exchanges", &self.active_exchanges())
            .finish()
    }
}

struct PipelineResponder {
    inner: Weak<PipelineInner>,
}

impl Responder for PipelineResponder {
    fn send_response(&self, exchange: &Arc<Exchange>, response: Response) {
        match self.inner.upgrade() {
            Some(inner) => {
                let top = inner.top;
                inner.submit(exchange, top, StageOp::SendResponse(response));
            }
            None => warn!("Pipeline dropped before exchange {} was answered", exchange.id()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{Stage, StageContext};
    use coapflow_core::ResponseCode;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Echo {
        sent: Mutex<Vec<Response>>,
    }

    impl Stage for Echo {
        fn receive_request(&self, _: &StageContext<'_>, exchange: &Arc<Exchange>, request: Request) {
            exchange.set_request(request);
            exchange.respond(Response::new(ResponseCode::Content));
        }

        fn send_response(&self, _: &StageContext<'_>, _: &Arc<Exchange>, response: Response) {
            self.sent.lock().push(response);
        }
    }

    #[tokio::test]
    async fn test_response_reenters_at_top() {
        let echo = Arc::new(Echo::default());
        let mut chain = StageChain::new();
        let id = chain.add_shared(echo.clone());
        let pipeline = Pipeline::new(Arc::new(chain), id, id, Handle::current());

        let exchange = Arc::new(Exchange::new(coapflow_core::Origin::Remote));
        pipeline.receive_request(&exchange, Request::get().with_token(vec![7]));

        for _ in 0..100 {
            if !echo.sent.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let sent = echo.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0].token[..], &[7]);
        drop(sent);

        for _ in 0..100 {
            if pipeline.active_exchanges() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pipeline.active_exchanges(), 0);
        assert!(!pipeline.complete(exchange.id()));
    }

    #[tokio::test]
    async fn test_idle_queue_is_retired() {
        let mut chain = StageChain::new();
        let id = chain.add_shared(Arc::new(Echo::default()));
        let pipeline = Pipeline::with_idle_timeout(
            Arc::new(chain),
            id,
            id,
            Handle::current(),
            Duration::from_millis(20),
        );

        let exchange = Arc::new(Exchange::new(coapflow_core::Origin::Remote));
        pipeline.receive_empty(&exchange, EmptyMessage::new(coapflow_core::MessageType::Ack));
        assert_eq!(pipeline.active_exchanges(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pipeline.active_exchanges(), 0);
    }
}
