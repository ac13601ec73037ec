//! Request/response transactions
//!
//! An [`Exchange`] lives from the moment a request enters the pipeline until
//! its final response (or, for observed resources, its last notification)
//! leaves it. Stages and resources share it behind an `Arc`.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::{Request, Response};

/// Exchange identifier
pub type ExchangeId = Uuid;

/// Observe sequence numbers are 24 bits on the wire
const OBSERVE_SEQUENCE_MASK: u32 = 0x00FF_FFFF;

/// Which side created the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// We sent the request
    Local,
    /// A remote client sent the request
    Remote,
}

/// Carries responses from `Exchange::respond` back into a pipeline
pub trait Responder: Send + Sync {
    fn send_response(&self, exchange: &Arc<Exchange>, response: Response);
}

/// The part of an observe relation an exchange needs to know about
pub trait RelationHandle: Send + Sync {
    fn cancel(&self);

    fn is_canceled(&self) -> bool;
}

/// Hands out strictly increasing notification sequence numbers
#[derive(Debug, Default)]
pub struct ObserveOrderer {
    number: AtomicU32,
}

impl ObserveOrderer {
    pub fn new() -> Self {
        Self {
            number: AtomicU32::new(0),
        }
    }

    /// Next sequence number (wraps at 2^24)
    pub fn next(&self) -> u32 {
        let previous = self
            .number
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some((n + 1) & OBSERVE_SEQUENCE_MASK)
            })
            .unwrap_or_else(|n| n);
        (previous + 1) & OBSERVE_SEQUENCE_MASK
    }

    /// Last number handed out
    pub fn current(&self) -> u32 {
        self.number.load(Ordering::SeqCst)
    }
}

/// One CoAP transaction
pub struct Exchange {
    id: ExchangeId,
    origin: Origin,
    request: Mutex<Option<Request>>,
    response: Mutex<Option<Response>>,
    relation: Mutex<Option<Arc<dyn RelationHandle>>>,
    orderer: Mutex<Option<Arc<ObserveOrderer>>>,
    responder: Mutex<Option<Arc<dyn Responder>>>,
    responses_sent: AtomicU32,
}

impl Exchange {
    pub fn new(origin: Origin) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin,
            request: Mutex::new(None),
            response: Mutex::new(None),
            relation: Mutex::new(None),
            orderer: Mutex::new(None),
            responder: Mutex::new(None),
            responses_sent: AtomicU32::new(0),
        }
    }

    /// Exchange for a request received from a remote client
    pub fn remote(request: Request) -> Arc<Self> {
        let exchange = Self::new(Origin::Remote);
        exchange.set_request(request);
        Arc::new(exchange)
    }

    pub fn id(&self) -> ExchangeId {
        self.id
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Originating request, if bound
    pub fn request(&self) -> Option<Request> {
        self.request.lock().clone()
    }

    pub fn has_request(&self) -> bool {
        self.request.lock().is_some()
    }

    pub fn set_request(&self, request: Request) {
        *self.request.lock() = Some(request);
    }

    /// Latest response bound to this exchange
    pub fn response(&self) -> Option<Response> {
        self.response.lock().clone()
    }

    pub fn set_response(&self, response: Response) {
        *self.response.lock() = Some(response);
    }

    pub fn relation(&self) -> Option<Arc<dyn RelationHandle>> {
        self.relation.lock().clone()
    }

    pub fn set_relation(&self, relation: Option<Arc<dyn RelationHandle>>) {
        *self.relation.lock() = relation;
    }

    pub fn orderer(&self) -> Option<Arc<ObserveOrderer>> {
        self.orderer.lock().clone()
    }

    pub fn set_orderer(&self, orderer: Option<Arc<ObserveOrderer>>) {
        *self.orderer.lock() = orderer;
    }

    pub fn set_responder(&self, responder: Arc<dyn Responder>) {
        *self.responder.lock() = Some(responder);
    }

    pub fn has_responder(&self) -> bool {
        self.responder.lock().is_some()
    }

    /// Number of responses passed to [`Exchange::respond`]
    pub fn responses_sent(&self) -> u32 {
        self.responses_sent.load(Ordering::SeqCst)
    }

    /// Is a live observe relation bound to this exchange
    pub fn is_observing(&self) -> bool {
        self.relation
            .lock()
            .as_ref()
            .map_or(false, |relation| !relation.is_canceled())
    }

    /// Reply to the request
    ///
    /// Copies token and destination from the request, stamps an observe
    /// sequence number on successful notifications of a live relation, and
    /// hands the response to the attached responder.
    pub fn respond(self: &Arc<Self>, mut response: Response) {
        if let Some(request) = self.request.lock().as_ref() {
            if response.token.is_empty() {
                response.token = request.token.clone();
            }
            if response.destination.is_none() {
                response.destination = request.source;
            }
        }

        if self.is_observing() && response.code.is_success() {
            if let Some(orderer) = self.orderer() {
                response.observe = Some(orderer.next());
            }
        }

        *self.response.lock() = Some(response.clone());
        self.responses_sent.fetch_add(1, Ordering::SeqCst);

        let responder = self.responder.lock().clone();
        if let Some(responder) = responder {
            responder.send_response(self, response);
        }
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("has_request", &self.has_request())
            .field("observing", &self.is_observing())
            .finish()
    }
}
