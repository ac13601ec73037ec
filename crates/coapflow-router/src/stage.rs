//! Pipeline stages
//!
//! A [`StageChain`] owns an ordered set of stages, each linked to at most one
//! upper (application-facing) and one lower (transport-facing) neighbor.
//! Stages never hold references to each other; they forward messages
//! through the [`StageContext`] they are handed, which resolves neighbors by
//! [`StageId`].
//!
//! ```text
//!        top     ┌──────────────┐
//!                │  deliverer   │   receive_* ends here
//!                ├──────────────┤
//!                │  observe     │
//!                ├──────────────┤
//!                │  ...         │
//!     bottom     └──────────────┘   send_* ends at the transport
//! ```
//!
//! Links are only changed while assembling the chain (`&mut StageChain`).
//! Traffic flows through an `Arc<StageChain>`.

use coapflow_core::{EmptyMessage, Exchange, Message, Request, Response};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, trace};

use crate::error::{Result, RouterError};

/// Index of a stage inside its chain
pub type StageId = usize;

/// Side of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Toward the application
    Upper,
    /// Toward the transport
    Lower,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upper => f.write_str("upper"),
            Direction::Lower => f.write_str("lower"),
        }
    }
}

/// One directional stage operation with its message
#[derive(Debug, Clone)]
pub enum StageOp {
    SendRequest(Request),
    SendResponse(Response),
    SendEmpty(EmptyMessage),
    ReceiveRequest(Request),
    ReceiveResponse(Response),
    ReceiveEmpty(EmptyMessage),
}

impl StageOp {
    /// Neighbor this operation travels to
    pub fn direction(&self) -> Direction {
        match self {
            StageOp::SendRequest(_) | StageOp::SendResponse(_) | StageOp::SendEmpty(_) => {
                Direction::Lower
            }
            StageOp::ReceiveRequest(_)
            | StageOp::ReceiveResponse(_)
            | StageOp::ReceiveEmpty(_) => Direction::Upper,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StageOp::SendRequest(_) => "send request",
            StageOp::SendResponse(_) => "send response",
            StageOp::SendEmpty(_) => "send empty message",
            StageOp::ReceiveRequest(_) => "receive request",
            StageOp::ReceiveResponse(_) => "receive response",
            StageOp::ReceiveEmpty(_) => "receive empty message",
        }
    }
}

/// A unit of message processing
///
/// Every operation defaults to forwarding the message unchanged to the
/// neighbor on its side. Stages override only what they handle and must not
/// block on I/O; long-running work goes to the runtime and re-enters the
/// chain when it completes.
pub trait Stage: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn send_request(&self, ctx: &StageContext<'_>, exchange: &Arc<Exchange>, request: Request) {
        let _ = ctx.send_request(exchange, request);
    }

    fn send_response(&self, ctx: &StageContext<'_>, exchange: &Arc<Exchange>, response: Response) {
        let _ = ctx.send_response(exchange, response);
    }

    fn send_empty(&self, ctx: &StageContext<'_>, exchange: &Arc<Exchange>, message: EmptyMessage) {
        let _ = ctx.send_empty(exchange, message);
    }

    fn receive_request(&self, ctx: &StageContext<'_>, exchange: &Arc<Exchange>, request: Request) {
        let _ = ctx.receive_request(exchange, request);
    }

    fn receive_response(
        &self,
        ctx: &StageContext<'_>,
        exchange: &Arc<Exchange>,
        response: Response,
    ) {
        let _ = ctx.receive_response(exchange, response);
    }

    fn receive_empty(
        &self,
        ctx: &StageContext<'_>,
        exchange: &Arc<Exchange>,
        message: EmptyMessage,
    ) {
        let _ = ctx.receive_empty(exchange, message);
    }
}

/// Chain-wide message counters
#[derive(Debug, Default)]
struct ChainStats {
    ignored: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of the chain counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChainStatsSnapshot {
    /// Messages marked as intentionally dropped
    pub ignored: u64,
    /// Messages answered with a Reset
    pub rejected: u64,
    /// Messages lost to a missing neighbor
    pub dropped: u64,
}

struct StageSlot {
    stage: Arc<dyn Stage>,
    upper: Option<StageId>,
    lower: Option<StageId>,
}

/// Ordered, doubly linked set of stages
pub struct StageChain {
    slots: Vec<StageSlot>,
    stats: ChainStats,
}

impl StageChain {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            stats: ChainStats::default(),
        }
    }

    /// Add an unlinked stage
    pub fn add<S: Stage + 'static>(&mut self, stage: S) -> StageId {
        self.add_shared(Arc::new(stage))
    }

    /// Add an unlinked stage the caller keeps a handle to
    pub fn add_shared(&mut self, stage: Arc<dyn Stage>) -> StageId {
        self.slots.push(StageSlot {
            stage,
            upper: None,
            lower: None,
        });
        self.slots.len() - 1
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stage(&self, id: StageId) -> Option<&Arc<dyn Stage>> {
        self.slots.get(id).map(|slot| &slot.stage)
    }

    pub fn upper(&self, id: StageId) -> Option<StageId> {
        self.slots.get(id).and_then(|slot| slot.upper)
    }

    pub fn lower(&self, id: StageId) -> Option<StageId> {
        self.slots.get(id).and_then(|slot| slot.lower)
    }

    /// Link `neighbor` below `stage`
    ///
    /// Also makes `stage` the upper neighbor of `neighbor`. Whatever either
    /// side was linked to before is detached first. `None` detaches.
    pub fn set_lower(&mut self, stage: StageId, neighbor: Option<StageId>) -> Result<()> {
        self.check_link(stage, neighbor)?;
        if self.slots[stage].lower == neighbor {
            return Ok(());
        }

        if let Some(old) = self.slots[stage].lower.take() {
            self.slots[old].upper = None;
        }
        if let Some(neighbor) = neighbor {
            if let Some(old) = self.slots[neighbor].upper.take() {
                self.slots[old].lower = None;
            }
            self.slots[neighbor].upper = Some(stage);
            self.slots[stage].lower = Some(neighbor);
        }
        Ok(())
    }

    /// Link `neighbor` above `stage`; mirror of [`StageChain::set_lower`]
    pub fn set_upper(&mut self, stage: StageId, neighbor: Option<StageId>) -> Result<()> {
        self.check_link(stage, neighbor)?;
        if self.slots[stage].upper == neighbor {
            return Ok(());
        }

        if let Some(old) = self.slots[stage].upper.take() {
            self.slots[old].lower = None;
        }
        if let Some(neighbor) = neighbor {
            if let Some(old) = self.slots[neighbor].lower.take() {
                self.slots[old].upper = None;
            }
            self.slots[neighbor].lower = Some(stage);
            self.slots[stage].upper = Some(neighbor);
        }
        Ok(())
    }

    /// Link stages listed from bottom to top
    pub fn stack(&mut self, bottom_to_top: &[StageId]) -> Result<()> {
        for pair in bottom_to_top.windows(2) {
            self.set_upper(pair[0], Some(pair[1]))?;
        }
        Ok(())
    }

    fn check_link(&self, stage: StageId, neighbor: Option<StageId>) -> Result<()> {
        if stage >= self.slots.len() {
            return Err(RouterError::UnknownStage(stage));
        }
        if let Some(neighbor) = neighbor {
            if neighbor >= self.slots.len() {
                return Err(RouterError::UnknownStage(neighbor));
            }
            if neighbor == stage {
                return Err(RouterError::SelfLink(stage));
            }
        }
        Ok(())
    }

    /// Run `op` on the stage at `at`
    pub fn dispatch(self: &Arc<Self>, at: StageId, exchange: &Arc<Exchange>, op: StageOp) -> Result<()> {
        let stage = self
            .slots
            .get(at)
            .map(|slot| Arc::clone(&slot.stage))
            .ok_or(RouterError::UnknownStage(at))?;
        let ctx = StageContext { chain: self, id: at };

        match op {
            StageOp::SendRequest(request) => stage.send_request(&ctx, exchange, request),
            StageOp::SendResponse(response) => stage.send_response(&ctx, exchange, response),
            StageOp::SendEmpty(message) => stage.send_empty(&ctx, exchange, message),
            StageOp::ReceiveRequest(request) => stage.receive_request(&ctx, exchange, request),
            StageOp::ReceiveResponse(response) => {
                stage.receive_response(&ctx, exchange, response)
            }
            StageOp::ReceiveEmpty(message) => stage.receive_empty(&ctx, exchange, message),
        }
        Ok(())
    }

    pub fn stats(&self) -> ChainStatsSnapshot {
        ChainStatsSnapshot {
            ignored: self.stats.ignored.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for StageChain {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StageChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stages: Vec<_> = self
            .slots
            .iter()
            .map(|slot| (slot.stage.name(), slot.lower, slot.upper))
            .collect();
        f.debug_struct("StageChain").field("stages", &stages).finish()
    }
}

/// What a stage sees of its chain while handling one operation
pub struct StageContext<'a> {
    chain: &'a Arc<StageChain>,
    id: StageId,
}

impl<'a> StageContext<'a> {
    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn chain(&self) -> &'a Arc<StageChain> {
        self.chain
    }

    pub fn send_request(&self, exchange: &Arc<Exchange>, request: Request) -> Result<()> {
        self.forward(exchange, StageOp::SendRequest(request))
    }

    pub fn send_response(&self, exchange: &Arc<Exchange>, response: Response) -> Result<()> {
        self.forward(exchange, StageOp::SendResponse(response))
    }

    pub fn send_empty(&self, exchange: &Arc<Exchange>, message: EmptyMessage) -> Result<()> {
        self.forward(exchange, StageOp::SendEmpty(message))
    }

    pub fn receive_request(&self, exchange: &Arc<Exchange>, request: Request) -> Result<()> {
        self.forward(exchange, StageOp::ReceiveRequest(request))
    }

    pub fn receive_response(&self, exchange: &Arc<Exchange>, response: Response) -> Result<()> {
        self.forward(exchange, StageOp::ReceiveResponse(response))
    }

    pub fn receive_empty(&self, exchange: &Arc<Exchange>, message: EmptyMessage) -> Result<()> {
        self.forward(exchange, StageOp::ReceiveEmpty(message))
    }

    /// Mark a message as intentionally dropped
    pub fn ignore(&self, message: &mut dyn Message) {
        message.set_ignored(true);
        self.chain.stats.ignored.fetch_add(1, Ordering::Relaxed);
        trace!(mid = ?message.mid(), "Ignoring message");
    }

    /// Answer a message with a Reset
    ///
    /// ACK and RST must never elicit a control reply, so rejecting one fails
    /// before anything is sent.
    pub fn reject(&self, exchange: &Arc<Exchange>, message: &dyn Message) -> Result<()> {
        if let Some(mtype) = message.message_type() {
            if mtype.is_control() {
                return Err(RouterError::InvalidOperation(format!(
                    "rejecting an {:?} is not allowed",
                    mtype
                )));
            }
        }
        self.chain.stats.rejected.fetch_add(1, Ordering::Relaxed);
        self.send_empty(exchange, EmptyMessage::reset_for(message))
    }

    fn forward(&self, exchange: &Arc<Exchange>, op: StageOp) -> Result<()> {
        let direction = op.direction();
        let neighbor = match direction {
            Direction::Upper => self.chain.upper(self.id),
            Direction::Lower => self.chain.lower(self.id),
        };

        match neighbor {
            Some(next) => self.chain.dispatch(next, exchange, op),
            None => {
                self.chain.stats.dropped.fetch_add(1, Ordering::Relaxed);
                let stage = self
                    .chain
                    .stage(self.id)
                    .map(|stage| stage.name().to_string())
                    .unwrap_or_default();
                error!(
                    "No {} stage found to {} for exchange {} (stage {})",
                    direction,
                    op.kind(),
                    exchange.id(),
                    stage
                );
                Err(RouterError::MissingNeighbor { stage, direction })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coapflow_core::{MessageType, ResponseCode};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Sink {
        seen: Mutex<Vec<&'static str>>,
    }

    impl Stage for Sink {
        fn name(&self) -> &str {
            "sink"
        }

        fn send_response(&self, _: &StageContext<'_>, _: &Arc<Exchange>, _: Response) {
            self.seen.lock().push("send response");
        }

        fn send_empty(&self, _: &StageContext<'_>, _: &Arc<Exchange>, message: EmptyMessage) {
            assert_eq!(message.mtype, MessageType::Rst);
            self.seen.lock().push("send empty");
        }

        fn receive_request(&self, _: &StageContext<'_>, _: &Arc<Exchange>, _: Request) {
            self.seen.lock().push("receive request");
        }
    }

    struct Passthrough;

    impl Stage for Passthrough {}

    struct Rejecting;

    impl Stage for Rejecting {
        fn receive_request(&self, ctx: &StageContext<'_>, exchange: &Arc<Exchange>, request: Request) {
            ctx.reject(exchange, &request).unwrap();
        }
    }

    fn three_stage_chain() -> (StageChain, [StageId; 3]) {
        let mut chain = StageChain::new();
        let a = chain.add(Passthrough);
        let b = chain.add(Passthrough);
        let c = chain.add(Passthrough);
        (chain, [a, b, c])
    }

    #[test]
    fn test_set_lower_is_symmetric() {
        let (mut chain, [a, b, _]) = three_stage_chain();
        chain.set_lower(b, Some(a)).unwrap();
        assert_eq!(chain.lower(b), Some(a));
        assert_eq!(chain.upper(a), Some(b));
    }

    #[test]
    fn test_set_upper_is_symmetric() {
        let (mut chain, [a, b, _]) = three_stage_chain();
        chain.set_upper(a, Some(b)).unwrap();
        assert_eq!(chain.upper(a), Some(b));
        assert_eq!(chain.lower(b), Some(a));
    }

    #[test]
    fn test_relink_detaches_old_neighbor() {
        let (mut chain, [a, b, c]) = three_stage_chain();
        chain.set_lower(c, Some(a)).unwrap();
        chain.set_lower(c, Some(b)).unwrap();

        assert_eq!(chain.lower(c), Some(b));
        assert_eq!(chain.upper(b), Some(c));
        assert_eq!(chain.upper(a), None);
    }

    #[test]
    fn test_relink_detaches_neighbor_previous_link() {
        let (mut chain, [a, b, c]) = three_stage_chain();
        chain.set_upper(a, Some(c)).unwrap();
        // b takes a's place under c
        chain.set_lower(c, Some(b)).unwrap();

        assert_eq!(chain.upper(a), None);
        assert_eq!(chain.lower(c), Some(b));
    }

    #[test]
    fn test_self_link_rejected() {
        let (mut chain, [a, _, _]) = three_stage_chain();
        assert!(matches!(chain.set_lower(a, Some(a)), Err(RouterError::SelfLink(_))));
        assert!(matches!(chain.set_upper(a, Some(9)), Err(RouterError::UnknownStage(9))));
    }

    #[test]
    fn test_detach_with_none() {
        let (mut chain, [a, b, _]) = three_stage_chain();
        chain.stack(&[a, b]).unwrap();
        chain.set_upper(a, None).unwrap();
        assert_eq!(chain.upper(a), None);
        assert_eq!(chain.lower(b), None);
    }

    #[test]
    fn test_default_forwarding_reaches_ends() {
        let mut chain = StageChain::new();
        let sink = Arc::new(Sink::default());
        let bottom = chain.add_shared(sink.clone());
        let middle = chain.add(Passthrough);
        let top = chain.add_shared(sink.clone());
        chain.stack(&[bottom, middle, top]).unwrap();
        let chain = Arc::new(chain);

        let exchange = Exchange::remote(Request::get());
        chain
            .dispatch(middle, &exchange, StageOp::ReceiveRequest(Request::get()))
            .unwrap();
        chain
            .dispatch(
                middle,
                &exchange,
                StageOp::SendResponse(Response::new(ResponseCode::Content)),
            )
            .unwrap();

        assert_eq!(*sink.seen.lock(), vec!["receive request", "send response"]);
        assert_eq!(chain.stats().dropped, 0);
    }

    #[test]
    fn test_missing_neighbor_drops() {
        let mut chain = StageChain::new();
        let only = chain.add(Passthrough);
        let chain = Arc::new(chain);

        let exchange = Exchange::remote(Request::get());
        chain
            .dispatch(only, &exchange, StageOp::ReceiveRequest(Request::get()))
            .unwrap();

        assert_eq!(chain.stats().dropped, 1);
    }

    #[test]
    fn test_reject_sends_reset() {
        let mut chain = StageChain::new();
        let sink = Arc::new(Sink::default());
        let bottom = chain.add_shared(sink.clone());
        let top = chain.add(Rejecting);
        chain.stack(&[bottom, top]).unwrap();
        let chain = Arc::new(chain);

        let exchange = Exchange::remote(Request::get());
        chain
            .dispatch(top, &exchange, StageOp::ReceiveRequest(Request::get().with_mid(3)))
            .unwrap();

        assert_eq!(*sink.seen.lock(), vec!["send empty"]);
        assert_eq!(chain.stats().rejected, 1);
    }

    #[test]
    fn test_reject_control_message_fails() {
        let mut chain = StageChain::new();
        let only = chain.add(Passthrough);
        let chain = Arc::new(chain);
        let ctx = StageContext { chain: &chain, id: only };
        let exchange = Exchange::remote(Request::get());

        let ack = EmptyMessage::new(MessageType::Ack);
        assert!(matches!(
            ctx.reject(&exchange, &ack),
            Err(RouterError::InvalidOperation(_))
        ));
        let rst = Response::new(ResponseCode::Content).with_type(MessageType::Rst);
        assert!(ctx.reject(&exchange, &rst).is_err());
        assert_eq!(chain.stats().rejected, 0);
    }

    #[test]
    fn test_ignore_marks_message() {
        let mut chain = StageChain::new();
        let only = chain.add(Passthrough);
        let chain = Arc::new(chain);
        let ctx = StageContext { chain: &chain, id: only };

        let mut request = Request::get();
        ctx.ignore(&mut request);
        assert!(request.ignored);
        assert_eq!(chain.stats().ignored, 1);
    }
}
