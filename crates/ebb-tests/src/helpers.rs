//! Shared helpers for integration and property tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::watch;

use ebb_client::{ChainSyncHandler, FaultKind, FaultSink, MemoryConnection, RequestNext};
use ebb_core::constants::methods;
use ebb_core::{Block, HandlerError, Point, Response, RollBackward, RollForward, Tip};

/// Upper bound for any wait in a test.
pub const WAIT: Duration = Duration::from_secs(5);

/// A block position with a hash derived from the slot.
pub fn point(slot: u64) -> Point {
    Point::Block {
        slot,
        hash: format!("{slot:064x}"),
    }
}

pub fn tip(slot: u64, block_no: u64) -> Tip {
    Tip::Block {
        slot,
        hash: format!("{slot:064x}"),
        block_no,
    }
}

/// A minimal era-tagged block at `slot`.
pub fn block(slot: u64) -> Block {
    Block::new(json!({
        "babbage": {
            "header": { "slot": slot, "blockHash": format!("{slot:064x}") },
            "body": [],
        }
    }))
}

/// Slot recorded in a block built by [`block`].
pub fn block_slot(block: &Block) -> Option<u64> {
    block.as_json().pointer("/babbage/header/slot").and_then(Value::as_u64)
}

pub fn forward_answer(block: &Block, tip: &Tip) -> Response {
    Response::success(
        methods::REQUEST_NEXT,
        json!({ "RollForward": { "block": block, "tip": tip } }),
    )
}

pub fn backward_answer(point: &Point, tip: &Tip) -> Response {
    Response::success(
        methods::REQUEST_NEXT,
        json!({ "RollBackward": { "point": point, "tip": tip } }),
    )
}

/// Attach an echoed sequence number to a `RequestNext` answer.
pub fn sequenced(response: Response, sequence: u64) -> Response {
    response.with_reflection(Some(json!({ "sequence": sequence })))
}

/// A node at `tip` that accepts the first candidate point it is offered.
///
/// `RequestNext` is left unanswered so the test controls every instruction.
pub fn accepting_node(tip: Tip) -> Arc<MemoryConnection> {
    MemoryConnection::with_responder(move |request| {
        let result = match request.methodname.as_str() {
            methods::QUERY => json!(tip),
            methods::FIND_INTERSECT => {
                let point = request
                    .args
                    .as_ref()
                    .and_then(|args| args.pointer("/points/0"))
                    .cloned()
                    .unwrap_or_else(|| json!("origin"));
                json!({ "IntersectionFound": { "point": point, "tip": tip } })
            }
            _ => return Vec::new(),
        };
        vec![Response::success(&request.methodname, result).with_reflection(request.mirror.clone())]
    })
}

/// A node at `tip` that shares no point with any candidate.
pub fn rejecting_node(tip: Tip) -> Arc<MemoryConnection> {
    MemoryConnection::with_responder(move |request| {
        let result = match request.methodname.as_str() {
            methods::QUERY => json!(tip),
            methods::FIND_INTERSECT => json!({ "IntersectionNotFound": { "tip": tip } }),
            _ => return Vec::new(),
        };
        vec![Response::success(&request.methodname, result).with_reflection(request.mirror.clone())]
    })
}

/// Wait until `condition` holds, polling every few milliseconds up to [`WAIT`].
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    RollForward(RollForward),
    RollBackward(RollBackward),
}

/// Start and end of the handler call for the n-th event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trace {
    Started(usize),
    Finished(usize),
}

/// Handler that records every instruction it is given.
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
    trace: Mutex<Vec<Trace>>,
    finished: watch::Sender<usize>,
    delays: Mutex<VecDeque<Duration>>,
    withheld: Mutex<Vec<RequestNext>>,
    acknowledge: bool,
    fail: bool,
    panic_at: Option<usize>,
}

impl Default for RecordingHandler {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            trace: Mutex::new(Vec::new()),
            finished: watch::channel(0).0,
            delays: Mutex::new(VecDeque::new()),
            withheld: Mutex::new(Vec::new()),
            acknowledge: true,
            fail: false,
            panic_at: None,
        }
    }
}

impl RecordingHandler {
    /// Acknowledges every instruction before returning.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Keeps every acknowledgment until [`RecordingHandler::release_withheld`].
    pub fn withholding() -> Arc<Self> {
        Arc::new(Self {
            acknowledge: false,
            ..Self::default()
        })
    }

    /// Acknowledges, then returns an error from every call.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    /// Panics in the call for the `index`-th event, dropping its token.
    pub fn panicking_at(index: usize) -> Arc<Self> {
        Arc::new(Self {
            panic_at: Some(index),
            ..Self::default()
        })
    }

    /// Sleep for the given milliseconds in successive calls.
    pub fn with_delays<I>(delays: I) -> Arc<Self>
    where
        I: IntoIterator<Item = u64>,
    {
        Arc::new(Self {
            delays: Mutex::new(delays.into_iter().map(Duration::from_millis).collect()),
            ..Self::default()
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn trace(&self) -> Vec<Trace> {
        self.trace.lock().clone()
    }

    /// Slots of the forwarded blocks, in invocation order.
    pub fn forward_slots(&self) -> Vec<u64> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::RollForward(forward) => block_slot(&forward.block),
                Event::RollBackward(_) => None,
            })
            .collect()
    }

    /// Acknowledge everything held so far; returns how many were released.
    pub fn release_withheld(&self) -> usize {
        let held: Vec<_> = self.withheld.lock().drain(..).collect();
        let count = held.len();
        for next in held {
            next.request_next();
        }
        count
    }

    /// Wait until `n` handler calls have finished. Returns false on timeout.
    pub async fn wait_for(&self, n: usize) -> bool {
        let mut finished = self.finished.subscribe();
        let reached = async {
            while *finished.borrow_and_update() < n {
                if finished.changed().await.is_err() {
                    return false;
                }
            }
            true
        };
        tokio::time::timeout(WAIT, reached).await.unwrap_or(false)
    }

    async fn record(&self, event: Event, next: RequestNext) -> Result<(), HandlerError> {
        let index = {
            let mut events = self.events.lock();
            events.push(event);
            events.len() - 1
        };
        self.trace.lock().push(Trace::Started(index));
        if self.panic_at == Some(index) {
            panic!("handler crashed on event {index}");
        }

        let delay = self.delays.lock().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.trace.lock().push(Trace::Finished(index));
        if self.acknowledge {
            next.request_next();
        } else {
            self.withheld.lock().push(next);
        }
        self.finished.send_modify(|n| *n += 1);

        if self.fail {
            return Err(format!("handler refused event {index}").into());
        }
        Ok(())
    }
}

#[async_trait]
impl ChainSyncHandler for RecordingHandler {
    async fn roll_backward(&self, event: RollBackward, next: RequestNext) -> Result<(), HandlerError> {
        self.record(Event::RollBackward(event), next).await
    }

    async fn roll_forward(&self, event: RollForward, next: RequestNext) -> Result<(), HandlerError> {
        self.record(Event::RollForward(event), next).await
    }
}

/// Fault sink that keeps every report.
#[derive(Debug, Default)]
pub struct RecordingFaultSink {
    faults: Mutex<Vec<(FaultKind, String)>>,
}

impl RecordingFaultSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn faults(&self) -> Vec<(FaultKind, String)> {
        self.faults.lock().clone()
    }

    pub fn count(&self, kind: FaultKind) -> usize {
        self.faults.lock().iter().filter(|(k, _)| *k == kind).count()
    }
}

impl FaultSink for RecordingFaultSink {
    fn report(&self, kind: FaultKind, error: &(dyn std::error::Error + 'static)) {
        self.faults.lock().push((kind, error.to_string()));
    }
}
