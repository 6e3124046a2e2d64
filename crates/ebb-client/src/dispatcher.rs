//! Routing of `RequestNext` answers to the consumer's handler.
//!
//! Inbound frames are filtered by method name, optionally put back into send
//! order using the echoed sequence numbers, classified into an
//! [`Instruction`] and handed to the handler. In sequential mode a single
//! worker drains a FIFO queue so handler N+1 starts only after handler N's
//! future resolved and its [`RequestNext`] token was released; in concurrent
//! mode every instruction gets its own task. A panicking handler is reported
//! like a failing one and dispatch carries on.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use ebb_core::constants::methods;
use ebb_core::{ClientError, HandlerError, Instruction, Response, RollBackward, RollForward};
use serde_json::Value;

use crate::connection::ConnectionEvent;
use crate::fault::{FaultKind, FaultSink};
use crate::pipeline::{PipelineController, RequestNext};

/// Consumer callbacks for chain-sync instructions.
///
/// Each call receives a [`RequestNext`] token; calling it asks for one more
/// instruction. Holding on to it defers replenishment. In
/// [`DispatchMode::Sequential`] the next handler call also waits for the
/// token, so a consumer that acknowledges only once a batch is flushed must
/// use [`DispatchMode::Concurrent`].
#[async_trait]
pub trait ChainSyncHandler: Send + Sync + 'static {
    async fn roll_backward(&self, event: RollBackward, next: RequestNext) -> Result<(), HandlerError>;

    async fn roll_forward(&self, event: RollForward, next: RequestNext) -> Result<(), HandlerError>;
}

/// How handler invocations are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// One at a time, in arrival order. Handler N+1 waits for handler N's
    /// acknowledgment.
    #[default]
    Sequential,
    /// Immediately on arrival, no ordering between completions.
    Concurrent,
}

/// Restores `RequestNext` send order from echoed sequence numbers.
///
/// Answers without a sequence pass straight through.
#[derive(Debug, Default)]
pub struct Resequencer {
    next: u64,
    parked: BTreeMap<u64, Response>,
}

impl Resequencer {
    /// Accept one answer and return every answer now releasable, in order.
    pub fn push(&mut self, response: Response) -> Vec<Response> {
        let Some(sequence) = response.sequence() else {
            return vec![response];
        };
        if sequence < self.next {
            warn!(sequence, expected = self.next, "dropping stale RequestNext answer");
            return Vec::new();
        }
        self.parked.insert(sequence, response);

        let mut ready = Vec::new();
        while let Some(response) = self.parked.remove(&self.next) {
            ready.push(response);
            self.next += 1;
        }
        if !self.parked.is_empty() {
            debug!(parked = self.parked.len(), expected = self.next, "holding out-of-order answers");
        }
        ready
    }

    pub fn parked(&self) -> usize {
        self.parked.len()
    }
}

pub struct InstructionDispatcher {
    handler: Arc<dyn ChainSyncHandler>,
    pipeline: Arc<PipelineController>,
    fault_sink: Arc<dyn FaultSink>,
    mode: DispatchMode,
    resequencer: Option<Mutex<Resequencer>>,
    queue: Mutex<Option<mpsc::UnboundedSender<Instruction>>>,
    halted: AtomicBool,
    halt_signal: watch::Sender<bool>,
    /// Held for the duration of each sequential handler call.
    gate: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for InstructionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstructionDispatcher")
            .field("mode", &self.mode)
            .field("resequence", &self.resequencer.is_some())
            .field("halted", &self.is_halted())
            .finish()
    }
}

impl InstructionDispatcher {
    /// Create the dispatcher and, in sequential mode, its worker task.
    /// Must be called from within a Tokio runtime.
    pub fn new(
        handler: Arc<dyn ChainSyncHandler>,
        pipeline: Arc<PipelineController>,
        fault_sink: Arc<dyn FaultSink>,
        mode: DispatchMode,
        resequence: bool,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let sequential = mode == DispatchMode::Sequential;
        let dispatcher = Arc::new(Self {
            handler,
            pipeline,
            fault_sink,
            mode,
            resequencer: resequence.then(|| Mutex::new(Resequencer::default())),
            queue: Mutex::new(sequential.then_some(queue_tx)),
            halted: AtomicBool::new(false),
            halt_signal: watch::channel(false).0,
            gate: tokio::sync::Mutex::new(()),
        });
        if sequential {
            tokio::spawn(Arc::clone(&dispatcher).run_sequential(queue_rx));
        }
        dispatcher
    }

    /// Consume connection events until the transport closes, then halt and run `on_closed`.
    pub fn attach<F>(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>, on_closed: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(ConnectionEvent::Message(text)) = events.recv().await {
                dispatcher.on_message(&text);
            }
            dispatcher.halt();
            dispatcher.pipeline.stop();
            on_closed();
        })
    }

    /// Handle one inbound frame. Frames for other methods are ignored.
    pub fn on_message(&self, text: &str) {
        let response = match Response::parse(text) {
            Ok(response) => response,
            Err(e) if method_name(text).as_deref() == Some(methods::REQUEST_NEXT) => {
                self.fault_sink.report(FaultKind::Message, &e);
                return;
            }
            Err(e) => {
                debug!(error = %e, "ignoring frame that is not a RequestNext answer");
                return;
            }
        };
        if response.methodname != methods::REQUEST_NEXT {
            return;
        }
        self.pipeline.on_response();

        let ready = match &self.resequencer {
            Some(resequencer) => resequencer.lock().push(response),
            None => vec![response],
        };
        for response in ready {
            self.accept(response);
        }
    }

    fn accept(&self, response: Response) {
        let instruction = match response.into_result().and_then(Instruction::from_result) {
            Ok(instruction) => instruction,
            Err(e) => {
                self.fault_sink.report(FaultKind::Message, &e);
                return;
            }
        };
        debug!(instruction = instruction.name(), tip = %instruction.tip(), "instruction received");

        if self.is_halted() {
            debug!(instruction = instruction.name(), "dispatcher halted, dropping instruction");
            return;
        }
        match self.mode {
            DispatchMode::Sequential => {
                if let Some(queue) = self.queue.lock().as_ref() {
                    let _ = queue.send(instruction);
                }
            }
            DispatchMode::Concurrent => {
                let (invocation, _released) = self.invocation(instruction);
                tokio::spawn(invocation);
            }
        }
    }

    fn invocation(&self, instruction: Instruction) -> (BoxFuture<'static, ()>, oneshot::Receiver<()>) {
        let handler = Arc::clone(&self.handler);
        let (next, released) = RequestNext::new(Arc::clone(&self.pipeline), Arc::clone(&self.fault_sink));
        let fault_sink = Arc::clone(&self.fault_sink);
        let invocation = async move {
            let call = match instruction {
                Instruction::RollBackward(event) => handler.roll_backward(event, next),
                Instruction::RollForward(event) => handler.roll_forward(event, next),
            };
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => fault_sink.report(FaultKind::Handler, &*error),
                Err(panic) => {
                    let error = ClientError::HandlerPanicked(panic_message(&*panic));
                    fault_sink.report(FaultKind::Handler, &error);
                }
            }
        }
        .boxed();
        (invocation, released)
    }

    async fn run_sequential(self: Arc<Self>, mut queue: mpsc::UnboundedReceiver<Instruction>) {
        let mut halted = self.halt_signal.subscribe();
        while let Some(instruction) = queue.recv().await {
            let _gate = self.gate.lock().await;
            if self.is_halted() {
                continue;
            }
            let (invocation, released) = self.invocation(instruction);
            invocation.await;
            // A handler may keep its token past its own return; halting stops the wait.
            tokio::select! {
                _ = released => {}
                _ = until_halted(&mut halted) => {}
            }
        }
        debug!("sequential dispatch worker finished");
    }

    /// Stop admitting instructions. Queued ones are dropped; a running handler finishes.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.halt_signal.send_replace(true);
        self.queue.lock().take();
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Wait for the sequential handler currently running, if any, and for its token.
    pub async fn wait_idle(&self) {
        let _gate = self.gate.lock().await;
    }
}

fn method_name(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value.get("methodname")?.as_str().map(str::to_owned)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn until_halted(signal: &mut watch::Receiver<bool>) {
    while !*signal.borrow_and_update() {
        if signal.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::TracingFaultSink;
    use crate::memory::MemoryConnection;
    use ebb_core::{Point, Tip};
    use serde_json::json;

    struct Counting {
        seen: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl ChainSyncHandler for Counting {
        async fn roll_backward(&self, _event: RollBackward, next: RequestNext) -> Result<(), HandlerError> {
            self.seen.lock().push("backward");
            next.request_next();
            Ok(())
        }

        async fn roll_forward(&self, _event: RollForward, next: RequestNext) -> Result<(), HandlerError> {
            self.seen.lock().push("forward");
            next.request_next();
            Ok(())
        }
    }

    fn answer(result: serde_json::Value, sequence: Option<u64>) -> Response {
        Response::success(methods::REQUEST_NEXT, result).with_reflection(sequence.map(|s| json!({ "sequence": s })))
    }

    fn backward() -> serde_json::Value {
        json!({ "RollBackward": { "point": Point::Origin, "tip": Tip::Origin } })
    }

    #[test]
    fn resequencer_restores_send_order() {
        let mut resequencer = Resequencer::default();
        assert!(resequencer.push(answer(backward(), Some(1))).is_empty());
        assert!(resequencer.push(answer(backward(), Some(2))).is_empty());
        assert_eq!(resequencer.parked(), 2);

        let released: Vec<_> = resequencer
            .push(answer(backward(), Some(0)))
            .iter()
            .map(|r| r.sequence())
            .collect();
        assert_eq!(released, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(resequencer.parked(), 0);
    }

    #[test]
    fn resequencer_passes_unsequenced_answers_and_drops_stale_ones() {
        let mut resequencer = Resequencer::default();
        assert_eq!(resequencer.push(answer(backward(), None)).len(), 1);
        assert_eq!(resequencer.push(answer(backward(), Some(0))).len(), 1);
        assert!(resequencer.push(answer(backward(), Some(0))).is_empty());
    }

    #[tokio::test]
    async fn ignores_other_methods() {
        let conn = MemoryConnection::new();
        let pipeline = Arc::new(PipelineController::new(conn.clone(), false));
        let handler = Arc::new(Counting { seen: Mutex::new(Vec::new()) });
        let dispatcher = InstructionDispatcher::new(
            handler.clone(),
            pipeline,
            Arc::new(TracingFaultSink),
            DispatchMode::Sequential,
            false,
        );
        dispatcher.on_message(&Response::success(methods::QUERY, json!(1)).to_json().unwrap());
        dispatcher.wait_idle().await;
        tokio::task::yield_now().await;
        assert!(handler.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn halted_dispatcher_drops_instructions() {
        let conn = MemoryConnection::new();
        let pipeline = Arc::new(PipelineController::new(conn.clone(), false));
        let handler = Arc::new(Counting { seen: Mutex::new(Vec::new()) });
        let dispatcher = InstructionDispatcher::new(
            handler.clone(),
            pipeline,
            Arc::new(TracingFaultSink),
            DispatchMode::Sequential,
            false,
        );
        dispatcher.halt();
        dispatcher.on_message(&answer(backward(), None).to_json().unwrap());
        tokio::task::yield_now().await;
        assert!(handler.seen.lock().is_empty());
        assert!(dispatcher.is_halted());
    }
}
