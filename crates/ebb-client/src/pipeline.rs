//! Sliding-window pipelining of `RequestNext`.
//!
//! The controller keeps `window` requests in flight: it sends the whole
//! window on start and one replacement per consumed instruction. The
//! counter tracks requests sent but not yet answered and never exceeds the
//! window as long as every answer yields at most one replenishment.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tokio::sync::oneshot;
use tracing::{debug, info};

use ebb_core::constants::methods;
use ebb_core::protocol::sequence_mirror;
use ebb_core::{ClientError, Request};

use crate::connection::Connection;
use crate::fault::{FaultKind, FaultSink};

pub struct PipelineController {
    connection: Arc<dyn Connection>,
    window: AtomicUsize,
    outstanding: AtomicUsize,
    running: AtomicBool,
    next_sequence: AtomicU64,
    /// Tag each request with a sequence number in its mirror.
    sequenced: bool,
}

impl std::fmt::Debug for PipelineController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineController")
            .field("window", &self.window())
            .field("outstanding", &self.outstanding())
            .field("running", &self.is_running())
            .finish()
    }
}

impl PipelineController {
    pub fn new(connection: Arc<dyn Connection>, sequenced: bool) -> Self {
        Self {
            connection,
            window: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            next_sequence: AtomicU64::new(0),
            sequenced,
        }
    }

    /// Fill the window: send `window_size` requests without waiting for answers.
    pub fn start(&self, window_size: usize) -> Result<(), ClientError> {
        if window_size == 0 {
            return Err(ClientError::InvalidWindow(window_size));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadySyncing);
        }
        self.window.store(window_size, Ordering::SeqCst);
        for _ in 0..window_size {
            if let Err(e) = self.send_next() {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }
        info!(window_size, "pipeline started");
        Ok(())
    }

    /// Record that a `RequestNext` answer arrived. Late answers after stop are fine.
    pub fn on_response(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }

    /// Replenish the window by one. No-op once stopped.
    pub fn on_instruction_consumed(&self) -> Result<(), ClientError> {
        if !self.is_running() {
            debug!("pipeline stopped, not replenishing");
            return Ok(());
        }
        self.send_next()
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(outstanding = self.outstanding(), "pipeline stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn window(&self) -> usize {
        self.window.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    fn send_next(&self) -> Result<(), ClientError> {
        let mut request = Request::new(methods::REQUEST_NEXT);
        if self.sequenced {
            let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
            request = request.with_mirror(sequence_mirror(sequence));
        }
        let text = request.to_json()?;
        // Count before sending: the answer may be routed before `send` returns.
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.connection.send(text) {
            self.on_response();
            return Err(e);
        }
        Ok(())
    }
}

/// Acknowledgment handed to a handler with each instruction.
///
/// Calling [`RequestNext::request_next`] replenishes the pipeline by exactly
/// one request. Dropping it without calling withholds the replenishment.
/// Either way the token is released, which is what sequential dispatch waits
/// for before starting the next handler.
pub struct RequestNext {
    pipeline: Arc<PipelineController>,
    fault_sink: Arc<dyn FaultSink>,
    released: Option<oneshot::Sender<()>>,
}

impl std::fmt::Debug for RequestNext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestNext").finish_non_exhaustive()
    }
}

impl RequestNext {
    pub(crate) fn new(pipeline: Arc<PipelineController>, fault_sink: Arc<dyn FaultSink>) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let token = Self {
            pipeline,
            fault_sink,
            released: Some(tx),
        };
        (token, rx)
    }

    pub fn request_next(mut self) {
        if let Err(e) = self.pipeline.on_instruction_consumed() {
            self.fault_sink.report(FaultKind::Replenish, &e);
        }
        self.release();
    }

    fn release(&mut self) {
        if let Some(tx) = self.released.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for RequestNext {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnection;
    use serde_json::json;

    #[test]
    fn start_fills_the_window() {
        let conn = MemoryConnection::new();
        let pipeline = PipelineController::new(conn.clone(), false);
        pipeline.start(7).unwrap();
        assert_eq!(conn.count_sent(methods::REQUEST_NEXT), 7);
        assert_eq!(pipeline.outstanding(), 7);
        assert_eq!(pipeline.window(), 7);
    }

    #[test]
    fn zero_window_is_rejected() {
        let conn = MemoryConnection::new();
        let pipeline = PipelineController::new(conn.clone(), false);
        assert!(matches!(pipeline.start(0), Err(ClientError::InvalidWindow(0))));
        assert!(!pipeline.is_running());
        assert!(conn.sent().is_empty());
    }

    #[test]
    fn second_start_is_rejected() {
        let conn = MemoryConnection::new();
        let pipeline = PipelineController::new(conn.clone(), false);
        pipeline.start(2).unwrap();
        assert!(matches!(pipeline.start(2), Err(ClientError::AlreadySyncing)));
        assert_eq!(conn.count_sent(methods::REQUEST_NEXT), 2);
    }

    #[test]
    fn consume_replenishes_by_one() {
        let conn = MemoryConnection::new();
        let pipeline = PipelineController::new(conn.clone(), false);
        pipeline.start(3).unwrap();
        pipeline.on_response();
        assert_eq!(pipeline.outstanding(), 2);
        pipeline.on_instruction_consumed().unwrap();
        assert_eq!(pipeline.outstanding(), 3);
        assert_eq!(conn.count_sent(methods::REQUEST_NEXT), 4);
    }

    #[test]
    fn stop_ceases_replenishment_and_tolerates_late_answers() {
        let conn = MemoryConnection::new();
        let pipeline = PipelineController::new(conn.clone(), false);
        pipeline.start(2).unwrap();
        pipeline.stop();
        for _ in 0..5 {
            pipeline.on_response();
        }
        pipeline.on_instruction_consumed().unwrap();
        assert_eq!(pipeline.outstanding(), 0);
        assert_eq!(conn.count_sent(methods::REQUEST_NEXT), 2);
    }

    #[test]
    fn sequenced_requests_carry_increasing_numbers() {
        let conn = MemoryConnection::new();
        let pipeline = PipelineController::new(conn.clone(), true);
        pipeline.start(3).unwrap();
        let mirrors: Vec<_> = conn.sent_requests().into_iter().map(|r| r.mirror).collect();
        assert_eq!(
            mirrors,
            vec![
                Some(json!({ "sequence": 0 })),
                Some(json!({ "sequence": 1 })),
                Some(json!({ "sequence": 2 })),
            ]
        );
    }

    #[test]
    fn send_failure_leaves_counter_untouched() {
        let conn = MemoryConnection::new();
        let pipeline = PipelineController::new(conn.clone(), false);
        pipeline.start(1).unwrap();
        conn.close_from_peer();
        assert!(matches!(
            pipeline.on_instruction_consumed(),
            Err(ClientError::ConnectionNotOpen)
        ));
        assert_eq!(pipeline.outstanding(), 1);
    }

    #[tokio::test]
    async fn token_is_released_on_call_or_drop() {
        let conn = MemoryConnection::new();
        let pipeline = Arc::new(PipelineController::new(conn.clone(), false));
        pipeline.start(1).unwrap();
        let sink: Arc<dyn FaultSink> = Arc::new(crate::fault::TracingFaultSink);

        let (token, released) = RequestNext::new(Arc::clone(&pipeline), Arc::clone(&sink));
        token.request_next();
        released.await.unwrap();
        assert_eq!(conn.count_sent(methods::REQUEST_NEXT), 2);

        let (token, released) = RequestNext::new(Arc::clone(&pipeline), sink);
        drop(token);
        released.await.unwrap();
        assert_eq!(conn.count_sent(methods::REQUEST_NEXT), 2);
    }
}
