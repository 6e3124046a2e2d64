//! Pipelined chain-sync client.
//!
//! The client negotiates an intersection, fills the `RequestNext` window and
//! dispatches every instruction to the consumer's [`ChainSyncHandler`] until
//! it is shut down or the transport closes.
//!
//! ```text
//! Created -> Negotiating -> Syncing -> ShuttingDown -> Closed
//!    ^          |
//!    +----------+  (negotiation failed)
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ebb_core::constants::DEFAULT_IN_FLIGHT;
use ebb_core::{ClientError, Intersection, Point};

use crate::config::ClientConfig;
use crate::connection::{Connection, InteractionContext, close_and_wait};
use crate::dispatcher::{ChainSyncHandler, DispatchMode, InstructionDispatcher};
use crate::fault::{FaultSink, TracingFaultSink};
use crate::intersection::IntersectionNegotiator;
use crate::pipeline::PipelineController;
use crate::query::{QueryClient, QueryOptions};

/// Lifecycle of a [`ChainSyncClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainSyncState {
    Created,
    Negotiating,
    Syncing,
    ShuttingDown,
    Closed,
}

impl std::fmt::Display for ChainSyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Negotiating => write!(f, "negotiating"),
            Self::Syncing => write!(f, "syncing"),
            Self::ShuttingDown => write!(f, "shutting down"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Clone)]
pub struct ChainSyncOptions {
    pub mode: DispatchMode,
    /// Tag `RequestNext` with sequence numbers and restore order from the echoes.
    pub resequence: bool,
    /// Window used when `start_sync` is not given one.
    pub in_flight: usize,
    pub fault_sink: Arc<dyn FaultSink>,
    pub query: QueryOptions,
}

impl Default for ChainSyncOptions {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Sequential,
            resequence: true,
            in_flight: DEFAULT_IN_FLIGHT,
            fault_sink: Arc::new(TracingFaultSink),
            query: QueryOptions::default(),
        }
    }
}

impl std::fmt::Debug for ChainSyncOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainSyncOptions")
            .field("mode", &self.mode)
            .field("resequence", &self.resequence)
            .field("in_flight", &self.in_flight)
            .field("query", &self.query)
            .finish_non_exhaustive()
    }
}

impl ChainSyncOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            mode: if config.sequential {
                DispatchMode::Sequential
            } else {
                DispatchMode::Concurrent
            },
            resequence: config.resequence,
            in_flight: config.in_flight,
            fault_sink: Arc::new(TracingFaultSink),
            query: QueryOptions::from_config(config),
        }
    }

    pub fn with_fault_sink(mut self, fault_sink: Arc<dyn FaultSink>) -> Self {
        self.fault_sink = fault_sink;
        self
    }
}

pub struct ChainSyncClient {
    connection: Arc<dyn Connection>,
    state: Arc<Mutex<ChainSyncState>>,
    negotiator: IntersectionNegotiator,
    pipeline: Arc<PipelineController>,
    dispatcher: Arc<InstructionDispatcher>,
    reader: JoinHandle<()>,
    in_flight: usize,
}

impl std::fmt::Debug for ChainSyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainSyncClient")
            .field("state", &self.state())
            .field("pipeline", &self.pipeline)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl ChainSyncClient {
    /// Attach to `connection` and start listening for instructions.
    /// Must be called from within a Tokio runtime.
    pub fn new(connection: Arc<dyn Connection>, handler: Arc<dyn ChainSyncHandler>, options: ChainSyncOptions) -> Self {
        let query = Arc::new(QueryClient::new(Arc::clone(&connection), options.query.clone()));
        let pipeline = Arc::new(PipelineController::new(Arc::clone(&connection), options.resequence));
        let dispatcher = InstructionDispatcher::new(
            handler,
            Arc::clone(&pipeline),
            options.fault_sink,
            options.mode,
            options.resequence,
        );

        let state = Arc::new(Mutex::new(ChainSyncState::Created));
        let reader = {
            let state = Arc::clone(&state);
            dispatcher.attach(connection.subscribe(), move || {
                let previous = std::mem::replace(&mut *state.lock(), ChainSyncState::Closed);
                if previous != ChainSyncState::Closed {
                    info!(%previous, "transport closed, chain sync closed");
                }
            })
        };

        Self {
            connection,
            state,
            negotiator: IntersectionNegotiator::new(query),
            pipeline,
            dispatcher,
            reader,
            in_flight: options.in_flight,
        }
    }

    /// Build a client from a shared context, taking options from its config.
    pub fn from_context(context: &InteractionContext, handler: Arc<dyn ChainSyncHandler>) -> Self {
        Self::new(
            Arc::clone(&context.connection),
            handler,
            ChainSyncOptions::from_config(&context.config),
        )
    }

    /// Negotiate an intersection and start the pipeline.
    ///
    /// `points` defaults to the remote's current tip and `in_flight` to the
    /// configured window. Only valid once, from [`ChainSyncState::Created`];
    /// a failed negotiation leaves the client there so it can be retried.
    pub async fn start_sync(&self, points: Option<Vec<Point>>, in_flight: Option<usize>) -> Result<Intersection, ClientError> {
        let window = in_flight.unwrap_or(self.in_flight);
        {
            let mut state = self.state.lock();
            match *state {
                ChainSyncState::Created => {}
                ChainSyncState::ShuttingDown | ChainSyncState::Closed => return Err(ClientError::ConnectionNotOpen),
                ChainSyncState::Negotiating | ChainSyncState::Syncing => return Err(ClientError::AlreadySyncing),
            }
            if window == 0 {
                return Err(ClientError::InvalidWindow(window));
            }
            *state = ChainSyncState::Negotiating;
        }
        debug!(window, "negotiating intersection");

        let intersection = match self.negotiator.find_intersection(points.unwrap_or_default()).await {
            Ok(intersection) => intersection,
            Err(e) => {
                self.transition(ChainSyncState::Negotiating, ChainSyncState::Created);
                return Err(e);
            }
        };

        if !self.connection.is_open() {
            self.transition(ChainSyncState::Negotiating, ChainSyncState::Closed);
            return Err(ClientError::ConnectionNotOpen);
        }
        if let Err(e) = self.pipeline.start(window) {
            self.transition(ChainSyncState::Negotiating, ChainSyncState::Created);
            return Err(e);
        }
        if !self.transition(ChainSyncState::Negotiating, ChainSyncState::Syncing) {
            // Closed or shut down while the window was being filled.
            self.pipeline.stop();
            return Err(ClientError::ConnectionNotOpen);
        }
        info!(point = %intersection.point, tip = %intersection.tip, window, "chain sync started");
        Ok(intersection)
    }

    /// Stop the pipeline, let the running handler finish and close the transport.
    ///
    /// Unanswered requests are abandoned. Fails with
    /// [`ClientError::ConnectionNotOpen`] if the transport is already closed.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        if !self.connection.is_open() {
            return Err(ClientError::ConnectionNotOpen);
        }
        {
            let mut state = self.state.lock();
            if matches!(*state, ChainSyncState::ShuttingDown | ChainSyncState::Closed) {
                return Err(ClientError::ConnectionNotOpen);
            }
            *state = ChainSyncState::ShuttingDown;
        }
        info!(outstanding = self.pipeline.outstanding(), "shutting down chain sync");

        self.pipeline.stop();
        self.dispatcher.halt();
        self.dispatcher.wait_idle().await;

        let result = match close_and_wait(self.connection.as_ref()).await {
            Err(ClientError::ConnectionNotOpen) => {
                warn!("transport closed during shutdown");
                Ok(())
            }
            other => other,
        };
        *self.state.lock() = ChainSyncState::Closed;
        info!("chain sync closed");
        result
    }

    pub fn state(&self) -> ChainSyncState {
        *self.state.lock()
    }

    /// `RequestNext` messages sent but not yet answered.
    pub fn outstanding(&self) -> usize {
        self.pipeline.outstanding()
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    fn transition(&self, from: ChainSyncState, to: ChainSyncState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        *state = to;
        true
    }
}

impl Drop for ChainSyncClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.dispatcher.halt();
        self.pipeline.stop();
    }
}
