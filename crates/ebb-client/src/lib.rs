//! # ebb-client — pipelined chain-sync over a JSON-WSP WebSocket bridge.
//!
//! [`ChainSyncClient`] negotiates an intersection with the remote node, keeps
//! a window of `RequestNext` requests in flight and hands every
//! `RollForward`/`RollBackward` instruction to a [`ChainSyncHandler`].
//! [`QueryClient`] and [`TxSubmissionClient`] share the same connection for
//! one-shot exchanges.
//!
//! Transports implement [`Connection`]; [`WsConnection`] talks to a real
//! node. With the `test-util` feature, `MemoryConnection` plays the remote
//! side in tests.

pub mod chain_sync;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod fault;
pub mod intersection;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod pipeline;
pub mod query;
pub mod tx_submission;

pub use chain_sync::{ChainSyncClient, ChainSyncOptions, ChainSyncState};
pub use config::{ClientConfig, ConnectionConfig};
pub use connection::{Connection, ConnectionEvent, InteractionContext, WsConnection, close_and_wait};
pub use dispatcher::{ChainSyncHandler, DispatchMode, InstructionDispatcher, Resequencer};
pub use fault::{FaultKind, FaultSink, TracingFaultSink};
pub use intersection::IntersectionNegotiator;
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryConnection;
pub use pipeline::{PipelineController, RequestNext};
pub use query::{QueryClient, QueryOptions};
pub use tx_submission::TxSubmissionClient;
