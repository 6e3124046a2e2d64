//! One-shot request/response correlation.
//!
//! Each request carries a generated id in its `mirror`; a router task matches
//! inbound frames by the echoed `reflection.requestId` and completes the
//! single waiting future. Entries leave the pending map on first match, on
//! timeout, on send failure, or when the transport closes.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use ebb_core::constants::{DEFAULT_REQUEST_TIMEOUT_SECS, REQUEST_ID_LEN, methods};
use ebb_core::protocol::request_id_mirror;
use ebb_core::{ClientError, Request, Response, Tip};

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionEvent};

type Pending = DashMap<String, oneshot::Sender<Response>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    /// How long to wait for the matching response; `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)),
        }
    }
}

impl QueryOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            timeout: config.request_timeout(),
        }
    }
}

/// Client for single outstanding request/response exchanges.
pub struct QueryClient {
    connection: Arc<dyn Connection>,
    pending: Arc<Pending>,
    options: QueryOptions,
    router: JoinHandle<()>,
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("pending", &self.pending.len())
            .field("options", &self.options)
            .finish()
    }
}

impl QueryClient {
    /// Attach to `connection`. Must be called from within a Tokio runtime.
    pub fn new(connection: Arc<dyn Connection>, options: QueryOptions) -> Self {
        let pending = Arc::new(Pending::new());
        let router = tokio::spawn(route_responses(connection.subscribe(), Arc::clone(&pending)));
        Self {
            connection,
            pending,
            options,
            router,
        }
    }

    /// Send `method` with `args` and wait for the response carrying the same request id.
    pub async fn request(&self, method: &str, args: Option<Value>) -> Result<Response, ClientError> {
        if !self.connection.is_open() {
            return Err(ClientError::ConnectionNotOpen);
        }

        let (tx, rx) = oneshot::channel();
        let id = loop {
            let candidate = generate_request_id();
            if let Entry::Vacant(slot) = self.pending.entry(candidate.clone()) {
                slot.insert(tx);
                break candidate;
            }
        };

        let mut request = Request::new(method).with_mirror(request_id_mirror(&id));
        if let Some(args) = args {
            request = request.with_args(args);
        }
        debug!(method, request_id = %id, "sending request");

        if let Err(e) = request.to_json().and_then(|text| self.connection.send(text)) {
            self.pending.remove(&id);
            return Err(e);
        }

        let outcome = match self.options.timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.remove(&id);
                    warn!(method, request_id = %id, "request timed out");
                    return Err(ClientError::Timeout);
                }
            },
            None => rx.await,
        };
        let response = outcome.map_err(|_| ClientError::ConnectionNotOpen)?;
        debug!(method, request_id = %id, fault = response.is_fault(), "response received");
        Ok(response)
    }

    /// The remote node's current tip.
    pub async fn current_tip(&self) -> Result<Tip, ClientError> {
        let response = self
            .request(methods::QUERY, Some(json!({ "query": "chainTip" })))
            .await?;
        let result = response.into_result()?;
        serde_json::from_value(result.clone())
            .map_err(|_| ClientError::Protocol(format!("unexpected chainTip result: {result}")))
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Number of requests still waiting for a response.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for QueryClient {
    fn drop(&mut self) {
        self.router.abort();
    }
}

fn generate_request_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REQUEST_ID_LEN)
        .map(char::from)
        .collect()
}

async fn route_responses(mut events: mpsc::UnboundedReceiver<ConnectionEvent>, pending: Arc<Pending>) {
    while let Some(ConnectionEvent::Message(text)) = events.recv().await {
        let Ok(response) = Response::parse(&text) else {
            continue;
        };
        let Some(id) = response.request_id().map(str::to_owned) else {
            continue;
        };
        match pending.remove(&id) {
            Some((_, waiter)) => {
                let _ = waiter.send(response);
            }
            None => debug!(request_id = %id, "no pending request for response"),
        }
    }
    // Dropping the senders fails every waiter with ConnectionNotOpen.
    pending.clear();
}
