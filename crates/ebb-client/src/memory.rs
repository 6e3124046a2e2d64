//! In-memory [`Connection`] for tests, behind the `test-util` feature.
//!
//! Records every outbound frame and lets the caller play the remote side:
//! deliver arbitrary inbound frames, close from the peer, or install a
//! responder that answers requests as they are sent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use ebb_core::{ClientError, Request, Response};

use crate::connection::{Connection, ConnectionEvent, Listeners};

/// Produces the frames the remote sends back for a request.
pub type Responder = Box<dyn Fn(&Request) -> Vec<Response> + Send + Sync>;

pub struct MemoryConnection {
    listeners: Listeners,
    open: AtomicBool,
    sent: Mutex<Vec<String>>,
    sent_count: watch::Sender<usize>,
    responder: Mutex<Option<Responder>>,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("open", &self.is_open())
            .field("sent", &self.sent.lock().len())
            .finish()
    }
}

impl MemoryConnection {
    pub fn new() -> Arc<Self> {
        let (sent_count, _) = watch::channel(0);
        Arc::new(Self {
            listeners: Listeners::default(),
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            sent_count,
            responder: Mutex::new(None),
        })
    }

    pub fn with_responder<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&Request) -> Vec<Response> + Send + Sync + 'static,
    {
        let conn = Self::new();
        conn.set_responder(responder);
        conn
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&Request) -> Vec<Response> + Send + Sync + 'static,
    {
        *self.responder.lock() = Some(Box::new(responder));
    }

    /// Deliver a response frame as if the remote sent it.
    pub fn deliver(&self, response: &Response) {
        if let Ok(text) = response.to_json() {
            self.listeners.emit(&text);
        }
    }

    /// Deliver a raw text frame as if the remote sent it.
    pub fn deliver_raw(&self, text: &str) {
        self.listeners.emit(text);
    }

    /// Simulate the peer dropping the connection.
    pub fn close_from_peer(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.listeners.close();
    }

    /// Every frame sent so far, in send order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Every sent frame that decodes as a request envelope.
    pub fn sent_requests(&self) -> Vec<Request> {
        self.sent
            .lock()
            .iter()
            .filter_map(|text| Request::parse(text).ok())
            .collect()
    }

    /// Number of sent requests for `method`.
    pub fn count_sent(&self, method: &str) -> usize {
        self.sent_requests()
            .iter()
            .filter(|request| request.methodname == method)
            .count()
    }

    /// Wait until at least `n` requests for `method` have been sent.
    pub async fn wait_for_sent(&self, method: &str, n: usize) {
        let mut changes = self.sent_count.subscribe();
        while self.count_sent(method) < n {
            if changes.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Connection for MemoryConnection {
    fn send(&self, text: String) -> Result<(), ClientError> {
        if !self.is_open() {
            return Err(ClientError::ConnectionNotOpen);
        }
        let request = Request::parse(&text).ok();
        let count = {
            let mut sent = self.sent.lock();
            sent.push(text);
            sent.len()
        };
        self.sent_count.send_replace(count);

        if let (Some(request), Some(responder)) = (request, self.responder.lock().as_ref()) {
            for response in responder(&request) {
                self.deliver(&response);
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        self.listeners.subscribe()
    }

    fn close(&self) -> Result<(), ClientError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(ClientError::ConnectionNotOpen);
        }
        self.listeners.close();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
