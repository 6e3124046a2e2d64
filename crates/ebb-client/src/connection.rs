//! Duplex message connection to the remote node.
//!
//! Uses a command-channel architecture: [`WsConnection`] hands outbound frames
//! to a background writer task over an mpsc channel, and a reader task fans
//! every inbound text frame out to all subscribers. Subscribers observe
//! [`ConnectionEvent::Closed`] exactly once when the transport goes away.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use ebb_core::ClientError;

use crate::config::{ClientConfig, ConnectionConfig};

/// Events observed by a connection subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// An inbound text frame.
    Message(String),
    /// The transport closed, either on request or by the peer.
    Closed,
}

/// An open duplex text-message channel.
pub trait Connection: Send + Sync {
    /// Queue a text frame for sending.
    fn send(&self, text: String) -> Result<(), ClientError>;

    /// Subscribe to inbound frames from now on.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent>;

    /// Ask the transport to close. Completion is signalled by [`ConnectionEvent::Closed`].
    fn close(&self) -> Result<(), ClientError>;

    /// Whether the transport accepts new frames.
    fn is_open(&self) -> bool;
}

/// Fan-out registry of connection subscribers.
#[derive(Debug, Default)]
pub struct Listeners {
    senders: Mutex<Vec<mpsc::UnboundedSender<ConnectionEvent>>>,
    closed: AtomicBool,
}

impl Listeners {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut senders = self.senders.lock();
        if self.closed.load(Ordering::SeqCst) {
            let _ = tx.send(ConnectionEvent::Closed);
        } else {
            senders.push(tx);
        }
        rx
    }

    /// Deliver a frame to every live subscriber, pruning the ones that went away.
    pub fn emit(&self, text: &str) {
        self.senders
            .lock()
            .retain(|tx| tx.send(ConnectionEvent::Message(text.to_string())).is_ok());
    }

    /// Deliver `Closed` once and detach every subscriber.
    pub fn close(&self) {
        let mut senders = self.senders.lock();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for tx in senders.drain(..) {
            let _ = tx.send(ConnectionEvent::Closed);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.senders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Commands sent from [`WsConnection`] to the writer task.
#[derive(Debug)]
enum Command {
    Send(String),
    Close,
}

/// WebSocket transport built on `tokio-tungstenite`.
pub struct WsConnection {
    command_tx: mpsc::UnboundedSender<Command>,
    listeners: Arc<Listeners>,
    open: Arc<AtomicBool>,
    url: String,
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("url", &self.url)
            .field("open", &self.open.load(Ordering::Relaxed))
            .field("subscribers", &self.listeners.len())
            .finish()
    }
}

impl WsConnection {
    /// Open the WebSocket and spawn the reader and writer tasks.
    pub async fn connect(config: &ConnectionConfig) -> Result<Arc<Self>, ClientError> {
        let url = config.url()?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::Transport(format!("failed to connect to {url}: {e}")))?;
        info!(%url, "connected");

        let (mut sink, mut source) = stream.split();
        let (command_tx, mut command_rx) = mpsc::unbounded_channel();
        let listeners = Arc::new(Listeners::default());
        let open = Arc::new(AtomicBool::new(true));

        let writer_open = Arc::clone(&open);
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                match command {
                    Command::Send(text) => {
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            warn!(%e, "websocket send failed");
                            writer_open.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                    Command::Close => {
                        if let Err(e) = sink.close().await {
                            debug!(%e, "websocket close failed");
                        }
                        break;
                    }
                }
            }
        });

        let reader_open = Arc::clone(&open);
        let reader_listeners = Arc::clone(&listeners);
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => reader_listeners.emit(text.as_str()),
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "close frame received");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(%e, "websocket read failed");
                        break;
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            reader_listeners.close();
            info!("connection closed");
        });

        Ok(Arc::new(Self {
            command_tx,
            listeners,
            open,
            url: url.to_string(),
        }))
    }
}

impl Connection for WsConnection {
    fn send(&self, text: String) -> Result<(), ClientError> {
        if !self.is_open() {
            return Err(ClientError::ConnectionNotOpen);
        }
        self.command_tx
            .send(Command::Send(text))
            .map_err(|_| ClientError::ConnectionNotOpen)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        self.listeners.subscribe()
    }

    fn close(&self) -> Result<(), ClientError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(ClientError::ConnectionNotOpen);
        }
        self.command_tx
            .send(Command::Close)
            .map_err(|_| ClientError::ConnectionNotOpen)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.listeners.is_closed()
    }
}

/// Close the connection and wait for the transport to acknowledge it.
pub async fn close_and_wait(connection: &dyn Connection) -> Result<(), ClientError> {
    if !connection.is_open() {
        return Err(ClientError::ConnectionNotOpen);
    }
    let mut events = connection.subscribe();
    connection.close()?;
    while let Some(event) = events.recv().await {
        if event == ConnectionEvent::Closed {
            break;
        }
    }
    Ok(())
}

/// What the clients built on one connection share.
#[derive(Clone)]
pub struct InteractionContext {
    pub connection: Arc<dyn Connection>,
    pub config: ClientConfig,
}

impl std::fmt::Debug for InteractionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractionContext")
            .field("open", &self.connection.is_open())
            .field("config", &self.config)
            .finish()
    }
}

impl InteractionContext {
    pub fn new(connection: Arc<dyn Connection>, config: ClientConfig) -> Self {
        Self { connection, config }
    }

    /// Open a WebSocket to the configured node.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let connection = WsConnection::connect(&config.connection).await?;
        Ok(Self { connection, config })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listeners_fan_out_to_every_subscriber() {
        let listeners = Listeners::default();
        let mut a = listeners.subscribe();
        let mut b = listeners.subscribe();
        listeners.emit("hello");
        assert_eq!(a.try_recv().unwrap(), ConnectionEvent::Message("hello".into()));
        assert_eq!(b.try_recv().unwrap(), ConnectionEvent::Message("hello".into()));
    }

    #[test]
    fn listeners_prune_dropped_subscribers() {
        let listeners = Listeners::default();
        let kept = listeners.subscribe();
        drop(listeners.subscribe());
        assert_eq!(listeners.len(), 2);
        listeners.emit("x");
        assert_eq!(listeners.len(), 1);
        drop(kept);
    }

    #[test]
    fn close_is_delivered_once() {
        let listeners = Listeners::default();
        let mut rx = listeners.subscribe();
        listeners.close();
        listeners.close();
        assert_eq!(rx.try_recv().unwrap(), ConnectionEvent::Closed);
        assert!(rx.try_recv().is_err());
        assert!(listeners.is_empty());
    }

    #[test]
    fn late_subscriber_sees_closed_immediately() {
        let listeners = Listeners::default();
        listeners.close();
        let mut rx = listeners.subscribe();
        assert_eq!(rx.try_recv().unwrap(), ConnectionEvent::Closed);
    }

    #[test]
    fn send_after_writer_gone_is_not_open() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let conn = WsConnection {
            command_tx: tx,
            listeners: Arc::new(Listeners::default()),
            open: Arc::new(AtomicBool::new(true)),
            url: "ws://localhost:1337/".into(),
        };
        assert!(matches!(conn.send("{}".into()), Err(ClientError::ConnectionNotOpen)));
    }

    #[test]
    fn close_twice_fails_the_second_time() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = WsConnection {
            command_tx: tx,
            listeners: Arc::new(Listeners::default()),
            open: Arc::new(AtomicBool::new(true)),
            url: "ws://localhost:1337/".into(),
        };
        conn.close().unwrap();
        assert!(matches!(rx.try_recv().unwrap(), Command::Close));
        assert!(!conn.is_open());
        assert!(matches!(conn.close(), Err(ClientError::ConnectionNotOpen)));
        assert!(matches!(conn.send("{}".into()), Err(ClientError::ConnectionNotOpen)));
    }
}
