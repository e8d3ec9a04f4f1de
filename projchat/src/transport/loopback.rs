//! Loopback transport for testing.
//!
//! Uses in-process [`tokio::sync::mpsc`] channels carrying encoded JSON
//! frames, so the codec is exercised exactly as over a real socket. Every
//! [`LoopbackConnector::open`] hands the server end of the new connection to
//! the paired [`LoopbackListener`], which plays the chat server in tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};

use projchat_proto::codec;
use projchat_proto::event::{ClientEvent, ServerEvent};

use super::{Connector, Transport, TransportError};

/// Client end of an in-process connection.
pub struct LoopbackTransport {
    /// Outgoing frames; taken on close so the server end observes EOF.
    tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<String>>>,
    /// Incoming frames from the server end.
    rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl Transport for LoopbackTransport {
    async fn send(&self, event: &ClientEvent) -> Result<(), TransportError> {
        let text = codec::encode_client(event)?;
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => tx.send(text).map_err(|_| TransportError::ConnectionClosed),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    async fn recv(&self) -> Result<ServerEvent, TransportError> {
        let mut rx = self.rx.lock().await;
        let text = rx.recv().await.ok_or(TransportError::ConnectionClosed)?;
        Ok(codec::decode_server(&text)?)
    }

    async fn close(&self) {
        self.tx.lock().take();
    }

    fn is_connected(&self) -> bool {
        self.tx.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

/// Server end of an in-process connection.
///
/// Dropping it simulates the server closing the connection.
pub struct LoopbackServer {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl LoopbackServer {
    /// Receive the next client event, or `None` once the client closed.
    ///
    /// Frames that fail to decode are skipped.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        while let Some(text) = self.from_client.recv().await {
            match codec::decode_client(&text) {
                Ok(event) => return Some(event),
                Err(e) => tracing::warn!(err = %e, "loopback server skipping bad frame"),
            }
        }
        None
    }

    /// Send an event to the client. Returns `false` if the client is gone.
    pub fn send(&self, event: &ServerEvent) -> bool {
        codec::encode_server(event).is_ok_and(|text| self.to_client.send(text).is_ok())
    }

    /// Send an arbitrary text frame, e.g. to simulate a malformed event.
    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.to_client.send(text.into()).is_ok()
    }
}

/// Accepts the server ends of connections opened by a [`LoopbackConnector`].
pub struct LoopbackListener {
    accepted: mpsc::UnboundedReceiver<LoopbackServer>,
    reachable: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl LoopbackListener {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<LoopbackServer> {
        self.accepted.recv().await
    }

    /// Return an already pending connection without waiting.
    pub fn try_accept(&mut self) -> Option<LoopbackServer> {
        self.accepted.try_recv().ok()
    }

    /// When `false`, every `open` fails with [`TransportError::Unreachable`].
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of `open` calls made so far, successful or not.
    #[must_use]
    pub fn open_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

/// [`Connector`] producing [`LoopbackTransport`]s.
pub struct LoopbackConnector {
    accept_tx: mpsc::UnboundedSender<LoopbackServer>,
    reachable: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl LoopbackConnector {
    /// Create a connector and the listener receiving its connections.
    #[must_use]
    pub fn new() -> (Self, LoopbackListener) {
        let (accept_tx, accepted) = mpsc::unbounded_channel();
        let reachable = Arc::new(AtomicBool::new(true));
        let attempts = Arc::new(AtomicUsize::new(0));
        let connector = Self {
            accept_tx,
            reachable: Arc::clone(&reachable),
            attempts: Arc::clone(&attempts),
        };
        let listener = LoopbackListener {
            accepted,
            reachable,
            attempts,
        };
        (connector, listener)
    }
}

impl Connector for LoopbackConnector {
    type Conn = LoopbackTransport;

    async fn open(&self) -> Result<LoopbackTransport, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable("loopback".into()));
        }

        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        let server = LoopbackServer {
            to_client: server_tx,
            from_client: server_rx,
        };
        self.accept_tx
            .send(server)
            .map_err(|_| TransportError::Unreachable("loopback".into()))?;

        Ok(LoopbackTransport {
            tx: parking_lot::Mutex::new(Some(client_tx)),
            rx: Mutex::new(client_rx),
        })
    }
}
