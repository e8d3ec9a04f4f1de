//! WebSocket transport to the chat server.
//!
//! Implements [`Transport`] over a `tokio-tungstenite` connection. Channel
//! events travel as JSON text frames. A background reader task decodes
//! inbound frames into a queue so that [`Transport::recv`] is cancel-safe.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use projchat_proto::codec::{self, CodecError};
use projchat_proto::event::{ClientEvent, ServerEvent};

use super::{Connector, Transport, TransportError};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for opening the WebSocket connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the decoded inbound event queue.
const INBOUND_BUFFER: usize = 256;

/// Opens [`WsTransport`]s to a fixed server URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    connect_timeout: Duration,
}

impl WsConnector {
    /// Create a connector for `url` (`ws://` or `wss://`).
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }

    /// The server URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    type Conn = WsTransport;

    async fn open(&self) -> Result<WsTransport, TransportError> {
        WsTransport::connect(&self.url, self.connect_timeout).await
    }
}

/// WebSocket transport implementing the [`Transport`] trait.
pub struct WsTransport {
    /// Write half of the WebSocket connection.
    ws_sender: Mutex<WsSender>,
    /// Decoded frames produced by the background reader task.
    incoming: Mutex<mpsc::Receiver<Result<ServerEvent, CodecError>>>,
    /// Whether the connection is still open.
    connected: Arc<AtomicBool>,
    /// Background reader; aborted on drop.
    reader_handle: tokio::task::JoinHandle<()>,
}

impl WsTransport {
    /// Open a WebSocket connection to `url`.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if the connection is not established in time.
    /// - [`TransportError::Unreachable`] if the server refuses the connection.
    /// - [`TransportError::Io`] for TLS, HTTP upgrade and other failures.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let (ws_stream, _response) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| {
                tracing::warn!(url, "WebSocket connect timed out");
                TransportError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url, err = %e, "WebSocket connect failed");
                map_ws_connect_error(url, e)
            })?;

        let (ws_sender, ws_reader) = ws_stream.split();
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(reader_loop(ws_reader, tx, Arc::clone(&connected)));

        tracing::debug!(url, "WebSocket connection open");
        Ok(Self {
            ws_sender: Mutex::new(ws_sender),
            incoming: Mutex::new(rx),
            connected,
            reader_handle,
        })
    }
}

impl Transport for WsTransport {
    async fn send(&self, event: &ClientEvent) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }
        let text = codec::encode_client(event)?;
        let mut sender = self.ws_sender.lock().await;
        sender.send(WsMessage::Text(text.into())).await.map_err(|e| {
            tracing::warn!(err = %e, event = event.name(), "WebSocket send failed");
            self.connected.store(false, Ordering::Relaxed);
            TransportError::ConnectionClosed
        })
    }

    async fn recv(&self) -> Result<ServerEvent, TransportError> {
        let mut rx = self.incoming.lock().await;
        match rx.recv().await {
            Some(Ok(event)) => Ok(event),
            Some(Err(e)) => Err(TransportError::Malformed(e)),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    async fn close(&self) {
        if !self.connected.swap(false, Ordering::Relaxed) {
            return;
        }
        let mut sender = self.ws_sender.lock().await;
        if let Err(e) = sender.close().await {
            tracing::debug!(err = %e, "WebSocket close handshake failed");
        }
        self.reader_handle.abort();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Background task that reads WebSocket frames and decodes them.
///
/// Malformed text frames are forwarded as errors; the task does not
/// disconnect on bad data. Sets `connected` to `false` when the socket
/// closes or errors out.
async fn reader_loop(
    mut ws_reader: WsReader,
    tx: mpsc::Sender<Result<ServerEvent, CodecError>>,
    connected: Arc<AtomicBool>,
) {
    while let Some(frame) = ws_reader.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                if tx.send(codec::decode_server(text.as_str())).await.is_err() {
                    break;
                }
            }
            Ok(WsMessage::Binary(_)) => {
                tracing::debug!("ignoring binary WebSocket frame");
            }
            Ok(WsMessage::Close(_)) => {
                tracing::info!("WebSocket closed by server");
                break;
            }
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(err = %e, "WebSocket read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    tracing::debug!("WebSocket reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(url: &str, err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(url.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Tls(_) => TransportError::Io(std::io::Error::other(format!("TLS error: {err}"))),
        WsError::Http(response) => TransportError::Io(std::io::Error::other(format!(
            "server HTTP error: status {}",
            response.status()
        ))),
        other => TransportError::Io(std::io::Error::other(format!(
            "connection error: {other}"
        ))),
    }
}
