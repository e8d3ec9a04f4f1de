//! Transport layer abstraction for `ProjChat`.
//!
//! Defines the [`Transport`] trait (one open, authenticated-or-not connection
//! carrying channel events) and the [`Connector`] trait that opens a fresh
//! transport for every connection attempt. Concrete implementations:
//! - [`ws::WsConnector`] -- WebSocket connection to the chat server
//! - [`loopback::LoopbackConnector`] -- in-process channels for testing

pub mod loopback;
pub mod ws;

use projchat_proto::codec::CodecError;
use projchat_proto::event::{ClientEvent, ServerEvent};

/// Errors that can occur during transport operations.
///
/// Apart from [`TransportError::Malformed`], every variant means the
/// connection is unusable and must be re-established.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The server could not be reached.
    #[error("server {0} is unreachable")]
    Unreachable(String),

    /// A frame arrived that is not a valid server event.
    #[error("malformed frame: {0}")]
    Malformed(#[from] CodecError),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single bidirectional connection carrying channel events.
///
/// `recv` must be cancel-safe: the connection supervisor races it against
/// its command queue.
pub trait Transport: Send + Sync + 'static {
    /// Send an event to the server.
    fn send(
        &self,
        event: &ClientEvent,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next event from the server.
    ///
    /// Returns [`TransportError::Malformed`] for frames that fail to decode;
    /// the connection stays usable in that case.
    fn recv(&self) -> impl std::future::Future<Output = Result<ServerEvent, TransportError>> + Send;

    /// Close the connection. Idempotent.
    fn close(&self) -> impl std::future::Future<Output = ()> + Send;

    /// Whether the connection is still open.
    fn is_connected(&self) -> bool;
}

/// Opens transports. Called once per connection attempt.
pub trait Connector: Send + Sync + 'static {
    /// The transport type this connector produces.
    type Conn: Transport;

    /// Open a new, not yet authenticated, transport.
    fn open(&self) -> impl std::future::Future<Output = Result<Self::Conn, TransportError>> + Send;
}
