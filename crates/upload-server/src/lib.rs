//! WebSocket server for slicedrop uploads.
//!
//! Accepts any number of client connections, dispatches JSON requests and
//! binary chunk frames to a [`Handler`], and manages each connection's
//! lifecycle (ping/pong, graceful shutdown). [`StagingHandler`] is the
//! handler that backs the protocol with a chunk store and merge engine.

mod binary;
mod connection;
mod handler;
mod server;
mod staging;

pub use binary::{BinaryChunk, ParseError};
pub use connection::{ClientConnection, SendError, Sender};
pub use handler::{Handler, HandlerFuture};
pub use server::{ServerConfig, UploadServer};
pub use staging::StagingHandler;

/// Send buffer capacity per connection.
///
/// Every concurrent chunk upload gets one ack; the buffer must hold a
/// reply for each request in flight or `try_send()` drops it.
pub const SEND_BUFFER_SIZE: usize = 2048;

/// Requests processed concurrently per connection before the read pump
/// stops reading.
pub const MAX_CONCURRENT_REQUESTS: usize = 64;

/// Errors produced by the upload server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("WebSocket handshake timed out")]
    HandshakeTimeout,
}
