//! Handler trait for processing WebSocket messages.
//!
//! Implementors provide the upload logic while the server framework handles
//! connection management, routing, and the binary protocol.

use std::future::Future;
use std::pin::Pin;

use slicedrop_protocol::constants::{MessageType, WS_ERR_CODE_NOT_IMPLEMENTED};
use slicedrop_protocol::envelope::Message;
use slicedrop_protocol::messages::ChunkHeader;

use crate::connection::Sender;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for handling requests from an upload client.
///
/// Every request runs in its own task, so methods may be invoked
/// concurrently for the same connection. Default implementations reply
/// with "not implemented".
pub trait Handler: Send + Sync + 'static {
    /// Called for `ping` messages.
    fn on_ping(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Ok(reply) = msg.reply(MessageType::Pong, Option::<&()>::None) {
                let _ = sender.send_msg(reply);
            }
        })
    }

    /// Called for `probe_chunks`.
    fn on_probe_chunks(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for `merge_chunks`.
    fn on_merge_chunks(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for a binary chunk frame.
    fn on_binary_chunk(
        &self,
        sender: Sender,
        header: ChunkHeader,
        data: Vec<u8>,
    ) -> HandlerFuture<'_> {
        let _ = data;
        Box::pin(async move {
            tracing::warn!("binary chunk received but handler not implemented");
            let _ = sender.send_error_to(&header.id, WS_ERR_CODE_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called when the client disconnects (cleanup hook).
    fn on_disconnected(&self) -> HandlerFuture<'_> {
        Box::pin(async {})
    }
}
