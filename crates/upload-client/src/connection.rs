//! Transport abstraction used by the session coordinator.

use std::future::Future;
use std::pin::Pin;

use serde::de::DeserializeOwned;
use slicedrop_protocol::constants::MessageType;
use slicedrop_protocol::envelope::Message;

use crate::error::ClientError;

/// A boxed future resolving to the server's reply.
pub type ReplyFuture<'a> = Pin<Box<dyn Future<Output = Result<Message, ClientError>> + Send + 'a>>;

/// Abstract connection to an upload server.
///
/// [`crate::WsClient`] implements this over WebSocket. Keeping the
/// coordinator behind a trait lets tests drive it with in-process fakes.
pub trait UploadConnection: Send + Sync {
    /// Sends a JSON request and waits for the reply.
    fn send_request(&self, msg_type: MessageType, payload: &serde_json::Value) -> ReplyFuture<'_>;

    /// Sends a binary chunk frame and waits for the reply.
    ///
    /// `header` is a JSON object; the implementation injects the request id.
    fn send_binary(&self, header: &serde_json::Value, data: &[u8]) -> ReplyFuture<'_>;
}

/// Decodes a reply payload, treating a missing payload as an error.
pub(crate) fn decode_reply<T: DeserializeOwned>(msg: &Message) -> Result<T, ClientError> {
    msg.parse_payload::<T>()?
        .ok_or_else(|| ClientError::EmptyReply(msg.msg_type.clone()))
}
