//! WebSocket client for the upload server.
//!
//! Requests are correlated with replies by a UUID in the envelope `id`
//! (or in the binary frame header). Three background tasks own the
//! socket: a read pump, a write pump and a ping pump.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use slicedrop_protocol::constants::{
    MessageType, WS_BINARY_REQUEST_TIMEOUT, WS_MAX_MESSAGE_SIZE, WS_MERGE_REQUEST_TIMEOUT,
    WS_REQUEST_TIMEOUT,
};
use slicedrop_protocol::envelope::Message;
use slicedrop_protocol::frame;

use crate::connection::{ReplyFuture, UploadConnection};
use crate::error::ClientError;

/// Requests awaiting a reply, keyed by request id.
pub(crate) type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;

/// Outbound queue depth. Each in-flight chunk occupies one slot.
const WRITE_QUEUE_SIZE: usize = 256;

/// WebSocket client connected to one upload server.
pub struct WsClient {
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: PendingMap,
    closed: CancellationToken,
    _read_handle: tokio::task::JoinHandle<()>,
    _write_handle: tokio::task::JoinHandle<()>,
    _ping_handle: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

impl WsClient {
    /// Connects to an upload server, e.g. `ws://127.0.0.1:9060`.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(WRITE_QUEUE_SIZE);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();
        let closed = CancellationToken::new();

        let write_handle = {
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::write::write_pump(write, write_rx, cancel))
        };

        let read_handle = {
            let pending = pending.clone();
            let write_tx = write_tx.clone();
            let cancel = cancel.clone();
            let closed = closed.clone();
            tokio::spawn(crate::pumps::read::read_pump(
                read, pending, write_tx, cancel, closed,
            ))
        };

        let ping_handle = {
            let write_tx = write_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::ping::ping_pump(write_tx, cancel))
        };

        tracing::debug!(%url, "connected to upload server");

        Ok(Self {
            write_tx,
            pending,
            closed,
            _read_handle: read_handle,
            _write_handle: write_handle,
            _ping_handle: ping_handle,
            cancel,
        })
    }

    /// Sends a JSON request and waits for its reply.
    ///
    /// Merge requests get [`WS_MERGE_REQUEST_TIMEOUT`]; everything else
    /// [`WS_REQUEST_TIMEOUT`].
    pub async fn request<T: serde::Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Message, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let timeout = match msg_type {
            MessageType::MergeChunks => WS_MERGE_REQUEST_TIMEOUT,
            _ => WS_REQUEST_TIMEOUT,
        };
        let msg = Message::new(&id, msg_type, payload)?;
        let json = serde_json::to_string(&msg)?;
        self.roundtrip(id, tungstenite::Message::Text(json.into()), timeout)
            .await
    }

    /// Sends a `ping` request and waits for the `pong`.
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.request::<()>(MessageType::Ping, None).await?;
        Ok(())
    }

    /// Returns `true` once the read side has stopped.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves when the connection is lost or closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Gracefully closes the connection.
    pub async fn close(&self) {
        self.cancel.cancel();
        let _ = self.write_tx.send(tungstenite::Message::Close(None)).await;
    }

    /// Frames a chunk upload under a fresh request id.
    fn binary_frame(
        header: &serde_json::Value,
        data: &[u8],
    ) -> Result<(String, Vec<u8>), ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut header = header.clone();
        if let Some(obj) = header.as_object_mut() {
            obj.insert("id".into(), serde_json::Value::String(id.clone()));
        }
        let frame = frame::encode(&serde_json::to_vec(&header)?, data)?;
        Ok((id, frame))
    }

    async fn roundtrip(
        &self,
        id: String,
        frame: tungstenite::Message,
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if self.write_tx.send(frame).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(ClientError::Closed);
        }

        let result = tokio::time::timeout(timeout, rx).await;
        self.pending.lock().await.remove(&id);

        match result {
            Ok(Ok(resp)) => resp.into_result().map_err(|err| ClientError::Server {
                code: err.code,
                message: err.message,
            }),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout),
        }
    }
}

impl UploadConnection for WsClient {
    fn send_request(&self, msg_type: MessageType, payload: &serde_json::Value) -> ReplyFuture<'_> {
        let payload = payload.clone();
        Box::pin(async move { self.request(msg_type, Some(&payload)).await })
    }

    fn send_binary(&self, header: &serde_json::Value, data: &[u8]) -> ReplyFuture<'_> {
        let framed = Self::binary_frame(header, data);
        Box::pin(async move {
            match framed {
                Ok((id, frame)) => {
                    let frame = tungstenite::Message::Binary(frame.into());
                    self.roundtrip(id, frame, WS_BINARY_REQUEST_TIMEOUT).await
                }
                Err(e) => Err(e),
            }
        })
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self._read_handle.abort();
        self._write_handle.abort();
        self._ping_handle.abort();
    }
}
