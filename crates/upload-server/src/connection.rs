//! One client connection: outbound queue, keepalive, request fan-out.

use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Bytes, Message as WsMessage, Utf8Bytes};
use tokio_util::sync::CancellationToken;

use slicedrop_protocol::constants::{
    MessageType, WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_NOT_IMPLEMENTED, WS_PING_PERIOD,
    WS_PONG_WAIT,
};
use slicedrop_protocol::envelope::Message;

use crate::binary::BinaryChunk;
use crate::handler::Handler;
use crate::{MAX_CONCURRENT_REQUESTS, SEND_BUFFER_SIZE};

/// Queues replies for one client. Cloned into every request task.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

#[derive(Debug, thiserror::Error)]
#[error("reply dropped: send buffer full or client gone")]
pub struct SendError;

impl Sender {
    pub(crate) fn new(tx: mpsc::Sender<WsMessage>) -> Self {
        Self { tx }
    }

    /// Queues `msg` without waiting; a full buffer drops it.
    pub fn send_msg(&self, msg: Message) -> Result<(), SendError> {
        let text = serde_json::to_string(&msg).map_err(|_| SendError)?;
        self.push(WsMessage::Text(text.into())).inspect_err(|_| {
            tracing::warn!(id = %msg.id, msg_type = ?msg.msg_type, "reply dropped");
        })
    }

    pub fn send_error(&self, req: &Message, code: i32, message: &str) -> Result<(), SendError> {
        self.send_msg(req.reply_error(code, message))
    }

    /// Error reply for a request whose envelope could not be decoded.
    pub fn send_error_to(&self, id: &str, code: i32, message: &str) -> Result<(), SendError> {
        self.send_msg(Message::error(id, code, message))
    }

    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    fn push(&self, frame: WsMessage) -> Result<(), SendError> {
        self.tx.try_send(frame).map_err(|_| SendError)
    }
}

/// A served client.
pub struct ClientConnection {
    pub remote_addr: String,
    sender: Sender,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
}

impl ClientConnection {
    /// Splits `socket` and starts its reader and writer tasks.
    ///
    /// Both stop when the client goes away or `server_cancel` fires; the
    /// handler's disconnect hook runs once the reader is done.
    pub fn spawn<S, H>(
        socket: S,
        remote_addr: String,
        handler: Arc<H>,
        server_cancel: &CancellationToken,
    ) -> Self
    where
        S: Stream<Item = Result<WsMessage, tungstenite::Error>>
            + Sink<WsMessage, Error = tungstenite::Error>
            + Send
            + 'static,
        H: Handler,
    {
        let (tx, rx) = mpsc::channel(SEND_BUFFER_SIZE);
        let sender = Sender::new(tx);
        let cancel = server_cancel.child_token();
        let (sink, stream) = socket.split();

        tokio::spawn(write_pump(sink, rx, cancel.clone()));

        let reader = {
            let sender = sender.clone();
            let cancel = cancel.clone();
            let peer = remote_addr.clone();
            tokio::spawn(async move {
                read_pump(stream, &sender, &handler, &cancel).await;
                cancel.cancel();
                handler.on_disconnected().await;
                tracing::info!(%peer, "client disconnected");
            })
        };

        Self {
            remote_addr,
            sender,
            cancel,
            reader,
        }
    }

    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Waits for the reader to finish and the disconnect hook to run.
    pub async fn closed(self) {
        let _ = self.reader.await;
    }
}

/// Drains the outbound queue and pings every [`WS_PING_PERIOD`].
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    let mut keepalive = tokio::time::interval(WS_PING_PERIOD);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            queued = rx.recv() => {
                let Some(frame) = queued else { break };
                frame
            }
            _ = keepalive.tick() => WsMessage::Ping(Bytes::new()),
        };
        if let Err(e) = sink.send(frame).await {
            tracing::warn!("write failed: {e}");
            break;
        }
    }

    let _ = sink.close().await;
}

/// A request frame waiting for a task.
enum Request {
    Text(Utf8Bytes),
    Chunk(Bytes),
}

/// Reads frames and runs each request in its own task, at most
/// [`MAX_CONCURRENT_REQUESTS`] at a time.
///
/// Silence for [`WS_PONG_WAIT`] ends the connection.
async fn read_pump<S, H>(mut stream: S, sender: &Sender, handler: &Arc<H>, cancel: &CancellationToken)
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
    H: Handler,
{
    let silence = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(silence);
    let in_flight = Arc::new(Semaphore::new(MAX_CONCURRENT_REQUESTS));

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            () = &mut silence => {
                tracing::warn!(wait = ?WS_PONG_WAIT, "client went silent");
                break;
            }
            next = stream.next() => match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    tracing::warn!("read failed: {e}");
                    break;
                }
                None => break,
            },
        };
        silence.as_mut().reset(Instant::now() + WS_PONG_WAIT);

        let request = match frame {
            WsMessage::Text(text) => Request::Text(text),
            WsMessage::Binary(data) => Request::Chunk(data),
            WsMessage::Ping(data) => {
                let _ = sender.push(WsMessage::Pong(data));
                continue;
            }
            WsMessage::Close(reason) => {
                tracing::debug!(?reason, "close frame");
                break;
            }
            WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
        };

        // Backpressure: stop reading while the request limit is reached.
        let Ok(permit) = Arc::clone(&in_flight).acquire_owned().await else {
            break;
        };
        let handler = Arc::clone(handler);
        let sender = sender.clone();
        tokio::spawn(async move {
            match request {
                Request::Text(text) => dispatch_text(&handler, sender, &text).await,
                Request::Chunk(data) => dispatch_chunk(&handler, sender, &data).await,
            }
            drop(permit);
        });
    }
}

async fn dispatch_text<H: Handler>(handler: &Arc<H>, sender: Sender, text: &str) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!("undecodable request: {e}");
            if let Some(id) = Message::peek_id(text.as_bytes()) {
                let _ = sender.send_error_to(
                    &id,
                    WS_ERR_CODE_BAD_REQUEST,
                    &format!("invalid envelope: {e}"),
                );
            }
            return;
        }
    };

    match msg.msg_type {
        MessageType::Ping => handler.on_ping(sender, msg).await,
        MessageType::ProbeChunks => handler.on_probe_chunks(sender, msg).await,
        MessageType::MergeChunks => handler.on_merge_chunks(sender, msg).await,
        _ => {
            tracing::warn!(msg_type = ?msg.msg_type, "unsupported request type");
            let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "unknown message type");
        }
    }
}

async fn dispatch_chunk<H: Handler>(handler: &Arc<H>, sender: Sender, data: &[u8]) {
    match BinaryChunk::decode(data) {
        Ok(chunk) => handler.on_binary_chunk(sender, chunk.header, chunk.data).await,
        Err(e) => {
            tracing::warn!("invalid chunk frame: {e}");
            if let Some(id) = BinaryChunk::request_id(data) {
                let _ = sender.send_error_to(
                    &id,
                    WS_ERR_CODE_BAD_REQUEST,
                    &format!("invalid chunk frame: {e}"),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerFuture;
    use futures_util::stream;
    use slicedrop_protocol::frame;
    use slicedrop_protocol::messages::ChunkHeader;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Item = Result<WsMessage, tungstenite::Error>;

    /// Acks every chunk with an empty `chunk_ack`.
    #[derive(Default)]
    struct Acker {
        chunks: AtomicUsize,
    }

    impl Handler for Acker {
        fn on_binary_chunk(
            &self,
            sender: Sender,
            header: ChunkHeader,
            _data: Vec<u8>,
        ) -> HandlerFuture<'_> {
            self.chunks.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                let reply = Message::new::<()>(&header.id, MessageType::ChunkAck, None).unwrap();
                let _ = sender.send_msg(reply);
            })
        }
    }

    fn outbox(capacity: usize) -> (Sender, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Sender::new(tx), rx)
    }

    async fn next_reply(rx: &mut mpsc::Receiver<WsMessage>) -> Message {
        loop {
            if let WsMessage::Text(t) = rx.recv().await.unwrap() {
                return serde_json::from_str(&t).unwrap();
            }
        }
    }

    #[test]
    fn full_buffer_drops_reply() {
        let (sender, _rx) = outbox(1);
        let msg = Message::new::<()>("a", MessageType::Pong, None).unwrap();
        assert!(sender.send_msg(msg.clone()).is_ok());
        assert!(sender.send_msg(msg).is_err());
        assert!(sender.is_connected());
    }

    #[tokio::test]
    async fn unknown_type_gets_not_implemented() {
        let (sender, mut rx) = outbox(8);
        let handler = Arc::new(Acker::default());

        dispatch_text(&handler, sender, r#"{"id":"u-1","type":"future_thing"}"#).await;

        let resp = next_reply(&mut rx).await;
        assert_eq!(resp.id, "u-1");
        assert_eq!(resp.error.unwrap().code, WS_ERR_CODE_NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn undecodable_envelope_gets_bad_request() {
        let (sender, mut rx) = outbox(8);
        let handler = Arc::new(Acker::default());

        dispatch_text(&handler, sender.clone(), r#"{"id":"t-2","type":7}"#).await;
        let resp = next_reply(&mut rx).await;
        assert_eq!(resp.id, "t-2");
        assert_eq!(resp.error.unwrap().code, WS_ERR_CODE_BAD_REQUEST);

        // Nothing to address a reply to.
        dispatch_text(&handler, sender, "{not json").await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn bad_chunk_header_gets_bad_request() {
        let (sender, mut rx) = outbox(8);
        let handler = Arc::new(Acker::default());

        let raw = frame::encode(br#"{"id":"b-9","index":"one"}"#, b"").unwrap();
        dispatch_chunk(&handler, sender, &raw).await;

        let resp = next_reply(&mut rx).await;
        assert_eq!(resp.id, "b-9");
        assert_eq!(resp.error.unwrap().code, WS_ERR_CODE_BAD_REQUEST);
        assert_eq!(handler.chunks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn requests_run_concurrently_and_ping_is_answered() {
        let (sender, mut rx) = outbox(8);
        let handler = Arc::new(Acker::default());

        let ping = Message::new::<()>("p-1", MessageType::Ping, None).unwrap();
        let header = ChunkHeader {
            id: "c-1".into(),
            fingerprint: "0cc175b9c0f1b6a831c399e269772661".into(),
            index: 1,
            extension: "bin".into(),
            checksum: String::new(),
            layout: None,
        };
        let frames = stream::iter(vec![
            Ok(WsMessage::Ping(Bytes::from_static(b"hb"))),
            Ok(WsMessage::Text(serde_json::to_string(&ping).unwrap().into())),
            Ok(WsMessage::Binary(crate::binary::encode_chunk(&header, b"abc").into())),
        ]);

        read_pump(frames, &sender, &handler, &CancellationToken::new()).await;

        assert!(matches!(rx.recv().await, Some(WsMessage::Pong(data)) if &data[..] == b"hb"));
        let mut ids = vec![next_reply(&mut rx).await.id, next_reply(&mut rx).await.id];
        ids.sort();
        assert_eq!(ids, ["c-1", "p-1"]);
        assert_eq!(handler.chunks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn silent_client_is_dropped() {
        tokio::time::pause();
        let (sender, _rx) = outbox(8);
        // Returns only because the silence deadline fires.
        read_pump(
            stream::pending::<Item>(),
            &sender,
            &Arc::new(Acker::default()),
            &CancellationToken::new(),
        )
        .await;
    }

    #[tokio::test]
    async fn cancelled_connection_stops_reading() {
        let (sender, _rx) = outbox(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(
            Duration::from_secs(2),
            read_pump(stream::pending::<Item>(), &sender, &Arc::new(Acker::default()), &cancel),
        )
        .await
        .expect("cancelled reader should return");
    }

    #[tokio::test]
    async fn writer_interleaves_pings_and_stops_on_cancel() {
        tokio::time::pause();
        let (tx, rx) = mpsc::channel(4);
        let (seen_tx, mut seen) = mpsc::unbounded_channel::<WsMessage>();
        let sink = futures_util::sink::unfold(seen_tx, |out, frame: WsMessage| async move {
            let _ = out.send(frame);
            Ok::<_, tungstenite::Error>(out)
        });

        let cancel = CancellationToken::new();
        let writer = tokio::spawn(write_pump(Box::pin(sink), rx, cancel.clone()));

        tx.send(WsMessage::Text("queued".to_string().into())).await.unwrap();
        let mut frames = Vec::new();
        while frames.len() < 2 {
            frames.push(seen.recv().await.unwrap());
        }
        assert!(frames.iter().any(|m| matches!(m, WsMessage::Ping(_))));
        assert!(frames.iter().any(|m| matches!(m, WsMessage::Text(t) if t.as_str() == "queued")));

        cancel.cancel();
        writer.await.unwrap();
        while seen.recv().await.is_some() {}
    }
}
