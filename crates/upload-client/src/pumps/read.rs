//! Inbound half of the socket: replies go to the request awaiting them.

use std::ops::ControlFlow;

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message as Frame};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use slicedrop_protocol::constants::{WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT};
use slicedrop_protocol::envelope::Message;

use crate::ws_client::PendingMap;

/// Reads frames until the socket closes, errors, or stays silent for
/// [`WS_PONG_WAIT`].
///
/// On exit every pending request is dropped (its caller sees `Closed`
/// at once) and `closed` is cancelled.
pub(crate) async fn read_pump<S>(
    mut read: S,
    pending: PendingMap,
    write_tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    closed: CancellationToken,
) where
    S: Stream<Item = Result<Frame, tungstenite::Error>> + Unpin,
{
    let silence = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(silence);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            () = &mut silence => {
                warn!(wait = ?WS_PONG_WAIT, "server went silent, dropping connection");
                break;
            }
            next = read.next() => next,
        };

        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!("read failed: {e}");
                break;
            }
            None => {
                debug!("server closed the stream");
                break;
            }
        };

        silence.as_mut().reset(Instant::now() + WS_PONG_WAIT);
        if on_frame(frame, &pending, &write_tx).await.is_break() {
            break;
        }
    }

    let dropped = {
        let mut map = pending.lock().await;
        let n = map.len();
        map.clear();
        n
    };
    if dropped > 0 {
        debug!(dropped, "connection lost with requests in flight");
    }
    closed.cancel();
}

async fn on_frame(frame: Frame, pending: &PendingMap, write_tx: &mpsc::Sender<Frame>) -> ControlFlow<()> {
    match frame {
        Frame::Text(text) => route_reply(&text, pending).await,
        Frame::Ping(data) => {
            let _ = write_tx.send(Frame::Pong(data)).await;
        }
        Frame::Close(reason) => {
            debug!(?reason, "close frame");
            return ControlFlow::Break(());
        }
        Frame::Binary(data) => trace!(len = data.len(), "ignoring binary frame"),
        Frame::Pong(_) | Frame::Frame(_) => {}
    }
    ControlFlow::Continue(())
}

async fn route_reply(text: &str, pending: &PendingMap) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!(len = text.len(), "oversized reply dropped");
        return;
    }

    let reply: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("unparseable reply dropped: {e}");
            return;
        }
    };

    let waiter = pending.lock().await.remove(&reply.id);
    match waiter {
        Some(tx) => {
            trace!(msg_type = ?reply.msg_type, id = %reply.id, "reply routed");
            let _ = tx.send(reply);
        }
        None => debug!(msg_type = ?reply.msg_type, id = %reply.id, "reply for unknown request"),
    }
}
