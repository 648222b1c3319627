//! WebSocket ping pump: periodic keepalive pings.

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use slicedrop_protocol::constants::WS_PING_PERIOD;

/// Queues a ping every [`WS_PING_PERIOD`] until cancelled or the writer is gone.
pub(crate) async fn ping_pump(
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(WS_PING_PERIOD);
    interval.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let ping = tungstenite::Message::Ping(Vec::new().into());
                if write_tx.send(ping).await.is_err() {
                    break;
                }
            }
        }
    }
}
