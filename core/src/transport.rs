// WebSocket plumbing shared by the relay and the client engine
//
// Every socket gets one writer task fed by a bounded channel; readers
// never write. A full queue means the receiver is not draining — the
// connection is dropped and the other side reconnects.

use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;

/// Bounded depth of each outbound send queue.
pub const SEND_QUEUE_DEPTH: usize = 64;

/// Seconds a new connection has to produce its first valid protocol frame.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

pub type FrameTx = mpsc::Sender<String>;

/// Spawn the writer task for a socket sink. Dropping every clone of the
/// returned sender closes the sink, which closes the connection.
pub fn spawn_writer<S>(mut sink: S) -> FrameTx
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<String>(SEND_QUEUE_DEPTH);
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text)).await {
                debug!("websocket write failed: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    });
    tx
}

/// Queue a frame without blocking. Returns false when the queue is full or
/// the writer is gone; the caller should drop the connection.
pub fn try_queue(tx: &FrameTx, frame: String) -> bool {
    tx.try_send(frame).is_ok()
}

/// Read the next text frame, skipping pings/pongs. None means the
/// connection is closed or errored.
pub async fn read_text<S>(reader: &mut S) -> Option<String>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(item) = reader.next().await {
        match item {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                debug!("websocket read failed: {e}");
                return None;
            }
        }
    }
    None
}

/// `read_text` bounded by the handshake deadline.
pub async fn read_text_deadline<S>(reader: &mut S, deadline: Duration) -> Option<String>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    tokio::time::timeout(deadline, read_text(reader))
        .await
        .ok()
        .flatten()
}
