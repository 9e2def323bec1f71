//! WebSocket transport task.
//!
//! One spawned task per connection attempt. It only moves bytes: frames to
//! send arrive on an unbounded channel, and everything it observes is
//! reported as a [`TransportEvent`] tagged with the attempt's epoch so the
//! client can ignore a stale connection's leftovers.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::protocol::FrameBuffer;

/// What a transport task reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    Opened,
    Frame(Vec<u8>),
    /// Connection failed or ended. `auth_rejected` is set when the relay
    /// closed with the policy-violation code.
    Closed { auth_rejected: bool, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub epoch: u64,
    pub kind: TransportEventKind,
}

/// Handle to a running transport task. Dropping it aborts the task without
/// flushing queued frames.
pub struct TransportHandle {
    epoch: u64,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

impl TransportHandle {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Queue a frame. Returns `false` if the task has already stopped.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        self.outgoing.send(frame).is_ok()
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Connect to `url` in a background task. An opening handshake that takes
/// longer than `connect_timeout` is reported as `Closed`.
pub fn spawn(
    url: String,
    epoch: u64,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> TransportHandle {
    let (outgoing, out_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(url, epoch, connect_timeout, out_rx, events));
    TransportHandle {
        epoch,
        outgoing,
        task,
    }
}

async fn run(
    url: String,
    epoch: u64,
    connect_timeout: Duration,
    mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let emit = |kind| {
        let _ = events.send(TransportEvent { epoch, kind });
    };
    let closed = |auth_rejected, reason: String| TransportEventKind::Closed {
        auth_rejected,
        reason,
    };

    let connecting = tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(&url));
    let ws_stream = match connecting.await {
        Ok(Ok((ws_stream, _))) => ws_stream,
        Ok(Err(e)) => {
            log::warn!("Connect to {url} failed: {e}");
            emit(closed(false, e.to_string()));
            return;
        }
        Err(_) => {
            log::warn!("Connect to {url} timed out after {connect_timeout:?}");
            emit(closed(false, format!("connect timed out after {connect_timeout:?}")));
            return;
        }
    };
    log::info!("Connected to {url}");
    emit(TransportEventKind::Opened);

    let (mut ws_writer, mut ws_reader) = ws_stream.split();
    let mut frames = FrameBuffer::new();

    loop {
        tokio::select! {
            out = out_rx.recv() => {
                let Some(data) = out else {
                    let _ = ws_writer.send(WsMessage::Close(None)).await;
                    return;
                };
                if let Err(e) = ws_writer.send(WsMessage::Binary(data.into())).await {
                    log::warn!("Send to {url} failed: {e}");
                    emit(closed(false, e.to_string()));
                    return;
                }
            }

            msg = ws_reader.next() => {
                match msg {
                    Some(Ok(WsMessage::Binary(data))) => {
                        frames.extend(&data);
                        loop {
                            match frames.next_frame() {
                                Ok(Some(frame)) => emit(TransportEventKind::Frame(frame)),
                                Ok(None) => break,
                                Err(e) => {
                                    log::warn!("Dropping bad frame from {url}: {e}");
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let (auth_rejected, reason) = match frame {
                            Some(f) => (f.code == CloseCode::Policy, f.reason.as_str().to_string()),
                            None => (false, "closed by relay".to_string()),
                        };
                        emit(closed(auth_rejected, reason));
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("Connection to {url} failed: {e}");
                        emit(closed(false, e.to_string()));
                        return;
                    }
                    None => {
                        emit(closed(false, "connection ended".to_string()));
                        return;
                    }
                }
            }
        }
    }
}
