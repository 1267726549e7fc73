//! Editor ports: where editor messages actually travel.
//!
//! - [`ChannelPort`]: in-process queues, for embedding and tests.
//! - [`WsEditorPort`]: JSON text frames over a WebSocket bridge.
//!
//! Both hand inbound traffic to an [`InboundRx`] tagged with the
//! connection's [`SourceId`]; feed it to [`RpcChannel::pump`].
//!
//! [`RpcChannel::pump`]: crate::editor::rpc::RpcChannel::pump

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::editor::rpc::{EditorMessage, EditorPort, Inbound, InboundRx, InboundTx, SourceId};

/// In-process port. The other side is an [`EditorEnd`].
pub struct ChannelPort {
    source: SourceId,
    outbound: mpsc::UnboundedSender<EditorMessage>,
}

impl ChannelPort {
    /// Creates a connected port, the editor side, and the inbound queue.
    pub fn pair() -> (Self, EditorEnd, InboundRx) {
        let source = SourceId::next();
        let (outbound, requests) = mpsc::unbounded_channel();
        let (replies, inbound) = mpsc::unbounded_channel();
        (
            Self { source, outbound },
            EditorEnd {
                source,
                requests,
                replies,
            },
            inbound,
        )
    }
}

impl EditorPort for ChannelPort {
    fn source(&self) -> Option<SourceId> {
        (!self.outbound.is_closed()).then_some(self.source)
    }

    fn post(&self, message: &EditorMessage) -> Result<()> {
        self.outbound
            .send(message.clone())
            .map_err(|_| anyhow::anyhow!("editor end dropped"))
    }
}

/// Editor side of a [`ChannelPort`]. Dropping it detaches the editor.
pub struct EditorEnd {
    source: SourceId,
    requests: mpsc::UnboundedReceiver<EditorMessage>,
    replies: InboundTx,
}

impl EditorEnd {
    pub fn source(&self) -> SourceId {
        self.source
    }

    /// Next message posted by the client.
    pub async fn recv(&mut self) -> Option<EditorMessage> {
        self.requests.recv().await
    }

    /// Message already posted by the client, if any.
    pub fn try_recv(&mut self) -> Option<EditorMessage> {
        self.requests.try_recv().ok()
    }

    /// Answers `request` with the same request id.
    pub fn reply(&self, request: &EditorMessage, kind: &str, payload: Value) {
        let message = EditorMessage {
            kind: kind.to_string(),
            payload,
            request_id: request.request_id.clone(),
        };
        self.send(&message);
    }

    /// Sends a push message (no request id).
    pub fn push(&self, kind: &str, payload: Value) {
        self.send(&EditorMessage::push(kind, payload));
    }

    fn send(&self, message: &EditorMessage) {
        match serde_json::to_value(message) {
            Ok(message) => {
                let _ = self.replies.send(Inbound {
                    source: self.source,
                    message,
                });
            }
            Err(err) => warn!(error = %err, "failed to encode editor message"),
        }
    }
}

/// Port over a WebSocket editor bridge.
pub struct WsEditorPort {
    source: SourceId,
    outbound: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WsEditorPort {
    /// Connects to the bridge at `url`.
    ///
    /// # Errors
    /// Returns an error if the WebSocket handshake fails.
    pub async fn connect(url: &Url) -> Result<(Self, InboundRx)> {
        let (ws, _response) = connect_async(url.as_str())
            .await
            .with_context(|| format!("Failed to connect editor bridge at {url}"))?;
        let (mut sink, mut stream) = ws.split();
        let source = SourceId::next();
        let open = Arc::new(AtomicBool::new(true));
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        info!(source = %source, url = %url, "editor bridge connected");

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(err) = sink.send(message).await {
                    warn!(error = %err, "editor bridge write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn({
            let open = Arc::clone(&open);
            async move {
                while let Some(frame) = stream.next().await {
                    match frame {
                        Ok(Message::Text(text)) => match serde_json::from_str::<Value>(text.as_str()) {
                            Ok(message) => {
                                if inbound_tx.send(Inbound { source, message }).is_err() {
                                    break;
                                }
                            }
                            Err(err) => warn!(error = %err, "ignoring non-JSON editor frame"),
                        },
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            warn!(error = %err, "editor bridge read failed");
                            break;
                        }
                    }
                }
                open.store(false, Ordering::SeqCst);
                debug!(source = %source, "editor bridge closed");
            }
        });

        Ok((
            Self {
                source,
                outbound,
                open,
                reader,
                writer,
            },
            inbound,
        ))
    }
}

impl EditorPort for WsEditorPort {
    fn source(&self) -> Option<SourceId> {
        (self.open.load(Ordering::SeqCst) && !self.outbound.is_closed()).then_some(self.source)
    }

    fn post(&self, message: &EditorMessage) -> Result<()> {
        let text = serde_json::to_string(message).context("Failed to encode editor message")?;
        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| anyhow::anyhow!("editor bridge writer stopped"))
    }
}

impl Drop for WsEditorPort {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
