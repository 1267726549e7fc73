//! Request/response over a one-way message port.
//!
//! The editor runs in another document and only exchanges fire-and-forget
//! messages. [`RpcChannel`] tags each request with a fresh `requestId` and
//! parks the caller on a oneshot until the reply with the same id arrives
//! or the timeout fires. Messages without a `requestId` are pushes and go
//! to a separate queue.
//!
//! Whichever of reply and timeout removes the pending entry first decides
//! the call; the other is a no-op. A reply arriving after its timeout finds
//! no entry and is dropped with a warning.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Identity of one connection to the editor.
///
/// Replies are accepted only from the identity the port currently holds,
/// so a stale connection cannot answer for a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

impl SourceId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "editor#{}", self.0)
    }
}

/// Message exchanged with the editor, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl EditorMessage {
    pub fn request(kind: impl Into<String>, payload: Value, request_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload,
            request_id: Some(request_id.into()),
        }
    }

    pub fn push(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            request_id: None,
        }
    }

    /// Reply types signal failure by containing "error".
    pub fn is_error(&self) -> bool {
        self.kind.contains("error")
    }
}

/// A message received from some source.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub source: SourceId,
    pub message: Value,
}

pub type InboundTx = mpsc::UnboundedSender<Inbound>;
pub type InboundRx = mpsc::UnboundedReceiver<Inbound>;
pub type PushRx = mpsc::UnboundedReceiver<EditorMessage>;

/// Outbound half of the editor connection.
pub trait EditorPort: Send + Sync {
    /// Current identity of the editor, or `None` if it is not ready.
    fn source(&self) -> Option<SourceId>;

    /// Posts a message without waiting for anything.
    ///
    /// # Errors
    /// Returns an error if the message could not be handed to the transport.
    fn post(&self, message: &EditorMessage) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The editor is not attached; nothing was sent.
    NotReady,
    /// No reply within the window. The editor is not told.
    Timeout { kind: String, after: Duration },
    /// The editor answered with an error reply.
    Remote { kind: String, message: String },
    /// The channel shut down while the call was pending.
    Closed,
    /// The port refused the message.
    Post(String),
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::NotReady => write!(f, "Editor is not ready"),
            RpcError::Timeout { kind, after } => {
                write!(f, "Editor request {kind} timed out after {}ms", after.as_millis())
            }
            RpcError::Remote { kind, message } => write!(f, "Editor replied {kind}: {message}"),
            RpcError::Closed => write!(f, "Editor channel closed"),
            RpcError::Post(err) => write!(f, "Failed to post editor message: {err}"),
        }
    }
}

impl std::error::Error for RpcError {}

type Reply = Result<EditorMessage, RpcError>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the pending entry when the call ends, however it ends.
struct PendingSlot<'a> {
    pending: &'a Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    request_id: String,
}

impl PendingSlot<'_> {
    /// Returns `true` if the entry was still there (no reply claimed it).
    fn remove(&self) -> bool {
        lock(self.pending).remove(&self.request_id).is_some()
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.remove();
    }
}

pub struct RpcChannel {
    port: Arc<dyn EditorPort>,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    pushes: mpsc::UnboundedSender<EditorMessage>,
}

impl RpcChannel {
    /// Creates a channel and the queue its push messages are delivered to.
    pub fn new(port: Arc<dyn EditorPort>) -> (Self, PushRx) {
        let (pushes, push_rx) = mpsc::unbounded_channel();
        (
            Self {
                port,
                pending: Mutex::new(HashMap::new()),
                pushes,
            },
            push_rx,
        )
    }

    pub fn is_ready(&self) -> bool {
        self.port.source().is_some()
    }

    pub fn pending_calls(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Sends a request and waits for the matching reply's payload.
    ///
    /// # Errors
    /// See [`RpcError`]. `NotReady` is returned before anything is sent.
    pub async fn call(&self, kind: &str, payload: Value, timeout: Duration) -> Result<Value, RpcError> {
        self.request(kind, payload, timeout)
            .await
            .map(|reply| reply.payload)
    }

    /// Like [`RpcChannel::call`], but returns the whole reply so the caller
    /// can check its type.
    ///
    /// # Errors
    /// See [`RpcError`].
    pub async fn request(
        &self,
        kind: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<EditorMessage, RpcError> {
        if !self.is_ready() {
            return Err(RpcError::NotReady);
        }

        let request_id = new_request_id();
        let (tx, mut rx) = oneshot::channel();
        lock(&self.pending).insert(request_id.clone(), tx);
        let slot = PendingSlot {
            pending: &self.pending,
            request_id: request_id.clone(),
        };

        let message = EditorMessage::request(kind, payload, request_id.clone());
        if let Err(err) = self.port.post(&message) {
            return Err(RpcError::Post(format!("{err:#}")));
        }
        debug!(kind, request_id = %request_id, "editor request sent");

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => {
                if slot.remove() {
                    warn!(kind, request_id = %request_id, "editor request timed out");
                    return Err(RpcError::Timeout {
                        kind: kind.to_string(),
                        after: timeout,
                    });
                }
                // The reply claimed the entry in the same tick.
                rx.try_recv().unwrap_or(Err(RpcError::Closed))
            }
        }
    }

    /// Routes one inbound message: a reply resolves its pending call, a
    /// push goes to the push queue. Messages from any source other than
    /// the port's current one are dropped.
    pub fn handle_inbound(&self, inbound: Inbound) {
        if self.port.source() != Some(inbound.source) {
            warn!(source = %inbound.source, "ignoring message from foreign source");
            return;
        }
        let message: EditorMessage = match serde_json::from_value(inbound.message) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "ignoring malformed editor message");
                return;
            }
        };

        let Some(request_id) = message.request_id.clone() else {
            let _ = self.pushes.send(message);
            return;
        };

        let Some(tx) = lock(&self.pending).remove(&request_id) else {
            warn!(kind = %message.kind, request_id = %request_id, "no pending call for editor reply");
            return;
        };
        let reply = if message.is_error() {
            Err(RpcError::Remote {
                message: error_message(&message.payload),
                kind: message.kind,
            })
        } else {
            Ok(message)
        };
        let _ = tx.send(reply);
    }

    /// Feeds inbound messages until the port's queue closes, then fails
    /// every pending call with [`RpcError::Closed`].
    pub async fn pump(&self, mut inbound: InboundRx) {
        while let Some(message) = inbound.recv().await {
            self.handle_inbound(message);
        }
        self.close();
    }

    /// Fails every pending call with [`RpcError::Closed`].
    pub fn close(&self) {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(RpcError::Closed));
        }
    }
}

fn new_request_id() -> String {
    format!(
        "req_{}_{}",
        chrono::Utc::now().timestamp_millis(),
        uuid::Uuid::new_v4().simple()
    )
}

fn error_message(payload: &Value) -> String {
    match payload {
        Value::String(message) if !message.is_empty() => message.clone(),
        _ => payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Operation failed")
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::editor::port::ChannelPort;

    fn channel() -> (Arc<RpcChannel>, crate::editor::port::EditorEnd, InboundRx, PushRx) {
        let (port, end, inbound) = ChannelPort::pair();
        let (rpc, pushes) = RpcChannel::new(Arc::new(port));
        (Arc::new(rpc), end, inbound, pushes)
    }

    /// Replies delivered out of order resolve their own calls.
    #[tokio::test]
    async fn test_out_of_order_replies_correlate() {
        let (rpc, mut end, inbound, _pushes) = channel();
        let pump = tokio::spawn({
            let rpc = Arc::clone(&rpc);
            async move { rpc.pump(inbound).await }
        });

        let first = tokio::spawn({
            let rpc = Arc::clone(&rpc);
            async move { rpc.call("a", json!(1), Duration::from_secs(5)).await }
        });
        let first_request = end.recv().await.unwrap();
        let second = tokio::spawn({
            let rpc = Arc::clone(&rpc);
            async move { rpc.call("b", json!(2), Duration::from_secs(5)).await }
        });
        let second_request = end.recv().await.unwrap();
        assert_ne!(first_request.request_id, second_request.request_id);

        end.reply(&second_request, "b-done", json!("second"));
        end.reply(&first_request, "a-done", json!("first"));

        assert_eq!(first.await.unwrap(), Ok(json!("first")));
        assert_eq!(second.await.unwrap(), Ok(json!("second")));
        assert_eq!(rpc.pending_calls(), 0);

        drop(end);
        pump.abort();
    }

    /// A reply after the timeout is dropped and resolves nothing.
    #[tokio::test(start_paused = true)]
    async fn test_late_reply_after_timeout_is_ignored() {
        let (rpc, mut end, _inbound, _pushes) = channel();

        let call = tokio::spawn({
            let rpc = Arc::clone(&rpc);
            async move { rpc.call("slow", Value::Null, Duration::from_millis(100)).await }
        });
        let request = end.recv().await.unwrap();

        let result = call.await.unwrap();
        assert!(matches!(result, Err(RpcError::Timeout { ref kind, .. }) if kind == "slow"));
        assert_eq!(rpc.pending_calls(), 0);

        rpc.handle_inbound(Inbound {
            source: end.source(),
            message: json!({ "type": "slow-done", "payload": 1, "requestId": request.request_id }),
        });
        assert_eq!(rpc.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_not_ready_fails_without_posting() {
        let (rpc, end, _inbound, _pushes) = channel();
        drop(end);

        let result = rpc.call("get", Value::Null, Duration::from_secs(1)).await;
        assert_eq!(result, Err(RpcError::NotReady));
        assert_eq!(rpc.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_error_reply_rejects() {
        let (rpc, mut end, _inbound, _pushes) = channel();
        let call = tokio::spawn({
            let rpc = Arc::clone(&rpc);
            async move { rpc.call("get", Value::Null, Duration::from_secs(5)).await }
        });
        let request = end.recv().await.unwrap();
        rpc.handle_inbound(Inbound {
            source: end.source(),
            message: json!({
                "type": "comfy-pilot:workflow-error",
                "payload": { "message": "no graph" },
                "requestId": request.request_id,
            }),
        });

        assert_eq!(
            call.await.unwrap(),
            Err(RpcError::Remote {
                kind: "comfy-pilot:workflow-error".to_string(),
                message: "no graph".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_request_returns_reply_type() {
        let (rpc, mut end, _inbound, _pushes) = channel();
        let call = tokio::spawn({
            let rpc = Arc::clone(&rpc);
            async move { rpc.request("get", Value::Null, Duration::from_secs(5)).await }
        });
        let request = end.recv().await.unwrap();
        rpc.handle_inbound(Inbound {
            source: end.source(),
            message: json!({ "type": "data", "payload": 7, "requestId": request.request_id }),
        });

        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply.kind, "data");
        assert_eq!(reply.payload, json!(7));
    }

    #[tokio::test]
    async fn test_pushes_and_foreign_sources() {
        let (rpc, end, _inbound, mut pushes) = channel();

        rpc.handle_inbound(Inbound {
            source: SourceId::next(),
            message: json!({ "type": "changed", "payload": 1 }),
        });
        rpc.handle_inbound(Inbound {
            source: end.source(),
            message: json!({ "type": "changed", "payload": 2 }),
        });
        rpc.handle_inbound(Inbound {
            source: end.source(),
            message: json!("not an object"),
        });

        let push = pushes.try_recv().unwrap();
        assert_eq!(push.kind, "changed");
        assert_eq!(push.payload, json!(2));
        assert!(pushes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_fails_pending_calls() {
        let (rpc, mut end, inbound, _pushes) = channel();
        let call = tokio::spawn({
            let rpc = Arc::clone(&rpc);
            async move { rpc.call("get", Value::Null, Duration::from_secs(5)).await }
        });
        end.recv().await.unwrap();

        // Dropping the editor end closes the inbound queue.
        drop(end);
        rpc.pump(inbound).await;
        assert_eq!(call.await.unwrap(), Err(RpcError::Closed));
    }

    #[test]
    fn test_error_message_fallbacks() {
        assert_eq!(error_message(&json!("boom")), "boom");
        assert_eq!(error_message(&json!({ "message": "bad" })), "bad");
        assert_eq!(error_message(&Value::Null), "Operation failed");
    }
}
