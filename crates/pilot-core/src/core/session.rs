//! Agent chat session over a WebSocket.
//!
//! One `AgentSession` owns one transport connection:
//!
//! ```text
//! Disconnected -> Connecting -> Open -> Disconnected
//! ```
//!
//! The session never reconnects on its own. A dropped connection ends in
//! `Disconnected` and the caller decides whether to call `connect` again.
//!
//! Three tasks run while open: a writer draining an outbound queue into the
//! socket, a reader feeding inbound text through the [`FrameDispatcher`],
//! and an optional heartbeat. Events go to every subscriber; partial-stream
//! events are best-effort, everything else awaits subscriber capacity for
//! up to `subscriber_timeout`. A subscriber still full after that is
//! dropped so it cannot hold up the others.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{Config, SessionConfig};
use crate::core::dispatch::FrameDispatcher;
use crate::core::events::{ErrorKind, SessionEvent, SessionEventRx, SessionEventTx};
use crate::protocol::{
    FrameBuilder, RequestIdGenerator, StreamMarkers, ToolCallRequestData, ToolDecision, UserInput,
    WireFrame,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Identity of one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_code: String,
    /// Backend agent that handles requests; sent with each user message.
    pub agent_code: Option<String>,
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// `None` disables the heartbeat.
    pub heartbeat: Option<Duration>,
    pub stream_partials: bool,
    pub markers: StreamMarkers,
    /// Per-subscriber event buffer.
    pub event_buffer: usize,
    /// Limit on the WebSocket handshake.
    pub connect_timeout: Duration,
    /// How long a full subscriber may hold up delivery before it is dropped.
    pub subscriber_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            heartbeat: None,
            stream_partials: true,
            markers: StreamMarkers::default(),
            event_buffer: 128,
            connect_timeout: Duration::from_secs(10),
            subscriber_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionOptions {
    /// # Errors
    /// Returns an error if the configured markers are empty.
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        Ok(Self {
            heartbeat: config.heartbeat(),
            stream_partials: config.stream_partials,
            markers: config.markers()?,
            event_buffer: config.event_buffer.max(1),
            connect_timeout: config.connect_timeout(),
            subscriber_timeout: config.subscriber_timeout(),
        })
    }
}

/// Tasks and queue of a live connection.
struct Link {
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Link {
    fn abort_all(self) {
        self.reader.abort();
        self.writer.abort();
        if let Some(heartbeat) = self.heartbeat {
            heartbeat.abort();
        }
    }
}

/// State shared with the connection tasks.
struct Shared {
    frames: FrameBuilder,
    ids: RequestIdGenerator,
    dispatcher: Mutex<FrameDispatcher>,
    subscribers: Mutex<Vec<SessionEventTx>>,
    link: Mutex<Option<Link>>,
    state: watch::Sender<ConnectionState>,
    subscriber_timeout: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn take_link(&self) -> Option<Link> {
        lock(&self.link).take()
    }

    async fn emit(&self, event: SessionEvent) {
        let event = Arc::new(event);
        let subscribers: Vec<SessionEventTx> = lock(&self.subscribers).clone();
        let mut stalled = Vec::new();
        if event.is_delta() {
            for tx in &subscribers {
                let _ = tx.try_send(Arc::clone(&event));
            }
        } else {
            let sends = subscribers
                .iter()
                .map(|tx| tx.send_timeout(Arc::clone(&event), self.subscriber_timeout));
            let results = futures_util::future::join_all(sends).await;
            for (tx, result) in subscribers.iter().zip(results) {
                if matches!(result, Err(SendTimeoutError::Timeout(_))) {
                    stalled.push(tx);
                }
            }
        }
        if !stalled.is_empty() {
            warn!(count = stalled.len(), "dropping stalled event subscribers");
        }
        lock(&self.subscribers)
            .retain(|tx| !tx.is_closed() && !stalled.iter().any(|s| s.same_channel(tx)));
    }

    /// Queues a frame on the open connection. At most once; never retried.
    fn send_frame(&self, frame: &WireFrame) -> bool {
        let link = lock(&self.link);
        let Some(link) = link.as_ref() else {
            warn!(kind = %frame.kind, request_id = %frame.request_id, "connection not open, dropping frame");
            return false;
        };
        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, kind = %frame.kind, "failed to encode frame");
                return false;
            }
        };
        if link.outbound.send(Message::Text(text.into())).is_err() {
            warn!(kind = %frame.kind, "writer stopped, dropping frame");
            return false;
        }
        true
    }

    fn dispatch_text(&self, text: &str) -> Vec<SessionEvent> {
        lock(&self.dispatcher).handle_text(text)
    }

    /// Moves `Disconnected` to `Connecting` and returns the state seen.
    fn begin_connect(&self) -> ConnectionState {
        let mut seen = ConnectionState::Disconnected;
        self.state.send_if_modified(|state| {
            seen = *state;
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        seen
    }
}

/// Puts the state back to `Disconnected` unless the connect completed,
/// including when the connecting future is dropped.
struct ConnectingGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl ConnectingGuard<'_> {
    fn complete(mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.set_state(ConnectionState::Disconnected);
        }
    }
}

pub struct AgentSession {
    info: SessionInfo,
    endpoint: Url,
    options: SessionOptions,
    shared: Arc<Shared>,
}

impl AgentSession {
    pub fn new(info: SessionInfo, endpoint: Url, options: SessionOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            frames: FrameBuilder::new(info.session_code.clone()),
            ids: RequestIdGenerator::new(),
            dispatcher: Mutex::new(FrameDispatcher::new(
                options.markers.clone(),
                options.stream_partials,
            )),
            subscribers: Mutex::new(Vec::new()),
            link: Mutex::new(None),
            state,
            subscriber_timeout: options.subscriber_timeout,
        });
        Self {
            info,
            endpoint,
            options,
            shared,
        }
    }

    /// Builds a session whose endpoint is derived from the server config.
    ///
    /// # Errors
    /// Returns an error if the endpoint cannot be derived or the config is invalid.
    pub fn from_config(config: &Config, info: SessionInfo) -> Result<Self> {
        let url = config.chat_socket_url(&info.session_code, &info.token)?;
        let options = SessionOptions::from_config(&config.session)?;
        Ok(Self::new(info, url, options))
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Watches connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Registers a new event subscriber. Every subscriber sees every event.
    pub fn subscribe(&self) -> SessionEventRx {
        let (tx, rx) = mpsc::channel(self.options.event_buffer);
        lock(&self.shared.subscribers).push(tx);
        rx
    }

    /// Opens the transport.
    ///
    /// Failure, including a handshake slower than `connect_timeout`, is
    /// also reported as a `Connect` error event; the session stays
    /// `Disconnected`. Dropping the returned future before it completes
    /// leaves the session `Disconnected` as well. Calling this while
    /// already open is a no-op.
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established or a
    /// connect is already in progress.
    pub async fn connect(&self) -> Result<()> {
        match self.shared.begin_connect() {
            ConnectionState::Open => return Ok(()),
            ConnectionState::Connecting => anyhow::bail!("connect already in progress"),
            ConnectionState::Disconnected => {}
        }
        let guard = ConnectingGuard {
            shared: &self.shared,
            armed: true,
        };
        info!(session_code = %self.info.session_code, "connecting chat socket");

        let timeout = self.options.connect_timeout;
        let handshake = match tokio::time::timeout(timeout, connect_async(self.endpoint.as_str())).await {
            Ok(result) => result.map(|(ws, _response)| ws).map_err(anyhow::Error::from),
            Err(_) => Err(anyhow::anyhow!(
                "handshake timed out after {}ms",
                timeout.as_millis()
            )),
        };
        let ws = match handshake {
            Ok(ws) => ws,
            Err(err) => {
                drop(guard);
                self.shared
                    .emit(SessionEvent::error(ErrorKind::Connect, format!("{err:#}")))
                    .await;
                return Err(err.context(format!(
                    "Failed to connect session {}",
                    self.info.session_code
                )));
            }
        };

        let (sink, stream) = ws.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        lock(&self.shared.dispatcher).reset();
        {
            let mut link = lock(&self.shared.link);
            *link = Some(Link {
                outbound,
                reader: tokio::spawn(read_loop(stream, Arc::clone(&self.shared), ready_rx)),
                writer: tokio::spawn(write_loop(sink, outbound_rx)),
                heartbeat: self
                    .options
                    .heartbeat
                    .map(|every| tokio::spawn(heartbeat_loop(Arc::clone(&self.shared), every))),
            });
        }

        guard.complete();
        self.shared.set_state(ConnectionState::Open);
        info!(session_code = %self.info.session_code, "chat socket open");
        self.shared.emit(SessionEvent::Connected).await;
        let _ = ready_tx.send(());
        Ok(())
    }

    /// Sends user input as a message or, if slash-prefixed, a command.
    ///
    /// Returns the new request id, or `None` if the session is not open
    /// (the input is logged and dropped).
    pub fn send_user_input(&self, mut input: UserInput) -> Option<String> {
        if input.agent_code.is_none() {
            input.agent_code.clone_from(&self.info.agent_code);
        }
        let request_id = self.shared.ids.next_id();
        let is_command = input.is_command();
        let frame = self.shared.frames.user_input(request_id.clone(), input);
        if !self.shared.send_frame(&frame) {
            return None;
        }
        debug!(request_id = %request_id, is_command, "sent user input");
        Some(request_id)
    }

    /// Answers an outstanding tool call, echoing the server's request id.
    ///
    /// Each received call can be answered once; answers for unknown or
    /// already-answered calls are refused.
    pub fn send_tool_response(
        &self,
        request_id: &str,
        request: &ToolCallRequestData,
        decision: ToolDecision,
    ) -> bool {
        if !self.is_connected() {
            warn!(request_id = %request_id, "connection not open, tool response not sent");
            return false;
        }
        if !lock(&self.shared.dispatcher).settle_tool_call(request_id, &request.tool_call_id) {
            warn!(
                request_id = %request_id,
                tool_call_id = %request.tool_call_id,
                "no outstanding tool call for response"
            );
            return false;
        }
        let frame = self
            .shared
            .frames
            .tool_response(request_id.to_string(), request, decision);
        self.shared.send_frame(&frame)
    }

    /// Asks the server to stop the given turn. Advisory: frames for the
    /// turn may keep arriving until it confirms.
    pub fn interrupt(&self, request_id: &str) -> bool {
        let frame = self.shared.frames.interrupt(request_id.to_string());
        self.shared.send_frame(&frame)
    }

    /// Closes the transport. Idempotent.
    pub async fn disconnect(&self) {
        let Some(link) = self.shared.take_link() else {
            return;
        };
        if let Some(heartbeat) = link.heartbeat {
            heartbeat.abort();
        }
        link.reader.abort();
        // The writer flushes the close frame, then exits when the queue closes.
        let _ = link.outbound.send(Message::Close(None));
        drop(link.outbound);

        self.shared.set_state(ConnectionState::Disconnected);
        info!(session_code = %self.info.session_code, "chat socket closed by client");
        self.shared
            .emit(SessionEvent::Disconnected {
                reason: Some("closed by client".to_string()),
            })
            .await;
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        if let Some(link) = self.shared.take_link() {
            link.abort_all();
        }
    }
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(err) = sink.send(message).await {
            warn!(error = %err, "chat socket write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(mut stream: SplitStream<WsStream>, shared: Arc<Shared>, ready: oneshot::Receiver<()>) {
    let _ = ready.await;

    let reason = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                for event in shared.dispatch_text(text.as_str()) {
                    shared.emit(event).await;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|f| f.reason.as_str().to_string())
                    .filter(|reason| !reason.is_empty());
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                warn!(error = %err, "chat socket read failed");
                shared
                    .emit(SessionEvent::error(ErrorKind::Transport, err.to_string()))
                    .await;
                break Some(err.to_string());
            }
            None => break None,
        }
    };

    // Disconnect may have raced us; whoever takes the link reports the close.
    if let Some(link) = shared.take_link() {
        if let Some(heartbeat) = link.heartbeat {
            heartbeat.abort();
        }
        drop(link.outbound);
        shared.set_state(ConnectionState::Disconnected);
        info!(reason = ?reason, "chat socket closed by server");
        shared.emit(SessionEvent::Disconnected { reason }).await;
    }
}

async fn heartbeat_loop(shared: Arc<Shared>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let frame = shared.frames.ping(shared.ids.next_id());
        if !shared.send_frame(&frame) {
            break;
        }
    }
}
