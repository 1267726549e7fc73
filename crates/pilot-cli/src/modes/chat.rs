//! Line-based chat: stdin in, agent text on stdout, status on stderr.
//!
//! Lines starting with `:` are local commands (`:quit`, `:undo`, `:redo`,
//! `:interrupt`, `:history`). Everything else, slash commands included,
//! goes to the agent.

use std::collections::VecDeque;
use std::io::{BufRead, Stderr, Stdout, Write, stderr, stdout};
use std::sync::Arc;

use anyhow::{Context, Result};
use pilot_core::config::Config;
use pilot_core::core::events::SessionEvent;
use pilot_core::core::history::HistoryStack;
use pilot_core::core::interrupt;
use pilot_core::core::session::{AgentSession, SessionInfo};
use pilot_core::editor::bridge::changed_document;
use pilot_core::editor::rpc::PushRx;
use pilot_core::editor::{EditorBridge, EditorMessage, RpcChannel, WsEditorPort};
use pilot_core::protocol::{AgentPromptType, ToolCallRequestData, UserInput};
use pilot_core::state::StateStore;
use pilot_core::tools::broker::{ApprovalFuture, Approver, AutoApprove, ToolBroker};
use pilot_core::tools::editor::{EditorToolSet, TOOL_SET_ID};
use pilot_core::tools::{ToolRegistry, ToolSet};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub session_code: String,
    /// Falls back to the saved agent selection.
    pub agent_code: Option<String>,
    pub token: String,
    pub auto_approve: bool,
}

/// A line typed by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LineCommand {
    Empty,
    Quit,
    Undo,
    Redo,
    Interrupt,
    History,
    Message(String),
}

fn parse_line(line: &str) -> LineCommand {
    let trimmed = line.trim();
    match trimmed {
        "" => LineCommand::Empty,
        ":quit" | ":q" => LineCommand::Quit,
        ":undo" => LineCommand::Undo,
        ":redo" => LineCommand::Redo,
        ":interrupt" => LineCommand::Interrupt,
        ":history" => LineCommand::History,
        _ => LineCommand::Message(trimmed.to_string()),
    }
}

fn is_yes(line: &str) -> bool {
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// A yes/no question waiting for the next stdin line.
struct ApprovalRequest {
    question: String,
    reply: oneshot::Sender<bool>,
}

/// Sends approval questions to the chat loop, which owns stdin.
struct StdinApprover {
    tx: mpsc::UnboundedSender<ApprovalRequest>,
}

impl Approver for StdinApprover {
    fn approve<'a>(
        &'a self,
        _request_id: &'a str,
        request: &'a ToolCallRequestData,
    ) -> ApprovalFuture<'a> {
        Box::pin(async move {
            let (reply, answer) = oneshot::channel();
            let question = format!(
                "Allow tool {} with {}? [y/N]",
                request.tool_name,
                if request.tool_args.trim().is_empty() {
                    "no arguments"
                } else {
                    request.tool_args.as_str()
                }
            );
            if self.tx.send(ApprovalRequest { question, reply }).is_err() {
                return false;
            }
            answer.await.unwrap_or(false)
        })
    }
}

/// Renders session events.
///
/// # Output contract
/// - `StreamPartial` and `StreamSpan` → stdout
/// - everything else → stderr
pub struct ChatRenderer<O: Write, E: Write> {
    out: O,
    err: E,
    /// Text of the open span already written to `out`.
    printed: String,
}

impl ChatRenderer<Stdout, Stderr> {
    pub fn stdio() -> Self {
        Self::new(stdout(), stderr())
    }
}

impl<O: Write, E: Write> ChatRenderer<O, E> {
    pub fn new(out: O, err: E) -> Self {
        Self {
            out,
            err,
            printed: String::new(),
        }
    }

    pub fn handle_event(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Connected => self.status("Connected."),
            SessionEvent::Prompt { message, .. } => self.status(message),
            SessionEvent::StreamPartial { text, .. } => self.write_text(text),
            SessionEvent::StreamSpan { text, .. } => {
                self.write_text(text);
                self.finish_line();
            }
            SessionEvent::TurnCompleted { usage, .. } => {
                self.finish_line();
                match usage.total_tokens {
                    Some(total) => self.status(&format!("Done ({total} tokens).")),
                    None => self.status("Done."),
                }
            }
            SessionEvent::UsageUpdate { .. } => {}
            SessionEvent::ToolCallRequested { request, .. } => {
                self.finish_line();
                self.status(&format!("Tool requested: {}", request.tool_name));
            }
            SessionEvent::Error { kind, message } => {
                self.finish_line();
                let _ = writeln!(self.err, "Error [{kind}]: {message}");
            }
            SessionEvent::Disconnected { reason } => {
                self.finish_line();
                match reason {
                    Some(reason) => self.status(&format!("Disconnected: {reason}")),
                    None => self.status("Disconnected."),
                }
            }
        }
    }

    pub fn status(&mut self, message: &str) {
        let _ = writeln!(self.err, "· {message}");
        let _ = self.err.flush();
    }

    /// Writes the part of `text` not yet shown. A partial that does not
    /// extend what was printed starts a fresh line.
    fn write_text(&mut self, text: &str) {
        if let Some(rest) = text.strip_prefix(self.printed.as_str()) {
            let _ = write!(self.out, "{rest}");
        } else {
            let _ = writeln!(self.out);
            let _ = write!(self.out, "{text}");
        }
        let _ = self.out.flush();
        self.printed = text.to_string();
    }

    fn finish_line(&mut self) {
        if !self.printed.is_empty() {
            let _ = writeln!(self.out);
            let _ = self.out.flush();
            self.printed.clear();
        }
    }
}

/// Editor connection pieces owned by the chat loop.
struct EditorLink {
    bridge: EditorBridge,
    pushes: PushRx,
    pump: JoinHandle<()>,
}

async fn connect_editor(config: &Config) -> Result<Option<EditorLink>> {
    let Some(raw) = config
        .editor
        .url
        .as_deref()
        .filter(|url| !url.trim().is_empty())
    else {
        return Ok(None);
    };
    let url = Url::parse(raw).with_context(|| format!("Invalid editor url: {raw}"))?;
    let (port, inbound) = WsEditorPort::connect(&url).await?;
    let (rpc, pushes) = RpcChannel::new(Arc::new(port));
    let rpc = Arc::new(rpc);
    let pump = tokio::spawn({
        let rpc = Arc::clone(&rpc);
        async move { rpc.pump(inbound).await }
    });
    match EditorBridge::from_config(rpc, &config.editor) {
        Ok(bridge) => Ok(Some(EditorLink {
            bridge,
            pushes,
            pump,
        })),
        Err(err) => {
            pump.abort();
            Err(err)
        }
    }
}

async fn next_push(pushes: Option<&mut PushRx>) -> Option<EditorMessage> {
    match pushes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Reads stdin on a plain thread so a pending read never holds up runtime
/// shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Sends a history snapshot to the editor. On failure the apply guard is
/// dropped so the next real change is recorded.
async fn apply_snapshot(
    bridge: &EditorBridge,
    history: &mut HistoryStack,
    snapshot: &str,
) -> Result<()> {
    let result = async {
        let document: Value =
            serde_json::from_str(snapshot).context("History entry is not valid JSON")?;
        bridge.set_document(document).await
    }
    .await;
    if result.is_err() {
        history.acknowledge_applied();
    }
    result
}

/// Runs an interactive chat until `:quit`, end of input, or disconnect.
///
/// # Errors
/// Returns an error if the session cannot connect, or
/// [`interrupt::InterruptedError`] if Ctrl+C is pressed with no turn running.
pub async fn run_chat(config: &Config, options: ChatOptions) -> Result<()> {
    let store = StateStore::open_default();
    let state = store.load();
    let agent_code = options
        .agent_code
        .filter(|code| !code.trim().is_empty())
        .or(state.selected_agent_code);

    let session = Arc::new(AgentSession::from_config(
        config,
        SessionInfo {
            session_code: options.session_code,
            agent_code,
            token: options.token,
        },
    )?);
    let mut events = session.subscribe();
    let mut renderer = ChatRenderer::stdio();

    let mut history = config.history.stack();
    let mut editor = match connect_editor(config).await {
        Ok(link) => link,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "editor unavailable, continuing without it");
            renderer.status(&format!("Editor unavailable: {err:#}"));
            None
        }
    };

    let mut registry = ToolRegistry::new();
    let mut editor_tools = None;
    if let Some(link) = &editor {
        match link.bridge.fetch_document().await {
            Ok(document) => {
                history.push(document);
            }
            Err(err) => warn!(error = %format!("{err:#}"), "could not seed history"),
        }
        let tools = Arc::new(EditorToolSet::new(link.bridge.clone()));
        registry.register(Arc::clone(&tools) as Arc<dyn ToolSet>);
        editor_tools = Some(tools);
    }

    let (approval_tx, mut approval_rx) = mpsc::unbounded_channel();
    let approver: Arc<dyn Approver> = if options.auto_approve {
        Arc::new(AutoApprove)
    } else {
        Arc::new(StdinApprover { tx: approval_tx })
    };
    let broker = Arc::new(ToolBroker::new(registry, state.tool_config, approver));

    session.connect().await?;
    info!(
        session_code = %session.info().session_code,
        tool_sets = ?broker.tool_set_ids(),
        "chat started"
    );

    let mut lines = spawn_stdin_reader();
    let mut approvals: VecDeque<ApprovalRequest> = VecDeque::new();
    let mut current_turn: Option<String> = None;
    let mut interrupted = false;

    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else { break };
                if let Some(request) = approvals.pop_front() {
                    let _ = request.reply.send(is_yes(&line));
                    if let Some(next) = approvals.front() {
                        renderer.status(&next.question);
                    }
                    continue;
                }
                match parse_line(&line) {
                    LineCommand::Empty => {}
                    LineCommand::Quit => break,
                    command @ (LineCommand::Undo | LineCommand::Redo) => {
                        let undo = command == LineCommand::Undo;
                        let Some(link) = &editor else {
                            renderer.status("No editor connected.");
                            continue;
                        };
                        let snapshot = if undo { history.undo() } else { history.redo() };
                        match snapshot {
                            Some(snapshot) => {
                                if let Err(err) = apply_snapshot(&link.bridge, &mut history, &snapshot).await {
                                    renderer.status(&format!("Could not apply: {err:#}"));
                                }
                            }
                            None => renderer.status(if undo { "Nothing to undo." } else { "Nothing to redo." }),
                        }
                    }
                    LineCommand::Interrupt => match &current_turn {
                        Some(id) => {
                            session.interrupt(id);
                        }
                        None => renderer.status("No turn running."),
                    },
                    LineCommand::History => {
                        let info = history.info();
                        renderer.status(&format!(
                            "History: {} entries, undo {}, redo {}",
                            info.len,
                            if info.can_undo { "available" } else { "empty" },
                            if info.can_redo { "available" } else { "empty" },
                        ));
                    }
                    LineCommand::Message(text) => {
                        let workflow = match &editor {
                            Some(link) if link.bridge.is_ready() => {
                                match link.bridge.fetch_document().await {
                                    Ok(document) => Some(document),
                                    Err(err) => {
                                        debug!(error = %format!("{err:#}"), "using last known workflow");
                                        history.current().map(str::to_string)
                                    }
                                }
                            }
                            Some(_) => history.current().map(str::to_string),
                            None => None,
                        };
                        let input = UserInput::new(text)
                            .with_tool_schemas(broker.enabled_schemas())
                            .with_workflow_content(workflow);
                        match session.send_user_input(input) {
                            Some(request_id) => current_turn = Some(request_id),
                            None => renderer.status("Not connected; message dropped."),
                        }
                    }
                }
            }

            event = events.recv() => {
                let Some(event) = event else { break };
                renderer.handle_event(&event);
                match &*event {
                    SessionEvent::ToolCallRequested { request_id, request } => {
                        let session = Arc::clone(&session);
                        let broker = Arc::clone(&broker);
                        let request_id = request_id.clone();
                        let request = request.clone();
                        tokio::spawn(async move {
                            let decision = broker.resolve(&request_id, &request).await;
                            if !session.send_tool_response(&request_id, &request, decision) {
                                warn!(request_id = %request_id, "tool response not delivered");
                            }
                        });
                    }
                    SessionEvent::TurnCompleted { request_id, .. }
                        if current_turn.as_deref() == Some(request_id.as_str()) =>
                    {
                        current_turn = None;
                    }
                    SessionEvent::Prompt { request_id, prompt_type: AgentPromptType::Interrupted, .. }
                        if current_turn.as_deref() == Some(request_id.as_str()) =>
                    {
                        current_turn = None;
                    }
                    SessionEvent::Disconnected { .. } => break,
                    _ => {}
                }
            }

            Some(request) = approval_rx.recv() => {
                if approvals.is_empty() {
                    renderer.status(&request.question);
                }
                approvals.push_back(request);
            }

            push = next_push(editor.as_mut().map(|link| &mut link.pushes)) => {
                match push {
                    Some(message) => {
                        if let Some(document) = changed_document(&message)
                            && history.record_change(&document)
                        {
                            debug!(entries = history.len(), "recorded editor change");
                        }
                    }
                    None => {
                        warn!("editor connection closed");
                        renderer.status("Editor disconnected.");
                        broker.unregister(TOOL_SET_ID);
                        if let Some(link) = editor.take() {
                            link.pump.abort();
                        }
                    }
                }
            }

            () = interrupt::wait_for_interrupt() => {
                interrupt::reset();
                match current_turn.as_deref() {
                    Some(id) => {
                        if session.interrupt(id) {
                            renderer.status("Interrupt requested.");
                        }
                    }
                    None => {
                        interrupted = true;
                        break;
                    }
                }
            }
        }
    }

    for request in approvals.drain(..) {
        let _ = request.reply.send(false);
    }
    if let Some(tools) = editor_tools {
        tools.cancel_token().cancel();
    }
    if let Some(link) = editor.take() {
        link.pump.abort();
    }
    session.disconnect().await;

    if interrupted {
        return Err(interrupt::InterruptedError.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pilot_core::core::events::ErrorKind;
    use pilot_core::protocol::TokenUsage;

    use super::*;

    fn render(events: &[SessionEvent]) -> (String, String) {
        let mut renderer = ChatRenderer::new(Vec::new(), Vec::new());
        for event in events {
            renderer.handle_event(event);
        }
        (
            String::from_utf8(renderer.out).unwrap(),
            String::from_utf8(renderer.err).unwrap(),
        )
    }

    fn partial(text: &str) -> SessionEvent {
        SessionEvent::StreamPartial {
            request_id: "1".to_string(),
            text: text.to_string(),
        }
    }

    fn span(text: &str) -> SessionEvent {
        SessionEvent::StreamSpan {
            request_id: "1".to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn test_partials_then_span_print_once() {
        let (out, _) = render(&[partial("hel"), partial("hello"), span("hello world")]);
        assert_eq!(out, "hello world\n");
    }

    #[test]
    fn test_diverging_partial_starts_new_line() {
        let (out, _) = render(&[partial("abc"), partial("xyz"), span("xyz")]);
        assert_eq!(out, "abc\nxyz\n");
    }

    #[test]
    fn test_status_goes_to_stderr() {
        let (out, err) = render(&[
            SessionEvent::Connected,
            SessionEvent::error(ErrorKind::Parse, "bad frame"),
            SessionEvent::TurnCompleted {
                request_id: "1".to_string(),
                usage: TokenUsage {
                    total_tokens: Some(42),
                    ..TokenUsage::default()
                },
            },
        ]);
        assert!(out.is_empty());
        assert!(err.contains("Connected."));
        assert!(err.contains("Error [parse]: bad frame"));
        assert!(err.contains("Done (42 tokens)."));
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("  "), LineCommand::Empty);
        assert_eq!(parse_line(":q"), LineCommand::Quit);
        assert_eq!(parse_line(":undo"), LineCommand::Undo);
        assert_eq!(
            parse_line(" /clear "),
            LineCommand::Message("/clear".to_string())
        );
    }

    #[test]
    fn test_is_yes() {
        assert!(is_yes("Y"));
        assert!(is_yes(" yes "));
        assert!(!is_yes(""));
        assert!(!is_yes("nope"));
    }

    #[tokio::test]
    async fn test_stdin_approver_forwards_question() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let approver = StdinApprover { tx };
        let request = ToolCallRequestData {
            tool_call_id: "c1".to_string(),
            tool_name: "get_workflow".to_string(),
            tool_args: String::new(),
            is_client_tool: true,
            is_mcp_tool: false,
        };

        let answer = tokio::spawn(async move {
            let pending: ApprovalRequest = rx.recv().await.unwrap();
            assert!(pending.question.contains("get_workflow"));
            pending.reply.send(true).unwrap();
        });
        assert!(approver.approve("r1", &request).await);
        answer.await.unwrap();
    }

    #[tokio::test]
    async fn test_stdin_approver_denies_when_loop_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let approver = StdinApprover { tx };
        let request = ToolCallRequestData {
            tool_call_id: "c1".to_string(),
            tool_name: "x".to_string(),
            tool_args: "{}".to_string(),
            is_client_tool: false,
            is_mcp_tool: false,
        };
        assert!(!approver.approve("r1", &request).await);
    }
}
