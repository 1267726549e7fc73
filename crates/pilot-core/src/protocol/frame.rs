//! Wire frames for the agent chat socket.
//!
//! Every frame, in both directions, is one JSON object:
//!
//! ```json
//! {"type":"USER_MESSAGE","sessionCode":"s1","requestId":"1737700000000",
//!  "content":"hi","data":{"type":"USER_MESSAGE"},"timestamp":1737700000000}
//! ```
//!
//! Outbound frames are built from typed payloads ([`FrameData`]) whose
//! `data.type` mirrors the envelope type. Inbound frames are decoded into
//! the closed [`InboundFrame`] union; types this client does not know land
//! in [`InboundFrame::Unknown`].

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::ToolSchema;

/// Frame type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    // client -> server
    UserMessage,
    UserOrder,
    AgentToolCallResponse,
    Interrupt,
    Ping,
    // server -> client
    AgentPrompt,
    AgentStream,
    AgentComplete,
    AgentTokenUsage,
    AgentToolCallRequest,
    Pong,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::UserMessage => "USER_MESSAGE",
            MessageType::UserOrder => "USER_ORDER",
            MessageType::AgentToolCallResponse => "AGENT_TOOL_CALL_RESPONSE",
            MessageType::Interrupt => "INTERRUPT",
            MessageType::Ping => "PING",
            MessageType::AgentPrompt => "AGENT_PROMPT",
            MessageType::AgentStream => "AGENT_STREAM",
            MessageType::AgentComplete => "AGENT_COMPLETE",
            MessageType::AgentTokenUsage => "AGENT_TOKEN_USAGE",
            MessageType::AgentToolCallRequest => "AGENT_TOOL_CALL_REQUEST",
            MessageType::Pong => "PONG",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ty = match s {
            "USER_MESSAGE" => MessageType::UserMessage,
            "USER_ORDER" => MessageType::UserOrder,
            "AGENT_TOOL_CALL_RESPONSE" => MessageType::AgentToolCallResponse,
            "INTERRUPT" => MessageType::Interrupt,
            "PING" => MessageType::Ping,
            "AGENT_PROMPT" => MessageType::AgentPrompt,
            "AGENT_STREAM" => MessageType::AgentStream,
            "AGENT_COMPLETE" => MessageType::AgentComplete,
            "AGENT_TOKEN_USAGE" => MessageType::AgentTokenUsage,
            "AGENT_TOOL_CALL_REQUEST" => MessageType::AgentToolCallRequest,
            "PONG" => MessageType::Pong,
            other => return Err(other.to_string()),
        };
        Ok(ty)
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// Outbound frame envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireFrame {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub session_code: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<FrameData>,
    pub timestamp: i64,
}

/// Typed outbound payload. The tag repeats the envelope type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameData {
    UserMessage(UserMessageData),
    UserOrder(UserOrderData),
    AgentToolCallResponse(ToolCallResponseData),
    Interrupt,
    Ping,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessageData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_schemas: Option<Vec<ToolSchema>>,
    /// Opaque MCP configuration document (JSON text).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multimodal_contents: Option<Vec<ChatContent>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_content: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOrderData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multimodal_contents: Option<Vec<ChatContent>>,
}

/// Tool-call response payload.
///
/// Only constructible through [`ToolCallResponseData::new`], which derives
/// `isAllow`/`success`/`result`/`error` from a [`ToolDecision`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResponseData {
    tool_call_id: String,
    tool_name: String,
    is_client_tool: bool,
    is_mcp_tool: bool,
    tool_args: String,
    is_allow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ToolCallResponseData {
    pub fn new(request: &ToolCallRequestData, decision: ToolDecision) -> Self {
        let (is_allow, result, success, error) = match decision {
            ToolDecision::Deny => (false, None, None, None),
            ToolDecision::Allow(None) => (true, None, None, None),
            ToolDecision::Allow(Some(ToolOutcome::Success(result))) => {
                (true, Some(result), Some(true), None)
            }
            ToolDecision::Allow(Some(ToolOutcome::Failure(error))) => {
                (true, None, Some(false), Some(error))
            }
        };

        Self {
            tool_call_id: request.tool_call_id.clone(),
            tool_name: request.tool_name.clone(),
            is_client_tool: request.is_client_tool,
            is_mcp_tool: request.is_mcp_tool,
            tool_args: request.tool_args.clone(),
            is_allow,
            result,
            success,
            error,
        }
    }

    pub fn tool_call_id(&self) -> &str {
        &self.tool_call_id
    }

    pub fn is_allow(&self) -> bool {
        self.is_allow
    }

    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn success(&self) -> Option<bool> {
        self.success
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// The client's answer to a tool-call request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolDecision {
    /// The user refused; nothing ran.
    Deny,
    /// Allowed. Server-side tools carry no outcome; client tools carry the
    /// result of running locally.
    Allow(Option<ToolOutcome>),
}

/// Outcome of running a client-side tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Success(String),
    Failure(String),
}

/// Multimodal attachment on user input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChatContent {
    Text { text: String },
    Image(MediaContent),
    Audio(MediaContent),
    Video(MediaContent),
    PdfFile(MediaContent),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaContent {
    pub is_use_base64: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl MediaContent {
    pub fn from_url(url: impl Into<String>, mime_type: Option<String>) -> Self {
        Self {
            is_use_base64: false,
            url: Some(url.into()),
            base64_data: None,
            mime_type,
        }
    }
}

/// User input as typed by the user, plus the context that rides along.
#[derive(Debug, Clone, Default)]
pub struct UserInput {
    pub content: String,
    pub multimodal: Vec<ChatContent>,
    pub tool_schemas: Vec<ToolSchema>,
    pub mcp_config: Option<String>,
    pub agent_code: Option<String>,
    pub workflow_content: Option<String>,
}

impl UserInput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    /// Slash-prefixed input is a command (`USER_ORDER`), everything else a message.
    pub fn is_command(&self) -> bool {
        self.content.trim().starts_with('/')
    }

    #[must_use]
    pub fn with_tool_schemas(mut self, schemas: Vec<ToolSchema>) -> Self {
        self.tool_schemas = schemas;
        self
    }

    #[must_use]
    pub fn with_agent_code(mut self, agent_code: Option<String>) -> Self {
        self.agent_code = agent_code;
        self
    }

    #[must_use]
    pub fn with_workflow_content(mut self, content: Option<String>) -> Self {
        self.workflow_content = content;
        self
    }

    #[must_use]
    pub fn with_mcp_config(mut self, config: Option<String>) -> Self {
        self.mcp_config = config;
        self
    }

    #[must_use]
    pub fn with_attachment(mut self, content: ChatContent) -> Self {
        self.multimodal.push(content);
        self
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}

/// Builds outbound frames for one session.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    session_code: String,
}

impl FrameBuilder {
    pub fn new(session_code: impl Into<String>) -> Self {
        Self {
            session_code: session_code.into(),
        }
    }

    pub fn session_code(&self) -> &str {
        &self.session_code
    }

    /// Builds a `USER_ORDER` or `USER_MESSAGE` frame depending on the input.
    pub fn user_input(&self, request_id: String, input: UserInput) -> WireFrame {
        if input.is_command() {
            let data = FrameData::UserOrder(UserOrderData {
                multimodal_contents: non_empty(input.multimodal),
            });
            return self.frame(MessageType::UserOrder, request_id, Some(input.content), data);
        }

        let data = FrameData::UserMessage(UserMessageData {
            tool_schemas: non_empty(input.tool_schemas),
            mcp_config: input.mcp_config,
            multimodal_contents: non_empty(input.multimodal),
            agent_code: input.agent_code,
            workflow_content: input.workflow_content,
        });
        self.frame(MessageType::UserMessage, request_id, Some(input.content), data)
    }

    pub fn tool_response(
        &self,
        request_id: String,
        request: &ToolCallRequestData,
        decision: ToolDecision,
    ) -> WireFrame {
        let data = FrameData::AgentToolCallResponse(ToolCallResponseData::new(request, decision));
        self.frame(MessageType::AgentToolCallResponse, request_id, None, data)
    }

    pub fn interrupt(&self, request_id: String) -> WireFrame {
        self.frame(MessageType::Interrupt, request_id, None, FrameData::Interrupt)
    }

    pub fn ping(&self, request_id: String) -> WireFrame {
        self.frame(MessageType::Ping, request_id, None, FrameData::Ping)
    }

    fn frame(
        &self,
        kind: MessageType,
        request_id: String,
        content: Option<String>,
        data: FrameData,
    ) -> WireFrame {
        WireFrame {
            kind,
            session_code: self.session_code.clone(),
            request_id,
            content,
            data: Some(data),
            timestamp: now_millis(),
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generates time-based request ids that never repeat within a process.
///
/// Ids are decimal millisecond timestamps; two calls in the same
/// millisecond get consecutive values.
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    last: AtomicI64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        let now = now_millis();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next.to_string(),
                Err(actual) => prev = actual,
            }
        }
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// Serde helper that reads a JSON `null` boolean as `false`.
pub(crate) mod null_as_false {
    use serde::{Deserialize, Deserializer};

    /// # Errors
    /// Returns an error if the value is neither a boolean nor null.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentPromptType {
    Started,
    Thinking,
    ToolCalling,
    ToolComplete,
    Summary,
    SummaryComplete,
    Interrupted,
    Complete,
    Error,
    #[serde(other)]
    Unknown,
}

impl AgentPromptType {
    pub fn default_message(self) -> &'static str {
        match self {
            AgentPromptType::Started => "Agent started",
            AgentPromptType::Thinking => "Agent is analyzing the problem...",
            AgentPromptType::ToolCalling => "Agent is calling a tool...",
            AgentPromptType::ToolComplete => "Tool call finished, continuing...",
            AgentPromptType::Summary => "Agent is writing a summary...",
            AgentPromptType::SummaryComplete => "Summary ready",
            AgentPromptType::Interrupted => "Execution interrupted",
            AgentPromptType::Complete => "Execution complete",
            AgentPromptType::Error => "An error occurred during execution",
            AgentPromptType::Unknown => "Agent status update",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPromptData {
    pub prompt_type: AgentPromptType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AgentPromptData {
    /// The server's message, or the type's default when absent or blank.
    pub fn display_message(&self) -> &str {
        self.message
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.prompt_type.default_message())
    }
}

/// Usage counters attached to `AGENT_COMPLETE` and `AGENT_TOKEN_USAGE`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenUsage {
    pub max_tokens: Option<u64>,
    pub max_messages: Option<u64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub message_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequestData {
    pub tool_call_id: String,
    pub tool_name: String,
    /// JSON-encoded arguments, passed through untouched.
    #[serde(default)]
    pub tool_args: String,
    #[serde(default, deserialize_with = "null_as_false::deserialize")]
    pub is_client_tool: bool,
    #[serde(default, deserialize_with = "null_as_false::deserialize")]
    pub is_mcp_tool: bool,
}

/// Raw envelope as received; `data` stays untyped until the type is known.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

/// Decoded server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Prompt {
        request_id: String,
        data: AgentPromptData,
    },
    Stream {
        request_id: String,
        content: String,
    },
    Complete {
        request_id: String,
        usage: TokenUsage,
    },
    TokenUsage {
        request_id: String,
        usage: TokenUsage,
    },
    ToolCallRequest {
        request_id: String,
        data: ToolCallRequestData,
    },
    Pong,
    /// A type this client does not handle (new server types, or client-only types echoed back).
    Unknown { kind: String },
}

/// Why an inbound frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Not a JSON object with a string `type`.
    Malformed(String),
    /// Known type, but its payload does not match.
    InvalidPayload { kind: MessageType, message: String },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Malformed(msg) => write!(f, "malformed frame: {msg}"),
            FrameError::InvalidPayload { kind, message } => {
                write!(f, "invalid {kind} payload: {message}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

impl InboundFrame {
    /// Decodes one text frame.
    ///
    /// # Errors
    /// Returns `FrameError` if the text is not a frame or a known type
    /// carries a payload of the wrong shape.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let raw: RawFrame =
            serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;

        let Ok(kind) = raw.kind.parse::<MessageType>() else {
            return Ok(InboundFrame::Unknown { kind: raw.kind });
        };
        let request_id = raw.request_id.unwrap_or_default();

        let frame = match kind {
            MessageType::AgentPrompt => InboundFrame::Prompt {
                request_id,
                data: typed_data(kind, raw.data)?,
            },
            MessageType::AgentStream => InboundFrame::Stream {
                request_id,
                content: raw.content.unwrap_or_default(),
            },
            MessageType::AgentComplete => InboundFrame::Complete {
                request_id,
                usage: optional_data(kind, raw.data)?,
            },
            MessageType::AgentTokenUsage => InboundFrame::TokenUsage {
                request_id,
                usage: optional_data(kind, raw.data)?,
            },
            MessageType::AgentToolCallRequest => InboundFrame::ToolCallRequest {
                request_id,
                data: typed_data(kind, raw.data)?,
            },
            MessageType::Pong => InboundFrame::Pong,
            MessageType::UserMessage
            | MessageType::UserOrder
            | MessageType::AgentToolCallResponse
            | MessageType::Interrupt
            | MessageType::Ping => InboundFrame::Unknown { kind: raw.kind },
        };
        Ok(frame)
    }
}

fn typed_data<T: serde::de::DeserializeOwned>(
    kind: MessageType,
    data: Option<Value>,
) -> Result<T, FrameError> {
    let data = data.ok_or_else(|| FrameError::InvalidPayload {
        kind,
        message: "missing data".to_string(),
    })?;
    serde_json::from_value(data).map_err(|e| FrameError::InvalidPayload {
        kind,
        message: e.to_string(),
    })
}

fn optional_data<T: serde::de::DeserializeOwned + Default>(
    kind: MessageType,
    data: Option<Value>,
) -> Result<T, FrameError> {
    match data {
        None | Some(Value::Null) => Ok(T::default()),
        Some(data) => typed_data(kind, Some(data)),
    }
}
