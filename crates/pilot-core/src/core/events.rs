//! Session event types.
//!
//! This module defines the contract between a chat session and whatever
//! renders it. Events are serializable so a front end can forward them as
//! JSON lines.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::protocol::{AgentPromptType, TokenUsage, ToolCallRequestData};

/// Events emitted by a session while it is connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Transport is open; sends are accepted from now on.
    Connected,

    /// Status narration for a turn (not content).
    Prompt {
        request_id: String,
        prompt_type: AgentPromptType,
        /// Server message, or the prompt type's default.
        message: String,
    },

    /// Accumulated text of a span that has not closed yet.
    /// Best-effort: may be dropped for slow subscribers.
    StreamPartial { request_id: String, text: String },

    /// A complete span extracted from the agent's output.
    StreamSpan { request_id: String, text: String },

    /// The turn finished.
    TurnCompleted { request_id: String, usage: TokenUsage },

    /// Token usage update outside of completion.
    UsageUpdate { request_id: String, usage: TokenUsage },

    /// The agent wants a tool to run. Answer with `AgentSession::send_tool_response`.
    ToolCallRequested {
        request_id: String,
        request: ToolCallRequestData,
    },

    /// A failure that did not end the session by itself.
    Error {
        /// Error category for structured handling
        kind: ErrorKind,
        /// One-line summary
        message: String,
    },

    /// Transport closed. Terminal for this connection.
    Disconnected {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl SessionEvent {
    /// High-volume events that subscribers can afford to miss.
    pub fn is_delta(&self) -> bool {
        matches!(self, SessionEvent::StreamPartial { .. })
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        SessionEvent::Error {
            kind,
            message: message.into(),
        }
    }
}

/// Error categories for `SessionEvent::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Could not open the transport
    Connect,
    /// Transport failed after opening
    Transport,
    /// Inbound frame was not valid
    Parse,
    /// Frame was valid but broke a protocol rule
    Protocol,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Connect => write!(f, "connect"),
            ErrorKind::Transport => write!(f, "transport"),
            ErrorKind::Parse => write!(f, "parse"),
            ErrorKind::Protocol => write!(f, "protocol"),
        }
    }
}

pub type SessionEventTx = mpsc::Sender<Arc<SessionEvent>>;
pub type SessionEventRx = mpsc::Receiver<Arc<SessionEvent>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = SessionEvent::StreamSpan {
            request_id: "1".to_string(),
            text: "hi".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stream_span");
        assert_eq!(json["request_id"], "1");
    }

    #[test]
    fn test_only_partials_are_deltas() {
        assert!(
            SessionEvent::StreamPartial {
                request_id: "1".into(),
                text: String::new()
            }
            .is_delta()
        );
        assert!(!SessionEvent::Connected.is_delta());
        assert!(!SessionEvent::error(ErrorKind::Parse, "x").is_delta());
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::Transport.to_string(), "transport");
    }
}
