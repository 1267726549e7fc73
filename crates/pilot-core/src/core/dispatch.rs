//! Inbound frame dispatch.
//!
//! Turns raw socket text into [`SessionEvent`]s. Kept free of I/O so the
//! whole dispatch table can be driven synchronously in tests; the session
//! owns one dispatcher behind a lock and feeds it in transport order.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, warn};

use crate::core::events::{ErrorKind, SessionEvent};
use crate::protocol::{AgentPromptType, InboundFrame, StreamMarkers, TagStreamParser};

/// Ended turns remembered so late stream frames can be dropped.
const FINISHED_TURNS_CAP: usize = 64;

/// Correlation key of one tool call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ToolCallKey {
    request_id: String,
    tool_call_id: String,
}

#[derive(Debug, Clone)]
pub struct FrameDispatcher {
    markers: StreamMarkers,
    stream_partials: bool,
    /// One parser per live turn, keyed by request id.
    turns: HashMap<String, TagStreamParser>,
    /// Most recently ended turns, oldest first.
    finished: VecDeque<String>,
    /// Tool calls received and not yet answered.
    outstanding: HashSet<ToolCallKey>,
}

impl FrameDispatcher {
    pub fn new(markers: StreamMarkers, stream_partials: bool) -> Self {
        Self {
            markers,
            stream_partials,
            turns: HashMap::new(),
            finished: VecDeque::new(),
            outstanding: HashSet::new(),
        }
    }

    /// Parses and dispatches one text frame.
    ///
    /// Malformed frames never fail the session; they are logged and
    /// reported as a `Parse` error event.
    pub fn handle_text(&mut self, text: &str) -> Vec<SessionEvent> {
        match InboundFrame::parse(text) {
            Ok(frame) => self.dispatch(frame),
            Err(err) => {
                warn!(error = %err, "dropping inbound frame");
                vec![SessionEvent::error(ErrorKind::Parse, err.to_string())]
            }
        }
    }

    pub fn dispatch(&mut self, frame: InboundFrame) -> Vec<SessionEvent> {
        match frame {
            InboundFrame::Prompt { request_id, data } => {
                if data.prompt_type == AgentPromptType::Interrupted {
                    self.finish_turn(&request_id);
                }
                let message = data.display_message().to_string();
                vec![SessionEvent::Prompt {
                    request_id,
                    prompt_type: data.prompt_type,
                    message,
                }]
            }
            InboundFrame::Stream {
                request_id,
                content,
            } => self.on_stream(request_id, &content),
            InboundFrame::Complete { request_id, usage } => {
                self.finish_turn(&request_id);
                vec![SessionEvent::TurnCompleted { request_id, usage }]
            }
            InboundFrame::TokenUsage { request_id, usage } => {
                vec![SessionEvent::UsageUpdate { request_id, usage }]
            }
            InboundFrame::ToolCallRequest { request_id, data } => {
                let key = ToolCallKey {
                    request_id: request_id.clone(),
                    tool_call_id: data.tool_call_id.clone(),
                };
                if !self.outstanding.insert(key) {
                    warn!(
                        request_id = %request_id,
                        tool_call_id = %data.tool_call_id,
                        "duplicate tool call request ignored"
                    );
                    return Vec::new();
                }
                vec![SessionEvent::ToolCallRequested {
                    request_id,
                    request: data,
                }]
            }
            InboundFrame::Pong => Vec::new(),
            InboundFrame::Unknown { kind } => {
                warn!(kind = %kind, "ignoring unhandled frame type");
                Vec::new()
            }
        }
    }

    fn finish_turn(&mut self, request_id: &str) {
        self.turns.remove(request_id);
        if self.finished.iter().any(|id| id == request_id) {
            return;
        }
        self.finished.push_back(request_id.to_string());
        if self.finished.len() > FINISHED_TURNS_CAP {
            self.finished.pop_front();
        }
    }

    fn on_stream(&mut self, request_id: String, content: &str) -> Vec<SessionEvent> {
        if self.finished.iter().any(|id| *id == request_id) {
            debug!(request_id = %request_id, "dropping stream frame for ended turn");
            return Vec::new();
        }
        let parser = self
            .turns
            .entry(request_id.clone())
            .or_insert_with(|| TagStreamParser::new(self.markers.clone()));

        let mut events: Vec<SessionEvent> = parser
            .append(content)
            .into_iter()
            .map(|text| SessionEvent::StreamSpan {
                request_id: request_id.clone(),
                text,
            })
            .collect();

        if self.stream_partials && parser.is_in_span() && !parser.current_content().is_empty() {
            events.push(SessionEvent::StreamPartial {
                text: parser.current_content().to_string(),
                request_id,
            });
        }
        events
    }

    /// Marks a tool call as answered.
    ///
    /// Returns `false` if the call was never received or already answered.
    pub fn settle_tool_call(&mut self, request_id: &str, tool_call_id: &str) -> bool {
        self.outstanding.remove(&ToolCallKey {
            request_id: request_id.to_string(),
            tool_call_id: tool_call_id.to_string(),
        })
    }

    pub fn outstanding_tool_calls(&self) -> usize {
        self.outstanding.len()
    }

    pub fn live_turns(&self) -> usize {
        self.turns.len()
    }

    /// Drops all per-connection state.
    pub fn reset(&mut self) {
        self.turns.clear();
        self.finished.clear();
        self.outstanding.clear();
    }
}

impl Default for FrameDispatcher {
    fn default() -> Self {
        Self::new(StreamMarkers::default(), true)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn frame(kind: &str, request_id: &str, content: Option<&str>, data: serde_json::Value) -> String {
        let mut value = json!({
            "type": kind,
            "sessionCode": "s",
            "requestId": request_id,
            "timestamp": 1,
        });
        if let Some(content) = content {
            value["content"] = json!(content);
        }
        if !data.is_null() {
            value["data"] = data;
        }
        value.to_string()
    }

    fn x_dispatcher(partials: bool) -> FrameDispatcher {
        FrameDispatcher::new(StreamMarkers::new("<X>", "</X>").unwrap(), partials)
    }

    /// Prompt, two stream chunks, completion: one prompt then one span.
    #[test]
    fn test_turn_end_to_end() {
        let mut dispatcher = x_dispatcher(false);
        let frames = [
            frame("AGENT_PROMPT", "t1", None, json!({ "promptType": "THINKING" })),
            frame("AGENT_STREAM", "t1", Some("<X>partial"), json!(null)),
            frame("AGENT_STREAM", "t1", Some(" more</X>"), json!(null)),
            frame("AGENT_COMPLETE", "t1", None, json!({ "totalTokens": 9 })),
        ];
        let events: Vec<SessionEvent> = frames
            .iter()
            .flat_map(|f| dispatcher.handle_text(f))
            .collect();

        assert_eq!(events.len(), 3);
        assert!(matches!(
            &events[0],
            SessionEvent::Prompt { prompt_type: AgentPromptType::Thinking, .. }
        ));
        assert_eq!(
            events[1],
            SessionEvent::StreamSpan {
                request_id: "t1".to_string(),
                text: "partial more".to_string()
            }
        );
        let SessionEvent::TurnCompleted { usage, .. } = &events[2] else {
            panic!("expected completion");
        };
        assert_eq!(usage.total_tokens, Some(9));
        assert_eq!(dispatcher.live_turns(), 0);
    }

    #[test]
    fn test_partials_follow_open_span() {
        let mut dispatcher = x_dispatcher(true);
        let events = dispatcher.handle_text(&frame("AGENT_STREAM", "t", Some("<X>hello wor"), json!(null)));
        assert_eq!(
            events,
            vec![SessionEvent::StreamPartial {
                request_id: "t".to_string(),
                text: "hello ".to_string()
            }]
        );
    }

    #[test]
    fn test_turns_are_parsed_independently() {
        let mut dispatcher = x_dispatcher(false);
        dispatcher.handle_text(&frame("AGENT_STREAM", "a", Some("<X>from a"), json!(null)));
        dispatcher.handle_text(&frame("AGENT_STREAM", "b", Some("<X>from b</X>"), json!(null)));
        let events = dispatcher.handle_text(&frame("AGENT_STREAM", "a", Some("</X>"), json!(null)));
        assert_eq!(
            events,
            vec![SessionEvent::StreamSpan {
                request_id: "a".to_string(),
                text: "from a".to_string()
            }]
        );
    }

    #[test]
    fn test_interrupted_prompt_drops_turn_parser() {
        let mut dispatcher = x_dispatcher(false);
        dispatcher.handle_text(&frame("AGENT_STREAM", "t", Some("<X>half"), json!(null)));
        assert_eq!(dispatcher.live_turns(), 1);
        dispatcher.handle_text(&frame("AGENT_PROMPT", "t", None, json!({ "promptType": "INTERRUPTED" })));
        assert_eq!(dispatcher.live_turns(), 0);
    }

    /// Stream frames that trail an ended turn neither surface nor leave a parser behind.
    #[test]
    fn test_late_stream_after_turn_end_is_dropped() {
        let mut dispatcher = x_dispatcher(true);
        dispatcher.handle_text(&frame("AGENT_STREAM", "t", Some("<X>half"), json!(null)));
        dispatcher.handle_text(&frame("AGENT_PROMPT", "t", None, json!({ "promptType": "INTERRUPTED" })));
        let late = dispatcher.handle_text(&frame("AGENT_STREAM", "t", Some("<X>more</X>"), json!(null)));
        assert!(late.is_empty());
        assert_eq!(dispatcher.live_turns(), 0);

        dispatcher.handle_text(&frame("AGENT_COMPLETE", "u", None, json!({})));
        assert!(
            dispatcher
                .handle_text(&frame("AGENT_STREAM", "u", Some("<X>x"), json!(null)))
                .is_empty()
        );
        assert_eq!(dispatcher.live_turns(), 0);

        // A fresh turn still streams.
        let fresh = dispatcher.handle_text(&frame("AGENT_STREAM", "v", Some("<X>ok</X>"), json!(null)));
        assert_eq!(fresh.len(), 1);
    }

    #[test]
    fn test_ended_turns_are_bounded() {
        let mut dispatcher = x_dispatcher(false);
        for i in 0..(FINISHED_TURNS_CAP + 10) {
            dispatcher.handle_text(&frame("AGENT_COMPLETE", &i.to_string(), None, json!({})));
        }
        assert_eq!(dispatcher.finished.len(), FINISHED_TURNS_CAP);
        // The oldest ids were forgotten.
        assert!(!dispatcher.finished.iter().any(|id| id == "0"));

        dispatcher.reset();
        assert!(dispatcher.finished.is_empty());
    }

    #[test]
    fn test_tool_calls_are_tracked_once() {
        let mut dispatcher = x_dispatcher(false);
        let request = frame(
            "AGENT_TOOL_CALL_REQUEST",
            "r",
            None,
            json!({ "toolCallId": "c1", "toolName": "get_workflow", "toolArgs": "{}", "isClientTool": true, "isMcpTool": false }),
        );
        assert_eq!(dispatcher.handle_text(&request).len(), 1);
        assert!(dispatcher.handle_text(&request).is_empty());
        assert_eq!(dispatcher.outstanding_tool_calls(), 1);

        assert!(dispatcher.settle_tool_call("r", "c1"));
        assert!(!dispatcher.settle_tool_call("r", "c1"));
        assert!(!dispatcher.settle_tool_call("other", "c1"));
    }

    #[test]
    fn test_malformed_frame_reports_parse_error() {
        let mut dispatcher = x_dispatcher(false);
        let events = dispatcher.handle_text("{oops");
        assert!(matches!(
            events.as_slice(),
            [SessionEvent::Error { kind: ErrorKind::Parse, .. }]
        ));
    }

    #[test]
    fn test_pong_and_unknown_are_silent() {
        let mut dispatcher = x_dispatcher(false);
        assert!(dispatcher.handle_text(&frame("PONG", "1", None, json!(null))).is_empty());
        assert!(dispatcher.handle_text(&frame("AGENT_FUTURE", "1", None, json!({}))).is_empty());
    }
}
