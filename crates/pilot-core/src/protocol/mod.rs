//! Chat socket protocol: frames, URL derivation, and span extraction.

pub mod endpoint;
pub mod frame;
pub mod stream_parser;

pub use frame::{
    AgentPromptData, AgentPromptType, ChatContent, FrameBuilder, FrameError, InboundFrame,
    MediaContent, MessageType, RequestIdGenerator, TokenUsage, ToolCallRequestData, ToolDecision,
    ToolOutcome, UserInput, WireFrame,
};
pub use stream_parser::{StreamMarkers, TagStreamParser};
