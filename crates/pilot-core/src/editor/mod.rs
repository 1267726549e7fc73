//! Embedded editor integration.
//!
//! - `rpc`: request/response over one-way messages
//! - `port`: in-process and WebSocket transports
//! - `bridge`: typed document and run operations
//! - `poll`: bounded polling of run status

pub mod bridge;
pub mod poll;
pub mod port;
pub mod rpc;

pub use bridge::{EditorBridge, ExecutionReport, ExecutionStatus};
pub use port::{ChannelPort, EditorEnd, WsEditorPort};
pub use rpc::{EditorMessage, EditorPort, RpcChannel, RpcError, SourceId};
