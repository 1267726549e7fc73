//! Core module: UI-agnostic session runtime.
//!
//! This module contains:
//! - `dispatch`: Inbound frame dispatch into session events
//! - `events`: Session event types for rendering
//! - `history`: Undo/redo over editor documents
//! - `interrupt`: Ctrl+C handling for interactive sessions
//! - `session`: Agent chat session over a WebSocket

pub mod dispatch;
pub mod events;
pub mod history;
pub mod interrupt;
pub mod session;
