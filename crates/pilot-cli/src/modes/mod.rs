//! Runtime execution modes.
//!
//! - `chat`: line-based interactive session (stdout/stderr)

pub mod chat;
