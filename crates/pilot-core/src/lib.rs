//! Core Pilot library (agent session, editor bridge, tools, config).

pub mod config;
pub mod core;
pub mod editor;
pub mod logging;
pub mod protocol;
pub mod state;
pub mod tools;
