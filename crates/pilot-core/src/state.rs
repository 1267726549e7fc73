//! Persisted client state (`${PILOT_HOME}/state.json`).
//!
//! Survives restarts: the selected service and agent, the recently used
//! services, and the tool configuration. A file that cannot be read or
//! parsed is replaced by defaults rather than failing startup.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{paths, write_atomic};
use crate::tools::broker::ToolConfigDocument;

pub const MAX_RECENT_SERVICES: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedState {
    pub selected_service_id: Option<String>,
    pub recent_service_ids: Vec<String>,
    pub selected_agent_code: Option<String>,
    pub tool_config: ToolConfigDocument,
}

impl PersistedState {
    /// Selects a service and moves it to the front of the recent list.
    pub fn select_service(&mut self, id: &str) {
        self.selected_service_id = Some(id.to_string());
        self.recent_service_ids.retain(|recent| recent != id);
        self.recent_service_ids.insert(0, id.to_string());
        self.recent_service_ids.truncate(MAX_RECENT_SERVICES);
    }

    /// Selects an agent. An empty code clears the selection.
    pub fn select_agent(&mut self, code: &str) {
        let code = code.trim();
        self.selected_agent_code = (!code.is_empty()).then(|| code.to_string());
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the default location under `PILOT_HOME`.
    pub fn open_default() -> Self {
        Self::new(paths::state_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the state, falling back to defaults on any problem.
    pub fn load(&self) -> PersistedState {
        if !self.path.exists() {
            return PersistedState::default();
        }
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to read state, using defaults");
                return PersistedState::default();
            }
        };
        let mut state: PersistedState = match serde_json::from_str(&contents) {
            Ok(state) => state,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to parse state, using defaults");
                return PersistedState::default();
            }
        };
        if !state.tool_config.is_current() {
            warn!(
                version = %state.tool_config.version,
                "tool config version mismatch, using defaults"
            );
            state.tool_config = ToolConfigDocument::default();
        }
        state.recent_service_ids.truncate(MAX_RECENT_SERVICES);
        state
    }

    /// Writes the state atomically.
    ///
    /// # Errors
    /// Returns an error if the state cannot be encoded or written.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let json = serde_json::to_string_pretty(state).context("Failed to encode state")?;
        write_atomic(&self.path, &json)
            .with_context(|| format!("Failed to save state to {}", self.path.display()))
    }

    /// Loads, applies `f`, and saves.
    ///
    /// # Errors
    /// Returns an error if saving fails.
    pub fn update<F>(&self, f: F) -> Result<PersistedState>
    where
        F: FnOnce(&mut PersistedState),
    {
        let mut state = self.load();
        f(&mut state);
        self.save(&state)?;
        Ok(state)
    }
}
