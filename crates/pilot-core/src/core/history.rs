//! Undo/redo over serialized editor documents.
//!
//! Applying a snapshot to the editor makes the editor report a document
//! change, and that change must not be recorded as a new entry. Each
//! undo/redo therefore raises a guard that swallows exactly one change
//! report (see [`HistoryStack::record_change`]). The guard also expires
//! after a debounce window in case the editor never reports back; the
//! window is a heuristic bounded by how slowly the editor renders, not a
//! correctness guarantee.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

pub const DEFAULT_MAX_ENTRIES: usize = 100;
pub const DEFAULT_APPLY_DEBOUNCE: Duration = Duration::from_millis(300);

/// Snapshot of stack state for display and debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HistoryInfo {
    pub len: usize,
    pub cursor: Option<usize>,
    pub can_undo: bool,
    pub can_redo: bool,
    pub applying: bool,
}

#[derive(Debug, Clone, Copy)]
struct ApplyGuard {
    until: Instant,
    /// Change reports still expected from applied snapshots.
    pending: usize,
}

#[derive(Debug, Clone)]
pub struct HistoryStack {
    entries: VecDeque<String>,
    /// Index of the entry currently shown. `None` iff `entries` is empty.
    cursor: Option<usize>,
    max_entries: usize,
    debounce: Duration,
    guard: Option<ApplyGuard>,
}

impl Default for HistoryStack {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_APPLY_DEBOUNCE)
    }
}

impl HistoryStack {
    /// `max_entries` of zero is treated as one.
    pub fn new(max_entries: usize, debounce: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            cursor: None,
            max_entries: max_entries.max(1),
            debounce,
            guard: None,
        }
    }

    /// Records a snapshot, discarding anything after the cursor.
    ///
    /// Ignored while a snapshot is being applied. Returns whether the
    /// snapshot was recorded.
    pub fn push(&mut self, content: impl Into<String>) -> bool {
        if self.is_applying() {
            return false;
        }

        if let Some(cursor) = self.cursor {
            self.entries.truncate(cursor + 1);
        }
        self.entries.push_back(content.into());
        if self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
        self.cursor = Some(self.entries.len() - 1);
        true
    }

    /// Handles a document-change report from the editor.
    ///
    /// While snapshots are being applied, the report is their echo: it
    /// lowers the guard and is not recorded. A report identical to the
    /// current entry is also skipped. Anything else is pushed.
    pub fn record_change(&mut self, content: &str) -> bool {
        if self.is_applying() {
            self.acknowledge_applied();
            return false;
        }
        if self.current() == Some(content) {
            return false;
        }
        self.push(content)
    }

    /// Steps back one entry and returns it for the caller to apply.
    pub fn undo(&mut self) -> Option<String> {
        let cursor = self.cursor.filter(|c| *c > 0)?;
        self.cursor = Some(cursor - 1);
        self.raise_guard();
        self.entries.get(cursor - 1).cloned()
    }

    /// Steps forward one entry and returns it for the caller to apply.
    pub fn redo(&mut self) -> Option<String> {
        let cursor = self.cursor.filter(|c| c + 1 < self.entries.len())?;
        self.cursor = Some(cursor + 1);
        self.raise_guard();
        self.entries.get(cursor + 1).cloned()
    }

    /// Clears everything. Used when switching documents.
    pub fn reset_history(&mut self) {
        self.entries.clear();
        self.cursor = None;
        self.guard = None;
    }

    /// Marks one applied snapshot as having reached the editor.
    pub fn acknowledge_applied(&mut self) {
        if let Some(guard) = self.guard.as_mut() {
            guard.pending = guard.pending.saturating_sub(1);
            if guard.pending == 0 {
                self.guard = None;
            }
        }
    }

    pub fn is_applying(&self) -> bool {
        self.guard
            .is_some_and(|g| g.pending > 0 && Instant::now() < g.until)
    }

    pub fn can_undo(&self) -> bool {
        self.cursor.is_some_and(|c| c > 0)
    }

    pub fn can_redo(&self) -> bool {
        self.cursor.is_some_and(|c| c + 1 < self.entries.len())
    }

    pub fn current(&self) -> Option<&str> {
        self.cursor
            .and_then(|c| self.entries.get(c))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn info(&self) -> HistoryInfo {
        HistoryInfo {
            len: self.entries.len(),
            cursor: self.cursor,
            can_undo: self.can_undo(),
            can_redo: self.can_redo(),
            applying: self.is_applying(),
        }
    }

    fn raise_guard(&mut self) {
        let until = Instant::now() + self.debounce;
        let pending = if self.is_applying() {
            self.guard.map_or(0, |g| g.pending)
        } else {
            0
        };
        self.guard = Some(ApplyGuard {
            until,
            pending: pending + 1,
        });
    }
}
