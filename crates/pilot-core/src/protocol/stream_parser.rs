//! Incremental parser for tag-delimited agent output.
//!
//! The agent streams its whole response through `AGENT_STREAM` frames, but
//! only the text wrapped in a marker pair is meant for the user:
//!
//! ```text
//! thinking out loud...<cp_agent_communication>Here is the fix.</cp_agent_communication>
//! ```
//!
//! Chunks arrive at arbitrary boundaries, so a marker may be split across
//! two (or more) frames. The parser withholds just enough trailing bytes to
//! recognize a split marker and never looks further back than that.

use anyhow::{Result, bail};
use serde::Deserialize;

pub const DEFAULT_OPEN_MARKER: &str = "<cp_agent_communication>";
pub const DEFAULT_CLOSE_MARKER: &str = "</cp_agent_communication>";

/// Marker pair delimiting a visible span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMarkers {
    open: String,
    close: String,
}

impl StreamMarkers {
    /// Builds a marker pair.
    ///
    /// # Errors
    /// Returns an error if either marker is empty.
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Result<Self> {
        let open = open.into();
        let close = close.into();
        if open.is_empty() || close.is_empty() {
            bail!("stream markers must not be empty");
        }
        Ok(Self { open, close })
    }

    pub fn open(&self) -> &str {
        &self.open
    }

    pub fn close(&self) -> &str {
        &self.close
    }
}

impl Default for StreamMarkers {
    fn default() -> Self {
        Self {
            open: DEFAULT_OPEN_MARKER.to_string(),
            close: DEFAULT_CLOSE_MARKER.to_string(),
        }
    }
}

/// Streaming extractor for the text between marker pairs.
#[derive(Debug, Clone, Default)]
pub struct TagStreamParser {
    markers: StreamMarkers,
    /// Unconsumed raw input (at most one marker length minus one, between calls).
    buffer: String,
    in_span: bool,
    /// Span content collected since the last open marker.
    accumulated: String,
}

impl TagStreamParser {
    pub fn new(markers: StreamMarkers) -> Self {
        Self {
            markers,
            buffer: String::new(),
            in_span: false,
            accumulated: String::new(),
        }
    }

    /// Feeds one chunk and returns every span whose close marker completed
    /// within it, in stream order.
    ///
    /// A single chunk can close more than one span (`"<X>a</X><X>b</X>"`),
    /// so the result is a list; it is empty while no span has just closed.
    pub fn append(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut closed = Vec::new();

        loop {
            if self.in_span {
                if let Some(pos) = self.buffer.find(self.markers.close.as_str()) {
                    self.accumulated.push_str(&self.buffer[..pos]);
                    self.buffer.drain(..pos + self.markers.close.len());
                    self.in_span = false;
                    closed.push(std::mem::take(&mut self.accumulated));
                    continue;
                }
                let split = withhold_point(&self.buffer, self.markers.close.len() - 1);
                self.accumulated.push_str(&self.buffer[..split]);
                self.buffer.drain(..split);
                break;
            }

            if let Some(pos) = self.buffer.find(self.markers.open.as_str()) {
                self.buffer.drain(..pos + self.markers.open.len());
                self.in_span = true;
                self.accumulated.clear();
                continue;
            }
            let split = withhold_point(&self.buffer, self.markers.open.len() - 1);
            self.buffer.drain(..split);
            break;
        }

        closed
    }

    /// Clears all state. Used at turn boundaries.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.in_span = false;
        self.accumulated.clear();
    }

    /// Whether an open marker has been seen without its close marker yet.
    pub fn is_in_span(&self) -> bool {
        self.in_span
    }

    /// Text of the unfinished span, for live rendering.
    ///
    /// Excludes the withheld tail, which may be the start of a close marker.
    pub fn current_content(&self) -> &str {
        &self.accumulated
    }

    pub fn markers(&self) -> &StreamMarkers {
        &self.markers
    }
}

/// Returns the byte index before which `buffer` can be consumed while
/// keeping at least `keep` trailing bytes, rounded down to a char boundary.
fn withhold_point(buffer: &str, keep: usize) -> usize {
    let mut split = buffer.len().saturating_sub(keep);
    while !buffer.is_char_boundary(split) {
        split -= 1;
    }
    split
}

#[derive(Deserialize)]
struct StoredChatContent {
    #[serde(default)]
    content: Option<String>,
}

/// Renders a stored assistant message for the history view.
///
/// A non-blank `content` wins. Otherwise the raw model output in
/// `chat_content` (JSON `{"content": ...}`) is reduced to its first span.
pub fn extract_message_content(
    content: &str,
    chat_content: Option<&str>,
    markers: &StreamMarkers,
) -> String {
    if !content.trim().is_empty() {
        return content.to_string();
    }

    let Some(raw) = chat_content.filter(|raw| !raw.trim().is_empty()) else {
        return String::new();
    };

    let full = match serde_json::from_str::<StoredChatContent>(raw) {
        Ok(stored) => stored.content.unwrap_or_default(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to parse stored chat content");
            return String::new();
        }
    };

    let Some(start) = full.find(markers.open()) else {
        return full;
    };
    let body = &full[start + markers.open().len()..];
    match body.find(markers.close()) {
        Some(end) => body[..end].trim().to_string(),
        None => body.trim().to_string(),
    }
}
