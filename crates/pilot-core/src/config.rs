//! Configuration management for Pilot.
//!
//! Loads configuration from ${PILOT_HOME}/config.toml with sensible defaults.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::history::HistoryStack;
use crate::editor::poll::PollPolicy;
use crate::protocol::endpoint::{self, Deployment};
use crate::protocol::stream_parser::{DEFAULT_CLOSE_MARKER, DEFAULT_OPEN_MARKER, StreamMarkers};

/// Returns the default config template with comments.
///
/// This is embedded from default_config.toml at compile time.
fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

/// Recursively merges items from source table into target table.
fn merge_items(target: &mut toml_edit::Table, source: &toml_edit::Table) {
    use toml_edit::Item;

    for (key, value) in source.iter() {
        match value {
            Item::Value(v) => {
                target[key] = Item::Value(v.clone());
            }
            Item::Table(src_table) => {
                if let Some(Item::Table(target_table)) = target.get_mut(key) {
                    merge_items(target_table, src_table);
                } else {
                    target[key] = Item::Table(src_table.clone());
                }
            }
            Item::ArrayOfTables(src_arr) => {
                target[key] = Item::ArrayOfTables(src_arr.clone());
            }
            Item::None => {}
        }
    }
}

/// Writes a file atomically (temp file + rename), creating parent directories.
pub(crate) fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = std::path::PathBuf::from(tmp_name);
    fs::write(&tmp_path, content)
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            tmp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}

pub mod paths {
    //! Path resolution for Pilot configuration and data.
    //!
    //! PILOT_HOME resolution order:
    //! 1. PILOT_HOME environment variable (if set)
    //! 2. ~/.config/pilot (default)
    //! 3. ./.pilot when no home directory can be determined

    use std::path::PathBuf;

    pub const HOME_ENV: &str = "PILOT_HOME";

    /// Returns the Pilot home directory.
    pub fn pilot_home() -> PathBuf {
        if let Ok(home) = std::env::var(HOME_ENV) {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || PathBuf::from(".pilot"),
            |h| h.join(".config").join("pilot"),
        )
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        pilot_home().join("config.toml")
    }

    /// Returns the path to the persisted client state.
    pub fn state_path() -> PathBuf {
        pilot_home().join("state.json")
    }

    /// Returns the log directory.
    pub fn logs_dir() -> PathBuf {
        pilot_home().join("logs")
    }
}

/// Agent server location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Absolute or origin-relative base URL
    pub base_url: String,
    /// Page origin (embedded mode and relative base URLs)
    pub origin: Option<String>,
    /// Use the origin instead of the base URL
    pub embedded: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: endpoint::DEFAULT_BASE_URL.to_string(),
            origin: None,
            embedded: false,
        }
    }
}

/// Chat session behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Heartbeat interval in seconds (0 disables)
    pub heartbeat_secs: u64,
    pub stream_partials: bool,
    pub open_marker: String,
    pub close_marker: String,
    pub event_buffer: usize,
    /// WebSocket handshake limit in seconds
    pub connect_timeout_secs: u64,
    /// Time a full subscriber may block delivery, in milliseconds
    pub subscriber_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 0,
            stream_partials: true,
            open_marker: DEFAULT_OPEN_MARKER.to_string(),
            close_marker: DEFAULT_CLOSE_MARKER.to_string(),
            event_buffer: 128,
            connect_timeout_secs: 10,
            subscriber_timeout_ms: 5000,
        }
    }
}

impl SessionConfig {
    pub fn heartbeat(&self) -> Option<Duration> {
        (self.heartbeat_secs > 0).then(|| Duration::from_secs(self.heartbeat_secs))
    }

    /// Zero is treated as one second.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn subscriber_timeout(&self) -> Duration {
        Duration::from_millis(self.subscriber_timeout_ms)
    }

    /// # Errors
    /// Returns an error if either marker is empty.
    pub fn markers(&self) -> Result<StreamMarkers> {
        StreamMarkers::new(self.open_marker.clone(), self.close_marker.clone())
            .context("Invalid [session] markers")
    }
}

/// Embedded editor bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    /// WebSocket URL of the editor bridge
    pub url: Option<String>,
    /// Execution status base URL
    pub status_url: Option<String>,
    pub rpc_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub poll_max_attempts: u32,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            url: None,
            status_url: None,
            rpc_timeout_ms: 5000,
            poll_interval_ms: 1000,
            poll_max_attempts: 60,
        }
    }
}

impl EditorConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_attempts: self.poll_max_attempts,
        }
    }

    /// # Errors
    /// Returns an error if `status_url` is set but not a valid URL.
    pub fn status_base(&self) -> Result<Option<Url>> {
        self.status_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(|url| Url::parse(url).with_context(|| format!("Invalid editor status URL: {url}")))
            .transpose()
    }
}

/// Undo/redo history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_entries: usize,
    pub apply_debounce_ms: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: crate::core::history::DEFAULT_MAX_ENTRIES,
            apply_debounce_ms: 300,
        }
    }
}

impl HistoryConfig {
    pub fn stack(&self) -> HistoryStack {
        HistoryStack::new(
            self.max_entries,
            Duration::from_millis(self.apply_debounce_ms),
        )
    }
}

/// Log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// EnvFilter directive
    pub filter: String,
    /// File name under the logs directory
    pub file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            file: "pilot.log".to_string(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub editor: EditorConfig,
    pub history: HistoryConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads configuration from the default config path.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Creates a default config file at the given path.
    /// Returns an error if the file already exists.
    ///
    /// # Errors
    /// Returns an error if the file exists or cannot be written.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        write_atomic(path, default_config_template())
    }

    /// Renders the current template with Rust defaults, overlaid with the
    /// values from an existing config at `path` (if any).
    ///
    /// Template comments survive; user values win.
    ///
    /// # Errors
    /// Returns an error if the template, defaults or user file fail to parse.
    pub fn generate(path: &Path) -> Result<String> {
        use toml_edit::DocumentMut;

        let mut doc: DocumentMut = default_config_template()
            .parse()
            .context("Failed to parse default config template")?;

        let generated_toml = toml::to_string(&Config::default())
            .context("Failed to serialize default config to TOML")?;
        let generated_doc: DocumentMut = generated_toml
            .parse()
            .context("Failed to parse generated config")?;
        merge_items(doc.as_table_mut(), generated_doc.as_table());

        if path.exists() {
            let user_config = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            let user_doc: DocumentMut = user_config
                .parse()
                .with_context(|| format!("Failed to parse config from {}", path.display()))?;
            merge_items(doc.as_table_mut(), user_doc.as_table());
        }

        Ok(doc.to_string())
    }

    /// REST base URL, normalized with a trailing slash.
    ///
    /// # Errors
    /// Returns an error if the server section does not yield a valid URL.
    pub fn http_base(&self) -> Result<Url> {
        let base_url = endpoint::resolve_base_url(Some(self.server.base_url.as_str()));
        endpoint::http_base(&Deployment {
            base_url: Some(&base_url),
            origin: self.server.origin.as_deref(),
            embedded: self.server.embedded,
        })
    }

    /// Chat socket URL for a session.
    ///
    /// # Errors
    /// Returns an error if the server section does not yield a valid URL.
    pub fn chat_socket_url(&self, session_code: &str, token: &str) -> Result<Url> {
        endpoint::chat_socket_url(&self.http_base()?, session_code, token)
    }
}
