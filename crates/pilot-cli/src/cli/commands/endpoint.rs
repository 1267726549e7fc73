//! Endpoint command handler.

use anyhow::Result;
use pilot_core::config::Config;

/// Prints the chat socket URL a session would connect to.
pub fn show(config: &Config, session_code: &str, token: &str) -> Result<()> {
    let url = config.chat_socket_url(session_code, token)?;
    println!("{url}");
    Ok(())
}
