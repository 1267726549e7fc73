//! Chat command handler.

use anyhow::{Context, Result};
use pilot_core::config::Config;
use pilot_core::core::interrupt;
use pilot_core::logging;

use crate::modes::chat::{ChatOptions, run_chat};

pub async fn run(config: &Config, options: ChatOptions) -> Result<()> {
    let _log_guard = logging::init(&config.logging).context("init logging")?;
    interrupt::init()?;

    run_chat(config, options).await.context("chat session failed")
}
