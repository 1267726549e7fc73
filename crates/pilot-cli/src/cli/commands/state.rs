//! State command handlers.

use anyhow::{Context, Result};
use pilot_core::state::StateStore;
use pilot_core::tools::broker::ExecutionPolicy;

pub fn show() -> Result<()> {
    let store = StateStore::open_default();
    let state = store.load();
    let json = serde_json::to_string_pretty(&state).context("encode state")?;
    println!("{json}");
    Ok(())
}

pub fn select_service(id: &str) -> Result<()> {
    let id = id.trim();
    if id.is_empty() {
        anyhow::bail!("Service id must not be empty");
    }
    let state = StateStore::open_default().update(|state| state.select_service(id))?;
    println!("Selected service {id}");
    println!("Recent: {}", state.recent_service_ids.join(", "));
    Ok(())
}

pub fn select_agent(code: &str) -> Result<()> {
    let state = StateStore::open_default().update(|state| state.select_agent(code))?;
    match state.selected_agent_code {
        Some(code) => println!("Selected agent {code}"),
        None => println!("Cleared agent selection"),
    }
    Ok(())
}

pub fn tool_policy(set: &str, policy: &str, disable: bool) -> Result<()> {
    let policy: ExecutionPolicy = policy.parse()?;
    StateStore::open_default().update(|state| {
        state.tool_config.update(set, Some(!disable), Some(policy));
    })?;
    let status = if disable { "disabled" } else { "enabled" };
    println!("Tool set {set}: {status}, {policy}");
    Ok(())
}
