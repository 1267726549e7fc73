//! CLI entry and dispatch.

use anyhow::{Context, Result};
use clap::Parser;
use pilot_core::config;

use crate::modes::chat::ChatOptions;

mod commands;

#[derive(Parser)]
#[command(name = "pilot")]
#[command(version = "0.1")]
#[command(about = "Terminal client for the ComfyPilot agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Chat with an agent in the terminal
    Chat {
        /// Session code of the conversation
        #[arg(short, long)]
        session: String,

        /// Agent code (defaults to the saved selection)
        #[arg(short, long)]
        agent: Option<String>,

        /// Access token
        #[arg(long, env = "PILOT_TOKEN", hide_env_values = true, default_value = "")]
        token: String,

        /// Run every tool call without asking
        #[arg(long)]
        auto_approve: bool,
    },

    /// Print the chat socket URL for a session
    Endpoint {
        /// Session code of the conversation
        #[arg(short, long)]
        session: String,

        /// Access token
        #[arg(long, env = "PILOT_TOKEN", hide_env_values = true, default_value = "")]
        token: String,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Inspect and edit saved client state
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
    /// Print the config merged over the defaults
    Generate,
}

#[derive(clap::Subcommand)]
enum StateCommands {
    /// Print the saved state
    Show,
    /// Select a service and add it to the recent list
    SelectService {
        #[arg(value_name = "ID")]
        id: String,
    },
    /// Select the default agent (empty clears it)
    SelectAgent {
        #[arg(value_name = "CODE")]
        code: String,
    },
    /// Set how a tool set's calls are handled
    ToolPolicy {
        /// Tool set id
        #[arg(value_name = "SET")]
        set: String,
        /// ask-every-time or auto-execute
        #[arg(value_name = "POLICY")]
        policy: String,
        /// Disable the tool set
        #[arg(long)]
        disable: bool,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;

    rt.block_on(async move { dispatch(cli).await })
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Chat {
            session,
            agent,
            token,
            auto_approve,
        } => {
            let config = config::Config::load().context("load config")?;
            commands::chat::run(
                &config,
                ChatOptions {
                    session_code: session,
                    agent_code: agent,
                    token,
                    auto_approve,
                },
            )
            .await
        }

        Commands::Endpoint { session, token } => {
            let config = config::Config::load().context("load config")?;
            commands::endpoint::show(&config, &session, &token)
        }

        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path();
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(),
            ConfigCommands::Generate => commands::config::generate(),
        },

        Commands::State { command } => match command {
            StateCommands::Show => commands::state::show(),
            StateCommands::SelectService { id } => commands::state::select_service(&id),
            StateCommands::SelectAgent { code } => commands::state::select_agent(&code),
            StateCommands::ToolPolicy {
                set,
                policy,
                disable,
            } => commands::state::tool_policy(&set, &policy, disable),
        },
    }
}
