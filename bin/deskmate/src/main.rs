mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "deskmate")]
#[command(about = "Local agent orchestration for the desktop assistant", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage registered agents
    #[command(alias = "agent")]
    Agents {
        #[command(subcommand)]
        command: AgentsCommands,
    },

    /// Run a workflow described in a JSON or YAML file
    Workflow {
        /// File holding a list of steps, or `{steps, sharedContext}`
        file: PathBuf,

        /// Session ID
        #[arg(short, long, default_value = "cli:default")]
        session: String,
    },

    /// Route an intent payload (JSON or plain text) through the agents
    Ask {
        payload: String,

        /// Session ID
        #[arg(short, long, default_value = "cli:default")]
        session: String,
    },

    /// Handle a message with local classification only
    Local {
        message: String,

        /// Session ID
        #[arg(short, long, default_value = "cli:default")]
        session: String,
    },

    /// Handle a message, using the remote backend when it is reachable
    Chat {
        message: String,

        /// Session ID
        #[arg(short, long, default_value = "cli:default")]
        session: String,
    },
}

#[derive(Subcommand)]
enum AgentsCommands {
    /// List every agent that can be loaded
    List,

    /// Show an agent's definition
    Show { name: String },

    /// Register an agent from a .rhai, .json or .yaml file
    Register {
        file: PathBuf,

        /// Agent name (defaults to the definition's name or the file stem)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Execute an agent once
    Run {
        name: String,

        /// JSON parameters
        #[arg(short, long, default_value = "{}")]
        params: String,

        /// Session ID
        #[arg(short, long, default_value = "cli:default")]
        session: String,
    },

    /// Remove an agent from the registry
    Unload { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Agents { command } => match command {
            AgentsCommands::List => commands::agents::list().await?,
            AgentsCommands::Show { name } => commands::agents::show(&name).await?,
            AgentsCommands::Register { file, name } => commands::agents::register(&file, name).await?,
            AgentsCommands::Run { name, params, session } => {
                commands::agents::run(&name, &params, &session).await?
            }
            AgentsCommands::Unload { name } => commands::agents::unload(&name).await?,
        },
        Commands::Workflow { file, session } => commands::workflow::run(&file, &session).await?,
        Commands::Ask { payload, session } => commands::ask::ask(&payload, &session).await?,
        Commands::Local { message, session } => commands::ask::local(&message, &session).await?,
        Commands::Chat { message, session } => commands::ask::chat(&message, &session).await?,
    }

    Ok(())
}
