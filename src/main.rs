//! chatshard - streaming chat client with sharded local history
//!
#![doc = "chatshard - streaming chat client with sharded local history"]
#![doc = "Main entry point for the chatshard application."]

use anyhow::Result;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chatshard::cli::{Cli, Commands};
use chatshard::commands;
use chatshard::commands::history::HistoryAction;
use chatshard::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Initialize tracing
    init_tracing(cli.verbose);

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = Config::load(config_path, &cli)?;

    // Validate configuration
    config.validate()?;

    // Execute command
    match cli.command {
        Commands::Chat { prompt, chat_id } => {
            tracing::info!("Starting chat");
            if let Some(id) = &chat_id {
                tracing::debug!("Continuing chat: {}", id);
            }
            commands::chat::run_chat(config, prompt, chat_id).await
        }
        Commands::List => commands::history::handle_history(&config, HistoryAction::List).await,
        Commands::New { title } => {
            commands::history::handle_history(&config, HistoryAction::New { title }).await
        }
        Commands::Switch { id } => {
            commands::history::handle_history(&config, HistoryAction::Switch { id }).await
        }
        Commands::Delete { id } => {
            commands::history::handle_history(&config, HistoryAction::Delete { id }).await
        }
        Commands::Show { id } => {
            commands::history::handle_history(&config, HistoryAction::Show { id }).await
        }
    }
}

/// Initialize tracing subscriber with environment filter
fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "chatshard=debug"
    } else {
        "chatshard=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
