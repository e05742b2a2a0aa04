use anyhow::Result;
use clap::Parser;

use talkpath::cli::{self, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir;

    match cli.command {
        Commands::Profile { command } => cli::handle_profile(command, data_dir).await,
        Commands::Session { command } => cli::handle_session(command, data_dir).await,
        Commands::Attempt {
            conversation,
            turn,
            text,
        } => cli::handle_attempt(conversation, turn, text, data_dir).await,
        Commands::Expression { command } => cli::handle_expression(command, data_dir).await,
        Commands::Progress { user } => cli::handle_progress(user, data_dir).await,
        Commands::Streak { user } => cli::handle_streak(user, data_dir).await,
        Commands::History { user, days } => cli::handle_history(user, days, data_dir).await,
        Commands::Journal { user, limit } => cli::handle_journal(user, limit, data_dir).await,
        Commands::Library { command } => cli::handle_library(command, data_dir).await,
    }
}
