//! Embeddings Service Daemon
//!
//! Serves text and image embeddings over a JSON HTTP API.
//!
//! # Usage
//!
//! ```bash
//! embeddings-daemon start [--foreground] [--port PORT] [--db-path PATH]
//! embeddings-daemon stop
//! embeddings-daemon status
//! embeddings-daemon models
//! embeddings-daemon embed "red leather shoes" [--model ID] [--image]
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (~/.config/embeddings-service/config.toml)
//! 3. Environment variables (EMBEDDINGS_*)
//! 4. CLI flags

use anyhow::Result;
use clap::Parser;

use embeddings_daemon::{embed_once, list_models, show_status, start_daemon, stop_daemon, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            foreground,
            port,
            db_path,
        } => {
            start_daemon(
                cli.config.as_deref(),
                foreground,
                port,
                db_path.as_deref(),
                cli.log_level.as_deref(),
            )
            .await?;
        }
        Commands::Stop => {
            stop_daemon()?;
        }
        Commands::Status => {
            show_status()?;
        }
        Commands::Models => {
            list_models();
        }
        Commands::Embed { input, model, image } => {
            embed_once(
                cli.config.as_deref(),
                &input,
                model.as_deref(),
                image,
                cli.log_level.as_deref(),
            )
            .await?;
        }
    }

    Ok(())
}
