//! CLI argument parsing for the embeddings daemon.
//!
//! CLI flags override all other config sources.

use clap::{Parser, Subcommand};

/// Embeddings Service Daemon
///
/// Local text and image embeddings with a bounded model cache.
#[derive(Parser, Debug)]
#[command(name = "embeddings-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default ~/.config/embeddings-service/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Daemon commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the embeddings daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(short, long)]
        foreground: bool,

        /// Override HTTP port
        #[arg(short, long)]
        port: Option<u16>,

        /// Override database path
        #[arg(long)]
        db_path: Option<String>,
    },

    /// Stop the running daemon
    Stop,

    /// Show daemon status
    Status,

    /// List the model catalog
    Models,

    /// Embed one input locally and print the vector as JSON
    Embed {
        /// Text, or an image URL / base64 payload with --image
        input: String,

        /// Model identifier (default: configured text or image model)
        #[arg(short, long)]
        model: Option<String>,

        /// Treat the input as an image
        #[arg(long)]
        image: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_start_foreground() {
        let cli = Cli::parse_from(["embeddings-daemon", "start", "--foreground"]);
        match cli.command {
            Commands::Start { foreground, .. } => assert!(foreground),
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_cli_start_with_port_and_db_path() {
        let cli = Cli::parse_from([
            "embeddings-daemon",
            "start",
            "-p",
            "9100",
            "--db-path",
            "/custom/db",
        ]);
        match cli.command {
            Commands::Start { port, db_path, .. } => {
                assert_eq!(port, Some(9100));
                assert_eq!(db_path, Some("/custom/db".to_string()));
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::parse_from([
            "embeddings-daemon",
            "--config",
            "/path/to/config.toml",
            "--log-level",
            "debug",
            "status",
        ]);
        assert_eq!(cli.config, Some("/path/to/config.toml".to_string()));
        assert_eq!(cli.log_level, Some("debug".to_string()));
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn test_cli_stop_and_models() {
        let cli = Cli::parse_from(["embeddings-daemon", "stop"]);
        assert!(matches!(cli.command, Commands::Stop));
        let cli = Cli::parse_from(["embeddings-daemon", "models"]);
        assert!(matches!(cli.command, Commands::Models));
    }

    #[test]
    fn test_cli_embed() {
        let cli = Cli::parse_from([
            "embeddings-daemon",
            "embed",
            "red shoes",
            "--model",
            "sentence-transformers/all-MiniLM-L6-v2",
        ]);
        match cli.command {
            Commands::Embed { input, model, image } => {
                assert_eq!(input, "red shoes");
                assert_eq!(model.as_deref(), Some("sentence-transformers/all-MiniLM-L6-v2"));
                assert!(!image);
            }
            _ => panic!("Expected Embed command"),
        }
    }
}
