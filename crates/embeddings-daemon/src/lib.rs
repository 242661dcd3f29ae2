//! Embeddings daemon library exports.
//!
//! This crate provides the CLI daemon binary for the embeddings service.
//!
//! # Modules
//!
//! - `cli`: Command-line argument parsing with clap
//! - `commands`: Command implementations (start, stop, status, models, embed)

pub mod cli;
pub mod commands;

pub use cli::{Cli, Commands};
pub use commands::{build_service, embed_once, list_models, show_status, start_daemon, stop_daemon};
