//! CLI module
//!
//! Command-line interface for the piece-exchange peer process.

pub mod args;
pub mod config;

pub use args::CliArgs;
pub use config::{CommonConfig, Config, PeerEntry};
