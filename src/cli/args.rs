//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::Parser;
use std::path::PathBuf;

/// CLI arguments for the piece-exchange peer process
#[derive(Debug, Parser)]
#[command(name = "piece-exchange")]
#[command(about = "A cooperative peer-to-peer piece-exchange node", long_about = None)]
pub struct CliArgs {
    /// Numeric id of the peer this process runs as
    #[arg(value_name = "PEER_ID")]
    pub peer_id: u32,

    /// Path to the shared session configuration
    #[arg(long, value_name = "FILE", default_value = "Common.cfg")]
    pub common_config: PathBuf,

    /// Path to the peer roster
    #[arg(long, value_name = "FILE", default_value = "PeerInfo.cfg")]
    pub peer_config: PathBuf,

    /// Directory holding (or receiving) the shared file
    #[arg(short, long, value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_peer_id_and_defaults() {
        let args = CliArgs::parse_from(["piece-exchange", "1001"]);
        assert_eq!(args.peer_id, 1001);
        assert_eq!(args.common_config, PathBuf::from("Common.cfg"));
        assert_eq!(args.peer_config, PathBuf::from("PeerInfo.cfg"));
        assert!(args.working_dir.is_none());
        assert!(!args.verbose);
    }

    #[test]
    fn test_log_level_follows_flags() {
        let args = CliArgs::parse_from(["piece-exchange", "1001", "--verbose"]);
        assert_eq!(args.log_level(), tracing::Level::DEBUG);

        let args = CliArgs::parse_from(["piece-exchange", "1001", "--quiet"]);
        assert_eq!(args.log_level(), tracing::Level::ERROR);

        let args = CliArgs::parse_from(["piece-exchange", "1001"]);
        assert_eq!(args.log_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_config_paths_can_be_overridden() {
        let args = CliArgs::parse_from([
            "piece-exchange",
            "1002",
            "--common-config",
            "conf/session.cfg",
            "--peer-config",
            "conf/roster.cfg",
        ]);
        assert_eq!(args.common_config, PathBuf::from("conf/session.cfg"));
        assert_eq!(args.peer_config, PathBuf::from("conf/roster.cfg"));
    }
}
