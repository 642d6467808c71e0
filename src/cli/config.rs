//! CLI configuration module
//!
//! Loads and validates the two session configuration files every peer
//! process shares: the common settings (choke timers, file geometry)
//! and the peer roster listing every participant in start order.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};

use crate::error::ExchangeError;
use crate::peer::PeerId;

/// Shared session settings, identical for every peer
#[derive(Debug, Clone, PartialEq)]
pub struct CommonConfig {
    /// Size of the regular unchoke set
    pub number_of_preferred_neighbors: usize,
    /// Seconds between regular unchoke rounds
    pub unchoking_interval: u64,
    /// Seconds between optimistic unchoke rotations
    pub optimistic_unchoking_interval: u64,
    /// Name of the shared file
    pub file_name: String,
    /// Total file size in bytes
    pub file_size: u64,
    /// Piece size in bytes; the final piece may be short
    pub piece_size: u64,
}

/// One roster line: a peer and where to reach it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub peer_id: PeerId,
    pub host: String,
    pub port: u16,
    /// Whether this peer starts with the complete file
    pub has_file: bool,
}

/// Full session configuration for one peer process
#[derive(Debug, Clone)]
pub struct Config {
    pub common: CommonConfig,
    /// Roster in file order; peers dial everyone listed before them
    pub peers: Vec<PeerEntry>,
}

impl CommonConfig {
    /// Parse the `Key Value` line format of the common settings file
    pub fn parse(contents: &str) -> Result<Self> {
        let mut number_of_preferred_neighbors = None;
        let mut unchoking_interval = None;
        let mut optimistic_unchoking_interval = None;
        let mut file_name = None;
        let mut file_size = None;
        let mut piece_size = None;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once(char::is_whitespace).ok_or_else(|| {
                ExchangeError::config_error(format!("Malformed settings line: '{}'", line))
            })?;
            let value = value.trim();
            match key {
                "NumberOfPreferredNeighbors" => {
                    number_of_preferred_neighbors = Some(parse_field(key, value)?)
                }
                "UnchokingInterval" => unchoking_interval = Some(parse_field(key, value)?),
                "OptimisticUnchokingInterval" => {
                    optimistic_unchoking_interval = Some(parse_field(key, value)?)
                }
                "FileName" => file_name = Some(value.to_string()),
                "FileSize" => file_size = Some(parse_field(key, value)?),
                "PieceSize" => piece_size = Some(parse_field(key, value)?),
                other => {
                    debug!("Ignoring unknown settings key '{}'", other);
                }
            }
        }

        Ok(Self {
            number_of_preferred_neighbors: required(number_of_preferred_neighbors, "NumberOfPreferredNeighbors")?,
            unchoking_interval: required(unchoking_interval, "UnchokingInterval")?,
            optimistic_unchoking_interval: required(optimistic_unchoking_interval, "OptimisticUnchokingInterval")?,
            file_name: required(file_name, "FileName")?,
            file_size: required(file_size, "FileSize")?,
            piece_size: required(piece_size, "PieceSize")?,
        })
    }

    /// Number of pieces the shared file splits into
    pub fn num_pieces(&self) -> usize {
        self.file_size.div_ceil(self.piece_size) as usize
    }

    /// Regular unchoke round period
    pub fn unchoke_interval(&self) -> Duration {
        Duration::from_secs(self.unchoking_interval)
    }

    /// Optimistic unchoke rotation period
    pub fn optimistic_interval(&self) -> Duration {
        Duration::from_secs(self.optimistic_unchoking_interval)
    }
}

impl PeerEntry {
    /// Parse one `id host port has_file` roster line
    fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(ExchangeError::config_error(format!(
                "Roster line needs 4 fields, got {}: '{}'",
                fields.len(),
                line
            ))
            .into());
        }
        Ok(Self {
            peer_id: parse_field("peer id", fields[0])?,
            host: fields[1].to_string(),
            port: parse_field("port", fields[2])?,
            has_file: match fields[3] {
                "1" => true,
                "0" => false,
                other => {
                    return Err(ExchangeError::config_error_with_field(
                        format!("has_file flag must be 0 or 1, got '{}'", other),
                        "has_file",
                    )
                    .into())
                }
            },
        })
    }

    /// Dial address for this peer
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Config {
    /// Load both configuration files from disk
    pub fn load(common_path: &Path, peers_path: &Path) -> Result<Self> {
        info!(
            "Loading configuration from {} and {}",
            common_path.display(),
            peers_path.display()
        );
        let common_contents = std::fs::read_to_string(common_path).map_err(|e| {
            ExchangeError::config_error(format!(
                "Failed to read {}: {}",
                common_path.display(),
                e
            ))
        })?;
        let peers_contents = std::fs::read_to_string(peers_path).map_err(|e| {
            ExchangeError::config_error(format!("Failed to read {}: {}", peers_path.display(), e))
        })?;
        Self::parse(&common_contents, &peers_contents)
    }

    /// Parse both files from their raw contents
    pub fn parse(common: &str, peers: &str) -> Result<Self> {
        let common = CommonConfig::parse(common)?;
        let peers = peers
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(PeerEntry::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { common, peers })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.common.piece_size == 0 {
            return Err(ExchangeError::config_error_with_field("PieceSize cannot be 0", "PieceSize").into());
        }
        if self.common.file_size == 0 {
            return Err(ExchangeError::config_error_with_field("FileSize cannot be 0", "FileSize").into());
        }
        if self.common.unchoking_interval == 0 {
            return Err(ExchangeError::config_error_with_field(
                "UnchokingInterval cannot be 0",
                "UnchokingInterval",
            )
            .into());
        }
        if self.common.optimistic_unchoking_interval == 0 {
            return Err(ExchangeError::config_error_with_field(
                "OptimisticUnchokingInterval cannot be 0",
                "OptimisticUnchokingInterval",
            )
            .into());
        }
        if self.peers.is_empty() {
            return Err(ExchangeError::config_error("Peer roster is empty").into());
        }
        for window in self.peers.windows(2) {
            if window[0].peer_id >= window[1].peer_id {
                return Err(ExchangeError::config_error(format!(
                    "Roster ids must be strictly increasing ({} before {})",
                    window[0].peer_id, window[1].peer_id
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Roster entry for a peer id
    pub fn entry_for(&self, peer_id: PeerId) -> Option<&PeerEntry> {
        self.peers.iter().find(|p| p.peer_id == peer_id)
    }

    /// Peers listed before `peer_id`; these are the ones it dials
    pub fn peers_before(&self, peer_id: PeerId) -> Vec<&PeerEntry> {
        self.peers
            .iter()
            .take_while(|p| p.peer_id != peer_id)
            .collect()
    }
}

fn parse_field<T: std::str::FromStr>(field: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        ExchangeError::config_error_with_field(format!("Cannot parse '{}' for {}", value, field), field.to_string())
            .into()
    })
}

fn required<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| {
        ExchangeError::config_error_with_field(format!("Missing required key {}", field), field.to_string()).into()
    })
}
