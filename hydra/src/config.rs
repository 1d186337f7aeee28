//! Runtime configuration.
//!
//! Rank 0 (the master) carries the full host table; every other rank
//! only needs its own rank and local port offset and learns the rest
//! from the topology broadcast. Values load from a TOML file, can be
//! overridden from the environment, and have working defaults for
//! single-host jobs.

use serde::Deserialize;
use std::path::Path;

use hydra_wire::{DEFAULT_ALLGATHER_PORT, DEFAULT_DEV_PORT, DEFAULT_SN_PORT};

use crate::{Error, Result};

/// One host table entry: hostname and per-host port offset (distinct
/// offsets separate multiple ranks on the same host).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct HostEntry {
    pub host: String,
    #[serde(default)]
    pub offset: u8,
}

/// Runtime configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// This process's rank. Rank 0 must also supply `hosts`.
    pub rank: u16,

    /// Full host table, one entry per rank, in rank order. Master only.
    pub hosts: Vec<HostEntry>,

    /// Port offset of this process (workers; the master takes its own
    /// from the host table).
    pub local_offset: u8,

    /// Side-network base port.
    pub sn_port: u16,

    /// Transport device base port.
    pub dev_port: u16,

    /// Bootstrap allgather-ring base port.
    pub allgather_port: u16,

    /// Completion-queue depth.
    pub queue_depth: usize,

    /// Budget for establishing a single connection.
    pub conn_timeout_ms: u64,

    /// Default budget for side-network commands.
    pub sn_timeout_ms: u64,

    /// Back-off between group-check retries.
    pub grp_check_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rank: 0,
            hosts: Vec::new(),
            local_offset: 0,
            sn_port: DEFAULT_SN_PORT,
            dev_port: DEFAULT_DEV_PORT,
            allgather_port: DEFAULT_ALLGATHER_PORT,
            queue_depth: 1024,
            conn_timeout_ms: 10_000,
            sn_timeout_ms: 10_000,
            grp_check_backoff_ms: 250,
        }
    }
}

impl Config {
    /// Master configuration from `(host, offset)` pairs, one per rank.
    pub fn master(hosts: Vec<(String, u8)>) -> Self {
        Self {
            rank: 0,
            hosts: hosts
                .into_iter()
                .map(|(host, offset)| HostEntry { host, offset })
                .collect(),
            ..Self::default()
        }
    }

    /// Worker configuration: rank plus this process's port offset.
    pub fn worker(rank: u16, local_offset: u8) -> Self {
        Self {
            rank,
            local_offset,
            ..Self::default()
        }
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Protocol(format!("bad config: {e}")))
    }

    /// Apply `HYDRA_RANK`, `HYDRA_OFFSET` and `HYDRA_SN_PORT` overrides.
    pub fn with_env(mut self) -> Self {
        if let Some(rank) = env_parse("HYDRA_RANK") {
            self.rank = rank;
        }
        if let Some(offset) = env_parse("HYDRA_OFFSET") {
            self.local_offset = offset;
        }
        if let Some(port) = env_parse("HYDRA_SN_PORT") {
            self.sn_port = port;
        }
        self
    }

    /// This process's port offset.
    pub(crate) fn offset(&self) -> u8 {
        if self.rank == 0 {
            self.hosts
                .get(0)
                .map(|h| h.offset)
                .unwrap_or(self.local_offset)
        } else {
            self.local_offset
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.sn_port, DEFAULT_SN_PORT);
        assert_eq!(c.grp_check_backoff_ms, 250);
    }

    #[test]
    fn test_parse_toml() {
        let c: Config = toml::from_str(
            r#"
            rank = 0
            sn_port = 7000
            [[hosts]]
            host = "node-a"
            [[hosts]]
            host = "node-b"
            offset = 1
            "#,
        )
        .unwrap();

        assert_eq!(c.sn_port, 7000);
        assert_eq!(c.hosts.len(), 2);
        assert_eq!(c.hosts[1].offset, 1);
        assert_eq!(c.queue_depth, 1024);
    }

    #[test]
    fn test_master_builder() {
        let c = Config::master(vec![("a".into(), 0), ("b".into(), 2)]);
        assert_eq!(c.rank, 0);
        assert_eq!(c.offset(), 0);
        assert_eq!(c.hosts[1].offset, 2);
    }
}
