//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer};

use crate::models::PartitionId;

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/partition-failover/data";

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port used to expose Prometheus metrics.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,

    /// The id of this host within the cluster.
    pub host_id: u32,
    /// The partitions hosted on this node, given as a comma separated list.
    #[serde(deserialize_with = "Config::parse_partitions")]
    pub partitions: Vec<PartitionId>,
    /// The number of replica sites hosted for each partition.
    #[serde(default = "Config::default_sites_per_partition")]
    pub sites_per_partition: u32,

    /// The path to the local coordination store on disk.
    #[serde(default = "Config::default_data_path")]
    pub storage_data_path: String,

    /// The bound on a single repair round trip, in milliseconds.
    ///
    /// A round trip which exceeds this bound cancels the repair attempt, which is then retried.
    #[serde(default = "Config::default_repair_timeout_ms")]
    pub repair_timeout_ms: u64,
    /// The interval at which ticks are delivered to each site, in milliseconds.
    #[serde(default = "Config::default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        anyhow::ensure!(!config.partitions.is_empty(), "at least one partition must be configured");
        anyhow::ensure!(config.sites_per_partition > 0, "sites_per_partition must be at least 1");
        Ok(config)
    }

    /// The repair round-trip timeout.
    pub fn repair_timeout(&self) -> Duration {
        Duration::from_millis(self.repair_timeout_ms)
    }

    /// The tick interval.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    fn default_metrics_port() -> u16 {
        7002
    }

    fn default_sites_per_partition() -> u32 {
        1
    }

    fn default_data_path() -> String {
        DEFAULT_DATA_PATH.to_string()
    }

    fn default_repair_timeout_ms() -> u64 {
        5_000
    }

    fn default_tick_interval_ms() -> u64 {
        1_000
    }

    /// Parse the comma separated list of partitions.
    fn parse_partitions<'de, D: Deserializer<'de>>(val: D) -> Result<Vec<PartitionId>, D::Error> {
        let raw: String = Deserialize::deserialize(val)?;
        raw.split(',')
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .map(|segment| {
                segment
                    .parse::<u32>()
                    .map(PartitionId)
                    .map_err(|err| DeError::custom(format!("error parsing PARTITIONS entry {:?}: {}", segment, err)))
            })
            .collect()
    }
}

#[cfg(test)]
impl Config {
    /// Build a config for tests, backed by a temporary data directory.
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir().context("error creating tmp dir for test config")?;
        let config = Config {
            rust_log: "error".into(),
            metrics_port: Self::default_metrics_port(),
            host_id: 0,
            partitions: vec![PartitionId(0)],
            sites_per_partition: 1,
            storage_data_path: tmpdir.path().to_string_lossy().to_string(),
            repair_timeout_ms: 2_000,
            tick_interval_ms: 50,
        };
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}
