//! Process-wide configuration for a rank in the training fabric.
//!
//! Every process is launched with the same [`GlobalConfig`] apart from its
//! `rank`. The highest rank is the coordinator; ranks `0..num_table_servers`
//! additionally play the table-server role.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, ShardError};

/// default poll quantum between queue/fabric probes, in microseconds (1 ms)
pub const DEFAULT_SLEEP_MICROS: u64 = 1000;

fn default_sleep_micros() -> u64 {
    DEFAULT_SLEEP_MICROS
}

/// Configuration shared by every process of a run.
///
/// Loadable from a JSON file (deployment) or built directly with
/// [`GlobalConfig::new`] (tests, embedding).
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    /// this process's address within the fabric
    pub rank: usize,
    /// total number of ranks; the coordinator is `world_size - 1`
    pub world_size: usize,
    /// how many of the lower ranks serve table shards
    pub num_table_servers: usize,
    /// request-queue choice: per-key put/get interlock when true, plain FIFO otherwise
    #[serde(default)]
    pub synchronous: bool,
    /// directory that holds disk-table blocks and checkpoint logs
    pub data_dir: PathBuf,
    /// poll quantum between probes when a loop finds its input empty, in microseconds
    #[serde(default = "default_sleep_micros")]
    pub sleep_micros: u64,
    /// one socket address per rank; only consulted by the TCP fabric
    #[serde(default)]
    pub hosts: Vec<SocketAddr>,
}

impl GlobalConfig {
    /// builds a config with the default poll quantum and the async queue
    pub fn new(rank: usize, world_size: usize, num_table_servers: usize, data_dir: &Path) -> Self {
        GlobalConfig {
            rank,
            world_size,
            num_table_servers,
            synchronous: false,
            data_dir: data_dir.to_path_buf(),
            sleep_micros: DEFAULT_SLEEP_MICROS,
            hosts: Vec::new(),
        }
    }

    /// reads and validates a config from a JSON file
    ///
    /// # Errors
    /// returns [`ShardError::Config`] when a field is out of range, or the
    /// underlying IO/parse error when the file cannot be read
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let config: GlobalConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// checks the internal consistency of the field values
    pub fn validate(&self) -> Result<()> {
        if self.world_size == 0 {
            return Err(ShardError::Config("world_size must be at least 1".into()));
        }
        if self.rank >= self.world_size {
            return Err(ShardError::Config(format!(
                "rank {} out of range for world size {}",
                self.rank, self.world_size
            )));
        }
        if self.num_table_servers == 0 || self.num_table_servers > self.world_size {
            return Err(ShardError::Config(format!(
                "num_table_servers {} out of range for world size {}",
                self.num_table_servers, self.world_size
            )));
        }
        if !self.hosts.is_empty() && self.hosts.len() != self.world_size {
            return Err(ShardError::Config(format!(
                "{} hosts configured for {} ranks",
                self.hosts.len(),
                self.world_size
            )));
        }
        Ok(())
    }

    /// the rank that drives barriers and assignment broadcasts
    pub fn coordinator_rank(&self) -> usize {
        self.world_size - 1
    }

    /// true when this process is the coordinator
    pub fn is_coordinator(&self) -> bool {
        self.rank == self.coordinator_rank()
    }

    /// true when this process owns table shards
    pub fn is_table_server(&self) -> bool {
        self.rank < self.num_table_servers
    }

    /// the sleep used by every polling loop when its input is empty
    pub fn sleep_quantum(&self) -> Duration {
        Duration::from_micros(self.sleep_micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn roles_derive_from_rank() {
        let dir = PathBuf::from("/tmp/does-not-matter");
        let config = GlobalConfig::new(3, 4, 2, &dir);
        assert_eq!(config.coordinator_rank(), 3);
        assert!(config.is_coordinator());
        assert!(!config.is_table_server());

        let server = GlobalConfig::new(1, 4, 2, &dir);
        assert!(server.is_table_server());
        assert!(!server.is_coordinator());
    }

    #[test]
    fn validate_rejects_bad_shapes() {
        let dir = PathBuf::from("/tmp/does-not-matter");
        let mut config = GlobalConfig::new(4, 4, 2, &dir);
        assert!(config.validate().is_err());
        config.rank = 0;
        config.num_table_servers = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        let mut file = File::create(&path).unwrap();
        write!(
            file,
            r#"{{"rank": 0, "world_size": 2, "num_table_servers": 1,
                "synchronous": true, "data_dir": "{}"}}"#,
            dir.path().display()
        )
        .unwrap();

        let config = GlobalConfig::from_file(&path).unwrap();
        assert!(config.synchronous);
        assert_eq!(config.sleep_micros, DEFAULT_SLEEP_MICROS);
        assert_eq!(config.world_size, 2);
    }
}
