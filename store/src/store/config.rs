//! Configuration for the store node.
//!
//! ```yaml
//! listen_ip: 127.0.0.1
//! listen_port: 15002
//! password: a-long-enough-password
//! workers: 4
//! root_dir: /tmp/stratakv
//! blocks_count: 4096
//! blocks_size: 4096
//! value_size: 64
//! dump_interval: 30s
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use stratakv_core::config::check_password;
use stratakv_core::error::TypedResult;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConfig {
    pub listen_ip: String,
    pub listen_port: u16,

    /// Password peers must present during the AUTH handshake.
    pub password: String,

    /// Size of the worker thread pool.
    #[serde(default = "default_workers")]
    pub workers: u16,

    #[serde(default = "default_max_clients")]
    pub max_clients: u16,

    /// Root directory of the block device.
    pub root_dir: PathBuf,

    /// Number of blocks to create when bootstrapping a fresh root.
    pub blocks_count: u32,

    /// Byte size of each block.
    pub blocks_size: u32,

    /// Maximum record value length, negotiated with peers on ACK.
    pub value_size: u16,

    /// Interval between periodic memtable dumps.
    #[serde(with = "humantime_serde")]
    pub dump_interval: Duration,

    /// Artificial per-operation delay to simulate slow disks.
    #[serde(default, with = "humantime_serde")]
    pub delay: Option<Duration>,

    #[serde(default = "default_validation_timeout", with = "humantime_serde")]
    pub validation_timeout: Duration,
}

fn default_workers() -> u16 {
    4
}

fn default_max_clients() -> u16 {
    16
}

fn default_validation_timeout() -> Duration {
    Duration::from_secs(5)
}

impl StoreConfig {
    pub fn validate(&self) -> TypedResult<()> {
        check_password(&self.password)?;
        if self.blocks_count == 0 || self.blocks_size == 0 {
            return Err(stratakv_core::typed_err!(
                Config,
                "blocks_count and blocks_size must be greater than zero"
            ));
        }
        if self.value_size == 0 {
            return Err(stratakv_core::typed_err!(Config, "value_size must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StoreConfig {
        serde_yaml::from_str(
            "listen_ip: 127.0.0.1\n\
             listen_port: 15002\n\
             password: a-long-enough-password\n\
             root_dir: /tmp/stratakv-store\n\
             blocks_count: 4096\n\
             blocks_size: 4096\n\
             value_size: 64\n\
             dump_interval: 30s\n",
        )
        .unwrap()
    }

    #[test]
    fn defaults_apply() {
        let cfg = sample();
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.max_clients, 16);
        assert_eq!(cfg.dump_interval, Duration::from_secs(30));
        assert_eq!(cfg.delay, None);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn short_passwords_are_rejected() {
        let mut cfg = sample();
        cfg.password = "short".into();
        assert!(cfg.validate().is_err());
    }
}
