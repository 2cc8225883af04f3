//! Configuration for the shard node.
//!
//! The journal interval, the gossip interval and the simulated access
//! delay are hot-reloadable; every other key requires a restart.
//!
//! ```yaml
//! number: 1
//! listen_ip: 127.0.0.1
//! listen_port: 15001
//! password: a-long-enough-password
//! store_ip: 127.0.0.1
//! store_port: 15002
//! store_password: a-long-enough-password
//! mem_size: 1MB
//! value_size: 64
//! journal_interval: 10s
//! gossip_interval: 5s
//! seeds:
//!   - ip: 127.0.0.1
//!     port: 15011
//! ```

use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};

use stratakv_core::config::{check_password, de_size_str, SeedConfig};
use stratakv_core::error::TypedResult;
use stratakv_core::gossip::NODE_NUMBER_UNKNOWN;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ShardConfig {
    /// This shard's number within the pool (1-based).
    pub number: u16,

    pub listen_ip: String,
    pub listen_port: u16,

    /// Password routers and shard peers must present on AUTH.
    pub password: String,

    pub store_ip: String,
    pub store_port: u16,

    /// Password presented to the store node.
    pub store_password: String,

    #[serde(default = "default_workers")]
    pub workers: u16,

    #[serde(default = "default_max_clients")]
    pub max_clients: u16,

    /// Size of the frame pool backing the page cache.
    #[serde(deserialize_with = "de_size_str")]
    pub mem_size: ByteSize,

    /// Maximum record value length.
    pub value_size: u16,

    /// Interval between periodic journals. Hot-reloadable.
    #[serde(with = "humantime_serde")]
    pub journal_interval: Duration,

    /// Interval between gossip rounds. Hot-reloadable.
    #[serde(with = "humantime_serde")]
    pub gossip_interval: Duration,

    /// Artificial per-access delay to simulate slow memory. Hot-reloadable.
    #[serde(default, with = "humantime_serde")]
    pub delay_mem: Option<Duration>,

    /// Gossip seed endpoints.
    #[serde(default)]
    pub seeds: Vec<SeedConfig>,

    #[serde(default = "default_validation_timeout", with = "humantime_serde")]
    pub validation_timeout: Duration,

    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
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

fn default_connect_timeout() -> Duration {
    Duration::from_secs(3)
}

impl ShardConfig {
    pub fn validate(&self) -> TypedResult<()> {
        check_password(&self.password)?;
        check_password(&self.store_password)?;
        if self.number == NODE_NUMBER_UNKNOWN {
            return Err(stratakv_core::typed_err!(Config, "shard number 0 is reserved"));
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

    fn sample() -> ShardConfig {
        serde_yaml::from_str(
            "number: 1\n\
             listen_ip: 127.0.0.1\n\
             listen_port: 15001\n\
             password: a-long-enough-password\n\
             store_ip: 127.0.0.1\n\
             store_port: 15002\n\
             store_password: a-long-enough-password\n\
             mem_size: 1MB\n\
             value_size: 64\n\
             journal_interval: 10s\n\
             gossip_interval: 5s\n",
        )
        .unwrap()
    }

    #[test]
    fn defaults_apply() {
        let cfg = sample();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.mem_size, ByteSize::mb(1));
        assert_eq!(cfg.workers, 4);
        assert!(cfg.seeds.is_empty());
        assert_eq!(cfg.delay_mem, None);
    }

    #[test]
    fn shard_number_zero_is_rejected() {
        let mut cfg = sample();
        cfg.number = 0;
        assert!(cfg.validate().is_err());
    }
}
