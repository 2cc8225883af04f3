//! Configuration for the router node.
//!
//! ```yaml
//! password: a-long-enough-password
//! quantum: 2
//! gossip_interval: 5s
//! metadata_interval: 10s
//! seeds:
//!   - ip: 127.0.0.1
//!     port: 15001
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use stratakv_core::config::{check_password, SeedConfig};
use stratakv_core::error::TypedResult;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouterConfig {
    /// Password presented to shard nodes on AUTH.
    pub password: String,

    #[serde(default = "default_workers")]
    pub workers: u16,

    /// Script lines executed per wake-up before the runner yields.
    #[serde(default = "default_quantum")]
    pub quantum: u32,

    /// Interval between gossip rounds.
    #[serde(with = "humantime_serde")]
    pub gossip_interval: Duration,

    /// Interval between table-metadata refreshes.
    #[serde(with = "humantime_serde")]
    pub metadata_interval: Duration,

    /// Gossip seed endpoints (shard nodes to bootstrap from).
    #[serde(default)]
    pub seeds: Vec<SeedConfig>,

    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

fn default_workers() -> u16 {
    4
}

fn default_quantum() -> u32 {
    2
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(3)
}

impl RouterConfig {
    pub fn validate(&self) -> TypedResult<()> {
        check_password(&self.password)?;
        if self.quantum == 0 {
            return Err(stratakv_core::typed_err!(Config, "quantum must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let cfg: RouterConfig = serde_yaml::from_str(
            "password: a-long-enough-password\n\
             gossip_interval: 5s\n\
             metadata_interval: 10s\n",
        )
        .unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.quantum, 2);
        assert_eq!(cfg.workers, 4);
        assert!(cfg.seeds.is_empty());
    }

    #[test]
    fn zero_quantum_is_rejected() {
        let mut cfg: RouterConfig = serde_yaml::from_str(
            "password: a-long-enough-password\n\
             gossip_interval: 5s\n\
             metadata_interval: 10s\n",
        )
        .unwrap();
        cfg.quantum = 0;
        assert!(cfg.validate().is_err());
    }
}
