//! Shared configuration plumbing for the node binaries.
//!
//! Each node deserializes its own YAML config struct; the fragments and
//! helpers every node needs (seed lists, size strings, file loading, hot
//! reload watching) live here.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, TryRecvError};

use anyhow::Context;
use bytesize::ByteSize;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{ResultExt, SystemError, TypedResult};

pub const MIN_PASSWORD_LEN: usize = 12;
pub const MAX_PASSWORD_LEN: usize = 32;

/// A gossip seed endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SeedConfig {
    pub ip: String,
    pub port: u16,
}

/// Deserializes byte sizes given as strings ("64MB", "1.5GiB").
pub fn de_size_str<'de, D>(de: D) -> Result<ByteSize, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(de)?
        .parse::<ByteSize>()
        .map_err(serde::de::Error::custom)
}

/// Loads and deserializes a YAML config file.
pub fn load<T: DeserializeOwned>(path: &Path) -> TypedResult<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file '{}'", path.display()))
        .typ(SystemError::Config)?;
    serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing config file '{}'", path.display()))
        .typ(SystemError::Config)
}

/// Validates an inter-node password against the accepted length range.
pub fn check_password(password: &str) -> TypedResult<()> {
    if password.len() < MIN_PASSWORD_LEN || password.len() > MAX_PASSWORD_LEN {
        return Err(crate::typed_err!(
            Config,
            "password length must be within {MIN_PASSWORD_LEN}..={MAX_PASSWORD_LEN} characters"
        ));
    }
    Ok(())
}

/// Watches a config file and reports modifications, for the keys that are
/// hot-reloadable.
pub struct ConfigWatcher {
    path: PathBuf,
    rx: Receiver<()>,
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    pub fn new(path: &Path) -> TypedResult<Self> {
        let (tx, rx) = channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                if event.kind.is_modify() || event.kind.is_create() {
                    let _ = tx.send(());
                }
            }
        })
        .typ(SystemError::Init)?;

        // watch the parent so editors that replace the file are seen too
        let target = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        watcher
            .watch(target, RecursiveMode::NonRecursive)
            .with_context(|| format!("watching '{}'", target.display()))
            .typ(SystemError::Init)?;

        Ok(Self {
            path: path.to_owned(),
            rx,
            _watcher: watcher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drains pending notifications; true if the file changed since the
    /// last call.
    pub fn changed(&self) -> bool {
        let mut changed = false;
        loop {
            match self.rx.try_recv() {
                Ok(()) => changed = true,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        port: u16,
        #[serde(deserialize_with = "de_size_str")]
        mem: ByteSize,
    }

    #[test]
    fn loads_yaml_with_size_strings() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name: shard-1\nport: 15001\nmem: 64MB").unwrap();
        let sample: Sample = load(file.path()).unwrap();
        assert_eq!(sample.name, "shard-1");
        assert_eq!(sample.port, 15001);
        assert_eq!(sample.mem, ByteSize::mb(64));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = load::<Sample>(Path::new("/nonexistent/node.yaml")).unwrap_err();
        assert_eq!(err.err(), SystemError::Config);
    }

    #[test]
    fn password_length_bounds() {
        assert!(check_password("short").is_err());
        assert!(check_password("a-long-enough-password").is_ok());
        assert!(check_password(&"x".repeat(MAX_PASSWORD_LEN + 1)).is_err());
    }

    #[test]
    fn watcher_reports_modifications() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.yaml");
        std::fs::write(&path, "a: 1\n").unwrap();

        let watcher = ConfigWatcher::new(&path).unwrap();
        assert!(!watcher.changed());

        std::fs::write(&path, "a: 2\n").unwrap();
        // notify delivers asynchronously
        std::thread::sleep(std::time::Duration::from_millis(200));
        assert!(watcher.changed());
    }
}
