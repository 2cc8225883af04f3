//! Table records, metadata and consistency classes shared by all nodes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub const TABLE_NAME_LEN_MAX: usize = 255;
pub const MAX_TABLES: usize = 4096;

/// A single row: keys partition and identify, timestamps order competing
/// writes (last writer by timestamp wins), values are opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: u16,
    pub timestamp: u64,
    pub value: String,
}

impl Record {
    pub fn new(key: u16, value: impl Into<String>, timestamp: u64) -> Self {
        Self {
            key,
            timestamp,
            value: value.into(),
        }
    }

    /// Partition this record belongs to for a table with `partitions` parts.
    pub fn partition(&self, partitions: u16) -> u16 {
        self.key % partitions
    }
}

/// Milliseconds since the unix epoch, the timestamp domain of records.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Consistency class a table is created with; drives shard-node selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Consistency {
    /// Routing-only class for describe and other reads that do not need
    /// correctness guarantees.
    None,
    /// A single shard node serves every request.
    Strong,
    /// Requests are sharded over the assigned nodes by key.
    StrongHashed,
    /// Round-robin over the assigned nodes.
    Eventual,
}

impl Consistency {
    pub const COUNT: usize = 4;

    pub fn index(self) -> usize {
        match self {
            Consistency::None => 0,
            Consistency::Strong => 1,
            Consistency::StrongHashed => 2,
            Consistency::Eventual => 3,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Consistency::None),
            1 => Some(Consistency::Strong),
            2 => Some(Consistency::StrongHashed),
            3 => Some(Consistency::Eventual),
            _ => None,
        }
    }

    /// Parses the LQL token (`SC`, `SHC`, `EC`), case-insensitively.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "SC" => Some(Consistency::Strong),
            "SHC" => Some(Consistency::StrongHashed),
            "EC" => Some(Consistency::Eventual),
            _ => None,
        }
    }

    pub fn all() -> [Consistency; Self::COUNT] {
        [
            Consistency::None,
            Consistency::Strong,
            Consistency::StrongHashed,
            Consistency::Eventual,
        ]
    }
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Consistency::None => "INDISTINCT",
            Consistency::Strong => "STRONG",
            Consistency::StrongHashed => "STRONG-HASHED",
            Consistency::Eventual => "EVENTUAL",
        };
        f.write_str(name)
    }
}

/// Metadata of a table, persisted by the store node and cached by the
/// router for dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub name: String,
    pub consistency: Consistency,
    pub partitions: u16,
    /// Interval between merges of this table's dumps, in milliseconds.
    pub compaction_interval_ms: u32,
}

impl TableMeta {
    pub fn new(
        name: impl Into<String>,
        consistency: Consistency,
        partitions: u16,
        compaction_interval_ms: u32,
    ) -> Self {
        Self {
            name: name.into(),
            consistency,
            partitions,
            compaction_interval_ms,
        }
    }

    /// Validates the user-supplied parameters of a CREATE.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() || self.name.len() > TABLE_NAME_LEN_MAX {
            return Err(format!(
                "table name length must be in 1..={TABLE_NAME_LEN_MAX} characters"
            ));
        }
        if self.partitions == 0 {
            return Err("a table needs at least one partition".to_owned());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistency_tokens() {
        assert_eq!(Consistency::from_token("sc"), Some(Consistency::Strong));
        assert_eq!(Consistency::from_token("SHC"), Some(Consistency::StrongHashed));
        assert_eq!(Consistency::from_token("Ec"), Some(Consistency::Eventual));
        assert_eq!(Consistency::from_token("XX"), None);
    }

    #[test]
    fn consistency_index_round_trip() {
        for c in Consistency::all() {
            assert_eq!(Consistency::from_index(c.index() as u8), Some(c));
        }
        assert_eq!(Consistency::from_index(9), None);
    }

    #[test]
    fn record_partitioning() {
        let r = Record::new(17, "abc", 1000);
        assert_eq!(r.partition(4), 1);
        assert_eq!(r.partition(1), 0);
    }

    #[test]
    fn meta_validation() {
        let mut meta = TableMeta::new("T", Consistency::Strong, 4, 60_000);
        assert!(meta.validate().is_ok());
        meta.partitions = 0;
        assert!(meta.validate().is_err());
        meta.partitions = 1;
        meta.name.clear();
        assert!(meta.validate().is_err());
    }
}
