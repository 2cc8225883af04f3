//! Error handling for this crate
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A Result carrying a SystemError with its accompanying source
pub type TypedResult<T> = Result<T, TypedError>;

/// The classified failure kinds of the system.
///
/// Resource-exhaustion kinds (`MemoryFull`, `MemoryBlocked`, `TableBlocked`,
/// `QuantumExhausted`) are intercepted by the task scheduler and lead to
/// re-scheduling instead of completion; everything else surfaces to the
/// requester.
#[derive(Error, Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum SystemError {
    #[error("Generic error")]
    Generic,
    #[error("Configuration error")]
    Config,
    #[error("Initialization error")]
    Init,
    #[error("Store node is unavailable")]
    NetStoreUnavailable,
    #[error("Shard node is unavailable")]
    NetShardUnavailable,
    #[error("Table is blocked")]
    TableBlocked,
    #[error("Memory is blocked")]
    MemoryBlocked,
    #[error("Memory is full")]
    MemoryFull,
    #[error("Script quantum exhausted")]
    QuantumExhausted,
}

impl SystemError {
    /// Stable numeric code used on the wire and as process exit code.
    pub fn code(self) -> u32 {
        match self {
            SystemError::Generic => 1,
            SystemError::Config => 2,
            SystemError::Init => 3,
            SystemError::NetStoreUnavailable => 4,
            SystemError::NetShardUnavailable => 5,
            SystemError::TableBlocked => 6,
            SystemError::MemoryBlocked => 7,
            SystemError::MemoryFull => 8,
            SystemError::QuantumExhausted => 9,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            2 => SystemError::Config,
            3 => SystemError::Init,
            4 => SystemError::NetStoreUnavailable,
            5 => SystemError::NetShardUnavailable,
            6 => SystemError::TableBlocked,
            7 => SystemError::MemoryBlocked,
            8 => SystemError::MemoryFull,
            9 => SystemError::QuantumExhausted,
            _ => SystemError::Generic,
        }
    }
}

/// Combination of a SystemError with an anyhow error
#[derive(Error, Debug)]
#[error("{err:?}: {source:?}")]
pub struct TypedError {
    err: SystemError,
    source: anyhow::Error,
}

impl TypedError {
    /// Creates a new TypedError
    pub fn new(err: SystemError, source: anyhow::Error) -> Self {
        Self { err, source }
    }

    /// Returns the SystemError of this TypedError
    pub fn err(&self) -> SystemError {
        self.err
    }

    /// Returns the anyhow error of this TypedError
    pub fn source(&self) -> &anyhow::Error {
        &self.source
    }

    /// The human-readable description carried to the requester.
    pub fn description(&self) -> String {
        self.source.to_string()
    }
}

impl Clone for TypedError {
    fn clone(&self) -> Self {
        Self {
            err: self.err,
            source: anyhow::anyhow!("{}", self.source),
        }
    }
}

/// Converts a Result into one of our own Result types
pub trait ResultExt<T> {
    /// Converts a Result to a TypedResult
    fn typ(self, err: SystemError) -> TypedResult<T>;
}

impl<T, E: Into<anyhow::Error>> ResultExt<T> for Result<T, E> {
    fn typ(self, err: SystemError) -> TypedResult<T> {
        self.map_err(|e| TypedError {
            err,
            source: e.into(),
        })
    }
}

/// Shorthand to build a `TypedError` from a format string
#[macro_export]
macro_rules! typed_err {
    ($kind:ident, $($tail:tt)*) => {
        $crate::error::TypedError::new(
            $crate::error::SystemError::$kind,
            ::anyhow::anyhow!($($tail)*),
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trip() {
        for kind in [
            SystemError::Generic,
            SystemError::Config,
            SystemError::Init,
            SystemError::NetStoreUnavailable,
            SystemError::NetShardUnavailable,
            SystemError::TableBlocked,
            SystemError::MemoryBlocked,
            SystemError::MemoryFull,
            SystemError::QuantumExhausted,
        ] {
            assert_eq!(SystemError::from_code(kind.code()), kind);
        }
    }

    #[test]
    fn result_ext_attaches_kind() {
        let res: Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        let typed = res.typ(SystemError::Init).unwrap_err();
        assert_eq!(typed.err(), SystemError::Init);
        assert!(typed.description().contains("boom"));
    }
}
