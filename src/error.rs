//! Error types for dnsipset.

use std::fmt;
use thiserror::Error;

use crate::set::{KeyType, SetId};

/// Error type for dnsipset operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A config line could not be parsed
    #[error("config line at idx {idx} ({line}): {source}")]
    Config {
        idx: usize,
        line: String,
        #[source]
        source: ConfigError,
    },

    /// A set referenced by a config line could not be resolved
    #[error("resolving set {id} from config line at idx {idx} ({line}): {source}")]
    Resolution {
        idx: usize,
        line: String,
        id: SetId,
        #[source]
        source: ResolutionError,
    },

    /// A matched set has a key type the manager cannot fill
    #[error("set {set} has unexpected key type {key_type}")]
    UnexpectedKeyType { set: SetId, key_type: KeyType },

    /// Adding elements to a set failed at runtime.
    ///
    /// `applied` is the number of addresses already committed to other
    /// sets earlier in the same call. Those are not rolled back.
    #[error("{stage} for {host:?} to set {set} ({applied} already applied): {source}")]
    Mutation {
        host: String,
        set: SetId,
        stage: MutationStage,
        applied: usize,
        #[source]
        source: TransportError,
    },

    /// Control-plane transport error outside of a mutation
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The manager has already been closed
    #[error("ipset manager is closed")]
    Closed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for dnsipset operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Which kernel call of a mutation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStage {
    /// Queuing the new elements
    AddElements,
    /// Committing the queued batch
    Flush,
}

impl fmt::Display for MutationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationStage::AddElements => write!(f, "adding elements"),
            MutationStage::Flush => write!(f, "flushing changes"),
        }
    }
}

/// Error type for config line parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The line does not contain exactly one slash
    #[error("expected one slash")]
    ExpectedOneSlash,

    /// An empty set identifier between commas
    #[error("empty ipset name")]
    EmptySetName,

    /// Identifier is not `4#inet#table#set`
    #[error("wrong format {0:?}, expected 4#inet#table#set")]
    WrongFormat(String),

    /// Address family other than `4`
    #[error("only IPv4 sets supported (4#...), got {0:?}")]
    UnsupportedAddressFamily(String),

    /// Table family other than `inet`
    #[error("only inet family supported, got {0:?}")]
    UnsupportedTableFamily(String),
}

/// Error type for set resolution.
#[derive(Error, Debug)]
pub enum ResolutionError {
    /// The kernel query failed or the set does not exist
    #[error("getting set: {0}")]
    Lookup(#[source] TransportError),

    /// The set exists but is not keyed by IPv4 addresses
    #[error("wrong type {0}, expected ipv4_addr")]
    WrongKeyType(KeyType),
}

/// Error type for the kernel control-plane transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Socket error
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// The kernel answered with an error code
    #[error("netlink error: errno {0}")]
    Netlink(i32),

    /// The requested set does not exist
    #[error("set not found: {0}")]
    SetNotFound(String),

    /// The kernel reply could not be decoded
    #[error("malformed reply: {0}")]
    Malformed(&'static str),

    /// The connection was already closed
    #[error("connection closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_names_line() {
        let err = Error::Config {
            idx: 3,
            line: "bad".to_string(),
            source: ConfigError::ExpectedOneSlash,
        };
        assert_eq!(err.to_string(), "config line at idx 3 (bad): expected one slash");
    }

    #[test]
    fn test_mutation_error_display() {
        let err = Error::Mutation {
            host: "example.com".to_string(),
            set: SetId::new("fw4", "example_set"),
            stage: MutationStage::Flush,
            applied: 2,
            source: TransportError::Closed,
        };
        let msg = err.to_string();
        assert!(msg.starts_with("flushing changes for \"example.com\""));
        assert!(msg.contains("4#inet#fw4#example_set"));
        assert!(msg.contains("2 already applied"));
    }
}
