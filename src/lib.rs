//! dnsipset - Populate nftables address sets from DNS resolution results.
//!
//! When a host matching a configured rule resolves, its addresses are
//! added to the kernel sets configured for that host, so firewall and
//! routing rules keyed on those sets apply to its traffic.
//!
//! # Features
//!
//! - **Rule lines**: `host1,host2/4#inet#table#set1,4#inet#table#set2`
//! - **Subdomain matching**: a rule for `example.com` covers `www.example.com`;
//!   the most specific rule wins, the empty host is a catch-all
//! - **Deduplication**: addresses already in a set without timeout are not
//!   sent to the kernel again
//! - **Thread-safe**: all kernel calls are serialized by one lock
//!
//! Sets must already exist; they are never created or deleted here. Only
//! IPv4 sets in `inet` tables are supported.
//!
//! # Quick Start
//!
//! ```ignore
//! use dnsipset::{new_manager, Config};
//!
//! let config = Config::from_lines(["example.com/4#inet#fw4#example_set"]);
//! if let Some(manager) = new_manager(&config)? {
//!     let ip = "93.184.216.34".parse()?;
//!     let added = manager.add("www.example.com", &[ip], &[])?;
//!     manager.close()?;
//! }
//! ```

mod config;
mod dedup;
mod error;
mod index;
mod manager;
mod parser;
mod registry;
mod set;

pub mod conn;

// Re-export core types
pub use error::{
    ConfigError, Error, MutationStage, ResolutionError, Result, TransportError,
};
pub use set::{KeyType, SetFlags, SetHandle, SetId, SetInfo};

pub use config::Config;
pub use dedup::DedupCache;
pub use index::DomainIndex;
pub use parser::{parse_line, parse_rules, ParsedLine, Rule};
pub use registry::SetRegistry;

pub use manager::{normalize_host, IpsetManager, Manager};

#[cfg(target_os = "linux")]
pub use manager::new_manager;
