//! Kernel address set identifiers and handles.

use bitflags::bitflags;
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// nftables data type of IPv4 address keys.
pub const TYPE_IPADDR: u32 = 7;

/// nftables data type of IPv6 address keys.
pub const TYPE_IP6ADDR: u32 = 8;

bitflags! {
    /// nftables set flags as reported by the kernel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SetFlags: u32 {
        /// Anonymous set bound to a single rule.
        const ANONYMOUS = 0x1;
        /// Set contents may not change.
        const CONSTANT = 0x2;
        /// Set holds ranges.
        const INTERVAL = 0x4;
        /// Set is a map.
        const MAP = 0x8;
        /// Elements expire after a timeout.
        const TIMEOUT = 0x10;
        /// Set is updated from the packet path.
        const EVAL = 0x20;
    }
}

/// Identifier of an nftables set, written as `4#inet#table#set`.
///
/// Only IPv4 sets in `inet` tables are accepted, so those two fields are
/// implied and only the table and set names are stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SetId {
    table: String,
    name: String,
}

impl SetId {
    /// Create an identifier for the set `name` in the inet table `table`.
    pub fn new(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            name: name.into(),
        }
    }

    /// Parse an identifier in `4#inet#table#set` form.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let mut parts = s.split('#');
        let (Some(family), Some(table_family), Some(table), Some(name), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(ConfigError::WrongFormat(s.to_string()));
        };

        if family != "4" {
            return Err(ConfigError::UnsupportedAddressFamily(family.to_string()));
        }
        if table_family != "inet" {
            return Err(ConfigError::UnsupportedTableFamily(table_family.to_string()));
        }
        if table.is_empty() || name.is_empty() {
            return Err(ConfigError::WrongFormat(s.to_string()));
        }

        Ok(Self::new(table, name))
    }

    /// Name of the table holding the set.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Name of the set.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FromStr for SetId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "4#inet#{}#{}", self.table, self.name)
    }
}

/// Key type of a kernel set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// `ipv4_addr`
    Ipv4Addr,
    /// `ipv6_addr`
    Ipv6Addr,
    /// Any other nftables data type
    Other(u32),
}

impl KeyType {
    /// Convert from an nftables data type value.
    pub fn from_u32(v: u32) -> Self {
        match v {
            TYPE_IPADDR => KeyType::Ipv4Addr,
            TYPE_IP6ADDR => KeyType::Ipv6Addr,
            other => KeyType::Other(other),
        }
    }

    /// Convert to an nftables data type value.
    pub fn as_u32(self) -> u32 {
        match self {
            KeyType::Ipv4Addr => TYPE_IPADDR,
            KeyType::Ipv6Addr => TYPE_IP6ADDR,
            KeyType::Other(v) => v,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Ipv4Addr => write!(f, "ipv4_addr"),
            KeyType::Ipv6Addr => write!(f, "ipv6_addr"),
            KeyType::Other(v) => write!(f, "type {}", v),
        }
    }
}

/// Set description returned by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetInfo {
    pub key_type: KeyType,
    pub flags: SetFlags,
}

/// A resolved kernel set.
///
/// Fetched once per identifier and never updated afterwards, so kernel-side
/// membership changes are not reflected here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetHandle {
    id: SetId,
    key_type: KeyType,
    has_timeout: bool,
}

impl SetHandle {
    /// Create a handle from a kernel set description.
    pub fn new(id: SetId, info: &SetInfo) -> Self {
        Self {
            id,
            key_type: info.key_type,
            has_timeout: info.flags.contains(SetFlags::TIMEOUT),
        }
    }

    pub fn id(&self) -> &SetId {
        &self.id
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Whether the kernel expires elements of this set on its own.
    pub fn has_timeout(&self) -> bool {
        self.has_timeout
    }
}
