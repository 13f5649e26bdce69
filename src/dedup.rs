//! Record of addresses already committed to non-expiring sets.

use ahash::{AHashMap, AHashSet};
use std::net::IpAddr;

use crate::set::SetId;

/// Converts an address to its 16-byte form. IPv4 and IPv4-mapped IPv6
/// addresses produce the same key.
pub fn ip_key(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// DedupCache tracks (set, address) pairs known to be in the kernel.
///
/// Entries are never evicted.
#[derive(Debug, Default)]
pub struct DedupCache {
    added: AHashMap<SetId, AHashSet<[u8; 16]>>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, set: &SetId, ip: IpAddr) -> bool {
        self.added
            .get(set)
            .is_some_and(|ips| ips.contains(&ip_key(ip)))
    }

    pub fn add(&mut self, set: &SetId, ip: IpAddr) {
        let key = ip_key(ip);
        match self.added.get_mut(set) {
            Some(ips) => {
                ips.insert(key);
            }
            None => {
                self.added.insert(set.clone(), AHashSet::from_iter([key]));
            }
        }
    }

    /// Total number of cached pairs.
    pub fn len(&self) -> usize {
        self.added.values().map(|ips| ips.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
