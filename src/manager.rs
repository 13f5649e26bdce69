//! The ipset manager: adds resolved addresses to the sets configured for
//! their domain.

use parking_lot::Mutex;
use std::borrow::Cow;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use crate::conn::SetConn;
use crate::dedup::DedupCache;
use crate::error::{Error, MutationStage, Result};
use crate::index::DomainIndex;
use crate::parser::parse_rules;
use crate::registry::SetRegistry;
use crate::set::{KeyType, SetHandle};

#[cfg(target_os = "linux")]
use crate::{conn::NftConn, config::Config};

/// IpsetManager adds the IP addresses of resolved hosts to kernel sets.
///
/// How to check on a real Linux machine:
///
/// 1. `nft add table inet fw4; nft add set inet fw4 example_set { type ipv4_addr; }`
/// 2. Configure `example.com/4#inet#fw4#example_set`.
/// 3. Resolve `example.com` or one of its subdomains.
/// 4. `nft list set inet fw4 example_set` now lists the addresses.
pub trait IpsetManager: Send + Sync {
    /// Add the addresses of `host` to every set configured for it and
    /// return how many elements were inserted.
    fn add(&self, host: &str, ip4s: &[IpAddr], ip6s: &[IpAddr]) -> Result<usize>;

    /// Release the kernel connection.
    fn close(&self) -> Result<()>;
}

/// Open a manager for the configured rules against the kernel.
///
/// Returns `Ok(None)` when no rules are configured; no connection is made
/// in that case.
#[cfg(target_os = "linux")]
pub fn new_manager(config: &Config) -> Result<Option<Manager<NftConn>>> {
    let lines = config.lines()?;
    if lines.is_empty() {
        log::debug!("no ipset rules configured");
        return Ok(None);
    }

    let conn = NftConn::open()?;
    Manager::with_conn(&lines, conn).map(Some)
}

/// Manager is the nftables-backed [`IpsetManager`].
///
/// All calls are serialized by one lock, so kernel mutations of two
/// [`Manager::add`] calls never interleave.
pub struct Manager<C> {
    state: Mutex<State<C>>,
}

struct State<C> {
    /// None once closed
    conn: Option<C>,
    registry: SetRegistry,
    index: DomainIndex<Arc<SetHandle>>,
    dedup: DedupCache,
}

impl<C: SetConn> Manager<C> {
    /// Build a manager from rule lines, resolving every referenced set.
    ///
    /// All lines are validated before the kernel is queried. Fails on the
    /// first malformed line or unresolvable set.
    pub fn with_conn<S: AsRef<str>>(lines: &[S], mut conn: C) -> Result<Self> {
        let rules = parse_rules(lines)?;

        let mut registry = SetRegistry::new();
        let mut index = DomainIndex::new();

        for rule in &rules {
            let mut sets = Vec::with_capacity(rule.sets.len());
            for id in &rule.sets {
                let handle =
                    registry
                        .resolve(&mut conn, id)
                        .map_err(|source| Error::Resolution {
                            idx: rule.idx,
                            line: rule.line.clone(),
                            id: id.clone(),
                            source,
                        })?;
                sets.push(handle);
            }

            for host in &rule.hosts {
                index.insert(host, sets.iter().cloned());
            }
        }

        log::debug!(
            "nftables ipset manager initialized: {} domains, {} sets",
            index.len(),
            registry.len()
        );

        Ok(Self::from_parts(conn, registry, index))
    }

    fn from_parts(conn: C, registry: SetRegistry, index: DomainIndex<Arc<SetHandle>>) -> Self {
        Self {
            state: Mutex::new(State {
                conn: Some(conn),
                registry,
                index,
                dedup: DedupCache::new(),
            }),
        }
    }

    /// Add the addresses of `host` to its sets.
    ///
    /// Only IPv4 sets are filled; IPv6 sets are skipped and `ip6s` is
    /// currently unused. Addresses already committed to a set without
    /// timeout are not sent again. The first kernel error stops the call;
    /// sets completed before it stay applied.
    pub fn add(&self, host: &str, ip4s: &[IpAddr], _ip6s: &[IpAddr]) -> Result<usize> {
        let mut state = self.state.lock();
        let State {
            conn, index, dedup, ..
        } = &mut *state;
        let conn = conn.as_mut().ok_or(Error::Closed)?;

        let host = normalize_host(host);
        let sets = index.lookup(&host);
        if sets.is_empty() {
            return Ok(0);
        }

        log::debug!("found {} nftables sets for host {}", sets.len(), host);

        let mut n = 0;
        for set in sets {
            match set.key_type() {
                KeyType::Ipv4Addr => {}
                KeyType::Ipv6Addr => {
                    log::debug!("skipping IPv6 set {} (not supported)", set.id());
                    continue;
                }
                key_type => {
                    return Err(Error::UnexpectedKeyType {
                        set: set.id().clone(),
                        key_type,
                    })
                }
            }

            let added = add_ips(conn, dedup, &host, set, ip4s, n)?;
            log::debug!(
                "added {} ips to nftables set {} for host {}",
                added,
                set.id(),
                host
            );

            n += added;
        }

        Ok(n)
    }

    /// Close the kernel connection. Later calls return [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        let mut conn = state.conn.take().ok_or(Error::Closed)?;
        conn.close()?;

        log::info!("nftables ipset manager closed");
        Ok(())
    }

    /// Number of distinct sets referenced by the rules.
    pub fn set_count(&self) -> usize {
        self.state.lock().registry.len()
    }

    /// Number of (set, address) pairs remembered as already inserted.
    pub fn cached_ip_count(&self) -> usize {
        self.state.lock().dedup.len()
    }
}

impl<C: SetConn> IpsetManager for Manager<C> {
    fn add(&self, host: &str, ip4s: &[IpAddr], ip6s: &[IpAddr]) -> Result<usize> {
        Manager::add(self, host, ip4s, ip6s)
    }

    fn close(&self) -> Result<()> {
        Manager::close(self)
    }
}

/// Insert the new IPv4 addresses into one set with a single add and
/// flush. `applied` is only used to annotate errors.
fn add_ips<C: SetConn>(
    conn: &mut C,
    dedup: &mut DedupCache,
    host: &str,
    set: &SetHandle,
    ips: &[IpAddr],
    applied: usize,
) -> Result<usize> {
    // Sets with timeout expire elements on their own, so they must be
    // refilled on every resolution.
    let track = !set.has_timeout();

    let elements: Vec<Ipv4Addr> = ips
        .iter()
        .filter_map(|ip| to_ipv4(*ip))
        .filter(|ip| !(track && dedup.has(set.id(), IpAddr::V4(*ip))))
        .collect();
    if elements.is_empty() {
        return Ok(0);
    }

    let mutation_err = |stage, source| Error::Mutation {
        host: host.to_string(),
        set: set.id().clone(),
        stage,
        applied,
        source,
    };

    conn.add_elements(set.id(), &elements)
        .map_err(|e| mutation_err(MutationStage::AddElements, e))?;
    // Not atomic with the add above: a failed flush may still leave the
    // kernel ahead of the cache.
    conn.flush()
        .map_err(|e| mutation_err(MutationStage::Flush, e))?;

    if track {
        for ip in &elements {
            dedup.add(set.id(), IpAddr::V4(*ip));
        }
    }

    Ok(elements.len())
}

fn to_ipv4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

/// Lowercase `host` and drop its root dot, allocating only when needed.
///
/// [`Manager::add`] matches hosts in this form.
pub fn normalize_host(host: &str) -> Cow<'_, str> {
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.bytes().any(|b| b.is_ascii_uppercase()) {
        Cow::Owned(host.to_ascii_lowercase())
    } else {
        Cow::Borrowed(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::set::{SetFlags, SetId, SetInfo};

    #[derive(Default)]
    struct CountingConn {
        adds: Vec<(SetId, Vec<Ipv4Addr>)>,
        flushes: usize,
    }

    impl SetConn for CountingConn {
        fn get_set_by_name(&mut self, id: &SetId) -> std::result::Result<SetInfo, TransportError> {
            Err(TransportError::SetNotFound(id.to_string()))
        }

        fn add_elements(
            &mut self,
            id: &SetId,
            elements: &[Ipv4Addr],
        ) -> std::result::Result<(), TransportError> {
            self.adds.push((id.clone(), elements.to_vec()));
            Ok(())
        }

        fn flush(&mut self) -> std::result::Result<(), TransportError> {
            self.flushes += 1;
            Ok(())
        }

        fn close(&mut self) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    fn handle(name: &str, key_type: KeyType) -> Arc<SetHandle> {
        let info = SetInfo {
            key_type,
            flags: SetFlags::empty(),
        };
        Arc::new(SetHandle::new(SetId::new("fw4", name), &info))
    }

    fn manager(sets: Vec<Arc<SetHandle>>) -> Manager<CountingConn> {
        let mut index = DomainIndex::new();
        index.insert("example.org", sets);
        Manager::from_parts(CountingConn::default(), SetRegistry::new(), index)
    }

    #[test]
    fn test_ipv6_set_skipped() {
        let m = manager(vec![handle("v6", KeyType::Ipv6Addr)]);
        let ip6: IpAddr = "2001:db8::1".parse().unwrap();
        let ip4: IpAddr = "1.2.3.4".parse().unwrap();

        let n = m.add("example.org", &[ip4], &[ip6]).unwrap();
        assert_eq!(n, 0);

        let state = m.state.lock();
        let conn = state.conn.as_ref().unwrap();
        assert!(conn.adds.is_empty());
        assert_eq!(conn.flushes, 0);
    }

    #[test]
    fn test_ipv6_set_does_not_stop_ipv4_set() {
        let m = manager(vec![handle("v6", KeyType::Ipv6Addr), handle("v4", KeyType::Ipv4Addr)]);
        let ip4: IpAddr = "1.2.3.4".parse().unwrap();

        assert_eq!(m.add("example.org", &[ip4], &[]).unwrap(), 1);

        let state = m.state.lock();
        let conn = state.conn.as_ref().unwrap();
        assert_eq!(conn.adds, vec![(SetId::new("fw4", "v4"), vec![Ipv4Addr::new(1, 2, 3, 4)])]);
    }

    #[test]
    fn test_unexpected_key_type_aborts() {
        let m = manager(vec![handle("odd", KeyType::Other(9)), handle("v4", KeyType::Ipv4Addr)]);
        let ip4: IpAddr = "1.2.3.4".parse().unwrap();

        let err = m.add("example.org", &[ip4], &[]).unwrap_err();
        assert!(matches!(
            err,
            Error::UnexpectedKeyType {
                key_type: KeyType::Other(9),
                ..
            }
        ));
        assert!(m.state.lock().conn.as_ref().unwrap().adds.is_empty());
    }

    #[test]
    fn test_mapped_and_ipv6_addresses_in_ip4_list() {
        let m = manager(vec![handle("v4", KeyType::Ipv4Addr)]);
        let mapped = IpAddr::V6(Ipv4Addr::new(5, 6, 7, 8).to_ipv6_mapped());
        let native6: IpAddr = "2001:db8::1".parse().unwrap();

        assert_eq!(m.add("example.org", &[mapped, native6], &[]).unwrap(), 1);
        // The plain IPv4 form is the same element.
        let v4: IpAddr = "5.6.7.8".parse().unwrap();
        assert_eq!(m.add("example.org", &[v4], &[]).unwrap(), 0);
    }

    #[test]
    fn test_normalize_host() {
        assert!(matches!(normalize_host("example.com"), Cow::Borrowed("example.com")));
        assert_eq!(normalize_host("Example.COM."), "example.com");
        assert_eq!(normalize_host(""), "");
    }
}
