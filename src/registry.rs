//! Set identifier resolution with a process-lifetime cache.

use ahash::AHashMap;
use std::sync::Arc;

use crate::conn::SetConn;
use crate::error::ResolutionError;
use crate::set::{KeyType, SetHandle, SetId};

/// SetRegistry caches resolved kernel sets by identifier.
///
/// Entries are never refreshed, so kernel-side changes to a set's
/// definition after the first lookup are not picked up.
#[derive(Default)]
pub struct SetRegistry {
    sets: AHashMap<SetId, Arc<SetHandle>>,
}

impl SetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve an identifier, querying the kernel on the first reference.
    ///
    /// Only sets keyed by IPv4 addresses are accepted.
    pub fn resolve<C: SetConn + ?Sized>(
        &mut self,
        conn: &mut C,
        id: &SetId,
    ) -> Result<Arc<SetHandle>, ResolutionError> {
        if let Some(handle) = self.sets.get(id) {
            return Ok(Arc::clone(handle));
        }

        let info = conn.get_set_by_name(id).map_err(ResolutionError::Lookup)?;
        if info.key_type != KeyType::Ipv4Addr {
            return Err(ResolutionError::WrongKeyType(info.key_type));
        }

        let handle = Arc::new(SetHandle::new(id.clone(), &info));
        self.sets.insert(id.clone(), Arc::clone(&handle));

        log::debug!(
            "loaded nftables set {} (table {}, set {}, timeout {})",
            id,
            id.table(),
            id.name(),
            handle.has_timeout()
        );

        Ok(handle)
    }

    /// Number of distinct sets resolved so far.
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::set::{SetFlags, SetInfo};
    use std::net::Ipv4Addr;

    /// Answers queries from a fixed table and counts them.
    struct StaticConn {
        sets: Vec<(SetId, SetInfo)>,
        queries: usize,
    }

    impl SetConn for StaticConn {
        fn get_set_by_name(&mut self, id: &SetId) -> Result<SetInfo, TransportError> {
            self.queries += 1;
            self.sets
                .iter()
                .find(|(s, _)| s == id)
                .map(|(_, info)| info.clone())
                .ok_or_else(|| TransportError::SetNotFound(id.to_string()))
        }

        fn add_elements(&mut self, _: &SetId, _: &[Ipv4Addr]) -> Result<(), TransportError> {
            Ok(())
        }

        fn flush(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn conn() -> StaticConn {
        StaticConn {
            sets: vec![
                (
                    SetId::new("fw4", "v4"),
                    SetInfo {
                        key_type: KeyType::Ipv4Addr,
                        flags: SetFlags::TIMEOUT,
                    },
                ),
                (
                    SetId::new("fw4", "v6"),
                    SetInfo {
                        key_type: KeyType::Ipv6Addr,
                        flags: SetFlags::empty(),
                    },
                ),
            ],
            queries: 0,
        }
    }

    #[test]
    fn test_resolve_caches() {
        let mut conn = conn();
        let mut registry = SetRegistry::new();
        let id = SetId::new("fw4", "v4");

        let first = registry.resolve(&mut conn, &id).unwrap();
        let second = registry.resolve(&mut conn, &id).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.has_timeout());
        assert_eq!(conn.queries, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_resolve_missing_set() {
        let mut conn = conn();
        let mut registry = SetRegistry::new();

        let err = registry
            .resolve(&mut conn, &SetId::new("fw4", "nope"))
            .unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::Lookup(TransportError::SetNotFound(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_resolve_wrong_key_type() {
        let mut conn = conn();
        let mut registry = SetRegistry::new();

        let err = registry
            .resolve(&mut conn, &SetId::new("fw4", "v6"))
            .unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::WrongKeyType(KeyType::Ipv6Addr)
        ));
    }
}
