//! Config line parsing.
//!
//! A config line maps hosts to sets:
//!
//! ```text
//! host1,host2/4#inet#table#set1,4#inet#table#set2
//! ```
//!
//! An empty host registers the catch-all rule.

use crate::error::{ConfigError, Error, Result};
use crate::set::SetId;

/// Hosts and raw set identifiers from one config line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine<'a> {
    /// Lowercased, trimmed hosts
    pub hosts: Vec<String>,
    /// Trimmed, non-empty set identifiers (shape not yet checked)
    pub set_names: Vec<&'a str>,
}

/// Parse one config line into hosts and set identifiers.
pub fn parse_line(line: &str) -> std::result::Result<ParsedLine<'_>, ConfigError> {
    let line = line.trim();

    let mut halves = line.split('/');
    let (Some(hosts), Some(names), None) = (halves.next(), halves.next(), halves.next()) else {
        return Err(ConfigError::ExpectedOneSlash);
    };

    let set_names = names
        .split(',')
        .map(str::trim)
        .map(|n| if n.is_empty() { Err(ConfigError::EmptySetName) } else { Ok(n) })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let hosts = hosts.split(',').map(|h| h.trim().to_lowercase()).collect();

    Ok(ParsedLine { hosts, set_names })
}

/// A fully validated config line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Position of the line in the config
    pub idx: usize,
    /// The raw line
    pub line: String,
    pub hosts: Vec<String>,
    pub sets: Vec<SetId>,
}

/// Parse all config lines, validating every set identifier.
///
/// Fails on the first bad line, naming its index and text.
pub fn parse_rules<S: AsRef<str>>(lines: &[S]) -> Result<Vec<Rule>> {
    lines
        .iter()
        .enumerate()
        .map(|(idx, line)| {
            let line = line.as_ref();
            let config_err = |source| Error::Config {
                idx,
                line: line.to_string(),
                source,
            };

            let parsed = parse_line(line).map_err(config_err)?;
            let sets = parsed
                .set_names
                .iter()
                .map(|name| SetId::parse(name))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(config_err)?;

            Ok(Rule {
                idx,
                line: line.to_string(),
                hosts: parsed.hosts,
                sets,
            })
        })
        .collect()
}
