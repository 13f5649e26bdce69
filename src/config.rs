//! Manager configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Configuration for the ipset manager.
///
/// ```yaml
/// ipset:
///   - example.com,example.net/4#inet#fw4#example_set
/// ipset_file: /etc/dnsipset/rules.txt
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Inline rule lines
    pub ipset: Vec<String>,
    /// File with one rule line per line. A relative path in a loaded
    /// config file is taken relative to that file's directory.
    pub ipset_file: Option<PathBuf>,
}

impl Config {
    /// Create a config from inline rule lines.
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ipset: lines.into_iter().map(Into::into).collect(),
            ipset_file: None,
        }
    }

    /// Load a config file. Files ending in `.json` are read as JSON,
    /// everything else as YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let mut config: Self = if is_json {
            serde_json::from_str(&content)?
        } else {
            Self::from_yaml_str(&content)?
        };

        if let (Some(file), Some(dir)) = (&mut config.ipset_file, path.parent()) {
            if file.is_relative() {
                *file = dir.join(&*file);
            }
        }

        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// All rule lines: inline lines first, then those from `ipset_file`.
    ///
    /// Blank lines and `#` comments in the file are skipped.
    pub fn lines(&self) -> Result<Vec<String>> {
        let mut lines = self.ipset.clone();

        if let Some(path) = &self.ipset_file {
            let content = fs::read_to_string(path)?;
            lines.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_string),
            );
        }

        Ok(lines)
    }
}
