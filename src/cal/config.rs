//! The calibration driver's TOML configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Couldn't read config file {}: {source}", .file.display())]
    IO {
        file: PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't parse config file {}: {source}", .file.display())]
    Toml {
        file: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CalConfig {
    pub input: InputConfig,
    pub output: OutputConfig,
    pub observation: ObservationConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InputConfig {
    /// Where the raw correlator files live.
    pub dir: PathBuf,
    /// Raw files are those in `dir` whose names start with this.
    pub date: String,
    /// Load only this IF; 0 loads them all.
    #[serde(default)]
    pub if_use: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OutputConfig {
    pub dir: PathBuf,
    /// Reload the raw data even if it has been loaded before.
    #[serde(default)]
    pub rawclobber: bool,
    /// Overwrite existing products.
    #[serde(default)]
    pub clobber: bool,
    /// Only load, split and classify; don't flag or calibrate.
    #[serde(default)]
    pub skipcal: bool,
}

/// Source-name patterns. Each is a comma-separated list of substrings, except
/// for the primary calibrator's, which is a single substring.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ObservationConfig {
    pub primary: String,
    pub secondary: String,
    #[serde(default)]
    pub polcal: String,
    /// "NONE" means there is no extended-source secondary.
    #[serde(default = "none")]
    pub sec_ext: String,
    #[serde(default)]
    pub ext: String,
}

fn none() -> String {
    "NONE".to_string()
}

impl CalConfig {
    pub fn from_file(file: &Path) -> Result<CalConfig, ConfigError> {
        let contents = std::fs::read_to_string(file).map_err(|source| ConfigError::IO {
            file: file.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Toml {
            file: file.to_path_buf(),
            source,
        })
    }
}

/// Split a comma-separated pattern list. Empty entries are dropped.
pub fn patterns(list: &str) -> Vec<&str> {
    list.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

impl ObservationConfig {
    /// The extended-source secondary pattern, unless disabled.
    pub fn extended_secondary(&self) -> Option<&str> {
        match self.sec_ext.trim() {
            "NONE" | "" => None,
            p => Some(p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
[input]
dir = "/data/raw"
date = "2019-06-23"
if_use = 1

[output]
dir = "cal"
clobber = true

[observation]
primary = "1934-638"
secondary = "0823-500, 1036-697"
polcal = "0823-500"
ext = "j0000"
"#;

    #[test]
    fn parse_a_config() {
        let config: CalConfig = toml::from_str(EXAMPLE).unwrap();
        assert_eq!(config.input.dir, PathBuf::from("/data/raw"));
        assert_eq!(config.input.if_use, 1);
        assert!(config.output.clobber);
        assert!(!config.output.rawclobber);
        assert!(!config.output.skipcal);
        assert_eq!(
            patterns(&config.observation.secondary),
            vec!["0823-500", "1036-697"]
        );
        assert_eq!(config.observation.extended_secondary(), None);
    }

    #[test]
    fn missing_sections_are_errors() {
        let result = toml::from_str::<CalConfig>("[input]\ndir = \"a\"\ndate = \"b\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn pattern_lists() {
        assert!(patterns("").is_empty());
        assert_eq!(patterns("a,,b ,"), vec!["a", "b"]);
    }
}
