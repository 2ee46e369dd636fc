//! Finding raw files and split sources, and sorting sources into roles.

use std::{
    collections::BTreeSet,
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use glob::{glob, Pattern};
use itertools::Itertools;
use log::{debug, info, warn};

use super::{
    config::{patterns, InputConfig, ObservationConfig},
    CalError,
};

/// The sources of one frequency band, by role.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BandSources {
    pub band: String,
    /// Every source observed in this band.
    pub all: Vec<String>,
    pub primary: String,
    pub secondaries: Vec<String>,
    pub extended_secondary: Option<String>,
    pub polcals: Vec<String>,
    pub targets: Vec<String>,
    pub extended_targets: Vec<String>,
}

fn sorted_glob(pattern: &str) -> Result<Vec<PathBuf>, CalError> {
    let mut paths = glob(pattern)?.collect::<Result<Vec<_>, _>>()?;
    paths.sort_unstable();
    Ok(paths)
}

/// The raw correlator files for the configured date.
pub fn raw_files(input: &InputConfig) -> Result<Vec<PathBuf>, CalError> {
    let pattern = format!(
        "{}/{}*",
        Pattern::escape(&input.dir.display().to_string()),
        input.date
    );
    debug!("Looking for raw files with {pattern}");
    sorted_glob(&pattern)
}

/// The first word of every line of a setup file, ignoring comments. A missing
/// file means there's nothing to ignore.
pub fn read_setup_file(file: &Path) -> Result<Vec<String>, CalError> {
    let f = match File::open(file) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("Setup file {} doesn't exist; not ignoring any raw files", file.display());
            return Ok(vec![]);
        }
        Err(e) => return Err(e.into()),
    };
    let mut names = vec![];
    for line in BufReader::new(f).lines() {
        let line = line?;
        if line.starts_with('#') {
            continue;
        }
        if let Some(word) = line.split_whitespace().next() {
            names.push(word.to_string());
        }
    }
    Ok(names)
}

/// Drop raw files that contain any of the setup-file names.
pub fn exclude_setup_files(files: Vec<PathBuf>, setup: &[String]) -> Vec<PathBuf> {
    files
        .into_iter()
        .filter(|f| {
            let name = f.display().to_string();
            match setup.iter().find(|s| name.contains(s.as_str())) {
                Some(s) => {
                    info!("Ignoring setup file {s}");
                    false
                }
                None => true,
            }
        })
        .collect()
}

/// The split sources in `dir`, named like `1934-638.2100`.
pub fn split_sources(dir: &Path) -> Result<Vec<String>, CalError> {
    let pattern = format!(
        "{}/[j012]*.[257]???",
        Pattern::escape(&dir.display().to_string())
    );
    Ok(sorted_glob(&pattern)?
        .into_iter()
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect())
}

/// The band of a source: the last four characters of its name.
pub fn source_band(source: &str) -> &str {
    let start = source
        .char_indices()
        .rev()
        .nth(3)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &source[start..]
}

/// A source's name without its band suffix.
pub fn source_stem(source: &str) -> &str {
    source
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(source)
}

/// The distinct bands of `sources`, sorted.
pub fn bands(sources: &[String]) -> Vec<String> {
    sources
        .iter()
        .map(|s| source_band(s).to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn matches_any(source: &str, list: &str) -> bool {
    patterns(list).iter().any(|p| source.contains(p))
}

/// Give every source of `band` a role. The primary and at least one secondary
/// must be present, as must the extended-source secondary unless it's
/// disabled.
pub fn classify(
    sources: &[String],
    band: &str,
    observation: &ObservationConfig,
) -> Result<BandSources, CalError> {
    let mut classified = BandSources {
        band: band.to_string(),
        ..Default::default()
    };
    let mut primary = None;
    let extended_secondary = observation.extended_secondary();

    for source in sources.iter().filter(|s| source_band(s) == band) {
        classified.all.push(source.clone());
        if source.contains(observation.primary.as_str()) {
            if let Some(previous) = primary.replace(source.clone()) {
                warn!("Both {previous} and {source} look like the primary calibrator; using {source}");
            }
        } else if matches_any(source, &observation.secondary) {
            classified.secondaries.push(source.clone());
        } else if extended_secondary.map(|p| source.contains(p)).unwrap_or(false) {
            classified.extended_secondary = Some(source.clone());
        } else if matches_any(source, &observation.polcal) {
            classified.polcals.push(source.clone());
        } else if matches_any(source, &observation.ext) {
            classified.extended_targets.push(source.clone());
        } else {
            classified.targets.push(source.clone());
        }
    }

    classified.primary = primary.ok_or_else(|| CalError::MissingPrimary {
        band: band.to_string(),
        pattern: observation.primary.clone(),
    })?;
    if classified.secondaries.is_empty() {
        return Err(CalError::MissingSecondary {
            band: band.to_string(),
            pattern: observation.secondary.clone(),
        });
    }
    if let (Some(pattern), None) = (extended_secondary, &classified.extended_secondary) {
        return Err(CalError::MissingExtendedSecondary {
            band: band.to_string(),
            pattern: pattern.to_string(),
        });
    }

    info!("Identified primary cal: {}", classified.primary);
    info!(
        "Identified {} secondary cals: {}",
        classified.secondaries.len(),
        classified.secondaries.iter().join(", ")
    );
    info!("Identified {} polarisation calibrators", classified.polcals.len());
    info!("Identified {} compact targets to calibrate", classified.targets.len());
    info!(
        "Identified secondary cal for extended sources: {}",
        classified.extended_secondary.as_deref().unwrap_or("(NONE)")
    );
    info!(
        "Identified {} extended targets to calibrate",
        classified.extended_targets.len()
    );
    Ok(classified)
}

/// A run of bad channels: `count` channels starting at `start` (1-indexed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRange {
    pub start: u32,
    pub count: u32,
}

/// Read a bad-channel file: the first word of each line is `first-last`. A
/// missing file flags nothing.
pub fn read_badchans(file: &Path) -> Result<Vec<ChannelRange>, CalError> {
    let f = match File::open(file) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("No bad-channel file {}; not flagging channels", file.display());
            return Ok(vec![]);
        }
        Err(e) => return Err(e.into()),
    };
    let mut ranges = vec![];
    for (i_line, line) in BufReader::new(f).lines().enumerate() {
        let line = line?;
        let word = match line.split_whitespace().next() {
            Some(w) if !w.starts_with('#') => w,
            _ => continue,
        };
        let bad_line = || CalError::BadChans {
            file: file.to_path_buf(),
            line: i_line + 1,
            text: line.clone(),
        };
        let (first, last) = word.split_once('-').ok_or_else(|| bad_line())?;
        let first: u32 = first.parse().map_err(|_| bad_line())?;
        let last: u32 = last.parse().map_err(|_| bad_line())?;
        if last < first {
            return Err(bad_line());
        }
        ranges.push(ChannelRange {
            start: first,
            count: last - first + 1,
        });
    }
    Ok(ranges)
}
