//! The calibration driver.
//!
//! Raw ATCA data are loaded and split into sources with Miriad, then each
//! frequency band is flagged and calibrated: the primary calibrator sets the
//! bandpass and flux scale, the secondaries carry gains and polarisation
//! leakages to the targets. Finally, an RM spread function is plotted for
//! every target. All the real work is done by external tools; this module
//! only decides what to run and in which order.

pub mod config;
pub mod runner;
pub mod sources;
pub mod steps;

use std::path::{Path, PathBuf};

use log::{info, warn};
use thiserror::Error;

pub use config::{CalConfig, ConfigError};
pub use runner::{CommandRunner, DryRunRunner, RunError, SystemRunner};
use sources::{
    bands, classify, exclude_setup_files, raw_files, read_badchans, read_setup_file,
    source_stem, split_sources,
};
use steps::{band_steps, load_steps, rmsf_steps, run_steps, StepReport};

#[derive(Error, Debug)]
pub enum CalError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Error: primary cal ({pattern}) not found in band {band}")]
    MissingPrimary { band: String, pattern: String },

    #[error("Error: secondary cal ({pattern}) not found in band {band}")]
    MissingSecondary { band: String, pattern: String },

    #[error("Error: extended-source secondary cal ({pattern}) not found in band {band}")]
    MissingExtendedSecondary { band: String, pattern: String },

    #[error("{} line {line}: expected a channel range like '100-120', got '{text}'", .file.display())]
    BadChans {
        file: PathBuf,
        line: usize,
        text: String,
    },

    #[error("Step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: RunError,
    },

    #[error("Bad glob pattern: {0}")]
    Glob(#[from] glob::PatternError),

    #[error("Couldn't read a globbed path: {0}")]
    GlobRead(#[from] glob::GlobError),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

/// What a calibration run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CalSummary {
    pub bands: Vec<String>,
    pub steps: StepReport,
}

/// Run the whole calibration. Raw files named in `setup_file` are ignored.
pub fn run_calibration<R: CommandRunner>(
    config: &CalConfig,
    setup_file: &Path,
    runner: &mut R,
) -> Result<CalSummary, CalError> {
    info!("Input settings:");
    info!("{:?}", config.input);
    info!("{:?}", config.output);
    info!("{:?}", config.observation);

    let outdir = &config.output.dir;
    if !outdir.exists() {
        info!("Creating directory {}", outdir.display());
        std::fs::create_dir_all(outdir)?;
    }

    let setup = read_setup_file(setup_file)?;
    let raw = exclude_setup_files(raw_files(&config.input)?, &setup);
    if raw.is_empty() {
        warn!(
            "No raw files starting with '{}' in {}",
            config.input.date,
            config.input.dir.display()
        );
    }

    let mut summary = CalSummary::default();
    info!("Loading and splitting the raw data");
    if config.output.clobber {
        info!("Output files will be clobbered if necessary");
    }
    summary.steps += run_steps(&load_steps(config, &raw), runner)?;

    let sources = split_sources(outdir)?;
    info!("Working on {} sources", sources.len());
    summary.bands = bands(&sources);
    info!("Frequency bands to process: {}", summary.bands.join(","));

    let mut to_plot = vec![];
    for band in &summary.bands {
        info!("Working on frequency: {band}");
        let classified = classify(&sources, band, &config.observation)?;
        to_plot.extend(classified.targets.iter().map(|t| source_stem(t).to_string()));
        if config.output.skipcal {
            info!("Skipping flagging and calibration steps on user request");
            continue;
        }

        let badchans_file = outdir.join("..").join(format!("badchans_{band}.txt"));
        let badchans = read_badchans(&badchans_file)?;
        summary.steps += run_steps(&band_steps(&classified, &badchans, config), runner)?;
    }

    if let Some(first_band) = summary.bands.first() {
        summary.steps += run_steps(&rmsf_steps(&to_plot, first_band, config), runner)?;
    }

    info!(
        "DONE! {} steps run, {} skipped, {} failed",
        summary.steps.run, summary.steps.skipped, summary.steps.failed
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::cal::{
        config::{InputConfig, ObservationConfig, OutputConfig},
        runner::RecordingRunner,
    };

    fn config(root: &Path, skipcal: bool) -> CalConfig {
        CalConfig {
            input: InputConfig {
                dir: root.join("raw"),
                date: "2019-06-23".to_string(),
                if_use: 0,
            },
            output: OutputConfig {
                dir: root.join("cal"),
                rawclobber: false,
                clobber: false,
                skipcal,
            },
            observation: ObservationConfig {
                primary: "1934-638".to_string(),
                secondary: "0823-500".to_string(),
                polcal: String::new(),
                sec_ext: "NONE".to_string(),
                ext: String::new(),
            },
        }
    }

    /// Pretend the raw data have been loaded and split.
    fn split(root: &Path, sources: &[&str]) {
        let cal = root.join("cal");
        std::fs::create_dir_all(cal.join("dat.uv")).unwrap();
        for s in sources {
            std::fs::create_dir(cal.join(s)).unwrap();
        }
        std::fs::create_dir(root.join("raw")).unwrap();
        std::fs::write(root.join("raw/2019-06-23_0101.C3300"), "").unwrap();
        std::fs::write(root.join("raw/2019-06-23_0102.C3300"), "").unwrap();
        std::fs::write(root.join("setup.txt"), "2019-06-23_0101.C3300\n").unwrap();
        std::fs::write(root.join("badchans_2100.txt"), "1-5\n").unwrap();
    }

    #[test]
    fn a_full_run() {
        let tmp = tempdir().unwrap();
        let root = tmp.path();
        split(root, &["1934-638.2100", "0823-500.2100", "j0000-1234.2100"]);
        let mut runner = RecordingRunner::new();
        let summary =
            run_calibration(&config(root, false), &root.join("setup.txt"), &mut runner).unwrap();
        assert_eq!(summary.bands, vec!["2100"]);
        // dat.uv already exists, and nothing made junk.eps.
        assert_eq!(summary.steps.skipped, 2);
        assert_eq!(summary.steps.failed, 0);

        let commands = runner.commands();
        assert!(commands[0].starts_with("uvsplit"));
        assert!(commands
            .iter()
            .any(|c| c == "uvflag vis=1934-638.2100 line=chan,5,1 flagval=flag"));
        assert!(commands.iter().any(|c| c.starts_with("uvaver vis=j0000-1234.2100")));
        assert!(commands.iter().any(|c| c.starts_with("uvspec vis=j0000-1234.????")));
    }

    #[test]
    fn skipping_calibration_still_plots() {
        let tmp = tempdir().unwrap();
        let root = tmp.path();
        split(root, &["1934-638.2100", "0823-500.2100", "j0000-1234.2100"]);
        let mut runner = RecordingRunner::new();
        run_calibration(&config(root, true), &root.join("setup.txt"), &mut runner).unwrap();
        let commands = runner.commands();
        assert!(!commands.iter().any(|c| c.starts_with("gpcal")));
        assert!(commands.iter().any(|c| c.starts_with("uvspec")));
    }

    #[test]
    fn a_missing_primary_stops_everything() {
        let tmp = tempdir().unwrap();
        let root = tmp.path();
        split(root, &["0823-500.2100", "j0000-1234.2100"]);
        let mut runner = RecordingRunner::new();
        let result = run_calibration(&config(root, false), &root.join("setup.txt"), &mut runner);
        assert!(matches!(result, Err(CalError::MissingPrimary { .. })));
        assert_eq!(runner.commands().len(), 1);
    }

    #[test]
    fn setup_files_are_not_loaded() {
        let tmp = tempdir().unwrap();
        let root = tmp.path();
        split(root, &["1934-638.2100", "0823-500.2100"]);
        std::fs::remove_dir(root.join("cal/dat.uv")).unwrap();
        let mut runner = RecordingRunner::new();
        run_calibration(&config(root, true), &root.join("setup.txt"), &mut runner).unwrap();
        let atlod = &runner.commands()[0];
        assert!(atlod.starts_with("atlod in="));
        assert!(atlod.contains("2019-06-23_0102.C3300"));
        assert!(!atlod.contains("2019-06-23_0101.C3300"));
    }
}
