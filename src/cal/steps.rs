//! The calibration pipeline as a list of named steps.
//!
//! Nothing here runs anything; the step lists are handed to a
//! [`CommandRunner`](super::runner::CommandRunner) by [`run_steps`].

use std::{
    fmt::Display,
    path::{Path, PathBuf},
};

use itertools::Itertools;
use log::{debug, info, warn};

use super::{
    config::CalConfig,
    runner::CommandRunner,
    sources::{BandSources, ChannelRange},
    CalError,
};

/// The only primary that isn't 1934-638 needs its flux model given explicitly.
const SPECIAL_PRIMARY: &str = "2052-474.2100";
const SPECIAL_PRIMARY_FLUX: &str = "flux=1.6025794,2.211,-0.3699236";
const NFBIN: u32 = 2;

/// What to do when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop the whole run.
    Fatal,
    /// Log it and move on.
    Continue,
}

/// When a step should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    Always,
    /// Skip the step if its artifact already exists.
    ArtifactMissing,
    /// Skip the step unless this path exists.
    Exists(PathBuf),
}

/// Where an external tool's output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    /// The main log file.
    Main,
    /// Truncate this file and write to it.
    NewFile(PathBuf),
    AppendFile(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Run here rather than in the current directory.
    pub dir: Option<PathBuf>,
    pub log: LogSink,
}

impl ExternalCommand {
    pub fn new<S: Into<String>>(program: S) -> ExternalCommand {
        ExternalCommand {
            program: program.into(),
            args: vec![],
            dir: None,
            log: LogSink::Main,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> ExternalCommand {
        self.args.push(arg.into());
        self
    }

    pub fn in_dir(mut self, dir: &Path) -> ExternalCommand {
        self.dir = Some(dir.to_path_buf());
        self
    }

    pub fn log_to(mut self, log: LogSink) -> ExternalCommand {
        self.log = log;
        self
    }
}

impl Display for ExternalCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Run(ExternalCommand),
    RemoveFile(PathBuf),
}

impl Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Run(c) => c.fmt(f),
            Action::RemoveFile(p) => write!(f, "rm {}", p.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    pub precondition: Precondition,
    pub action: Action,
    /// What the step is expected to produce.
    pub artifact: Option<PathBuf>,
    pub policy: FailurePolicy,
}

impl Step {
    fn run<S: Into<String>>(name: S, command: ExternalCommand) -> Step {
        Step {
            name: name.into(),
            precondition: Precondition::Always,
            action: Action::Run(command),
            artifact: None,
            policy: FailurePolicy::Continue,
        }
    }

    /// Expect `artifact`; if `overwrite` is false and it already exists, the
    /// step is skipped.
    fn producing(mut self, artifact: PathBuf, overwrite: bool) -> Step {
        if !overwrite {
            self.precondition = Precondition::ArtifactMissing;
        }
        self.artifact = Some(artifact);
        self
    }

    fn fatal(mut self) -> Step {
        self.policy = FailurePolicy::Fatal;
        self
    }

    /// Should this step be skipped?
    pub fn skip(&self) -> bool {
        match &self.precondition {
            Precondition::Always => false,
            Precondition::ArtifactMissing => {
                self.artifact.as_ref().map(|a| a.exists()).unwrap_or(false)
            }
            Precondition::Exists(p) => !p.exists(),
        }
    }
}

/// How a list of steps went.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepReport {
    pub run: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl std::ops::AddAssign for StepReport {
    fn add_assign(&mut self, other: StepReport) {
        self.run += other.run;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Run every step in order. A failing fatal step stops everything.
pub fn run_steps<R: CommandRunner>(steps: &[Step], runner: &mut R) -> Result<StepReport, CalError> {
    let mut report = StepReport::default();
    for step in steps {
        if step.skip() {
            info!("Skipping {}", step.name);
            report.skipped += 1;
            continue;
        }
        debug!("{}: {}", step.name, step.action);
        report.run += 1;
        if let Err(source) = runner.execute(&step.action) {
            match step.policy {
                FailurePolicy::Fatal => {
                    return Err(CalError::StepFailed {
                        step: step.name.clone(),
                        source,
                    })
                }
                FailurePolicy::Continue => {
                    warn!("{} failed: {source}", step.name);
                    report.failed += 1;
                }
            }
        }
    }
    Ok(report)
}

fn miriad(program: &str, outdir: &Path) -> ExternalCommand {
    ExternalCommand::new(program).in_dir(outdir)
}

/// Load the raw files into `dat.uv` and split it into sources.
pub fn load_steps(config: &CalConfig, raw_files: &[PathBuf]) -> Vec<Step> {
    let outdir = &config.output.dir;
    let dat = outdir.join("dat.uv");
    let input = raw_files.iter().map(|f| f.display()).join(",");
    let mut atlod = ExternalCommand::new("atlod")
        .arg(format!("in={input}"))
        .arg(format!("out={}", dat.display()));
    atlod = if config.input.if_use > 0 {
        atlod
            .arg(format!("ifsel={}", config.input.if_use))
            .arg("options=birdie,noauto,xycorr,rfiflag,notsys")
    } else {
        atlod.arg("options=birdie,noauto,xycorr,rfiflag")
    };

    let uvsplit = miriad("uvsplit", outdir).arg("vis=dat.uv").arg(if config.output.clobber {
        "options=mosaic,clobber"
    } else {
        "options=mosaic"
    });
    let mut uvsplit = Step::run("Splitting sources", uvsplit);
    // Without clobbering, uvsplit complains about sources split on an earlier
    // run; that's expected when resuming.
    if config.output.clobber {
        uvsplit = uvsplit.fatal();
    }

    vec![
        Step::run("Loading raw data", atlod)
            .producing(dat, config.output.rawclobber)
            .fatal(),
        uvsplit,
    ]
}

/// The three rounds of pgflag used on every calibrator and target.
fn flag(source: &str, outdir: &Path) -> Vec<Step> {
    [
        ("stokes=i,q,u,v", "8,5,5,3,6,3"),
        ("stokes=i,v,u,q", "8,2,2,3,6,3"),
        ("stokes=i,v,q,u", "8,2,2,3,6,3"),
    ]
    .iter()
    .enumerate()
    .map(|(i, (stokes, flagpar))| {
        Step::run(
            format!("Flagging {source} (round {})", i + 1),
            pgflag(source, stokes, flagpar, outdir),
        )
    })
    .collect()
}

/// The single pgflag round run before bandpass calibration.
fn flag_v(source: &str, outdir: &Path) -> Step {
    Step::run(
        format!("Flagging {source} on Stokes V"),
        pgflag(source, "stokes=i,q,u,v", "8,5,5,3,6,3", outdir),
    )
}

fn pgflag(source: &str, stokes: &str, flagpar: &str, outdir: &Path) -> ExternalCommand {
    miriad("pgflag", outdir)
        .arg(format!("vis={source}"))
        .arg(stokes)
        .arg(format!("flagpar={flagpar}"))
        .arg("command=<b")
        .arg("options=nodisp")
}

fn gpcopy(from: &str, to: &str, outdir: &Path) -> Step {
    Step::run(
        format!("Copying gains from {from} to {to}"),
        miriad("gpcopy", outdir)
            .arg(format!("vis={from}"))
            .arg(format!("out={to}")),
    )
}

/// Flag and calibrate one band.
pub fn band_steps(
    sources: &BandSources,
    badchans: &[ChannelRange],
    config: &CalConfig,
) -> Vec<Step> {
    let outdir = config.output.dir.as_path();
    let clobber = config.output.clobber;
    let mut steps = vec![];

    for source in &sources.all {
        for chans in badchans {
            steps.push(Step::run(
                format!("Flagging channels {}-{} of {source}", chans.start, chans.start + chans.count - 1),
                miriad("uvflag", outdir)
                    .arg(format!("vis={source}"))
                    .arg(format!("line=chan,{},{}", chans.count, chans.start))
                    .arg("flagval=flag"),
            ));
        }
    }

    // Primary.
    let primary = sources.primary.as_str();
    steps.push(Step::run(
        format!("Flagging {primary} below 40 deg elevation"),
        miriad("uvflag", outdir)
            .arg(format!("vis={primary}"))
            .arg("select=-elevation(40,90)")
            .arg("flagval=flag"),
    ));
    steps.push(flag_v(primary, outdir));
    let mut mfcal = miriad("mfcal", outdir).arg(format!("vis={primary}"));
    if primary == SPECIAL_PRIMARY {
        mfcal = mfcal.arg(SPECIAL_PRIMARY_FLUX);
    }
    steps.push(Step::run(
        format!("Bandpass calibration of {primary}"),
        mfcal.arg("interval=0.1,1,30"),
    ));
    steps.extend(flag(primary, outdir));
    steps.push(Step::run(
        format!("Gain calibration of {primary}"),
        miriad("gpcal", outdir)
            .arg(format!("vis={primary}"))
            .arg("interval=0.1")
            .arg(format!("nfbin={NFBIN}"))
            .arg("options=xyvary"),
    ));
    steps.extend(flag(primary, outdir));
    if primary == SPECIAL_PRIMARY {
        steps.push(Step::run(
            format!("Bootstrapping the flux scale of {primary}"),
            miriad("mfboot", outdir)
                .arg(format!("vis={primary}"))
                .arg(SPECIAL_PRIMARY_FLUX),
        ));
    }

    // Secondaries.
    for secondary in &sources.secondaries {
        steps.push(gpcopy(primary, secondary, outdir));
        steps.extend(flag(secondary, outdir));
        steps.push(Step::run(
            format!("Gain calibration of {secondary}"),
            miriad("gpcal", outdir)
                .arg(format!("vis={secondary}"))
                .arg("interval=0.1")
                .arg(format!("nfbin={NFBIN}"))
                .arg("options=xyvary,qusolve"),
        ));
        steps.extend(flag(secondary, outdir));
        steps.push(Step::run(
            format!("Bootstrapping the flux scale of {secondary}"),
            miriad("gpboot", outdir)
                .arg(format!("vis={secondary}"))
                .arg(format!("cal={primary}")),
        ));
    }
    let (first, rest) = match sources.secondaries.split_first() {
        Some(s) => s,
        None => return steps,
    };
    for other in rest.iter().rev() {
        steps.push(Step::run(
            format!("Merging gains of {other} into {first}"),
            miriad("gpcopy", outdir)
                .arg(format!("vis={other}"))
                .arg(format!("out={first}"))
                .arg("mode=merge"),
        ));
    }

    // Compact targets.
    for target in &sources.targets {
        steps.push(gpcopy(first, target, outdir));
        steps.extend(flag(target, outdir));
        steps.extend(flag(target, outdir));
        let log = outdir.join(format!("{target}.log.txt"));
        steps.push(Step::run(
            format!("Flagging statistics of {target}"),
            miriad("uvfstats", outdir)
                .arg(format!("vis={target}"))
                .log_to(LogSink::NewFile(log.clone())),
        ));
        steps.push(Step::run(
            format!("Channel flagging statistics of {target}"),
            miriad("uvfstats", outdir)
                .arg(format!("vis={target}"))
                .arg("mode=channel")
                .log_to(LogSink::AppendFile(log)),
        ));
        let pscal = format!("{target}.pscal");
        steps.push(
            Step::run(
                format!("Applying gains to {target}"),
                miriad("uvaver", outdir)
                    .arg(format!("vis={target}"))
                    .arg(format!("out={pscal}")),
            )
            .producing(outdir.join(pscal), clobber),
        );
    }
    steps
}

/// Plot the RM spread function of every target. `first_band` decides whether
/// this is L-band data (plotted directly) or CX data (concatenated first).
pub fn rmsf_steps(targets: &[String], first_band: &str, config: &CalConfig) -> Vec<Step> {
    let outdir = config.output.dir.as_path();
    let clobber = config.output.clobber;
    let low_band = first_band.parse::<u32>().map(|b| b < 3500).unwrap_or(true);
    let junk = outdir.join("junk.eps");
    let mut steps = vec![];

    for target in targets.iter().sorted().dedup() {
        let mut uvspec = miriad("uvspec", outdir);
        if low_band {
            uvspec = uvspec
                .arg(format!("vis={target}.????"))
                .arg("axis=rm")
                .arg("options=nobase,avall")
                .arg("nxy=1,2")
                .arg("interval=100000")
                .arg("xrange=-1500,1500");
        } else {
            let cx = format!("{target}.cx");
            steps.push(
                Step::run(
                    format!("Concatenating the bands of {target}"),
                    miriad("uvcat", outdir)
                        .arg(format!("vis={target}.????"))
                        .arg(format!("out={cx}")),
                )
                .producing(outdir.join(&cx), clobber),
            );
            uvspec = uvspec
                .arg(format!("vis={cx}"))
                .arg("axis=rm")
                .arg("options=nobase,avall")
                .arg("nxy=1,2")
                .arg("interval=100000")
                .arg("xrange=-3500,3500");
        }
        steps.push(Step::run(
            format!("Plotting the RMSF of {target}"),
            uvspec.arg("device=junk.eps/vcps"),
        ));
        let eps = format!("{target}.eps");
        steps.push(
            Step::run(
                format!("Cropping the RMSF plot of {target}"),
                miriad("epstool", outdir)
                    .arg("--copy")
                    .arg("--bbox")
                    .arg("junk.eps")
                    .arg(eps.as_str()),
            )
            .producing(outdir.join(eps), true),
        );
        steps.push(Step {
            name: "Removing junk.eps".to_string(),
            precondition: Precondition::Exists(junk.clone()),
            action: Action::RemoveFile(junk.clone()),
            artifact: None,
            policy: FailurePolicy::Continue,
        });
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cal::{
        config::{InputConfig, ObservationConfig, OutputConfig},
        runner::{RecordingRunner, RunError},
    };

    fn cal_config(outdir: &Path, clobber: bool) -> CalConfig {
        CalConfig {
            input: InputConfig {
                dir: PathBuf::from("raw"),
                date: "2019-06-23".to_string(),
                if_use: 0,
            },
            output: OutputConfig {
                dir: outdir.to_path_buf(),
                rawclobber: false,
                clobber,
                skipcal: false,
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

    fn programs(steps: &[Step]) -> Vec<String> {
        steps
            .iter()
            .map(|s| match &s.action {
                Action::Run(c) => c.program.clone(),
                Action::RemoveFile(_) => "rm".to_string(),
            })
            .collect()
    }

    #[test]
    fn loading_the_raw_data() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = cal_config(tmp.path(), false);
        let raw = vec![PathBuf::from("raw/a.C3300"), PathBuf::from("raw/b.C3300")];
        let steps = load_steps(&config, &raw);
        assert_eq!(programs(&steps), vec!["atlod", "uvsplit"]);
        let Action::Run(atlod) = &steps[0].action else { unreachable!() };
        assert_eq!(atlod.args[0], "in=raw/a.C3300,raw/b.C3300");
        assert_eq!(atlod.args[2], "options=birdie,noauto,xycorr,rfiflag");
        assert_eq!(steps[0].policy, FailurePolicy::Fatal);
        assert_eq!(steps[1].policy, FailurePolicy::Continue);
        assert!(!steps[0].skip());

        // Already loaded.
        std::fs::create_dir(tmp.path().join("dat.uv")).unwrap();
        assert!(load_steps(&config, &raw)[0].skip());
        config.output.rawclobber = true;
        config.input.if_use = 2;
        let steps = load_steps(&config, &raw);
        assert!(!steps[0].skip());
        let Action::Run(atlod) = &steps[0].action else { unreachable!() };
        assert_eq!(atlod.args[2], "ifsel=2");
        assert!(atlod.args[3].ends_with(",notsys"));
    }

    #[test]
    fn calibrating_a_band() {
        let config = cal_config(Path::new("out"), false);
        let sources = BandSources {
            band: "2100".to_string(),
            all: vec![
                "0823-500.2100".to_string(),
                "1036-697.2100".to_string(),
                "1934-638.2100".to_string(),
                "j0000-1234.2100".to_string(),
            ],
            primary: "1934-638.2100".to_string(),
            secondaries: vec!["0823-500.2100".to_string(), "1036-697.2100".to_string()],
            targets: vec!["j0000-1234.2100".to_string()],
            ..Default::default()
        };
        let badchans = [ChannelRange { start: 10, count: 3 }];
        let steps = band_steps(&sources, &badchans, &config);
        let programs = programs(&steps);

        // One bad-channel flag per source.
        assert_eq!(programs.iter().take_while(|p| *p == "uvflag").count(), 5);
        let Action::Run(first) = &steps[0].action else { unreachable!() };
        assert_eq!(first.args[1], "line=chan,3,10");

        // Primary: elevation cut, V flag, mfcal, 3 flags, gpcal, 3 flags.
        let primary = &programs[4..14];
        assert_eq!(
            primary,
            &["uvflag", "pgflag", "mfcal", "pgflag", "pgflag", "pgflag", "gpcal", "pgflag", "pgflag", "pgflag"]
        );
        assert!(!programs.contains(&"mfboot".to_string()));
        assert_eq!(programs.iter().filter(|p| *p == "gpboot").count(), 2);

        let merge = steps
            .iter()
            .find(|s| s.name.starts_with("Merging"))
            .unwrap();
        let Action::Run(merge) = &merge.action else { unreachable!() };
        assert_eq!(merge.args, vec!["vis=1036-697.2100", "out=0823-500.2100", "mode=merge"]);

        let stats = steps
            .iter()
            .filter_map(|s| match &s.action {
                Action::Run(c) if c.program == "uvfstats" => Some(c.log.clone()),
                _ => None,
            })
            .collect::<Vec<_>>();
        let log = PathBuf::from("out/j0000-1234.2100.log.txt");
        assert_eq!(stats, vec![LogSink::NewFile(log.clone()), LogSink::AppendFile(log)]);
        assert_eq!(programs.last().unwrap(), "uvaver");
        assert_eq!(steps.last().unwrap().precondition, Precondition::ArtifactMissing);
    }

    #[test]
    fn the_special_primary_gets_a_flux_model() {
        let config = cal_config(Path::new("out"), true);
        let sources = BandSources {
            band: "2100".to_string(),
            all: vec![SPECIAL_PRIMARY.to_string()],
            primary: SPECIAL_PRIMARY.to_string(),
            secondaries: vec!["0823-500.2100".to_string()],
            ..Default::default()
        };
        let steps = band_steps(&sources, &[], &config);
        let commands = steps
            .iter()
            .filter_map(|s| match &s.action {
                Action::Run(c) if ["mfcal", "mfboot"].contains(&c.program.as_str()) => Some(c),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(commands.len(), 2);
        assert!(commands.iter().all(|c| c.args.contains(&SPECIAL_PRIMARY_FLUX.to_string())));
    }

    #[test]
    fn rmsf_plots_depend_on_the_band() {
        let config = cal_config(Path::new("out"), false);
        let targets = vec!["j0000-1234".to_string(), "j0000-1234".to_string()];
        assert_eq!(
            programs(&rmsf_steps(&targets, "2100", &config)),
            vec!["uvspec", "epstool", "rm"]
        );
        assert_eq!(
            programs(&rmsf_steps(&targets, "5500", &config)),
            vec!["uvcat", "uvspec", "epstool", "rm"]
        );
    }

    #[test]
    fn fatal_failures_stop_the_run() {
        let config = cal_config(Path::new("does/not/exist"), true);
        let steps = load_steps(&config, &[]);
        let mut runner = RecordingRunner::failing(["atlod"]);
        match run_steps(&steps, &mut runner) {
            Err(CalError::StepFailed { step, source }) => {
                assert_eq!(step, "Loading raw data");
                assert!(matches!(source, RunError::Exit { program, .. } if program == "atlod"));
            }
            other => panic!("expected atlod to fail, got {other:?}"),
        }
        assert_eq!(runner.commands().len(), 1);

        let mut runner = RecordingRunner::failing(["uvsplit"]);
        let steps = load_steps(&cal_config(Path::new("does/not/exist"), false), &[]);
        let report = run_steps(&steps, &mut runner).unwrap();
        assert_eq!(report, StepReport { run: 2, skipped: 0, failed: 1 });
    }
}
