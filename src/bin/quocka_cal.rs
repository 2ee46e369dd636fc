use std::{
    fs::{File, OpenOptions},
    path::PathBuf,
};

use clap::{AppSettings, Parser};
use log::{error, info};

use quocka::{
    cal::{run_calibration, CalConfig, CalError, DryRunRunner, SystemRunner},
    logging::setup_logging,
};

/// Flag and calibrate QUOCKA data with Miriad.
#[derive(Parser)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(infer_long_args = true)]
struct Args {
    /// The TOML configuration file.
    config_file: PathBuf,

    /// Text file naming correlator setup files to be ignored.
    #[clap(short, long, default_value = "setup.txt")]
    setup_file: PathBuf,

    /// Where to write the log (and the output of the external tools).
    #[clap(short, long, default_value = "log.txt")]
    log_file: PathBuf,

    /// Print the commands that would be run instead of running them.
    #[clap(long)]
    dry_run: bool,

    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv). The default is to print only high-level information.
    #[clap(short, long, parse(from_occurrences))]
    verbosity: u8,
}

fn main() {
    let args = Args::parse();
    // Start a fresh log, then append so that external tools can share it.
    let log_file = File::create(&args.log_file)
        .and_then(|_| OpenOptions::new().append(true).open(&args.log_file));
    match log_file {
        Ok(f) => setup_logging(args.verbosity, Some(f)),
        Err(e) => {
            setup_logging(args.verbosity, None);
            error!("Couldn't open log file {}: {e}", args.log_file.display());
            std::process::exit(1);
        }
    }

    if let Err(e) = try_main(args) {
        error!("{e}");
        std::process::exit(1);
    }
}

fn try_main(args: Args) -> Result<(), CalError> {
    let config = CalConfig::from_file(&args.config_file)?;
    info!("Config file: {}", args.config_file.display());
    info!("Setup file: {}", args.setup_file.display());
    info!("Log file: {}", args.log_file.display());

    let summary = if args.dry_run {
        run_calibration(&config, &args.setup_file, &mut DryRunRunner)?
    } else {
        // Tools run in the output directory, so the log path must not be
        // relative to here.
        let log_file = std::fs::canonicalize(&args.log_file)?;
        run_calibration(&config, &args.setup_file, &mut SystemRunner::new(&log_file))?
    };
    info!("Processed bands: {}", summary.bands.join(", "));
    Ok(())
}
