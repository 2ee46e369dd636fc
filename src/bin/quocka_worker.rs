use std::path::PathBuf;

use clap::{AppSettings, Parser};
use log::{debug, error};

use quocka::{logging::setup_logging, pool::run_worker};

/// Process one chunk of channel planes for quocka_bigcube's worker processes.
/// The job file is written by quocka_bigcube; this isn't meant to be run by
/// hand.
#[derive(Parser)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
struct Args {
    /// The TOML job description.
    job_file: PathBuf,

    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv).
    #[clap(short, long, parse(from_occurrences))]
    verbosity: u8,
}

fn main() {
    let args = Args::parse();
    setup_logging(args.verbosity, None);

    match run_worker(&args.job_file) {
        Ok(num_planes) => debug!("Processed {num_planes} planes"),
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    }
}
