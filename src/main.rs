use std::{num::NonZeroUsize, path::PathBuf};

use clap::{AppSettings, Parser};
use itertools::Itertools;
use log::{error, info};

use quocka::{
    beam::{Beam, CommonBeamParams},
    bigcube::{self, BigCubeError, BigCubeParams, Outcome},
    logging::setup_logging,
    pool::{Pool, PoolKind},
    read::FitsBandReader,
};

/// Combine a field's per-band cubes into one common-resolution cube per Stokes
/// parameter.
#[derive(Parser)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(infer_long_args = true)]
struct Args {
    /// Directory containing the band cubes and frequency tables.
    datadir: PathBuf,

    /// The field name, e.g. j0000-1234.
    field: String,

    /// Where to write the big cubes. Defaults to the data directory.
    #[clap(short, long)]
    outdir: Option<PathBuf>,

    /// Use a circular beam of this FWHM [arcsec] instead of solving for the
    /// smallest common beam.
    #[clap(long)]
    target: Option<f64>,

    /// Only work out the common beam; don't make any cubes.
    #[clap(short, long)]
    dry_run: bool,

    /// Write plots of spectra through the brightest pixel.
    #[clap(long)]
    debug: bool,

    /// Tolerance of the common-beam solver.
    #[clap(short, long, default_value = "1e-4")]
    tolerance: f64,

    /// Epsilon of the common-beam solver.
    #[clap(short, long, default_value = "5e-4")]
    epsilon: f64,

    /// Number of edge samples per beam used by the common-beam solver.
    #[clap(short, long, default_value = "200")]
    nsamps: usize,

    /// Number of threads to use. 1 runs everything serially.
    #[clap(long, default_value = "1", conflicts_with = "workers")]
    ncores: NonZeroUsize,

    /// Use this many worker processes instead of threads. Workers are the
    /// quocka_worker executable installed alongside this one, and exchange
    /// channel planes through temporary FITS files. They all run on this
    /// machine; there is no distributed (MPI) mode.
    #[clap(long)]
    workers: Option<NonZeroUsize>,

    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv). The default is to print only high-level information.
    #[clap(short, long, parse(from_occurrences))]
    verbosity: u8,

    /// Disable progress bars.
    #[clap(long)]
    no_progress_bars: bool,
}

fn main() {
    let args = Args::parse();
    setup_logging(args.verbosity, None);

    if let Err(e) = try_main(args) {
        error!("{e}");
        std::process::exit(1);
    }
}

fn try_main(args: Args) -> Result<(), BigCubeError> {
    let pool_kind = match (args.workers, args.ncores.get()) {
        (Some(n), _) => PoolKind::Processes(n),
        (None, 1) => PoolKind::Serial,
        (None, _) => PoolKind::Threads(args.ncores),
    };
    let pool = Pool::new(pool_kind)?;

    let target = args.target.map(Beam::circular).transpose()?;
    let params = BigCubeParams {
        outdir: args.outdir.unwrap_or_else(|| args.datadir.clone()),
        field: args.field,
        target,
        common_beam: CommonBeamParams {
            tolerance: args.tolerance,
            nsamps: args.nsamps,
            epsilon: args.epsilon,
            ..Default::default()
        },
        dry_run: args.dry_run,
        debug_plots: args.debug,
        history: Some(std::env::args().join(" ")),
        progress_bars: !args.no_progress_bars,
    };

    let reader = FitsBandReader::discover(&args.datadir, &params.field)?;
    match bigcube::run(&reader, &params, &pool)? {
        Outcome::DryRun { beam } => info!("Dry run complete; the common beam is {beam}"),
        Outcome::Written {
            beam,
            cubes,
            frequencies,
        } => {
            info!("Wrote cubes with beam {beam}:");
            for cube in cubes {
                info!("  {}", cube.display());
            }
            info!("Frequencies: {}", frequencies.display());
        }
    }
    Ok(())
}
