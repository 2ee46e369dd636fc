//! Combine a field's bands into one common-resolution cube per Stokes
//! parameter.
//!
//! Bands are ordered by frequency and the lowest band is the reference: its
//! celestial grid and header are used for the output. Each band is regridded
//! onto the reference grid, convolved up to the common beam and scaled so that
//! Jy/beam stays correct, then the bands are stacked along the frequency axis.

mod error;

pub use error::BigCubeError;

use std::path::PathBuf;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use itertools::Itertools;
use log::{debug, info, trace, warn};
use ndarray::prelude::*;
use vec1::Vec1;

use crate::{
    beam::{gauss_factor, solve_common_beam, Beam, CommonBeamParams, GaussianKernel},
    pool::{PlaneOp, PlanePool},
    read::{fits::FitsHeader, BandRead},
    regrid::regrid_cube,
    wcs::{CelestialWcs, SpectralAxis},
    write::{big_cube_filename, frequencies_filename, write_big_cube, write_frequencies},
    Stokes,
};

pub struct BigCubeParams {
    pub field: String,
    pub outdir: PathBuf,
    /// Use this beam instead of solving for one.
    pub target: Option<Beam>,
    pub common_beam: CommonBeamParams,
    /// Stop after working out the common beam.
    pub dry_run: bool,
    /// Write spectra plots of the brightest pixel.
    pub debug_plots: bool,
    /// Recorded as a HISTORY card in every output cube.
    pub history: Option<String>,
    pub progress_bars: bool,
}

/// A band and its channel frequencies \[Hz\].
#[derive(Debug, Clone, PartialEq)]
pub struct Band {
    pub band: u32,
    pub freqs: Vec1<f64>,
}

/// How to take one band from its native beam to the common beam.
#[derive(Debug, Clone)]
pub struct BeamMatch {
    pub native: Beam,
    /// The beam to convolve with; a point beam means "leave alone".
    pub conv: Beam,
    /// The kernel is sampled on square pixels of this size \[arcsec\].
    pub pixel_scale: f64,
    pub kernel: GaussianKernel,
    /// Multiply convolved data by this to keep Jy/beam.
    pub factor: f64,
}

/// A band after regridding and smoothing (and flux scaling).
#[derive(Debug, Clone)]
pub struct SmoothedBand {
    pub band: u32,
    pub data: Array3<f32>,
    pub freqs: Vec1<f64>,
}

/// The final product for one Stokes parameter.
#[derive(Debug, Clone)]
pub struct BigCube {
    pub stokes: Stokes,
    /// Indexed \[channel\]\[y\]\[x\].
    pub data: Array3<f32>,
    pub freqs: Vec1<f64>,
    pub beam: Beam,
    pub wcs: CelestialWcs,
    pub spectral: Option<SpectralAxis>,
    /// The reference band's header, for carrying over metadata.
    pub header: FitsHeader,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    DryRun {
        beam: Beam,
    },
    Written {
        beam: Beam,
        cubes: Vec<PathBuf>,
        frequencies: PathBuf,
    },
}

/// Run the whole big-cube stage.
pub fn run<R: BandRead, P: PlanePool>(
    reader: &R,
    params: &BigCubeParams,
    pool: &P,
) -> Result<Outcome, BigCubeError> {
    let bands = sorted_bands(reader)?;
    info!(
        "Field {} has bands {}",
        params.field,
        bands.iter().map(|b| b.band).join(", ")
    );

    let beam = determine_beam(reader, &bands, params.target, &params.common_beam)?;
    info!("Common beam: {beam}");
    if params.dry_run {
        info!("Dry run; not making cubes");
        return Ok(Outcome::DryRun { beam });
    }
    if params.debug_plots && !cfg!(feature = "plotting") {
        warn!("Debugging plots were requested, but this build can't plot (enable the \"plotting\" feature)");
    }

    std::fs::create_dir_all(&params.outdir).map_err(BigCubeError::OutputDir)?;
    let num_chans: usize = bands.iter().map(|b| b.freqs.len()).sum();
    let multi_progress = MultiProgress::with_draw_target(if params.progress_bars {
        ProgressDrawTarget::stdout()
    } else {
        ProgressDrawTarget::hidden()
    });

    let mut cubes = Vec::with_capacity(Stokes::ALL.len());
    let mut frequencies = None;
    #[cfg(feature = "plotting")]
    let mut debug_spectra = crate::plot::DebugSpectra::default();
    for stokes in Stokes::ALL {
        let regrid_progress = multi_progress.add(stage_progress_bar(num_chans, "Regridding", stokes));
        let smooth_progress = multi_progress.add(stage_progress_bar(num_chans, "Smoothing", stokes));
        let cube = process_stokes(
            reader,
            stokes,
            &bands,
            &beam,
            pool,
            &regrid_progress,
            &smooth_progress,
        )?;
        regrid_progress.finish();
        smooth_progress.finish();

        #[cfg(feature = "plotting")]
        if params.debug_plots {
            let band_sizes = bands
                .iter()
                .map(|b| (b.band, b.freqs.len()))
                .collect::<Vec<_>>();
            debug_spectra.add(&cube, &band_sizes);
        }

        let path = params.outdir.join(big_cube_filename(&params.field, stokes));
        info!("Writing {}", path.display());
        write_big_cube(&cube, &path, params.history.as_deref())?;
        cubes.push(path);

        if stokes == Stokes::I {
            let path = params.outdir.join(frequencies_filename(&params.field));
            info!("Writing {}", path.display());
            write_frequencies(&cube.freqs, &path)?;
            frequencies = Some(path);
        }
    }

    #[cfg(feature = "plotting")]
    if params.debug_plots {
        debug_spectra.plot(&params.outdir, &params.field)?;
    }

    Ok(Outcome::Written {
        beam,
        cubes,
        // Stokes I is always processed.
        frequencies: frequencies.unwrap_or_default(),
    })
}

fn stage_progress_bar(len: usize, stage: &str, stokes: Stokes) -> ProgressBar {
    ProgressBar::new(len as _)
        .with_style(
            ProgressStyle::default_bar()
                .template("{msg:17}: [{wide_bar:.blue}] {pos:4}/{len:4} channels ({elapsed_precise}<{eta_precise})")
                .unwrap()
                .progress_chars("=> "),
        )
        .with_position(0)
        .with_message(format!("{stage} {stokes}"))
}

/// Read every band's frequencies and sort the bands by their first frequency.
pub fn sorted_bands<R: BandRead>(reader: &R) -> Result<Vec1<Band>, BigCubeError> {
    let mut bands = vec![];
    for band in reader.bands() {
        let freqs = reader.frequencies(band)?;
        debug!(
            "Band {band}: {} channels, {:.3} - {:.3} MHz",
            freqs.len(),
            freqs.first() / 1e6,
            freqs.last() / 1e6
        );
        bands.push(Band { band, freqs });
    }
    bands.sort_unstable_by(|a, b| a.freqs.first().total_cmp(b.freqs.first()));

    // The stacked cube's channels must end up in frequency order.
    for band in &bands {
        if !band.freqs.iter().tuple_windows().all(|(a, b)| a < b) {
            return Err(BigCubeError::UnsortedFrequencies { band: band.band });
        }
    }
    for (lower, upper) in bands.iter().tuple_windows() {
        if lower.freqs.last() >= upper.freqs.first() {
            return Err(BigCubeError::OverlappingBands {
                lower: lower.band,
                upper: upper.band,
                lower_end: *lower.freqs.last(),
                upper_start: *upper.freqs.first(),
            });
        }
    }

    Vec1::try_from_vec(bands).map_err(|_| BigCubeError::NoBands)
}

/// Either check that `target` encloses every band's beam, or solve for the
/// smallest such beam.
pub fn determine_beam<R: BandRead>(
    reader: &R,
    bands: &[Band],
    target: Option<Beam>,
    params: &CommonBeamParams,
) -> Result<Beam, BigCubeError> {
    let mut beams = Vec::with_capacity(bands.len() * Stokes::ALL.len());
    for band in bands {
        for stokes in Stokes::ALL {
            let beam = reader.read_beam(band.band, stokes)?;
            trace!("Band {} Stokes {stokes}: {beam}", band.band);
            beams.push((band.band, stokes, beam));
        }
    }

    let beam = match target {
        Some(target) => {
            info!("Using the requested beam {target}");
            target
        }
        None => {
            let just_beams = beams.iter().map(|b| b.2).collect::<Vec<_>>();
            solve_common_beam(&just_beams, params)?
        }
    };

    for (band, stokes, native) in beams {
        if !beam.encloses(&native) {
            return Err(BigCubeError::BeamTooLarge {
                band,
                stokes,
                native,
                target: beam,
            });
        }
    }
    Ok(beam)
}

/// Work out the kernel and flux factor that take `native` to `target` on
/// `grid`'s pixels.
pub fn match_beam(
    target: &Beam,
    native: &Beam,
    grid: &CelestialWcs,
) -> Result<BeamMatch, BigCubeError> {
    let conv = target.deconvolve(native)?;
    let (dx, dy) = grid.pixel_scales();
    if (dx - dy).abs() > 1e-6 * dy {
        warn!("Pixels aren't square ({dx}\" x {dy}\"); the kernel uses {dy}\"");
    }
    let kernel = GaussianKernel::new(&conv, dy);
    let factor = if conv.is_point() {
        1.0
    } else if conv.minor > 0.0 {
        gauss_factor(&conv, native, dx, dy).factor
    } else {
        // A kernel with no width along one axis has no analytic amplitude;
        // use its sampled sum instead.
        target.area() / (native.area() * kernel.sum())
    };
    debug!(
        "Native {native} -> target {target}: convolving with {conv}, factor {factor}"
    );
    Ok(BeamMatch {
        native: *native,
        conv,
        pixel_scale: dy,
        kernel,
        factor,
    })
}

/// Convolve every channel with the matched kernel and apply the flux factor.
pub fn smooth_band<P: PlanePool>(
    data: ArrayView3<f32>,
    matched: &BeamMatch,
    pool: &P,
    progress: &ProgressBar,
) -> Result<Array3<f32>, BigCubeError> {
    let (_, ny, nx) = data.dim();
    let op = PlaneOp::Smooth {
        conv: matched.conv,
        pixel_scale: matched.pixel_scale,
        dim: (ny, nx),
        factor: matched.factor,
    };
    Ok(pool.map_planes(&op, data, progress)?)
}

/// Regrid, smooth and stack all bands of one Stokes parameter. `bands` must be
/// sorted by frequency.
pub fn process_stokes<R: BandRead, P: PlanePool>(
    reader: &R,
    stokes: Stokes,
    bands: &Vec1<Band>,
    beam: &Beam,
    pool: &P,
    regrid_progress: &ProgressBar,
    smooth_progress: &ProgressBar,
) -> Result<BigCube, BigCubeError> {
    let reference = reader.read_cube(bands.first().band, stokes)?;
    let ref_dim = {
        let (_, ny, nx) = reference.data.dim();
        (ny, nx)
    };
    info!(
        "Stokes {stokes}: reference band {} has a {} x {} grid",
        reference.band, ref_dim.1, ref_dim.0
    );

    let mut smoothed = Vec::with_capacity(bands.len());
    for band in bands.iter() {
        let cube = if band.band == reference.band {
            reference.clone()
        } else {
            reader.read_cube(band.band, stokes)?
        };
        let num_chans = cube.data.len_of(Axis(0));
        if num_chans != band.freqs.len() {
            return Err(BigCubeError::ChannelMismatch {
                band: band.band,
                stokes,
                num_chans,
                num_freqs: band.freqs.len(),
            });
        }

        debug!("Regridding band {} Stokes {stokes}", band.band);
        let regridded = regrid_cube(
            cube.data.view(),
            &cube.wcs,
            &reference.wcs,
            ref_dim,
            pool,
            regrid_progress,
        )?;
        drop(cube.data);

        let matched = match_beam(beam, &cube.beam, &reference.wcs).map_err(|e| match e {
            BigCubeError::Beam(_) => BigCubeError::BeamTooLarge {
                band: band.band,
                stokes,
                native: cube.beam,
                target: *beam,
            },
            e => e,
        })?;
        debug!("Smoothing band {} Stokes {stokes}", band.band);
        let data = smooth_band(regridded.view(), &matched, pool, smooth_progress)?;
        smoothed.push(SmoothedBand {
            band: band.band,
            data,
            freqs: band.freqs.clone(),
        });
    }

    let smoothed = Vec1::try_from_vec(smoothed).map_err(|_| BigCubeError::NoBands)?;
    let (data, freqs) = stack_bands(&smoothed)?;
    Ok(BigCube {
        stokes,
        data,
        freqs,
        beam: *beam,
        wcs: reference.wcs,
        spectral: reference.spectral,
        header: reference.header,
    })
}

/// Concatenate bands along the channel axis, in the order given. Every band
/// must share the same image shape.
pub fn stack_bands(bands: &Vec1<SmoothedBand>) -> Result<(Array3<f32>, Vec1<f64>), BigCubeError> {
    let views = bands.iter().map(|b| b.data.view()).collect::<Vec<_>>();
    let data = ndarray::concatenate(Axis(0), &views)?;
    let freqs = bands
        .iter()
        .flat_map(|b| b.freqs.iter().copied())
        .collect::<Vec<_>>();
    let freqs = Vec1::try_from_vec(freqs).map_err(|_| BigCubeError::NoBands)?;
    Ok((data, freqs))
}
