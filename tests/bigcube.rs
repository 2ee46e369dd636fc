//! Run the whole big-cube stage on small synthetic cubes.

use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use approx::assert_abs_diff_eq;
use fitsio::{
    images::{ImageDescription, ImageType},
    FitsFile,
};
use ndarray::prelude::*;
use tempfile::tempdir;

use quocka::{
    beam::{Beam, CommonBeamParams},
    bigcube::{run, BigCubeParams, Outcome},
    pool::{ProcessPool, SerialPool, ThreadPool},
    read::{read_band_cube, read_beam, read_frequencies, FitsBandReader},
    Stokes,
};

const FIELD: &str = "j0000-1234";
const DIM: usize = 32;
const PIXEL_ARCSEC: f64 = 2.0;

struct SyntheticBand {
    band: u32,
    freqs: Vec<f64>,
    beam: Beam,
}

fn bands() -> Vec<SyntheticBand> {
    vec![
        SyntheticBand {
            band: 5500,
            freqs: vec![4.5e9, 5.0e9],
            beam: Beam::new(6.0, 5.0, 30.0).unwrap(),
        },
        SyntheticBand {
            band: 2100,
            freqs: vec![1.9e9, 2.1e9, 2.3e9],
            beam: Beam::new(10.0, 8.0, 0.0).unwrap(),
        },
        SyntheticBand {
            band: 7500,
            freqs: vec![7.0e9, 7.5e9],
            beam: Beam::new(4.0, 4.0, 0.0).unwrap(),
        },
    ]
}

/// An unresolved source of 1 Jy/beam at the centre, as seen with `beam`.
fn point_source(beam: &Beam) -> Array2<f32> {
    let c = (DIM / 2) as f64;
    let (s, co) = (beam.pa + 90.0).to_radians().sin_cos();
    Array2::from_shape_fn((DIM, DIM), |(y, x)| {
        let dx = (x as f64 - c) * PIXEL_ARCSEC;
        let dy = (y as f64 - c) * PIXEL_ARCSEC;
        // The major axis points along the position angle, east (-x) of north
        // (+y).
        let along = dx * co + dy * s;
        let across = -dx * s + dy * co;
        let r2 = (along / beam.major).powi(2) + (across / beam.minor).powi(2);
        (-4.0 * std::f64::consts::LN_2 * r2).exp() as f32
    })
}

fn write_band(dir: &Path, band: &SyntheticBand) {
    let freq_file = dir.join(format!("{FIELD}.{}.bandcube.frequencies.txt", band.band));
    let freqs = band.freqs.iter().map(|f| format!("{f:e}\n")).collect::<String>();
    std::fs::write(freq_file, freqs).unwrap();

    let plane = point_source(&band.beam);
    let num_chans = band.freqs.len();
    for (i, stokes) in Stokes::ALL.into_iter().enumerate() {
        let file = dir.join(format!(
            "{FIELD}.{}.{}.cutout.bandcube.fits",
            band.band,
            stokes.as_str()
        ));
        // Stokes I is the brightest.
        let scale = 1.0 / (i + 1) as f32;
        let data = Array3::from_shape_fn((num_chans, DIM, DIM), |(_, y, x)| plane[(y, x)] * scale);

        let description = ImageDescription {
            data_type: ImageType::Float,
            dimensions: &[num_chans, DIM, DIM],
        };
        let mut fptr = FitsFile::create(&file)
            .with_custom_primary(&description)
            .open()
            .unwrap();
        let hdu = fptr.primary_hdu().unwrap();
        hdu.write_image(&mut fptr, data.as_slice().unwrap()).unwrap();
        let cdelt = PIXEL_ARCSEC / 3600.0;
        hdu.write_key(&mut fptr, "OBJECT", FIELD).unwrap();
        hdu.write_key(&mut fptr, "BUNIT", "Jy/beam").unwrap();
        hdu.write_key(&mut fptr, "CTYPE1", "RA---SIN").unwrap();
        hdu.write_key(&mut fptr, "CTYPE2", "DEC--SIN").unwrap();
        hdu.write_key(&mut fptr, "CTYPE3", "FREQ").unwrap();
        hdu.write_key(&mut fptr, "CRVAL1", 12.5).unwrap();
        hdu.write_key(&mut fptr, "CRVAL2", -45.0).unwrap();
        hdu.write_key(&mut fptr, "CRVAL3", band.freqs[0]).unwrap();
        hdu.write_key(&mut fptr, "CDELT1", -cdelt).unwrap();
        hdu.write_key(&mut fptr, "CDELT2", cdelt).unwrap();
        hdu.write_key(&mut fptr, "CDELT3", 1e8).unwrap();
        hdu.write_key(&mut fptr, "CRPIX1", (DIM / 2 + 1) as f64).unwrap();
        hdu.write_key(&mut fptr, "CRPIX2", (DIM / 2 + 1) as f64).unwrap();
        hdu.write_key(&mut fptr, "CRPIX3", 1.0).unwrap();
        let (bmaj, bmin, bpa) = band.beam.to_header_values();
        hdu.write_key(&mut fptr, "BMAJ", bmaj).unwrap();
        hdu.write_key(&mut fptr, "BMIN", bmin).unwrap();
        hdu.write_key(&mut fptr, "BPA", bpa).unwrap();
    }
}

fn params(outdir: &Path, dry_run: bool) -> BigCubeParams {
    BigCubeParams {
        field: FIELD.to_string(),
        outdir: outdir.to_path_buf(),
        target: None,
        common_beam: CommonBeamParams::default(),
        dry_run,
        debug_plots: false,
        history: Some("quocka_bigcube test".to_string()),
        progress_bars: false,
    }
}

#[test]
fn three_bands_make_one_cube_per_stokes() {
    let tmp = tempdir().unwrap();
    let datadir = tmp.path();
    for band in bands() {
        write_band(datadir, &band);
    }
    let outdir = datadir.join("out");

    let reader = FitsBandReader::discover(datadir, FIELD).unwrap();
    let outcome = run(&reader, &params(&outdir, false), &SerialPool).unwrap();
    let (beam, cubes, frequencies) = match outcome {
        Outcome::Written {
            beam,
            cubes,
            frequencies,
        } => (beam, cubes, frequencies),
        other => panic!("expected cubes to be written, got {other:?}"),
    };
    assert!(beam.major >= 10.0);
    assert!(beam.minor >= 8.0);
    assert_eq!(cubes.len(), 4);

    let freqs = read_frequencies(&frequencies).unwrap();
    assert_eq!(freqs.len(), 7);
    assert!(freqs.windows(2).all(|w| w[0] < w[1]));
    assert_abs_diff_eq!(freqs[0], 1.9e9);
    assert_abs_diff_eq!(freqs[6], 7.5e9);

    for (stokes, file) in Stokes::ALL.into_iter().zip(&cubes) {
        assert!(file
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(&format!("{FIELD}.{}.", stokes.as_str())));
        let written = read_beam(file).unwrap();
        assert_abs_diff_eq!(written.major, beam.major, epsilon = 1e-4);
        assert_abs_diff_eq!(written.minor, beam.minor, epsilon = 1e-4);

        let cube = read_band_cube(file, 0, stokes).unwrap();
        assert_eq!(cube.data.dim(), (7, DIM, DIM));
        let spectral = cube.spectral.unwrap();
        assert_abs_diff_eq!(spectral.crval, 1.9e9, epsilon = 1.0);
        assert_abs_diff_eq!(spectral.crpix, 1.0);
        assert_eq!(cube.header.get_str("OBJECT"), Some(FIELD));

        // Every channel now sees the same source at the same resolution.
        let expected = 1.0 / (stokes.index() + 1) as f32;
        for plane in cube.data.outer_iter() {
            assert_abs_diff_eq!(plane[(DIM / 2, DIM / 2)], expected, epsilon = 0.05 * expected);
        }
    }
}

#[test]
fn workers_give_the_same_answer() {
    let tmp = tempdir().unwrap();
    let datadir = tmp.path();
    for band in bands() {
        write_band(datadir, &band);
    }
    let reader = FitsBandReader::discover(datadir, FIELD).unwrap();
    let serial = datadir.join("serial");
    let threads = datadir.join("threads");
    let processes = datadir.join("processes");
    let three = NonZeroUsize::new(3).unwrap();
    run(&reader, &params(&serial, false), &SerialPool).unwrap();
    run(&reader, &params(&threads, false), &ThreadPool::new(three).unwrap()).unwrap();
    let workers = ProcessPool::with_executable(PathBuf::from(env!("CARGO_BIN_EXE_quocka_worker")), three);
    run(&reader, &params(&processes, false), &workers).unwrap();

    let file = format!("{FIELD}.q.cutout.bigcube.fits");
    let a = read_band_cube(&serial.join(&file), 0, Stokes::Q).unwrap();
    let b = read_band_cube(&threads.join(&file), 0, Stokes::Q).unwrap();
    let c = read_band_cube(&processes.join(&file), 0, Stokes::Q).unwrap();
    assert_eq!(a.data, b.data);
    assert_eq!(a.data, c.data);
}

#[test]
fn a_dry_run_only_finds_the_beam() {
    let tmp = tempdir().unwrap();
    let datadir = tmp.path();
    for band in bands() {
        write_band(datadir, &band);
    }
    let outdir = datadir.join("out");
    let reader = FitsBandReader::discover(datadir, FIELD).unwrap();
    match run(&reader, &params(&outdir, true), &SerialPool).unwrap() {
        Outcome::DryRun { beam } => {
            assert!(beam.major >= 10.0);
            assert!(beam.minor >= 8.0);
        }
        other => panic!("expected a dry run, got {other:?}"),
    }
    assert!(!outdir.exists());
}
