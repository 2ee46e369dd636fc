//! Channel planes processed by separate quocka_worker processes.

use std::{num::NonZeroUsize, path::PathBuf};

use indicatif::ProgressBar;
use ndarray::prelude::*;

use quocka::{
    beam::Beam,
    convolve::ConvolveError,
    pool::{PlaneOp, PlanePool, PoolError, ProcessPool, SerialPool},
    read::fits::FitsHeader,
    wcs::CelestialWcs,
};

fn workers(n: usize) -> ProcessPool {
    ProcessPool::with_executable(
        PathBuf::from(env!("CARGO_BIN_EXE_quocka_worker")),
        NonZeroUsize::new(n).unwrap(),
    )
}

fn grid(crpix: f64) -> CelestialWcs {
    let cdelt = 1.5 / 3600.0;
    CelestialWcs::from_header(&FitsHeader::from_pairs([
        ("CTYPE1", "RA---SIN".to_string()),
        ("CTYPE2", "DEC--SIN".to_string()),
        ("CRVAL1", "330.0".to_string()),
        ("CRVAL2", "-20.0".to_string()),
        ("CRPIX1", crpix.to_string()),
        ("CRPIX2", crpix.to_string()),
        ("CDELT1", (-cdelt).to_string()),
        ("CDELT2", cdelt.to_string()),
    ]))
    .unwrap()
}

fn cube(num_chans: usize) -> Array3<f32> {
    Array3::from_shape_fn((num_chans, 20, 20), |(c, y, x)| {
        ((c * 7 + y * 3 + x) % 13) as f32 - 6.0
    })
}

fn same(a: &Array3<f32>, b: &Array3<f32>) -> bool {
    a.dim() == b.dim()
        && a
            .iter()
            .zip(b.iter())
            .all(|(a, b)| a == b || (a.is_nan() && b.is_nan()))
}

#[test]
fn workers_regrid_like_the_calling_process() {
    let op = PlaneOp::Regrid {
        input: grid(10.0),
        in_dim: (20, 20),
        output: grid(11.5),
        out_dim: (18, 20),
    };
    // More channels than workers, and not a multiple of them.
    let data = cube(7);
    let expected = SerialPool
        .map_planes(&op, data.view(), &ProgressBar::hidden())
        .unwrap();
    let bar = ProgressBar::hidden();
    let got = workers(3).map_planes(&op, data.view(), &bar).unwrap();
    assert!(same(&got, &expected));
    assert_eq!(bar.position(), 7);
}

#[test]
fn workers_smooth_like_the_calling_process() {
    let op = PlaneOp::Smooth {
        conv: Beam::new(6.0, 4.5, 20.0).unwrap(),
        pixel_scale: 1.5,
        dim: (20, 20),
        factor: 0.8,
    };
    let mut data = cube(2);
    data[(1, 4, 4)] = f32::NAN;
    let expected = SerialPool
        .map_planes(&op, data.view(), &ProgressBar::hidden())
        .unwrap();
    // More workers than channels.
    let got = workers(4)
        .map_planes(&op, data.view(), &ProgressBar::hidden())
        .unwrap();
    assert!(same(&got, &expected));
    assert!(got[(1, 4, 4)].is_nan());
}

#[test]
fn a_failing_worker_fails_the_map() {
    // The planes are smaller than the worker is told to expect.
    let op = PlaneOp::Smooth {
        conv: Beam::circular(5.0).unwrap(),
        pixel_scale: 1.5,
        dim: (21, 21),
        factor: 1.0,
    };
    match workers(2).map_planes(&op, cube(3).view(), &ProgressBar::hidden()) {
        Err(PoolError::Worker { status, output, .. }) => {
            assert!(!status.success());
            let shape_error = ConvolveError::ShapeMismatch {
                expected: (21, 21),
                got: (20, 20),
            };
            assert!(output.contains(&shape_error.to_string()), "{output}");
        }
        other => panic!("expected a worker to fail, got {other:?}"),
    }
}
