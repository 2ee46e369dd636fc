//! Sampled elliptical Gaussian kernels.

use ndarray::prelude::*;

use super::{Beam, FWHM_TO_SIGMA};

/// The kernel extends this many standard deviations across.
const KERNEL_WIDTH_SIGMAS: f64 = 8.0;

/// Kernels narrower than this (in pixels) are sampled as if they had this
/// width; a zero-width axis can't be sampled.
const MIN_SIGMA_PIXELS: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct GaussianKernel {
    /// Indexed \[y\]\[x\]; both dimensions are odd and the peak is in the
    /// middle.
    pub array: Array2<f64>,
}

impl GaussianKernel {
    /// Sample `beam` on pixels of `pixel_scale` arcsec, normalised to a peak of
    /// 1. A point beam gives the 1x1 identity kernel.
    pub fn new(beam: &Beam, pixel_scale: f64) -> GaussianKernel {
        if beam.is_point() {
            return GaussianKernel::identity();
        }
        let sigma_major = (beam.major * FWHM_TO_SIGMA / pixel_scale).max(MIN_SIGMA_PIXELS);
        let sigma_minor = (beam.minor * FWHM_TO_SIGMA / pixel_scale).max(MIN_SIGMA_PIXELS);
        // Measured counter-clockwise from +x; the position angle is measured
        // from +y.
        let theta = (beam.pa + 90.0).to_radians();
        let (s, c) = theta.sin_cos();

        let size = {
            let size = (KERNEL_WIDTH_SIGMAS * sigma_major).ceil() as usize;
            if size % 2 == 0 {
                size + 1
            } else {
                size
            }
        };
        let centre = (size / 2) as f64;
        let array = Array2::from_shape_fn((size, size), |(y, x)| {
            let dx = x as f64 - centre;
            let dy = y as f64 - centre;
            let u = dx * c + dy * s;
            let v = -dx * s + dy * c;
            (-0.5 * ((u / sigma_major).powi(2) + (v / sigma_minor).powi(2))).exp()
        });
        GaussianKernel { array }
    }

    pub fn identity() -> GaussianKernel {
        GaussianKernel {
            array: Array2::ones((1, 1)),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.array.dim() == (1, 1) && self.array[(0, 0)] == 1.0
    }

    pub fn sum(&self) -> f64 {
        self.array.sum()
    }

    /// The same kernel scaled to sum to 1.
    pub fn normalised_to_sum(&self) -> GaussianKernel {
        let sum = self.sum();
        GaussianKernel {
            array: self.array.mapv(|v| v / sum),
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.array.dim()
    }
}
