//! FFT convolution of image planes with a fixed kernel.

use std::sync::Arc;

use ndarray::prelude::*;
use ndarray::Zip;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use thiserror::Error;

use crate::beam::GaussianKernel;

#[derive(Error, Debug, PartialEq)]
pub enum ConvolveError {
    #[error("Expected an image of shape {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        got: (usize, usize),
    },
}

/// Convolves planes of one shape with one kernel. The kernel's spectrum is
/// computed once; planes can then be convolved from any thread.
pub struct Convolver {
    image_dim: (usize, usize),
    /// Where the "same"-sized output starts in the full convolution.
    offset: (usize, usize),
    padded_dim: (usize, usize),
    forward: [Arc<dyn Fft<f64>>; 2],
    inverse: [Arc<dyn Fft<f64>>; 2],
    /// `None` for the identity kernel.
    kernel_spectrum: Option<Array2<Complex<f64>>>,
}

impl Convolver {
    pub fn new(kernel: &GaussianKernel, image_dim: (usize, usize)) -> Convolver {
        let (ky, kx) = kernel.dim();
        let (ny, nx) = image_dim;
        let padded_dim = (ny + ky - 1, nx + kx - 1);
        let mut planner = FftPlanner::new();
        let forward = [
            planner.plan_fft_forward(padded_dim.0),
            planner.plan_fft_forward(padded_dim.1),
        ];
        let inverse = [
            planner.plan_fft_inverse(padded_dim.0),
            planner.plan_fft_inverse(padded_dim.1),
        ];

        let mut convolver = Convolver {
            image_dim,
            offset: (ky / 2, kx / 2),
            padded_dim,
            forward,
            inverse,
            kernel_spectrum: None,
        };
        if !kernel.is_identity() {
            let mut spectrum = Array2::zeros(padded_dim);
            spectrum
                .slice_mut(s![..ky, ..kx])
                .zip_mut_with(&kernel.array, |z, &k| *z = Complex::new(k, 0.0));
            convolver.fft2(&mut spectrum, true);
            convolver.kernel_spectrum = Some(spectrum);
        }
        convolver
    }

    /// Convolve a plane, keeping its shape. Non-finite pixels are treated as
    /// zero during the convolution and are NaN in the output.
    pub fn convolve(&self, plane: ArrayView2<f32>) -> Result<Array2<f32>, ConvolveError> {
        if plane.dim() != self.image_dim {
            return Err(ConvolveError::ShapeMismatch {
                expected: self.image_dim,
                got: plane.dim(),
            });
        }
        let kernel_spectrum = match &self.kernel_spectrum {
            Some(k) => k,
            None => return Ok(plane.mapv(|v| if v.is_finite() { v } else { f32::NAN })),
        };

        let (ny, nx) = self.image_dim;
        let mut buffer = Array2::zeros(self.padded_dim);
        buffer
            .slice_mut(s![..ny, ..nx])
            .zip_mut_with(&plane, |b, &v| {
                if v.is_finite() {
                    *b = Complex::new(v as f64, 0.0);
                }
            });
        self.fft2(&mut buffer, true);
        buffer *= kernel_spectrum;
        self.fft2(&mut buffer, false);

        let norm = 1.0 / (self.padded_dim.0 * self.padded_dim.1) as f64;
        let (oy, ox) = self.offset;
        let mut out = Array2::zeros(self.image_dim);
        Zip::from(&mut out)
            .and(&plane)
            .and(&buffer.slice(s![oy..oy + ny, ox..ox + nx]))
            .for_each(|o, &v, b| {
                *o = if v.is_finite() {
                    (b.re * norm) as f32
                } else {
                    f32::NAN
                };
            });
        Ok(out)
    }

    /// Unnormalised 2D FFT, in place.
    fn fft2(&self, data: &mut Array2<Complex<f64>>, forward: bool) {
        let [col_fft, row_fft] = if forward {
            &self.forward
        } else {
            &self.inverse
        };
        let mut scratch = Vec::with_capacity(self.padded_dim.0.max(self.padded_dim.1));
        for mut row in data.rows_mut() {
            scratch.clear();
            scratch.extend(row.iter().copied());
            row_fft.process(&mut scratch);
            row.iter_mut().zip(&scratch).for_each(|(d, s)| *d = *s);
        }
        for mut col in data.columns_mut() {
            scratch.clear();
            scratch.extend(col.iter().copied());
            col_fft.process(&mut scratch);
            col.iter_mut().zip(&scratch).for_each(|(d, s)| *d = *s);
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::beam::Beam;

    /// Direct "same" convolution for comparison.
    fn direct(image: &Array2<f32>, kernel: &Array2<f64>) -> Array2<f64> {
        let (ny, nx) = image.dim();
        let (ky, kx) = kernel.dim();
        let (cy, cx) = (ky / 2, kx / 2);
        Array2::from_shape_fn((ny, nx), |(y, x)| {
            let mut sum = 0.0;
            for j in 0..ky {
                for i in 0..kx {
                    let (iy, ix) = (y as i64 + cy as i64 - j as i64, x as i64 + cx as i64 - i as i64);
                    if iy >= 0 && ix >= 0 && (iy as usize) < ny && (ix as usize) < nx {
                        sum += kernel[(j, i)] * image[(iy as usize, ix as usize)] as f64;
                    }
                }
            }
            sum
        })
    }

    #[test]
    fn matches_direct_convolution() {
        let beam = Beam::new(6.0, 3.0, 25.0).unwrap();
        let kernel = GaussianKernel::new(&beam, 1.0);
        let image = Array2::from_shape_fn((20, 17), |(y, x)| ((y * 7 + x * 3) % 11) as f32 - 5.0);
        let convolver = Convolver::new(&kernel, image.dim());
        let fft = convolver.convolve(image.view()).unwrap();
        let expected = direct(&image, &kernel.array);
        for (a, b) in fft.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*a as f64, *b, epsilon = 1e-3);
        }
    }

    #[test]
    fn delta_becomes_the_kernel() {
        let beam = Beam::new(4.0, 4.0, 0.0).unwrap();
        let kernel = GaussianKernel::new(&beam, 1.0);
        let mut image = Array2::zeros((31, 31));
        image[(15, 15)] = 1.0_f32;
        let out = Convolver::new(&kernel, image.dim())
            .convolve(image.view())
            .unwrap();
        assert_abs_diff_eq!(out[(15, 15)], 1.0, epsilon = 1e-6);
        let (ky, _) = kernel.dim();
        let half = ky / 2;
        assert_abs_diff_eq!(
            out[(15 + 2, 15)] as f64,
            kernel.array[(half + 2, half)],
            epsilon = 1e-6
        );
    }

    #[test]
    fn a_unit_sum_kernel_conserves_flux() {
        let beam = Beam::new(6.0, 4.0, 40.0).unwrap();
        let kernel = GaussianKernel::new(&beam, 1.0).normalised_to_sum();
        let mut image = Array2::zeros((41, 41));
        image.slice_mut(s![19..22, 19..22]).fill(1.0_f32);
        let out = Convolver::new(&kernel, image.dim())
            .convolve(image.view())
            .unwrap();
        assert_abs_diff_eq!(out.sum(), 9.0, epsilon = 1e-4);
    }

    #[test]
    fn nan_pixels_stay_nan() {
        let beam = Beam::new(4.0, 4.0, 0.0).unwrap();
        let kernel = GaussianKernel::new(&beam, 1.0);
        let mut image = Array2::from_elem((16, 16), 1.0_f32);
        image[(3, 4)] = f32::NAN;
        image[(10, 10)] = f32::INFINITY;
        let out = Convolver::new(&kernel, image.dim())
            .convolve(image.view())
            .unwrap();
        assert!(out[(3, 4)].is_nan());
        assert!(out[(10, 10)].is_nan());
        assert_eq!(out.iter().filter(|v| v.is_nan()).count(), 2);
    }

    #[test]
    fn identity_kernel_changes_nothing() {
        let image = Array2::from_shape_fn((5, 6), |(y, x)| (y * 6 + x) as f32);
        let out = Convolver::new(&GaussianKernel::identity(), image.dim())
            .convolve(image.view())
            .unwrap();
        assert_eq!(out, image);
        assert!(matches!(
            Convolver::new(&GaussianKernel::identity(), (5, 6)).convolve(Array2::zeros((2, 2)).view()),
            Err(ConvolveError::ShapeMismatch { .. })
        ));
    }
}
