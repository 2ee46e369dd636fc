//! Elliptical Gaussian beams.
//!
//! Beam axes are full widths at half maximum in arcseconds; position angles
//! are in degrees, measured from north towards east. FITS headers store the
//! same quantities in degrees (BMAJ, BMIN, BPA).

pub mod common;
mod error;
pub mod kernel;

pub use common::{solve_common_beam, CommonBeamError, CommonBeamParams};
pub use error::BeamError;
pub use kernel::GaussianKernel;

use std::{
    f64::consts::{LN_2, PI},
    fmt::Display,
};

use serde::{Deserialize, Serialize};

use crate::read::fits::FitsHeader;

/// Multiply a FWHM by this to get the Gaussian's standard deviation.
pub const FWHM_TO_SIGMA: f64 = 0.42466090014400953; // 1 / sqrt(8 ln 2)

/// Relative (to the square of the largest axis involved) slack allowed when
/// deciding whether a deconvolution is possible.
const DECONVOLVE_TOLERANCE: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Beam {
    /// FWHM of the major axis \[arcsec\]
    pub major: f64,
    /// FWHM of the minor axis \[arcsec\]
    pub minor: f64,
    /// Position angle of the major axis \[degrees\]
    pub pa: f64,
}

impl Beam {
    pub fn new(major: f64, minor: f64, pa: f64) -> Result<Beam, BeamError> {
        if !(major.is_finite() && minor.is_finite() && pa.is_finite()) {
            return Err(BeamError::NonFinite { major, minor, pa });
        }
        if major < 0.0 || minor < 0.0 {
            return Err(BeamError::Negative { major, minor });
        }
        if major < minor {
            return Err(BeamError::MajorSmallerThanMinor { major, minor });
        }
        Ok(Beam { major, minor, pa })
    }

    /// A round beam with the given FWHM \[arcsec\].
    pub fn circular(fwhm: f64) -> Result<Beam, BeamError> {
        Beam::new(fwhm, fwhm, 0.0)
    }

    /// The beam of zero extent; convolving with it changes nothing.
    pub fn point() -> Beam {
        Beam {
            major: 0.0,
            minor: 0.0,
            pa: 0.0,
        }
    }

    pub fn is_point(&self) -> bool {
        self.major == 0.0 && self.minor == 0.0
    }

    /// Read BMAJ, BMIN and BPA (all degrees) from a header.
    pub fn from_header(header: &FitsHeader) -> Result<Beam, BeamError> {
        let bmaj: f64 = header.require("BMAJ")?;
        let bmin: f64 = header.require("BMIN")?;
        let bpa: f64 = header.get("BPA")?.unwrap_or(0.0);
        Beam::new(bmaj * 3600.0, bmin * 3600.0, bpa)
    }

    /// (BMAJ, BMIN, BPA) as written to a FITS header.
    pub fn to_header_values(&self) -> (f64, f64, f64) {
        (self.major / 3600.0, self.minor / 3600.0, self.pa)
    }

    /// The solid angle of the beam \[arcsec^2\].
    pub fn area(&self) -> f64 {
        PI / (4.0 * LN_2) * self.major * self.minor
    }

    /// Round the axes (arcsec) and the position angle (degrees) up to the
    /// given number of decimal places.
    pub fn round_up(&self, decimals: i32) -> Beam {
        let scale = 10f64.powi(decimals);
        let up = |x: f64| (x * scale).ceil() / scale;
        Beam {
            major: up(self.major),
            minor: up(self.minor),
            pa: up(self.pa),
        }
    }

    fn quadratic(&self) -> Quadratic {
        let (s, c) = self.pa.to_radians().sin_cos();
        let maj2 = self.major * self.major;
        let min2 = self.minor * self.minor;
        Quadratic {
            alpha: maj2 * c * c + min2 * s * s,
            beta: maj2 * s * s + min2 * c * c,
            gamma: 2.0 * (min2 - maj2) * s * c,
        }
    }

    /// The beam obtained by convolving this beam with `other`.
    pub fn convolve(&self, other: &Beam) -> Beam {
        let q = self.quadratic().add(&other.quadratic());
        q.to_beam(0.0)
    }

    /// The beam that, convolved with `other`, gives this beam. Deconvolving a
    /// beam by itself gives a point beam. It is an error for `other` to be
    /// wider than this beam in any direction.
    pub fn deconvolve(&self, other: &Beam) -> Result<Beam, BeamError> {
        let q = self.quadratic().sub(&other.quadratic());
        let limit = DECONVOLVE_TOLERANCE * self.major.max(other.major).powi(2);
        let (s, t) = q.s_t();
        if q.alpha < -limit || q.beta < -limit || s - t < -limit {
            return Err(BeamError::NotDeconvolvable {
                target: *self,
                native: *other,
            });
        }
        Ok(q.to_beam(limit))
    }

    /// Can this beam be deconvolved by `other`?
    pub fn encloses(&self, other: &Beam) -> bool {
        self.deconvolve(other).is_ok()
    }
}

impl Display for Beam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.2}\" x {:.2}\" @ {:.2} deg",
            self.major, self.minor, self.pa
        )
    }
}

/// The coefficients of a Gaussian's exponent; beams add and subtract in this
/// form.
#[derive(Debug, Clone, Copy)]
struct Quadratic {
    alpha: f64,
    beta: f64,
    gamma: f64,
}

impl Quadratic {
    fn add(&self, other: &Quadratic) -> Quadratic {
        Quadratic {
            alpha: self.alpha + other.alpha,
            beta: self.beta + other.beta,
            gamma: self.gamma + other.gamma,
        }
    }

    fn sub(&self, other: &Quadratic) -> Quadratic {
        Quadratic {
            alpha: self.alpha - other.alpha,
            beta: self.beta - other.beta,
            gamma: self.gamma - other.gamma,
        }
    }

    fn s_t(&self) -> (f64, f64) {
        let s = self.alpha + self.beta;
        let t = ((self.alpha - self.beta).powi(2) + self.gamma.powi(2)).sqrt();
        (s, t)
    }

    /// Components smaller than `limit` (arcsec^2) are treated as zero.
    fn to_beam(self, limit: f64) -> Beam {
        let (s, t) = self.s_t();
        let major2 = 0.5 * (s + t);
        let minor2 = 0.5 * (s - t);
        if major2 <= limit {
            return Beam::point();
        }
        let major = major2.sqrt();
        let minor = if minor2 <= limit { 0.0 } else { minor2.sqrt() };
        let pa = if t <= limit {
            0.0
        } else {
            0.5 * (-self.gamma).atan2(self.alpha - self.beta)
        };
        Beam {
            major,
            minor,
            pa: pa.to_degrees(),
        }
    }
}

/// The flux-scaling result for one native/kernel beam pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussFactor {
    /// Multiply kernel-convolved data (kernel normalised to unit peak) by this
    /// to keep Jy/beam correct.
    pub factor: f64,
    /// Amplitude of the convolved Gaussian \[arcsec^2\].
    pub amplitude: f64,
    /// The convolution of the two beams.
    pub beam: Beam,
}

/// Given a convolving beam `conv` and the data's native beam `orig`, work out
/// the amplitude of their convolution and the factor that keeps a
/// point-source peak at its Jy/beam value. `dx` and `dy` are the pixel
/// increments \[arcsec\].
pub fn gauss_factor(conv: &Beam, orig: &Beam, dx: f64, dy: f64) -> GaussFactor {
    let q = conv.quadratic().add(&orig.quadratic());
    let beam = q.to_beam(0.0);
    let pixel_area = (dx * dy).abs();
    if conv.is_point() || orig.is_point() {
        // Convolving with a unit-peak delta is the identity.
        return GaussFactor {
            factor: 1.0,
            amplitude: pixel_area,
            beam,
        };
    }
    let discriminant = q.alpha * q.beta - 0.25 * q.gamma * q.gamma;
    let amplitude = PI / (4.0 * LN_2) * conv.major * conv.minor * orig.major * orig.minor
        / discriminant.sqrt();
    GaussFactor {
        factor: pixel_area / amplitude,
        amplitude,
        beam,
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn new_beam_validation() {
        assert!(Beam::new(10.0, 8.0, 0.0).is_ok());
        assert!(matches!(
            Beam::new(8.0, 10.0, 0.0),
            Err(BeamError::MajorSmallerThanMinor { .. })
        ));
        assert!(matches!(
            Beam::new(-1.0, -2.0, 0.0),
            Err(BeamError::Negative { .. })
        ));
        assert!(matches!(
            Beam::new(f64::NAN, 2.0, 0.0),
            Err(BeamError::NonFinite { .. })
        ));
    }

    #[test]
    fn beam_from_header() {
        let header = FitsHeader::from_pairs([
            ("BMAJ", "0.0027777777777777779"),
            ("BMIN", "0.0022222222222222222"),
            ("BPA", "30.0"),
        ]);
        let beam = Beam::from_header(&header).unwrap();
        assert_abs_diff_eq!(beam.major, 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(beam.minor, 8.0, epsilon = 1e-9);
        assert_abs_diff_eq!(beam.pa, 30.0);

        let header = FitsHeader::from_pairs([("BMAJ", "0.001")]);
        assert!(matches!(
            Beam::from_header(&header),
            Err(BeamError::Header(_))
        ));
    }

    #[test]
    fn circular_beams_add_in_quadrature() {
        let a = Beam::circular(3.0).unwrap();
        let b = Beam::circular(4.0).unwrap();
        let c = a.convolve(&b);
        assert_abs_diff_eq!(c.major, 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(c.minor, 5.0, epsilon = 1e-12);

        let d = c.deconvolve(&a).unwrap();
        assert_abs_diff_eq!(d.major, 4.0, epsilon = 1e-9);
        assert_abs_diff_eq!(d.minor, 4.0, epsilon = 1e-9);
    }

    #[test]
    fn convolve_then_deconvolve_recovers_elliptical_beam() {
        let native = Beam::new(6.0, 5.0, 30.0).unwrap();
        let kernel = Beam::new(7.0, 3.0, -50.0).unwrap();
        let target = native.convolve(&kernel);
        let recovered = target.deconvolve(&native).unwrap();
        assert_abs_diff_eq!(recovered.major, kernel.major, epsilon = 1e-9);
        assert_abs_diff_eq!(recovered.minor, kernel.minor, epsilon = 1e-9);
        assert_abs_diff_eq!(recovered.pa, kernel.pa, epsilon = 1e-7);
    }

    #[test]
    fn deconvolving_a_beam_by_itself_gives_a_point() {
        let beam = Beam::new(10.0, 8.0, 12.0).unwrap();
        let point = beam.deconvolve(&beam).unwrap();
        assert!(point.is_point());
        assert!(beam.encloses(&beam));
    }

    #[test]
    fn narrower_target_cannot_be_deconvolved() {
        let target = Beam::new(10.0, 8.0, 0.0).unwrap();
        // Wider along the minor axis of the target.
        let native = Beam::new(9.0, 9.0, 0.0).unwrap();
        assert!(matches!(
            target.deconvolve(&native),
            Err(BeamError::NotDeconvolvable { .. })
        ));
        // Same shape, rotated.
        let rotated = Beam::new(10.0, 8.0, 45.0).unwrap();
        assert!(!target.encloses(&rotated));
    }

    #[test]
    fn deconvolution_along_one_axis_gives_a_line() {
        let target = Beam::new(10.0, 5.0, 0.0).unwrap();
        let native = Beam::new(8.0, 5.0, 0.0).unwrap();
        let kernel = target.deconvolve(&native).unwrap();
        assert_abs_diff_eq!(kernel.major, 6.0, epsilon = 1e-9);
        assert_abs_diff_eq!(kernel.minor, 0.0);
        assert_abs_diff_eq!(kernel.pa, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn round_up_goes_up() {
        let beam = Beam::new(10.01, 7.999, -30.05).unwrap().round_up(1);
        assert_abs_diff_eq!(beam.major, 10.1, epsilon = 1e-12);
        assert_abs_diff_eq!(beam.minor, 8.0, epsilon = 1e-12);
        assert_abs_diff_eq!(beam.pa, -30.0, epsilon = 1e-12);
    }

    #[test]
    fn gauss_factor_for_equal_round_beams() {
        let beam = Beam::circular(10.0).unwrap();
        let gf = gauss_factor(&beam, &beam, 1.0, 1.0);
        // pi / (4 ln 2) * 10^4 / 200
        assert_abs_diff_eq!(gf.amplitude, 56.654501773, epsilon = 1e-6);
        assert_abs_diff_eq!(gf.factor, 1.0 / 56.654501773, epsilon = 1e-9);
        assert_abs_diff_eq!(gf.beam.major, 200f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn gauss_factor_matches_area_ratio() {
        // For a unit-peak kernel, the factor is the ratio of the output beam
        // area to the product of the native and kernel areas (per pixel).
        let native = Beam::new(6.0, 5.0, 30.0).unwrap();
        let conv = Beam::new(7.0, 4.0, -20.0).unwrap();
        let gf = gauss_factor(&conv, &native, 2.0, 2.0);
        let expected = gf.beam.area() * 4.0 / (native.area() * conv.area());
        assert_abs_diff_eq!(gf.factor, expected, epsilon = 1e-12);
    }

    #[test]
    fn gauss_factor_of_a_point_is_one() {
        let native = Beam::new(6.0, 5.0, 30.0).unwrap();
        let gf = gauss_factor(&Beam::point(), &native, 2.0, 2.0);
        assert_abs_diff_eq!(gf.factor, 1.0);
        assert_abs_diff_eq!(gf.beam.major, native.major, epsilon = 1e-12);
    }
}
