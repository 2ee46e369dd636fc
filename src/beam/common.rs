//! Find the smallest beam that every beam in a set can be convolved up to.

use std::f64::consts::TAU;

use log::{debug, trace, warn};
use ndarray::prelude::*;
use ndarray_inverse::Inverse;
use thiserror::Error;

use super::Beam;

/// How many times to grow the sampling padding before giving up on a
/// candidate ellipse.
const MAX_EPSILON_ATTEMPTS: usize = 10;

/// How many times to widen the rounded beam by the rounding step before
/// giving up.
const MAX_ROUNDING_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommonBeamParams {
    /// Convergence tolerance of the minimum-volume ellipse search.
    pub tolerance: f64,
    /// Number of points sampled along each beam's edge.
    pub nsamps: usize,
    /// Fractional padding of the sampled points.
    pub epsilon: f64,
    /// Give up on the ellipse search after this many iterations.
    pub max_iterations: usize,
}

impl Default for CommonBeamParams {
    fn default() -> Self {
        CommonBeamParams {
            tolerance: 1e-4,
            nsamps: 200,
            epsilon: 5e-4,
            max_iterations: 100_000,
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum CommonBeamError {
    #[error("No beams were supplied")]
    NoBeams,

    #[error("At least 3 samples per beam are needed to find a common beam (got {0})")]
    TooFewSamples(usize),

    #[error("The ellipse search didn't converge within {0} iterations")]
    NoConvergence(usize),

    #[error("The ellipse search produced a singular matrix")]
    Singular,

    #[error("The candidate common beam {0} doesn't enclose every beam")]
    NotEnclosing(Beam),
}

/// Find the common beam of `beams`, rounded up to 0.1" (axes) and 0.1 deg
/// (position angle). If the search fails with the supplied tolerance, it is
/// retried once with a tolerance ten times smaller.
pub fn solve_common_beam(
    beams: &[Beam],
    params: &CommonBeamParams,
) -> Result<Beam, CommonBeamError> {
    solve_with_retry(beams, params, smallest_enclosing_beam)
}

fn solve_with_retry<F>(
    beams: &[Beam],
    params: &CommonBeamParams,
    mut search: F,
) -> Result<Beam, CommonBeamError>
where
    F: FnMut(&[Beam], &CommonBeamParams) -> Result<Beam, CommonBeamError>,
{
    let beam = match search(beams, params) {
        Ok(b) => b,
        Err(CommonBeamError::NoBeams) => return Err(CommonBeamError::NoBeams),
        Err(e) => {
            warn!("Couldn't find a common beam with tolerance {} ({e}); trying again with a smaller tolerance", params.tolerance);
            let params = CommonBeamParams {
                tolerance: params.tolerance * 0.1,
                ..*params
            };
            search(beams, &params)?
        }
    };
    debug!("Unrounded common beam: {beam}");
    round_up_enclosing(&beam, beams)
}

/// The smallest ellipse (in area) that every beam can be deconvolved by. If
/// the largest beam already encloses the others, it is returned unchanged.
pub fn smallest_enclosing_beam(
    beams: &[Beam],
    params: &CommonBeamParams,
) -> Result<Beam, CommonBeamError> {
    let largest = beams
        .iter()
        .copied()
        .max_by(|a, b| a.area().total_cmp(&b.area()))
        .ok_or(CommonBeamError::NoBeams)?;
    if beams.iter().all(|b| largest.encloses(b)) {
        trace!("The largest beam ({largest}) encloses all others");
        return Ok(largest);
    }
    if params.nsamps < 3 {
        return Err(CommonBeamError::TooFewSamples(params.nsamps));
    }

    let mut epsilon = params.epsilon;
    let mut candidate = None;
    for _ in 0..MAX_EPSILON_ATTEMPTS {
        let points = sample_edges(beams, params.nsamps, epsilon);
        let shape = min_volume_ellipse(points.view(), params.tolerance, params.max_iterations)?;
        let beam = beam_from_shape(shape.view());
        if beams.iter().all(|b| beam.encloses(b)) {
            return Ok(beam);
        }
        trace!("Candidate {beam} doesn't enclose all beams with epsilon {epsilon}");
        candidate = Some(beam);
        epsilon *= 2.0;
    }
    // candidate is always set when the loop runs to completion.
    Err(CommonBeamError::NotEnclosing(candidate.unwrap_or(largest)))
}

/// Round `beam` up; if rounding the position angle breaks enclosure, keep
/// widening by the rounding step.
fn round_up_enclosing(beam: &Beam, beams: &[Beam]) -> Result<Beam, CommonBeamError> {
    let mut rounded = beam.round_up(1);
    for _ in 0..MAX_ROUNDING_ATTEMPTS {
        if beams.iter().all(|b| rounded.encloses(b)) {
            return Ok(rounded);
        }
        rounded = Beam {
            major: rounded.major + 0.1,
            minor: rounded.minor + 0.1,
            pa: rounded.pa,
        };
    }
    Err(CommonBeamError::NotEnclosing(rounded))
}

/// Points along the FWHM edge of every beam, pushed out by `epsilon`. The
/// major axis of a beam lies along (cos pa, sin pa) in this frame.
fn sample_edges(beams: &[Beam], nsamps: usize, epsilon: f64) -> Array2<f64> {
    let mut points = Array2::zeros((beams.len() * nsamps, 2));
    let scale = 1.0 + epsilon;
    for (beam, mut chunk) in beams
        .iter()
        .zip(points.axis_chunks_iter_mut(Axis(0), nsamps))
    {
        let (s_pa, c_pa) = beam.pa.to_radians().sin_cos();
        for (i, mut point) in chunk.outer_iter_mut().enumerate() {
            let theta = TAU * i as f64 / nsamps as f64;
            let a = scale * beam.major * theta.cos();
            let b = scale * beam.minor * theta.sin();
            point[0] = a * c_pa - b * s_pa;
            point[1] = a * s_pa + b * c_pa;
        }
    }
    points
}

/// Khachiyan's algorithm for the minimum-volume ellipse centred on the
/// origin. Returns the 2x2 matrix `M` of the ellipse `x^T M^-1 x <= 1`.
fn min_volume_ellipse(
    points: ArrayView2<f64>,
    tolerance: f64,
    max_iterations: usize,
) -> Result<Array2<f64>, CommonBeamError> {
    let n = points.len_of(Axis(0));
    let d = points.len_of(Axis(1)) as f64;
    let mut u = Array1::from_elem(n, 1.0 / n as f64);

    let scatter = |u: &Array1<f64>| -> Array2<f64> {
        let weighted = &points * &u.view().insert_axis(Axis(1));
        points.t().dot(&weighted)
    };

    for iteration in 0..max_iterations {
        let x = scatter(&u);
        let x_inv = x.inv().ok_or(CommonBeamError::Singular)?;
        // Mahalanobis distance of every point.
        let m = (&points.dot(&x_inv) * &points).sum_axis(Axis(1));
        let (j, &max_m) = m
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .ok_or(CommonBeamError::Singular)?;
        let step = (max_m - d) / (d * (max_m - 1.0));
        let mut new_u = &u * (1.0 - step);
        new_u[j] += step;
        let change = (&new_u - &u).mapv(|v| v * v).sum().sqrt();
        u = new_u;
        if change < tolerance {
            trace!("Ellipse search converged after {} iterations", iteration + 1);
            return Ok(scatter(&u) * d);
        }
    }
    Err(CommonBeamError::NoConvergence(max_iterations))
}

/// Turn an ellipse matrix into a beam.
fn beam_from_shape(m: ArrayView2<f64>) -> Beam {
    let alpha = m[(0, 0)];
    let beta = m[(1, 1)];
    let off = 0.5 * (m[(0, 1)] + m[(1, 0)]);
    let s = alpha + beta;
    let t = ((alpha - beta).powi(2) + 4.0 * off * off).sqrt();
    let major = (0.5 * (s + t)).max(0.0).sqrt();
    let minor = (0.5 * (s - t)).max(0.0).sqrt();
    let pa = 0.5 * (2.0 * off).atan2(alpha - beta);
    Beam {
        major,
        minor,
        pa: pa.to_degrees(),
    }
}
