//! Per-plane work, described by plain data so that it can be handed to another
//! process and redone there.

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use super::PoolError;
use crate::{
    beam::{Beam, GaussianKernel},
    convolve::Convolver,
    regrid::RegridPlan,
    wcs::CelestialWcs,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlaneOp {
    /// Regrid planes of `in_dim` on `input` onto `output`. Dimensions are
    /// (ny, nx).
    Regrid {
        input: CelestialWcs,
        in_dim: (usize, usize),
        output: CelestialWcs,
        out_dim: (usize, usize),
    },

    /// Convolve planes of `dim` with `conv`, sampled on square pixels of
    /// `pixel_scale` arcsec, then multiply by `factor`.
    Smooth {
        conv: Beam,
        pixel_scale: f64,
        dim: (usize, usize),
        factor: f64,
    },
}

impl PlaneOp {
    /// The (ny, nx) of every output plane.
    pub fn out_dim(&self) -> (usize, usize) {
        match self {
            PlaneOp::Regrid { out_dim, .. } => *out_dim,
            PlaneOp::Smooth { dim, .. } => *dim,
        }
    }

    /// Do the expensive set-up that every plane shares.
    pub fn prepare(&self) -> Result<PreparedOp, PoolError> {
        Ok(match self {
            PlaneOp::Regrid {
                input,
                in_dim,
                output,
                out_dim,
            } => PreparedOp::Regrid(RegridPlan::new(input, *in_dim, output, *out_dim)?),
            PlaneOp::Smooth {
                conv,
                pixel_scale,
                dim,
                factor,
            } => PreparedOp::Smooth {
                convolver: Convolver::new(&GaussianKernel::new(conv, *pixel_scale), *dim),
                factor: *factor as f32,
            },
        })
    }
}

/// A [`PlaneOp`] ready to be applied to planes.
pub enum PreparedOp {
    Regrid(RegridPlan),
    Smooth { convolver: Convolver, factor: f32 },
}

impl PreparedOp {
    pub fn apply(&self, plane: ArrayView2<f32>) -> Result<Array2<f32>, PoolError> {
        match self {
            PreparedOp::Regrid(plan) => Ok(plan.apply(plane)?),
            PreparedOp::Smooth { convolver, factor } => {
                let mut smoothed = convolver.convolve(plane)?;
                smoothed.mapv_inplace(|v| v * factor);
                Ok(smoothed)
            }
        }
    }
}
