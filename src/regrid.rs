//! Exact-overlap regridding of images from one celestial grid onto another.
//!
//! Every input pixel is mapped (via its corners) onto the output grid as a
//! quadrilateral; its weight into each output pixel is the area of overlap.
//! Output pixels are the overlap-weighted mean of the finite input pixels
//! touching them, and NaN where nothing finite lands.

use indicatif::ProgressBar;
use log::{debug, trace};
use ndarray::prelude::*;
use rayon::prelude::*;
use thiserror::Error;

use crate::{
    pool::{PlaneOp, PlanePool, PoolError},
    wcs::CelestialWcs,
};

/// Overlaps smaller than this (in output pixels) are round-off.
const MIN_OVERLAP: f64 = 1e-9;

#[derive(Error, Debug, PartialEq)]
pub enum RegridError {
    #[error("No input pixel overlaps the output grid")]
    NoOverlap,

    #[error("Expected an image of shape {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        got: (usize, usize),
    },
}

/// The precomputed overlap weights between an input and an output grid,
/// grouped by output pixel.
#[derive(Debug, Clone)]
pub struct RegridPlan {
    in_dim: (usize, usize),
    out_dim: (usize, usize),
    /// `offsets[o]..offsets[o + 1]` indexes `inputs` and `weights` for output
    /// pixel `o`.
    offsets: Vec<usize>,
    inputs: Vec<usize>,
    weights: Vec<f64>,
}

impl RegridPlan {
    /// `in_dim` and `out_dim` are (ny, nx).
    pub fn new(
        input: &CelestialWcs,
        in_dim: (usize, usize),
        output: &CelestialWcs,
        out_dim: (usize, usize),
    ) -> Result<RegridPlan, RegridError> {
        let (in_ny, in_nx) = in_dim;
        let (out_ny, out_nx) = out_dim;

        // The output-grid positions of every input pixel corner.
        let corners: Array2<Option<(f64, f64)>> =
            Array2::from_shape_fn((in_ny + 1, in_nx + 1), |(y, x)| {
                let (lon, lat) = input.pixel_to_world(x as f64 - 0.5, y as f64 - 0.5)?;
                output.world_to_pixel(lon, lat)
            });

        let mut triplets: Vec<(usize, usize, f64)> = (0..in_ny)
            .into_par_iter()
            .flat_map_iter(|iy| {
                let corners = &corners;
                (0..in_nx).flat_map(move |ix| {
                    let quad = [
                        corners[(iy, ix)],
                        corners[(iy, ix + 1)],
                        corners[(iy + 1, ix + 1)],
                        corners[(iy + 1, ix)],
                    ];
                    let in_idx = iy * in_nx + ix;
                    pixel_overlaps(quad, out_dim)
                        .into_iter()
                        .map(move |(out_idx, area)| (out_idx, in_idx, area))
                })
            })
            .collect();
        if triplets.is_empty() {
            return Err(RegridError::NoOverlap);
        }
        // Unique keys make the summation order repeatable.
        triplets.par_sort_unstable_by_key(|t| (t.0, t.1));
        trace!("{} overlap weights", triplets.len());

        let num_out = out_ny * out_nx;
        let mut offsets = Vec::with_capacity(num_out + 1);
        let mut inputs = Vec::with_capacity(triplets.len());
        let mut weights = Vec::with_capacity(triplets.len());
        offsets.push(0);
        let mut t = triplets.iter().peekable();
        for o in 0..num_out {
            while let Some(&&(out_idx, in_idx, w)) = t.peek() {
                if out_idx != o {
                    break;
                }
                inputs.push(in_idx);
                weights.push(w);
                t.next();
            }
            offsets.push(inputs.len());
        }

        Ok(RegridPlan {
            in_dim,
            out_dim,
            offsets,
            inputs,
            weights,
        })
    }

    pub fn apply(&self, plane: ArrayView2<f32>) -> Result<Array2<f32>, RegridError> {
        if plane.dim() != self.in_dim {
            return Err(RegridError::ShapeMismatch {
                expected: self.in_dim,
                got: plane.dim(),
            });
        }
        let plane = plane.as_standard_layout();
        // Standard layout was just ensured.
        let flat = plane.as_slice().unwrap_or(&[]);
        let mut out = Array2::from_elem(self.out_dim, f32::NAN);
        for (o, out_pixel) in out.iter_mut().enumerate() {
            let range = self.offsets[o]..self.offsets[o + 1];
            let mut num = 0.0;
            let mut den = 0.0;
            for (&i, &w) in self.inputs[range.clone()].iter().zip(&self.weights[range]) {
                let v = flat[i];
                if v.is_finite() {
                    num += w * v as f64;
                    den += w;
                }
            }
            if den > 0.0 {
                *out_pixel = (num / den) as f32;
            }
        }
        Ok(out)
    }
}

/// Regrid every channel of `data` (on `input`) onto `output`. Identical grids
/// are copied unchanged.
pub fn regrid_cube<P: PlanePool>(
    data: ArrayView3<f32>,
    input: &CelestialWcs,
    output: &CelestialWcs,
    out_dim: (usize, usize),
    pool: &P,
    progress: &ProgressBar,
) -> Result<Array3<f32>, PoolError> {
    let (num_chans, ny, nx) = data.dim();
    if input == output && (ny, nx) == out_dim {
        debug!("Grids are identical; not regridding");
        progress.inc(num_chans as u64);
        return Ok(data.to_owned());
    }

    let op = PlaneOp::Regrid {
        input: input.clone(),
        in_dim: (ny, nx),
        output: output.clone(),
        out_dim,
    };
    pool.map_planes(&op, data, progress)
}

/// The (output index, overlap area) of a mapped input pixel with every output
/// pixel it touches. Pixels with an unmappable corner contribute nothing.
fn pixel_overlaps(quad: [Option<(f64, f64)>; 4], out_dim: (usize, usize)) -> Vec<(usize, f64)> {
    let mut polygon = Vec::with_capacity(4);
    for corner in quad {
        match corner {
            Some(c) if c.0.is_finite() && c.1.is_finite() => polygon.push(c),
            _ => return vec![],
        }
    }
    let (out_ny, out_nx) = out_dim;
    let (min_x, max_x, min_y, max_y) = polygon.iter().fold(
        (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY),
        |(a, b, c, d), &(x, y)| (a.min(x), b.max(x), c.min(y), d.max(y)),
    );
    // Output pixel o covers [o - 0.5, o + 0.5].
    let lo = |v: f64| (v + 0.5).floor().max(0.0) as usize;
    let hi = |v: f64, n: usize| ((v + 0.5).floor().min(n as f64 - 1.0)).max(-1.0) as i64;
    let (x0, x1) = (lo(min_x), hi(max_x, out_nx));
    let (y0, y1) = (lo(min_y), hi(max_y, out_ny));
    if x1 < 0 || y1 < 0 {
        return vec![];
    }

    let mut overlaps = vec![];
    for oy in y0..=y1 as usize {
        for ox in x0..=x1 as usize {
            let (cx, cy) = (ox as f64, oy as f64);
            let clipped = clip_to_box(&polygon, cx - 0.5, cx + 0.5, cy - 0.5, cy + 0.5);
            let area = polygon_area(&clipped);
            if area > MIN_OVERLAP {
                overlaps.push((oy * out_nx + ox, area));
            }
        }
    }
    overlaps
}

/// One side of an axis-aligned clipping box.
#[derive(Debug, Clone, Copy)]
enum Edge {
    Left(f64),
    Right(f64),
    Bottom(f64),
    Top(f64),
}

impl Edge {
    fn inside(self, p: (f64, f64)) -> bool {
        match self {
            Edge::Left(x) => p.0 >= x,
            Edge::Right(x) => p.0 <= x,
            Edge::Bottom(y) => p.1 >= y,
            Edge::Top(y) => p.1 <= y,
        }
    }

    /// Where the segment a-b crosses this edge.
    fn intersect(self, a: (f64, f64), b: (f64, f64)) -> (f64, f64) {
        match self {
            Edge::Left(x) | Edge::Right(x) => {
                let t = (x - a.0) / (b.0 - a.0);
                (x, a.1 + t * (b.1 - a.1))
            }
            Edge::Bottom(y) | Edge::Top(y) => {
                let t = (y - a.1) / (b.1 - a.1);
                (a.0 + t * (b.0 - a.0), y)
            }
        }
    }
}

/// Sutherland-Hodgman clipping of a convex polygon to an axis-aligned box.
fn clip_to_box(
    polygon: &[(f64, f64)],
    x_min: f64,
    x_max: f64,
    y_min: f64,
    y_max: f64,
) -> Vec<(f64, f64)> {
    let mut out = polygon.to_vec();
    for edge in [
        Edge::Left(x_min),
        Edge::Right(x_max),
        Edge::Bottom(y_min),
        Edge::Top(y_max),
    ] {
        let input = std::mem::take(&mut out);
        let mut prev = match input.last() {
            Some(&p) => p,
            None => break,
        };
        for &cur in &input {
            match (edge.inside(prev), edge.inside(cur)) {
                (true, true) => out.push(cur),
                (true, false) => out.push(edge.intersect(prev, cur)),
                (false, true) => {
                    out.push(edge.intersect(prev, cur));
                    out.push(cur);
                }
                (false, false) => (),
            }
            prev = cur;
        }
    }
    out
}

/// Shoelace formula.
fn polygon_area(polygon: &[(f64, f64)]) -> f64 {
    if polygon.len() < 3 {
        return 0.0;
    }
    let mut twice_area = 0.0;
    for (i, &(x1, y1)) in polygon.iter().enumerate() {
        let (x2, y2) = polygon[(i + 1) % polygon.len()];
        twice_area += x1 * y2 - x2 * y1;
    }
    0.5 * twice_area.abs()
}
