//! Debugging plots of spectra through the brightest pixel.

use std::{ops::Range, path::Path};

use log::{info, warn};
use ndarray::prelude::*;
use plotters::prelude::*;
use thiserror::Error;

use crate::{bigcube::BigCube, Stokes};

const X_PIXELS: u32 = 1200;
const Y_PIXELS: u32 = 800;
const SPEED_OF_LIGHT: f64 = 299792458.0;

#[derive(Error, Debug)]
pub enum PlotError {
    #[error("Error from the plotters library: {0}")]
    Draw(String),
}

/// The pixel with the largest channel sum, ignoring non-finite values.
pub fn peak_pixel(cube: ArrayView3<f32>) -> Option<(usize, usize)> {
    let moment = cube.fold_axis(Axis(0), 0.0_f64, |acc, &v| {
        if v.is_finite() {
            acc + v as f64
        } else {
            *acc
        }
    });
    moment
        .indexed_iter()
        .filter(|(_, v)| v.is_finite())
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(idx, _)| idx)
}

struct Spectrum {
    stokes: Stokes,
    freqs: Vec<f64>,
    values: Vec<f64>,
    /// Each band's number and its channels.
    bands: Vec<(u32, Range<usize>)>,
}

/// Spectra through the Stokes I peak, collected while cubes are made.
#[derive(Default)]
pub struct DebugSpectra {
    peak: Option<(usize, usize)>,
    spectra: Vec<Spectrum>,
}

impl DebugSpectra {
    /// Record the spectrum of `cube` at the peak pixel. The peak is found
    /// from the first cube added, which should be Stokes I.
    pub fn add(&mut self, cube: &BigCube, bands: &[(u32, usize)]) {
        if self.peak.is_none() {
            self.peak = peak_pixel(cube.data.view());
            if let Some((y, x)) = self.peak {
                info!("Debugging spectra are taken at pixel ({x}, {y})");
            }
        }
        let (y, x) = match self.peak {
            Some(p) => p,
            None => {
                warn!("Stokes {} has no finite pixels to plot", cube.stokes);
                return;
            }
        };

        let mut start = 0;
        let bands = bands
            .iter()
            .map(|&(band, num_chans)| {
                let range = start..start + num_chans;
                start += num_chans;
                (band, range)
            })
            .collect();
        self.spectra.push(Spectrum {
            stokes: cube.stokes,
            freqs: cube.freqs.to_vec(),
            values: cube.data.slice(s![.., y, x]).iter().map(|&v| v as f64).collect(),
            bands,
        });
    }

    /// Write all the plots into `outdir`.
    pub fn plot(&self, outdir: &Path, field: &str) -> Result<(), PlotError> {
        for spectrum in &self.spectra {
            let series = spectrum
                .bands
                .iter()
                .map(|(band, range)| {
                    let points = range
                        .clone()
                        .filter(|&i| spectrum.values[i] > 0.0)
                        .map(|i| (spectrum.freqs[i].log10(), spectrum.values[i].log10()))
                        .collect();
                    (format!("Stokes {} band {band}", spectrum.stokes), points)
                })
                .collect::<Vec<_>>();
            scatter(
                &outdir.join(format!("{field}.{}.bands.png", spectrum.stokes.as_str())),
                &format!("{field} Stokes {} per band", spectrum.stokes),
                "log10 Frequency [Hz]",
                "log10 Flux density [Jy/beam]",
                &series,
            )?;
        }

        let series = self
            .spectra
            .iter()
            .map(|s| {
                let points = s.freqs.iter().map(|f| f / 1e9).zip(s.values.iter().copied());
                (format!("Stokes {}", s.stokes), points.collect())
            })
            .collect::<Vec<_>>();
        scatter(
            &outdir.join(format!("{field}.spectra.png")),
            field,
            "Frequency [GHz]",
            "Flux density [Jy/beam]",
            &series,
        )?;

        let series = self
            .spectra
            .iter()
            .map(|s| {
                let points = s
                    .freqs
                    .iter()
                    .map(|f| (SPEED_OF_LIGHT / f).powi(2))
                    .zip(s.values.iter().copied());
                (format!("Stokes {}", s.stokes), points.collect())
            })
            .collect::<Vec<_>>();
        scatter(
            &outdir.join(format!("{field}.lambda2.png")),
            field,
            "Wavelength squared [m^2]",
            "Flux density [Jy/beam]",
            &series,
        )
    }
}

fn range_of(values: impl Iterator<Item = f64>) -> Range<f64> {
    let (min, max) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    if !min.is_finite() {
        return 0.0..1.0;
    }
    let pad = if max > min { (max - min) * 0.05 } else { 0.5 };
    min - pad..max + pad
}

fn scatter(
    file: &Path,
    caption: &str,
    x_desc: &str,
    y_desc: &str,
    series: &[(String, Vec<(f64, f64)>)],
) -> Result<(), PlotError> {
    info!("Plotting {}", file.display());
    let x_range = range_of(series.iter().flat_map(|(_, p)| p.iter().map(|p| p.0)));
    let y_range = range_of(series.iter().flat_map(|(_, p)| p.iter().map(|p| p.1)));

    let root = BitMapBackend::new(file, (X_PIXELS, Y_PIXELS)).into_drawing_area();
    root.fill(&WHITE)
        .map_err(|e| PlotError::Draw(e.to_string()))?;
    let mut cc = ChartBuilder::on(&root)
        .caption(caption, ("sans-serif", 30))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(x_range, y_range)
        .map_err(|e| PlotError::Draw(e.to_string()))?;
    cc.configure_mesh()
        .x_desc(x_desc)
        .y_desc(y_desc)
        .draw()
        .map_err(|e| PlotError::Draw(e.to_string()))?;

    for (i, (label, points)) in series.iter().enumerate() {
        let colour = Palette99::pick(i).to_rgba();
        cc.draw_series(PointSeries::of_element(
            points.iter().copied().filter(|(x, y)| x.is_finite() && y.is_finite()),
            3,
            colour.filled(),
            &|coord, size, style| EmptyElement::at(coord) + Circle::new((0, 0), size, style),
        ))
        .map_err(|e| PlotError::Draw(e.to_string()))?
        .label(label)
        .legend(move |(x, y)| Circle::new((x, y), 3, colour.filled()));
    }
    cc.configure_series_labels()
        .background_style(&WHITE)
        .border_style(&BLACK)
        .draw()
        .map_err(|e| PlotError::Draw(e.to_string()))?;
    root.present()
        .map_err(|e| PlotError::Draw(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_peak_ignores_nans() {
        let mut cube = Array3::zeros((3, 4, 5));
        cube[(0, 1, 2)] = 2.0_f32;
        cube[(1, 1, 2)] = 2.0;
        cube[(2, 3, 4)] = 3.0;
        cube[(0, 0, 0)] = f32::NAN;
        assert_eq!(peak_pixel(cube.view()), Some((1, 2)));
        assert_eq!(peak_pixel(Array3::<f32>::zeros((1, 0, 0)).view()), None);
    }

    #[test]
    fn ranges_are_padded() {
        let r = range_of([1.0, 3.0, f64::NAN].into_iter());
        assert!(r.start < 1.0 && r.end > 3.0);
        let r = range_of([2.0].into_iter());
        assert_eq!(r, 1.5..2.5);
        assert_eq!(range_of(std::iter::empty()), 0.0..1.0);
    }
}
