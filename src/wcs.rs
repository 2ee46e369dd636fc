//! A minimal celestial world coordinate system: enough to regrid one band's
//! cube onto another's grid.
//!
//! Only zenithal projections (TAN and SIN) are handled, with the reference
//! point at the native pole. Axis 1 must be longitude-like and axis 2
//! latitude-like; a spectral axis 3 is carried through untouched.
//!
//! Pixel coordinates used here are 0-indexed array positions; FITS's CRPIX is
//! 1-indexed.

use std::f64::consts::FRAC_PI_2;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::read::fits::{FitsHeader, HeaderError};

#[derive(Error, Debug, PartialEq)]
pub enum WcsError {
    #[error(transparent)]
    Header(#[from] HeaderError),

    #[error("Axis {axis} has CTYPE '{ctype}'; expected a celestial axis")]
    NotCelestial { axis: u8, ctype: String },

    #[error("Unsupported projection '{0}'; only TAN and SIN are handled")]
    UnsupportedProjection(String),

    #[error("The pixel-to-world matrix is singular")]
    Singular,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Projection {
    Tan,
    Sin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CelestialWcs {
    pub ctype: [String; 2],
    pub projection: Projection,
    /// Reference world coordinates \[degrees\]
    pub crval: [f64; 2],
    /// Reference pixel (1-indexed)
    pub crpix: [f64; 2],
    /// \[degrees per pixel\]
    pub cdelt: [f64; 2],
    pub pc: [[f64; 2]; 2],
    /// Native longitude of the celestial pole \[degrees\]
    pub lonpole: f64,
}

/// A linear third (spectral) axis.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralAxis {
    pub ctype: String,
    pub crval: f64,
    pub cdelt: f64,
    pub crpix: f64,
    pub cunit: Option<String>,
}

impl SpectralAxis {
    pub fn from_header(header: &FitsHeader) -> Result<Option<SpectralAxis>, WcsError> {
        let ctype: Option<String> = header.get("CTYPE3")?;
        let ctype = match ctype {
            Some(c) => c,
            None => return Ok(None),
        };
        Ok(Some(SpectralAxis {
            ctype,
            crval: header.get("CRVAL3")?.unwrap_or(0.0),
            cdelt: header.get("CDELT3")?.unwrap_or(1.0),
            crpix: header.get("CRPIX3")?.unwrap_or(1.0),
            cunit: header.get("CUNIT3")?,
        }))
    }
}

impl CelestialWcs {
    pub fn from_header(header: &FitsHeader) -> Result<CelestialWcs, WcsError> {
        let ctype1: String = header.require("CTYPE1")?;
        let ctype2: String = header.require("CTYPE2")?;
        if !(ctype1.starts_with("RA") || ctype1.starts_with("GLON")) {
            return Err(WcsError::NotCelestial {
                axis: 1,
                ctype: ctype1,
            });
        }
        if !(ctype2.starts_with("DEC") || ctype2.starts_with("GLAT")) {
            return Err(WcsError::NotCelestial {
                axis: 2,
                ctype: ctype2,
            });
        }
        let code = ctype1.get(5..).unwrap_or("").trim();
        let projection = match code {
            "TAN" => Projection::Tan,
            "SIN" => Projection::Sin,
            _ => return Err(WcsError::UnsupportedProjection(code.to_string())),
        };

        let crval = [header.require("CRVAL1")?, header.require("CRVAL2")?];
        let crpix = [header.require("CRPIX1")?, header.require("CRPIX2")?];

        let (cdelt, pc) = if header.contains("CD1_1") || header.contains("CD2_2") {
            let cd = [
                [
                    header.get("CD1_1")?.unwrap_or(0.0),
                    header.get("CD1_2")?.unwrap_or(0.0),
                ],
                [
                    header.get("CD2_1")?.unwrap_or(0.0),
                    header.get("CD2_2")?.unwrap_or(0.0),
                ],
            ];
            ([1.0, 1.0], cd)
        } else {
            let cdelt: [f64; 2] = [header.require("CDELT1")?, header.require("CDELT2")?];
            let pc = if header.contains("PC1_1") || header.contains("PC2_2") {
                [
                    [
                        header.get("PC1_1")?.unwrap_or(1.0),
                        header.get("PC1_2")?.unwrap_or(0.0),
                    ],
                    [
                        header.get("PC2_1")?.unwrap_or(0.0),
                        header.get("PC2_2")?.unwrap_or(1.0),
                    ],
                ]
            } else {
                let crota: f64 = header.get("CROTA2")?.unwrap_or(0.0);
                let (s, c) = crota.to_radians().sin_cos();
                [
                    [c, -s * cdelt[1] / cdelt[0]],
                    [s * cdelt[0] / cdelt[1], c],
                ]
            };
            (cdelt, pc)
        };

        let lonpole = header
            .get("LONPOLE")?
            .unwrap_or(if crval[1] < 90.0 { 180.0 } else { 0.0 });

        let wcs = CelestialWcs {
            ctype: [ctype1, ctype2],
            projection,
            crval,
            crpix,
            cdelt,
            pc,
            lonpole,
        };
        wcs.inverse_matrix().ok_or(WcsError::Singular)?;
        Ok(wcs)
    }

    /// The matrix taking pixel offsets to intermediate world coordinates
    /// \[degrees\].
    fn matrix(&self) -> [[f64; 2]; 2] {
        [
            [self.cdelt[0] * self.pc[0][0], self.cdelt[0] * self.pc[0][1]],
            [self.cdelt[1] * self.pc[1][0], self.cdelt[1] * self.pc[1][1]],
        ]
    }

    fn inverse_matrix(&self) -> Option<[[f64; 2]; 2]> {
        let m = self.matrix();
        let det = m[0][0] * m[1][1] - m[0][1] * m[1][0];
        if det.abs() < 1e-30 || !det.is_finite() {
            return None;
        }
        Some([
            [m[1][1] / det, -m[0][1] / det],
            [-m[1][0] / det, m[0][0] / det],
        ])
    }

    /// The size of a pixel along each axis \[arcsec\].
    pub fn pixel_scales(&self) -> (f64, f64) {
        let m = self.matrix();
        (
            m[0][0].hypot(m[1][0]) * 3600.0,
            m[0][1].hypot(m[1][1]) * 3600.0,
        )
    }

    /// Convert a 0-indexed pixel position to (longitude, latitude) \[degrees\].
    /// `None` if the position is outside the projection's domain.
    pub fn pixel_to_world(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let m = self.matrix();
        let dx = x + 1.0 - self.crpix[0];
        let dy = y + 1.0 - self.crpix[1];
        let xi = (m[0][0] * dx + m[0][1] * dy).to_radians();
        let eta = (m[1][0] * dx + m[1][1] * dy).to_radians();

        let r = xi.hypot(eta);
        let phi = xi.atan2(-eta);
        let theta = match self.projection {
            Projection::Tan => 1.0_f64.atan2(r),
            Projection::Sin => {
                if r > 1.0 {
                    return None;
                }
                r.acos()
            }
        };

        let (sin_d0, cos_d0) = self.crval[1].to_radians().sin_cos();
        let (sin_t, cos_t) = theta.sin_cos();
        let dphi = phi - self.lonpole.to_radians();
        let (sin_dphi, cos_dphi) = dphi.sin_cos();
        let lon = self.crval[0].to_radians()
            + (-cos_t * sin_dphi).atan2(sin_t * cos_d0 - cos_t * sin_d0 * cos_dphi);
        let lat = (sin_t * sin_d0 + cos_t * cos_d0 * cos_dphi)
            .clamp(-1.0, 1.0)
            .asin();
        Some((lon.to_degrees().rem_euclid(360.0), lat.to_degrees()))
    }

    /// Convert (longitude, latitude) \[degrees\] to a 0-indexed pixel
    /// position. `None` if the coordinate can't be projected.
    pub fn world_to_pixel(&self, lon: f64, lat: f64) -> Option<(f64, f64)> {
        let (sin_d0, cos_d0) = self.crval[1].to_radians().sin_cos();
        let (sin_d, cos_d) = lat.to_radians().sin_cos();
        let dlon = (lon - self.crval[0]).to_radians();
        let (sin_dl, cos_dl) = dlon.sin_cos();
        let phi = self.lonpole.to_radians()
            + (-cos_d * sin_dl).atan2(sin_d * cos_d0 - cos_d * sin_d0 * cos_dl);
        let theta = (sin_d * sin_d0 + cos_d * cos_d0 * cos_dl)
            .clamp(-1.0, 1.0)
            .asin();

        let r = match self.projection {
            Projection::Tan => {
                if theta <= 0.0 {
                    return None;
                }
                (FRAC_PI_2 - theta).tan()
            }
            Projection::Sin => {
                if theta < 0.0 {
                    return None;
                }
                theta.cos()
            }
        };
        let xi = (r * phi.sin()).to_degrees();
        let eta = (-r * phi.cos()).to_degrees();

        let inv = self.inverse_matrix()?;
        let dx = inv[0][0] * xi + inv[0][1] * eta;
        let dy = inv[1][0] * xi + inv[1][1] * eta;
        Some((dx + self.crpix[0] - 1.0, dy + self.crpix[1] - 1.0))
    }
}
