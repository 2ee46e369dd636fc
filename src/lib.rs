//! Calibration driver and common-resolution "big cube" maker for QUOCKA
//! (the QU Observations at Cm wavelengths with Km baselines using ATCA) data.
//!
//! The big-cube stage reads per-band FITS cubes for one field, finds a common
//! beam, regrids every band onto the lowest band's grid, convolves each band up
//! to the common resolution and writes one broadband cube per Stokes parameter.
//! The calibration stage sequences external Miriad tasks; see [`cal`].

pub mod beam;
pub mod bigcube;
pub mod cal;
pub mod convolve;
pub mod logging;
#[cfg(feature = "plotting")]
pub mod plot;
pub mod pool;
pub mod read;
pub mod regrid;
pub mod wcs;
pub mod write;

use std::{fmt::Display, str::FromStr};

use thiserror::Error;

/// The Stokes parameters of the per-band cubes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stokes {
    I,
    Q,
    U,
    V,
}

impl Stokes {
    /// All Stokes parameters, in the order they are processed. Stokes I comes
    /// first; the frequency list and debugging plots are derived from it.
    pub const ALL: [Stokes; 4] = [Stokes::I, Stokes::Q, Stokes::U, Stokes::V];

    /// The lower-case label used in file names.
    pub fn as_str(self) -> &'static str {
        match self {
            Stokes::I => "i",
            Stokes::Q => "q",
            Stokes::U => "u",
            Stokes::V => "v",
        }
    }

    /// The index of this Stokes parameter into [`Stokes::ALL`].
    pub fn index(self) -> usize {
        match self {
            Stokes::I => 0,
            Stokes::Q => 1,
            Stokes::U => 2,
            Stokes::V => 3,
        }
    }
}

impl Display for Stokes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("'{0}' is not a Stokes parameter (expected one of i, q, u, v)")]
pub struct ParseStokesError(String);

impl FromStr for Stokes {
    type Err = ParseStokesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "i" | "I" => Ok(Stokes::I),
            "q" | "Q" => Ok(Stokes::Q),
            "u" | "U" => Ok(Stokes::U),
            "v" | "V" => Ok(Stokes::V),
            _ => Err(ParseStokesError(s.to_string())),
        }
    }
}
