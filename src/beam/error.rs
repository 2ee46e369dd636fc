use thiserror::Error;

use super::Beam;
use crate::read::fits::HeaderError;

#[derive(Error, Debug, PartialEq)]
pub enum BeamError {
    #[error("Beam parameters must be finite (got {major}\" x {minor}\" @ {pa} deg)")]
    NonFinite { major: f64, minor: f64, pa: f64 },

    #[error("Beam axes must be non-negative (got {major}\" x {minor}\")")]
    Negative { major: f64, minor: f64 },

    #[error("Beam major axis ({major}\") is smaller than its minor axis ({minor}\")")]
    MajorSmallerThanMinor { major: f64, minor: f64 },

    #[error("Beam {target} cannot be deconvolved by {native}; the target is narrower in some direction")]
    NotDeconvolvable { target: Beam, native: Beam },

    #[error("Couldn't read the beam from the header: {0}")]
    Header(#[from] HeaderError),
}
