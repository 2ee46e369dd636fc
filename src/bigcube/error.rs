use thiserror::Error;

use crate::{
    beam::{Beam, BeamError, CommonBeamError},
    pool::PoolError,
    read::ReadError,
    write::WriteError,
    Stokes,
};

#[derive(Error, Debug)]
pub enum BigCubeError {
    #[error("Band {band} (Stokes {stokes}) has beam {native}, which is wider than the common beam {target} in some direction")]
    BeamTooLarge {
        band: u32,
        stokes: Stokes,
        native: Beam,
        target: Beam,
    },

    #[error("Band {band} (Stokes {stokes}) has {num_chans} channels but {num_freqs} frequencies")]
    ChannelMismatch {
        band: u32,
        stokes: Stokes,
        num_chans: usize,
        num_freqs: usize,
    },

    #[error("There are no bands to combine")]
    NoBands,

    #[error("Band {band}'s frequencies aren't strictly increasing")]
    UnsortedFrequencies { band: u32 },

    #[error("Band {lower} ends at {lower_end} Hz, but band {upper} starts at {upper_start} Hz; bands can't overlap")]
    OverlappingBands {
        lower: u32,
        upper: u32,
        lower_end: f64,
        upper_start: f64,
    },

    #[error("Couldn't stack the bands: {0}")]
    Stack(#[from] ndarray::ShapeError),

    #[error("Couldn't create the output directory: {0}")]
    OutputDir(std::io::Error),

    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Beam(#[from] BeamError),

    #[error(transparent)]
    CommonBeam(#[from] CommonBeamError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[cfg(feature = "plotting")]
    #[error(transparent)]
    Plot(#[from] crate::plot::PlotError),
}
