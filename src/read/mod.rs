//! Discovery and reading of a field's per-band cubes and frequency tables.
//!
//! A band `B` of field `F` consists of `F.B.bandcube.frequencies.txt` (one
//! frequency \[Hz\] per line) and `F.B.<s>.cutout.bandcube.fits` for each
//! Stokes parameter `s` in i, q, u, v.

pub mod fits;

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use glob::glob;
use lazy_static::lazy_static;
use log::{debug, trace, warn};
use ndarray::prelude::*;
use regex::Regex;
use thiserror::Error;
use vec1::Vec1;

use crate::{
    beam::{Beam, BeamError},
    wcs::{CelestialWcs, SpectralAxis, WcsError},
    Stokes,
};
use fits::*;

lazy_static! {
    static ref FREQ_TABLE: Regex =
        Regex::new(r"^(?P<field>.+)\.(?P<band>\d+)\.bandcube\.frequencies\.txt$").unwrap();
}

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("No bands for field '{field}' were found in {}", .dir.display())]
    NoBands { field: String, dir: PathBuf },

    #[error("Band {band} has a frequency table but no Stokes {stokes} cube (expected {})", .expected.display())]
    MissingCube {
        band: u32,
        stokes: Stokes,
        expected: PathBuf,
    },

    #[error("Band {0} isn't part of this field")]
    UnknownBand(u32),

    #[error("{}: {source}", .file.display())]
    Fits {
        file: PathBuf,
        #[source]
        source: FitsError,
    },

    #[error("{}: {source}", .file.display())]
    Wcs {
        file: PathBuf,
        #[source]
        source: WcsError,
    },

    #[error("{}: {source}", .file.display())]
    Beam {
        file: PathBuf,
        #[source]
        source: BeamError,
    },

    #[error("{}: expected a 3D cube (or 4D with a single Stokes plane), got shape {shape:?}", .file.display())]
    BadShape { file: PathBuf, shape: Vec<usize> },

    #[error("{} line {line}: couldn't parse '{text}' as a frequency", .file.display())]
    BadFrequency {
        file: PathBuf,
        line: usize,
        text: String,
    },

    #[error("{}: the frequency table is empty", .file.display())]
    EmptyFrequencies { file: PathBuf },

    #[error("Bad glob pattern: {0}")]
    Glob(#[from] glob::PatternError),

    #[error("Couldn't read a globbed path: {0}")]
    GlobRead(#[from] glob::GlobError),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

/// The files of one band.
#[derive(Debug, Clone, PartialEq)]
pub struct BandFiles {
    pub band: u32,
    pub frequencies: PathBuf,
    /// Indexed by [`Stokes::index`].
    pub cubes: [PathBuf; 4],
}

impl BandFiles {
    pub fn cube(&self, stokes: Stokes) -> &Path {
        &self.cubes[stokes.index()]
    }
}

/// One band's cube for one Stokes parameter.
#[derive(Debug, Clone)]
pub struct BandCube {
    pub band: u32,
    pub stokes: Stokes,
    /// Indexed \[channel\]\[y\]\[x\].
    pub data: Array3<f32>,
    pub wcs: CelestialWcs,
    pub spectral: Option<SpectralAxis>,
    pub beam: Beam,
    pub header: FitsHeader,
}

/// Something that can supply the bands of a field.
pub trait BandRead: Sync + Send {
    /// The available band identifiers, in no particular order.
    fn bands(&self) -> Vec<u32>;

    fn frequencies(&self, band: u32) -> Result<Vec1<f64>, ReadError>;

    /// Read only the beam of a cube.
    fn read_beam(&self, band: u32, stokes: Stokes) -> Result<Beam, ReadError>;

    /// Read a whole cube.
    fn read_cube(&self, band: u32, stokes: Stokes) -> Result<BandCube, ReadError>;
}

/// Reads bands from FITS files on disk.
pub struct FitsBandReader {
    pub field: String,
    pub files: Vec1<BandFiles>,
}

impl FitsBandReader {
    /// Find every band of `field` in `datadir`. A frequency table without all
    /// four Stokes cubes is an error.
    pub fn discover(datadir: &Path, field: &str) -> Result<FitsBandReader, ReadError> {
        let pattern = format!(
            "{}/{}.*.bandcube.frequencies.txt",
            glob::Pattern::escape(&datadir.to_string_lossy()),
            glob::Pattern::escape(field)
        );
        trace!("Globbing for frequency tables with {pattern}");

        let mut files = vec![];
        for entry in glob(&pattern)? {
            let freq_file = entry?;
            let file_name = match freq_file.file_name().and_then(|f| f.to_str()) {
                Some(f) => f,
                None => continue,
            };
            let band: u32 = match FREQ_TABLE.captures(file_name) {
                Some(caps) if &caps["field"] == field => match caps["band"].parse() {
                    Ok(b) => b,
                    Err(_) => continue,
                },
                _ => {
                    debug!("Ignoring {}", freq_file.display());
                    continue;
                }
            };

            let cube_path = |stokes: Stokes| {
                datadir.join(format!("{field}.{band}.{stokes}.cutout.bandcube.fits"))
            };
            let cubes = [
                cube_path(Stokes::I),
                cube_path(Stokes::Q),
                cube_path(Stokes::U),
                cube_path(Stokes::V),
            ];
            for stokes in Stokes::ALL {
                let expected = &cubes[stokes.index()];
                if !expected.exists() {
                    return Err(ReadError::MissingCube {
                        band,
                        stokes,
                        expected: expected.clone(),
                    });
                }
            }
            debug!("Found band {band}");
            files.push(BandFiles {
                band,
                frequencies: freq_file,
                cubes,
            });
        }
        files.sort_unstable_by_key(|f| f.band);

        let files = Vec1::try_from_vec(files).map_err(|_| ReadError::NoBands {
            field: field.to_string(),
            dir: datadir.to_path_buf(),
        })?;
        Ok(FitsBandReader {
            field: field.to_string(),
            files,
        })
    }

    fn band_files(&self, band: u32) -> Result<&BandFiles, ReadError> {
        self.files
            .iter()
            .find(|f| f.band == band)
            .ok_or(ReadError::UnknownBand(band))
    }
}

impl BandRead for FitsBandReader {
    fn bands(&self) -> Vec<u32> {
        self.files.iter().map(|f| f.band).collect()
    }

    fn frequencies(&self, band: u32) -> Result<Vec1<f64>, ReadError> {
        read_frequencies(&self.band_files(band)?.frequencies)
    }

    fn read_beam(&self, band: u32, stokes: Stokes) -> Result<Beam, ReadError> {
        read_beam(self.band_files(band)?.cube(stokes))
    }

    fn read_cube(&self, band: u32, stokes: Stokes) -> Result<BandCube, ReadError> {
        read_band_cube(self.band_files(band)?.cube(stokes), band, stokes)
    }
}

/// Read a frequency table: one value \[Hz\] per line. Blank lines and lines
/// starting with '#' are skipped.
pub fn read_frequencies(file: &Path) -> Result<Vec1<f64>, ReadError> {
    let reader = BufReader::new(File::open(file)?);
    let mut freqs = vec![];
    for (i_line, line) in reader.lines().enumerate() {
        let line = line?;
        let text = line.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }
        let freq: f64 = text.parse().map_err(|_| ReadError::BadFrequency {
            file: file.to_path_buf(),
            line: i_line + 1,
            text: text.to_string(),
        })?;
        freqs.push(freq);
    }
    Vec1::try_from_vec(freqs).map_err(|_| ReadError::EmptyFrequencies {
        file: file.to_path_buf(),
    })
}

fn read_header(file: &Path) -> Result<(fitsio::FitsFile, fitsio::hdu::FitsHdu, FitsHeader), FitsError> {
    let mut fptr = fits_open(file)?;
    let hdu = fits_open_hdu(&mut fptr, 0)?;
    let header = fits_read_header(&mut fptr, &hdu)?;
    Ok((fptr, hdu, header))
}

/// Read the beam from a cube's primary header.
pub fn read_beam(file: &Path) -> Result<Beam, ReadError> {
    let (_, _, header) = read_header(file).map_err(|source| ReadError::Fits {
        file: file.to_path_buf(),
        source,
    })?;
    Beam::from_header(&header).map_err(|source| ReadError::Beam {
        file: file.to_path_buf(),
        source,
    })
}

/// Read a cube's data, coordinates and beam.
pub fn read_band_cube(file: &Path, band: u32, stokes: Stokes) -> Result<BandCube, ReadError> {
    let fits_err = |source| ReadError::Fits {
        file: file.to_path_buf(),
        source,
    };
    let (mut fptr, hdu, header) = read_header(file).map_err(fits_err)?;
    let shape = fits_get_image_size(&hdu).map_err(fits_err)?.clone();
    let dim = cube_dim(&shape).ok_or_else(|| ReadError::BadShape {
        file: file.to_path_buf(),
        shape: shape.clone(),
    })?;
    let flat: Vec<f32> = fits_get_image(&mut fptr, &hdu).map_err(fits_err)?;
    let data = Array3::from_shape_vec(dim, flat).map_err(|_| ReadError::BadShape {
        file: file.to_path_buf(),
        shape,
    })?;

    let wcs = CelestialWcs::from_header(&header).map_err(|source| ReadError::Wcs {
        file: file.to_path_buf(),
        source,
    })?;
    let spectral = SpectralAxis::from_header(&header).map_err(|source| ReadError::Wcs {
        file: file.to_path_buf(),
        source,
    })?;
    let beam = Beam::from_header(&header).map_err(|source| ReadError::Beam {
        file: file.to_path_buf(),
        source,
    })?;
    if stokes_axis_mismatch(&header, stokes) {
        warn!(
            "{}: the STOKES axis doesn't look like Stokes {stokes}",
            file.display()
        );
    }
    debug!(
        "Read {} with shape {:?} and beam {beam}",
        file.display(),
        data.dim()
    );

    Ok(BandCube {
        band,
        stokes,
        data,
        wcs,
        spectral,
        beam,
        header,
    })
}

/// Collapse a C-ordered FITS image shape into (channels, y, x). Leading
/// length-1 axes (e.g. a single Stokes plane) are dropped.
fn cube_dim(shape: &[usize]) -> Option<(usize, usize, usize)> {
    let first_real = shape
        .iter()
        .position(|&n| n != 1)
        .unwrap_or(shape.len())
        .min(shape.len().saturating_sub(3));
    match &shape[first_real..] {
        [nchan, ny, nx] => Some((*nchan, *ny, *nx)),
        _ => None,
    }
}

/// FITS Stokes axis values are 1..=4 for I, Q, U, V.
fn stokes_axis_mismatch(header: &FitsHeader, stokes: Stokes) -> bool {
    if header.get_str("CTYPE4") != Some("STOKES") {
        return false;
    }
    match header.get::<f64>("CRVAL4") {
        Ok(Some(v)) => (v.round() as i64) != stokes.index() as i64 + 1,
        _ => false,
    }
}
