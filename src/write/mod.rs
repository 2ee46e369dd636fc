//! Writing big cubes and their frequency lists.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use fitsio::{
    images::{ImageDescription, ImageType},
    FitsFile,
};
use log::{debug, trace};
use thiserror::Error;
use vec1::Vec1;

use crate::{
    bigcube::BigCube,
    read::fits::{fits_write_history, FitsError},
    Stokes,
};

/// Cards copied from the reference band's header when present.
const CARRIED_KEYS: &[&str] = &[
    "OBJECT", "BUNIT", "BTYPE", "TELESCOP", "INSTRUME", "OBSERVER", "DATE-OBS", "RADESYS",
    "EQUINOX", "EPOCH", "SPECSYS", "RESTFREQ", "OBSRA", "OBSDEC",
];

#[derive(Error, Debug)]
pub enum WriteError {
    #[error(transparent)]
    Fits(#[from] FitsError),

    #[error(transparent)]
    Fitsio(#[from] fitsio::errors::Error),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

/// `{field}.{stokes}.cutout.bigcube.fits`
pub fn big_cube_filename(field: &str, stokes: Stokes) -> String {
    format!("{field}.{stokes}.cutout.bigcube.fits", stokes = stokes.as_str())
}

/// `{field}.bigcube.frequencies.txt`
pub fn frequencies_filename(field: &str) -> String {
    format!("{field}.bigcube.frequencies.txt")
}

/// Write a big cube as the primary image of a new FITS file, replacing any
/// existing file.
pub fn write_big_cube(cube: &BigCube, file: &Path, history: Option<&str>) -> Result<(), WriteError> {
    if file.exists() {
        debug!("Removing existing {}", file.display());
        std::fs::remove_file(file)?;
    }

    let (num_chans, ny, nx) = cube.data.dim();
    let image_description = ImageDescription {
        data_type: ImageType::Float,
        dimensions: &[num_chans, ny, nx],
    };
    let mut fptr = FitsFile::create(file)
        .with_custom_primary(&image_description)
        .open()?;
    let hdu = fptr.primary_hdu()?;
    let data = cube.data.as_standard_layout();
    hdu.write_image(
        &mut fptr,
        data.as_slice().expect("standard layout is contiguous"),
    )?;

    for key in CARRIED_KEYS {
        if let Some(card) = cube.header.card(key) {
            trace!("Carrying over {key} = {}", card.value);
            if card.quoted {
                hdu.write_key(&mut fptr, key, card.value.as_str())?;
            } else if let Ok(v) = card.value.parse::<i64>() {
                hdu.write_key(&mut fptr, key, v)?;
            } else if let Ok(v) = card.value.parse::<f64>() {
                hdu.write_key(&mut fptr, key, v)?;
            }
        }
    }

    let wcs = &cube.wcs;
    for (i, axis) in ["1", "2"].iter().enumerate() {
        hdu.write_key(&mut fptr, &format!("CTYPE{axis}"), wcs.ctype[i].as_str())?;
        hdu.write_key(&mut fptr, &format!("CRVAL{axis}"), wcs.crval[i])?;
        hdu.write_key(&mut fptr, &format!("CDELT{axis}"), wcs.cdelt[i])?;
        hdu.write_key(&mut fptr, &format!("CRPIX{axis}"), wcs.crpix[i])?;
        hdu.write_key(&mut fptr, &format!("CUNIT{axis}"), "deg")?;
    }
    if wcs.pc != [[1.0, 0.0], [0.0, 1.0]] {
        for (i, j) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            hdu.write_key(&mut fptr, &format!("PC{}_{}", i + 1, j + 1), wcs.pc[i][j])?;
        }
    }
    hdu.write_key(&mut fptr, "LONPOLE", wcs.lonpole)?;

    let ctype3 = cube
        .spectral
        .as_ref()
        .map(|s| s.ctype.as_str())
        .unwrap_or("FREQ");
    hdu.write_key(&mut fptr, "CTYPE3", ctype3)?;
    hdu.write_key(&mut fptr, "CRVAL3", *cube.freqs.first())?;
    hdu.write_key(
        &mut fptr,
        "CDELT3",
        channel_spacing(&cube.freqs)
            .or_else(|| cube.spectral.as_ref().map(|s| s.cdelt))
            .unwrap_or(1.0),
    )?;
    hdu.write_key(&mut fptr, "CRPIX3", 1.0)?;
    hdu.write_key(&mut fptr, "CUNIT3", "Hz")?;

    let (bmaj, bmin, bpa) = cube.beam.to_header_values();
    hdu.write_key(&mut fptr, "BMAJ", bmaj)?;
    hdu.write_key(&mut fptr, "BMIN", bmin)?;
    hdu.write_key(&mut fptr, "BPA", bpa)?;

    if let Some(history) = history {
        fits_write_history(&mut fptr, history)?;
    }
    Ok(())
}

/// The median spacing between adjacent frequencies, or `None` for a single
/// channel.
pub fn channel_spacing(freqs: &[f64]) -> Option<f64> {
    let mut diffs = freqs.windows(2).map(|w| w[1] - w[0]).collect::<Vec<_>>();
    if diffs.is_empty() {
        return None;
    }
    diffs.sort_unstable_by(f64::total_cmp);
    let n = diffs.len();
    Some(if n % 2 == 1 {
        diffs[n / 2]
    } else {
        (diffs[n / 2 - 1] + diffs[n / 2]) / 2.0
    })
}

/// Write one frequency \[Hz\] per line.
pub fn write_frequencies(freqs: &Vec1<f64>, file: &Path) -> Result<(), WriteError> {
    let mut writer = BufWriter::new(File::create(file)?);
    for freq in freqs.iter() {
        writeln!(writer, "{}", format_frequency(*freq))?;
    }
    writer.flush()?;
    Ok(())
}

/// Scientific notation with 18 decimal places and a signed, two-digit
/// exponent, e.g. `2.100000000000000000e+09`.
fn format_frequency(freq: f64) -> String {
    let s = format!("{freq:.18e}");
    match s.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exp),
            };
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => s,
    }
}
