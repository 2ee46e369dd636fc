//! Thin, fallible wrappers around fitsio, plus a captured copy of an HDU's
//! header cards.

use std::{
    ffi::{CStr, CString},
    fmt::Display,
    os::raw::c_char,
    path::Path,
    str::FromStr,
};

use fitsio::{hdu::*, FitsFile};
use thiserror::Error;

/// cfitsio's KEY_NO_EXIST and VALUE_UNDEFINED.
const MISSING_KEY_STATUSES: [i32; 2] = [202, 204];

/// Large enough for any card component (FLEN_CARD).
const CARD_BUFFER_LEN: usize = 81;

#[derive(Error, Debug)]
pub enum FitsError {
    #[error("{0}")]
    Fitsio(#[from] fitsio::errors::Error),

    #[error("HDU {hdu} is not an image")]
    NotImage { hdu: String },

    #[error("Couldn't parse the value '{value}' of keyword {key}")]
    Parse { key: String, value: String },

    #[error("Keyword {key} is missing from the header")]
    MissingKey { key: String },

    #[error("Couldn't convert '{0}' into a C string")]
    CString(String),
}

/// Open a fits file.
pub(crate) fn fits_open<P: AsRef<Path>>(file: P) -> Result<FitsFile, FitsError> {
    Ok(FitsFile::open(file.as_ref())?)
}

/// Open a fits file's HDU.
pub(crate) fn fits_open_hdu<T: DescribesHdu + Display + Copy>(
    fits_fptr: &mut FitsFile,
    hdu_description: T,
) -> Result<FitsHdu, FitsError> {
    Ok(fits_fptr.hdu(hdu_description)?)
}

/// Given a FITS file pointer, a HDU that belongs to it, and a keyword that may
/// or may not exist, pull out the value of the keyword, parsing it into the
/// desired type.
pub(crate) fn fits_get_optional_key<T: FromStr>(
    fits_fptr: &mut FitsFile,
    hdu: &FitsHdu,
    keyword: &str,
) -> Result<Option<T>, FitsError> {
    let unparsed_value: String = match hdu.read_key(fits_fptr, keyword) {
        Ok(key_value) => key_value,
        Err(fitsio::errors::Error::Fits(fe)) if MISSING_KEY_STATUSES.contains(&fe.status) => {
            return Ok(None)
        }
        Err(e) => return Err(FitsError::Fitsio(e)),
    };

    match unparsed_value.parse() {
        Ok(parsed_value) => Ok(Some(parsed_value)),
        Err(_) => Err(FitsError::Parse {
            key: keyword.to_string(),
            value: unparsed_value,
        }),
    }
}

/// Given a FITS file pointer, a HDU that belongs to it, and a keyword, pull out
/// the value of the keyword, parsing it into the desired type.
pub(crate) fn fits_get_required_key<T: FromStr>(
    fits_fptr: &mut FitsFile,
    hdu: &FitsHdu,
    keyword: &str,
) -> Result<T, FitsError> {
    fits_get_optional_key(fits_fptr, hdu, keyword)?.ok_or_else(|| FitsError::MissingKey {
        key: keyword.to_string(),
    })
}

/// Get the size of the image on the supplied HDU. The shape is in C order,
/// i.e. the slowest-varying (last FITS) axis comes first.
pub(crate) fn fits_get_image_size(hdu: &FitsHdu) -> Result<&Vec<usize>, FitsError> {
    match &hdu.info {
        HduInfo::ImageInfo { shape, .. } => Ok(shape),
        _ => Err(FitsError::NotImage {
            hdu: hdu.number.to_string(),
        }),
    }
}

/// Given a FITS file pointer and a HDU, read the associated image.
pub(crate) fn fits_get_image<T: fitsio::images::ReadImage>(
    fits_fptr: &mut FitsFile,
    hdu: &FitsHdu,
) -> Result<T, FitsError> {
    match &hdu.info {
        HduInfo::ImageInfo { .. } => Ok(hdu.read_image(fits_fptr)?),
        _ => Err(FitsError::NotImage {
            hdu: hdu.number.to_string(),
        }),
    }
}

/// Append a HISTORY card to the current HDU.
pub(crate) fn fits_write_history(fits_fptr: &mut FitsFile, history: &str) -> Result<(), FitsError> {
    let history_ffi =
        CString::new(history).map_err(|_| FitsError::CString(history.to_string()))?;
    let mut status = 0;
    unsafe {
        // ffphis = fits_write_history
        fitsio_sys::ffphis(fits_fptr.as_raw(), history_ffi.as_ptr(), &mut status);
    }
    fitsio::errors::check_status(status)?;
    Ok(())
}

/// Read every keyword card of the HDU. The HDU is made current first.
pub(crate) fn fits_read_header(
    fits_fptr: &mut FitsFile,
    hdu: &FitsHdu,
) -> Result<FitsHeader, FitsError> {
    // Any cheap call that goes through fitsio moves the CHDU to this HDU.
    fits_get_optional_key::<String>(fits_fptr, hdu, "NAXIS")?;

    let mut status = 0;
    let mut num_keys = 0;
    let mut more_keys = 0;
    unsafe {
        // ffghsp = fits_get_hdrspace
        fitsio_sys::ffghsp(fits_fptr.as_raw(), &mut num_keys, &mut more_keys, &mut status);
    }
    fitsio::errors::check_status(status)?;

    let mut cards = Vec::with_capacity(num_keys.max(0) as usize);
    let mut name = [0 as c_char; CARD_BUFFER_LEN];
    let mut value = [0 as c_char; CARD_BUFFER_LEN];
    let mut comment = [0 as c_char; CARD_BUFFER_LEN];
    for i_key in 1..=num_keys {
        unsafe {
            // ffgkyn = fits_read_keyn
            fitsio_sys::ffgkyn(
                fits_fptr.as_raw(),
                i_key,
                name.as_mut_ptr(),
                value.as_mut_ptr(),
                comment.as_mut_ptr(),
                &mut status,
            );
        }
        fitsio::errors::check_status(status)?;
        let (name, value) = unsafe {
            (
                CStr::from_ptr(name.as_ptr()).to_string_lossy().into_owned(),
                CStr::from_ptr(value.as_ptr()).to_string_lossy().into_owned(),
            )
        };
        if name.is_empty() || matches!(name.as_str(), "HISTORY" | "COMMENT" | "END") {
            continue;
        }
        cards.push(HeaderCard::from_raw(name, &value));
    }

    Ok(FitsHeader { cards })
}

/// A single keyword card. String values have their quotes removed.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderCard {
    pub key: String,
    pub value: String,
    /// Was the value a quoted FITS string?
    pub quoted: bool,
}

impl HeaderCard {
    fn from_raw(key: String, raw: &str) -> HeaderCard {
        let raw = raw.trim();
        if let Some(inner) = raw.strip_prefix('\'') {
            let inner = inner.strip_suffix('\'').unwrap_or(inner);
            HeaderCard {
                key,
                value: inner.replace("''", "'").trim_end().to_string(),
                quoted: true,
            }
        } else {
            // Fortran-style exponents.
            HeaderCard {
                key,
                value: raw.replace('D', "E"),
                quoted: false,
            }
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum HeaderError {
    #[error("Keyword {key} is missing from the header")]
    Missing { key: String },

    #[error("Couldn't parse the value '{value}' of keyword {key}")]
    Parse { key: String, value: String },
}

/// The keyword cards of one HDU, in header order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitsHeader {
    cards: Vec<HeaderCard>,
}

impl FitsHeader {
    /// Build a header from (key, value) pairs. Values are treated as already
    /// unquoted; anything that doesn't parse as a number is considered a string.
    pub fn from_pairs<I, K, V>(pairs: I) -> FitsHeader
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        FitsHeader {
            cards: pairs
                .into_iter()
                .map(|(key, value)| {
                    let value = value.into();
                    let quoted = value.parse::<f64>().is_err();
                    HeaderCard {
                        key: key.into(),
                        value,
                        quoted,
                    }
                })
                .collect(),
        }
    }

    pub fn card(&self, key: &str) -> Option<&HeaderCard> {
        self.cards.iter().find(|c| c.key == key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.card(key).map(|c| c.value.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.card(key).is_some()
    }

    /// Parse an optional keyword.
    pub fn get<T: FromStr>(&self, key: &str) -> Result<Option<T>, HeaderError> {
        match self.get_str(key) {
            None => Ok(None),
            Some(value) => value.trim().parse().map(Some).map_err(|_| HeaderError::Parse {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Parse a keyword that must exist.
    pub fn require<T: FromStr>(&self, key: &str) -> Result<T, HeaderError> {
        self.get(key)?.ok_or_else(|| HeaderError::Missing {
            key: key.to_string(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderCard> {
        self.cards.iter()
    }
}
