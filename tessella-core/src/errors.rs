// Tessella
// Copyright (c) 2025 The Project Tessella Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `errors` module defines the common error type.

use std::error::Error as StdError;
use std::fmt;
use std::ops::Deref;
use std::result;

/// `TessellaError` provides an enumeration of all possible errors reported by Tessella.
#[derive(Debug)]
pub enum TessellaError {
    /// A reversible encode would require more than 31 magnitude bit-planes.
    InsufficientPrecision,
    /// The ROI up-shift is smaller than the subband's magnitude bit-plane count, so the
    /// foreground and background regions cannot be reliably separated.
    RoiShiftTooSmall,
    /// A sample format conversion was requested that the source representation cannot support.
    UnsupportedFormat(&'static str),
    /// A channel with a floating point output format has only a fixed point palette.
    PaletteFormatMismatch,
    /// An expansion or reduction ratio is degenerate or out of range.
    InvalidExpansion(&'static str),
    /// An expansion ratio cannot be reduced to a 32-bit numerator/denominator pair.
    RatioNotRepresentable,
    /// A computed buffer stride or area exceeds the representable range.
    DimensionOverflow,
    /// The requested render region does not lie inside the full image.
    RegionOutsideImage,
    /// A worker queue could not be created.
    ThreadAttachFailure,
    /// An error escaped from the codestream layer; the surrounding pass is aborted.
    CodestreamFailure(Box<dyn StdError + Send + Sync>),
    /// A memory allocation request could not be satisfied.
    OutOfMemory,
}

impl fmt::Display for TessellaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            TessellaError::InsufficientPrecision => {
                write!(f, "insufficient precision for reversible compression")
            }
            TessellaError::RoiShiftTooSmall => {
                write!(f, "roi up-shift too small to separate foreground from background")
            }
            TessellaError::UnsupportedFormat(desc) => {
                write!(f, "unsupported sample format: {}", desc)
            }
            TessellaError::PaletteFormatMismatch => {
                write!(f, "float-formatted channel has only a fixed point palette")
            }
            TessellaError::InvalidExpansion(desc) => {
                write!(f, "invalid expansion ratio: {}", desc)
            }
            TessellaError::RatioNotRepresentable => {
                write!(f, "expansion ratio not representable with 32-bit terms")
            }
            TessellaError::DimensionOverflow => {
                write!(f, "computed buffer dimensions exceed the representable range")
            }
            TessellaError::RegionOutsideImage => {
                write!(f, "requested region lies outside the image")
            }
            TessellaError::ThreadAttachFailure => {
                write!(f, "failed to attach a worker queue")
            }
            TessellaError::CodestreamFailure(ref err) => {
                write!(f, "codestream failure: {:?}", err)
            }
            TessellaError::OutOfMemory => {
                write!(f, "memory allocation failed")
            }
        }
    }
}

impl StdError for TessellaError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match *self {
            TessellaError::CodestreamFailure(ref err) => Some(err.deref()),
            _ => None,
        }
    }
}

pub type Result<T> = result::Result<T, TessellaError>;

/// Convenience function to create an unsupported format error.
pub fn unsupported_error<T>(desc: &'static str) -> Result<T> {
    Err(TessellaError::UnsupportedFormat(desc))
}

/// Convenience function to create an invalid expansion error.
pub fn expansion_error<T>(desc: &'static str) -> Result<T> {
    Err(TessellaError::InvalidExpansion(desc))
}

/// Convenience function to create a dimension overflow error.
pub fn overflow_error<T>() -> Result<T> {
    Err(TessellaError::DimensionOverflow)
}

/// Convenience function to create an insufficient precision error.
pub fn precision_error<T>() -> Result<T> {
    Err(TessellaError::InsufficientPrecision)
}

/// Convenience function to wrap an error that escaped from the codestream layer.
pub fn codestream_error<T, E: StdError + Send + Sync + 'static>(err: E) -> Result<T> {
    Err(TessellaError::CodestreamFailure(Box::new(err)))
}
