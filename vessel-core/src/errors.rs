// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `errors` module defines the common error type.

use std::error::Error as StdError;
use std::fmt;
use std::result;

/// `Error` provides an enumeration of all possible errors reported by Vessel.
#[derive(Debug)]
pub enum Error {
    /// An IO error occurred while reading from the source or writing to the sink.
    IoError(std::io::Error),
    /// The container contained malformed data and could not be demuxed.
    DecodeError(&'static str),
    /// An unsupported container or codec feature was encountered.
    Unsupported(&'static str),
    /// Caller-supplied metadata is missing required fields or is inconsistent.
    InvalidMetadata(&'static str),
    /// A sample violated the timestamp ordering rules of the output.
    TimestampOrder(String),
    /// The coded dimensions of a video track changed mid-track.
    DimensionChange(&'static str),
    /// The sample rate or channel count of an audio track changed mid-track.
    AudioParamsChange(&'static str),
    /// A streamable writer observed a non-monotonic flush.
    MonotonicityViolation(&'static str),
    /// A Matroska block timestamp did not fit the signed 16-bit cluster-relative range.
    ClusterOverflow(&'static str),
    /// The API was used incorrectly. This is a bug in the caller, not in the stream.
    ProgrammerError(&'static str),
    /// The end of the stream was reached unexpectedly.
    EndOfStream,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::IoError(ref err) => {
                write!(f, "io error: {}", err)
            }
            Error::DecodeError(msg) => {
                write!(f, "malformed stream: {}", msg)
            }
            Error::Unsupported(feature) => {
                write!(f, "unsupported feature: {}", feature)
            }
            Error::InvalidMetadata(msg) => {
                write!(f, "invalid metadata: {}", msg)
            }
            Error::TimestampOrder(ref msg) => {
                write!(f, "timestamp order violation: {}", msg)
            }
            Error::DimensionChange(msg) => {
                write!(f, "video dimensions changed: {}", msg)
            }
            Error::AudioParamsChange(msg) => {
                write!(f, "audio parameters changed: {}", msg)
            }
            Error::MonotonicityViolation(msg) => {
                write!(f, "non-monotonic write: {}", msg)
            }
            Error::ClusterOverflow(msg) => {
                write!(f, "cluster timestamp overflow: {}", msg)
            }
            Error::ProgrammerError(msg) => {
                write!(f, "incorrect api usage: {}", msg)
            }
            Error::EndOfStream => {
                write!(f, "unexpected end of stream")
            }
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match *self {
            Error::IoError(ref err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::EndOfStream,
            _ => Error::IoError(err),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Convenience function to create a decode error.
pub fn decode_error<T>(desc: &'static str) -> Result<T> {
    Err(Error::DecodeError(desc))
}

/// Convenience function to create an unsupported feature error.
pub fn unsupported_error<T>(feature: &'static str) -> Result<T> {
    Err(Error::Unsupported(feature))
}

/// Convenience function to create an invalid metadata error.
pub fn invalid_metadata_error<T>(desc: &'static str) -> Result<T> {
    Err(Error::InvalidMetadata(desc))
}

/// Convenience function to create a timestamp order error.
pub fn timestamp_order_error<T>(desc: String) -> Result<T> {
    Err(Error::TimestampOrder(desc))
}

/// Convenience function to create a monotonicity violation error.
pub fn monotonicity_error<T>(desc: &'static str) -> Result<T> {
    Err(Error::MonotonicityViolation(desc))
}

/// Convenience function to create a programmer error.
pub fn programmer_error<T>(desc: &'static str) -> Result<T> {
    Err(Error::ProgrammerError(desc))
}

/// Convenience function to create an end-of-stream error.
pub fn end_of_stream_error<T>() -> Result<T> {
    Err(Error::EndOfStream)
}
