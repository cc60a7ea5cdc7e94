#![forbid(unsafe_code)]
//! Error types for sealfs.
//!
//! Defines `SealError` and a `Result<T>` alias used throughout the
//! workspace. Client-visible failures map onto exactly these kinds; there
//! are no stringly-typed variants on the open/read/write paths.

use sealfs_types::ParseError;
use thiserror::Error;

/// Unified error type for all sealfs operations.
#[derive(Debug, Error)]
pub enum SealError {
    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("no space left in container")]
    NoSpace,

    /// The allocation bitmap cannot grow without an additional bitmap
    /// slice, which this revision does not support.
    #[error("bitmap capacity exhausted; an additional bitmap slice is required")]
    NeedBitmapSlice,

    #[error("operation invalid in the current state")]
    BadState,

    #[error("data failed integrity verification")]
    IntegrityError,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("external collaborator unavailable")]
    Unavailable,

    #[error("offset or length out of range")]
    OutOfRange,

    #[error("out of memory")]
    OutOfMemory,

    #[error("invalid arguments")]
    InvalidArgs,

    #[error("invalid on-disk format: {0}")]
    Format(#[from] ParseError),
}

impl SealError {
    /// Whether the error leaves the filesystem usable for other operations.
    ///
    /// `Io` and `Format` failures on metadata paths are treated as fatal by
    /// the engine; everything else is scoped to the failing call.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Format(_))
    }
}

/// Result alias using `SealError`.
pub type Result<T> = std::result::Result<T, SealError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_convert() {
        let parse = ParseError::InvalidMagic {
            expected: 1,
            actual: 2,
        };
        let err: SealError = parse.into();
        assert!(matches!(err, SealError::Format(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn io_errors_convert() {
        let err: SealError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, SealError::Io(_)));
    }

    #[test]
    fn blob_scoped_errors_are_not_fatal() {
        assert!(!SealError::IntegrityError.is_fatal());
        assert!(!SealError::NoSpace.is_fatal());
        assert!(!SealError::BadState.is_fatal());
    }
}
