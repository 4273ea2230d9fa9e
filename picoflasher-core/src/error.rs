//! Error types for write sessions.
//!
//! Every failure carries the exact number of bytes that were committed to the
//! device before the error occurred. Validation errors always report zero:
//! nothing is written until every precondition has passed.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while validating or running a write session.
#[derive(Debug, Error)]
pub enum FlashError {
    #[error("cannot read source image {path}: {source}")]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("source image {path} is not a regular file")]
    SourceNotAFile { path: PathBuf },

    #[error("source image {path} is empty")]
    EmptySource { path: PathBuf },

    #[error("image is {image_size} bytes but {device} only holds {capacity} bytes")]
    ImageTooLarge {
        device: PathBuf,
        image_size: u64,
        capacity: u64,
    },

    #[error("another session is already writing to {device}")]
    TargetBusy { device: PathBuf },

    #[error("refusing to write to {device}: it is the system boot device")]
    UnsafeTarget { device: PathBuf },

    #[error("write failed after {bytes_written} bytes: {source}")]
    Write {
        bytes_written: u64,
        #[source]
        source: io::Error,
    },

    #[error("verification failed: device contents do not match the source image")]
    Verification { bytes_written: u64 },
}

/// Coarse classification of a [`FlashError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad source/target combination, detected before any write.
    Validation,
    /// The target is the running system's own boot device. Never overridable.
    UnsafeTarget,
    /// I/O failure during the writing phase.
    Write,
    /// Post-write read-back did not match the source checksum.
    Verification,
}

impl FlashError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlashError::SourceUnreadable { .. }
            | FlashError::SourceNotAFile { .. }
            | FlashError::EmptySource { .. }
            | FlashError::ImageTooLarge { .. }
            | FlashError::TargetBusy { .. } => ErrorKind::Validation,
            FlashError::UnsafeTarget { .. } => ErrorKind::UnsafeTarget,
            FlashError::Write { .. } => ErrorKind::Write,
            FlashError::Verification { .. } => ErrorKind::Verification,
        }
    }

    /// Bytes committed to the device at the time of failure.
    pub fn bytes_written(&self) -> u64 {
        match self {
            FlashError::Write { bytes_written, .. }
            | FlashError::Verification { bytes_written } => *bytes_written,
            _ => 0,
        }
    }

    /// Process exit code for this error: 1 for validation and unsafe-target
    /// refusals, 2 for write failures, 3 for verification mismatches.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Validation | ErrorKind::UnsafeTarget => 1,
            ErrorKind::Write => 2,
            ErrorKind::Verification => 3,
        }
    }
}

pub type FlashResult<T> = std::result::Result<T, FlashError>;
