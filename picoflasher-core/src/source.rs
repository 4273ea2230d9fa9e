//! Identifies and validates the input image for a write session.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{FlashError, FlashResult};

/// The source image for a write session.
///
/// Opening an `ImageSource` validates that the path exists, is a regular
/// file, and has a known, nonzero length. The image itself is treated as an
/// opaque byte stream; no format parsing or decompression is performed.
///
/// The content checksum is computed lazily: the write pipeline folds every
/// chunk into a rolling SHA-256 hasher on its first (and only) full read of
/// the source, and the resulting digest is reported with the final session
/// outcome.
#[derive(Debug)]
pub struct ImageSource {
    path: PathBuf,
    length: u64,
}

impl ImageSource {
    /// Validates `path` and captures its length.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the path cannot be read, is not a
    /// regular file, or is empty.
    pub fn open(path: impl AsRef<Path>) -> FlashResult<Self> {
        let path = path.as_ref().to_path_buf();

        let metadata = fs::metadata(&path).map_err(|source| FlashError::SourceUnreadable {
            path: path.clone(),
            source,
        })?;

        if !metadata.is_file() {
            return Err(FlashError::SourceNotAFile { path });
        }
        if metadata.len() == 0 {
            return Err(FlashError::EmptySource { path });
        }

        Ok(Self {
            length: metadata.len(),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The length of the image in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Write;

    #[test]
    fn open_missing_file_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-image.iso");

        let err = ImageSource::open(&missing).unwrap_err();
        assert!(matches!(err, FlashError::SourceUnreadable { .. }));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn open_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();

        let err = ImageSource::open(dir.path()).unwrap_err();
        assert!(matches!(err, FlashError::SourceNotAFile { .. }));
    }

    #[test]
    fn open_empty_file_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();

        let err = ImageSource::open(file.path()).unwrap_err();
        assert!(matches!(err, FlashError::EmptySource { .. }));
    }

    #[test]
    fn open_captures_length() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0xAB; 4096]).unwrap();

        let source = ImageSource::open(file.path()).unwrap();
        assert_eq!(source.length(), 4096);
        assert_eq!(source.path(), file.path());
    }
}
