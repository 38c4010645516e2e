//! Raw byte access for module images and symbol streams.
//!
//! Module images on disk (the location a live module was loaded from, or a system module path
//! from the inventory) are memory mapped through a [`Backend`], so the image reader only ever
//! sees a byte slice. Images the host hands over as buffers never go through [`File`].
//!
//! # Key Components
//!
//! - [`File`] - A memory mapped module image
//! - [`Backend`] - Trait for the data sources
//! - [`parser::Parser`] - Cursor based reader used by every codec
//! - [`writer::Writer`] - Append-only writer used by every serializer
//! - [`io`] - Little-endian primitive helpers
//!
//! # Examples
//!
//! ```rust,no_run
//! use dotswap::File;
//! use std::path::Path;
//!
//! let file = File::from_file(Path::new("Plugins/Loader.dll"))?;
//! println!("{} bytes from {}", file.len(), file.path().display());
//! # Ok::<(), dotswap::Error>(())
//! ```

pub mod io;
pub mod parser;
mod physical;
pub mod writer;

use std::path::{Path, PathBuf};

use physical::Physical;

use crate::{Error, Result};

/// Data source abstraction for [`File`].
pub trait Backend: Send + Sync {
    /// Returns a slice of `len` bytes starting at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range is not inside the data.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]>;

    /// Returns the complete data.
    fn data(&self) -> &[u8];

    /// Returns the length of the data.
    fn len(&self) -> usize;
}

/// The bytes of one module image (or symbol stream), with the path they came from.
pub struct File {
    data: Box<dyn Backend>,
    path: PathBuf,
}

impl File {
    /// Memory map `file` from disk.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened or mapped and
    /// [`crate::Error::Empty`] for empty files.
    pub fn from_file(file: &Path) -> Result<File> {
        if std::fs::metadata(file)?.len() == 0 {
            return Err(Error::Empty);
        }

        Ok(File {
            data: Box::new(Physical::new(file)?),
            path: file.to_path_buf(),
        })
    }

    /// The path this file was read from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length of the data in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the data is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }

    /// The complete data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.data()
    }

    /// A bounds checked slice of the data.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range is not inside the data.
    pub fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.data.data_slice(offset, len)
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("path", &self.path)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn from_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"MZ\x90\0").unwrap();
        tmp.flush().unwrap();

        let file = File::from_file(tmp.path()).unwrap();
        assert_eq!(file.data(), b"MZ\x90\0");
        assert_eq!(file.path(), tmp.path());
    }

    #[test]
    fn from_file_empty() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(File::from_file(tmp.path()), Err(Error::Empty)));
    }
}
