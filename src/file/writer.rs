//! Append-only counterpart of [`crate::Parser`].
//!
//! Every serializer in this crate produces its output front to back, so the writer is a
//! thin wrapper over a `Vec<u8>` that knows the same encodings the parser reads.

use crate::{
    file::io::{write_le, write_le_at, CilIO},
    Result,
};

/// Growable little-endian output buffer.
#[derive(Debug, Default)]
pub struct Writer {
    data: Vec<u8>,
}

impl Writer {
    /// Create an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Writer { data: Vec::new() }
    }

    /// Create an empty writer with reserved capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Writer {
            data: Vec::with_capacity(capacity),
        }
    }

    /// Current length of the output, which is also the offset of the next write.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.data.len()
    }

    /// Append a little-endian value.
    pub fn write_le<T: CilIO>(&mut self, value: T) {
        write_le(&mut self.data, value);
    }

    /// Overwrite an already written location, used to back-patch sizes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `offset` is not inside the written data.
    pub fn patch_le<T: CilIO>(&mut self, offset: usize, value: T) -> Result<()> {
        write_le_at(&mut self.data, offset, value)
    }

    /// Append raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Append an ECMA-335 compressed unsigned integer (II.23.2).
    ///
    /// # Errors
    /// Returns an error if `value` exceeds the largest encodable value `0x1FFF_FFFF`.
    pub fn write_compressed_uint(&mut self, value: u32) -> Result<()> {
        // Truncating casts below are masked to the encoded width
        #[allow(clippy::cast_possible_truncation)]
        match value {
            0..=0x7F => self.data.push(value as u8),
            0x80..=0x3FFF => {
                self.data.push(0x80 | (value >> 8) as u8);
                self.data.push(value as u8);
            }
            0x4000..=0x1FFF_FFFF => {
                self.data.push(0xC0 | (value >> 24) as u8);
                self.data.push((value >> 16) as u8);
                self.data.push((value >> 8) as u8);
                self.data.push(value as u8);
            }
            _ => {
                return Err(malformed_error!(
                    "Value {:#x} is too large for a compressed integer",
                    value
                ))
            }
        }

        Ok(())
    }

    /// Append an ECMA-335 compressed signed integer (II.23.2).
    ///
    /// # Errors
    /// Returns an error if `value` lies outside `-2^28..2^28`.
    pub fn write_compressed_int(&mut self, value: i32) -> Result<()> {
        let sign = u32::from(value < 0);

        // Two's complement bits are masked to the encoded width
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        match value {
            -0x40..=0x3F => {
                self.data.push(((((value as u32) & 0x3F) << 1) | sign) as u8);
            }
            -0x2000..=0x1FFF => {
                let rotated = (((value as u32) & 0x1FFF) << 1) | sign;
                self.data.push(0x80 | (rotated >> 8) as u8);
                self.data.push(rotated as u8);
            }
            -0x1000_0000..=0x0FFF_FFFF => {
                let rotated = (((value as u32) & 0x0FFF_FFFF) << 1) | sign;
                self.data.push(0xC0 | (rotated >> 24) as u8);
                self.data.push((rotated >> 16) as u8);
                self.data.push((rotated >> 8) as u8);
                self.data.push(rotated as u8);
            }
            _ => {
                return Err(malformed_error!(
                    "Value {} is too large for a compressed signed integer",
                    value
                ))
            }
        }

        Ok(())
    }

    /// Append a blob prefixed with its compressed length.
    ///
    /// # Errors
    /// Returns an error if the blob is too large to be length prefixed.
    pub fn write_prefixed_blob(&mut self, blob: &[u8]) -> Result<()> {
        let Ok(length) = u32::try_from(blob.len()) else {
            return Err(malformed_error!("Blob of {} bytes is too large", blob.len()));
        };

        self.write_compressed_uint(length)?;
        self.write_bytes(blob);
        Ok(())
    }

    /// Append a UTF-8 string prefixed with its compressed byte length.
    ///
    /// # Errors
    /// Returns an error if the string is too large to be length prefixed.
    pub fn write_prefixed_string_utf8(&mut self, value: &str) -> Result<()> {
        self.write_prefixed_blob(value.as_bytes())
    }

    /// Pad with zero bytes up to the next multiple of `alignment`.
    pub fn align(&mut self, alignment: usize) {
        let padding = (alignment - (self.data.len() % alignment)) % alignment;
        self.data.resize(self.data.len() + padding, 0);
    }

    /// Consume the writer and return the produced bytes.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}
