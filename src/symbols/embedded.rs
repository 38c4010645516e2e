//! Symbol streams embedded into a module image.
//!
//! An embedded entry is a portable PDB compressed with raw deflate and prefixed
//! with a small header:
//!
//! ```text
//! "MPDB" | uncompressed size: u32 | deflate payload
//! ```

use std::io::{Read, Write};

use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};

use crate::{file::parser::Parser, Error, Result};

/// Signature of an embedded symbol entry.
pub const EMBEDDED_MAGIC: [u8; 4] = *b"MPDB";

/// Compress a portable symbol stream into an embedded entry.
///
/// # Errors
/// Returns an error if the stream is larger than `u32::MAX` bytes or compression fails.
pub fn compress(symbols: &[u8]) -> Result<Vec<u8>> {
    let Ok(size) = u32::try_from(symbols.len()) else {
        return Err(malformed_error!(
            "Symbol stream of {} bytes is too large to embed",
            symbols.len()
        ));
    };

    let mut entry = Vec::with_capacity(symbols.len() / 2 + 8);
    entry.extend_from_slice(&EMBEDDED_MAGIC);
    entry.extend_from_slice(&size.to_le_bytes());

    let mut encoder = DeflateEncoder::new(entry, Compression::default());
    encoder.write_all(symbols)?;
    Ok(encoder.finish()?)
}

/// Decompress an embedded entry back into a portable symbol stream.
///
/// # Errors
/// Returns [`Error::NotSupported`] if the entry does not start with [`EMBEDDED_MAGIC`], and
/// [`Error::Malformed`] if the payload does not inflate to the declared size.
pub fn decompress(entry: &[u8]) -> Result<Vec<u8>> {
    let mut parser = Parser::new(entry);
    if parser.read_bytes(4)? != EMBEDDED_MAGIC {
        return Err(Error::NotSupported);
    }

    let size = parser.read_le::<u32>()? as usize;
    let payload = parser.read_bytes(parser.remaining())?;

    // Read one byte past the declared size to detect oversized payloads
    let mut symbols = Vec::with_capacity(size.min(payload.len().saturating_mul(16)));
    DeflateDecoder::new(payload)
        .take(size as u64 + 1)
        .read_to_end(&mut symbols)
        .map_err(|e| malformed_error!("Embedded symbols do not inflate: {}", e))?;

    if symbols.len() != size {
        return Err(malformed_error!(
            "Embedded symbols inflate to {} bytes, header declares {}",
            symbols.len(),
            size
        ));
    }

    Ok(symbols)
}
