//! The metadata root (ECMA-335 II.24.2.1) and its stream directory.
//!
//! ```text
//! "BSJB" | major: u16 | minor: u16 | reserved: u32 | length: u32 | version (padded to 4)
//! flags: u16 | stream count: u16 | stream headers (offset, size, name padded to 4)
//! ```

use crate::{
    file::{parser::Parser, writer::Writer},
    Error::OutOfBounds,
    Result,
};

/// Signature of a metadata root, `BSJB` in little-endian.
pub const CIL_HEADER_MAGIC: u32 = 0x424A_5342;

/// Version string written into new roots.
pub const DEFAULT_VERSION: &str = "v4.0.30319";

/// Longest stream name the directory may hold, without the terminator.
const MAX_STREAM_NAME: usize = 32;

/// One entry of the stream directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    /// Offset of the stream from the start of the root
    pub offset: u32,
    /// Size of the stream in bytes
    pub size: u32,
    /// Stream name, e.g. `#~` or `#Strings`
    pub name: String,
}

/// A parsed metadata root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root {
    /// `MajorVersion`, 1 for every runtime
    pub major_version: u16,
    /// `MinorVersion`, 1 for every runtime
    pub minor_version: u16,
    /// Runtime version the metadata was built against, e.g. `v4.0.30319`
    pub version: String,
    /// Stream directory
    pub stream_headers: Vec<StreamHeader>,
}

impl Root {
    /// Read a root and its stream directory from the start of `data`.
    ///
    /// # Errors
    /// Returns an error if the signature does not match, or the directory is truncated or
    /// points outside `data`.
    pub fn read(data: &[u8]) -> Result<Root> {
        let mut parser = Parser::new(data);

        let signature = parser.read_le::<u32>()?;
        if signature != CIL_HEADER_MAGIC {
            return Err(malformed_error!(
                "CIL_HEADER_MAGIC does not match - {:#x}",
                signature
            ));
        }

        let major_version = parser.read_le::<u16>()?;
        let minor_version = parser.read_le::<u16>()?;
        parser.advance_by(4)?;

        let length = parser.read_le::<u32>()? as usize;
        let version_bytes = parser.read_bytes(length)?;
        let version_end = version_bytes
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(version_bytes.len());
        let version = String::from_utf8_lossy(&version_bytes[..version_end]).into_owned();

        parser.advance_by(2)?;
        let stream_count = parser.read_le::<u16>()?;

        let mut stream_headers = Vec::with_capacity(usize::from(stream_count));
        for _ in 0..stream_count {
            let offset = parser.read_le::<u32>()?;
            let size = parser.read_le::<u32>()?;

            let mut name = String::with_capacity(8);
            loop {
                let byte = parser.read_le::<u8>()?;
                if byte == 0 {
                    break;
                }
                if name.len() == MAX_STREAM_NAME {
                    return Err(malformed_error!("Stream name longer than {} bytes", MAX_STREAM_NAME));
                }
                name.push(char::from(byte));
            }
            parser.align(4)?;

            let Some(end) = offset.checked_add(size) else {
                return Err(malformed_error!(
                    "Stream offset and size cause integer overflow - {} + {}",
                    offset,
                    size
                ));
            };
            if end as usize > data.len() {
                return Err(OutOfBounds);
            }

            stream_headers.push(StreamHeader { offset, size, name });
        }

        Ok(Root {
            major_version,
            minor_version,
            version,
            stream_headers,
        })
    }

    /// The bytes of the stream called `name`, if the directory has one.
    #[must_use]
    pub fn stream<'a>(&self, data: &'a [u8], name: &str) -> Option<&'a [u8]> {
        let header = self.stream_headers.iter().find(|h| h.name == name)?;
        data.get(header.offset as usize..(header.offset + header.size) as usize)
    }

    /// Lay out a root holding `streams`, in the given order.
    ///
    /// Every stream is padded to a multiple of 4 bytes.
    ///
    /// # Errors
    /// Returns an error if a stream name is too long or the result exceeds 4 GiB.
    pub fn write(version: &str, streams: &[(&str, &[u8])]) -> Result<Vec<u8>> {
        let mut version_bytes = version.as_bytes().to_vec();
        version_bytes.push(0);
        version_bytes.resize(align4(version_bytes.len()), 0);

        let Ok(stream_count) = u16::try_from(streams.len()) else {
            return Err(malformed_error!("Too many streams - {}", streams.len()));
        };

        let mut header_size = 20 + version_bytes.len();
        for (name, _) in streams {
            if name.len() > MAX_STREAM_NAME {
                return Err(malformed_error!("Stream name '{}' is too long", name));
            }
            header_size += 8 + align4(name.len() + 1);
        }

        let total = header_size + streams.iter().map(|(_, data)| align4(data.len())).sum::<usize>();
        let mut writer = Writer::with_capacity(total);

        writer.write_le(CIL_HEADER_MAGIC);
        writer.write_le(1_u16);
        writer.write_le(1_u16);
        writer.write_le(0_u32);
        writer.write_le(to_u32(version_bytes.len())?);
        writer.write_bytes(&version_bytes);
        writer.write_le(0_u16);
        writer.write_le(stream_count);

        let mut offset = header_size;
        for (name, data) in streams {
            writer.write_le(to_u32(offset)?);
            writer.write_le(to_u32(align4(data.len()))?);
            writer.write_bytes(name.as_bytes());
            writer.write_le(0_u8);
            writer.align(4);
            offset += align4(data.len());
        }

        for (_, data) in streams {
            writer.write_bytes(data);
            writer.align(4);
        }

        Ok(writer.into_inner())
    }
}

fn align4(value: usize) -> usize {
    (value + 3) & !3
}

fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| malformed_error!("Metadata of {} bytes is too large", value))
}
