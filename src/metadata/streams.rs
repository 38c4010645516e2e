//! The metadata heaps (ECMA-335 II.24.2.2 - II.24.2.5).
//!
//! Readers borrow the heap bytes and resolve the indices stored in table columns. Builders
//! start from the heap of an existing image and only ever append, so every index that was
//! valid in the source image stays valid in the rewritten one, and adding an entry that is
//! already present hands back its existing index.

use std::collections::HashMap;

use widestring::U16String;

use crate::{
    file::{parser::Parser, writer::Writer},
    Error::OutOfBounds,
    Result,
};

/// The `#Strings` heap: NUL terminated UTF-8 identifiers.
pub struct Strings<'a> {
    data: &'a [u8],
}

impl<'a> Strings<'a> {
    /// Create a `Strings` view over a heap.
    ///
    /// # Errors
    /// Returns an error if the heap is empty or does not start with the empty string.
    pub fn from(data: &'a [u8]) -> Result<Strings<'a>> {
        if data.first() != Some(&0) {
            return Err(malformed_error!("Provided #Strings heap is empty"));
        }

        Ok(Strings { data })
    }

    /// The string starting at `index`.
    ///
    /// # Errors
    /// Returns an error if the index is out of bounds, the string is not terminated or not
    /// valid UTF-8.
    pub fn get(&self, index: usize) -> Result<&'a str> {
        let Some(tail) = self.data.get(index..) else {
            return Err(OutOfBounds);
        };
        let Some(end) = tail.iter().position(|byte| *byte == 0) else {
            return Err(malformed_error!("Unterminated string at index - {}", index));
        };

        std::str::from_utf8(&tail[..end])
            .map_err(|_| malformed_error!("Invalid string at index - {}", index))
    }
}

/// The `#Blob` heap: length prefixed byte sequences.
pub struct Blob<'a> {
    data: &'a [u8],
}

impl<'a> Blob<'a> {
    /// Create a `Blob` view over a heap.
    ///
    /// # Errors
    /// Returns an error if the heap is empty or does not start with the empty blob.
    pub fn from(data: &'a [u8]) -> Result<Blob<'a>> {
        if data.first() != Some(&0) {
            return Err(malformed_error!("Invalid memory for #Blob heap"));
        }

        Ok(Blob { data })
    }

    /// The blob at `index`.
    ///
    /// # Errors
    /// Returns an error if the index or the blob length points past the end of the heap.
    pub fn get(&self, index: usize) -> Result<&'a [u8]> {
        let Some(tail) = self.data.get(index..) else {
            return Err(OutOfBounds);
        };

        let mut parser = Parser::new(tail);
        parser.read_prefixed_blob()
    }
}

/// The `#GUID` heap: 16 byte entries addressed by 1-based index.
pub struct Guid<'a> {
    data: &'a [u8],
}

impl<'a> Guid<'a> {
    /// Create a `Guid` view over a heap.
    ///
    /// # Errors
    /// Returns an error if the heap size is not a multiple of 16.
    pub fn from(data: &'a [u8]) -> Result<Guid<'a>> {
        if data.len() % 16 != 0 {
            return Err(malformed_error!("Invalid #GUID heap size - {}", data.len()));
        }

        Ok(Guid { data })
    }

    /// The guid at the 1-based `index`; index 0 is the null guid.
    ///
    /// # Errors
    /// Returns [`OutOfBounds`] if there is no entry at `index`.
    pub fn get(&self, index: usize) -> Result<uguid::Guid> {
        if index == 0 {
            return Ok(uguid::Guid::ZERO);
        }

        let start = (index - 1) * 16;
        let Some(entry) = self.data.get(start..start + 16) else {
            return Err(OutOfBounds);
        };

        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(entry);
        Ok(uguid::Guid::from_bytes(bytes))
    }
}

/// The `#US` heap: length prefixed UTF-16 strings with a trailing flag byte.
pub struct UserStrings<'a> {
    data: &'a [u8],
}

impl<'a> UserStrings<'a> {
    /// Create a `UserStrings` view over a heap. An image without a `#US` stream is
    /// represented by an empty slice.
    ///
    /// # Errors
    /// Returns an error if a non-empty heap does not start with the empty entry.
    pub fn from(data: &'a [u8]) -> Result<UserStrings<'a>> {
        if !data.is_empty() && data[0] != 0 {
            return Err(malformed_error!("Invalid memory for #US heap"));
        }

        Ok(UserStrings { data })
    }

    /// The string at `index`.
    ///
    /// # Errors
    /// Returns an error if the entry is out of bounds or not valid UTF-16.
    pub fn get(&self, index: usize) -> Result<String> {
        let Some(tail) = self.data.get(index..) else {
            return Err(OutOfBounds);
        };

        let mut parser = Parser::new(tail);
        decode_user_string(parser.read_prefixed_blob()?)
    }

    /// Every non-empty entry with its heap offset, in heap order.
    ///
    /// Trailing padding is skipped.
    ///
    /// # Errors
    /// Returns an error if an entry runs past the end of the heap or is not valid UTF-16.
    pub fn entries(&self) -> Result<Vec<(u32, String)>> {
        let mut entries = Vec::new();
        let mut parser = Parser::new(self.data);

        while parser.has_more_data() {
            let offset = parser.pos();
            let blob = parser.read_prefixed_blob()?;
            if blob.is_empty() {
                continue;
            }

            let Ok(offset) = u32::try_from(offset) else {
                return Err(malformed_error!("#US heap is too large"));
            };
            entries.push((offset, decode_user_string(blob)?));
        }

        Ok(entries)
    }
}

fn decode_user_string(blob: &[u8]) -> Result<String> {
    // Odd length: UTF-16 code units followed by the terminal byte
    let units: Vec<u16> = blob[..blob.len() - blob.len() % 2]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    U16String::from_vec(units)
        .to_string()
        .map_err(|e| malformed_error!("Invalid UTF-16 user string: {}", e))
}

/// UTF-16 code units followed by the terminal byte, which is 1 when the string holds
/// characters that need special handling (ECMA-335 II.24.2.4).
pub(crate) fn user_string_blob(value: &str) -> Vec<u8> {
    let wide = U16String::from_str(value);
    let mut blob = Vec::with_capacity(wide.len() * 2 + 1);
    let mut special = false;

    for unit in wide.as_slice() {
        special |= *unit > 0x7E || matches!(*unit, 0x01..=0x08 | 0x0E..=0x1F | 0x27 | 0x2D);
        blob.extend_from_slice(&unit.to_le_bytes());
    }
    blob.push(u8::from(special));

    blob
}

fn heap_index(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| malformed_error!("Heap of {} bytes is too large", len))
}

/// Append-only writer for the `#Strings` heap.
#[derive(Debug, Clone, Default)]
pub struct StringsBuilder {
    data: Vec<u8>,
    index: HashMap<String, u32>,
}

impl StringsBuilder {
    /// A heap holding only the empty string.
    #[must_use]
    pub fn new() -> Self {
        StringsBuilder {
            data: vec![0],
            index: HashMap::new(),
        }
    }

    /// Continue the heap of an existing image.
    #[must_use]
    pub fn from_heap(heap: &[u8]) -> Self {
        if heap.first() != Some(&0) {
            return Self::new();
        }

        let mut builder = StringsBuilder {
            data: heap.to_vec(),
            index: HashMap::new(),
        };

        let mut start = 1;
        while let Some(length) = heap.get(start..).and_then(|t| t.iter().position(|b| *b == 0)) {
            if let (Ok(value), Ok(offset)) = (
                std::str::from_utf8(&heap[start..start + length]),
                u32::try_from(start),
            ) {
                builder.index.entry(value.to_string()).or_insert(offset);
            }
            start += length + 1;
        }

        builder
    }

    /// Index of `value`, appending it if the heap does not hold it yet.
    ///
    /// # Errors
    /// Returns an error if the heap would exceed 4 GiB.
    pub fn add(&mut self, value: &str) -> Result<u32> {
        if value.is_empty() {
            return Ok(0);
        }
        if let Some(offset) = self.index.get(value) {
            return Ok(*offset);
        }

        let offset = heap_index(self.data.len())?;
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
        self.index.insert(value.to_string(), offset);
        Ok(offset)
    }

    /// Heap size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the heap holds nothing but the empty string.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.len() <= 1
    }

    /// The heap bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Append-only writer for the `#Blob` heap.
#[derive(Debug, Clone, Default)]
pub struct BlobBuilder {
    data: Vec<u8>,
    index: HashMap<Vec<u8>, u32>,
}

impl BlobBuilder {
    /// A heap holding only the empty blob.
    #[must_use]
    pub fn new() -> Self {
        BlobBuilder {
            data: vec![0],
            index: HashMap::new(),
        }
    }

    /// Continue the heap of an existing image.
    #[must_use]
    pub fn from_heap(heap: &[u8]) -> Self {
        if heap.first() != Some(&0) {
            return Self::new();
        }

        let mut builder = BlobBuilder {
            data: heap.to_vec(),
            index: HashMap::new(),
        };

        let mut parser = Parser::new(heap);
        while parser.has_more_data() {
            let offset = parser.pos();
            let Ok(blob) = parser.read_prefixed_blob() else {
                break;
            };
            if let Ok(offset) = u32::try_from(offset) {
                if !blob.is_empty() {
                    builder.index.entry(blob.to_vec()).or_insert(offset);
                }
            }
        }

        builder
    }

    /// Index of `value`, appending it if the heap does not hold it yet.
    ///
    /// # Errors
    /// Returns an error if the blob is too long for a length prefix or the heap would
    /// exceed 4 GiB.
    pub fn add(&mut self, value: &[u8]) -> Result<u32> {
        if value.is_empty() {
            return Ok(0);
        }
        if let Some(offset) = self.index.get(value) {
            return Ok(*offset);
        }

        let offset = heap_index(self.data.len())?;
        let mut writer = Writer::with_capacity(value.len() + 4);
        writer.write_prefixed_blob(value)?;
        self.data.extend_from_slice(&writer.into_inner());
        self.index.insert(value.to_vec(), offset);
        Ok(offset)
    }

    /// Heap size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the heap holds nothing but the empty blob.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.len() <= 1
    }

    /// The heap bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Append-only writer for the `#GUID` heap.
#[derive(Debug, Clone, Default)]
pub struct GuidBuilder {
    data: Vec<u8>,
}

impl GuidBuilder {
    /// An empty heap.
    #[must_use]
    pub fn new() -> Self {
        GuidBuilder::default()
    }

    /// Continue the heap of an existing image.
    #[must_use]
    pub fn from_heap(heap: &[u8]) -> Self {
        GuidBuilder {
            data: heap[..heap.len() - heap.len() % 16].to_vec(),
        }
    }

    /// 1-based index of `value`, appending it if the heap does not hold it yet. The null
    /// guid is index 0.
    ///
    /// # Errors
    /// Returns an error if the heap would exceed 4 GiB.
    pub fn add(&mut self, value: uguid::Guid) -> Result<u32> {
        if value == uguid::Guid::ZERO {
            return Ok(0);
        }

        let bytes = value.to_bytes();
        if let Some(position) = self.data.chunks_exact(16).position(|entry| entry == bytes) {
            return heap_index(position + 1);
        }

        self.data.extend_from_slice(&bytes);
        heap_index(self.data.len() / 16)
    }

    /// Heap size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the heap holds no guid.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The heap bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Writer for a fresh `#US` heap.
#[derive(Debug, Clone)]
pub struct UserStringsBuilder {
    data: Vec<u8>,
}

impl Default for UserStringsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl UserStringsBuilder {
    /// A heap holding only the empty entry.
    #[must_use]
    pub fn new() -> Self {
        UserStringsBuilder { data: vec![0] }
    }

    /// Append `value` and return its heap offset.
    ///
    /// # Errors
    /// Returns an error if the heap outgrows the 24 bits of a user string token.
    pub fn add(&mut self, value: &str) -> Result<u32> {
        let offset = heap_index(self.data.len())?;
        if offset > 0x00FF_FFFF {
            return Err(malformed_error!("#US heap exceeds the user string token range"));
        }

        let mut writer = Writer::new();
        writer.write_prefixed_blob(&user_string_blob(value))?;
        self.data.extend_from_slice(&writer.into_inner());
        Ok(offset)
    }

    /// The heap bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}
