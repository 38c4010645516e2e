//! Debug symbols: sequence points that map instructions back to source positions.
//!
//! Symbols come in three shapes. A sidecar portable PDB, an entry embedded into the image
//! (a compressed portable PDB), or a legacy native MSF file.
//! The first two are parsed into [`PortableSymbols`]; native files are recognized by their
//! signature and reported as unsupported, which callers treat as "no symbols".
//!
//! Sequence points are not kept next to the image as offset tables. [`attach`] hangs every
//! point on the instruction at its IL offset, so rewrites that insert, drop or move
//! instructions carry the points along (or drop them with the instruction). After the image
//! has been re-encoded, [`extract`] reads the points back off the instructions and keys them
//! by the new offsets from the written layout.
//!
//! # Examples
//!
//! ```rust,no_run
//! use dotswap::{image::Image, symbols};
//!
//! let mut image = Image::parse(&std::fs::read("Mod.dll")?)?;
//! let portable = symbols::read_symbols(&std::fs::read("Mod.pdb")?)?;
//! symbols::attach(&mut image, &portable)?;
//!
//! let written = image.to_bytes()?;
//! let rewritten = symbols::extract(&image, &written.layouts, &portable)?;
//! # Ok::<(), dotswap::Error>(())
//! ```

mod embedded;
mod portable;

pub use embedded::{compress, decompress, EMBEDDED_MAGIC};
pub use portable::{MethodSymbols, PortableSymbols, PDB_VERSION};

use crate::{
    assembly::{layout, Layout},
    image::{Image, Token},
    Error, Result,
};

/// Line number marking a sequence point that hides its instructions from the debugger.
pub const HIDDEN_LINE: u32 = 0x00FE_EFEE;

/// Language guid of C# documents.
pub const LANGUAGE_CSHARP: uguid::Guid = uguid::guid!("3f5162f8-07c6-11d3-9053-00c04fa302a1");

/// Signature of a legacy native (MSF 7.00) symbol file.
pub const NATIVE_SIGNATURE: &[u8] = b"Microsoft C/C++ MSF 7.00\r\n\x1aDS\0\0\0";

/// A source range attached to an instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencePoint {
    /// Index into the document table of the owning stream
    pub document: u32,
    /// First line, [`HIDDEN_LINE`] for hidden points
    pub start_line: u32,
    /// First column
    pub start_column: u16,
    /// Last line
    pub end_line: u32,
    /// Column after the last character
    pub end_column: u16,
}

impl SequencePoint {
    /// A visible sequence point.
    #[must_use]
    pub fn new(
        document: u32,
        start_line: u32,
        start_column: u16,
        end_line: u32,
        end_column: u16,
    ) -> Self {
        SequencePoint {
            document,
            start_line,
            start_column,
            end_line,
            end_column,
        }
    }

    /// A hidden sequence point in `document`.
    #[must_use]
    pub fn hidden(document: u32) -> Self {
        SequencePoint::new(document, HIDDEN_LINE, 0, HIDDEN_LINE, 0)
    }

    /// Returns true if this point hides its instructions.
    #[must_use]
    pub fn is_hidden(&self) -> bool {
        self.start_line == HIDDEN_LINE
    }
}

/// A source document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Document {
    /// Path of the document as recorded by the compiler
    pub name: String,
    /// Algorithm of `hash`, null if the document carries no hash
    pub hash_algorithm: uguid::Guid,
    /// Checksum of the source file
    pub hash: Vec<u8>,
    /// Source language
    pub language: uguid::Guid,
}

impl Document {
    /// A C# document without a checksum.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Document {
            name: name.into(),
            hash_algorithm: uguid::Guid::ZERO,
            hash: Vec::new(),
            language: LANGUAGE_CSHARP,
        }
    }
}

/// The kind of a symbol blob, determined by its signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolFormat {
    /// Portable PDB, a metadata root
    Portable,
    /// Compressed portable PDB as embedded into an image
    Embedded,
    /// Legacy native MSF file, which cannot be written back
    Native,
    /// Anything else
    Unknown,
}

impl SymbolFormat {
    /// Determine the format of `data` from its leading bytes.
    #[must_use]
    pub fn detect(data: &[u8]) -> SymbolFormat {
        if data.starts_with(b"BSJB") {
            SymbolFormat::Portable
        } else if data.starts_with(&EMBEDDED_MAGIC) {
            SymbolFormat::Embedded
        } else if data.starts_with(NATIVE_SIGNATURE) {
            SymbolFormat::Native
        } else {
            SymbolFormat::Unknown
        }
    }
}

/// Parse a sidecar or embedded symbol blob.
///
/// # Errors
/// Returns [`Error::NotSupported`] for native and unknown formats, and a parse error if the
/// portable stream is damaged.
pub fn read_symbols(data: &[u8]) -> Result<PortableSymbols> {
    match SymbolFormat::detect(data) {
        SymbolFormat::Portable => PortableSymbols::parse(data),
        SymbolFormat::Embedded => PortableSymbols::parse(&decompress(data)?),
        SymbolFormat::Native | SymbolFormat::Unknown => Err(Error::NotSupported),
    }
}

/// Attach sequence points to the instructions of `image`.
///
/// Either every point is attached or the image is left untouched.
///
/// # Errors
/// Returns an error if the symbols belong to a different image (see [`Image::pdb_id`]), a
/// method token does not name a method with a body, or a point does not sit on an
/// instruction boundary.
pub fn attach(image: &mut Image, symbols: &PortableSymbols) -> Result<()> {
    let pdb_id = image.pdb_id();
    if symbols.pdb_id != pdb_id {
        return Err(malformed_error!(
            "Symbols {}/{:#x} do not belong to image {}/{:#x}",
            symbols.pdb_id.guid,
            symbols.pdb_id.stamp,
            pdb_id.guid,
            pdb_id.stamp
        ));
    }

    let mut staged = Vec::with_capacity(symbols.point_count());
    for method in &symbols.methods {
        let index = method_index(image, method.method)?;
        let Some(body) = image.methods[index].body.as_ref() else {
            return Err(malformed_error!(
                "Symbols reference {} which has no body",
                method.method
            ));
        };

        // Untouched bodies lay out at their original offsets
        let offsets = layout(&body.instructions)?.offsets;
        let code = &offsets[..offsets.len() - 1];

        for (il_offset, point) in &method.points {
            let Ok(instruction) = code.binary_search(il_offset) else {
                return Err(malformed_error!(
                    "Sequence point at IL_{:04x} of {} is not on an instruction",
                    il_offset,
                    method.method
                ));
            };
            staged.push((index, instruction, point.clone()));
        }
    }

    for (method, instruction, point) in staged {
        if let Some(body) = image.methods[method].body.as_mut() {
            body.instructions[instruction].sequence_point = Some(point);
        }
    }

    Ok(())
}

/// Collect the sequence points of `image` keyed by the offsets of a written layout.
///
/// `layouts` is the per method output of [`Image::to_bytes`]. Documents and the entry point
/// are taken from `source`, the symbols the image was loaded with. The result carries the
/// pdb id and table row counts of the written image.
///
/// # Errors
/// Returns an error if `layouts` does not match the methods of `image`.
pub fn extract(
    image: &Image,
    layouts: &[Option<Layout>],
    source: &PortableSymbols,
) -> Result<PortableSymbols> {
    if layouts.len() != image.methods.len() {
        return Err(malformed_error!(
            "{} layouts for {} methods",
            layouts.len(),
            image.methods.len()
        ));
    }

    let mut methods = Vec::new();
    for (index, (method, layout)) in image.methods.iter().zip(layouts).enumerate() {
        let (Some(body), Some(layout)) = (&method.body, layout) else {
            continue;
        };

        let points: Vec<(u32, SequencePoint)> = body
            .instructions
            .iter()
            .zip(&layout.offsets)
            .filter_map(|(instruction, offset)| {
                instruction
                    .sequence_point
                    .as_ref()
                    .map(|point| (*offset, point.clone()))
            })
            .collect();

        if points.is_empty() {
            continue;
        }

        let Some(token) = image.method_token(index) else {
            continue;
        };
        methods.push(MethodSymbols::new(token, points));
    }

    Ok(PortableSymbols {
        pdb_id: image.pdb_id(),
        entry_point: source.entry_point,
        type_system_rows: image.table_rows(),
        documents: source.documents.clone(),
        methods,
    })
}

fn method_index(image: &Image, token: Token) -> Result<usize> {
    if token.table() == Token::METHOD_DEF {
        if let Some(index) = token.index().filter(|index| *index < image.methods.len()) {
            return Ok(index);
        }
    }
    Err(malformed_error!("Symbols reference unknown method {}", token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{opcodes, Immediate, Instruction, Operand},
        test::ImageBuilder,
    };

    fn image() -> Image {
        ImageBuilder::new("Loader")
            .type_def("Loader", "Loader")
            .method(
                "Run",
                vec![
                    Instruction::new(opcodes::LDC_I4_S, Operand::Immediate(Immediate::Int8(5))),
                    Instruction::new(opcodes::POP, Operand::None),
                    Instruction::new(opcodes::BR_S, Operand::Target(3)),
                    Instruction::ret(),
                ],
            )
            .build()
    }

    fn symbols(image: &Image) -> PortableSymbols {
        let mut symbols = PortableSymbols::new(image.pdb_id(), vec![Document::new("Loader.cs")]);
        symbols.type_system_rows = image.table_rows();
        symbols.methods = vec![MethodSymbols::new(
            Token::new(0x0600_0001),
            vec![
                (0, SequencePoint::new(0, 10, 5, 10, 20)),
                (3, SequencePoint::new(0, 11, 5, 11, 12)),
                (5, SequencePoint::hidden(0)),
            ],
        )];
        symbols
    }

    #[test]
    fn detect_formats() {
        assert_eq!(SymbolFormat::detect(b"BSJB\x01\x00"), SymbolFormat::Portable);
        assert_eq!(SymbolFormat::detect(b"MPDB\x00\x00"), SymbolFormat::Embedded);
        assert_eq!(SymbolFormat::detect(NATIVE_SIGNATURE), SymbolFormat::Native);
        assert_eq!(SymbolFormat::detect(b"MZ\x90\x00"), SymbolFormat::Unknown);
        assert_eq!(SymbolFormat::detect(b""), SymbolFormat::Unknown);

        let mut native = NATIVE_SIGNATURE.to_vec();
        native.extend_from_slice(&[0; 32]);
        assert!(matches!(read_symbols(&native), Err(Error::NotSupported)));
    }

    #[test]
    fn embedded_stream() {
        let image = image();
        let portable = symbols(&image).to_bytes().unwrap();
        let entry = compress(&portable).unwrap();
        assert_eq!(read_symbols(&entry).unwrap(), symbols(&image));
    }

    #[test]
    fn attach_then_extract_unchanged() {
        let mut image = image();
        let portable = symbols(&image);
        attach(&mut image, &portable).unwrap();

        let body = image.methods[0].body.as_ref().unwrap();
        assert!(body.instructions[1].sequence_point.is_none());
        assert_eq!(body.instructions[2].sequence_point.as_ref().unwrap().start_line, 11);

        let written = image.to_bytes().unwrap();
        let extracted = extract(&image, &written.layouts, &portable).unwrap();
        assert_eq!(extracted, portable);
    }

    #[test]
    fn points_follow_rewritten_code() {
        let mut image = image();
        let portable = symbols(&image);
        attach(&mut image, &portable).unwrap();

        // Insert a nop in front; every point moves one byte, the branch target index shifts
        let body = image.methods[0].body.as_mut().unwrap();
        body.instructions.insert(0, Instruction::new(opcodes::NOP, Operand::None));
        body.instructions[3].operand = Operand::Target(4);
        // Drop the pop, which carried no point
        body.instructions.remove(2);
        body.instructions[2].operand = Operand::Target(3);

        let written = image.to_bytes().unwrap();
        let extracted = extract(&image, &written.layouts, &portable).unwrap();
        let offsets: Vec<u32> = extracted.methods[0].points.iter().map(|(o, _)| *o).collect();
        assert_eq!(offsets, vec![1, 3, 5]);
    }

    #[test]
    fn attach_is_all_or_nothing() {
        let mut image = image();
        let mut portable = symbols(&image);
        portable.methods[0].points.push((4, SequencePoint::new(0, 12, 1, 12, 2)));

        assert!(attach(&mut image, &portable).is_err());
        let body = image.methods[0].body.as_ref().unwrap();
        assert!(body.instructions.iter().all(|i| i.sequence_point.is_none()));
    }

    #[test]
    fn attach_rejects_foreign_symbols() {
        let mut image = image();
        let mut portable = symbols(&image);
        portable.pdb_id.stamp = 1;
        assert!(attach(&mut image, &portable).is_err());

        let mut portable = symbols(&image);
        portable.methods[0].method = Token::new(0x0600_0009);
        assert!(attach(&mut image, &portable).is_err());
    }
}
