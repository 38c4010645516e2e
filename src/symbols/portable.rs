//! Portable PDB streams.
//!
//! A portable PDB is an ECMA-335 metadata root (`BSJB`) with a `#Pdb` stream in front of
//! the usual table stream and heaps:
//!
//! ```text
//! #Pdb     pdb id (guid + stamp) | entry point | referenced type system tables | row counts
//! #~       Document, MethodDebugInformation, ...
//! #Blob    document names, hashes, sequence point blobs
//! #GUID    hash algorithms and languages
//! ```
//!
//! Documents and sequence points are read and written. Local scopes, imports and custom
//! debug information are dropped on write: their IL ranges describe the original bodies.

use crate::{
    file::{parser::Parser, writer::Writer},
    image::{PdbId, Token},
    metadata::{
        root::Root,
        streams::{Blob, BlobBuilder, Guid, GuidBuilder, StringsBuilder, UserStringsBuilder},
        tables::{heap_sizes, RowCounts, TableId, TablesStream, TABLE_SLOTS},
    },
    symbols::{Document, SequencePoint},
    Error, Result,
};

/// Version string in the metadata root of a portable PDB.
pub const PDB_VERSION: &str = "PDB v1.0";

/// Sequence points of one method, keyed by IL offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSymbols {
    /// `MethodDef` token of the method
    pub method: Token,
    /// `StandAloneSig` row of the local variable signature, 0 for none
    pub local_signature: u32,
    /// `(il_offset, point)` pairs in ascending offset order
    pub points: Vec<(u32, SequencePoint)>,
}

impl MethodSymbols {
    /// Points for `method` without a local signature.
    #[must_use]
    pub fn new(method: Token, points: Vec<(u32, SequencePoint)>) -> Self {
        MethodSymbols {
            method,
            local_signature: 0,
            points,
        }
    }
}

/// A parsed portable PDB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortableSymbols {
    /// Id of the image these symbols belong to, see [`crate::image::Image::pdb_id`]
    pub pdb_id: PdbId,
    /// `MethodDef` token of the entry point, null for libraries
    pub entry_point: Token,
    /// Row counts of the type system tables of the image
    pub type_system_rows: RowCounts,
    /// Source documents referenced by sequence points
    pub documents: Vec<Document>,
    /// Per method sequence points
    pub methods: Vec<MethodSymbols>,
}

impl PortableSymbols {
    /// Symbols without methods.
    #[must_use]
    pub fn new(pdb_id: PdbId, documents: Vec<Document>) -> Self {
        PortableSymbols {
            pdb_id,
            entry_point: Token::default(),
            type_system_rows: [0; TABLE_SLOTS],
            documents,
            methods: Vec::new(),
        }
    }

    /// Parse a portable PDB.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] if `data` is not a metadata root with a `#Pdb` stream,
    /// and a parse error for truncated or inconsistent streams.
    pub fn parse(data: &[u8]) -> Result<PortableSymbols> {
        if !data.starts_with(b"BSJB") {
            return Err(Error::NotSupported);
        }

        let root = Root::read(data)?;
        let Some(pdb) = root.stream(data, "#Pdb") else {
            return Err(Error::NotSupported);
        };

        let mut parser = Parser::new(pdb);
        let mut guid = [0u8; 16];
        guid.copy_from_slice(parser.read_bytes(16)?);
        let pdb_id = PdbId {
            guid: uguid::Guid::from_bytes(guid),
            stamp: parser.read_le()?,
        };
        let entry_point = Token::new(parser.read_le()?);
        let referenced = parser.read_le::<u64>()?;

        let mut type_system_rows = [0u32; TABLE_SLOTS];
        for (slot, rows) in type_system_rows.iter_mut().enumerate() {
            if referenced & (1 << slot) != 0 {
                *rows = parser.read_le()?;
            }
        }

        let Some(tables) = root.stream(data, "#~") else {
            return Err(malformed_error!("Portable PDB has no table stream"));
        };
        let tables = TablesStream::read(tables, Some(&type_system_rows))?;
        let blob = Blob::from(root.stream(data, "#Blob").unwrap_or(&[0][..]))?;
        let guids = Guid::from(root.stream(data, "#GUID").unwrap_or_default())?;

        let mut documents = Vec::with_capacity(tables.rows(TableId::Document).len());
        for row in tables.rows(TableId::Document) {
            documents.push(Document {
                name: read_document_name(blob.get(row[0] as usize)?, &blob)?,
                hash_algorithm: guids.get(row[1] as usize)?,
                hash: blob.get(row[2] as usize)?.to_vec(),
                language: guids.get(row[3] as usize)?,
            });
        }

        let mut methods = Vec::new();
        for (index, row) in tables
            .rows(TableId::MethodDebugInformation)
            .iter()
            .enumerate()
        {
            if row[1] == 0 {
                continue;
            }

            let Some(method) = Token::from_index(Token::METHOD_DEF, index) else {
                return Err(malformed_error!("Too many MethodDebugInformation rows"));
            };
            let (local_signature, points) =
                read_sequence_points(blob.get(row[1] as usize)?, row[0], documents.len())
                    .map_err(|e| malformed_error!("Sequence points of {}: {}", method, e))?;

            if !points.is_empty() {
                methods.push(MethodSymbols {
                    method,
                    local_signature,
                    points,
                });
            }
        }

        Ok(PortableSymbols {
            pdb_id,
            entry_point,
            type_system_rows,
            documents,
            methods,
        })
    }

    /// Serialize the symbols as a standalone portable PDB.
    ///
    /// # Errors
    /// Returns an error if a point references a missing document, points are not in
    /// ascending offset order, a visible point has an empty or inverted range, or a value is
    /// too large for its encoding.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut blob = BlobBuilder::new();
        let mut guids = GuidBuilder::new();
        let mut tables = TablesStream::new();

        for document in &self.documents {
            let row = vec![
                write_document_name(&document.name, &mut blob)?,
                guids.add(document.hash_algorithm)?,
                blob.add(&document.hash)?,
                guids.add(document.language)?,
            ];
            tables.rows_mut(TableId::Document).push(row);
        }

        let mut method_rows = self.type_system_rows[TableId::MethodDef as usize] as usize;
        let mut encoded = Vec::with_capacity(self.methods.len());
        for method in &self.methods {
            let index = match method.method.index() {
                Some(index) if method.method.table() == Token::METHOD_DEF => index,
                _ => {
                    return Err(malformed_error!(
                        "Symbols reference {} which is not a method",
                        method.method
                    ))
                }
            };
            method_rows = method_rows.max(index + 1);
            if method.points.is_empty() {
                continue;
            }

            let (document, points) = write_sequence_points(method, self.documents.len())?;
            encoded.push((index, vec![document, blob.add(&points)?]));
        }

        let debug_rows = tables.rows_mut(TableId::MethodDebugInformation);
        debug_rows.resize(method_rows, vec![0, 0]);
        for (index, row) in encoded {
            debug_rows[index] = row;
        }

        let mut pdb = Writer::with_capacity(128);
        pdb.write_bytes(&self.pdb_id.guid.to_bytes());
        pdb.write_le(self.pdb_id.stamp);
        pdb.write_le(self.entry_point.value());

        let mut referenced = 0u64;
        for (slot, rows) in self.type_system_rows.iter().enumerate() {
            if slot < TableId::Document as usize && *rows > 0 {
                referenced |= 1 << slot;
            }
        }
        pdb.write_le(referenced);
        for (slot, rows) in self.type_system_rows.iter().enumerate() {
            if referenced & (1 << slot) != 0 {
                pdb.write_le(*rows);
            }
        }

        let strings = StringsBuilder::new();
        let sizes = heap_sizes(strings.len(), guids.len(), blob.len());
        let table_bytes = tables.write(sizes, Some(&self.type_system_rows))?;
        let pdb = pdb.into_inner();
        let strings = strings.into_bytes();
        let user_strings = UserStringsBuilder::new().into_bytes();
        let guids = guids.into_bytes();
        let blob = blob.into_bytes();

        Root::write(
            PDB_VERSION,
            &[
                ("#Pdb", pdb.as_slice()),
                ("#~", table_bytes.as_slice()),
                ("#Strings", strings.as_slice()),
                ("#US", user_strings.as_slice()),
                ("#GUID", guids.as_slice()),
                ("#Blob", blob.as_slice()),
            ],
        )
    }

    /// Total number of sequence points.
    #[must_use]
    pub fn point_count(&self) -> usize {
        self.methods.iter().map(|m| m.points.len()).sum()
    }
}

/// Document names are stored as a separator byte followed by blob indices of the parts.
fn read_document_name(data: &[u8], blob: &Blob) -> Result<String> {
    let mut parser = Parser::new(data);
    let separator = parser.read_le::<u8>()?;

    let mut name = Vec::with_capacity(data.len() * 4);
    let mut first = true;
    while parser.has_more_data() {
        if !first && separator != 0 {
            name.push(separator);
        }
        first = false;
        name.extend_from_slice(blob.get(parser.read_compressed_uint()? as usize)?);
    }

    String::from_utf8(name).map_err(|e| malformed_error!("Document name is not UTF-8: {}", e))
}

fn write_document_name(name: &str, blob: &mut BlobBuilder) -> Result<u32> {
    let separator = [b'/', b'\\']
        .into_iter()
        .find(|separator| name.as_bytes().contains(separator));

    let mut writer = Writer::new();
    match separator {
        Some(separator) => {
            writer.write_le(separator);
            for part in name.split(char::from(separator)) {
                writer.write_compressed_uint(blob.add(part.as_bytes())?)?;
            }
        }
        None => {
            writer.write_le(0_u8);
            writer.write_compressed_uint(blob.add(name.as_bytes())?)?;
        }
    }

    blob.add(&writer.into_inner())
}

/// Decode a sequence points blob. `document_row` is the `Document` column of the method,
/// 0 when the blob names its initial document.
fn read_sequence_points(
    data: &[u8],
    document_row: u32,
    documents: usize,
) -> Result<(u32, Vec<(u32, SequencePoint)>)> {
    let mut parser = Parser::new(data);
    let local_signature = parser.read_compressed_uint()?;
    let mut document = match document_row {
        0 => parser.read_compressed_uint()?,
        row => row,
    };

    let mut points: Vec<(u32, SequencePoint)> = Vec::new();
    let mut il_offset = 0u32;
    let mut previous: Option<(u32, u16)> = None;
    while parser.has_more_data() {
        let delta_il = parser.read_compressed_uint()?;
        if delta_il == 0 && !points.is_empty() {
            document = parser.read_compressed_uint()?;
            continue;
        }

        il_offset = if points.is_empty() {
            delta_il
        } else {
            il_offset
                .checked_add(delta_il)
                .ok_or_else(|| malformed_error!("IL offset overflows"))?
        };

        let Some(index) = (document as usize)
            .checked_sub(1)
            .filter(|index| *index < documents)
        else {
            return Err(malformed_error!("Document {} does not exist", document));
        };
        let index = u32::try_from(index).map_err(|_| malformed_error!("Too many documents"))?;

        let delta_lines = parser.read_compressed_uint()?;
        let delta_columns = if delta_lines == 0 {
            i64::from(parser.read_compressed_uint()?)
        } else {
            i64::from(parser.read_compressed_int()?)
        };

        if delta_lines == 0 && delta_columns == 0 {
            points.push((il_offset, SequencePoint::hidden(index)));
            continue;
        }

        let (start_line, start_column) = match previous {
            None => (
                i64::from(parser.read_compressed_uint()?),
                i64::from(parser.read_compressed_uint()?),
            ),
            Some((line, column)) => (
                i64::from(line) + i64::from(parser.read_compressed_int()?),
                i64::from(column) + i64::from(parser.read_compressed_int()?),
            ),
        };

        let point = SequencePoint::new(
            index,
            line(start_line)?,
            column(start_column)?,
            line(start_line + i64::from(delta_lines))?,
            column(start_column + delta_columns)?,
        );
        previous = Some((point.start_line, point.start_column));
        points.push((il_offset, point));
    }

    Ok((local_signature, points))
}

/// Encode the points of `method`, returning the `Document` column value and the blob.
fn write_sequence_points(method: &MethodSymbols, documents: usize) -> Result<(u32, Vec<u8>)> {
    let Some((_, first)) = method.points.first() else {
        return Ok((0, Vec::new()));
    };
    let single = method
        .points
        .iter()
        .all(|(_, point)| point.document == first.document);

    let mut writer = Writer::with_capacity(method.points.len() * 6 + 2);
    writer.write_compressed_uint(method.local_signature)?;
    if !single {
        writer.write_compressed_uint(first.document + 1)?;
    }

    let mut document = first.document;
    let mut previous_offset: Option<u32> = None;
    let mut previous: Option<(u32, u16)> = None;
    for (offset, point) in &method.points {
        if point.document as usize >= documents {
            return Err(malformed_error!(
                "Sequence point of {} references document {} of {}",
                method.method,
                point.document,
                documents
            ));
        }
        if previous_offset.is_some_and(|last| last >= *offset) {
            return Err(malformed_error!(
                "Sequence points of {} are not in ascending offset order",
                method.method
            ));
        }

        if point.document != document {
            writer.write_compressed_uint(0)?;
            writer.write_compressed_uint(point.document + 1)?;
            document = point.document;
        }

        writer.write_compressed_uint(previous_offset.map_or(*offset, |last| offset - last))?;
        previous_offset = Some(*offset);

        if point.is_hidden() {
            writer.write_compressed_uint(0)?;
            writer.write_compressed_uint(0)?;
            continue;
        }

        let Some(delta_lines) = point.end_line.checked_sub(point.start_line) else {
            return Err(malformed_error!(
                "Sequence point at IL_{:04x} of {} ends before it starts",
                offset,
                method.method
            ));
        };
        let delta_columns = i32::from(point.end_column) - i32::from(point.start_column);
        writer.write_compressed_uint(delta_lines)?;
        if delta_lines == 0 {
            match u32::try_from(delta_columns) {
                Ok(columns) if columns > 0 => writer.write_compressed_uint(columns)?,
                _ => {
                    return Err(malformed_error!(
                        "Sequence point at IL_{:04x} of {} covers no columns",
                        offset,
                        method.method
                    ))
                }
            }
        } else {
            writer.write_compressed_int(delta_columns)?;
        }

        match previous {
            None => {
                writer.write_compressed_uint(point.start_line)?;
                writer.write_compressed_uint(u32::from(point.start_column))?;
            }
            Some((line, column)) => {
                writer.write_compressed_int(signed_delta(point.start_line, line)?)?;
                writer.write_compressed_int(
                    i32::from(point.start_column) - i32::from(column),
                )?;
            }
        }
        previous = Some((point.start_line, point.start_column));
    }

    let document = if single { first.document + 1 } else { 0 };
    Ok((document, writer.into_inner()))
}

fn signed_delta(value: u32, base: u32) -> Result<i32> {
    i32::try_from(i64::from(value) - i64::from(base))
        .map_err(|_| malformed_error!("Line delta {} - {} is out of range", value, base))
}

fn line(value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| malformed_error!("Line {} is out of range", value))
}

fn column(value: i64) -> Result<u16> {
    u16::try_from(value).map_err(|_| malformed_error!("Column {} is out of range", value))
}
