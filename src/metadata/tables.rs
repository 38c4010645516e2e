//! The compressed table stream (`#~`, ECMA-335 II.24.2.6).
//!
//! [`TablesStream`] reads every present table into raw rows: one `u32` per column, with heap
//! offsets, simple indices and coded indices stored exactly as they appear in the stream.
//! Column widths depend on the row counts and heap sizes of the stream they are written to,
//! so [`TablesStream::write`] recomputes them from the current rows. Tables this crate does
//! not interpret survive a read/write cycle unchanged.

use strum::{EnumCount, EnumIter, IntoEnumIterator};

use crate::{
    file::{parser::Parser, writer::Writer},
    image::Token,
    Error, Result,
};

/// Number of table slots in the `Valid` bit vector.
pub const TABLE_SLOTS: usize = 64;

/// Row counts for every table slot.
pub type RowCounts = [u32; TABLE_SLOTS];

/// Heap size flag: `#Strings` indices are 4 bytes wide.
pub const HEAP_LARGE_STRINGS: u8 = 0x01;
/// Heap size flag: `#GUID` indices are 4 bytes wide.
pub const HEAP_LARGE_GUID: u8 = 0x02;
/// Heap size flag: `#Blob` indices are 4 bytes wide.
pub const HEAP_LARGE_BLOB: u8 = 0x04;
/// Heap size flag: an extra 4 bytes follow the row counts.
const HEAP_EXTRA_DATA: u8 = 0x40;

/// The `HeapSizes` flags for heaps of the given byte sizes.
#[must_use]
pub fn heap_sizes(strings: usize, guid: usize, blob: usize) -> u8 {
    let mut sizes = 0;
    if strings > 0xFFFF {
        sizes |= HEAP_LARGE_STRINGS;
    }
    if guid > 0xFFFF {
        sizes |= HEAP_LARGE_GUID;
    }
    if blob > 0xFFFF {
        sizes |= HEAP_LARGE_BLOB;
    }
    sizes
}

/// Metadata tables, including the tables of portable symbol streams.
///
/// ## Reference
/// * '<https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf>' - II.22
/// * Portable PDB v1.0, Metadata Tables
#[allow(missing_docs)]
#[derive(Clone, Copy, PartialEq, Debug, EnumIter, EnumCount, Eq, Hash)]
#[repr(u8)]
pub enum TableId {
    Module = 0x00,
    TypeRef = 0x01,
    TypeDef = 0x02,
    FieldPtr = 0x03,
    Field = 0x04,
    MethodPtr = 0x05,
    MethodDef = 0x06,
    ParamPtr = 0x07,
    Param = 0x08,
    InterfaceImpl = 0x09,
    MemberRef = 0x0A,
    Constant = 0x0B,
    CustomAttribute = 0x0C,
    FieldMarshal = 0x0D,
    DeclSecurity = 0x0E,
    ClassLayout = 0x0F,
    FieldLayout = 0x10,
    StandAloneSig = 0x11,
    EventMap = 0x12,
    EventPtr = 0x13,
    Event = 0x14,
    PropertyMap = 0x15,
    PropertyPtr = 0x16,
    Property = 0x17,
    MethodSemantics = 0x18,
    MethodImpl = 0x19,
    ModuleRef = 0x1A,
    TypeSpec = 0x1B,
    ImplMap = 0x1C,
    FieldRVA = 0x1D,
    EncLog = 0x1E,
    EncMap = 0x1F,
    Assembly = 0x20,
    AssemblyProcessor = 0x21,
    AssemblyOS = 0x22,
    AssemblyRef = 0x23,
    AssemblyRefProcessor = 0x24,
    AssemblyRefOS = 0x25,
    File = 0x26,
    ExportedType = 0x27,
    ManifestResource = 0x28,
    NestedClass = 0x29,
    GenericParam = 0x2A,
    MethodSpec = 0x2B,
    GenericParamConstraint = 0x2C,
    Document = 0x30,
    MethodDebugInformation = 0x31,
    LocalScope = 0x32,
    LocalVariable = 0x33,
    LocalConstant = 0x34,
    ImportScope = 0x35,
    StateMachineMethod = 0x36,
    CustomDebugInformation = 0x37,
}

/// The width and meaning of one table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Two byte constant
    U16,
    /// Four byte constant
    U32,
    /// `#Strings` offset
    Str,
    /// 1-based `#GUID` index
    Guid,
    /// `#Blob` offset
    Blob,
    /// 1-based row of the given table
    Index(TableId),
    /// Coded index
    Coded(CodedIndexType),
}

impl TableId {
    /// The table with id `id`.
    #[must_use]
    pub fn from_id(id: u8) -> Option<TableId> {
        TableId::iter().find(|table| *table as u8 == id)
    }

    /// The column layout of this table.
    #[must_use]
    #[allow(clippy::enum_glob_use)]
    pub fn columns(self) -> &'static [ColumnKind] {
        use CodedIndexType as C;
        use ColumnKind::*;

        match self {
            TableId::Module => &[U16, Str, Guid, Guid, Guid],
            TableId::TypeRef => &[Coded(C::ResolutionScope), Str, Str],
            TableId::TypeDef => &[
                U32,
                Str,
                Str,
                Coded(C::TypeDefOrRef),
                Index(TableId::Field),
                Index(TableId::MethodDef),
            ],
            TableId::FieldPtr => &[Index(TableId::Field)],
            TableId::Field => &[U16, Str, Blob],
            TableId::MethodPtr => &[Index(TableId::MethodDef)],
            TableId::MethodDef => &[U32, U16, U16, Str, Blob, Index(TableId::Param)],
            TableId::ParamPtr => &[Index(TableId::Param)],
            TableId::Param => &[U16, U16, Str],
            TableId::InterfaceImpl => &[Index(TableId::TypeDef), Coded(C::TypeDefOrRef)],
            TableId::MemberRef => &[Coded(C::MemberRefParent), Str, Blob],
            // Type byte plus padding byte
            TableId::Constant => &[U16, Coded(C::HasConstant), Blob],
            TableId::CustomAttribute => &[
                Coded(C::HasCustomAttribute),
                Coded(C::CustomAttributeType),
                Blob,
            ],
            TableId::FieldMarshal => &[Coded(C::HasFieldMarshal), Blob],
            TableId::DeclSecurity => &[U16, Coded(C::HasDeclSecurity), Blob],
            TableId::ClassLayout => &[U16, U32, Index(TableId::TypeDef)],
            TableId::FieldLayout => &[U32, Index(TableId::Field)],
            TableId::StandAloneSig => &[Blob],
            TableId::EventMap => &[Index(TableId::TypeDef), Index(TableId::Event)],
            TableId::EventPtr => &[Index(TableId::Event)],
            TableId::Event => &[U16, Str, Coded(C::TypeDefOrRef)],
            TableId::PropertyMap => &[Index(TableId::TypeDef), Index(TableId::Property)],
            TableId::PropertyPtr => &[Index(TableId::Property)],
            TableId::Property => &[U16, Str, Blob],
            TableId::MethodSemantics => &[
                U16,
                Index(TableId::MethodDef),
                Coded(C::HasSemantics),
            ],
            TableId::MethodImpl => &[
                Index(TableId::TypeDef),
                Coded(C::MethodDefOrRef),
                Coded(C::MethodDefOrRef),
            ],
            TableId::ModuleRef => &[Str],
            TableId::TypeSpec => &[Blob],
            TableId::ImplMap => &[
                U16,
                Coded(C::MemberForwarded),
                Str,
                Index(TableId::ModuleRef),
            ],
            TableId::FieldRVA => &[U32, Index(TableId::Field)],
            TableId::EncLog => &[U32, U32],
            TableId::EncMap => &[U32],
            TableId::Assembly => &[U32, U16, U16, U16, U16, U32, Blob, Str, Str],
            TableId::AssemblyProcessor => &[U32],
            TableId::AssemblyOS => &[U32, U32, U32],
            TableId::AssemblyRef => &[U16, U16, U16, U16, U32, Blob, Str, Str, Blob],
            TableId::AssemblyRefProcessor => &[U32, Index(TableId::AssemblyRef)],
            TableId::AssemblyRefOS => &[U32, U32, U32, Index(TableId::AssemblyRef)],
            TableId::File => &[U32, Str, Blob],
            TableId::ExportedType => &[U32, U32, Str, Str, Coded(C::Implementation)],
            TableId::ManifestResource => &[U32, U32, Str, Coded(C::Implementation)],
            TableId::NestedClass => &[Index(TableId::TypeDef), Index(TableId::TypeDef)],
            TableId::GenericParam => &[U16, U16, Coded(C::TypeOrMethodDef), Str],
            TableId::MethodSpec => &[Coded(C::MethodDefOrRef), Blob],
            TableId::GenericParamConstraint => &[
                Index(TableId::GenericParam),
                Coded(C::TypeDefOrRef),
            ],
            TableId::Document => &[Blob, Guid, Blob, Guid],
            TableId::MethodDebugInformation => &[Index(TableId::Document), Blob],
            TableId::LocalScope => &[
                Index(TableId::MethodDef),
                Index(TableId::ImportScope),
                Index(TableId::LocalVariable),
                Index(TableId::LocalConstant),
                U32,
                U32,
            ],
            TableId::LocalVariable => &[U16, U16, Str],
            TableId::LocalConstant => &[Str, Blob],
            TableId::ImportScope => &[Index(TableId::ImportScope), Blob],
            TableId::StateMachineMethod => &[Index(TableId::MethodDef), Index(TableId::MethodDef)],
            TableId::CustomDebugInformation => &[
                Coded(C::HasCustomDebugInformation),
                Guid,
                Blob,
            ],
        }
    }
}

/// Represents all possible coded index types
///
/// ## Reference
/// * '<https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf>' - II.24.2.6
#[derive(Debug, Hash, Eq, PartialEq, Clone, Copy, EnumIter, EnumCount)]
pub enum CodedIndexType {
    /// `TypeDef`, `TypeRef`, `TypeSpec`
    TypeDefOrRef,
    /// `Field`, `Param`, `Property`
    HasConstant,
    /// Every table a custom attribute can be applied to
    HasCustomAttribute,
    /// `Field`, `Param`
    HasFieldMarshal,
    /// `TypeDef`, `MethodDef`, `Assembly`
    HasDeclSecurity,
    /// `TypeDef`, `TypeRef`, `ModuleRef`, `MethodDef`, `TypeSpec`
    MemberRefParent,
    /// `Event`, `Property`
    HasSemantics,
    /// `MethodDef`, `MemberRef`
    MethodDefOrRef,
    /// `Field`, `MethodDef`
    MemberForwarded,
    /// `File`, `AssemblyRef`, `ExportedType`
    Implementation,
    /// `MethodDef`, `MemberRef`
    CustomAttributeType,
    /// `Module`, `ModuleRef`, `AssemblyRef`, `TypeRef`
    ResolutionScope,
    /// `TypeDef`, `MethodDef`
    TypeOrMethodDef,
    /// Every table custom debug information can be attached to
    HasCustomDebugInformation,
}

impl CodedIndexType {
    /// Lookup table for coded combinations of the various types and their table IDs
    #[must_use]
    pub fn tables(&self) -> &'static [TableId] {
        match self {
            CodedIndexType::TypeDefOrRef => {
                &[TableId::TypeDef, TableId::TypeRef, TableId::TypeSpec]
            }
            CodedIndexType::HasConstant => &[TableId::Field, TableId::Param, TableId::Property],
            CodedIndexType::HasCustomAttribute => &[
                TableId::MethodDef,
                TableId::Field,
                TableId::TypeRef,
                TableId::TypeDef,
                TableId::Param,
                TableId::InterfaceImpl,
                TableId::MemberRef,
                TableId::Module,
                TableId::DeclSecurity,
                TableId::Property,
                TableId::Event,
                TableId::StandAloneSig,
                TableId::ModuleRef,
                TableId::TypeSpec,
                TableId::Assembly,
                TableId::AssemblyRef,
                TableId::File,
                TableId::ExportedType,
                TableId::ManifestResource,
                TableId::GenericParam,
                TableId::GenericParamConstraint,
                TableId::MethodSpec,
            ],
            CodedIndexType::HasFieldMarshal => &[TableId::Field, TableId::Param],
            CodedIndexType::HasDeclSecurity => {
                &[TableId::TypeDef, TableId::MethodDef, TableId::Assembly]
            }
            CodedIndexType::MemberRefParent => &[
                TableId::TypeDef,
                TableId::TypeRef,
                TableId::ModuleRef,
                TableId::MethodDef,
                TableId::TypeSpec,
            ],
            CodedIndexType::HasSemantics => &[TableId::Event, TableId::Property],
            CodedIndexType::MethodDefOrRef => &[TableId::MethodDef, TableId::MemberRef],
            CodedIndexType::MemberForwarded => &[TableId::Field, TableId::MethodDef],
            CodedIndexType::Implementation => {
                &[TableId::File, TableId::AssemblyRef, TableId::ExportedType]
            }
            // Tags 0, 1 and 4 are unused. Module holds a single row, so it never widens
            // the column.
            CodedIndexType::CustomAttributeType => &[
                TableId::Module,
                TableId::Module,
                TableId::MethodDef,
                TableId::MemberRef,
                TableId::Module,
            ],
            CodedIndexType::ResolutionScope => &[
                TableId::Module,
                TableId::ModuleRef,
                TableId::AssemblyRef,
                TableId::TypeRef,
            ],
            CodedIndexType::TypeOrMethodDef => &[TableId::TypeDef, TableId::MethodDef],
            CodedIndexType::HasCustomDebugInformation => &[
                TableId::MethodDef,
                TableId::Field,
                TableId::TypeRef,
                TableId::TypeDef,
                TableId::Param,
                TableId::InterfaceImpl,
                TableId::MemberRef,
                TableId::Module,
                TableId::DeclSecurity,
                TableId::Property,
                TableId::Event,
                TableId::StandAloneSig,
                TableId::ModuleRef,
                TableId::TypeSpec,
                TableId::Assembly,
                TableId::AssemblyRef,
                TableId::File,
                TableId::ExportedType,
                TableId::ManifestResource,
                TableId::GenericParam,
                TableId::GenericParamConstraint,
                TableId::MethodSpec,
                TableId::Document,
                TableId::LocalScope,
                TableId::LocalVariable,
                TableId::LocalConstant,
                TableId::ImportScope,
            ],
        }
    }

    /// Number of low bits holding the table tag.
    #[must_use]
    pub fn tag_bits(&self) -> u32 {
        let count = self.tables().len();
        usize::BITS - (count - 1).leading_zeros()
    }

    /// Encode `token` as a value of this coded index. The null token encodes as 0.
    ///
    /// # Errors
    /// Returns an error if the token's table is not part of this coded index.
    pub fn encode(&self, token: Token) -> Result<u32> {
        if token.is_null() {
            return Ok(0);
        }

        let Some(tag) = self
            .tables()
            .iter()
            .position(|table| *table as u8 == token.table())
        else {
            return Err(malformed_error!(
                "Token {} cannot be encoded as {:?}",
                token,
                self
            ));
        };

        let Ok(tag) = u32::try_from(tag) else {
            return Err(malformed_error!("Invalid coded index tag - {}", tag));
        };
        Ok((token.row() << self.tag_bits()) | tag)
    }

    /// Decode a value of this coded index into a token. Row 0 decodes as the null token.
    ///
    /// # Errors
    /// Returns an error if the tag does not name a table of this coded index.
    pub fn decode(&self, value: u32) -> Result<Token> {
        let bits = self.tag_bits();
        let tag = (value & ((1 << bits) - 1)) as usize;
        let row = value >> bits;

        let Some(table) = self.tables().get(tag) else {
            return Err(malformed_error!(
                "Invalid tag {} for coded index {:?}",
                tag,
                self
            ));
        };

        if row == 0 {
            return Ok(Token::default());
        }
        Ok(Token::from_parts(*table as u8, row))
    }
}

/// Row counts and heap widths, everything needed to size the columns of a table stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    rows: RowCounts,
    heap_sizes: u8,
}

impl TableInfo {
    /// Create sizing information from row counts and the `HeapSizes` flags.
    #[must_use]
    pub fn new(rows: RowCounts, heap_sizes: u8) -> Self {
        TableInfo { rows, heap_sizes }
    }

    /// Row count of `table`.
    #[must_use]
    pub fn rows(&self, table: TableId) -> u32 {
        self.rows[table as usize]
    }

    /// Width in bytes of a column.
    #[must_use]
    pub fn column_size(&self, column: ColumnKind) -> usize {
        match column {
            ColumnKind::U16 => 2,
            ColumnKind::U32 => 4,
            ColumnKind::Str => self.heap_width(HEAP_LARGE_STRINGS),
            ColumnKind::Guid => self.heap_width(HEAP_LARGE_GUID),
            ColumnKind::Blob => self.heap_width(HEAP_LARGE_BLOB),
            ColumnKind::Index(table) => {
                if self.rows(table) > 0xFFFF {
                    4
                } else {
                    2
                }
            }
            ColumnKind::Coded(coded) => {
                let max_rows = coded
                    .tables()
                    .iter()
                    .map(|table| self.rows(*table))
                    .max()
                    .unwrap_or(0);
                if max_rows >= 1 << (16 - coded.tag_bits()) {
                    4
                } else {
                    2
                }
            }
        }
    }

    /// Width in bytes of one row of `table`.
    #[must_use]
    pub fn row_size(&self, table: TableId) -> usize {
        table
            .columns()
            .iter()
            .map(|column| self.column_size(*column))
            .sum()
    }

    fn heap_width(&self, flag: u8) -> usize {
        if self.heap_sizes & flag != 0 {
            4
        } else {
            2
        }
    }
}

/// A row: one raw value per column.
pub type Row = Vec<u32>;

/// A decoded table stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablesStream {
    /// Schema major version, 2
    pub major_version: u8,
    /// Schema minor version, 0
    pub minor_version: u8,
    /// `Sorted` bit vector
    pub sorted: u64,
    tables: Vec<Vec<Row>>,
}

impl Default for TablesStream {
    fn default() -> Self {
        Self::new()
    }
}

impl TablesStream {
    /// A stream without rows.
    #[must_use]
    pub fn new() -> Self {
        TablesStream {
            major_version: 2,
            minor_version: 0,
            sorted: 0x0000_1600_3301_FA00,
            tables: vec![Vec::new(); TABLE_SLOTS],
        }
    }

    /// Parse a table stream.
    ///
    /// `external` supplies the row counts of tables that live in another stream, which is
    /// how a portable symbol stream refers to the type system tables of its image.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] if the stream holds a table with an unknown layout,
    /// and a parse error if it is truncated.
    pub fn read(data: &[u8], external: Option<&RowCounts>) -> Result<TablesStream> {
        let mut parser = Parser::new(data);
        parser.advance_by(4)?;
        let major_version = parser.read_le::<u8>()?;
        let minor_version = parser.read_le::<u8>()?;
        let heap_sizes = parser.read_le::<u8>()?;
        parser.advance_by(1)?;
        let valid = parser.read_le::<u64>()?;
        let sorted = parser.read_le::<u64>()?;

        let mut rows: RowCounts = external.copied().unwrap_or([0; TABLE_SLOTS]);
        let mut present = Vec::new();
        for slot in 0..TABLE_SLOTS {
            if valid & (1 << slot) == 0 {
                continue;
            }

            let count = parser.read_le::<u32>()?;
            #[allow(clippy::cast_possible_truncation)]
            let Some(table) = TableId::from_id(slot as u8) else {
                log::warn!("Table stream holds unknown table {:#x}", slot);
                return Err(Error::NotSupported);
            };
            rows[slot] = count;
            present.push(table);
        }

        if heap_sizes & HEAP_EXTRA_DATA != 0 {
            parser.advance_by(4)?;
        }

        let info = TableInfo::new(rows, heap_sizes);
        let mut tables = vec![Vec::new(); TABLE_SLOTS];
        for table in present {
            let count = rows[table as usize] as usize;
            if count.saturating_mul(info.row_size(table)) > parser.remaining() {
                return Err(malformed_error!(
                    "Table {:?} claims {} rows with {} bytes left",
                    table,
                    count,
                    parser.remaining()
                ));
            }

            let mut table_rows = Vec::with_capacity(count);
            for _ in 0..count {
                let mut row = Vec::with_capacity(table.columns().len());
                for column in table.columns() {
                    row.push(match info.column_size(*column) {
                        2 => u32::from(parser.read_le::<u16>()?),
                        _ => parser.read_le::<u32>()?,
                    });
                }
                table_rows.push(row);
            }
            tables[table as usize] = table_rows;
        }

        Ok(TablesStream {
            major_version,
            minor_version,
            sorted,
            tables,
        })
    }

    /// The rows of `table`.
    #[must_use]
    pub fn rows(&self, table: TableId) -> &[Row] {
        &self.tables[table as usize]
    }

    /// Mutable access to the rows of `table`.
    pub fn rows_mut(&mut self, table: TableId) -> &mut Vec<Row> {
        &mut self.tables[table as usize]
    }

    /// Row counts of every slot.
    #[must_use]
    pub fn row_counts(&self) -> RowCounts {
        let mut counts = [0u32; TABLE_SLOTS];
        for (slot, rows) in self.tables.iter().enumerate() {
            counts[slot] = u32::try_from(rows.len()).unwrap_or(u32::MAX);
        }
        counts
    }

    /// Serialize the stream, padded to 4 bytes.
    ///
    /// `heap_sizes` carries the [`HEAP_LARGE_STRINGS`], [`HEAP_LARGE_GUID`] and
    /// [`HEAP_LARGE_BLOB`] flags of the heaps the rows point into. `external` has the same
    /// meaning as in [`TablesStream::read`].
    ///
    /// # Errors
    /// Returns an error if a row has the wrong number of columns or a value does not fit
    /// its column.
    pub fn write(&self, heap_sizes: u8, external: Option<&RowCounts>) -> Result<Vec<u8>> {
        let own = self.row_counts();
        let mut rows = external.copied().unwrap_or([0; TABLE_SLOTS]);
        let mut valid = 0u64;
        for (slot, count) in own.iter().enumerate() {
            if *count > 0 {
                rows[slot] = *count;
                valid |= 1 << slot;
            }
        }

        let heap_sizes = heap_sizes & !HEAP_EXTRA_DATA;
        let info = TableInfo::new(rows, heap_sizes);
        let mut writer = Writer::with_capacity(1024);

        writer.write_le(0_u32);
        writer.write_le(self.major_version);
        writer.write_le(self.minor_version);
        writer.write_le(heap_sizes);
        writer.write_le(1_u8);
        writer.write_le(valid);
        writer.write_le(self.sorted & valid);
        for count in own.iter().filter(|count| **count > 0) {
            writer.write_le(*count);
        }

        for table in TableId::iter() {
            for (index, row) in self.rows(table).iter().enumerate() {
                let columns = table.columns();
                if row.len() != columns.len() {
                    return Err(malformed_error!(
                        "Row {} of {:?} has {} columns, expected {}",
                        index + 1,
                        table,
                        row.len(),
                        columns.len()
                    ));
                }

                for (value, column) in row.iter().zip(columns) {
                    if info.column_size(*column) == 2 {
                        let Ok(value) = u16::try_from(*value) else {
                            return Err(malformed_error!(
                                "Value {:#x} does not fit column of {:?} row {}",
                                value,
                                table,
                                index + 1
                            ));
                        };
                        writer.write_le(value);
                    } else {
                        writer.write_le(*value);
                    }
                }
            }
        }

        writer.align(4);
        Ok(writer.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coded_index_widths() {
        assert_eq!(CodedIndexType::TypeDefOrRef.tag_bits(), 2);
        assert_eq!(CodedIndexType::HasCustomAttribute.tag_bits(), 5);
        assert_eq!(CodedIndexType::CustomAttributeType.tag_bits(), 3);
        assert_eq!(CodedIndexType::MethodDefOrRef.tag_bits(), 1);
        assert_eq!(CodedIndexType::MemberRefParent.tag_bits(), 3);

        let mut rows = [0u32; TABLE_SLOTS];
        rows[TableId::TypeRef as usize] = 0x3FFF;
        let info = TableInfo::new(rows, 0);
        assert_eq!(info.column_size(ColumnKind::Coded(CodedIndexType::TypeDefOrRef)), 4);
        assert_eq!(info.column_size(ColumnKind::Coded(CodedIndexType::MethodDefOrRef)), 2);
        assert_eq!(info.column_size(ColumnKind::Index(TableId::TypeRef)), 2);
        assert_eq!(TableInfo::new(rows, HEAP_LARGE_BLOB).column_size(ColumnKind::Blob), 4);
    }

    #[test]
    fn coded_index_tokens() {
        let scope = CodedIndexType::ResolutionScope;
        assert_eq!(scope.encode(Token::new(0x2300_0001)).unwrap(), 0x06);
        assert_eq!(scope.decode(0x06).unwrap(), Token::new(0x2300_0001));
        assert_eq!(scope.decode(0x00).unwrap(), Token::default());
        assert!(scope.encode(Token::new(0x0600_0001)).is_err());

        let attribute = CodedIndexType::CustomAttributeType;
        assert_eq!(attribute.encode(Token::new(0x0A00_0002)).unwrap(), (2 << 3) | 3);
        assert_eq!(attribute.encode(Token::new(0x0600_0001)).unwrap(), (1 << 3) | 2);
        assert!(CodedIndexType::TypeDefOrRef.decode(0x03).is_err());
    }

    #[test]
    fn crafted() {
        #[rustfmt::skip]
        let data = [
            0x00, 0x00, 0x00, 0x00,
            0x02, 0x00,
            0x00, 0x01,
            0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // Module
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x01, 0x00, 0x00, 0x00,
            // Module: Generation, Name, Mvid, EncId, EncBaseId
            0x00, 0x00, 0x0A, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];

        let stream = TablesStream::read(&data, None).unwrap();
        assert_eq!(stream.major_version, 2);
        assert_eq!(stream.rows(TableId::Module), &[vec![0, 0x0A, 1, 0, 0]]);
        assert!(stream.rows(TableId::TypeDef).is_empty());

        let written = stream.write(0, None).unwrap();
        assert_eq!(&written[..data.len()], &data[..]);
        assert_eq!(written.len(), 40);
    }

    #[test]
    fn widths_follow_rows() {
        let mut stream = TablesStream::new();
        stream.rows_mut(TableId::Module).push(vec![0, 1, 1, 0, 0]);
        for row in 0..0x1_0000_u32 {
            stream.rows_mut(TableId::TypeRef).push(vec![0x06, row, 0]);
        }
        stream.rows_mut(TableId::MemberRef).push(vec![(0x1_0000 << 3) | 1, 5, 1]);

        let data = stream.write(HEAP_LARGE_STRINGS, None).unwrap();
        let parsed = TablesStream::read(&data, None).unwrap();
        assert_eq!(parsed.rows(TableId::TypeRef).len(), 0x1_0000);
        assert_eq!(parsed.rows(TableId::TypeRef)[0xFFFF], vec![0x06, 0xFFFF, 0]);
        assert_eq!(parsed.rows(TableId::MemberRef)[0], vec![(0x1_0000 << 3) | 1, 5, 1]);
    }

    #[test]
    fn heap_size_flags() {
        assert_eq!(heap_sizes(0xFFFF, 0xFFFF, 0xFFFF), 0);
        assert_eq!(
            heap_sizes(0x1_0000, 16, 0x2_0000),
            HEAP_LARGE_STRINGS | HEAP_LARGE_BLOB
        );
        assert_eq!(heap_sizes(1, 0x1_0000, 1), HEAP_LARGE_GUID);
    }

    #[test]
    fn external_row_counts() {
        let mut external = [0u32; TABLE_SLOTS];
        external[TableId::MethodDef as usize] = 0x1_0000;

        let mut stream = TablesStream::new();
        stream.rows_mut(TableId::StateMachineMethod).push(vec![0x1_0000, 3]);
        let data = stream.write(0, Some(&external)).unwrap();

        let misread = TablesStream::read(&data, None).unwrap();
        assert_ne!(misread.rows(TableId::StateMachineMethod), stream.rows(TableId::StateMachineMethod));
        let parsed = TablesStream::read(&data, Some(&external)).unwrap();
        assert_eq!(parsed.rows(TableId::StateMachineMethod), &[vec![0x1_0000, 3]]);
    }

    #[test]
    fn rejects_mismatched_rows() {
        let mut stream = TablesStream::new();
        stream.rows_mut(TableId::ModuleRef).push(vec![1, 2]);
        assert!(stream.write(0, None).is_err());

        let mut stream = TablesStream::new();
        stream.rows_mut(TableId::ModuleRef).push(vec![0x1_0000]);
        assert!(stream.write(0, None).is_err());
    }
}
