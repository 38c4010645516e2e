//! Serialization of module images.
//!
//! Writing keeps the container of a parsed image and replaces only what the image models:
//! the rows of the modelled tables are rewritten in place (rows past the original ones are
//! appended), new names and signatures are appended to copies of the original heaps, and
//! the user string heap is rebuilt from [`Image::user_strings`]. Method bodies, the metadata
//! and the debug directory then go into one appended section.

use crate::{
    assembly::{Layout, Operand},
    file::writer::Writer,
    image::{
        pe::{
            append_debug_directory, pad4, to_u32, CliSection, Container, DebugEntry, PeHeaders,
            DEBUG_EMBEDDED_PORTABLE_PDB,
        },
        reader::{
            reference_token, remap_body_user_strings, ASSEMBLY_FULL_PUBLIC_KEY, CODE_TYPE_MASK,
        },
        Image, MethodBody, ModuleIdentity, Token,
    },
    metadata::{
        cor20header::Cor20Header,
        root::{Root, DEFAULT_VERSION},
        streams::{Blob, BlobBuilder, GuidBuilder, StringsBuilder, UserStringsBuilder},
        tables::{
            heap_sizes, CodedIndexType, Row, RowCounts, TableId, TablesStream, TABLE_SLOTS,
        },
    },
    Result,
};

/// `CALG_SHA1`, the hash algorithm of a new `Assembly` row
const ASSEMBLY_HASH_SHA1: u32 = 0x8004;

/// Portable PDB format version, recorded in the embedded symbols debug entry
const PORTABLE_PDB_VERSION: u16 = 0x0100;

/// The bytes of a serialized image, together with the code layout of every method body.
///
/// The layouts carry the new offset of every instruction, which is what the symbol writer
/// needs to re-emit sequence points that match the new code.
#[derive(Debug, Clone)]
pub struct WrittenImage {
    /// The serialized image
    pub bytes: Vec<u8>,
    /// Code layout per `MethodDef` row, `None` for methods without a body
    pub layouts: Vec<Option<Layout>>,
}

/// The heaps of the image being written.
struct HeapBuilders {
    strings: StringsBuilder,
    blob: BlobBuilder,
    guid: GuidBuilder,
}

impl HeapBuilders {
    fn heap_sizes(&self) -> u8 {
        heap_sizes(self.strings.len(), self.guid.len(), self.blob.len())
    }
}

impl Image {
    /// Serialize the image into a PE file.
    ///
    /// `embedded_symbols` becomes an embedded portable PDB debug entry, so clearing that
    /// field drops the entry from the output.
    ///
    /// # Errors
    /// Returns an error if a method body cannot be encoded, a row references a user string
    /// that does not exist, rows of a parsed image were added to or removed from the
    /// `TypeDef` or `MethodDef` tables, or the image outgrows the PE format.
    pub fn to_bytes(&self) -> Result<WrittenImage> {
        let container = self.container.as_deref();
        let synthesized;
        let pe = match container {
            Some(container) => &container.pe,
            None => {
                synthesized = PeHeaders::synthesize();
                &synthesized
            }
        };
        let plan = pe.plan()?;

        let mut user_strings = UserStringsBuilder::new();
        let mut string_offsets = Vec::with_capacity(self.user_strings.len());
        for value in &self.user_strings {
            string_offsets.push(user_strings.add(value)?);
        }

        let mut section = vec![0u8; Cor20Header::SIZE];
        let mut rvas = Vec::with_capacity(self.methods.len());
        let mut layouts = Vec::with_capacity(self.methods.len());
        for (index, method) in self.methods.iter().enumerate() {
            let Some(body) = &method.body else {
                rvas.push(0);
                layouts.push(None);
                continue;
            };

            let (bytes, layout) = encode_body(body, &string_offsets).map_err(|row| {
                malformed_error!("Method {} loads an unknown user string {:#x}", index, row)
            })??;
            pad4(&mut section);
            rvas.push(plan.rva + to_u32(section.len())?);
            section.extend_from_slice(&bytes);
            layouts.push(Some(layout));
        }

        let metadata = self.write_metadata(container, &rvas, user_strings)?;
        pad4(&mut section);
        let metadata_offset = to_u32(section.len())?;
        section.extend_from_slice(&metadata);

        let mut entries: Vec<DebugEntry> =
            container.map_or_else(Vec::new, |c| c.debug_entries.clone());
        if let Some(symbols) = &self.embedded_symbols {
            entries.push(DebugEntry {
                characteristics: 0,
                time_date_stamp: 0,
                major_version: PORTABLE_PDB_VERSION,
                minor_version: PORTABLE_PDB_VERSION,
                kind: DEBUG_EMBEDDED_PORTABLE_PDB,
                data: symbols.clone(),
            });
        }
        let debug_directory = if entries.is_empty() {
            None
        } else {
            Some(append_debug_directory(&mut section, &entries, &plan)?)
        };

        let mut cor20 = container.map_or_else(
            || Cor20Header::new(self.flags.bits()),
            |c| c.cor20.clone(),
        );
        cor20.flags = self.flags.bits();
        cor20.meta_data_rva = plan.rva + metadata_offset;
        cor20.meta_data_size = to_u32(metadata.len())?;

        let mut writer = Writer::with_capacity(Cor20Header::SIZE);
        cor20.write(&mut writer);
        section[..Cor20Header::SIZE].copy_from_slice(&writer.into_inner());

        let bytes = pe.write(
            &plan,
            &CliSection {
                data: section,
                cli_header: 0,
                debug_directory,
            },
        )?;

        Ok(WrittenImage { bytes, layouts })
    }

    /// Row counts of the type system tables as [`Image::to_bytes`] writes them.
    ///
    /// Portable symbols of the written image record these counts in their `#Pdb` stream.
    #[must_use]
    pub fn table_rows(&self) -> RowCounts {
        let mut rows = match &self.container {
            Some(container) => container.tables.row_counts(),
            None => {
                let mut rows = [0u32; TABLE_SLOTS];
                rows[TableId::Module as usize] = 1;
                rows[TableId::Assembly as usize] = 1;
                rows
            }
        };

        let count = |len: usize| u32::try_from(len).unwrap_or(u32::MAX);
        rows[TableId::AssemblyRef as usize] = count(self.assembly_refs.len());
        rows[TableId::TypeRef as usize] = count(self.type_refs.len());
        rows[TableId::TypeDef as usize] = count(self.type_defs.len());
        rows[TableId::MethodDef as usize] = count(self.methods.len());
        rows[TableId::MemberRef as usize] = count(self.member_refs.len());
        rows[TableId::NestedClass as usize] =
            count(self.type_defs.iter().filter(|t| t.enclosing.is_some()).count());
        rows
    }

    fn write_metadata(
        &self,
        container: Option<&Container>,
        rvas: &[u32],
        user_strings: UserStringsBuilder,
    ) -> Result<Vec<u8>> {
        let mut tables = container.map_or_else(TablesStream::new, |c| c.tables.clone());
        let mut heaps = match container {
            Some(c) => HeapBuilders {
                strings: StringsBuilder::from_heap(&c.strings),
                blob: BlobBuilder::from_heap(&c.blob),
                guid: GuidBuilder::from_heap(&c.guid),
            },
            None => HeapBuilders {
                strings: StringsBuilder::new(),
                blob: BlobBuilder::new(),
                guid: GuidBuilder::new(),
            },
        };

        let mvid = heaps.guid.add(self.mvid)?;
        let modules = tables.rows_mut(TableId::Module);
        match modules.first_mut() {
            Some(row) => row[2] = mvid,
            None => {
                let name = heaps.strings.add(&format!("{}.dll", self.identity.name))?;
                modules.push(vec![0, name, mvid, 0, 0]);
            }
        }

        self.write_assembly(&mut tables, &mut heaps, container.is_none())?;
        self.write_assembly_refs(&mut tables, &mut heaps, container)?;
        self.write_type_refs(&mut tables, &mut heaps)?;
        self.write_type_defs(&mut tables, &mut heaps, container.is_some())?;
        self.write_methods(&mut tables, &mut heaps, rvas, container.is_some())?;
        self.write_member_refs(&mut tables, &mut heaps)?;

        let table_bytes = tables.write(heaps.heap_sizes(), None)?;
        let version = container.map_or(DEFAULT_VERSION, |c| c.version.as_str());
        let tables_name = container.map_or("#~", |c| c.tables_name.as_str());
        let strings = heaps.strings.into_bytes();
        let user_strings = user_strings.into_bytes();
        let guid = heaps.guid.into_bytes();
        let blob = heaps.blob.into_bytes();

        Root::write(
            version,
            &[
                (tables_name, table_bytes.as_slice()),
                ("#Strings", strings.as_slice()),
                ("#US", user_strings.as_slice()),
                ("#GUID", guid.as_slice()),
                ("#Blob", blob.as_slice()),
            ],
        )
    }

    fn write_assembly(
        &self,
        tables: &mut TablesStream,
        heaps: &mut HeapBuilders,
        synthesize: bool,
    ) -> Result<()> {
        let identity = &self.identity;
        let rows = tables.rows_mut(TableId::Assembly);
        if rows.is_empty() && !synthesize {
            return Ok(());
        }

        let name = heaps.strings.add(&identity.name)?;
        let culture = heaps.strings.add(identity.culture.as_deref().unwrap_or(""))?;
        match rows.first_mut() {
            Some(row) => {
                row[1..5].copy_from_slice(&version_columns(identity));
                row[7] = name;
                row[8] = culture;
            }
            None => {
                let mut row = vec![ASSEMBLY_HASH_SHA1];
                row.extend_from_slice(&version_columns(identity));
                row.extend_from_slice(&[0, 0, name, culture]);
                rows.push(row);
            }
        }

        Ok(())
    }

    fn write_assembly_refs(
        &self,
        tables: &mut TablesStream,
        heaps: &mut HeapBuilders,
        container: Option<&Container>,
    ) -> Result<()> {
        let original = match container {
            Some(c) if !c.blob.is_empty() => Some(Blob::from(&c.blob)?),
            _ => None,
        };
        let existing = rows_to_keep(tables, TableId::AssemblyRef, self.assembly_refs.len())?;

        for (index, reference) in self.assembly_refs.iter().enumerate() {
            let name = heaps.strings.add(&reference.name)?;
            let culture = heaps.strings.add(reference.culture.as_deref().unwrap_or(""))?;
            let token = reference.public_key_token;

            if index < existing {
                let row = &mut tables.rows_mut(TableId::AssemblyRef)[index];
                let current = match &original {
                    Some(blob) => reference_token(row[4], blob.get(row[5] as usize)?),
                    None => None,
                };
                if current != token {
                    row[4] &= !ASSEMBLY_FULL_PUBLIC_KEY;
                    row[5] = heaps.blob.add(token.as_ref().map_or(&[][..], |t| &t[..]))?;
                }
                row[..4].copy_from_slice(&version_columns(reference));
                row[6] = name;
                row[7] = culture;
            } else {
                let key = heaps.blob.add(token.as_ref().map_or(&[][..], |t| &t[..]))?;
                let mut row = version_columns(reference).to_vec();
                row.extend_from_slice(&[0, key, name, culture, 0]);
                tables.rows_mut(TableId::AssemblyRef).push(row);
            }
        }

        Ok(())
    }

    fn write_type_refs(&self, tables: &mut TablesStream, heaps: &mut HeapBuilders) -> Result<()> {
        let existing = rows_to_keep(tables, TableId::TypeRef, self.type_refs.len())?;

        for (index, type_ref) in self.type_refs.iter().enumerate() {
            let row = vec![
                CodedIndexType::ResolutionScope.encode(type_ref.scope)?,
                heaps.strings.add(&type_ref.name)?,
                heaps.strings.add(&type_ref.namespace)?,
            ];
            put_row(tables, TableId::TypeRef, index, existing, row);
        }

        Ok(())
    }

    fn write_type_defs(
        &self,
        tables: &mut TablesStream,
        heaps: &mut HeapBuilders,
        parsed: bool,
    ) -> Result<()> {
        let existing = tables.rows(TableId::TypeDef).len();
        if parsed && existing != self.type_defs.len() {
            return Err(malformed_error!(
                "TypeDef rows cannot be added or removed ({} parsed, {} now)",
                existing,
                self.type_defs.len()
            ));
        }

        let field_list = to_u32(tables.rows(TableId::Field).len() + 1)?;
        let mut method_list = 1u32;
        for (index, type_def) in self.type_defs.iter().enumerate() {
            let name = heaps.strings.add(&type_def.name)?;
            let namespace = heaps.strings.add(&type_def.namespace)?;

            if index < existing {
                let row = &mut tables.rows_mut(TableId::TypeDef)[index];
                row[0] = type_def.flags.bits();
                row[1] = name;
                row[2] = namespace;
                row[5] = method_list;
            } else {
                tables.rows_mut(TableId::TypeDef).push(vec![
                    type_def.flags.bits(),
                    name,
                    namespace,
                    0,
                    field_list,
                    method_list,
                ]);
            }
            method_list += type_def.method_count;
        }

        let nested = tables.rows_mut(TableId::NestedClass);
        nested.clear();
        for (index, type_def) in self.type_defs.iter().enumerate() {
            if let Some(enclosing) = type_def.enclosing {
                nested.push(vec![to_u32(index + 1)?, to_u32(enclosing + 1)?]);
            }
        }

        Ok(())
    }

    fn write_methods(
        &self,
        tables: &mut TablesStream,
        heaps: &mut HeapBuilders,
        rvas: &[u32],
        parsed: bool,
    ) -> Result<()> {
        let existing = tables.rows(TableId::MethodDef).len();
        if parsed && existing != self.methods.len() {
            return Err(malformed_error!(
                "MethodDef rows cannot be added or removed ({} parsed, {} now)",
                existing,
                self.methods.len()
            ));
        }

        let param_list = to_u32(tables.rows(TableId::Param).len() + 1)?;
        for (index, method) in self.methods.iter().enumerate() {
            let name = heaps.strings.add(&method.name)?;
            let signature = heaps.blob.add(&method.signature)?;
            let rva = rvas.get(index).copied().unwrap_or_default();

            if index < existing {
                let row = &mut tables.rows_mut(TableId::MethodDef)[index];
                // Native and runtime bodies stay where they are
                if method.body.is_some() || row[1] & CODE_TYPE_MASK == 0 {
                    row[0] = rva;
                }
                row[2] = u32::from(method.flags.bits());
                row[3] = name;
                row[4] = signature;
            } else {
                tables.rows_mut(TableId::MethodDef).push(vec![
                    rva,
                    0,
                    u32::from(method.flags.bits()),
                    name,
                    signature,
                    param_list,
                ]);
            }
        }

        Ok(())
    }

    fn write_member_refs(&self, tables: &mut TablesStream, heaps: &mut HeapBuilders) -> Result<()> {
        let existing = rows_to_keep(tables, TableId::MemberRef, self.member_refs.len())?;

        for (index, member) in self.member_refs.iter().enumerate() {
            let row = vec![
                CodedIndexType::MemberRefParent.encode(member.parent)?,
                heaps.strings.add(&member.name)?,
                heaps.blob.add(&member.signature)?,
            ];
            put_row(tables, TableId::MemberRef, index, existing, row);
        }

        Ok(())
    }
}

/// Encode a body with its `ldstr` operands pointing at heap offsets. The outer error is the
/// first user string row that has no offset.
fn encode_body(
    body: &MethodBody,
    string_offsets: &[u32],
) -> std::result::Result<Result<(Vec<u8>, Layout)>, u32> {
    let loads_strings = body.instructions.iter().any(|instruction| {
        matches!(&instruction.operand, Operand::Token(token) if token.table() == Token::USER_STRING)
    });
    if !loads_strings {
        return Ok(body.to_bytes());
    }

    let mut body = body.clone();
    remap_body_user_strings(&mut body, &|row| {
        (row as usize)
            .checked_sub(1)
            .and_then(|index| string_offsets.get(index))
            .copied()
    })?;
    Ok(body.to_bytes())
}

/// Rows of a parsed image can be renamed or repointed, never dropped.
fn rows_to_keep(tables: &TablesStream, table: TableId, rows: usize) -> Result<usize> {
    let existing = tables.rows(table).len();
    if rows < existing {
        return Err(malformed_error!(
            "{:?} rows cannot be removed ({} parsed, {} now)",
            table,
            existing,
            rows
        ));
    }
    Ok(existing)
}

fn put_row(tables: &mut TablesStream, table: TableId, index: usize, existing: usize, row: Row) {
    let rows = tables.rows_mut(table);
    if index < existing {
        rows[index] = row;
    } else {
        rows.push(row);
    }
}

fn version_columns(identity: &ModuleIdentity) -> [u32; 4] {
    let version = identity.version;
    [
        u32::from(version.major),
        u32::from(version.minor),
        u32::from(version.build),
        u32::from(version.revision),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{opcodes, Instruction},
        image::ImageFlags,
        test::ImageBuilder,
    };

    fn sample() -> Image {
        ImageBuilder::new("MainApp")
            .assembly_ref("Lib")
            .type_ref("Lib", "Lib", "Helper")
            .member_ref("Lib.Helper", "Foo")
            .type_def("MainApp", "Program")
            .method(
                "Main",
                vec![
                    Instruction::new(opcodes::CALL, Operand::Token(Token::new(0x0A00_0001))),
                    Instruction::ret(),
                ],
            )
            .abstract_method("Describe")
            .nested_type_def("Options")
            .user_string("hello")
            .build()
    }

    #[test]
    fn parse_write_is_stable() {
        let image = sample();

        let first = image.to_bytes().unwrap();
        let parsed = Image::parse(&first.bytes).unwrap();
        assert_eq!(parsed, image);

        let second = parsed.to_bytes().unwrap();
        assert_eq!(second.bytes, first.bytes);
        assert_eq!(first.layouts.len(), 2);
        assert_eq!(first.layouts[0].as_ref().map(Layout::code_size), Some(6));
        assert!(first.layouts[1].is_none());
    }

    #[test]
    fn modified_rows_survive_rewrite() {
        let mut parsed = Image::parse(&sample().to_bytes().unwrap().bytes).unwrap();
        parsed.type_defs[0].name = "Entry".to_string();
        parsed.methods[0].name = "Start".to_string();
        parsed.assembly_refs[0].public_key_token = Some([7; 8]);
        parsed.assembly_refs.push(ModuleIdentity::new("Extra"));
        parsed.user_strings.push("world".to_string());

        let reparsed = Image::parse(&parsed.to_bytes().unwrap().bytes).unwrap();
        assert_eq!(reparsed, parsed);
        assert_eq!(reparsed.find_method("MainApp.Entry", "Start"), Some(0));
        assert_eq!(reparsed.assembly_refs[0].public_key_token, Some([7; 8]));
        assert_eq!(reparsed.assembly_refs[1].name, "Extra");
    }

    #[test]
    fn table_rows_match_written_tables() {
        let image = sample();
        let parsed = Image::parse(&image.to_bytes().unwrap().bytes).unwrap();
        let written = parsed.container.as_deref().unwrap().tables.row_counts();

        assert_eq!(image.table_rows(), written);
        assert_eq!(parsed.table_rows(), written);
        assert_eq!(written[TableId::NestedClass as usize], 1);
        assert_eq!(written[TableId::MethodDef as usize], 2);
    }

    #[test]
    fn parsed_method_table_is_fixed() {
        let mut parsed = Image::parse(&sample().to_bytes().unwrap().bytes).unwrap();
        parsed.type_defs[1].method_count = 1;
        parsed.methods.push(parsed.methods[0].clone());
        assert!(parsed.to_bytes().is_err());

        let mut parsed = Image::parse(&sample().to_bytes().unwrap().bytes).unwrap();
        parsed.member_refs.clear();
        assert!(parsed.to_bytes().is_err());
    }

    #[test]
    fn embedded_symbols_follow_payload() {
        let mut image = ImageBuilder::new("Lib").build();
        image.embedded_symbols = Some(vec![1, 2, 3]);

        let bytes = image.to_bytes().unwrap().bytes;
        let parsed = Image::parse(&bytes).unwrap();
        assert_eq!(parsed.embedded_symbols, Some(vec![1, 2, 3]));
        assert_eq!(parsed.container.as_deref().unwrap().debug_entries, vec![]);

        let mut stripped = parsed;
        stripped.embedded_symbols = None;
        let parsed = Image::parse(&stripped.to_bytes().unwrap().bytes).unwrap();
        assert_eq!(parsed.embedded_symbols, None);
    }

    #[test]
    fn flags_are_written_to_cli_header() {
        let mut image = ImageBuilder::new("Lib").build();
        image.flags = ImageFlags::IL_ONLY | ImageFlags::PREFERRED_32BIT;

        let parsed = Image::parse(&image.to_bytes().unwrap().bytes).unwrap();
        assert_eq!(parsed.flags, image.flags);
        assert_eq!(parsed.container.as_deref().unwrap().cor20.flags, 0x0002_0001);
    }

    #[test]
    fn unknown_user_string_is_rejected() {
        let image = ImageBuilder::new("Lib")
            .type_def("Ns", "Type")
            .method(
                "Run",
                vec![
                    Instruction::new(opcodes::LDSTR, Operand::Token(Token::new(0x7000_0003))),
                    Instruction::ret(),
                ],
            )
            .user_string("only")
            .build();

        assert!(image.to_bytes().is_err());
    }

    #[test]
    fn rewritten_body_changes_layout() {
        let mut image = ImageBuilder::new("Lib")
            .type_def("Ns", "Type")
            .method("Run", vec![Instruction::ret()])
            .build();
        image.methods[0].body = Some(MethodBody::new(vec![
            Instruction::new(opcodes::NOP, Operand::None),
            Instruction::ret(),
        ]));

        let written = image.to_bytes().unwrap();
        assert_eq!(written.layouts[0].as_ref().unwrap().offsets, vec![0, 1, 2]);
    }
}
