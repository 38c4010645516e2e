//! Projecting the metadata of a PE module onto an [`Image`].

use std::{collections::HashMap, path::Path, sync::Arc};

use crate::{
    assembly::Operand,
    image::{
        pe::Container, public_key_token, Image, ImageFlags, MemberRef, MethodAttributes,
        MethodBody, MethodDef, ModuleIdentity, ModuleVersion, Token, TypeAttributes, TypeDef,
        TypeRef,
    },
    metadata::{
        streams::{Blob, Guid, Strings, UserStrings},
        tables::{CodedIndexType, Row, TableId, TablesStream},
    },
    Error, Result,
};

/// `AssemblyFlags.PublicKey`: the key column holds the full key, not its token
pub(crate) const ASSEMBLY_FULL_PUBLIC_KEY: u32 = 0x0001;

/// `MethodImplAttributes.CodeTypeMask`; a value of 0 means the body is IL
pub(crate) const CODE_TYPE_MASK: u32 = 0x0003;

/// Read-only views of the three heaps the tables index into.
struct Heaps<'a> {
    strings: Strings<'a>,
    blob: Blob<'a>,
    guid: Guid<'a>,
}

impl<'a> Heaps<'a> {
    fn from(container: &'a Container) -> Result<Heaps<'a>> {
        Ok(Heaps {
            strings: Strings::from(heap_or_empty(&container.strings))?,
            blob: Blob::from(heap_or_empty(&container.blob))?,
            guid: Guid::from(&container.guid)?,
        })
    }

    fn string(&self, index: u32) -> Result<String> {
        Ok(self.strings.get(index as usize)?.to_string())
    }

    fn blob(&self, index: u32) -> Result<&'a [u8]> {
        self.blob.get(index as usize)
    }
}

/// Heaps that a module leaves out still answer index 0.
fn heap_or_empty(heap: &[u8]) -> &[u8] {
    if heap.is_empty() {
        &[0]
    } else {
        heap
    }
}

impl Image {
    /// Parse a managed PE module.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] for files that are not managed PE images or use
    /// uncommon table layouts, and a parse error if the metadata is damaged, a method body
    /// cannot be decoded, or a row references a row that does not exist.
    pub fn parse(data: &[u8]) -> Result<Image> {
        let parsed = Container::read(data)?;
        let mut container = parsed.container;

        let mut image = project(&container, &parsed.user_strings)?;
        image.embedded_symbols = parsed.embedded_symbols;
        image.validate()?;

        container.release_cli_section();
        image.container = Some(Arc::new(container));
        Ok(image)
    }

    fn validate(&self) -> Result<()> {
        let declared: usize = self
            .type_defs
            .iter()
            .map(|t| t.method_count as usize)
            .sum();
        if declared != self.methods.len() {
            return Err(malformed_error!(
                "Types own {} methods but the image defines {}",
                declared,
                self.methods.len()
            ));
        }

        for (index, type_def) in self.type_defs.iter().enumerate() {
            if type_def
                .enclosing
                .is_some_and(|enclosing| enclosing >= self.type_defs.len() || enclosing == index)
            {
                return Err(malformed_error!("Type {} has an invalid enclosing type", index));
            }
        }

        for (index, type_ref) in self.type_refs.iter().enumerate() {
            let valid = match type_ref.scope.table() {
                _ if type_ref.scope.is_null() => true,
                Token::MODULE => type_ref.scope.row() == 1,
                Token::MODULE_REF => true,
                Token::ASSEMBLY_REF => self.row_exists(type_ref.scope, self.assembly_refs.len()),
                Token::TYPE_REF => self.row_exists(type_ref.scope, self.type_refs.len()),
                _ => false,
            };
            if !valid {
                return Err(malformed_error!(
                    "TypeRef {} has an invalid scope {}",
                    index,
                    type_ref.scope
                ));
            }
        }

        for (index, member) in self.member_refs.iter().enumerate() {
            let valid = match member.parent.table() {
                Token::TYPE_REF => self.row_exists(member.parent, self.type_refs.len()),
                Token::TYPE_DEF => self.row_exists(member.parent, self.type_defs.len()),
                Token::METHOD_DEF => self.row_exists(member.parent, self.methods.len()),
                Token::MODULE_REF | Token::TYPE_SPEC => !member.parent.is_null(),
                _ => false,
            };
            if !valid {
                return Err(malformed_error!(
                    "MemberRef {} has an invalid parent {}",
                    index,
                    member.parent
                ));
            }
        }

        Ok(())
    }

    fn row_exists(&self, token: Token, rows: usize) -> bool {
        token.index().is_some_and(|index| index < rows)
    }
}

fn project(container: &Container, user_strings: &[u8]) -> Result<Image> {
    let tables = &container.tables;
    if !tables.rows(TableId::MethodPtr).is_empty() || !tables.rows(TableId::FieldPtr).is_empty() {
        log::warn!("Images with indirection tables are not supported");
        return Err(Error::NotSupported);
    }

    let heaps = Heaps::from(container)?;
    let Some(module) = tables.rows(TableId::Module).first() else {
        return Err(malformed_error!("Metadata has no Module row"));
    };

    let mvid = heaps.guid.get(module[2] as usize)?;
    let mut image = Image::new(identity_from(tables, &heaps)?, mvid);
    image.flags = ImageFlags::from_bits_retain(container.cor20.flags);

    for row in tables.rows(TableId::AssemblyRef) {
        image.assembly_refs.push(assembly_ref(row, &heaps)?);
    }

    for row in tables.rows(TableId::TypeRef) {
        image.type_refs.push(TypeRef {
            scope: CodedIndexType::ResolutionScope.decode(row[0])?,
            name: heaps.string(row[1])?,
            namespace: heaps.string(row[2])?,
        });
    }

    let method_rows = tables.rows(TableId::MethodDef).len();
    let type_rows = tables.rows(TableId::TypeDef);
    for (index, row) in type_rows.iter().enumerate() {
        let start = row[5] as usize;
        let end = type_rows
            .get(index + 1)
            .map_or(method_rows + 1, |next| next[5] as usize);
        if start == 0 || end < start || end > method_rows + 1 {
            return Err(malformed_error!(
                "TypeDef {} has an invalid method list {}..{}",
                index,
                start,
                end
            ));
        }

        image.type_defs.push(TypeDef {
            flags: TypeAttributes::from_bits_retain(row[0]),
            name: heaps.string(row[1])?,
            namespace: heaps.string(row[2])?,
            enclosing: None,
            method_count: u32::try_from(end - start)
                .map_err(|_| malformed_error!("TypeDef {} owns too many methods", index))?,
        });
    }

    for row in tables.rows(TableId::NestedClass) {
        let (Some(nested), Some(enclosing)) = (
            (row[0] as usize).checked_sub(1),
            (row[1] as usize).checked_sub(1),
        ) else {
            return Err(malformed_error!("NestedClass row references row 0"));
        };
        let Some(type_def) = image.type_defs.get_mut(nested) else {
            return Err(malformed_error!("NestedClass references TypeDef {}", nested + 1));
        };
        type_def.enclosing = Some(enclosing);
    }

    for (index, row) in tables.rows(TableId::MethodDef).iter().enumerate() {
        let name = heaps.string(row[3])?;
        let body = if row[0] != 0 && row[1] & CODE_TYPE_MASK == 0 {
            let data = container.pe.slice_from(row[0])?;
            Some(MethodBody::parse(data).map_err(|e| {
                malformed_error!("Method {} ('{}') has an invalid body: {}", index, name, e)
            })?)
        } else {
            None
        };

        image.methods.push(MethodDef {
            flags: MethodAttributes::from_bits_retain(short(row[2])),
            name,
            signature: heaps.blob(row[4])?.to_vec(),
            body,
        });
    }

    for row in tables.rows(TableId::MemberRef) {
        image.member_refs.push(MemberRef {
            parent: CodedIndexType::MemberRefParent.decode(row[0])?,
            name: heaps.string(row[1])?,
            signature: heaps.blob(row[2])?.to_vec(),
        });
    }

    let entries = UserStrings::from(user_strings)?.entries()?;
    let mut ordinals = HashMap::with_capacity(entries.len());
    for (position, (offset, value)) in entries.into_iter().enumerate() {
        ordinals.insert(offset, position + 1);
        image.user_strings.push(value);
    }
    remap_user_strings(&mut image, |row| {
        ordinals
            .get(&row)
            .and_then(|ordinal| u32::try_from(*ordinal).ok())
    })?;

    Ok(image)
}

/// Rewrite the row of every `ldstr` operand through `map`.
pub(crate) fn remap_user_strings(
    image: &mut Image,
    map: impl Fn(u32) -> Option<u32>,
) -> Result<()> {
    for (index, method) in image.methods.iter_mut().enumerate() {
        let Some(body) = method.body.as_mut() else {
            continue;
        };
        remap_body_user_strings(body, &map).map_err(|row| {
            malformed_error!("Method {} loads an unknown user string {:#x}", index, row)
        })?;
    }

    Ok(())
}

/// Rewrite the row of every `ldstr` operand in `body`, returning the first row `map` has no
/// answer for.
pub(crate) fn remap_body_user_strings(
    body: &mut MethodBody,
    map: &impl Fn(u32) -> Option<u32>,
) -> std::result::Result<(), u32> {
    for instruction in &mut body.instructions {
        if let Operand::Token(token) = &mut instruction.operand {
            if token.table() == Token::USER_STRING {
                let Some(row) = map(token.row()) else {
                    return Err(token.row());
                };
                *token = Token::from_parts(Token::USER_STRING, row);
            }
        }
    }

    Ok(())
}

/// The identity of a module: its `Assembly` row, or the file stem of its `Module` name for
/// modules without a manifest.
pub(crate) fn module_identity(container: &Container) -> Result<ModuleIdentity> {
    identity_from(&container.tables, &Heaps::from(container)?)
}

fn identity_from(tables: &TablesStream, heaps: &Heaps) -> Result<ModuleIdentity> {
    if let Some(row) = tables.rows(TableId::Assembly).first() {
        let public_key = heaps.blob(row[6])?;
        let culture = heaps.string(row[8])?;

        return Ok(ModuleIdentity {
            name: heaps.string(row[7])?,
            version: ModuleVersion::new(short(row[1]), short(row[2]), short(row[3]), short(row[4])),
            culture: (!culture.is_empty()).then_some(culture),
            public_key_token: (!public_key.is_empty()).then(|| public_key_token(public_key)),
        });
    }

    let Some(module) = tables.rows(TableId::Module).first() else {
        return Err(malformed_error!("Metadata has no Module row"));
    };
    let name = heaps.string(module[1])?;
    let stem = Path::new(&name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(&name)
        .to_string();
    Ok(ModuleIdentity::new(stem))
}

fn assembly_ref(row: &Row, heaps: &Heaps) -> Result<ModuleIdentity> {
    let culture = heaps.string(row[7])?;

    Ok(ModuleIdentity {
        name: heaps.string(row[6])?,
        version: ModuleVersion::new(short(row[0]), short(row[1]), short(row[2]), short(row[3])),
        culture: (!culture.is_empty()).then_some(culture),
        public_key_token: reference_token(row[4], heaps.blob(row[5])?),
    })
}

/// The token an `AssemblyRef` names, given its flags and `PublicKeyOrToken` blob.
pub(crate) fn reference_token(flags: u32, key_or_token: &[u8]) -> Option<[u8; 8]> {
    if key_or_token.is_empty() {
        return None;
    }

    match <[u8; 8]>::try_from(key_or_token) {
        Ok(token) if flags & ASSEMBLY_FULL_PUBLIC_KEY == 0 => Some(token),
        _ => Some(public_key_token(key_or_token)),
    }
}

/// Two-byte columns are stored widened.
#[allow(clippy::cast_possible_truncation)]
fn short(value: u32) -> u16 {
    value as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{opcodes, Instruction},
        test::ImageBuilder,
    };

    #[test]
    fn written_image_is_a_pe_file() {
        let bytes = ImageBuilder::new("Lib")
            .assembly_ref("Engine")
            .type_ref("Engine", "Engine", "Component")
            .type_def("Ns", "Type")
            .method("Run", vec![Instruction::ret()])
            .build_bytes();

        assert_eq!(&bytes[..2], b"MZ");
        let pe = goblin::pe::PE::parse(&bytes).unwrap();
        assert_eq!(
            pe.header
                .optional_header
                .map(|header| header.data_directories.get_clr_runtime_header().is_some()),
            Some(true)
        );

        let image = Image::parse(&bytes).unwrap();
        assert!(image.has_container());
        assert_eq!(image.identity.name, "Lib");
        assert_eq!(image.assembly_refs[0].name, "Engine");
        assert_eq!(image.type_refs[0].scope, Token::new(0x2300_0001));
        assert_eq!(image.type_def_full_name(0).as_deref(), Some("Ns.Type"));
        assert_eq!(image.methods[0].name, "Run");
    }

    #[test]
    fn rejects_other_files() {
        assert!(matches!(Image::parse(&[]), Err(Error::Empty)));
        assert!(matches!(
            Image::parse(b"\x7FELF\x02\x01\x01\x00"),
            Err(Error::NotSupported)
        ));
    }

    #[test]
    fn truncated() {
        let bytes = ImageBuilder::new("Lib")
            .type_def("Ns", "Type")
            .method("Run", vec![Instruction::ret()])
            .build_bytes();

        for len in [3, 0x90, 0x1F0, 0x248] {
            assert!(Image::parse(&bytes[..len]).is_err(), "length {len}");
        }
    }

    #[test]
    fn dangling_member_parent() {
        let mut image = ImageBuilder::new("Lib")
            .assembly_ref("Other")
            .type_ref("Other", "Ns", "Type")
            .member_ref("Ns.Type", "Run")
            .build();
        image.member_refs[0].parent = Token::from_parts(Token::TYPE_REF, 7);

        let bytes = image.to_bytes().unwrap().bytes;
        assert!(matches!(Image::parse(&bytes), Err(Error::Malformed { .. })));
    }

    #[test]
    fn user_strings() {
        let image = ImageBuilder::new("Lib")
            .type_def("Ns", "Type")
            .method(
                "Greet",
                vec![
                    Instruction::new(opcodes::LDSTR, Operand::Token(Token::new(0x7000_0002))),
                    Instruction::ret(),
                ],
            )
            .user_string("Loader ü")
            .user_string("second")
            .build();
        let parsed = Image::parse(&image.to_bytes().unwrap().bytes).unwrap();

        assert_eq!(parsed.user_string(Token::new(0x7000_0001)), Some("Loader ü"));
        assert_eq!(parsed.user_string(Token::new(0x7000_0002)), Some("second"));
        assert_eq!(parsed.user_string(Token::new(0x7000_0003)), None);

        let body = parsed.methods[0].body.as_ref().unwrap();
        assert_eq!(
            body.instructions[0].operand,
            Operand::Token(Token::new(0x7000_0002))
        );
    }

    #[test]
    fn module_without_manifest() {
        let mut image = ImageBuilder::new("Plugin").build();
        image.identity.version = ModuleVersion::new(1, 0, 0, 0);
        let bytes = image.to_bytes().unwrap().bytes;

        let parsed = Image::parse(&bytes).unwrap();
        let container = parsed.container.as_deref().unwrap();
        let mut tables = container.tables.clone();
        tables.rows_mut(TableId::Assembly).clear();

        let heaps = Heaps::from(container).unwrap();
        let identity = identity_from(&tables, &heaps).unwrap();
        assert_eq!(identity, ModuleIdentity::new("Plugin"));
    }

    #[test]
    fn reference_tokens() {
        let token = [1, 2, 3, 4, 5, 6, 7, 8];
        assert_eq!(reference_token(0, &token), Some(token));
        assert_eq!(reference_token(0, &[]), None);
        assert_eq!(
            reference_token(ASSEMBLY_FULL_PUBLIC_KEY, b"abc"),
            Some(public_key_token(b"abc"))
        );
        assert_eq!(reference_token(0, b"a full key"), Some(public_key_token(b"a full key")));
    }
}
