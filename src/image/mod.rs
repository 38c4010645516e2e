//! The structural representation of a module image.
//!
//! An [`Image`] is everything a free patch can touch: the module identity, the metadata
//! tables that instruction operands refer to, and the decoded method bodies. It is a
//! projection of a PE/ECMA-335 module: [`Image::parse`] reads the `Assembly`, `AssemblyRef`,
//! `TypeRef`, `TypeDef`, `NestedClass`, `MethodDef` and `MemberRef` tables plus the user
//! string heap into plain rows, and keeps everything else (the PE headers and sections,
//! the remaining tables, the original heaps and the debug directory) in a container that
//! [`Image::to_bytes`] writes back around the modified rows.
//!
//! Images built from scratch have no container; writing one produces a minimal IL-only
//! PE32 library holding just the modelled tables.
//!
//! # Key Components
//!
//! - [`Image`] - The parsed module
//! - [`ModuleIdentity`] - Name, version, culture and public key token
//! - [`Token`] - Metadata table references
//! - [`MethodImport`] - A method in another module that a patch wants to call
//! - [`PdbId`] - The id tying an image to its portable symbols
//!
//! # Examples
//!
//! ```rust,no_run
//! use dotswap::image::Image;
//!
//! let data = std::fs::read("Managed/Assembly-CSharp.dll")?;
//! let image = Image::parse(&data)?;
//!
//! if let Some(method) = image.find_method("Game.Audio.MusicManager", ".cctor") {
//!     println!("{} instructions", image.methods[method].body.as_ref().map_or(0, |b| b.instructions.len()));
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod body;
mod identity;
mod import;
mod pe;
mod reader;
mod tables;
mod token;
mod writer;

use std::{ops::Range, sync::Arc};

use bitflags::bitflags;

pub use body::{ExceptionHandler, ExceptionHandlerFlags, MethodBody, MethodBodyFlags, SectionFlags};
pub use identity::{public_key_token, ModuleIdentity, ModuleVersion};
pub use import::MethodImport;
pub use tables::{
    join_type_name, split_type_name, MemberRef, MethodAttributes, MethodDef, TypeAttributes,
    TypeDef, TypeRef,
};
pub use token::Token;
pub use writer::WrittenImage;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    /// Runtime flags of the CLI header (ECMA-335 II.25.3.3.1)
    pub struct ImageFlags: u32 {
        /// The image contains only IL code
        const IL_ONLY = 0x0000_0001;
        /// The image can only be loaded into a 32-bit process
        const REQUIRED_32BIT = 0x0000_0002;
        /// The image has a strong name signature
        const STRONG_NAME_SIGNED = 0x0000_0008;
        /// The entry point token refers to native code
        const NATIVE_ENTRYPOINT = 0x0000_0010;
        /// The image prefers to run as a 32-bit process
        const PREFERRED_32BIT = 0x0002_0000;
    }
}

/// Identifies the portable symbols that belong to an image: the guid and stamp of its
/// CodeView debug entry, or the MVID with a zero stamp for images without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PdbId {
    /// Guid part, 16 bytes
    pub guid: uguid::Guid,
    /// Stamp part, the time stamp of the CodeView entry
    pub stamp: u32,
}

/// Resolved name of a method referenced by an instruction operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberName {
    /// Member name
    pub name: String,
    /// Full name of the declaring type, if it could be resolved
    pub declaring_type: Option<String>,
}

/// A parsed module image.
///
/// Images compare by their modelled rows; the container of a parsed image is not part of
/// the comparison.
#[derive(Debug, Clone)]
pub struct Image {
    /// CLI header flags
    pub flags: ImageFlags,
    /// Module version id
    pub mvid: uguid::Guid,
    /// Module identity
    pub identity: ModuleIdentity,
    /// Referenced modules
    pub assembly_refs: Vec<ModuleIdentity>,
    /// Referenced types
    pub type_refs: Vec<TypeRef>,
    /// Defined types, each owning a consecutive run of `methods`
    pub type_defs: Vec<TypeDef>,
    /// Defined methods
    pub methods: Vec<MethodDef>,
    /// Referenced members
    pub member_refs: Vec<MemberRef>,
    /// User strings in heap order. While the image is parsed, `ldstr` operands address
    /// them by 1-based position instead of heap offset.
    pub user_strings: Vec<String>,
    /// Compressed symbol entry, when symbols are embedded into the image
    pub embedded_symbols: Option<Vec<u8>>,
    pub(crate) container: Option<Arc<pe::Container>>,
}

impl PartialEq for Image {
    fn eq(&self, other: &Self) -> bool {
        self.flags == other.flags
            && self.mvid == other.mvid
            && self.identity == other.identity
            && self.assembly_refs == other.assembly_refs
            && self.type_refs == other.type_refs
            && self.type_defs == other.type_defs
            && self.methods == other.methods
            && self.member_refs == other.member_refs
            && self.user_strings == other.user_strings
            && self.embedded_symbols == other.embedded_symbols
    }
}

impl Image {
    /// An empty image for `identity`.
    #[must_use]
    pub fn new(identity: ModuleIdentity, mvid: uguid::Guid) -> Self {
        Image {
            flags: ImageFlags::IL_ONLY,
            mvid,
            identity,
            assembly_refs: Vec::new(),
            type_refs: Vec::new(),
            type_defs: Vec::new(),
            methods: Vec::new(),
            member_refs: Vec::new(),
            user_strings: Vec::new(),
            embedded_symbols: None,
            container: None,
        }
    }

    /// The id that the portable symbols of this image carry.
    #[must_use]
    pub fn pdb_id(&self) -> PdbId {
        self.container
            .as_ref()
            .and_then(|container| container.pdb_id())
            .unwrap_or(PdbId {
                guid: self.mvid,
                stamp: 0,
            })
    }

    /// Returns true if the image was parsed from a PE file, as opposed to built in memory.
    #[must_use]
    pub fn has_container(&self) -> bool {
        self.container.is_some()
    }

    /// The range of `methods` owned by the type at `type_index`.
    #[must_use]
    pub fn type_methods(&self, type_index: usize) -> Range<usize> {
        let start: usize = self
            .type_defs
            .iter()
            .take(type_index)
            .map(|t| t.method_count as usize)
            .sum();
        let count = self
            .type_defs
            .get(type_index)
            .map_or(0, |t| t.method_count as usize);

        start.min(self.methods.len())..(start + count).min(self.methods.len())
    }

    /// Index of the type owning the method at `method_index`.
    #[must_use]
    pub fn method_owner(&self, method_index: usize) -> Option<usize> {
        let mut end = 0usize;
        for (index, type_def) in self.type_defs.iter().enumerate() {
            end += type_def.method_count as usize;
            if method_index < end {
                return Some(index);
            }
        }
        None
    }

    /// Indices of the types that are not nested in another type.
    #[must_use]
    pub fn top_level_types(&self) -> Vec<usize> {
        (0..self.type_defs.len())
            .filter(|index| self.type_defs[*index].enclosing.is_none())
            .collect()
    }

    /// Indices of the types directly nested in `type_index`.
    #[must_use]
    pub fn nested_types(&self, type_index: usize) -> Vec<usize> {
        (0..self.type_defs.len())
            .filter(|index| self.type_defs[*index].enclosing == Some(type_index))
            .collect()
    }

    /// Full name of a defined type; nested types are written `Outer/Inner`.
    #[must_use]
    pub fn type_def_full_name(&self, type_index: usize) -> Option<String> {
        let mut current = self.type_defs.get(type_index)?;
        let mut name = join_type_name(&current.namespace, &current.name);

        // Bounded by the table size so a malformed enclosing cycle terminates
        for _ in 0..self.type_defs.len() {
            let Some(enclosing) = current.enclosing else {
                return Some(name);
            };
            current = self.type_defs.get(enclosing)?;
            name = format!(
                "{}/{}",
                join_type_name(&current.namespace, &current.name),
                name
            );
        }

        None
    }

    /// Full name of a referenced type; nested references are written `Outer/Inner`.
    #[must_use]
    pub fn type_ref_full_name(&self, ref_index: usize) -> Option<String> {
        let mut current = self.type_refs.get(ref_index)?;
        let mut name = join_type_name(&current.namespace, &current.name);

        for _ in 0..self.type_refs.len() {
            if current.scope.table() != Token::TYPE_REF {
                return Some(name);
            }
            current = self.type_refs.get(current.scope.index()?)?;
            name = format!(
                "{}/{}",
                join_type_name(&current.namespace, &current.name),
                name
            );
        }

        None
    }

    /// Full name of the type a `TypeRef` or `TypeDef` token points to.
    #[must_use]
    pub fn type_full_name(&self, token: Token) -> Option<String> {
        match token.table() {
            Token::TYPE_REF => self.type_ref_full_name(token.index()?),
            Token::TYPE_DEF => self.type_def_full_name(token.index()?),
            _ => None,
        }
    }

    /// Find a defined type by full name.
    #[must_use]
    pub fn find_type_def(&self, full_name: &str) -> Option<usize> {
        (0..self.type_defs.len())
            .find(|index| self.type_def_full_name(*index).as_deref() == Some(full_name))
    }

    /// Find a method by declaring type full name and method name.
    ///
    /// Returns the first overload with that name.
    #[must_use]
    pub fn find_method(&self, type_full_name: &str, method_name: &str) -> Option<usize> {
        let type_index = self.find_type_def(type_full_name)?;
        self.type_methods(type_index)
            .find(|index| self.methods[*index].name == method_name)
    }

    /// The `MethodDef` token of the method at `method_index`.
    #[must_use]
    pub fn method_token(&self, method_index: usize) -> Option<Token> {
        if method_index >= self.methods.len() {
            return None;
        }
        Token::from_index(Token::METHOD_DEF, method_index)
    }

    /// Resolve the name of a `MethodDef` or `MemberRef` token.
    #[must_use]
    pub fn member_name(&self, token: Token) -> Option<MemberName> {
        match token.table() {
            Token::METHOD_DEF => {
                let index = token.index()?;
                let method = self.methods.get(index)?;
                Some(MemberName {
                    name: method.name.clone(),
                    declaring_type: self
                        .method_owner(index)
                        .and_then(|owner| self.type_def_full_name(owner)),
                })
            }
            Token::MEMBER_REF => {
                let member = self.member_refs.get(token.index()?)?;
                Some(MemberName {
                    name: member.name.clone(),
                    declaring_type: self.type_full_name(member.parent),
                })
            }
            _ => None,
        }
    }

    /// The user string behind an `ldstr` token.
    #[must_use]
    pub fn user_string(&self, token: Token) -> Option<&str> {
        if token.table() != Token::USER_STRING {
            return None;
        }
        self.user_strings.get(token.index()?).map(String::as_str)
    }

    /// Returns true if this image references a module with the simple name `name`.
    #[must_use]
    pub fn references(&self, name: &str) -> bool {
        self.assembly_refs.iter().any(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::ImageBuilder;

    fn sample() -> Image {
        ImageBuilder::new("Sample")
            .assembly_ref("UnityEngine")
            .type_ref("UnityEngine", "UnityEngine", "GameObject")
            .type_def("Game.Audio", "MusicManager")
            .method(".cctor", vec![crate::assembly::Instruction::ret()])
            .method("CreateMixer", vec![crate::assembly::Instruction::ret()])
            .nested_type_def("Inner")
            .method("Run", vec![crate::assembly::Instruction::ret()])
            .member_ref("UnityEngine.GameObject", "AddComponent")
            .build()
    }

    #[test]
    fn method_ownership() {
        let image = sample();
        assert_eq!(image.type_methods(0), 0..2);
        assert_eq!(image.type_methods(1), 2..3);
        assert_eq!(image.method_owner(1), Some(0));
        assert_eq!(image.method_owner(2), Some(1));
        assert_eq!(image.method_owner(3), None);
    }

    #[test]
    fn type_names() {
        let image = sample();
        assert_eq!(
            image.type_def_full_name(1).as_deref(),
            Some("Game.Audio.MusicManager/Inner")
        );
        assert_eq!(image.top_level_types(), vec![0]);
        assert_eq!(image.nested_types(0), vec![1]);
        assert_eq!(
            image.type_full_name(Token::new(0x0100_0001)).as_deref(),
            Some("UnityEngine.GameObject")
        );
        assert_eq!(image.find_type_def("Game.Audio.MusicManager/Inner"), Some(1));
    }

    #[test]
    fn method_lookup() {
        let image = sample();
        assert_eq!(
            image.find_method("Game.Audio.MusicManager", "CreateMixer"),
            Some(1)
        );
        assert_eq!(image.find_method("Game.Audio.MusicManager", "Missing"), None);
        assert_eq!(image.method_token(2), Some(Token::new(0x0600_0003)));
        assert_eq!(image.method_token(3), None);

        let name = image.member_name(Token::new(0x0600_0002)).unwrap();
        assert_eq!(name.name, "CreateMixer");
        assert_eq!(
            name.declaring_type.as_deref(),
            Some("Game.Audio.MusicManager")
        );

        let name = image.member_name(Token::new(0x0A00_0001)).unwrap();
        assert_eq!(name.name, "AddComponent");
        assert_eq!(name.declaring_type.as_deref(), Some("UnityEngine.GameObject"));
        assert!(image.references("UnityEngine"));
        assert!(!image.references("Assembly-CSharp"));
    }

    #[test]
    fn enclosing_cycle_terminates() {
        let mut image = sample();
        image.type_defs[0].enclosing = Some(1);
        assert_eq!(image.type_def_full_name(1), None);
    }
}
