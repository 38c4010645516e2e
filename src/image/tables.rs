//! Rows of the metadata tables carried by a module image.
//!
//! Only the tables that instruction operands and the reload machinery need are modelled:
//! `TypeRef`, `TypeDef`, `MethodDef` and `MemberRef` (plus `AssemblyRef`, whose rows are
//! plain [`crate::image::ModuleIdentity`] values). Rows reference each other through
//! [`Token`]s exactly as in ECMA-335, so an instruction operand can be resolved without
//! any extra indirection.

use bitflags::bitflags;

use crate::image::{MethodBody, Token};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Type attributes (subset of ECMA-335 II.23.1.15)
    pub struct TypeAttributes: u32 {
        /// Visible outside the module
        const PUBLIC = 0x0000_0001;
        /// Nested type with public visibility
        const NESTED_PUBLIC = 0x0000_0002;
        /// Nested type with private visibility
        const NESTED_PRIVATE = 0x0000_0003;
        /// Type is an interface
        const INTERFACE = 0x0000_0020;
        /// Type is abstract
        const ABSTRACT = 0x0000_0080;
        /// Type is sealed
        const SEALED = 0x0000_0100;
        /// Type initializer may run before first static field access
        const BEFORE_FIELD_INIT = 0x0010_0000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Method attributes (subset of ECMA-335 II.23.1.10)
    pub struct MethodAttributes: u16 {
        /// Private visibility
        const PRIVATE = 0x0001;
        /// Public visibility
        const PUBLIC = 0x0006;
        /// Static method
        const STATIC = 0x0010;
        /// Virtual method
        const VIRTUAL = 0x0040;
        /// Hide by name and signature
        const HIDE_BY_SIG = 0x0080;
        /// Abstract method
        const ABSTRACT = 0x0400;
        /// Special name
        const SPECIAL_NAME = 0x0800;
        /// Runtime special name (constructors)
        const RT_SPECIAL_NAME = 0x1000;
    }
}

/// A reference to a type defined in another module (or nested in another reference).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRef {
    /// `AssemblyRef` token, `TypeRef` token for nested references, or null
    pub scope: Token,
    /// Namespace, empty for nested references
    pub namespace: String,
    /// Short name
    pub name: String,
}

/// A type defined in this module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDef {
    /// Type attributes
    pub flags: TypeAttributes,
    /// Namespace, empty for nested types
    pub namespace: String,
    /// Short name
    pub name: String,
    /// Index of the enclosing type for nested types
    pub enclosing: Option<usize>,
    /// Number of consecutive `MethodDef` rows owned by this type
    pub method_count: u32,
}

/// A method defined in this module.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDef {
    /// Method attributes
    pub flags: MethodAttributes,
    /// Name, `.ctor` and `.cctor` for constructors
    pub name: String,
    /// Method signature blob (ECMA-335 II.23.2.1)
    pub signature: Vec<u8>,
    /// Body, `None` for abstract and runtime implemented methods
    pub body: Option<MethodBody>,
}

/// A reference to a field or method of a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef {
    /// `TypeRef` or `TypeDef` token of the declaring type
    pub parent: Token,
    /// Member name
    pub name: String,
    /// Field or method signature blob
    pub signature: Vec<u8>,
}

impl MemberRef {
    /// Field signatures start with `0x06` (ECMA-335 II.23.2.4).
    #[must_use]
    pub fn is_field(&self) -> bool {
        self.signature.first() == Some(&0x06)
    }
}

/// Join a namespace and a short name the way the runtime prints type names.
#[must_use]
pub fn join_type_name(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}.{name}")
    }
}

/// Split a full name at its last `.` into namespace and short name.
#[must_use]
pub fn split_type_name(full_name: &str) -> (&str, &str) {
    match full_name.rsplit_once('.') {
        Some((namespace, name)) => (namespace, name),
        None => ("", full_name),
    }
}
