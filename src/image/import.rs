//! Importing references to members of other modules.
//!
//! A patch that redirects a call site names its replacement by module identity, declaring
//! type, member name and signature. Before the instruction operand can be swapped, the
//! image needs rows that describe that member: an `AssemblyRef` for the module, a `TypeRef`
//! chain for the declaring type and a `MemberRef` for the method. Every step is
//! find-or-add, so importing the same method twice yields the same token and leaves the
//! tables untouched the second time.

use crate::{
    image::{split_type_name, Image, MemberRef, ModuleIdentity, Token, TypeRef},
    Result,
};

/// A method in some module that a rewritten instruction should call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodImport {
    /// Identity of the module that defines the method
    pub module: ModuleIdentity,
    /// Full name of the declaring type, nested types written `Outer/Inner`
    pub declaring_type: String,
    /// Method name
    pub name: String,
    /// Method signature blob
    pub signature: Vec<u8>,
}

impl MethodImport {
    /// Describe a method to import.
    #[must_use]
    pub fn new(
        module: ModuleIdentity,
        declaring_type: impl Into<String>,
        name: impl Into<String>,
        signature: Vec<u8>,
    ) -> Self {
        MethodImport {
            module,
            declaring_type: declaring_type.into(),
            name: name.into(),
            signature,
        }
    }
}

impl Image {
    /// Find or add an `AssemblyRef` for `identity`, matched by simple name.
    ///
    /// # Errors
    /// Returns an error if the table is full.
    pub fn import_assembly_ref(&mut self, identity: &ModuleIdentity) -> Result<Token> {
        let index = match self
            .assembly_refs
            .iter()
            .position(|r| r.name == identity.name)
        {
            Some(index) => index,
            None => {
                self.assembly_refs.push(identity.clone());
                self.assembly_refs.len() - 1
            }
        };

        token(Token::ASSEMBLY_REF, index)
    }

    /// Find or add a `TypeRef` with the given scope, namespace and name.
    ///
    /// # Errors
    /// Returns an error if the table is full.
    pub fn import_type_ref(&mut self, scope: Token, namespace: &str, name: &str) -> Result<Token> {
        let index = match self
            .type_refs
            .iter()
            .position(|r| r.scope == scope && r.namespace == namespace && r.name == name)
        {
            Some(index) => index,
            None => {
                self.type_refs.push(TypeRef {
                    scope,
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                });
                self.type_refs.len() - 1
            }
        };

        token(Token::TYPE_REF, index)
    }

    /// Find or add a `MemberRef` with the given parent, name and signature.
    ///
    /// # Errors
    /// Returns an error if the table is full.
    pub fn import_member_ref(
        &mut self,
        parent: Token,
        name: &str,
        signature: &[u8],
    ) -> Result<Token> {
        let index = match self
            .member_refs
            .iter()
            .position(|r| r.parent == parent && r.name == name && r.signature == signature)
        {
            Some(index) => index,
            None => {
                self.member_refs.push(MemberRef {
                    parent,
                    name: name.to_string(),
                    signature: signature.to_vec(),
                });
                self.member_refs.len() - 1
            }
        };

        token(Token::MEMBER_REF, index)
    }

    /// Resolve `import` to a token usable as a call operand in this image.
    ///
    /// Methods of this module resolve to their `MethodDef` token (first overload with a
    /// matching signature); everything else goes through the reference tables.
    ///
    /// # Errors
    /// Returns an error if the declaring type name is empty or a table is full.
    pub fn import_method(&mut self, import: &MethodImport) -> Result<Token> {
        if import.declaring_type.is_empty() {
            return Err(malformed_error!(
                "Import of '{}' has no declaring type",
                import.name
            ));
        }

        if import.module.name == self.identity.name {
            if let Some(type_index) = self.find_type_def(&import.declaring_type) {
                let local = self.type_methods(type_index).find(|index| {
                    let method = &self.methods[*index];
                    method.name == import.name && method.signature == import.signature
                });
                if let Some(index) = local {
                    return token(Token::METHOD_DEF, index);
                }
            }
        }

        let mut scope = self.import_assembly_ref(&import.module)?;
        let mut segments = import.declaring_type.split('/');
        if let Some(outer) = segments.next() {
            let (namespace, name) = split_type_name(outer);
            scope = self.import_type_ref(scope, namespace, name)?;
        }
        for nested in segments {
            scope = self.import_type_ref(scope, "", nested)?;
        }

        self.import_member_ref(scope, &import.name, &import.signature)
    }
}

fn token(table: u8, index: usize) -> Result<Token> {
    Token::from_index(table, index)
        .ok_or_else(|| malformed_error!("Table {:#04x} is full", table))
}
