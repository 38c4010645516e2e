//! Metadata tokens.
//!
//! A token is a 32-bit value whose high byte names a metadata table and whose low 24 bits
//! are a 1-based row index inside that table (ECMA-335 II.22). Instruction operands that
//! reference types, methods, member references or user strings are tokens, and so are the
//! parent and scope columns of the reference tables in a module image.

use std::fmt;

/// A metadata token: table id in the high byte, 1-based row in the low 24 bits.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Token(pub u32);

impl Token {
    /// The `Module` table id
    pub const MODULE: u8 = 0x00;
    /// The `TypeRef` table id
    pub const TYPE_REF: u8 = 0x01;
    /// The `TypeDef` table id
    pub const TYPE_DEF: u8 = 0x02;
    /// The `MethodDef` table id
    pub const METHOD_DEF: u8 = 0x06;
    /// The `MemberRef` table id
    pub const MEMBER_REF: u8 = 0x0A;
    /// The `ModuleRef` table id
    pub const MODULE_REF: u8 = 0x1A;
    /// The `TypeSpec` table id
    pub const TYPE_SPEC: u8 = 0x1B;
    /// The `AssemblyRef` table id
    pub const ASSEMBLY_REF: u8 = 0x23;
    /// The user string heap id
    pub const USER_STRING: u8 = 0x70;

    /// Create a token from its raw value.
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Create a token from a table id and a 1-based row.
    #[must_use]
    pub fn from_parts(table: u8, row: u32) -> Self {
        Token((u32::from(table) << 24) | (row & 0x00FF_FFFF))
    }

    /// Create a token for the 0-based `index` into `table`.
    ///
    /// Returns `None` if the row does not fit into 24 bits.
    #[must_use]
    pub fn from_index(table: u8, index: usize) -> Option<Self> {
        let row = u32::try_from(index + 1).ok()?;
        if row > 0x00FF_FFFF {
            return None;
        }

        Some(Token::from_parts(table, row))
    }

    /// The raw value.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// The table id.
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// The 1-based row.
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// The 0-based index into the table, `None` for row 0.
    #[must_use]
    pub fn index(&self) -> Option<usize> {
        (self.row() as usize).checked_sub(1)
    }

    /// Returns true for the null token.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts() {
        let token = Token::from_parts(Token::MEMBER_REF, 3);
        assert_eq!(token.value(), 0x0A00_0003);
        assert_eq!(token.table(), Token::MEMBER_REF);
        assert_eq!(token.row(), 3);
        assert_eq!(token.index(), Some(2));
    }

    #[test]
    fn from_index() {
        assert_eq!(
            Token::from_index(Token::TYPE_REF, 0),
            Some(Token::new(0x0100_0001))
        );
        assert_eq!(Token::from_index(Token::TYPE_REF, 0x00FF_FFFF), None);
    }

    #[test]
    fn null() {
        assert!(Token::default().is_null());
        assert_eq!(Token::default().index(), None);
        assert!(!Token::new(0x0600_0001).is_null());
    }

    #[test]
    fn formatting() {
        let token = Token::new(0x0600_0001);
        assert_eq!(format!("{token}"), "0x06000001");
        let debug = format!("{token:?}");
        assert!(debug.contains("table: 0x06"));
        assert!(debug.contains("row: 1"));
    }
}
