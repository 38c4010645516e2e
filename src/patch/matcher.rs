//! Instruction matching for free patches.
//!
//! Patches locate the instructions they rewrite by what the operand refers to, not by
//! position, so they keep working when unrelated code around the call site changes between
//! versions of a module.

use crate::{
    assembly::Instruction,
    image::{Image, Token},
};

/// Selects methods by name and, optionally, declaring type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodMatcher {
    /// Method name
    pub name: String,
    /// Full name of the declaring type, nested types written `Outer/Inner`
    pub declaring_type: Option<String>,
}

impl MethodMatcher {
    /// Match every method called `name`.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        MethodMatcher {
            name: name.into(),
            declaring_type: None,
        }
    }

    /// Restrict the match to methods declared on `declaring_type`.
    #[must_use]
    pub fn on_type(mut self, declaring_type: impl Into<String>) -> Self {
        self.declaring_type = Some(declaring_type.into());
        self
    }

    /// Returns true if `token` names a method this matcher selects.
    ///
    /// Field references never match, even if their name does.
    #[must_use]
    pub fn matches(&self, image: &Image, token: Token) -> bool {
        if token.table() == Token::MEMBER_REF {
            let is_field = token
                .index()
                .and_then(|index| image.member_refs.get(index))
                .is_some_and(|member| member.is_field());
            if is_field {
                return false;
            }
        }

        let Some(member) = image.member_name(token) else {
            return false;
        };

        member.name == self.name
            && self
                .declaring_type
                .as_ref()
                .map_or(true, |expected| member.declaring_type.as_ref() == Some(expected))
    }
}

/// Selects single instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstructionPattern {
    /// Any instruction whose operand is a method selected by the matcher
    Calls(MethodMatcher),
    /// Any instruction whose rendered operand contains the text
    Mentions(String),
    /// A specific opcode
    OpCode {
        /// `0xFE` for two-byte opcodes, 0 otherwise
        prefix: u8,
        /// Opcode byte
        opcode: u8,
    },
}

impl InstructionPattern {
    /// Returns true if `instruction`, read in the context of `image`, is selected.
    #[must_use]
    pub fn matches(&self, image: &Image, instruction: &Instruction) -> bool {
        match self {
            InstructionPattern::Calls(matcher) => instruction
                .token()
                .is_some_and(|token| matcher.matches(image, token)),
            InstructionPattern::Mentions(text) => instruction
                .token()
                .and_then(|token| render_operand(image, token))
                .is_some_and(|rendered| rendered.contains(text.as_str())),
            InstructionPattern::OpCode { prefix, opcode } => {
                instruction.prefix == *prefix && instruction.opcode == *opcode
            }
        }
    }
}

/// Human readable form of a token operand: `Type::Member` for members, the full name for
/// types and the literal for user strings.
#[must_use]
pub fn render_operand(image: &Image, token: Token) -> Option<String> {
    match token.table() {
        Token::METHOD_DEF | Token::MEMBER_REF => {
            let member = image.member_name(token)?;
            Some(match member.declaring_type {
                Some(declaring_type) => format!("{}::{}", declaring_type, member.name),
                None => member.name,
            })
        }
        Token::TYPE_REF | Token::TYPE_DEF => image.type_full_name(token),
        Token::USER_STRING => image.user_string(token).map(str::to_string),
        _ => None,
    }
}
