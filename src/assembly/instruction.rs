//! Decoded CIL instructions and the metadata describing them.
//!
//! A method body is held as an ordered `Vec<Instruction>`. Branch operands do not carry
//! byte offsets; they carry the *index* of the target instruction inside that vector. This
//! keeps rewrites simple (dropping or replacing instructions never has to patch relative
//! displacements) and leaves it to [`crate::assembly::encoder`] to lay the sequence out
//! again and pick short or long branch forms.
//!
//! # Key Components
//!
//! - [`Instruction`] - One instruction: opcode, prefix, operand and optional source position
//! - [`Operand`] - Typed operand, with branch targets as instruction indices
//! - [`Immediate`] - Constant operands
//! - [`OperandType`] - Operand encoding as listed in the opcode tables
//! - [`FlowType`] / [`InstructionCategory`] / [`StackBehavior`] - Static opcode metadata
//!
//! # Examples
//!
//! ```rust
//! use dotswap::assembly::{opcodes, Instruction, Operand, FlowType};
//! use dotswap::image::Token;
//!
//! let call = Instruction::new(opcodes::CALL, Operand::Token(Token::new(0x0A00_0001)));
//! assert!(call.is_call());
//! assert_eq!(call.mnemonic(), "call");
//! assert_eq!(call.flow_type(), Some(FlowType::Call));
//! assert_eq!(call.to_string(), "call 0x0a000001");
//! ```

use std::fmt::{self, UpperHex};

use crate::{
    assembly::{instructions::lookup, opcodes, CilInstruction},
    image::Token,
    symbols::SequencePoint,
};

/// Types of operands for CIL instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    /// No operand
    None,
    /// Signed 8-bit immediate or short branch displacement
    Int8,
    /// Unsigned 8-bit immediate (short local and argument indices)
    UInt8,
    /// Signed 16-bit immediate
    Int16,
    /// Unsigned 16-bit immediate (long local and argument indices)
    UInt16,
    /// Signed 32-bit immediate or long branch displacement
    Int32,
    /// Unsigned 32-bit immediate
    UInt32,
    /// Signed 64-bit immediate
    Int64,
    /// Unsigned 64-bit immediate
    UInt64,
    /// 32-bit float
    Float32,
    /// 64-bit float
    Float64,
    /// Metadata token
    Token,
    /// Switch table operand
    Switch,
}

impl OperandType {
    /// Returns the size in bytes of this operand type.
    ///
    /// Returns `None` for `Switch`, whose size depends on the number of targets.
    #[must_use]
    pub const fn size(&self) -> Option<usize> {
        match self {
            OperandType::None => Some(0),
            OperandType::Int8 | OperandType::UInt8 => Some(1),
            OperandType::Int16 | OperandType::UInt16 => Some(2),
            OperandType::Int32
            | OperandType::UInt32
            | OperandType::Float32
            | OperandType::Token => Some(4),
            OperandType::Int64 | OperandType::UInt64 | OperandType::Float64 => Some(8),
            OperandType::Switch => None,
        }
    }
}

/// An immediate value embedded in the instruction stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Immediate {
    /// Signed 8-bit immediate value
    Int8(i8),
    /// Unsigned 8-bit immediate value
    UInt8(u8),
    /// Signed 16-bit immediate value
    Int16(i16),
    /// Unsigned 16-bit immediate value
    UInt16(u16),
    /// Signed 32-bit immediate value
    Int32(i32),
    /// Unsigned 32-bit immediate value
    UInt32(u32),
    /// Signed 64-bit immediate value
    Int64(i64),
    /// Unsigned 64-bit immediate value
    UInt64(u64),
    /// 32-bit floating point immediate value
    Float32(f32),
    /// 64-bit floating point immediate value
    Float64(f64),
}

impl UpperHex for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Immediate::Int8(value) => write!(f, "{value:02X}"),
            Immediate::UInt8(value) => write!(f, "{value:02X}"),
            Immediate::Int16(value) => write!(f, "{value:04X}"),
            Immediate::UInt16(value) => write!(f, "{value:04X}"),
            Immediate::Int32(value) => write!(f, "{value:08X}"),
            Immediate::UInt32(value) => write!(f, "{value:08X}"),
            Immediate::Int64(value) => write!(f, "{value:016X}"),
            Immediate::UInt64(value) => write!(f, "{value:016X}"),
            Immediate::Float32(value) => write!(f, "{:08X}", value.to_bits()),
            Immediate::Float64(value) => write!(f, "{:016X}", value.to_bits()),
        }
    }
}

impl fmt::Display for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Immediate::Int8(value) => write!(f, "{value}"),
            Immediate::UInt8(value) => write!(f, "{value}"),
            Immediate::Int16(value) => write!(f, "{value}"),
            Immediate::UInt16(value) => write!(f, "{value}"),
            Immediate::Int32(value) => write!(f, "{value}"),
            Immediate::UInt32(value) => write!(f, "{value}"),
            Immediate::Int64(value) => write!(f, "{value}"),
            Immediate::UInt64(value) => write!(f, "{value}"),
            Immediate::Float32(value) => write!(f, "{value}"),
            Immediate::Float64(value) => write!(f, "{value}"),
        }
    }
}

/// The operand of a decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand present
    None,
    /// Immediate value (constant embedded in instruction)
    Immediate(Immediate),
    /// Metadata token reference
    Token(Token),
    /// Branch target, as an index into the owning instruction sequence
    Target(usize),
    /// Switch table, one instruction index per case
    Switch(Vec<usize>),
}

/// Control flow behaviour of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Falls through to the next instruction
    Sequential,
    /// Either branches or falls through
    ConditionalBranch,
    /// Always branches
    UnconditionalBranch,
    /// Calls a method and continues after it returns
    Call,
    /// Returns from the method
    Return,
    /// Multi-way branch
    Switch,
    /// Raises an exception
    Throw,
    /// Ends a finally or fault handler
    EndFinally,
    /// Leaves a protected region
    Leave,
}

impl FlowType {
    /// Returns true if the operand of an instruction with this flow is a single branch
    /// displacement.
    #[must_use]
    pub const fn is_branch_like(&self) -> bool {
        matches!(
            self,
            FlowType::ConditionalBranch | FlowType::UnconditionalBranch | FlowType::Leave
        )
    }
}

/// Stack effect of an instruction.
///
/// Call-like instructions report only their fixed part; the rest depends on the target
/// signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBehavior {
    /// Number of items popped from stack
    pub pops: u8,
    /// Number of items pushed to stack
    pub pushes: u8,
    /// Net effect on stack depth (pushes - pops)
    pub net_effect: i8,
}

/// Categorization of instructions by their primary function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionCategory {
    /// Arithmetic operations (add, sub, mul, div, rem, neg)
    Arithmetic,
    /// Bitwise and logical operations (and, or, xor, not, shl, shr)
    BitwiseLogical,
    /// Comparison operations (ceq, cgt, clt)
    Comparison,
    /// Control flow operations (br, switch, ret, call)
    ControlFlow,
    /// Type conversion operations (conv.i4, conv.r8, box, unbox)
    Conversion,
    /// Load and store operations (ldloc, stfld, ldarg)
    LoadStore,
    /// Object model operations (newobj, ldfld, castclass)
    ObjectModel,
    /// Prefix instructions (unaligned, volatile, tail)
    Prefix,
    /// Miscellaneous operations (nop, break, dup)
    Misc,
}

/// One instruction of a method body.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Opcode byte (the second byte for `0xFE` prefixed opcodes)
    pub opcode: u8,
    /// `0xFE` for two-byte opcodes, 0 otherwise
    pub prefix: u8,
    /// Typed operand
    pub operand: Operand,
    /// Source position attached to this instruction, if symbols were loaded
    pub sequence_point: Option<SequencePoint>,
}

impl Instruction {
    /// Create a single-byte opcode instruction.
    #[must_use]
    pub fn new(opcode: u8, operand: Operand) -> Self {
        Instruction {
            opcode,
            prefix: 0,
            operand,
            sequence_point: None,
        }
    }

    /// Create a `0xFE` prefixed instruction.
    #[must_use]
    pub fn prefixed(opcode: u8, operand: Operand) -> Self {
        Instruction {
            opcode,
            prefix: opcodes::FE_PREFIX,
            operand,
            sequence_point: None,
        }
    }

    /// A bare `ret`.
    #[must_use]
    pub fn ret() -> Self {
        Instruction::new(opcodes::RET, Operand::None)
    }

    /// The opcode table entry, `None` for reserved or unknown opcodes.
    #[must_use]
    pub fn info(&self) -> Option<&'static CilInstruction> {
        lookup(self.prefix, self.opcode)
    }

    /// Mnemonic of this instruction, `"???"` for unknown opcodes.
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        self.info().map_or("???", |info| info.instr)
    }

    /// Control flow type, `None` for unknown opcodes.
    #[must_use]
    pub fn flow_type(&self) -> Option<FlowType> {
        self.info().map(|info| info.flow)
    }

    /// Fixed stack effect, `None` for unknown opcodes.
    #[must_use]
    pub fn stack_behavior(&self) -> Option<StackBehavior> {
        self.info().map(|info| StackBehavior {
            pops: info.stack_pops,
            pushes: info.stack_pushes,
            #[allow(clippy::cast_possible_wrap)]
            net_effect: info.stack_pushes as i8 - info.stack_pops as i8,
        })
    }

    /// Returns true for `call`, `callvirt` and `newobj`.
    #[must_use]
    pub fn is_call(&self) -> bool {
        self.prefix == 0
            && matches!(
                self.opcode,
                opcodes::CALL | opcodes::CALLVIRT | opcodes::NEWOBJ
            )
    }

    /// Returns true for instructions that may transfer control to another instruction of
    /// the same body.
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(
            self.flow_type(),
            Some(
                FlowType::ConditionalBranch
                    | FlowType::UnconditionalBranch
                    | FlowType::Switch
                    | FlowType::Leave
            )
        )
    }

    /// Returns true if execution never falls through to the next instruction.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.flow_type(),
            Some(
                FlowType::Return
                    | FlowType::Throw
                    | FlowType::UnconditionalBranch
                    | FlowType::Leave
                    | FlowType::EndFinally
            )
        )
    }

    /// The metadata token operand, if any.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        match self.operand {
            Operand::Token(token) => Some(token),
            _ => None,
        }
    }

    /// Indices of all branch targets of this instruction.
    #[must_use]
    pub fn targets(&self) -> Vec<usize> {
        match &self.operand {
            Operand::Target(target) => vec![*target],
            Operand::Switch(targets) => targets.clone(),
            _ => Vec::new(),
        }
    }

    /// Encoded size in bytes for the current opcode form.
    #[must_use]
    pub fn size(&self) -> usize {
        let opcode_size = if self.prefix == 0 { 1 } else { 2 };
        let operand_size = match &self.operand {
            Operand::Switch(targets) => 4 + targets.len() * 4,
            _ => self
                .info()
                .and_then(|info| info.op_type.size())
                .unwrap_or(0),
        };

        opcode_size + operand_size
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())?;
        match &self.operand {
            Operand::None => Ok(()),
            Operand::Immediate(imm) => write!(f, " {imm}"),
            Operand::Token(token) => write!(f, " {token}"),
            Operand::Target(target) => write!(f, " IL_{target:04}"),
            Operand::Switch(targets) => {
                write!(f, " (")?;
                for (i, target) in targets.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "IL_{target:04}")?;
                }
                write!(f, ")")
            }
        }
    }
}
