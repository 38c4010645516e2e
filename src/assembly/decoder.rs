//! CIL byte stream to instruction sequence.
//!
//! Decoding is done in two passes. The first pass reads every instruction front to back
//! and records branch targets as absolute byte offsets. The second pass maps those offsets
//! to instruction indices; a branch that lands inside another instruction (or outside the
//! body) makes the whole body malformed.
//!
//! The returned [`DecodedStream`] also carries the byte offset of every instruction, which
//! the body reader needs to turn exception handler ranges into index ranges.

use std::collections::HashMap;

use crate::{
    assembly::{lookup, opcodes, Immediate, Instruction, Operand, OperandType},
    file::parser::Parser,
    image::Token,
    Result,
};

/// Instructions decoded from one code stream.
#[derive(Debug, Clone, Default)]
pub struct DecodedStream {
    /// The instructions in stream order
    pub instructions: Vec<Instruction>,
    /// Byte offset of each instruction, followed by the total code length
    pub offsets: Vec<u32>,
}

impl DecodedStream {
    /// Map a byte offset to an instruction index.
    ///
    /// The total code length maps to `instructions.len()`, which is how exclusive range
    /// ends at the end of the body are expressed.
    #[must_use]
    pub fn index_of(&self, offset: u32) -> Option<usize> {
        self.offsets.binary_search(&offset).ok()
    }
}

enum RawOperand {
    Done(Operand),
    Target(i64),
    Switch(Vec<i64>),
}

/// Decode a complete code stream.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] on truncated instructions, and
/// [`crate::Error::Malformed`] for reserved opcodes or branches that do not land on an
/// instruction boundary.
pub fn decode_stream(code: &[u8]) -> Result<DecodedStream> {
    let mut parser = Parser::new(code);
    let mut raw = Vec::new();
    let mut offsets = Vec::new();

    while parser.has_more_data() {
        let offset = parser.pos();
        offsets.push(offset_u32(offset)?);
        raw.push(decode_raw(&mut parser, offset)?);
    }
    offsets.push(offset_u32(code.len())?);

    let by_offset: HashMap<i64, usize> = offsets
        .iter()
        .take(raw.len())
        .enumerate()
        .map(|(index, offset)| (i64::from(*offset), index))
        .collect();

    let resolve = |target: i64| -> Result<usize> {
        by_offset.get(&target).copied().ok_or_else(|| {
            malformed_error!("Branch target {:#x} is not an instruction boundary", target)
        })
    };

    let mut instructions = Vec::with_capacity(raw.len());
    for (prefix, opcode, operand) in raw {
        let operand = match operand {
            RawOperand::Done(operand) => operand,
            RawOperand::Target(target) => Operand::Target(resolve(target)?),
            RawOperand::Switch(targets) => Operand::Switch(
                targets
                    .into_iter()
                    .map(resolve)
                    .collect::<Result<Vec<_>>>()?,
            ),
        };

        instructions.push(Instruction {
            opcode,
            prefix,
            operand,
            sequence_point: None,
        });
    }

    Ok(DecodedStream {
        instructions,
        offsets,
    })
}

fn decode_raw(parser: &mut Parser, offset: usize) -> Result<(u8, u8, RawOperand)> {
    let first = parser.read_le::<u8>()?;
    let (prefix, opcode) = if first == opcodes::FE_PREFIX {
        (first, parser.read_le::<u8>()?)
    } else {
        (0, first)
    };

    let Some(info) = lookup(prefix, opcode) else {
        return Err(malformed_error!(
            "Invalid opcode {:#04x}{:02x} at offset {:#x}",
            prefix,
            opcode,
            offset
        ));
    };

    let is_branch_operand = info.flow.is_branch_like();
    let operand = match info.op_type {
        OperandType::None => RawOperand::Done(Operand::None),
        OperandType::Int8 if is_branch_operand => {
            let displacement = parser.read_le::<i8>()?;
            RawOperand::Target(next_offset(parser) + i64::from(displacement))
        }
        OperandType::Int32 if is_branch_operand => {
            let displacement = parser.read_le::<i32>()?;
            RawOperand::Target(next_offset(parser) + i64::from(displacement))
        }
        OperandType::Switch => {
            let count = parser.read_le::<u32>()? as usize;
            if count > parser.remaining() / 4 {
                return Err(malformed_error!(
                    "Switch at offset {:#x} has {} targets but only {} bytes remain",
                    offset,
                    count,
                    parser.remaining()
                ));
            }

            let mut displacements = Vec::with_capacity(count);
            for _ in 0..count {
                displacements.push(i64::from(parser.read_le::<i32>()?));
            }

            let base = next_offset(parser);
            RawOperand::Switch(displacements.into_iter().map(|d| base + d).collect())
        }
        OperandType::Token => RawOperand::Done(Operand::Token(Token::new(parser.read_le()?))),
        OperandType::Int8 => immediate(Immediate::Int8(parser.read_le()?)),
        OperandType::UInt8 => immediate(Immediate::UInt8(parser.read_le()?)),
        OperandType::Int16 => immediate(Immediate::Int16(parser.read_le()?)),
        OperandType::UInt16 => immediate(Immediate::UInt16(parser.read_le()?)),
        OperandType::Int32 => immediate(Immediate::Int32(parser.read_le()?)),
        OperandType::UInt32 => immediate(Immediate::UInt32(parser.read_le()?)),
        OperandType::Int64 => immediate(Immediate::Int64(parser.read_le()?)),
        OperandType::UInt64 => immediate(Immediate::UInt64(parser.read_le()?)),
        OperandType::Float32 => immediate(Immediate::Float32(parser.read_le()?)),
        OperandType::Float64 => immediate(Immediate::Float64(parser.read_le()?)),
    };

    Ok((prefix, opcode, operand))
}

fn immediate(value: Immediate) -> RawOperand {
    RawOperand::Done(Operand::Immediate(value))
}

fn next_offset(parser: &Parser) -> i64 {
    // Code streams are bounded by a u32 code size
    #[allow(clippy::cast_possible_wrap)]
    let position = parser.pos() as i64;
    position
}

fn offset_u32(offset: usize) -> Result<u32> {
    u32::try_from(offset).map_err(|_| malformed_error!("Code offset {:#x} exceeds u32", offset))
}
