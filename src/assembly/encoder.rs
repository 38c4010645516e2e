//! Instruction sequence to CIL byte stream.
//!
//! The inverse of [`crate::assembly::decoder`]. Branch operands are instruction indices,
//! so before any byte is written the sequence has to be laid out: every instruction gets
//! an offset, and every short branch (`br.s`, `leave.s`, `brtrue.s`, ...) whose displacement
//! no longer fits into an `i8` is promoted to its long form. Promotion grows the code, which
//! can push other short branches out of range, so layout repeats until nothing changes.
//! Branches are never shrunk, which makes the layout of an untouched decoded body identical
//! to its original offsets.

use crate::{
    assembly::{opcodes, Immediate, Instruction, Operand, OperandType},
    file::io::write_le,
    Result,
};

/// Offsets and branch forms computed for a sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Opcode to emit for each instruction (promoted where needed)
    pub opcodes: Vec<u8>,
    /// Byte offset of each instruction, followed by the total code length
    pub offsets: Vec<u32>,
}

impl Layout {
    /// Total size of the code stream in bytes.
    #[must_use]
    pub fn code_size(&self) -> u32 {
        self.offsets.last().copied().unwrap_or(0)
    }
}

/// Long form of a short branch opcode, `None` if `opcode` is not a short branch.
#[must_use]
pub fn promote_short_branch(opcode: u8) -> Option<u8> {
    match opcode {
        opcodes::BR_S..=opcodes::BLT_UN_S => Some(opcode + (opcodes::BR - opcodes::BR_S)),
        opcodes::LEAVE_S => Some(opcodes::LEAVE),
        _ => None,
    }
}

/// Assign offsets and select branch forms.
///
/// # Errors
/// Returns an error if a branch targets an index past the end of the sequence, an
/// instruction uses a reserved opcode, or the code grows beyond `u32`.
pub fn layout(instructions: &[Instruction]) -> Result<Layout> {
    let mut current: Vec<u8> = instructions.iter().map(|i| i.opcode).collect();

    for (index, instruction) in instructions.iter().enumerate() {
        if instruction.info().is_none() {
            return Err(malformed_error!(
                "Instruction {} uses reserved opcode {:#04x}{:02x}",
                index,
                instruction.prefix,
                instruction.opcode
            ));
        }
        for target in instruction.targets() {
            // Branching to the end of the sequence is allowed for leave/endfinally shapes
            if target > instructions.len() {
                return Err(malformed_error!(
                    "Instruction {} targets index {} past the end ({})",
                    index,
                    target,
                    instructions.len()
                ));
            }
        }
    }

    loop {
        let offsets = compute_offsets(instructions, &current)?;
        let mut promoted = false;

        for (index, instruction) in instructions.iter().enumerate() {
            if instruction.prefix != 0 {
                continue;
            }
            let Operand::Target(target) = instruction.operand else {
                continue;
            };
            let Some(long) = promote_short_branch(current[index]) else {
                continue;
            };

            let displacement = i64::from(offsets[target]) - i64::from(offsets[index + 1]);
            if i8::try_from(displacement).is_err() {
                current[index] = long;
                promoted = true;
            }
        }

        if !promoted {
            return Ok(Layout {
                opcodes: current,
                offsets,
            });
        }
    }
}

/// Encode a sequence into a CIL byte stream.
///
/// Returns the code together with its [`Layout`], whose offsets are needed to emit
/// exception handler ranges and sequence points.
///
/// # Errors
/// Returns the same errors as [`layout`], and [`crate::Error::Malformed`] if an operand
/// does not fit the operand encoding of its opcode.
pub fn encode_stream(instructions: &[Instruction]) -> Result<(Vec<u8>, Layout)> {
    let layout = layout(instructions)?;
    let mut code = Vec::with_capacity(layout.code_size() as usize);

    for (index, instruction) in instructions.iter().enumerate() {
        let opcode = layout.opcodes[index];
        if instruction.prefix != 0 {
            code.push(instruction.prefix);
        }
        code.push(opcode);

        let Some(info) = crate::assembly::lookup(instruction.prefix, opcode) else {
            return Err(malformed_error!("Reserved opcode {:#04x}", opcode));
        };
        let next = i64::from(layout.offsets[index + 1]);

        match (&instruction.operand, info.op_type) {
            (Operand::None, OperandType::None) => {}
            (Operand::Target(target), OperandType::Int8) => {
                let displacement = i64::from(layout.offsets[*target]) - next;
                let Ok(displacement) = i8::try_from(displacement) else {
                    return Err(malformed_error!(
                        "Short branch at instruction {} cannot reach {}",
                        index,
                        target
                    ));
                };
                write_le(&mut code, displacement);
            }
            (Operand::Target(target), OperandType::Int32) => {
                write_le(&mut code, displacement_i32(&layout, *target, next)?);
            }
            (Operand::Switch(targets), OperandType::Switch) => {
                let Ok(count) = u32::try_from(targets.len()) else {
                    return Err(malformed_error!("Switch table too large"));
                };
                write_le(&mut code, count);
                for target in targets {
                    write_le(&mut code, displacement_i32(&layout, *target, next)?);
                }
            }
            (Operand::Token(token), OperandType::Token) => write_le(&mut code, token.value()),
            (Operand::Immediate(immediate), op_type) => {
                encode_immediate(&mut code, *immediate, op_type, index)?;
            }
            (operand, op_type) => {
                return Err(malformed_error!(
                    "Operand {:?} does not match {:?} of '{}' at instruction {}",
                    operand,
                    op_type,
                    info.instr,
                    index
                ));
            }
        }
    }

    Ok((code, layout))
}

fn compute_offsets(instructions: &[Instruction], opcodes: &[u8]) -> Result<Vec<u32>> {
    let mut offsets = Vec::with_capacity(instructions.len() + 1);
    let mut offset: usize = 0;

    for (instruction, opcode) in instructions.iter().zip(opcodes) {
        offsets.push(checked_offset(offset)?);
        let size = if *opcode == instruction.opcode {
            instruction.size()
        } else {
            // Promoted branch: one opcode byte plus a four byte displacement
            5
        };
        offset += size;
    }
    offsets.push(checked_offset(offset)?);

    Ok(offsets)
}

fn checked_offset(offset: usize) -> Result<u32> {
    u32::try_from(offset).map_err(|_| malformed_error!("Code size {:#x} exceeds u32", offset))
}

fn displacement_i32(layout: &Layout, target: usize, next: i64) -> Result<i32> {
    let displacement = i64::from(layout.offsets[target]) - next;
    i32::try_from(displacement)
        .map_err(|_| malformed_error!("Branch displacement {} exceeds i32", displacement))
}

fn encode_immediate(
    code: &mut Vec<u8>,
    immediate: Immediate,
    op_type: OperandType,
    index: usize,
) -> Result<()> {
    match (immediate, op_type) {
        (Immediate::Int8(value), OperandType::Int8) => write_le(code, value),
        (Immediate::UInt8(value), OperandType::UInt8) => write_le(code, value),
        (Immediate::Int16(value), OperandType::Int16) => write_le(code, value),
        (Immediate::UInt16(value), OperandType::UInt16) => write_le(code, value),
        (Immediate::Int32(value), OperandType::Int32) => write_le(code, value),
        (Immediate::UInt32(value), OperandType::UInt32) => write_le(code, value),
        (Immediate::Int64(value), OperandType::Int64) => write_le(code, value),
        (Immediate::UInt64(value), OperandType::UInt64) => write_le(code, value),
        (Immediate::Float32(value), OperandType::Float32) => write_le(code, value),
        (Immediate::Float64(value), OperandType::Float64) => write_le(code, value),
        (immediate, op_type) => {
            return Err(malformed_error!(
                "Immediate {:?} does not match operand type {:?} at instruction {}",
                immediate,
                op_type,
                index
            ))
        }
    }

    Ok(())
}
