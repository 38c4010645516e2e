//! CIL instruction model, opcode tables and the codecs between bytes and instructions.
//!
//! Method bodies are rewritten at the instruction level, so every body that a patch may
//! touch goes through this module twice: [`decode_stream`] turns the raw code bytes into
//! a `Vec<Instruction>` with index based branch targets, and [`encode_stream`] lays the
//! (possibly rewritten) sequence out again, promoting short branches that no longer reach
//! their targets.
//!
//! # Key Components
//!
//! - [`Instruction`] / [`Operand`] - The decoded representation
//! - [`INSTRUCTIONS`] / [`INSTRUCTIONS_FE`] - Static opcode tables
//! - [`opcodes`] - Opcode byte constants
//! - [`decode_stream`] / [`encode_stream`] - The codecs
//!
//! # Examples
//!
//! ```rust
//! use dotswap::assembly::{decode_stream, encode_stream};
//!
//! // ldarg.0; brfalse.s +0; ret
//! let code = [0x02, 0x2C, 0x00, 0x2A];
//! let decoded = decode_stream(&code)?;
//! assert_eq!(decoded.instructions.len(), 3);
//!
//! let (encoded, _layout) = encode_stream(&decoded.instructions)?;
//! assert_eq!(encoded, code);
//! # Ok::<(), dotswap::Error>(())
//! ```

mod decoder;
mod encoder;
mod instruction;
mod instructions;
pub mod opcodes;

pub use decoder::{decode_stream, DecodedStream};
pub use encoder::{encode_stream, layout, promote_short_branch, Layout};
pub use instruction::{
    FlowType, Immediate, Instruction, InstructionCategory, Operand, OperandType, StackBehavior,
};
pub use instructions::{lookup, CilInstruction, INSTRUCTIONS, INSTRUCTIONS_FE};
