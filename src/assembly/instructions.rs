//! Static CIL instruction tables (ECMA-335 Partition III).
//!
//! [`INSTRUCTIONS`] is indexed by the single opcode byte, [`INSTRUCTIONS_FE`] by the second
//! byte of `0xFE` prefixed opcodes. Reserved slots carry an empty mnemonic and are rejected
//! by the decoder.
//!
//! Stack pops and pushes are the fixed part of the stack effect; call-like instructions
//! (`call`, `callvirt`, `newobj`, `calli`, `jmp`) depend on the signature of their target and
//! list only the fixed part.

use crate::assembly::{FlowType, InstructionCategory, OperandType};

/// Static description of one CIL opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CilInstruction {
    /// Mnemonic, empty for reserved opcodes
    pub instr: &'static str,
    /// Operand encoding
    pub op_type: OperandType,
    /// Functional category
    pub category: InstructionCategory,
    /// Control flow behaviour
    pub flow: FlowType,
    /// Fixed number of stack slots popped
    pub stack_pops: u8,
    /// Fixed number of stack slots pushed
    pub stack_pushes: u8,
}

impl CilInstruction {
    /// Returns true for reserved opcode slots.
    #[must_use]
    pub const fn is_reserved(&self) -> bool {
        self.instr.is_empty()
    }
}

const fn op(
    instr: &'static str,
    op_type: OperandType,
    category: InstructionCategory,
    flow: FlowType,
    stack_pops: u8,
    stack_pushes: u8,
) -> CilInstruction {
    CilInstruction {
        instr,
        op_type,
        category,
        flow,
        stack_pops,
        stack_pushes,
    }
}

const RESERVED: CilInstruction = op(
    "",
    OperandType::None,
    InstructionCategory::Misc,
    FlowType::Sequential,
    0,
    0,
);

/// Look up the table entry for a `(prefix, opcode)` pair.
///
/// Returns `None` for opcodes outside the tables and for reserved slots.
#[must_use]
pub fn lookup(prefix: u8, opcode: u8) -> Option<&'static CilInstruction> {
    let entry = match prefix {
        0 => INSTRUCTIONS.get(opcode as usize),
        0xFE => INSTRUCTIONS_FE.get(opcode as usize),
        _ => None,
    }?;

    if entry.is_reserved() {
        None
    } else {
        Some(entry)
    }
}

/// Single byte opcodes `0x00..=0xE0`, indexed by opcode. Unassigned opcodes are reserved
/// entries; use [`lookup`] to skip them.
pub const INSTRUCTIONS: [CilInstruction; 0xE1] = [
    op("nop", OperandType::None, InstructionCategory::Misc, FlowType::Sequential, 0, 0), // 0x00
    op("break", OperandType::None, InstructionCategory::Misc, FlowType::Sequential, 0, 0), // 0x01
    op("ldarg.0", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x02
    op("ldarg.1", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x03
    op("ldarg.2", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x04
    op("ldarg.3", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x05
    op("ldloc.0", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x06
    op("ldloc.1", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x07
    op("ldloc.2", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x08
    op("ldloc.3", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x09
    op("stloc.0", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 0), // 0x0A
    op("stloc.1", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 0), // 0x0B
    op("stloc.2", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 0), // 0x0C
    op("stloc.3", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 0), // 0x0D
    op("ldarg.s", OperandType::UInt8, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x0E
    op("ldarga.s", OperandType::UInt8, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x0F
    op("starg.s", OperandType::UInt8, InstructionCategory::LoadStore, FlowType::Sequential, 1, 0), // 0x10
    op("ldloc.s", OperandType::UInt8, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x11
    op("ldloca.s", OperandType::UInt8, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x12
    op("stloc.s", OperandType::UInt8, InstructionCategory::LoadStore, FlowType::Sequential, 1, 0), // 0x13
    op("ldnull", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x14
    op("ldc.i4.m1", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x15
    op("ldc.i4.0", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x16
    op("ldc.i4.1", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x17
    op("ldc.i4.2", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x18
    op("ldc.i4.3", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x19
    op("ldc.i4.4", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x1A
    op("ldc.i4.5", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x1B
    op("ldc.i4.6", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x1C
    op("ldc.i4.7", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x1D
    op("ldc.i4.8", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x1E
    op("ldc.i4.s", OperandType::Int8, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x1F
    op("ldc.i4", OperandType::Int32, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x20
    op("ldc.i8", OperandType::Int64, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x21
    op("ldc.r4", OperandType::Float32, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x22
    op("ldc.r8", OperandType::Float64, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x23
    RESERVED, // 0x24
    op("dup", OperandType::None, InstructionCategory::Misc, FlowType::Sequential, 1, 2), // 0x25
    op("pop", OperandType::None, InstructionCategory::Misc, FlowType::Sequential, 1, 0), // 0x26
    op("jmp", OperandType::Token, InstructionCategory::ControlFlow, FlowType::Call, 0, 0), // 0x27
    op("call", OperandType::Token, InstructionCategory::ControlFlow, FlowType::Call, 0, 0), // 0x28
    op("calli", OperandType::Token, InstructionCategory::ControlFlow, FlowType::Call, 0, 0), // 0x29
    op("ret", OperandType::None, InstructionCategory::ControlFlow, FlowType::Return, 0, 0), // 0x2A
    op("br.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::UnconditionalBranch, 0, 0), // 0x2B
    op("brfalse.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 1, 0), // 0x2C
    op("brtrue.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 1, 0), // 0x2D
    op("beq.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0), // 0x2E
    op("bge.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0), // 0x2F
    op("bgt.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0), // 0x30
    op("ble.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0), // 0x31
    op("blt.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0), // 0x32
    op("bne.un.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0), // 0x33
    op("bge.un.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0), // 0x34
    op("bgt.un.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0), // 0x35
    op("ble.un.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0), // 0x36
    op("blt.un.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0), // 0x37
    op("br", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::UnconditionalBranch, 0, 0), // 0x38
    op("brfalse", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 1, 0), // 0x39
    op("brtrue", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 1, 0), // 0x3A
    op("beq", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0), // 0x3B
    op("bge", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0), // 0x3C
    op("bgt", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0), // 0x3D
    op("ble", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0), // 0x3E
    op("blt", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0), // 0x3F
    op("bne.un", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0), // 0x40
    op("bge.un", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0), // 0x41
    op("bgt.un", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0), // 0x42
    op("ble.un", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0), // 0x43
    op("blt.un", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0), // 0x44
    op("switch", OperandType::Switch, InstructionCategory::ControlFlow, FlowType::Switch, 1, 0), // 0x45
    op("ldind.i1", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 1), // 0x46
    op("ldind.u1", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 1), // 0x47
    op("ldind.i2", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 1), // 0x48
    op("ldind.u2", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 1), // 0x49
    op("ldind.i4", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 1), // 0x4A
    op("ldind.u4", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 1), // 0x4B
    op("ldind.i8", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 1), // 0x4C
    op("ldind.i", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 1), // 0x4D
    op("ldind.r4", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 1), // 0x4E
    op("ldind.r8", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 1), // 0x4F
    op("ldind.ref", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 1), // 0x50
    op("stind.ref", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 2, 0), // 0x51
    op("stind.i1", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 2, 0), // 0x52
    op("stind.i2", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 2, 0), // 0x53
    op("stind.i4", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 2, 0), // 0x54
    op("stind.i8", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 2, 0), // 0x55
    op("stind.r4", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 2, 0), // 0x56
    op("stind.r8", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 2, 0), // 0x57
    op("add", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1), // 0x58
    op("sub", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1), // 0x59
    op("mul", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1), // 0x5A
    op("div", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1), // 0x5B
    op("div.un", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1), // 0x5C
    op("rem", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1), // 0x5D
    op("rem.un", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1), // 0x5E
    op("and", OperandType::None, InstructionCategory::BitwiseLogical, FlowType::Sequential, 2, 1), // 0x5F
    op("or", OperandType::None, InstructionCategory::BitwiseLogical, FlowType::Sequential, 2, 1), // 0x60
    op("xor", OperandType::None, InstructionCategory::BitwiseLogical, FlowType::Sequential, 2, 1), // 0x61
    op("shl", OperandType::None, InstructionCategory::BitwiseLogical, FlowType::Sequential, 2, 1), // 0x62
    op("shr", OperandType::None, InstructionCategory::BitwiseLogical, FlowType::Sequential, 2, 1), // 0x63
    op("shr.un", OperandType::None, InstructionCategory::BitwiseLogical, FlowType::Sequential, 2, 1), // 0x64
    op("neg", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 1, 1), // 0x65
    op("not", OperandType::None, InstructionCategory::BitwiseLogical, FlowType::Sequential, 1, 1), // 0x66
    op("conv.i1", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0x67
    op("conv.i2", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0x68
    op("conv.i4", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0x69
    op("conv.i8", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0x6A
    op("conv.r4", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0x6B
    op("conv.r8", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0x6C
    op("conv.u4", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0x6D
    op("conv.u8", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0x6E
    op("callvirt", OperandType::Token, InstructionCategory::ControlFlow, FlowType::Call, 0, 0), // 0x6F
    op("cpobj", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 0), // 0x70
    op("ldobj", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 1), // 0x71
    op("ldstr", OperandType::Token, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x72
    op("newobj", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Call, 0, 1), // 0x73
    op("castclass", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 1), // 0x74
    op("isinst", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 1), // 0x75
    op("conv.r.un", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0x76
    RESERVED, // 0x77
    RESERVED, // 0x78
    op("unbox", OperandType::Token, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0x79
    op("throw", OperandType::None, InstructionCategory::ControlFlow, FlowType::Throw, 1, 0), // 0x7A
    op("ldfld", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 1), // 0x7B
    op("ldflda", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 1), // 0x7C
    op("stfld", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 0), // 0x7D
    op("ldsfld", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 0, 1), // 0x7E
    op("ldsflda", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 0, 1), // 0x7F
    op("stsfld", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 0), // 0x80
    op("stobj", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 0), // 0x81
    op("conv.ovf.i1.un", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0x82
    op("conv.ovf.i2.un", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0x83
    op("conv.ovf.i4.un", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0x84
    op("conv.ovf.i8.un", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0x85
    op("conv.ovf.u1.un", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0x86
    op("conv.ovf.u2.un", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0x87
    op("conv.ovf.u4.un", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0x88
    op("conv.ovf.u8.un", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0x89
    op("conv.ovf.i.un", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0x8A
    op("conv.ovf.u.un", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0x8B
    op("box", OperandType::Token, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0x8C
    op("newarr", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 1), // 0x8D
    op("ldlen", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 1), // 0x8E
    op("ldelema", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1), // 0x8F
    op("ldelem.i1", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1), // 0x90
    op("ldelem.u1", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1), // 0x91
    op("ldelem.i2", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1), // 0x92
    op("ldelem.u2", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1), // 0x93
    op("ldelem.i4", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1), // 0x94
    op("ldelem.u4", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1), // 0x95
    op("ldelem.i8", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1), // 0x96
    op("ldelem.i", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1), // 0x97
    op("ldelem.r4", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1), // 0x98
    op("ldelem.r8", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1), // 0x99
    op("ldelem.ref", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1), // 0x9A
    op("stelem.i", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 3, 0), // 0x9B
    op("stelem.i1", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 3, 0), // 0x9C
    op("stelem.i2", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 3, 0), // 0x9D
    op("stelem.i4", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 3, 0), // 0x9E
    op("stelem.i8", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 3, 0), // 0x9F
    op("stelem.r4", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 3, 0), // 0xA0
    op("stelem.r8", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 3, 0), // 0xA1
    op("stelem.ref", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 3, 0), // 0xA2
    op("ldelem", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1), // 0xA3
    op("stelem", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 3, 0), // 0xA4
    op("unbox.any", OperandType::Token, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0xA5
    RESERVED, // 0xA6
    RESERVED, // 0xA7
    RESERVED, // 0xA8
    RESERVED, // 0xA9
    RESERVED, // 0xAA
    RESERVED, // 0xAB
    RESERVED, // 0xAC
    RESERVED, // 0xAD
    RESERVED, // 0xAE
    RESERVED, // 0xAF
    RESERVED, // 0xB0
    RESERVED, // 0xB1
    RESERVED, // 0xB2
    op("conv.ovf.i1", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0xB3
    op("conv.ovf.u1", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0xB4
    op("conv.ovf.i2", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0xB5
    op("conv.ovf.u2", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0xB6
    op("conv.ovf.i4", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0xB7
    op("conv.ovf.u4", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0xB8
    op("conv.ovf.i8", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0xB9
    op("conv.ovf.u8", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0xBA
    RESERVED, // 0xBB
    RESERVED, // 0xBC
    RESERVED, // 0xBD
    RESERVED, // 0xBE
    RESERVED, // 0xBF
    RESERVED, // 0xC0
    RESERVED, // 0xC1
    op("refanyval", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 1), // 0xC2
    op("ckfinite", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 1, 1), // 0xC3
    RESERVED, // 0xC4
    RESERVED, // 0xC5
    op("mkrefany", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 1), // 0xC6
    RESERVED, // 0xC7
    RESERVED, // 0xC8
    RESERVED, // 0xC9
    RESERVED, // 0xCA
    RESERVED, // 0xCB
    RESERVED, // 0xCC
    RESERVED, // 0xCD
    RESERVED, // 0xCE
    RESERVED, // 0xCF
    op("ldtoken", OperandType::Token, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0xD0
    op("conv.u2", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0xD1
    op("conv.u1", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0xD2
    op("conv.i", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0xD3
    op("conv.ovf.i", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0xD4
    op("conv.ovf.u", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0xD5
    op("add.ovf", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1), // 0xD6
    op("add.ovf.un", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1), // 0xD7
    op("mul.ovf", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1), // 0xD8
    op("mul.ovf.un", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1), // 0xD9
    op("sub.ovf", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1), // 0xDA
    op("sub.ovf.un", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1), // 0xDB
    op("endfinally", OperandType::None, InstructionCategory::ControlFlow, FlowType::EndFinally, 0, 0), // 0xDC
    op("leave", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::Leave, 0, 0), // 0xDD
    op("leave.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::Leave, 0, 0), // 0xDE
    op("stind.i", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 2, 0), // 0xDF
    op("conv.u", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1), // 0xE0
];

/// Two byte opcodes `0xFE 0x00..=0xFE 0x1E`, indexed by the second byte.
pub const INSTRUCTIONS_FE: [CilInstruction; 0x1F] = [
    op("arglist", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x00
    op("ceq", OperandType::None, InstructionCategory::Comparison, FlowType::Sequential, 2, 1), // 0x01
    op("cgt", OperandType::None, InstructionCategory::Comparison, FlowType::Sequential, 2, 1), // 0x02
    op("cgt.un", OperandType::None, InstructionCategory::Comparison, FlowType::Sequential, 2, 1), // 0x03
    op("clt", OperandType::None, InstructionCategory::Comparison, FlowType::Sequential, 2, 1), // 0x04
    op("clt.un", OperandType::None, InstructionCategory::Comparison, FlowType::Sequential, 2, 1), // 0x05
    op("ldftn", OperandType::Token, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x06
    op("ldvirtftn", OperandType::Token, InstructionCategory::LoadStore, FlowType::Sequential, 1, 1), // 0x07
    RESERVED, // 0x08
    op("ldarg", OperandType::UInt16, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x09
    op("ldarga", OperandType::UInt16, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x0A
    op("starg", OperandType::UInt16, InstructionCategory::LoadStore, FlowType::Sequential, 1, 0), // 0x0B
    op("ldloc", OperandType::UInt16, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x0C
    op("ldloca", OperandType::UInt16, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1), // 0x0D
    op("stloc", OperandType::UInt16, InstructionCategory::LoadStore, FlowType::Sequential, 1, 0), // 0x0E
    op("localloc", OperandType::None, InstructionCategory::Misc, FlowType::Sequential, 1, 1), // 0x0F
    RESERVED, // 0x10
    op("endfilter", OperandType::None, InstructionCategory::ControlFlow, FlowType::EndFinally, 1, 0), // 0x11
    op("unaligned.", OperandType::UInt8, InstructionCategory::Prefix, FlowType::Sequential, 0, 0), // 0x12
    op("volatile.", OperandType::None, InstructionCategory::Prefix, FlowType::Sequential, 0, 0), // 0x13
    op("tail.", OperandType::None, InstructionCategory::Prefix, FlowType::Sequential, 0, 0), // 0x14
    op("initobj", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 0), // 0x15
    op("constrained.", OperandType::Token, InstructionCategory::Prefix, FlowType::Sequential, 0, 0), // 0x16
    op("cpblk", OperandType::None, InstructionCategory::Misc, FlowType::Sequential, 3, 0), // 0x17
    op("initblk", OperandType::None, InstructionCategory::Misc, FlowType::Sequential, 3, 0), // 0x18
    op("no.", OperandType::UInt8, InstructionCategory::Prefix, FlowType::Sequential, 0, 0), // 0x19
    op("rethrow", OperandType::None, InstructionCategory::ControlFlow, FlowType::Throw, 0, 0), // 0x1A
    RESERVED, // 0x1B
    op("sizeof", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 0, 1), // 0x1C
    op("refanytype", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 1), // 0x1D
    op("readonly.", OperandType::None, InstructionCategory::Prefix, FlowType::Sequential, 0, 0), // 0x1E
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::opcodes;

    #[test]
    fn table_positions() {
        assert_eq!(INSTRUCTIONS[opcodes::CALL as usize].instr, "call");
        assert_eq!(INSTRUCTIONS[opcodes::RET as usize].instr, "ret");
        assert_eq!(INSTRUCTIONS[opcodes::BLT_UN as usize].instr, "blt.un");
        assert_eq!(INSTRUCTIONS[opcodes::LEAVE_S as usize].instr, "leave.s");
        assert_eq!(INSTRUCTIONS[opcodes::CONV_U as usize].instr, "conv.u");
        assert_eq!(INSTRUCTIONS_FE[opcodes::FE_CEQ as usize].instr, "ceq");
        assert_eq!(INSTRUCTIONS_FE[opcodes::FE_READONLY as usize].instr, "readonly.");
    }

    #[test]
    fn reserved_slots() {
        assert!(lookup(0, 0x24).is_none());
        assert!(lookup(0, 0xA6).is_none());
        assert!(lookup(0xFE, 0x08).is_none());
        assert!(lookup(0xFE, 0x1F).is_none());
        assert!(lookup(0x01, opcodes::NOP).is_none());
        assert!(lookup(0, opcodes::NOP).is_some());
    }

    #[test]
    fn branch_operands() {
        for (short, long) in [(opcodes::BR_S, opcodes::BR), (opcodes::BLT_UN_S, opcodes::BLT_UN)] {
            assert_eq!(INSTRUCTIONS[short as usize].op_type, OperandType::Int8);
            assert_eq!(INSTRUCTIONS[long as usize].op_type, OperandType::Int32);
            assert_eq!(
                INSTRUCTIONS[short as usize].flow,
                INSTRUCTIONS[long as usize].flow
            );
        }
    }
}
