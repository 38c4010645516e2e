//! Method bodies (ECMA-335 II.25.4).
//!
//! A body is stored as a tiny or fat header followed by the CIL code and, for fat bodies,
//! optional extra data sections holding exception handling clauses. [`MethodBody::parse`]
//! decodes all of it: the code into an instruction sequence, and the clause byte ranges into
//! instruction index ranges, so that rewrites never have to care about byte offsets.
//! [`MethodBody::to_bytes`] lays the sequence out again and picks the smallest header and
//! clause format that can represent the result.

use bitflags::bitflags;

use crate::{
    assembly::{decode_stream, encode_stream, DecodedStream, Instruction, Layout},
    file::{parser::Parser, writer::Writer},
    image::Token,
    Error::OutOfBounds,
    Result,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Flags that a method body header can have
    pub struct MethodBodyFlags: u16 {
        /// Tiny method header format
        const TINY_FORMAT = 0x2;
        /// Fat method header format
        const FAT_FORMAT = 0x3;
        /// More data sections follow the code
        const MORE_SECTS = 0x8;
        /// Locals are zero initialized
        const INIT_LOCALS = 0x10;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Flags that a method body data section can have
    pub struct SectionFlags: u8 {
        /// The section contains exception handling clauses
        const EHTABLE = 0x1;
        /// Reserved, shall be 0
        const OPT_ILTABLE = 0x2;
        /// The section uses the fat clause layout
        const FAT_FORMAT = 0x40;
        /// Another section follows this one
        const MORE_SECTS = 0x80;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Kind of an exception handling clause
    pub struct ExceptionHandlerFlags: u16 {
        /// Typed catch clause
        const EXCEPTION = 0x0000;
        /// Filter clause
        const FILTER = 0x0001;
        /// Finally clause
        const FINALLY = 0x0002;
        /// Fault clause
        const FAULT = 0x0004;
    }
}

const TINY_MAX_STACK: u16 = 8;
const TINY_MAX_CODE_SIZE: u32 = 0x3F;
const FAT_HEADER_DWORDS: u16 = 3;
const SMALL_CLAUSE_SIZE: usize = 12;
const FAT_CLAUSE_SIZE: usize = 24;

/// One exception handling clause. Ranges are `[start, end)` instruction indices; an end
/// equal to the instruction count means "until the end of the body".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Clause kind
    pub flags: ExceptionHandlerFlags,
    /// First instruction of the protected block
    pub try_start: usize,
    /// One past the last instruction of the protected block
    pub try_end: usize,
    /// First instruction of the handler
    pub handler_start: usize,
    /// One past the last instruction of the handler
    pub handler_end: usize,
    /// Caught type for typed clauses, null otherwise
    pub class_token: Token,
    /// First instruction of the filter block for filter clauses
    pub filter_start: Option<usize>,
}

impl ExceptionHandler {
    /// Returns true if any part of this clause reaches past `index`.
    #[must_use]
    pub fn extends_past(&self, index: usize) -> bool {
        self.try_end > index
            || self.handler_end > index
            || self.filter_start.is_some_and(|start| start >= index)
    }

    /// Returns true if instruction `index` lies in the protected block, the filter or the
    /// handler of this clause.
    #[must_use]
    pub fn covers(&self, index: usize) -> bool {
        (self.try_start..self.try_end).contains(&index)
            || (self.handler_start..self.handler_end).contains(&index)
            || self
                .filter_start
                .is_some_and(|start| (start..self.handler_start).contains(&index))
    }
}

/// A decoded method body.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodBody {
    /// Maximum evaluation stack depth
    pub max_stack: u16,
    /// Whether locals are zero initialized
    pub init_locals: bool,
    /// `StandAloneSig` token of the local variable signature, null if there are no locals
    pub local_var_sig_token: Token,
    /// The code
    pub instructions: Vec<Instruction>,
    /// Exception handling clauses
    pub exception_handlers: Vec<ExceptionHandler>,
}

impl MethodBody {
    /// A body without locals or exception handlers.
    #[must_use]
    pub fn new(instructions: Vec<Instruction>) -> Self {
        MethodBody {
            max_stack: TINY_MAX_STACK,
            init_locals: false,
            local_var_sig_token: Token::default(),
            instructions,
            exception_handlers: Vec::new(),
        }
    }

    /// Decode a body from its header onwards.
    ///
    /// # Errors
    /// Returns an error for an unknown header format, truncated data, undecodable code, or
    /// clause ranges that do not fall on instruction boundaries.
    pub fn parse(data: &[u8]) -> Result<MethodBody> {
        let mut parser = Parser::new(data);
        let first_byte = parser.peek_le::<u8>()?;

        match MethodBodyFlags::from_bits_truncate(u16::from(first_byte & 0b_0000_0011)) {
            MethodBodyFlags::TINY_FORMAT => {
                parser.advance_by(1)?;
                let code = parser.read_bytes(usize::from(first_byte >> 2))?;
                let decoded = decode_stream(code)?;

                Ok(MethodBody {
                    instructions: decoded.instructions,
                    ..MethodBody::new(Vec::new())
                })
            }
            MethodBodyFlags::FAT_FORMAT => {
                let flags_and_size = parser.read_le::<u16>()?;
                let max_stack = parser.read_le::<u16>()?;
                let code_size = parser.read_le::<u32>()? as usize;
                let local_var_sig_token = Token::new(parser.read_le::<u32>()?);

                let header_size = usize::from(flags_and_size >> 12) * 4;
                if header_size < 12 {
                    return Err(malformed_error!("Fat header size {} is too small", header_size));
                }
                parser.seek(header_size)?;

                let flags = MethodBodyFlags::from_bits_truncate(flags_and_size & 0x0FFF);
                let decoded = decode_stream(parser.read_bytes(code_size)?)?;

                let exception_handlers = if flags.contains(MethodBodyFlags::MORE_SECTS) {
                    parser.align(4)?;
                    read_sections(&mut parser, &decoded)?
                } else {
                    Vec::new()
                };

                Ok(MethodBody {
                    max_stack,
                    init_locals: flags.contains(MethodBodyFlags::INIT_LOCALS),
                    local_var_sig_token,
                    instructions: decoded.instructions,
                    exception_handlers,
                })
            }
            _ => Err(malformed_error!(
                "Method header is neither fat nor tiny - {}",
                first_byte
            )),
        }
    }

    /// Returns true if the tiny header can represent this body.
    #[must_use]
    pub fn fits_tiny(&self, code_size: u32) -> bool {
        code_size <= TINY_MAX_CODE_SIZE
            && self.max_stack <= TINY_MAX_STACK
            && self.local_var_sig_token.is_null()
            && !self.init_locals
            && self.exception_handlers.is_empty()
    }

    /// Encode the body.
    ///
    /// Returns the bytes and the [`Layout`] of the code, whose offsets are relative to the
    /// start of the code (not the header).
    ///
    /// # Errors
    /// Returns an error if the instructions cannot be encoded or a clause references an
    /// instruction index past the end of the body.
    pub fn to_bytes(&self) -> Result<(Vec<u8>, Layout)> {
        let (code, layout) = encode_stream(&self.instructions)?;
        let code_size = layout.code_size();
        let mut writer = Writer::with_capacity(code.len() + 12);

        if self.fits_tiny(code_size) {
            // code_size <= 0x3F, so the shifted value fits a byte
            #[allow(clippy::cast_possible_truncation)]
            writer.write_le(((code_size as u8) << 2) | 0x2);
            writer.write_bytes(&code);
            return Ok((writer.into_inner(), layout));
        }

        let mut flags = MethodBodyFlags::FAT_FORMAT;
        if self.init_locals {
            flags |= MethodBodyFlags::INIT_LOCALS;
        }
        if !self.exception_handlers.is_empty() {
            flags |= MethodBodyFlags::MORE_SECTS;
        }

        writer.write_le((FAT_HEADER_DWORDS << 12) | flags.bits());
        writer.write_le(self.max_stack);
        writer.write_le(code_size);
        writer.write_le(self.local_var_sig_token.value());
        writer.write_bytes(&code);

        if !self.exception_handlers.is_empty() {
            writer.align(4);
            self.write_section(&mut writer, &layout)?;
        }

        Ok((writer.into_inner(), layout))
    }

    fn write_section(&self, writer: &mut Writer, layout: &Layout) -> Result<()> {
        let offset = |index: usize| -> Result<u32> {
            layout.offsets.get(index).copied().ok_or_else(|| {
                malformed_error!(
                    "Exception clause references instruction {} past the end",
                    index
                )
            })
        };

        let mut clauses = Vec::with_capacity(self.exception_handlers.len());
        for handler in &self.exception_handlers {
            let try_offset = offset(handler.try_start)?;
            let handler_offset = offset(handler.handler_start)?;
            let extra = match handler.filter_start {
                Some(start) => offset(start)?,
                None => handler.class_token.value(),
            };

            clauses.push((
                handler.flags.bits(),
                try_offset,
                offset(handler.try_end)?.saturating_sub(try_offset),
                handler_offset,
                offset(handler.handler_end)?.saturating_sub(handler_offset),
                extra,
            ));
        }

        let small_size = 4 + clauses.len() * SMALL_CLAUSE_SIZE;
        let fits_small = small_size <= usize::from(u8::MAX)
            && clauses.iter().all(|(_, try_offset, try_len, handler_offset, handler_len, _)| {
                *try_offset <= u32::from(u16::MAX)
                    && *try_len <= u32::from(u8::MAX)
                    && *handler_offset <= u32::from(u16::MAX)
                    && *handler_len <= u32::from(u8::MAX)
            });

        // All narrowing casts below are guarded by fits_small or the u24 size check
        #[allow(clippy::cast_possible_truncation)]
        if fits_small {
            writer.write_le(SectionFlags::EHTABLE.bits());
            writer.write_le(small_size as u8);
            writer.write_le(0_u16);
            for (flags, try_offset, try_len, handler_offset, handler_len, extra) in clauses {
                writer.write_le(flags);
                writer.write_le(try_offset as u16);
                writer.write_le(try_len as u8);
                writer.write_le(handler_offset as u16);
                writer.write_le(handler_len as u8);
                writer.write_le(extra);
            }
        } else {
            let fat_size = 4 + clauses.len() * FAT_CLAUSE_SIZE;
            if fat_size > 0x00FF_FFFF {
                return Err(malformed_error!("Too many exception clauses: {}", clauses.len()));
            }

            writer.write_le((SectionFlags::EHTABLE | SectionFlags::FAT_FORMAT).bits());
            writer.write_le(fat_size as u8);
            writer.write_le((fat_size >> 8) as u16);
            for (flags, try_offset, try_len, handler_offset, handler_len, extra) in clauses {
                writer.write_le(u32::from(flags));
                writer.write_le(try_offset);
                writer.write_le(try_len);
                writer.write_le(handler_offset);
                writer.write_le(handler_len);
                writer.write_le(extra);
            }
        }

        Ok(())
    }
}

fn read_sections(parser: &mut Parser, decoded: &DecodedStream) -> Result<Vec<ExceptionHandler>> {
    let mut handlers = Vec::new();

    loop {
        let section_flags = SectionFlags::from_bits_truncate(parser.read_le::<u8>()?);
        let is_fat = section_flags.contains(SectionFlags::FAT_FORMAT);

        let data_size = if is_fat {
            let low = u32::from(parser.read_le::<u8>()?);
            let high = u32::from(parser.read_le::<u16>()?);
            ((high << 8) | low) as usize
        } else {
            let size = usize::from(parser.read_le::<u8>()?);
            parser.advance_by(2)?;
            size
        };

        if data_size < 4 {
            return Err(malformed_error!("Method data section of {} bytes", data_size));
        }
        if data_size - 4 > parser.remaining() {
            return Err(OutOfBounds);
        }

        if section_flags.contains(SectionFlags::EHTABLE) {
            let clause_size = if is_fat {
                FAT_CLAUSE_SIZE
            } else {
                SMALL_CLAUSE_SIZE
            };

            for _ in 0..(data_size - 4) / clause_size {
                let (flags, try_offset, try_len, handler_offset, handler_len) = if is_fat {
                    (
                        parser.read_le::<u32>()?,
                        parser.read_le::<u32>()?,
                        parser.read_le::<u32>()?,
                        parser.read_le::<u32>()?,
                        parser.read_le::<u32>()?,
                    )
                } else {
                    (
                        u32::from(parser.read_le::<u16>()?),
                        u32::from(parser.read_le::<u16>()?),
                        u32::from(parser.read_le::<u8>()?),
                        u32::from(parser.read_le::<u16>()?),
                        u32::from(parser.read_le::<u8>()?),
                    )
                };
                let extra = parser.read_le::<u32>()?;

                handlers.push(build_handler(
                    decoded,
                    flags,
                    (try_offset, try_len),
                    (handler_offset, handler_len),
                    extra,
                )?);
            }
            parser.align(4)?;
        } else {
            parser.advance_by(data_size - 4)?;
        }

        if !section_flags.contains(SectionFlags::MORE_SECTS) {
            return Ok(handlers);
        }
    }
}

fn build_handler(
    decoded: &DecodedStream,
    flags: u32,
    (try_offset, try_len): (u32, u32),
    (handler_offset, handler_len): (u32, u32),
    extra: u32,
) -> Result<ExceptionHandler> {
    let index = |offset: u32| -> Result<usize> {
        decoded.index_of(offset).ok_or_else(|| {
            malformed_error!(
                "Exception clause offset {:#x} is not an instruction boundary",
                offset
            )
        })
    };

    // Clause kinds live in the low 16 bits
    #[allow(clippy::cast_possible_truncation)]
    let flags = ExceptionHandlerFlags::from_bits_truncate(flags as u16);
    let is_filter = flags.contains(ExceptionHandlerFlags::FILTER);

    Ok(ExceptionHandler {
        flags,
        try_start: index(try_offset)?,
        try_end: index(try_offset.saturating_add(try_len))?,
        handler_start: index(handler_offset)?,
        handler_end: index(handler_offset.saturating_add(handler_len))?,
        class_token: if is_filter {
            Token::default()
        } else {
            Token::new(extra)
        },
        filter_start: if is_filter { Some(index(extra)?) } else { None },
    })
}
