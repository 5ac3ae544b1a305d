//! Decoding a method body from its wire format
//!
//! Decoding is the mirror of [`crate::cil::baker::bake`] and runs in two passes. The first pass
//! walks the byte stream: it reads each opcode (watching for the two-byte escape prefix),
//! dispatches on the declared operand shape, resolves tokens through the supplied resolver, and
//! turns branch displacements into absolute code offsets. The second pass resolves those
//! absolute offsets into labels attached to decoded instructions - this cannot happen on the
//! first pass because a forward target has not been read yet when the branch is.

use super::baker::{FAT_FORMAT, FLAG_INIT_LOCALS, FLAG_MORE_SECTS, FORMAT_MASK, TINY_FORMAT};
use super::body_builder::MethodBody;
use super::errors::Error;
use super::exception::{self, ExceptionHandler, HandlerKind, RawHandler};
use super::instruction::{CodeStream, Instruction, Label, LabelGenerator};
use super::opcode::{BinaryOp, CompareOp, Comparison, ConvKind, LoadKind, StoreKind, UnaryOp};
use super::signature::{self, CilType, MethodSig};
use super::tokens::{ExternalRef, Token, TokenResolver};
use super::type_graph::SystemTypes;
use super::verifier::{verify_body, MutateCx, StrictnessLevel};
use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::{BTreeSet, HashMap};
use std::io::Cursor;

fn malformed(offset: usize, message: impl Into<String>) -> Error {
    Error::MalformedEncoding {
        offset,
        message: message.into(),
    }
}

/// Parsed header fields, independent of shape
struct Header {
    header_size: usize,
    code_size: usize,
    max_stack: u16,
    init_locals: bool,
    more_sects: bool,
    locals_token: u32,
}

fn read_header(bytes: &[u8]) -> Result<Header, Error> {
    let first = *bytes.first().ok_or_else(|| malformed(0, "empty method body"))?;
    match first & FORMAT_MASK {
        TINY_FORMAT => Ok(Header {
            header_size: 1,
            code_size: (first >> 2) as usize,
            max_stack: 8,
            init_locals: false,
            more_sects: false,
            locals_token: 0,
        }),
        FAT_FORMAT => {
            if bytes.len() < 12 {
                return Err(malformed(0, "truncated fat header"));
            }
            let header_size = ((bytes[1] >> 4) as usize) * 4;
            if header_size < 12 {
                return Err(malformed(1, format!("fat header size {} too small", header_size)));
            }
            Ok(Header {
                header_size,
                code_size: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize,
                max_stack: u16::from_le_bytes([bytes[2], bytes[3]]),
                init_locals: first & FLAG_INIT_LOCALS != 0,
                more_sects: first & FLAG_MORE_SECTS != 0,
                locals_token: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            })
        }
        other => Err(malformed(0, format!("unknown header format bits {:#04x}", other))),
    }
}

/// One decoded instruction with branch targets still as absolute code offsets
struct ProtoInstruction<'g> {
    offset: usize,
    insn: Instruction<ExternalRef<'g>>,
    targets: Vec<usize>,
}

fn decode_instruction<'g>(
    cursor: &mut Cursor<&[u8]>,
    code_len: usize,
    resolver: &dyn TokenResolver<'g>,
) -> Result<ProtoInstruction<'g>, Error> {
    use Instruction::*;

    let start = cursor.position() as usize;
    let truncated = |cursor: &Cursor<&[u8]>| malformed(cursor.position() as usize, "truncated instruction");

    macro_rules! read {
        ($cursor:expr, $method:ident) => {
            $cursor.$method::<LittleEndian>().map_err(|_| truncated($cursor))?
        };
    }

    let opcode = cursor.read_u8().map_err(|_| truncated(cursor))?;

    let mut targets: Vec<usize> = vec![];
    let branch_target = |cursor: &mut Cursor<&[u8]>,
                             targets: &mut Vec<usize>,
                             displacement: i64|
     -> Result<(), Error> {
        let absolute = cursor.position() as i64 + displacement;
        if absolute < 0 || absolute as usize > code_len {
            return Err(malformed(
                start,
                format!("branch target {} outside the code section", absolute),
            ));
        }
        targets.push(absolute as usize);
        Ok(())
    };

    let resolve = |cursor: &mut Cursor<&[u8]>| -> Result<ExternalRef<'g>, Error> {
        let raw = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| malformed(start, "truncated token"))?;
        resolver.resolve(Token(raw))
    };

    let insn = match opcode {
        0x00 => Nop,
        0x01 => Break,
        byte @ 0x02..=0x05 => LdArg((byte - 0x02) as u16),
        byte @ 0x06..=0x09 => LdLoc((byte - 0x06) as u16),
        byte @ 0x0A..=0x0D => StLoc((byte - 0x0A) as u16),
        0x0E => LdArg(cursor.read_u8().map_err(|_| truncated(cursor))? as u16),
        0x0F => LdArgA(cursor.read_u8().map_err(|_| truncated(cursor))? as u16),
        0x10 => StArg(cursor.read_u8().map_err(|_| truncated(cursor))? as u16),
        0x11 => LdLoc(cursor.read_u8().map_err(|_| truncated(cursor))? as u16),
        0x12 => LdLocA(cursor.read_u8().map_err(|_| truncated(cursor))? as u16),
        0x13 => StLoc(cursor.read_u8().map_err(|_| truncated(cursor))? as u16),
        0x14 => LdNull,
        0x15 => LdcI4(-1),
        byte @ 0x16..=0x1E => LdcI4((byte - 0x16) as i32),
        0x1F => LdcI4(cursor.read_i8().map_err(|_| truncated(cursor))? as i32),
        0x20 => LdcI4(read!(cursor, read_i32)),
        0x21 => LdcI8(read!(cursor, read_i64)),
        0x22 => LdcR4(read!(cursor, read_f32)),
        0x23 => LdcR8(read!(cursor, read_f64)),
        0x25 => Dup,
        0x26 => Pop,
        0x27 => Jmp(resolve(cursor)?),
        0x28 => Call(resolve(cursor)?),
        0x29 => CallI(resolve(cursor)?),
        0x2A => Ret,
        0x2B => {
            let displacement = cursor.read_i8().map_err(|_| truncated(cursor))? as i64;
            branch_target(cursor, &mut targets, displacement)?;
            Br(Label(0))
        }
        0x2C => {
            let displacement = cursor.read_i8().map_err(|_| truncated(cursor))? as i64;
            branch_target(cursor, &mut targets, displacement)?;
            BrFalse(Label(0))
        }
        0x2D => {
            let displacement = cursor.read_i8().map_err(|_| truncated(cursor))? as i64;
            branch_target(cursor, &mut targets, displacement)?;
            BrTrue(Label(0))
        }
        byte @ 0x2E..=0x37 => {
            let comparison = Comparison::from_short_byte(byte)
                .ok_or_else(|| malformed(start, "unknown comparison branch"))?;
            let displacement = cursor.read_i8().map_err(|_| truncated(cursor))? as i64;
            branch_target(cursor, &mut targets, displacement)?;
            BrCmp(comparison, Label(0))
        }
        0x38 => {
            let displacement = read!(cursor, read_i32) as i64;
            branch_target(cursor, &mut targets, displacement)?;
            Br(Label(0))
        }
        0x39 => {
            let displacement = read!(cursor, read_i32) as i64;
            branch_target(cursor, &mut targets, displacement)?;
            BrFalse(Label(0))
        }
        0x3A => {
            let displacement = read!(cursor, read_i32) as i64;
            branch_target(cursor, &mut targets, displacement)?;
            BrTrue(Label(0))
        }
        byte @ 0x3B..=0x44 => {
            let comparison = Comparison::from_short_byte(byte - 0x0D)
                .ok_or_else(|| malformed(start, "unknown comparison branch"))?;
            let displacement = read!(cursor, read_i32) as i64;
            branch_target(cursor, &mut targets, displacement)?;
            BrCmp(comparison, Label(0))
        }
        0x45 => {
            let count = read!(cursor, read_u32) as usize;
            let remaining = code_len.saturating_sub(cursor.position() as usize);
            if count > remaining / 4 {
                return Err(malformed(start, format!("switch table of {} targets overruns the code", count)));
            }
            let mut displacements = Vec::with_capacity(count);
            for _ in 0..count {
                displacements.push(read!(cursor, read_i32) as i64);
            }
            // Switch displacements are measured from the end of the whole instruction
            for displacement in displacements {
                branch_target(cursor, &mut targets, displacement)?;
            }
            Switch(vec![Label(0); count])
        }
        byte @ 0x46..=0x50 => LdInd(
            LoadKind::from_ldind_byte(byte).ok_or_else(|| malformed(start, "bad ldind form"))?,
        ),
        byte @ 0x51..=0x57 => StInd(
            StoreKind::from_stind_byte(byte).ok_or_else(|| malformed(start, "bad stind form"))?,
        ),
        byte @ 0x58..=0x64 => Binary(
            BinaryOp::from_byte(byte).ok_or_else(|| malformed(start, "bad arithmetic opcode"))?,
        ),
        0x65 => Unary(UnaryOp::Neg),
        0x66 => Unary(UnaryOp::Not),
        byte @ 0x67..=0x6E => Conv(
            ConvKind::from_byte(byte).ok_or_else(|| malformed(start, "bad conversion opcode"))?,
        ),
        0x6F => CallVirt(resolve(cursor)?),
        0x72 => LdStr(resolve(cursor)?),
        0x73 => NewObj(resolve(cursor)?),
        0x74 => CastClass(resolve(cursor)?),
        0x75 => IsInst(resolve(cursor)?),
        0x76 => Conv(ConvKind::RUn),
        0x7A => Throw,
        0x7B => LdFld(resolve(cursor)?),
        0x7C => LdFldA(resolve(cursor)?),
        0x7D => StFld(resolve(cursor)?),
        0x7E => LdsFld(resolve(cursor)?),
        0x7F => LdsFldA(resolve(cursor)?),
        0x80 => StsFld(resolve(cursor)?),
        0x8C => Box(resolve(cursor)?),
        0x8D => NewArr(resolve(cursor)?),
        0x8E => LdLen,
        0x8F => LdElemA(resolve(cursor)?),
        byte @ 0x90..=0x9A => LdElem(
            LoadKind::from_ldelem_byte(byte)
                .ok_or_else(|| malformed(start, "bad ldelem form"))?,
        ),
        byte @ 0x9B..=0xA2 => StElem(
            StoreKind::from_stelem_byte(byte)
                .ok_or_else(|| malformed(start, "bad stelem form"))?,
        ),
        0xA3 => LdElemAny(resolve(cursor)?),
        0xA4 => StElemAny(resolve(cursor)?),
        0xA5 => UnboxAny(resolve(cursor)?),
        byte @ (0xD1 | 0xD2 | 0xD3 | 0xE0) => Conv(
            ConvKind::from_byte(byte).ok_or_else(|| malformed(start, "bad conversion opcode"))?,
        ),
        0xD0 => LdToken(resolve(cursor)?),
        0xDC => EndFinally,
        0xDD => {
            let displacement = read!(cursor, read_i32) as i64;
            branch_target(cursor, &mut targets, displacement)?;
            Leave(Label(0))
        }
        0xDE => {
            let displacement = cursor.read_i8().map_err(|_| truncated(cursor))? as i64;
            branch_target(cursor, &mut targets, displacement)?;
            Leave(Label(0))
        }
        0xDF => StInd(StoreKind::I),
        0xFE => {
            let second = cursor.read_u8().map_err(|_| truncated(cursor))?;
            match second {
                byte @ 0x01..=0x05 => Cmp(CompareOp::from_fat_byte(byte)
                    .ok_or_else(|| malformed(start, "bad compare opcode"))?),
                0x06 => LdFtn(resolve(cursor)?),
                0x07 => LdVirtFtn(resolve(cursor)?),
                0x09 => LdArg(read!(cursor, read_u16)),
                0x0A => LdArgA(read!(cursor, read_u16)),
                0x0B => StArg(read!(cursor, read_u16)),
                0x0C => LdLoc(read!(cursor, read_u16)),
                0x0D => LdLocA(read!(cursor, read_u16)),
                0x0E => StLoc(read!(cursor, read_u16)),
                0x11 => EndFilter,
                0x15 => InitObj(resolve(cursor)?),
                0x1A => Rethrow,
                0x1C => SizeOf(resolve(cursor)?),
                other => {
                    return Err(malformed(
                        start,
                        format!("unknown extended opcode 0xFE {:#04x}", other),
                    ))
                }
            }
        }
        other => return Err(malformed(start, format!("unknown opcode {:#04x}", other))),
    };

    Ok(ProtoInstruction {
        offset: start,
        insn,
        targets,
    })
}

/// Swap placeholder branch labels for the real ones
fn retarget<'g>(insn: Instruction<ExternalRef<'g>>, labels: &[Label]) -> Instruction<ExternalRef<'g>> {
    match insn {
        Instruction::Br(_) => Instruction::Br(labels[0]),
        Instruction::BrFalse(_) => Instruction::BrFalse(labels[0]),
        Instruction::BrTrue(_) => Instruction::BrTrue(labels[0]),
        Instruction::BrCmp(comparison, _) => Instruction::BrCmp(comparison, labels[0]),
        Instruction::Leave(_) => Instruction::Leave(labels[0]),
        Instruction::Switch(_) => Instruction::Switch(labels.to_vec()),
        other => other,
    }
}

/// Parse a method body back into its symbolic form
///
/// Inverse of [`crate::cil::baker::bake`]: the result is observationally equal to the body that
/// was encoded (same instructions, operand values, and resolved targets), modulo the concrete
/// token values assigned by the resolver.
pub fn read<'g>(
    bytes: &[u8],
    system: &SystemTypes<'g>,
    resolver: &dyn TokenResolver<'g>,
) -> Result<MethodBody<'g, ExternalRef<'g>>, Error> {
    let header = read_header(bytes)?;
    let code = bytes
        .get(header.header_size..header.header_size + header.code_size)
        .ok_or_else(|| malformed(header.header_size, "truncated code section"))?;

    // First pass: instructions, with branch targets as absolute offsets
    let mut decoded: Vec<ProtoInstruction<'g>> = vec![];
    let mut cursor = Cursor::new(code);
    while (cursor.position() as usize) < code.len() {
        decoded.push(decode_instruction(&mut cursor, code.len(), resolver)?);
    }
    log::trace!("decoded {} instructions from {} bytes", decoded.len(), code.len());

    // Exception handler sections follow the code, 4-byte aligned
    let mut raw_handlers: Vec<RawHandler> = vec![];
    if header.more_sects {
        let mut section_start = header.header_size + header.code_size;
        section_start += (4 - section_start % 4) % 4;
        let sections = bytes
            .get(section_start..)
            .ok_or_else(|| malformed(section_start, "truncated exception section"))?;
        let mut cursor = Cursor::new(sections);
        loop {
            let (mut section_handlers, more) = exception::read_section(&mut cursor)?;
            raw_handlers.append(&mut section_handlers);
            if !more {
                break;
            }
        }
    }

    // Every branch target and region boundary becomes a label
    let mut boundaries: BTreeSet<usize> = BTreeSet::new();
    for proto in &decoded {
        boundaries.extend(proto.targets.iter().copied());
    }
    for raw in &raw_handlers {
        boundaries.insert(raw.try_offset as usize);
        boundaries.insert((raw.try_offset + raw.try_length) as usize);
        boundaries.insert(raw.handler_offset as usize);
        boundaries.insert((raw.handler_offset + raw.handler_length) as usize);
        if raw.flags == 0x0001 {
            boundaries.insert(raw.trailing as usize);
        }
    }

    let index_of_offset: HashMap<usize, usize> = decoded
        .iter()
        .enumerate()
        .map(|(index, proto)| (proto.offset, index))
        .collect();

    // Second pass: pin a label at every boundary offset and rewrite the branches
    let mut generator = LabelGenerator::new();
    let mut stream: CodeStream<ExternalRef<'g>> = CodeStream::new();
    let mut label_at: HashMap<usize, Label> = HashMap::new();
    for boundary in &boundaries {
        let index = if *boundary == code.len() {
            decoded.len()
        } else {
            *index_of_offset.get(boundary).ok_or_else(|| {
                malformed(*boundary, "target does not land on an instruction boundary")
            })?
        };
        let label = generator.fresh_label();
        stream
            .mark_at(label, index)
            .expect("fresh labels cannot collide");
        label_at.insert(*boundary, label);
    }

    for proto in decoded {
        let labels: Vec<Label> = proto
            .targets
            .iter()
            .map(|target| label_at[target])
            .collect();
        stream.push(retarget(proto.insn, &labels));
    }

    let handlers = raw_handlers
        .iter()
        .map(|raw| -> Result<ExceptionHandler<ExternalRef<'g>>, Error> {
            let label_of = |offset: u32| label_at[&(offset as usize)];
            let kind = match raw.flags {
                0x0000 => HandlerKind::Catch(resolver.resolve(Token(raw.trailing))?),
                0x0001 => HandlerKind::Filter {
                    filter_start: label_of(raw.trailing),
                },
                0x0002 => HandlerKind::Finally,
                0x0004 => HandlerKind::Fault,
                other => {
                    return Err(malformed(
                        raw.try_offset as usize,
                        format!("unknown handler kind {:#06x}", other),
                    ))
                }
            };
            Ok(ExceptionHandler {
                kind,
                try_start: label_of(raw.try_offset),
                try_end: label_of(raw.try_offset + raw.try_length),
                handler_start: label_of(raw.handler_offset),
                handler_end: label_of(raw.handler_offset + raw.handler_length),
            })
        })
        .collect::<Result<Vec<_>, Error>>()?;

    let locals = if header.locals_token != 0 {
        match resolver.resolve(Token(header.locals_token))? {
            ExternalRef::LocalsSig(blob) => signature::decode_locals(&blob, system, resolver)?,
            other => {
                return Err(Error::UnsupportedSignature(format!(
                    "local signature token resolved to {}",
                    other
                )))
            }
        }
    } else {
        vec![]
    };

    Ok(MethodBody {
        code: stream,
        handlers,
        locals,
        init_locals: header.init_locals,
        max_stack: header.max_stack,
    })
}

/// Like [`read`], but replays the decoded body through the evaluation-stack verifier
pub fn read_verified<'g>(
    bytes: &[u8],
    system: &SystemTypes<'g>,
    resolver: &dyn TokenResolver<'g>,
    method: &MethodSig<'g>,
    this_type: Option<&CilType<'g>>,
    strictness: StrictnessLevel,
) -> Result<MethodBody<'g, ExternalRef<'g>>, Error> {
    let body = read(bytes, system, resolver)?;
    let cx = MutateCx {
        method,
        this_type,
        locals: &body.locals,
        system,
        strictness,
    };
    verify_body(&body.code, &body.handlers, &cx)?;
    Ok(body)
}
