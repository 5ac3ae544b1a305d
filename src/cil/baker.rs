//! Encoding a sealed method body into its wire format
//!
//! The layout is header, then code, then (4-byte aligned) the exception handler sections
//! (ECMA-335 §II.25.4). Two header shapes exist: the tiny one packs the code size and format
//! bits into a single byte and is only legal for small, plain bodies; the fat one is a 12-byte
//! record. External references become resolver tokens at this point, and branch labels become
//! displacements, with every branch getting its short form when the settled displacement fits
//! in a signed byte.

use super::binary_format::Serialize;
use super::body_builder::MethodBody;
use super::errors::Error;
use super::exception::{self, HandlerKind, RawHandler};
use super::instruction::{EncodedTarget, Instruction, Label};
use super::signature;
use super::tokens::{ExternalRef, Token, TokenResolver};
use super::type_graph::SystemTypes;

/// Format bits in the low two bits of the first header byte
pub(crate) const TINY_FORMAT: u8 = 0x2;
pub(crate) const FAT_FORMAT: u8 = 0x3;
pub(crate) const FORMAT_MASK: u8 = 0x3;

/// Additional fat header flags
pub(crate) const FLAG_MORE_SECTS: u8 = 0x8;
pub(crate) const FLAG_INIT_LOCALS: u8 = 0x10;

/// Fat header length in bytes (3 words of 4 bytes, stored in the size nibble)
pub(crate) const FAT_HEADER_SIZE: usize = 12;

/// A tiny header can express at most this much code
const TINY_MAX_CODE_SIZE: usize = 63;

/// The operand stack depth a tiny body is allowed to reach
const TINY_MAX_STACK: u16 = 8;

/// Per-instruction encoding decisions, settled before any byte is written
struct Layout {
    /// Whether each (sizeable) branch uses its short form
    short: Vec<bool>,

    /// Byte offset of each instruction, plus the end offset as a final element
    offsets: Vec<usize>,
}

fn label_offset<R>(
    body: &MethodBody<'_, R>,
    layout_offsets: &[usize],
    label: Label,
) -> Result<usize, Error> {
    body.code
        .index_of_label(label)
        .map(|index| layout_offsets[index])
        .ok_or_else(|| Error::UnmarkedLabels(vec![label]))
}

/// Settle branch sizes: start everything short, widen whatever does not fit, repeat
///
/// Widening an instruction moves everything after it, which can push another displacement out
/// of short range, so this iterates to a fixed point. Sizes only ever grow, so it terminates.
fn settle_layout<'g>(body: &MethodBody<'g, ExternalRef<'g>>) -> Result<Layout, Error> {
    let count = body.code.len();
    let mut short: Vec<bool> = Vec::with_capacity(count);
    for (_, _, insn) in body.code.iter() {
        short.push(insn.is_sizeable_branch());
    }

    loop {
        let mut offsets = Vec::with_capacity(count + 1);
        let mut offset = 0usize;
        for (_, index, insn) in body.code.iter() {
            offsets.push(offset);
            offset += insn.encoded_width(short[index]);
        }
        offsets.push(offset);

        let mut widened = false;
        for (_, index, insn) in body.code.iter() {
            if !short[index] || !insn.is_sizeable_branch() {
                continue;
            }
            let target = insn.jump_targets()[0];
            let target_offset = label_offset(body, &offsets, target)?;
            let end_of_insn = offsets[index] + insn.encoded_width(true);
            let displacement = target_offset as i64 - end_of_insn as i64;
            if i8::try_from(displacement).is_err() {
                short[index] = false;
                widened = true;
            }
        }

        if !widened {
            return Ok(Layout { short, offsets });
        }
    }
}

fn encode_code<'g>(
    body: &MethodBody<'g, ExternalRef<'g>>,
    layout: &Layout,
    resolver: &dyn TokenResolver<'g>,
) -> Result<Vec<u8>, Error> {
    let mut code_bytes: Vec<u8> = vec![];

    for (_, index, insn) in body.code.iter() {
        let token_insn: Instruction<Token> = insn.map_refs(|r| resolver.token_of(r))?;
        let end_of_insn = layout.offsets[index] + insn.encoded_width(layout.short[index]);

        let targets = insn
            .jump_targets()
            .into_iter()
            .map(|target| -> Result<EncodedTarget, Error> {
                let target_offset = label_offset(body, &layout.offsets, target)?;
                let displacement = target_offset as i64 - end_of_insn as i64;
                if layout.short[index] {
                    let displacement = i8::try_from(displacement).map_err(|_| {
                        Error::MalformedEncoding {
                            offset: layout.offsets[index],
                            message: format!("short branch displacement {} overflows", displacement),
                        }
                    })?;
                    Ok(EncodedTarget::Short(displacement))
                } else {
                    let displacement = i32::try_from(displacement).map_err(|_| {
                        Error::MalformedEncoding {
                            offset: layout.offsets[index],
                            message: format!("branch displacement {} overflows", displacement),
                        }
                    })?;
                    Ok(EncodedTarget::Long(displacement))
                }
            })
            .collect::<Result<Vec<_>, Error>>()?;

        token_insn.serialize_into(&mut code_bytes, &targets)?;
    }

    Ok(code_bytes)
}

fn raw_handlers<'g>(
    body: &MethodBody<'g, ExternalRef<'g>>,
    layout: &Layout,
    resolver: &dyn TokenResolver<'g>,
) -> Result<Vec<RawHandler>, Error> {
    let region = |start: Label, end: Label| -> Result<(u32, u32), Error> {
        let start_offset = label_offset(body, &layout.offsets, start)?;
        let end_offset = label_offset(body, &layout.offsets, end)?;
        if end_offset < start_offset {
            return Err(Error::MalformedRegion("region boundaries out of order"));
        }
        Ok((start_offset as u32, (end_offset - start_offset) as u32))
    };

    body.handlers
        .iter()
        .map(|handler| -> Result<RawHandler, Error> {
            let (try_offset, try_length) = region(handler.try_start, handler.try_end)?;
            let (handler_offset, handler_length) =
                region(handler.handler_start, handler.handler_end)?;
            let trailing = match &handler.kind {
                HandlerKind::Catch(external) => resolver.token_of(external)?.0,
                HandlerKind::Filter { filter_start } => {
                    label_offset(body, &layout.offsets, *filter_start)? as u32
                }
                HandlerKind::Finally | HandlerKind::Fault => 0,
            };
            Ok(RawHandler {
                flags: handler.kind.flags(),
                try_offset,
                try_length,
                handler_offset,
                handler_length,
                trailing,
            })
        })
        .collect()
}

/// Encode a sealed body into the exact byte layout the runtime loads
pub fn bake<'g>(
    body: &MethodBody<'g, ExternalRef<'g>>,
    system: &SystemTypes<'g>,
    resolver: &dyn TokenResolver<'g>,
) -> Result<Vec<u8>, Error> {
    let layout = settle_layout(body)?;
    let code_bytes = encode_code(body, &layout, resolver)?;
    let handlers = raw_handlers(body, &layout, resolver)?;

    let tiny = code_bytes.len() <= TINY_MAX_CODE_SIZE
        && body.max_stack <= TINY_MAX_STACK
        && body.locals.is_empty()
        && handlers.is_empty();

    let mut out: Vec<u8> = vec![];
    if tiny {
        out.push(TINY_FORMAT | (code_bytes.len() as u8) << 2);
        out.extend_from_slice(&code_bytes);
        return Ok(out);
    }

    let locals_token: u32 = if body.locals.is_empty() {
        0
    } else {
        let blob = signature::encode_locals(&body.locals, system, resolver)?;
        resolver.token_of(&ExternalRef::LocalsSig(blob))?.0
    };

    let mut flags = FAT_FORMAT;
    if !handlers.is_empty() {
        flags |= FLAG_MORE_SECTS;
    }
    if body.init_locals {
        flags |= FLAG_INIT_LOCALS;
    }

    out.push(flags);
    out.push(((FAT_HEADER_SIZE / 4) as u8) << 4);
    (body.max_stack).serialize(&mut out)?;
    (code_bytes.len() as u32).serialize(&mut out)?;
    locals_token.serialize(&mut out)?;
    out.extend_from_slice(&code_bytes);

    if !handlers.is_empty() {
        while out.len() % 4 != 0 {
            out.push(0);
        }
        exception::write_section(&handlers, &mut out)?;
    }

    log::trace!(
        "baked method body: {} bytes of code, {} handlers, max stack {}",
        code_bytes.len(),
        handlers.len(),
        body.max_stack,
    );
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cil::body_builder::BodyBuilder;
    use crate::cil::opcode::BinaryOp;
    use crate::cil::signature::{CilType, MethodSig};
    use crate::cil::tokens::InMemoryTokenTable;
    use crate::cil::type_graph::{TypeGraph, TypeGraphArenas};
    use crate::cil::verifier::StrictnessLevel;
    use Instruction::*;

    #[test]
    fn add_method_bakes_tiny() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();
        let resolver = InMemoryTokenTable::new();

        let mut builder = BodyBuilder::new(
            &system,
            MethodSig::static_method(vec![CilType::I4, CilType::I4], Some(CilType::I4)),
            None,
            StrictnessLevel::Full,
        );
        builder.push_instruction(LdArg(0)).unwrap();
        builder.push_instruction(LdArg(1)).unwrap();
        builder.push_instruction(Binary(BinaryOp::Add)).unwrap();
        builder.push_instruction(Ret).unwrap();
        let body = builder.seal().unwrap();

        let bytes = bake(&body, &system, &resolver).unwrap();
        // Tiny header byte: code size 4, format bits 0x2; then ldarg.0 ldarg.1 add ret
        assert_eq!(bytes, vec![0x12, 0x02, 0x03, 0x58, 0x2A]);
    }

    #[test]
    fn locals_force_a_fat_header() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();
        let resolver = InMemoryTokenTable::new();

        let mut builder = BodyBuilder::new(
            &system,
            MethodSig::static_method(vec![CilType::I4], Some(CilType::I4)),
            None,
            StrictnessLevel::Full,
        );
        let local = builder.declare_local(CilType::I4);
        builder.push_instruction(LdArg(0)).unwrap();
        builder.push_instruction(StLoc(local)).unwrap();
        builder.push_instruction(LdLoc(local)).unwrap();
        builder.push_instruction(Ret).unwrap();
        let body = builder.seal().unwrap();

        let bytes = bake(&body, &system, &resolver).unwrap();
        assert_eq!(bytes[0] & FORMAT_MASK, FAT_FORMAT);
        assert_ne!(bytes[0] & FLAG_INIT_LOCALS, 0);
        assert_eq!(bytes[1] >> 4, 3);
        // max stack
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 1);
        // code size
        assert_eq!(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 4);
        // local signature token is non-zero
        assert_ne!(
            u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            0
        );
    }

    #[test]
    fn near_branches_use_short_forms() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();
        let resolver = InMemoryTokenTable::new();

        let mut builder = BodyBuilder::new(
            &system,
            MethodSig::static_method(vec![CilType::I4], Some(CilType::I4)),
            None,
            StrictnessLevel::Full,
        );
        let skip = builder.fresh_label();
        builder.push_instruction(LdArg(0)).unwrap();
        builder.push_instruction(BrTrue(skip)).unwrap();
        builder.push_instruction(LdcI4(0)).unwrap();
        builder.push_instruction(Ret).unwrap();
        builder.mark_label(skip).unwrap();
        builder.push_instruction(LdcI4(1)).unwrap();
        builder.push_instruction(Ret).unwrap();
        let body = builder.seal().unwrap();

        let bytes = bake(&body, &system, &resolver).unwrap();
        // Tiny header for 7 bytes of code: ldarg.0, brtrue.s +2, ldc.i4.0, ret, ldc.i4.1, ret
        assert_eq!(bytes, vec![0x1E, 0x02, 0x2D, 0x02, 0x16, 0x2A, 0x17, 0x2A]);
    }

    #[test]
    fn far_branches_widen() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();
        let resolver = InMemoryTokenTable::new();

        let mut builder = BodyBuilder::new(
            &system,
            MethodSig::static_method(vec![CilType::I4], Some(CilType::I4)),
            None,
            StrictnessLevel::Full,
        );
        let skip = builder.fresh_label();
        builder.push_instruction(LdArg(0)).unwrap();
        builder.push_instruction(BrTrue(skip)).unwrap();
        // 200 bytes of filler keeps the target out of short range
        for _ in 0..100 {
            builder.push_instruction(LdcI4(0)).unwrap();
            builder.push_instruction(Pop).unwrap();
        }
        builder.push_instruction(LdcI4(0)).unwrap();
        builder.push_instruction(Ret).unwrap();
        builder.mark_label(skip).unwrap();
        builder.push_instruction(LdcI4(1)).unwrap();
        builder.push_instruction(Ret).unwrap();
        let body = builder.seal().unwrap();

        let bytes = bake(&body, &system, &resolver).unwrap();
        assert_eq!(bytes[0] & FORMAT_MASK, FAT_FORMAT);
        // The conditional branch right after ldarg.0 got its standard form
        let code = &bytes[FAT_HEADER_SIZE..];
        assert_eq!(code[0], 0x02);
        assert_eq!(code[1], 0x3A);
        assert_eq!(
            i32::from_le_bytes([code[2], code[3], code[4], code[5]]),
            202
        );
    }
}
