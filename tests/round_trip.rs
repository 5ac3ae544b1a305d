//! End-to-end tests: build a body, bake it, read it back, bake it again.
//!
//! Decoded labels are fresh (they are synthesized per target offset), so "observationally
//! equal" is checked the robust way: re-encoding the decoded body must reproduce the original
//! bytes exactly, and the decoded instruction stream must line up mnemonic-for-mnemonic.

use cilbody::cil::opcode::BinaryOp;
use cilbody::cil::type_graph::{FieldData, MethodData, TypeData, TypeGraph, TypeGraphArenas};
use cilbody::cil::*;
use Instruction::*;

fn mnemonics<R: std::fmt::Display>(body: &MethodBody<'_, R>) -> Vec<String> {
    body.code.iter().map(|(_, _, insn)| insn.mnemonic()).collect()
}

#[test]
fn tiny_body_round_trips() {
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
    assert_eq!(body.max_stack, 2);

    let bytes = bake(&body, &system, &resolver).unwrap();
    let decoded = read(&bytes, &system, &resolver).unwrap();
    assert_eq!(mnemonics(&decoded), vec!["ldarg", "ldarg", "add", "ret"]);

    let rebaked = bake(&decoded, &system, &resolver).unwrap();
    assert_eq!(rebaked, bytes);
}

#[test]
fn branches_and_switch_round_trip() {
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
    let one = builder.fresh_label();
    let two = builder.fresh_label();
    let fallback = builder.fresh_label();
    let tail = builder.fresh_label();

    builder.push_instruction(LdArg(0)).unwrap();
    builder.push_instruction(Switch(vec![one, two])).unwrap();
    builder.push_instruction(Br(fallback)).unwrap();
    builder.mark_label(one).unwrap();
    builder.push_instruction(LdcI4(10)).unwrap();
    builder.push_instruction(Br(tail)).unwrap();
    builder.mark_label(two).unwrap();
    builder.push_instruction(LdcI4(20)).unwrap();
    builder.push_instruction(Br(tail)).unwrap();
    builder.mark_label(fallback).unwrap();
    builder.push_instruction(LdcI4(0)).unwrap();
    builder.mark_label(tail).unwrap();
    builder.push_instruction(Ret).unwrap();
    let body = builder.seal().unwrap();

    let bytes = bake(&body, &system, &resolver).unwrap();
    let decoded = read(&bytes, &system, &resolver).unwrap();
    assert_eq!(mnemonics(&decoded), mnemonics(&body));

    let rebaked = bake(&decoded, &system, &resolver).unwrap();
    assert_eq!(rebaked, bytes);

    // Decoded bodies replay cleanly through the verifier
    read_verified(
        &bytes,
        &system,
        &resolver,
        &MethodSig::static_method(vec![CilType::I4], Some(CilType::I4)),
        None,
        StrictnessLevel::Full,
    )
    .unwrap();
}

#[test]
fn calls_fields_strings_and_handlers_round_trip() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.install_system_types();
    let resolver = InMemoryTokenTable::new();

    let widget = graph.add_type(TypeData::class("Widget", system.object));
    let ctor = graph.add_method(MethodData {
        owner: widget,
        name: MethodData::CTOR.to_string(),
        signature: MethodSig::instance_method(vec![], None),
    });
    let compute = graph.add_method(MethodData {
        owner: widget,
        name: "Compute".to_string(),
        signature: MethodSig::static_method(vec![CilType::I4], Some(CilType::I4)),
    });
    let count = graph.add_field(FieldData {
        owner: widget,
        name: "count".to_string(),
        ty: CilType::I4,
        is_static: false,
    });
    let name = graph.add_field(FieldData {
        owner: widget,
        name: "name".to_string(),
        ty: CilType::Object(system.string),
        is_static: true,
    });

    let signature =
        MethodSig::static_method(vec![CilType::I4, CilType::Object(widget)], Some(CilType::I4));
    let mut builder = BodyBuilder::new(&system, signature.clone(), None, StrictnessLevel::Full);
    let acc = builder.declare_local(CilType::I4);
    let tmp = builder.declare_local(CilType::Object(widget));
    let done = builder.fresh_label();

    builder
        .push_instruction(LdStr(ExternalRef::Str("start".to_string())))
        .unwrap();
    builder
        .push_instruction(StsFld(ExternalRef::Field(name)))
        .unwrap();
    builder.push_instruction(LdArg(0)).unwrap();
    builder.push_instruction(StLoc(acc)).unwrap();

    builder.begin_try().unwrap();
    builder.push_instruction(LdArg(1)).unwrap();
    builder
        .push_instruction(LdFld(ExternalRef::Field(count)))
        .unwrap();
    builder.push_instruction(StLoc(acc)).unwrap();
    builder.push_instruction(Leave(done)).unwrap();
    builder
        .begin_catch(CilType::Object(system.exception))
        .unwrap();
    builder.push_instruction(Pop).unwrap();
    builder.push_instruction(Leave(done)).unwrap();
    builder.begin_finally().unwrap();
    builder.push_instruction(EndFinally).unwrap();
    builder.end_region().unwrap();

    builder.mark_label(done).unwrap();
    builder
        .push_instruction(NewObj(ExternalRef::Method(ctor)))
        .unwrap();
    builder.push_instruction(StLoc(tmp)).unwrap();
    builder.push_instruction(LdLoc(acc)).unwrap();
    builder
        .push_instruction(Call(ExternalRef::Method(compute)))
        .unwrap();
    builder.push_instruction(Ret).unwrap();
    let body = builder.seal().unwrap();
    assert_eq!(body.handlers.len(), 2);

    let bytes = bake(&body, &system, &resolver).unwrap();
    let decoded = read(&bytes, &system, &resolver).unwrap();

    assert_eq!(mnemonics(&decoded), mnemonics(&body));
    assert_eq!(decoded.handlers.len(), 2);
    assert!(matches!(decoded.handlers[0].kind, HandlerKind::Catch(_)));
    assert!(matches!(decoded.handlers[1].kind, HandlerKind::Finally));
    assert_eq!(decoded.locals, body.locals);
    assert_eq!(decoded.max_stack, body.max_stack);
    assert!(decoded.init_locals);

    let rebaked = bake(&decoded, &system, &resolver).unwrap();
    assert_eq!(rebaked, bytes);

    read_verified(
        &bytes,
        &system,
        &resolver,
        &signature,
        None,
        StrictnessLevel::Full,
    )
    .unwrap();
}

#[test]
fn small_handler_regions_use_the_compact_section() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.install_system_types();
    let resolver = InMemoryTokenTable::new();

    let mut builder = BodyBuilder::new(
        &system,
        MethodSig::static_method(vec![], None),
        None,
        StrictnessLevel::Full,
    );
    let done = builder.fresh_label();
    builder.begin_try().unwrap();
    builder.push_instruction(Nop).unwrap();
    builder.push_instruction(Leave(done)).unwrap();
    builder
        .begin_catch(CilType::Object(system.exception))
        .unwrap();
    builder.push_instruction(Pop).unwrap();
    builder.push_instruction(Leave(done)).unwrap();
    builder.end_region().unwrap();
    builder.mark_label(done).unwrap();
    builder.push_instruction(Ret).unwrap();
    let body = builder.seal().unwrap();

    let bytes = bake(&body, &system, &resolver).unwrap();
    let code_size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let section_start = (12 + code_size + 3) & !3;
    assert_eq!(bytes[section_start] & 0x40, 0, "expected the compact section shape");

    let decoded = read(&bytes, &system, &resolver).unwrap();
    assert_eq!(decoded.handlers.len(), 1);
    assert_eq!(bake(&decoded, &system, &resolver).unwrap(), bytes);
}

#[test]
fn oversized_try_region_forces_the_fat_section() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.install_system_types();
    let resolver = InMemoryTokenTable::new();

    let mut builder = BodyBuilder::new(
        &system,
        MethodSig::static_method(vec![], None),
        None,
        StrictnessLevel::Full,
    );
    let done = builder.fresh_label();
    builder.begin_try().unwrap();
    // Pad the protected region past 255 bytes so its length no longer fits a byte
    for _ in 0..130 {
        builder.push_instruction(LdcI4(0)).unwrap();
        builder.push_instruction(Pop).unwrap();
    }
    builder.push_instruction(Leave(done)).unwrap();
    builder
        .begin_catch(CilType::Object(system.exception))
        .unwrap();
    builder.push_instruction(Pop).unwrap();
    builder.push_instruction(Leave(done)).unwrap();
    builder.end_region().unwrap();
    builder.mark_label(done).unwrap();
    builder.push_instruction(Ret).unwrap();
    let body = builder.seal().unwrap();

    let bytes = bake(&body, &system, &resolver).unwrap();
    let code_size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let section_start = (12 + code_size + 3) & !3;
    assert_ne!(bytes[section_start] & 0x40, 0, "expected the fat section shape");

    let decoded = read(&bytes, &system, &resolver).unwrap();
    assert_eq!(decoded.handlers.len(), 1);
    assert_eq!(bake(&decoded, &system, &resolver).unwrap(), bytes);
}

#[test]
fn unknown_tokens_fail_decoding() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.install_system_types();
    let resolver = InMemoryTokenTable::new();

    let mut builder = BodyBuilder::new(
        &system,
        MethodSig::static_method(vec![], None),
        None,
        StrictnessLevel::Full,
    );
    builder
        .push_instruction(LdStr(ExternalRef::Str("hello".to_string())))
        .unwrap();
    builder.push_instruction(Pop).unwrap();
    builder.push_instruction(Ret).unwrap();
    let body = builder.seal().unwrap();
    let bytes = bake(&body, &system, &resolver).unwrap();

    // A resolver that never saw the bake cannot resolve the baked tokens
    let fresh = InMemoryTokenTable::new();
    assert!(matches!(
        read(&bytes, &system, &fresh),
        Err(Error::UnresolvedReference(_))
    ));
}

#[test]
fn truncated_streams_fail_decoding() {
    let arenas = TypeGraphArenas::new();
    let graph = TypeGraph::new(&arenas);
    let system = graph.install_system_types();
    let resolver = InMemoryTokenTable::new();

    let mut builder = BodyBuilder::new(
        &system,
        MethodSig::static_method(vec![], Some(CilType::I4)),
        None,
        StrictnessLevel::Full,
    );
    builder.push_instruction(LdcI4(100_000)).unwrap();
    builder.push_instruction(Ret).unwrap();
    let body = builder.seal().unwrap();
    let bytes = bake(&body, &system, &resolver).unwrap();

    // Chop the stream mid-operand
    assert!(matches!(
        read(&bytes[..bytes.len() - 3], &system, &resolver),
        Err(Error::MalformedEncoding { .. })
    ));
}
