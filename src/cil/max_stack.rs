//! Static computation of the method header's max-stack field
//!
//! A single linear pass over the instruction stream, with a side map of "stack depth demanded at
//! instruction X by a not-yet-visited branch or handler entry". Call-shaped instructions compute
//! their net effect from the callee's arity and return type; everything else comes from a static
//! per-family push/pop table. The result is an upper bound on the depth reachable along any
//! execution path, which is exactly what the header field must guarantee.

use super::exception::{ExceptionHandler, HandlerKind};
use super::instruction::{CodeStream, Instruction};
use super::tokens::ExternalRef;
use std::collections::HashMap;

/// Net stack effect of one instruction, as (pops, pushes)
fn stack_delta<'g>(insn: &Instruction<ExternalRef<'g>>) -> (u16, u16) {
    use Instruction::*;

    match insn {
        Nop | Break | Br(_) | Jmp(_) | Rethrow | EndFinally => (0, 0),

        LdArg(_) | LdArgA(_) | LdLoc(_) | LdLocA(_) | LdNull | LdcI4(_) | LdcI8(_)
        | LdcR4(_) | LdcR8(_) | LdStr(_) | LdsFld(_) | LdsFldA(_) | LdToken(_) | SizeOf(_)
        | LdFtn(_) => (0, 1),

        StArg(_) | StLoc(_) | Pop | BrFalse(_) | BrTrue(_) | Switch(_) | StsFld(_) | Throw
        | EndFilter => (1, 0),

        Dup => (1, 2),

        LdInd(_) | Unary(_) | Conv(_) | LdFld(_) | LdFldA(_) | CastClass(_) | IsInst(_)
        | Box(_) | UnboxAny(_) | NewArr(_) | LdLen | LdVirtFtn(_) => (1, 1),

        InitObj(_) => (1, 0),

        BrCmp(_, _) | StInd(_) | StFld(_) => (2, 0),

        Binary(_) | Cmp(_) | LdElemA(_) | LdElem(_) | LdElemAny(_) => (2, 1),

        StElem(_) | StElemAny(_) => (3, 0),

        // `ret` pops the return value, but nothing executes after it so the pop cannot
        // contribute to the maximum
        Ret => (0, 0),

        // `leave` evacuates whatever is on the stack; its target demand is handled separately
        Leave(_) => (0, 0),

        Call(external) | CallVirt(external) => match external {
            ExternalRef::Method(method) => (
                method.signature.arity() as u16,
                method.signature.ret.is_some() as u16,
            ),
            _ => (0, 0),
        },
        CallI(external) => match external {
            ExternalRef::StandaloneSig(sig) => {
                (sig.arity() as u16 + 1, sig.ret.is_some() as u16)
            }
            _ => (1, 0),
        },
        NewObj(external) => match external {
            ExternalRef::Method(method) => (method.signature.params.len() as u16, 1),
            _ => (0, 1),
        },
    }
}

/// Minimum max-stack header value that guarantees no operand stack overflow at run time
pub fn compute_max_stack<'g>(
    code: &CodeStream<ExternalRef<'g>>,
    handlers: &[ExceptionHandler<ExternalRef<'g>>],
) -> u16 {
    // Depth demanded at an instruction index by a branch or handler entry
    let mut pending: HashMap<usize, u16> = HashMap::new();

    let mut demand = |pending: &mut HashMap<usize, u16>, index: Option<usize>, depth: u16| {
        if let Some(index) = index {
            let entry = pending.entry(index).or_insert(depth);
            *entry = (*entry).max(depth);
        }
    };

    for handler in handlers {
        let entry_depth = match &handler.kind {
            HandlerKind::Catch(_) | HandlerKind::Filter { .. } => 1,
            HandlerKind::Finally | HandlerKind::Fault => 0,
        };
        demand(
            &mut pending,
            code.index_of_label(handler.handler_start),
            entry_depth,
        );
        if let HandlerKind::Filter { filter_start } = handler.kind {
            demand(&mut pending, code.index_of_label(filter_start), 1);
        }
    }

    let mut max_depth: u16 = 0;
    let mut depth: Option<u16> = Some(0);

    for (_, index, insn) in code.iter() {
        if let Some(demanded) = pending.get(&index) {
            depth = Some(depth.map_or(*demanded, |current| current.max(*demanded)));
        }
        let current = match depth {
            Some(current) => current,
            // Unreachable until some branch or handler demands a depth here
            None => continue,
        };

        let (pops, pushes) = stack_delta(insn);
        let after = current.saturating_sub(pops) + pushes;
        max_depth = max_depth.max(current).max(after);

        let target_depth = if matches!(insn, Instruction::Leave(_)) {
            0
        } else {
            after
        };
        for target in insn.jump_targets() {
            demand(&mut pending, code.index_of_label(target), target_depth);
        }

        depth = if insn.is_unconditional_terminator() {
            None
        } else {
            Some(after)
        };
    }

    max_depth
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cil::instruction::{Label, LabelGenerator};
    use crate::cil::opcode::BinaryOp;

    fn stream(instructions: Vec<Instruction<ExternalRef<'static>>>) -> CodeStream<ExternalRef<'static>> {
        let mut code = CodeStream::new();
        for insn in instructions {
            code.push(insn);
        }
        code
    }

    #[test]
    fn straight_line_arithmetic() {
        let code = stream(vec![
            Instruction::LdArg(0),
            Instruction::LdArg(1),
            Instruction::Binary(BinaryOp::Add),
            Instruction::Ret,
        ]);
        assert_eq!(compute_max_stack(&code, &[]), 2);
    }

    #[test]
    fn branch_propagates_depth() {
        let mut labels = LabelGenerator::new();
        let join = labels.fresh_label();

        // Push one value, conditionally skip over a push/pop pair, rejoin with depth 1
        let mut code = CodeStream::new();
        code.push(Instruction::LdcI4(1));
        code.push(Instruction::LdcI4(0));
        code.push(Instruction::BrTrue(join));
        code.push(Instruction::LdcI4(2));
        code.push(Instruction::LdcI4(3));
        code.push(Instruction::Pop);
        code.push(Instruction::Pop);
        code.mark(join).unwrap();
        code.push(Instruction::Pop);
        code.push(Instruction::Ret);

        assert_eq!(compute_max_stack(&code, &[]), 3);
    }

    #[test]
    fn dead_code_after_terminator_is_ignored() {
        let code = stream(vec![
            Instruction::Ret,
            Instruction::LdcI4(1),
            Instruction::LdcI4(2),
            Instruction::LdcI4(3),
        ]);
        assert_eq!(compute_max_stack(&code, &[]), 0);
    }

    #[test]
    fn handler_entry_demands_depth_one() {
        let arenas = crate::cil::type_graph::TypeGraphArenas::new();
        let graph = crate::cil::type_graph::TypeGraph::new(&arenas);
        let system = graph.install_system_types();

        let mut labels = LabelGenerator::new();
        let try_start = labels.fresh_label();
        let try_end = labels.fresh_label();
        let handler_end = labels.fresh_label();

        let mut code = CodeStream::new();
        code.mark(try_start).unwrap();
        code.push(Instruction::Nop);
        code.push(Instruction::Leave(handler_end));
        code.mark(try_end).unwrap();
        code.push(Instruction::Pop);
        code.push(Instruction::Leave(handler_end));
        code.mark(handler_end).unwrap();
        code.push(Instruction::Ret);

        let handler = ExceptionHandler {
            kind: HandlerKind::Catch(ExternalRef::Type(
                crate::cil::signature::CilType::Object(system.exception),
            )),
            try_start,
            try_end,
            handler_start: try_end,
            handler_end,
        };

        assert_eq!(compute_max_stack(&code, &[handler]), 1);
    }

    /// True maximum depth over every execution path, by brute-force enumeration
    ///
    /// Only suitable for tiny synthetic programs: paths are cut off at a fixed length so
    /// back-edges terminate.
    fn enumerate_paths(code: &CodeStream<ExternalRef<'static>>) -> u16 {
        fn walk(
            code: &CodeStream<ExternalRef<'static>>,
            index: usize,
            depth: u16,
            steps: usize,
            max_seen: &mut u16,
        ) {
            if steps > 64 || index >= code.len() {
                return;
            }
            let insn = code.get(index).unwrap();
            let (pops, pushes) = stack_delta(insn);
            let after = depth.saturating_sub(pops) + pushes;
            *max_seen = (*max_seen).max(depth).max(after);

            for target in insn.jump_targets() {
                let target_index = code.index_of_label(target).unwrap();
                let target_depth = if matches!(insn, Instruction::Leave(_)) {
                    0
                } else {
                    after
                };
                walk(code, target_index, target_depth, steps + 1, max_seen);
            }
            if !insn.is_unconditional_terminator() {
                walk(code, index + 1, after, steps + 1, max_seen);
            }
        }

        let mut max_seen = 0;
        walk(code, 0, 0, 0, &mut max_seen);
        max_seen
    }

    #[test]
    fn sound_against_exhaustive_path_enumeration() {
        let mut labels = LabelGenerator::new();
        let deep = labels.fresh_label();
        let join = labels.fresh_label();
        let back = labels.fresh_label();

        // A diamond plus a back-edge: one arm piles more on the stack than the other
        let mut code = CodeStream::new();
        code.mark(back).unwrap();
        code.push(Instruction::LdcI4(1));
        code.push(Instruction::BrTrue(deep));
        code.push(Instruction::LdcI4(2));
        code.push(Instruction::Br(join));
        code.mark(deep).unwrap();
        code.push(Instruction::LdcI4(3));
        code.push(Instruction::LdcI4(4));
        code.push(Instruction::LdcI4(5));
        code.push(Instruction::Binary(crate::cil::opcode::BinaryOp::Add));
        code.push(Instruction::Binary(crate::cil::opcode::BinaryOp::Add));
        code.mark(join).unwrap();
        code.push(Instruction::LdcI4(6));
        code.push(Instruction::BrCmp(
            crate::cil::opcode::Comparison::Lt,
            back,
        ));
        code.push(Instruction::Ret);

        let computed = compute_max_stack(&code, &[]);
        let true_max = enumerate_paths(&code);
        assert!(computed >= true_max);
        assert_eq!(computed, 3);
    }

    #[test]
    fn switch_targets_inherit_depth() {
        let mut labels = LabelGenerator::new();
        let a = labels.fresh_label();
        let b: Label = labels.fresh_label();

        let mut code = CodeStream::new();
        code.push(Instruction::LdcI4(7));
        code.push(Instruction::LdcI4(1));
        code.push(Instruction::Switch(vec![a, b]));
        code.push(Instruction::Pop);
        code.push(Instruction::Ret);
        code.mark(a).unwrap();
        code.push(Instruction::Pop);
        code.push(Instruction::Ret);
        code.mark(b).unwrap();
        code.push(Instruction::Pop);
        code.push(Instruction::Ret);

        assert_eq!(compute_max_stack(&code, &[]), 2);
    }
}
