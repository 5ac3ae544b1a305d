//! Incremental construction of a verified method body
//!
//! [`BodyBuilder`] provides the surface a compiler front end talks to: emit instructions one at
//! a time, declare locals, define and mark labels, and open/close exception regions. Every
//! emitted instruction is checked against the evaluation stack as it is issued, so violations
//! surface at the call that caused them. Label shapes recorded during emission are optimistic;
//! [`BodyBuilder::seal`] settles them with a fixed-point pass over the whole body before
//! handing out the finished [`MethodBody`].

use super::errors::{Error, VerifierErrorKind};
use super::exception::{ExceptionHandler, HandlerKind};
use super::instruction::{CodeStream, Instruction, Label, LabelGenerator};
use super::max_stack::compute_max_stack;
use super::signature::{CilType, MethodSig, StackCategory};
use super::tokens::ExternalRef;
use super::type_graph::SystemTypes;
use super::verifier::{
    merge_into, mutate, verify_body, EsType, EvalStack, MutateCx, StrictnessLevel,
};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// A finished, sealed method body
///
/// `R` is the external-reference representation: [`ExternalRef`] for bodies built or decoded
/// against a type graph, [`crate::cil::Token`] for raw decoded bodies.
#[derive(Clone, Debug)]
pub struct MethodBody<'g, R> {
    pub code: CodeStream<R>,
    pub handlers: Vec<ExceptionHandler<R>>,
    pub locals: Vec<CilType<'g>>,
    pub init_locals: bool,
    pub max_stack: u16,
}

/// The usual form of a built body
pub type BuiltBody<'g> = MethodBody<'g, ExternalRef<'g>>;

impl<'g, R: fmt::Display> MethodBody<'g, R> {
    pub fn render_listing(&self) -> String {
        self.code.render_listing()
    }
}

/// What kind of handler is currently being filled in
enum PendingHandler<'g> {
    Catch {
        catch_type: CilType<'g>,
        handler_start: Label,
    },
    /// Filter condition code; no handler body yet
    FilterCondition { filter_start: Label },
    Filter {
        filter_start: Label,
        handler_start: Label,
    },
    Finally { handler_start: Label },
    Fault { handler_start: Label },
}

/// One open `begin_try` .. `end_region` nest
struct RegionFrame<'g> {
    try_start: Label,
    /// Marked when the first handler begins
    try_end: Option<Label>,
    pending: Option<PendingHandler<'g>>,
    /// Handlers of this region already closed off (a try may have several catches)
    closed: Vec<ExceptionHandler<ExternalRef<'g>>>,
}

/// Builds one method body, verifying each instruction as it is issued
pub struct BodyBuilder<'g> {
    system: &'g SystemTypes<'g>,
    method: MethodSig<'g>,
    this_type: Option<CilType<'g>>,
    strictness: StrictnessLevel,
    init_locals: bool,

    code: CodeStream<ExternalRef<'g>>,
    locals: Vec<CilType<'g>>,
    label_generator: LabelGenerator,

    /// First-path stack shape recorded per label (optimistic; re-settled at seal)
    shapes: HashMap<Label, Vec<EsType<'g>>>,

    /// Labels some branch refers to (each must be marked before sealing)
    referenced: HashSet<Label>,

    /// Live evaluation stack; `None` after an unconditional terminator
    stack: Option<EvalStack<'g>>,

    regions: Vec<RegionFrame<'g>>,
    handlers: Vec<ExceptionHandler<ExternalRef<'g>>>,
}

impl<'g> BodyBuilder<'g> {
    /// Start building the body of a method with the given signature
    ///
    /// `this_type` is the declared type of argument 0 for instance methods (ignored for static
    /// ones).
    pub fn new(
        system: &'g SystemTypes<'g>,
        method: MethodSig<'g>,
        this_type: Option<CilType<'g>>,
        strictness: StrictnessLevel,
    ) -> BodyBuilder<'g> {
        BodyBuilder {
            system,
            method,
            this_type,
            strictness,
            init_locals: true,
            code: CodeStream::new(),
            locals: vec![],
            label_generator: LabelGenerator::new(),
            shapes: HashMap::new(),
            referenced: HashSet::new(),
            stack: Some(EvalStack::new()),
            regions: vec![],
            handlers: vec![],
        }
    }

    /// Whether the baked header asks the runtime to zero-initialize locals (on by default)
    pub fn set_init_locals(&mut self, init_locals: bool) {
        self.init_locals = init_locals;
    }

    /// Declare a local variable, returning its index
    pub fn declare_local(&mut self, ty: CilType<'g>) -> u16 {
        self.locals.push(ty);
        (self.locals.len() - 1) as u16
    }

    /// Generate a fresh label
    pub fn fresh_label(&mut self) -> Label {
        self.label_generator.fresh_label()
    }

    /// The stack shape at the current emission point, `None` in unreachable code
    pub fn current_stack(&self) -> Option<&[EsType<'g>]> {
        self.stack.as_ref().map(EvalStack::types)
    }

    /// Fix `label` to the current stream position
    ///
    /// If some branch already recorded a stack shape for the label, execution resumes with that
    /// shape (merged with the fallthrough shape, when the position is reachable from above).
    pub fn mark_label(&mut self, label: Label) -> Result<(), Error> {
        self.code.mark(label)?;

        if let Some(live) = self.stack.take() {
            let cx = MutateCx {
                method: &self.method,
                this_type: self.this_type.as_ref(),
                locals: &self.locals,
                system: self.system,
                strictness: self.strictness,
            };
            merge_into(&mut self.shapes, label, live.types(), &cx, &|| {
                self.code.render_listing()
            })?;
        }
        self.stack = self
            .shapes
            .get(&label)
            .cloned()
            .map(EvalStack::from_types);
        Ok(())
    }

    /// Append one instruction, checking its effect on the evaluation stack
    ///
    /// Instructions emitted in unreachable code (right after an unconditional terminator, with
    /// no label in between) are recorded but not checked.
    pub fn push_instruction(
        &mut self,
        insn: Instruction<ExternalRef<'g>>,
    ) -> Result<(), Error> {
        for target in insn.jump_targets() {
            self.referenced.insert(target);
        }

        if let Some(live) = self.stack.as_mut() {
            let cx = MutateCx {
                method: &self.method,
                this_type: self.this_type.as_ref(),
                locals: &self.locals,
                system: self.system,
                strictness: self.strictness,
            };
            mutate(live, &insn, &cx).map_err(|kind| Error::Verifier {
                instruction: insn.to_string(),
                listing: self.code.render_listing(),
                kind,
            })?;

            let after = live.types().to_vec();
            for target in insn.jump_targets() {
                merge_into(&mut self.shapes, target, &after, &cx, &|| {
                    self.code.render_listing()
                })?;
            }

            if insn.is_unconditional_terminator() {
                self.stack = None;
            }
        }

        self.code.push(insn);
        Ok(())
    }

    /// Open a protected region at the current position
    pub fn begin_try(&mut self) -> Result<(), Error> {
        let try_start = self.fresh_label();
        self.mark_label(try_start)?;
        self.regions.push(RegionFrame {
            try_start,
            try_end: None,
            pending: None,
            closed: vec![],
        });
        Ok(())
    }

    /// Close the previous handler (or the try block) and mark the boundary label
    fn handler_boundary(&mut self) -> Result<Label, Error> {
        // Handlers cannot be entered by falling through from the code above them
        if self.stack.is_some() {
            return Err(Error::Verifier {
                instruction: "begin handler".to_string(),
                listing: self.code.render_listing(),
                kind: VerifierErrorKind::BadOperand(
                    "cannot fall through into an exception handler",
                ),
            });
        }

        let boundary = self.fresh_label();
        self.mark_label(boundary)?;

        let frame = self
            .regions
            .last_mut()
            .ok_or(Error::MalformedRegion("no open exception region"))?;
        if frame.try_end.is_none() {
            frame.try_end = Some(boundary);
        }

        if let Some(pending) = frame.pending.take() {
            let (kind, handler_start) = match pending {
                PendingHandler::Catch {
                    catch_type,
                    handler_start,
                } => (
                    HandlerKind::Catch(ExternalRef::Type(catch_type)),
                    handler_start,
                ),
                PendingHandler::Filter {
                    filter_start,
                    handler_start,
                } => (HandlerKind::Filter { filter_start }, handler_start),
                PendingHandler::Finally { handler_start } => {
                    (HandlerKind::Finally, handler_start)
                }
                PendingHandler::Fault { handler_start } => (HandlerKind::Fault, handler_start),
                PendingHandler::FilterCondition { .. } => {
                    return Err(Error::MalformedRegion("filter has no handler body"))
                }
            };
            let try_end = frame.try_end.expect("try_end was just set");
            frame.closed.push(ExceptionHandler {
                kind,
                try_start: frame.try_start,
                try_end,
                handler_start,
                handler_end: boundary,
            });
        }

        Ok(boundary)
    }

    /// Start a catch handler for exceptions assignable to `catch_type`
    pub fn begin_catch(&mut self, catch_type: CilType<'g>) -> Result<(), Error> {
        if catch_type.category() != StackCategory::Object {
            return Err(Error::Verifier {
                instruction: "begin catch".to_string(),
                listing: self.code.render_listing(),
                kind: VerifierErrorKind::BadOperand("catch type must be a reference type"),
            });
        }

        let handler_start = self.handler_boundary()?;
        self.stack = Some(EvalStack::from_types(vec![EsType::of(&catch_type)]));
        let frame = self.regions.last_mut().expect("checked by handler_boundary");
        frame.pending = Some(PendingHandler::Catch {
            catch_type,
            handler_start,
        });
        Ok(())
    }

    /// Start the condition code of a filter handler (must end in `endfilter`)
    pub fn begin_filter(&mut self) -> Result<(), Error> {
        let filter_start = self.handler_boundary()?;
        self.stack = Some(EvalStack::from_types(vec![EsType::Simple(
            CilType::Object(self.system.object),
        )]));
        let frame = self.regions.last_mut().expect("checked by handler_boundary");
        frame.pending = Some(PendingHandler::FilterCondition { filter_start });
        Ok(())
    }

    /// Start the handler body of the filter opened by [`BodyBuilder::begin_filter`]
    pub fn begin_filter_handler(&mut self) -> Result<(), Error> {
        if self.stack.is_some() {
            return Err(Error::Verifier {
                instruction: "begin filter handler".to_string(),
                listing: self.code.render_listing(),
                kind: VerifierErrorKind::BadOperand(
                    "filter condition must end in endfilter",
                ),
            });
        }

        let frame = self
            .regions
            .last_mut()
            .ok_or(Error::MalformedRegion("no open exception region"))?;
        let filter_start = match frame.pending.take() {
            Some(PendingHandler::FilterCondition { filter_start }) => filter_start,
            other => {
                frame.pending = other;
                return Err(Error::MalformedRegion("no filter condition to attach to"));
            }
        };

        let handler_start = self.fresh_label();
        self.mark_label(handler_start)?;
        self.stack = Some(EvalStack::from_types(vec![EsType::Simple(
            CilType::Object(self.system.object),
        )]));
        let frame = self.regions.last_mut().expect("region checked above");
        frame.pending = Some(PendingHandler::Filter {
            filter_start,
            handler_start,
        });
        Ok(())
    }

    /// Start a finally handler (runs on every exit from the protected region)
    pub fn begin_finally(&mut self) -> Result<(), Error> {
        let handler_start = self.handler_boundary()?;
        self.stack = Some(EvalStack::new());
        let frame = self.regions.last_mut().expect("checked by handler_boundary");
        frame.pending = Some(PendingHandler::Finally { handler_start });
        Ok(())
    }

    /// Start a fault handler (runs only on exceptional exit)
    pub fn begin_fault(&mut self) -> Result<(), Error> {
        let handler_start = self.handler_boundary()?;
        self.stack = Some(EvalStack::new());
        let frame = self.regions.last_mut().expect("checked by handler_boundary");
        frame.pending = Some(PendingHandler::Fault { handler_start });
        Ok(())
    }

    /// Close the innermost protected region
    pub fn end_region(&mut self) -> Result<(), Error> {
        match self.regions.last() {
            None => return Err(Error::MalformedRegion("no open exception region")),
            Some(frame) if frame.pending.is_none() && frame.closed.is_empty() => {
                return Err(Error::MalformedRegion("try block has no handler"))
            }
            Some(frame) if frame.pending.is_none() => {
                return Err(Error::MalformedRegion("handler already closed"))
            }
            Some(_) => {}
        }

        self.handler_boundary()?;
        let frame = self.regions.pop().expect("checked above");
        self.handlers.extend(frame.closed);
        Ok(())
    }

    /// Finish the body: check terminators and label completeness, settle all label shapes, and
    /// compute the header max-stack
    pub fn seal(self) -> Result<BuiltBody<'g>, Error> {
        if !self.regions.is_empty() {
            return Err(Error::MalformedRegion("region still open at seal time"));
        }

        match self.code.last() {
            Some(last) if last.is_unconditional_terminator() => {}
            _ => return Err(Error::MissingTerminator),
        }

        let mut unmarked: Vec<Label> = self
            .referenced
            .iter()
            .filter(|label| self.code.index_of_label(**label).is_none())
            .copied()
            .collect();
        if !unmarked.is_empty() {
            unmarked.sort();
            return Err(Error::UnmarkedLabels(unmarked));
        }

        // Settle label shapes by fixed point; emission-time snapshots were only optimistic
        let cx = MutateCx {
            method: &self.method,
            this_type: self.this_type.as_ref(),
            locals: &self.locals,
            system: self.system,
            strictness: self.strictness,
        };
        verify_body(&self.code, &self.handlers, &cx)?;

        let max_stack = compute_max_stack(&self.code, &self.handlers);

        Ok(MethodBody {
            code: self.code,
            handlers: self.handlers,
            locals: self.locals,
            init_locals: self.init_locals,
            max_stack,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cil::opcode::{BinaryOp, Comparison};
    use crate::cil::type_graph::{TypeData, TypeGraph, TypeGraphArenas};
    use Instruction::*;

    fn int_add_sig<'g>() -> MethodSig<'g> {
        MethodSig::static_method(vec![CilType::I4, CilType::I4], Some(CilType::I4))
    }

    #[test]
    fn straight_line_arithmetic_seals() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();

        let mut builder =
            BodyBuilder::new(&system, int_add_sig(), None, StrictnessLevel::Full);
        builder.push_instruction(LdArg(0)).unwrap();
        builder.push_instruction(LdArg(1)).unwrap();
        builder.push_instruction(Binary(BinaryOp::Add)).unwrap();
        assert_eq!(
            builder.current_stack().unwrap(),
            &[EsType::Simple(CilType::I4)]
        );
        builder.push_instruction(Ret).unwrap();

        let body = builder.seal().unwrap();
        assert_eq!(body.max_stack, 2);
        assert_eq!(body.code.len(), 4);
    }

    #[test]
    fn underflow_is_detected_immediately() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();

        let mut builder = BodyBuilder::new(
            &system,
            MethodSig::static_method(vec![], None),
            None,
            StrictnessLevel::Full,
        );
        let err = builder
            .push_instruction(Binary(BinaryOp::Add))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Verifier {
                kind: VerifierErrorKind::StackUnderflow,
                ..
            }
        ));
    }

    #[test]
    fn underflow_even_without_type_checking() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();

        let mut builder = BodyBuilder::new(
            &system,
            MethodSig::static_method(vec![], None),
            None,
            StrictnessLevel::None,
        );
        let err = builder.push_instruction(Pop).unwrap_err();
        assert!(matches!(
            err,
            Error::Verifier {
                kind: VerifierErrorKind::StackUnderflow,
                ..
            }
        ));
    }

    #[test]
    fn inconsistent_branch_types_are_rejected() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();

        // One path pushes an int32 before jumping to the join, the other pushes a float
        let mut builder = BodyBuilder::new(
            &system,
            MethodSig::static_method(vec![CilType::I4], Some(CilType::I4)),
            None,
            StrictnessLevel::Full,
        );
        let join = builder.fresh_label();
        let other = builder.fresh_label();

        builder.push_instruction(LdArg(0)).unwrap();
        builder.push_instruction(BrTrue(other)).unwrap();
        builder.push_instruction(LdcI4(1)).unwrap();
        builder.push_instruction(Br(join)).unwrap();
        builder.mark_label(other).unwrap();
        builder.push_instruction(LdcR4(1.0)).unwrap();
        let err = builder.push_instruction(Br(join)).unwrap_err();
        assert!(matches!(err, Error::InconsistentMerge { .. }));
    }

    #[test]
    fn object_paths_merge_to_complex() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();

        let x = graph.add_type(TypeData::interface("IX"));
        let y = graph.add_type(TypeData::interface("IY"));
        let z = graph.add_type(TypeData::interface("IZ"));
        let first = graph.add_type(TypeData::class("First", system.object));
        first.implement(x);
        first.implement(y);
        let second = graph.add_type(TypeData::class("Second", system.object));
        second.implement(x);
        second.implement(z);

        let first_ctor = graph.add_method(crate::cil::type_graph::MethodData {
            owner: first,
            name: crate::cil::type_graph::MethodData::CTOR.to_string(),
            signature: MethodSig::instance_method(vec![], None),
        });
        let second_ctor = graph.add_method(crate::cil::type_graph::MethodData {
            owner: second,
            name: crate::cil::type_graph::MethodData::CTOR.to_string(),
            signature: MethodSig::instance_method(vec![], None),
        });

        let mut builder = BodyBuilder::new(
            &system,
            MethodSig::static_method(vec![CilType::I4], None),
            None,
            StrictnessLevel::Full,
        );
        let join = builder.fresh_label();
        let other = builder.fresh_label();

        builder.push_instruction(LdArg(0)).unwrap();
        builder.push_instruction(BrTrue(other)).unwrap();
        builder
            .push_instruction(NewObj(ExternalRef::Method(first_ctor)))
            .unwrap();
        builder.push_instruction(Br(join)).unwrap();
        builder.mark_label(other).unwrap();
        builder
            .push_instruction(NewObj(ExternalRef::Method(second_ctor)))
            .unwrap();
        builder.push_instruction(Br(join)).unwrap();
        builder.mark_label(join).unwrap();

        // The merged shape keeps the one shared interface over the common base
        assert_eq!(
            builder.current_stack().unwrap(),
            &[EsType::Complex {
                base: system.object,
                interfaces: vec![x],
            }]
        );

        builder.push_instruction(Pop).unwrap();
        builder.push_instruction(Ret).unwrap();
        builder.seal().unwrap();
    }

    #[test]
    fn merge_order_does_not_matter() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();

        let animal = graph.add_type(TypeData::class("Animal", system.object));
        let cat = graph.add_type(TypeData::class("Cat", animal));
        let dog = graph.add_type(TypeData::class("Dog", animal));
        let cat_ctor = graph.add_method(crate::cil::type_graph::MethodData {
            owner: cat,
            name: crate::cil::type_graph::MethodData::CTOR.to_string(),
            signature: MethodSig::instance_method(vec![], None),
        });
        let dog_ctor = graph.add_method(crate::cil::type_graph::MethodData {
            owner: dog,
            name: crate::cil::type_graph::MethodData::CTOR.to_string(),
            signature: MethodSig::instance_method(vec![], None),
        });

        let shape_with = |first_ctor, second_ctor| {
            let mut builder = BodyBuilder::new(
                &system,
                MethodSig::static_method(vec![CilType::I4], None),
                None,
                StrictnessLevel::Full,
            );
            let join = builder.fresh_label();
            let other = builder.fresh_label();
            builder.push_instruction(LdArg(0)).unwrap();
            builder.push_instruction(BrTrue(other)).unwrap();
            builder
                .push_instruction(NewObj(ExternalRef::Method(first_ctor)))
                .unwrap();
            builder.push_instruction(Br(join)).unwrap();
            builder.mark_label(other).unwrap();
            builder
                .push_instruction(NewObj(ExternalRef::Method(second_ctor)))
                .unwrap();
            builder.push_instruction(Br(join)).unwrap();
            builder.mark_label(join).unwrap();
            builder.current_stack().unwrap().to_vec()
        };

        assert_eq!(shape_with(cat_ctor, dog_ctor), shape_with(dog_ctor, cat_ctor));
        assert_eq!(
            shape_with(cat_ctor, dog_ctor),
            vec![EsType::Simple(CilType::Object(animal))]
        );
    }

    #[test]
    fn seal_requires_terminator() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();

        let mut builder = BodyBuilder::new(
            &system,
            MethodSig::static_method(vec![], None),
            None,
            StrictnessLevel::Full,
        );
        builder.push_instruction(Nop).unwrap();
        assert!(matches!(builder.seal(), Err(Error::MissingTerminator)));
    }

    #[test]
    fn seal_requires_marked_labels() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();

        let mut builder = BodyBuilder::new(
            &system,
            MethodSig::static_method(vec![], None),
            None,
            StrictnessLevel::Full,
        );
        let nowhere = builder.fresh_label();
        builder.push_instruction(Br(nowhere)).unwrap();
        assert!(matches!(
            builder.seal(),
            Err(Error::UnmarkedLabels(labels)) if labels == vec![nowhere]
        ));
    }

    #[test]
    fn marking_twice_is_rejected() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();

        let mut builder = BodyBuilder::new(
            &system,
            MethodSig::static_method(vec![], None),
            None,
            StrictnessLevel::Full,
        );
        let label = builder.fresh_label();
        builder.mark_label(label).unwrap();
        builder.push_instruction(Nop).unwrap();
        assert!(matches!(
            builder.mark_label(label),
            Err(Error::DuplicateMark(_))
        ));
    }

    #[test]
    fn try_catch_finally_builds() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();

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
        builder.begin_finally().unwrap();
        builder.push_instruction(EndFinally).unwrap();
        builder.end_region().unwrap();
        builder.mark_label(done).unwrap();
        builder.push_instruction(Ret).unwrap();

        let body = builder.seal().unwrap();
        assert_eq!(body.handlers.len(), 2);
        assert!(matches!(body.handlers[0].kind, HandlerKind::Catch(_)));
        assert!(matches!(body.handlers[1].kind, HandlerKind::Finally));
        // The caught exception is live at the catch entry
        assert_eq!(body.max_stack, 1);
    }

    #[test]
    fn conditional_branch_comparison() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();

        let mut builder = BodyBuilder::new(
            &system,
            MethodSig::static_method(vec![CilType::I4, CilType::I4], Some(CilType::I4)),
            None,
            StrictnessLevel::Full,
        );
        let bigger = builder.fresh_label();

        builder.push_instruction(LdArg(0)).unwrap();
        builder.push_instruction(LdArg(1)).unwrap();
        builder
            .push_instruction(BrCmp(Comparison::Gt, bigger))
            .unwrap();
        builder.push_instruction(LdArg(1)).unwrap();
        builder.push_instruction(Ret).unwrap();
        builder.mark_label(bigger).unwrap();
        builder.push_instruction(LdArg(0)).unwrap();
        builder.push_instruction(Ret).unwrap();

        let body = builder.seal().unwrap();
        assert_eq!(body.max_stack, 2);
    }
}
