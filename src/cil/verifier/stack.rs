//! The evaluation stack and the per-instruction typing rules
//!
//! [`mutate`] is the heart of the verifier: one rule per instruction family describing which
//! operand types the instruction pops (checking assignability as it goes) and what it pushes.
//! [`verify_body`] runs those rules over a whole instruction stream, merging stack shapes at
//! labels until they stabilize.
//!
//! Shapes are settled by fixed-point iteration rather than by mutating already-processed
//! instructions in place: the walk is repeated from the top with the latest label shapes until
//! nothing changes. Each merge only moves a shape towards a more general type, so the iteration
//! terminates; it also makes the merged result independent of the order in which paths reach a
//! label.

use super::types::{category_compatible, merge_types, EsType, MergeConflict, StrictnessLevel};
use crate::cil::errors::{Error, VerifierErrorKind};
use crate::cil::exception::{ExceptionHandler, HandlerKind};
use crate::cil::instruction::{CodeStream, Instruction, Label};
use crate::cil::opcode::{BinaryOp, ConvKind, LoadKind, StoreKind};
use crate::cil::signature::{CilType, MethodSig, StackCategory};
use crate::cil::tokens::ExternalRef;
use crate::cil::type_graph::{Assignable, FieldId, MethodId, SystemTypes};
use std::collections::HashMap;

/// The abstract operand stack, top of stack last
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvalStack<'g> {
    types: Vec<EsType<'g>>,
}

impl<'g> EvalStack<'g> {
    pub fn new() -> EvalStack<'g> {
        EvalStack { types: vec![] }
    }

    pub fn from_types(types: Vec<EsType<'g>>) -> EvalStack<'g> {
        EvalStack { types }
    }

    pub fn depth(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn types(&self) -> &[EsType<'g>] {
        &self.types
    }

    pub fn into_types(self) -> Vec<EsType<'g>> {
        self.types
    }

    pub fn push(&mut self, ty: EsType<'g>) {
        self.types.push(ty);
    }

    pub fn pop(&mut self) -> Result<EsType<'g>, VerifierErrorKind> {
        self.types.pop().ok_or(VerifierErrorKind::StackUnderflow)
    }

    pub fn peek(&self) -> Result<&EsType<'g>, VerifierErrorKind> {
        self.types.last().ok_or(VerifierErrorKind::StackUnderflow)
    }

    pub fn clear(&mut self) {
        self.types.clear();
    }
}

impl<'g> Default for EvalStack<'g> {
    fn default() -> Self {
        EvalStack::new()
    }
}

/// Everything the per-instruction rules need to know about their surroundings
pub struct MutateCx<'a, 'g> {
    /// Signature of the method being built or checked
    pub method: &'a MethodSig<'g>,

    /// Declared type of `this` (argument 0) for instance methods
    pub this_type: Option<&'a CilType<'g>>,

    /// Declared local variable types
    pub locals: &'a [CilType<'g>],

    pub system: &'a SystemTypes<'g>,

    pub strictness: StrictnessLevel,
}

impl<'a, 'g> MutateCx<'a, 'g> {
    fn arg_type(&self, index: u16) -> Result<CilType<'g>, VerifierErrorKind> {
        let index = index as usize;
        if self.method.has_this {
            if index == 0 {
                return Ok(self
                    .this_type
                    .cloned()
                    .unwrap_or(CilType::Object(self.system.object)));
            }
            return self
                .method
                .params
                .get(index - 1)
                .cloned()
                .ok_or(VerifierErrorKind::InvalidVariable(index as u16));
        }
        self.method
            .params
            .get(index)
            .cloned()
            .ok_or(VerifierErrorKind::InvalidVariable(index as u16))
    }

    fn local_type(&self, index: u16) -> Result<CilType<'g>, VerifierErrorKind> {
        self.locals
            .get(index as usize)
            .map(|ty| ty.unpinned().clone())
            .ok_or(VerifierErrorKind::InvalidVariable(index))
    }
}

const INT_CATEGORIES: &[StackCategory] = &[
    StackCategory::Int32,
    StackCategory::Int64,
    StackCategory::NativeInt,
];

const INDEX_CATEGORIES: &[StackCategory] = &[StackCategory::Int32, StackCategory::NativeInt];

fn pop_category<'g>(
    stack: &mut EvalStack<'g>,
    cx: &MutateCx<'_, 'g>,
    want: &[StackCategory],
    expected: &str,
) -> Result<EsType<'g>, VerifierErrorKind> {
    let found = stack.pop()?;
    if cx.strictness == StrictnessLevel::None {
        return Ok(found);
    }
    let found_category = found.category();
    if want
        .iter()
        .any(|w| category_compatible(cx.strictness, found_category, *w))
    {
        Ok(found)
    } else {
        Err(VerifierErrorKind::TypeMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        })
    }
}

fn pop_assignable<'g>(
    stack: &mut EvalStack<'g>,
    cx: &MutateCx<'_, 'g>,
    target: &CilType<'g>,
) -> Result<EsType<'g>, VerifierErrorKind> {
    let found = stack.pop()?;
    if found.is_assignable_to(target, cx.strictness, cx.system) {
        Ok(found)
    } else {
        Err(VerifierErrorKind::TypeMismatch {
            expected: target.to_string(),
            found: found.to_string(),
        })
    }
}

fn method_ref<'g>(external: &ExternalRef<'g>) -> Result<MethodId<'g>, VerifierErrorKind> {
    match external {
        ExternalRef::Method(method) => Ok(*method),
        _ => Err(VerifierErrorKind::BadOperand("method reference expected")),
    }
}

fn field_ref<'g>(external: &ExternalRef<'g>) -> Result<FieldId<'g>, VerifierErrorKind> {
    match external {
        ExternalRef::Field(field) => Ok(*field),
        _ => Err(VerifierErrorKind::BadOperand("field reference expected")),
    }
}

fn type_ref<'g>(external: &ExternalRef<'g>) -> Result<CilType<'g>, VerifierErrorKind> {
    match external {
        ExternalRef::Type(ty) => Ok(ty.clone()),
        _ => Err(VerifierErrorKind::BadOperand("type reference expected")),
    }
}

/// Combine the categories of two integer operands of a binary operation
fn merge_int_categories(a: StackCategory, b: StackCategory) -> Option<StackCategory> {
    let widen = |cat| {
        if cat == StackCategory::Zero {
            StackCategory::Int32
        } else {
            cat
        }
    };
    match (widen(a), widen(b)) {
        (StackCategory::Int32, StackCategory::Int32) => Some(StackCategory::Int32),
        (StackCategory::Int32, StackCategory::NativeInt)
        | (StackCategory::NativeInt, StackCategory::Int32)
        | (StackCategory::NativeInt, StackCategory::NativeInt) => Some(StackCategory::NativeInt),
        (StackCategory::Int64, StackCategory::Int64) => Some(StackCategory::Int64),
        _ => None,
    }
}

fn canonical_int<'g>(category: StackCategory) -> EsType<'g> {
    match category {
        StackCategory::Int64 => EsType::Simple(CilType::I8),
        StackCategory::NativeInt => EsType::Simple(CilType::I),
        _ => EsType::Simple(CilType::I4),
    }
}

fn binary<'g>(
    stack: &mut EvalStack<'g>,
    cx: &MutateCx<'_, 'g>,
    op: BinaryOp,
) -> Result<(), VerifierErrorKind> {
    if op.is_shift() {
        pop_category(stack, cx, INDEX_CATEGORIES, "shift count")?;
        let value = pop_category(stack, cx, INT_CATEGORIES, "integer")?;
        stack.push(if cx.strictness == StrictnessLevel::None {
            value
        } else {
            canonical_int(value.category())
        });
        return Ok(());
    }

    let right = stack.pop()?;
    let left = stack.pop()?;
    if cx.strictness == StrictnessLevel::None {
        stack.push(left);
        return Ok(());
    }

    let not_comparable = |left: &EsType<'g>, right: &EsType<'g>| VerifierErrorKind::NotComparable {
        left: left.to_string(),
        right: right.to_string(),
    };

    if op.is_integer_only() {
        let result = merge_int_categories(left.category(), right.category())
            .ok_or_else(|| not_comparable(&left, &right))?;
        stack.push(canonical_int(result));
        return Ok(());
    }

    match (left.category(), right.category()) {
        (StackCategory::Float, StackCategory::Float) => {
            let both_single = left == EsType::Simple(CilType::R4) && right == left;
            stack.push(EsType::Simple(if both_single {
                CilType::R4
            } else {
                CilType::R8
            }));
            Ok(())
        }

        // Managed pointer arithmetic: pointer +/- integer keeps the pointer type
        (StackCategory::Pointer, StackCategory::Int32)
        | (StackCategory::Pointer, StackCategory::NativeInt)
            if matches!(op, BinaryOp::Add | BinaryOp::Sub) =>
        {
            stack.push(left);
            Ok(())
        }
        (StackCategory::Int32, StackCategory::Pointer)
        | (StackCategory::NativeInt, StackCategory::Pointer)
            if op == BinaryOp::Add =>
        {
            stack.push(right);
            Ok(())
        }

        (a, b) => {
            let result =
                merge_int_categories(a, b).ok_or_else(|| not_comparable(&left, &right))?;
            stack.push(canonical_int(result));
            Ok(())
        }
    }
}

/// Are two operands comparable (for `ceq`-family instructions and comparison branches)?
fn pop_comparable_pair<'g>(
    stack: &mut EvalStack<'g>,
    cx: &MutateCx<'_, 'g>,
) -> Result<(), VerifierErrorKind> {
    let right = stack.pop()?;
    let left = stack.pop()?;
    if cx.strictness == StrictnessLevel::None {
        return Ok(());
    }

    let comparable = match (left.category(), right.category()) {
        (a, b) if a == b && a != StackCategory::Struct => true,
        (StackCategory::Zero, b) => b != StackCategory::Struct,
        (a, StackCategory::Zero) => a != StackCategory::Struct,
        (StackCategory::Int32, StackCategory::NativeInt)
        | (StackCategory::NativeInt, StackCategory::Int32) => true,
        (StackCategory::Pointer, StackCategory::NativeInt)
        | (StackCategory::NativeInt, StackCategory::Pointer) => {
            cx.strictness == StrictnessLevel::LowLevel
        }
        _ => false,
    };

    if comparable {
        Ok(())
    } else {
        Err(VerifierErrorKind::NotComparable {
            left: left.to_string(),
            right: right.to_string(),
        })
    }
}

fn load_kind_category(kind: LoadKind) -> StackCategory {
    match kind {
        LoadKind::I1
        | LoadKind::U1
        | LoadKind::I2
        | LoadKind::U2
        | LoadKind::I4
        | LoadKind::U4 => StackCategory::Int32,
        LoadKind::I8 => StackCategory::Int64,
        LoadKind::I => StackCategory::NativeInt,
        LoadKind::R4 | LoadKind::R8 => StackCategory::Float,
        LoadKind::Ref => StackCategory::Object,
    }
}

fn store_kind_category(kind: StoreKind) -> StackCategory {
    match kind {
        StoreKind::I1 | StoreKind::I2 | StoreKind::I4 => StackCategory::Int32,
        StoreKind::I8 => StackCategory::Int64,
        StoreKind::I => StackCategory::NativeInt,
        StoreKind::R4 | StoreKind::R8 => StackCategory::Float,
        StoreKind::Ref => StackCategory::Object,
    }
}

fn load_kind_result<'g>(
    kind: LoadKind,
    pointee: Option<&CilType<'g>>,
    system: &SystemTypes<'g>,
) -> EsType<'g> {
    match kind {
        LoadKind::I1 | LoadKind::U1 | LoadKind::I2 | LoadKind::U2 | LoadKind::I4 | LoadKind::U4 => {
            EsType::Simple(CilType::I4)
        }
        LoadKind::I8 => EsType::Simple(CilType::I8),
        LoadKind::I => EsType::Simple(CilType::I),
        LoadKind::R4 => EsType::Simple(CilType::R4),
        LoadKind::R8 => EsType::Simple(CilType::R8),
        LoadKind::Ref => match pointee {
            Some(ty) if ty.category() == StackCategory::Object => EsType::of(ty),
            _ => EsType::Simple(CilType::Object(system.object)),
        },
    }
}

/// Pop a dereferenceable address, returning the pointee type when it is statically known
///
/// At full strictness the address must be a typed pointer whose pointee matches the expected
/// category; at lower levels a bare native int is fine.
fn pop_address<'g>(
    stack: &mut EvalStack<'g>,
    cx: &MutateCx<'_, 'g>,
    expected_pointee: Option<StackCategory>,
) -> Result<Option<CilType<'g>>, VerifierErrorKind> {
    let address = pop_category(
        stack,
        cx,
        &[StackCategory::Pointer, StackCategory::NativeInt],
        "address",
    )?;
    let pointee = match &address {
        EsType::Simple(CilType::ByRef(pointee)) | EsType::Simple(CilType::Ptr(pointee)) => {
            Some(pointee.as_ref().clone())
        }
        _ => None,
    };

    if cx.strictness == StrictnessLevel::Full {
        match (&pointee, expected_pointee) {
            (Some(pointee_ty), Some(expected)) => {
                if !category_compatible(cx.strictness, pointee_ty.category(), expected) {
                    return Err(VerifierErrorKind::TypeMismatch {
                        expected: format!("pointer to {}", expected),
                        found: address.to_string(),
                    });
                }
            }
            (None, _) => {
                return Err(VerifierErrorKind::TypeMismatch {
                    expected: "typed pointer".to_string(),
                    found: address.to_string(),
                });
            }
            (Some(_), None) => {}
        }
    }

    Ok(pointee)
}

/// Pop the instance a field access dereferences
fn pop_field_instance<'g>(
    stack: &mut EvalStack<'g>,
    cx: &MutateCx<'_, 'g>,
    field: FieldId<'g>,
) -> Result<(), VerifierErrorKind> {
    let instance = pop_category(
        stack,
        cx,
        &[
            StackCategory::Object,
            StackCategory::Pointer,
            StackCategory::NativeInt,
            StackCategory::Struct,
        ],
        "field instance",
    )?;

    if cx.strictness == StrictnessLevel::Full
        && instance.category() == StackCategory::Object
        && !field.owner.is_value_type()
        && !instance.is_assignable_to(
            &CilType::Object(field.owner),
            cx.strictness,
            cx.system,
        )
    {
        return Err(VerifierErrorKind::TypeMismatch {
            expected: CilType::Object(field.owner).to_string(),
            found: instance.to_string(),
        });
    }
    Ok(())
}

/// Pop arguments (and `this`, if applicable) for a call-shaped instruction, push its result
fn call_like<'g>(
    stack: &mut EvalStack<'g>,
    cx: &MutateCx<'_, 'g>,
    sig: &MethodSig<'g>,
    owner: Option<MethodId<'g>>,
) -> Result<(), VerifierErrorKind> {
    for param in sig.params.iter().rev() {
        pop_assignable(stack, cx, param)?;
    }

    if sig.has_this {
        let this = pop_category(
            stack,
            cx,
            &[
                StackCategory::Object,
                StackCategory::Pointer,
                StackCategory::NativeInt,
            ],
            "this",
        )?;
        if cx.strictness == StrictnessLevel::Full {
            if let Some(method) = owner {
                if this.category() == StackCategory::Object
                    && !method.owner.is_value_type()
                    && !this.is_assignable_to(
                        &CilType::Object(method.owner),
                        cx.strictness,
                        cx.system,
                    )
                {
                    return Err(VerifierErrorKind::TypeMismatch {
                        expected: CilType::Object(method.owner).to_string(),
                        found: this.to_string(),
                    });
                }
            }
        }
    }

    if let Some(ret) = &sig.ret {
        stack.push(EsType::of(ret));
    }
    Ok(())
}

/// Apply the effect of one instruction to the evaluation stack
///
/// Branch instructions only consume their condition operands here (and `leave`/`endfinally`
/// evacuate the stack); what happens at their targets is the caller's business.
pub fn mutate<'g>(
    stack: &mut EvalStack<'g>,
    insn: &Instruction<ExternalRef<'g>>,
    cx: &MutateCx<'_, 'g>,
) -> Result<(), VerifierErrorKind> {
    use Instruction::*;

    match insn {
        Nop | Break => {}

        LdArg(index) => {
            let ty = cx.arg_type(*index)?;
            stack.push(EsType::of(&ty));
        }
        LdArgA(index) => {
            let ty = cx.arg_type(*index)?;
            stack.push(EsType::Simple(CilType::ByRef(::std::boxed::Box::new(ty))));
        }
        StArg(index) => {
            let ty = cx.arg_type(*index)?;
            pop_assignable(stack, cx, &ty)?;
        }
        LdLoc(index) => {
            let ty = cx.local_type(*index)?;
            stack.push(EsType::of(&ty));
        }
        LdLocA(index) => {
            let ty = cx.local_type(*index)?;
            stack.push(EsType::Simple(CilType::ByRef(::std::boxed::Box::new(ty))));
        }
        StLoc(index) => {
            let ty = cx.local_type(*index)?;
            pop_assignable(stack, cx, &ty)?;
        }

        LdNull => stack.push(EsType::Zero),
        LdcI4(_) => stack.push(EsType::Simple(CilType::I4)),
        LdcI8(_) => stack.push(EsType::Simple(CilType::I8)),
        LdcR4(_) => stack.push(EsType::Simple(CilType::R4)),
        LdcR8(_) => stack.push(EsType::Simple(CilType::R8)),
        LdStr(external) => match external {
            ExternalRef::Str(_) => {
                stack.push(EsType::Simple(CilType::Object(cx.system.string)))
            }
            _ => return Err(VerifierErrorKind::BadOperand("string literal expected")),
        },

        Dup => {
            let top = stack.peek()?.clone();
            stack.push(top);
        }
        Pop => {
            stack.pop()?;
        }

        Call(external) => {
            let method = method_ref(external)?;
            call_like(stack, cx, &method.signature, Some(method))?;
        }
        CallVirt(external) => {
            let method = method_ref(external)?;
            if !method.signature.has_this {
                return Err(VerifierErrorKind::BadOperand(
                    "callvirt requires an instance method",
                ));
            }
            call_like(stack, cx, &method.signature, Some(method))?;
        }
        CallI(external) => {
            let sig = match external {
                ExternalRef::StandaloneSig(sig) => sig.clone(),
                _ => {
                    return Err(VerifierErrorKind::BadOperand(
                        "standalone signature expected",
                    ))
                }
            };
            pop_category(
                stack,
                cx,
                &[StackCategory::NativeInt],
                "function pointer",
            )?;
            call_like(stack, cx, &sig, None)?;
        }
        NewObj(external) => {
            let method = method_ref(external)?;
            if !method.signature.has_this || !method.is_constructor() {
                return Err(VerifierErrorKind::BadOperand("newobj needs a constructor"));
            }
            for param in method.signature.params.iter().rev() {
                pop_assignable(stack, cx, param)?;
            }
            stack.push(if method.owner.is_value_type() {
                EsType::Simple(CilType::ValueType(method.owner))
            } else {
                EsType::Simple(CilType::Object(method.owner))
            });
        }
        LdFtn(external) => {
            method_ref(external)?;
            stack.push(EsType::Simple(CilType::I));
        }
        LdVirtFtn(external) => {
            method_ref(external)?;
            pop_category(stack, cx, &[StackCategory::Object], "object")?;
            stack.push(EsType::Simple(CilType::I));
        }

        Ret => {
            if let Some(ret) = &cx.method.ret {
                pop_assignable(stack, cx, ret)?;
            }
            if !stack.is_empty() {
                return Err(VerifierErrorKind::StackNotEmpty(stack.depth()));
            }
        }
        Jmp(external) => {
            method_ref(external)?;
            if !stack.is_empty() {
                return Err(VerifierErrorKind::StackNotEmpty(stack.depth()));
            }
        }

        Br(_) => {}
        BrFalse(_) | BrTrue(_) => {
            pop_category(
                stack,
                cx,
                &[
                    StackCategory::Int32,
                    StackCategory::Int64,
                    StackCategory::NativeInt,
                    StackCategory::Object,
                    StackCategory::Pointer,
                ],
                "condition",
            )?;
        }
        BrCmp(_, _) => pop_comparable_pair(stack, cx)?,
        Switch(_) => {
            pop_category(stack, cx, INDEX_CATEGORIES, "switch selector")?;
        }
        Leave(_) => stack.clear(),

        LdInd(kind) => {
            let pointee = pop_address(stack, cx, Some(load_kind_category(*kind)))?;
            stack.push(load_kind_result(*kind, pointee.as_ref(), cx.system));
        }
        StInd(kind) => {
            let value = stack.pop()?;
            if cx.strictness != StrictnessLevel::None
                && !category_compatible(cx.strictness, value.category(), store_kind_category(*kind))
            {
                return Err(VerifierErrorKind::TypeMismatch {
                    expected: store_kind_category(*kind).to_string(),
                    found: value.to_string(),
                });
            }
            pop_address(stack, cx, Some(store_kind_category(*kind)))?;
        }

        Binary(op) => binary(stack, cx, *op)?,
        Unary(_) => {
            let value = pop_category(
                stack,
                cx,
                &[
                    StackCategory::Int32,
                    StackCategory::Int64,
                    StackCategory::NativeInt,
                    StackCategory::Float,
                ],
                "numeric value",
            )?;
            stack.push(if cx.strictness == StrictnessLevel::None {
                value
            } else {
                match value.category() {
                    StackCategory::Float => value,
                    other => canonical_int(other),
                }
            });
        }
        Conv(kind) => {
            pop_category(
                stack,
                cx,
                &[
                    StackCategory::Int32,
                    StackCategory::Int64,
                    StackCategory::NativeInt,
                    StackCategory::Float,
                ],
                "numeric value",
            )?;
            stack.push(EsType::Simple(match kind {
                ConvKind::I1
                | ConvKind::I2
                | ConvKind::I4
                | ConvKind::U1
                | ConvKind::U2
                | ConvKind::U4 => CilType::I4,
                ConvKind::I8 | ConvKind::U8 => CilType::I8,
                ConvKind::I => CilType::I,
                ConvKind::U => CilType::U,
                ConvKind::R4 => CilType::R4,
                ConvKind::R8 | ConvKind::RUn => CilType::R8,
            }));
        }
        Cmp(_) => {
            pop_comparable_pair(stack, cx)?;
            stack.push(EsType::Simple(CilType::I4));
        }

        LdFld(external) => {
            let field = field_ref(external)?;
            if field.is_static {
                return Err(VerifierErrorKind::BadOperand("ldfld needs an instance field"));
            }
            pop_field_instance(stack, cx, field)?;
            stack.push(EsType::of(&field.ty));
        }
        LdFldA(external) => {
            let field = field_ref(external)?;
            if field.is_static {
                return Err(VerifierErrorKind::BadOperand("ldflda needs an instance field"));
            }
            pop_field_instance(stack, cx, field)?;
            stack.push(EsType::Simple(CilType::ByRef(::std::boxed::Box::new(field.ty.clone()))));
        }
        StFld(external) => {
            let field = field_ref(external)?;
            if field.is_static {
                return Err(VerifierErrorKind::BadOperand("stfld needs an instance field"));
            }
            pop_assignable(stack, cx, &field.ty)?;
            pop_field_instance(stack, cx, field)?;
        }
        LdsFld(external) => {
            let field = field_ref(external)?;
            if !field.is_static {
                return Err(VerifierErrorKind::BadOperand("ldsfld needs a static field"));
            }
            stack.push(EsType::of(&field.ty));
        }
        LdsFldA(external) => {
            let field = field_ref(external)?;
            if !field.is_static {
                return Err(VerifierErrorKind::BadOperand("ldsflda needs a static field"));
            }
            stack.push(EsType::Simple(CilType::ByRef(::std::boxed::Box::new(field.ty.clone()))));
        }
        StsFld(external) => {
            let field = field_ref(external)?;
            if !field.is_static {
                return Err(VerifierErrorKind::BadOperand("stsfld needs a static field"));
            }
            pop_assignable(stack, cx, &field.ty)?;
        }

        CastClass(external) | IsInst(external) => {
            let target = type_ref(external)?;
            if target.category() != StackCategory::Object {
                return Err(VerifierErrorKind::BadOperand("reference type expected"));
            }
            pop_category(stack, cx, &[StackCategory::Object], "object")?;
            stack.push(EsType::of(&target));
        }
        Box(external) => {
            let ty = type_ref(external)?;
            pop_assignable(stack, cx, &ty)?;
            stack.push(match cx.system.box_of(&ty) {
                Some(boxed) => EsType::Simple(CilType::Object(boxed)),
                None => EsType::of(&ty),
            });
        }
        UnboxAny(external) => {
            let ty = type_ref(external)?;
            pop_category(stack, cx, &[StackCategory::Object], "object")?;
            stack.push(EsType::of(&ty));
        }
        InitObj(external) => {
            let ty = type_ref(external)?;
            let pointee = pop_address(stack, cx, None)?;
            if cx.strictness == StrictnessLevel::Full {
                match pointee {
                    Some(pointee_ty) if pointee_ty.unpinned() == ty.unpinned() => {}
                    Some(pointee_ty) => {
                        return Err(VerifierErrorKind::TypeMismatch {
                            expected: CilType::ByRef(::std::boxed::Box::new(ty)).to_string(),
                            found: pointee_ty.to_string(),
                        })
                    }
                    None => {}
                }
            }
        }
        LdToken(external) => {
            let handle = match external {
                ExternalRef::Type(_) => cx.system.type_handle,
                ExternalRef::Method(_) => cx.system.method_handle,
                ExternalRef::Field(_) => cx.system.field_handle,
                _ => {
                    return Err(VerifierErrorKind::BadOperand(
                        "type, method, or field reference expected",
                    ))
                }
            };
            stack.push(EsType::Simple(CilType::ValueType(handle)));
        }
        SizeOf(external) => {
            type_ref(external)?;
            stack.push(EsType::Simple(CilType::I4));
        }

        NewArr(external) => {
            let element = type_ref(external)?;
            pop_category(stack, cx, INDEX_CATEGORIES, "array length")?;
            stack.push(EsType::Simple(CilType::SzArray(::std::boxed::Box::new(element))));
        }
        LdLen => {
            let array = pop_category(stack, cx, &[StackCategory::Object], "array")?;
            if cx.strictness == StrictnessLevel::Full
                && !matches!(array, EsType::Simple(CilType::SzArray(_)) | EsType::Zero)
            {
                return Err(VerifierErrorKind::TypeMismatch {
                    expected: "array".to_string(),
                    found: array.to_string(),
                });
            }
            stack.push(EsType::Simple(CilType::U));
        }
        LdElemA(external) => {
            let element = type_ref(external)?;
            pop_category(stack, cx, INDEX_CATEGORIES, "array index")?;
            pop_array(stack, cx, Some(&element))?;
            stack.push(EsType::Simple(CilType::ByRef(::std::boxed::Box::new(element))));
        }
        LdElem(kind) => {
            pop_category(stack, cx, INDEX_CATEGORIES, "array index")?;
            let element = pop_array_of_category(stack, cx, load_kind_category(*kind))?;
            stack.push(load_kind_result(*kind, element.as_ref(), cx.system));
        }
        LdElemAny(external) => {
            let element = type_ref(external)?;
            pop_category(stack, cx, INDEX_CATEGORIES, "array index")?;
            pop_array(stack, cx, Some(&element))?;
            stack.push(EsType::of(&element));
        }
        StElem(kind) => {
            let value = stack.pop()?;
            if cx.strictness != StrictnessLevel::None
                && !category_compatible(cx.strictness, value.category(), store_kind_category(*kind))
            {
                return Err(VerifierErrorKind::TypeMismatch {
                    expected: store_kind_category(*kind).to_string(),
                    found: value.to_string(),
                });
            }
            pop_category(stack, cx, INDEX_CATEGORIES, "array index")?;
            pop_array_of_category(stack, cx, store_kind_category(*kind))?;
        }
        StElemAny(external) => {
            let element = type_ref(external)?;
            pop_assignable(stack, cx, &element)?;
            pop_category(stack, cx, INDEX_CATEGORIES, "array index")?;
            pop_array(stack, cx, Some(&element))?;
        }

        Throw => {
            pop_category(stack, cx, &[StackCategory::Object], "exception")?;
        }
        Rethrow => {}
        EndFinally => stack.clear(),
        EndFilter => {
            pop_category(stack, cx, &[StackCategory::Int32], "filter verdict")?;
            if !stack.is_empty() {
                return Err(VerifierErrorKind::StackNotEmpty(stack.depth()));
            }
        }
    }
    Ok(())
}

/// Pop an array reference, optionally checking its element against an expected type
fn pop_array<'g>(
    stack: &mut EvalStack<'g>,
    cx: &MutateCx<'_, 'g>,
    expected_element: Option<&CilType<'g>>,
) -> Result<Option<CilType<'g>>, VerifierErrorKind> {
    let array = pop_category(stack, cx, &[StackCategory::Object], "array")?;
    let element = match &array {
        EsType::Simple(CilType::SzArray(element)) => Some(element.as_ref().clone()),
        _ => None,
    };

    if cx.strictness == StrictnessLevel::Full {
        match (&array, &element, expected_element) {
            (EsType::Zero, _, _) => {}
            (_, Some(element_ty), Some(expected)) => {
                let compatible = element_ty == expected
                    || (element_ty.category() == StackCategory::Object
                        && expected.category() == StackCategory::Object
                        && (element_ty.is_assignable(expected)
                            || expected.is_assignable(element_ty)));
                if !compatible {
                    return Err(VerifierErrorKind::TypeMismatch {
                        expected: CilType::SzArray(Box::new(expected.clone())).to_string(),
                        found: array.to_string(),
                    });
                }
            }
            (_, Some(_), None) => {}
            (_, None, _) => {
                return Err(VerifierErrorKind::TypeMismatch {
                    expected: "array".to_string(),
                    found: array.to_string(),
                });
            }
        }
    }

    Ok(element)
}

fn pop_array_of_category<'g>(
    stack: &mut EvalStack<'g>,
    cx: &MutateCx<'_, 'g>,
    expected_category: StackCategory,
) -> Result<Option<CilType<'g>>, VerifierErrorKind> {
    let element = pop_array(stack, cx, None)?;
    if cx.strictness == StrictnessLevel::Full {
        if let Some(element_ty) = &element {
            if !category_compatible(cx.strictness, element_ty.category(), expected_category) {
                return Err(VerifierErrorKind::TypeMismatch {
                    expected: format!("array of {}", expected_category),
                    found: element_ty.to_string(),
                });
            }
        }
    }
    Ok(element)
}

fn render_shape(types: &[EsType]) -> String {
    let mut rendered = String::from("[");
    for (i, ty) in types.iter().enumerate() {
        if i > 0 {
            rendered.push_str(", ");
        }
        rendered.push_str(&ty.to_string());
    }
    rendered.push(']');
    rendered
}

/// Merge an incoming shape into a label's recorded shape; true when the record changed
pub(crate) fn merge_into<'g>(
    shapes: &mut HashMap<Label, Vec<EsType<'g>>>,
    label: Label,
    incoming: &[EsType<'g>],
    cx: &MutateCx<'_, 'g>,
    listing: &dyn Fn() -> String,
) -> Result<bool, Error> {
    let existing = match shapes.get(&label) {
        None => {
            shapes.insert(label, incoming.to_vec());
            return Ok(true);
        }
        Some(existing) => existing,
    };

    let merged = merge_shapes(existing, incoming, cx).map_err(|conflict| {
        log::error!(
            "cannot merge stack shapes at {:?}: {} vs {}",
            label,
            conflict.first,
            conflict.second
        );
        Error::InconsistentMerge {
            label,
            first: conflict.first,
            second: conflict.second,
            listing: listing(),
        }
    })?;

    if &merged != existing {
        shapes.insert(label, merged);
        Ok(true)
    } else {
        Ok(false)
    }
}

fn merge_shapes<'g>(
    first: &[EsType<'g>],
    second: &[EsType<'g>],
    cx: &MutateCx<'_, 'g>,
) -> Result<Vec<EsType<'g>>, MergeConflict> {
    if first.len() != second.len() {
        return Err(MergeConflict {
            first: render_shape(first),
            second: render_shape(second),
        });
    }
    first
        .iter()
        .zip(second.iter())
        .map(|(a, b)| merge_types(a, b, cx.strictness, cx.system))
        .collect()
}

/// Shapes of the evaluation stack at the handler entry points of a body
fn seed_handler_shapes<'g>(
    handlers: &[ExceptionHandler<ExternalRef<'g>>],
    cx: &MutateCx<'_, 'g>,
    listing: &dyn Fn() -> String,
) -> Result<HashMap<Label, Vec<EsType<'g>>>, Error> {
    let mut shapes: HashMap<Label, Vec<EsType<'g>>> = HashMap::new();
    for handler in handlers {
        match &handler.kind {
            // A catch body starts with the caught exception on the stack
            HandlerKind::Catch(external) => {
                let caught = match external {
                    ExternalRef::Type(ty) if ty.category() == StackCategory::Object => {
                        EsType::of(ty)
                    }
                    _ => {
                        return Err(Error::Verifier {
                            instruction: "catch".to_string(),
                            listing: listing(),
                            kind: VerifierErrorKind::BadOperand(
                                "catch type must be a reference type",
                            ),
                        })
                    }
                };
                shapes.insert(handler.handler_start, vec![caught]);
            }

            // Filter code and the filtered handler both start with the exception object
            HandlerKind::Filter { filter_start } => {
                let exception = vec![EsType::Simple(CilType::Object(cx.system.object))];
                shapes.insert(*filter_start, exception.clone());
                shapes.insert(handler.handler_start, exception);
            }

            // Finally and fault bodies start with an empty stack
            HandlerKind::Finally | HandlerKind::Fault => {
                shapes.insert(handler.handler_start, vec![]);
            }
        }
    }
    Ok(shapes)
}

/// Verify a whole instruction stream, settling the per-label stack shapes by fixed point
///
/// Returns the final shape recorded for every label that any reachable path arrives at. Dead
/// code (instructions that no path reaches) is skipped, not verified.
pub fn verify_body<'g>(
    code: &CodeStream<ExternalRef<'g>>,
    handlers: &[ExceptionHandler<ExternalRef<'g>>],
    cx: &MutateCx<'_, 'g>,
) -> Result<HashMap<Label, Vec<EsType<'g>>>, Error> {
    let listing = || code.render_listing();
    let marks_by_index = code.marks_by_index();
    let mut shapes = seed_handler_shapes(handlers, cx, &listing)?;

    loop {
        let mut changed = false;
        let mut stack: Option<EvalStack<'g>> = Some(EvalStack::new());

        for (_, index, insn) in code.iter() {
            // A marked position is a join point: fold the fallthrough shape with every label
            // fixed here, then continue with the merged shape
            if let Some(labels) = marks_by_index.get(&index) {
                let mut point: Option<Vec<EsType<'g>>> =
                    stack.take().map(EvalStack::into_types);
                for label in labels {
                    if let Some(existing) = shapes.get(label) {
                        point = Some(match point {
                            None => existing.clone(),
                            Some(current) => {
                                merge_shapes(&current, existing, cx).map_err(|conflict| {
                                    Error::InconsistentMerge {
                                        label: *label,
                                        first: conflict.first,
                                        second: conflict.second,
                                        listing: listing(),
                                    }
                                })?
                            }
                        });
                    }
                }
                if let Some(point) = point {
                    for label in labels {
                        if shapes.get(label) != Some(&point) {
                            shapes.insert(*label, point.clone());
                            changed = true;
                        }
                    }
                    stack = Some(EvalStack::from_types(point));
                }
            }

            let live = match stack.as_mut() {
                Some(live) => live,
                // Unreachable until the next live label
                None => continue,
            };

            mutate(live, insn, cx).map_err(|kind| Error::Verifier {
                instruction: insn.to_string(),
                listing: listing(),
                kind,
            })?;

            let after = live.types().to_vec();
            for target in insn.jump_targets() {
                changed |= merge_into(&mut shapes, target, &after, cx, &listing)?;
            }

            if insn.is_unconditional_terminator() {
                stack = None;
            }
        }

        if !changed {
            return Ok(shapes);
        }
    }
}
