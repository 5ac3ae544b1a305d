//! Symbolic representation of CIL instructions and the instruction stream
//!
//! The representation is slightly different from the raw opcode listing to make it more
//! convenient to construct and verify bytecode. For instance:
//!
//!   - Short encodings never show up: `ldarg.0`-`ldarg.3`, `ldarg.s`, and the fat `ldarg` are all
//!     the single [`Instruction::LdArg`], and the encoder picks the most compact form. The same
//!     goes for the `ldc.i4.*` family and for short vs. standard branches.
//!
//!   - Instructions that exist in several typed flavours are folded into one variant carrying a
//!     small family enum (see [`crate::cil::opcode`]). This keeps repetitive pattern matches
//!     short and makes the verifier rules line up with instruction families.
//!
//!   - Branch targets are [`Label`]s rather than byte offsets. Offsets only come into existence
//!     during encoding (and are turned back into labels during decoding).
//!
//! The type parameter `R` abstracts over the representation of external metadata references:
//! while building and verifying it is [`crate::cil::ExternalRef`] (real references into the type
//! graph), and shortly before the bytes are written it becomes [`crate::cil::Token`] (the opaque
//! 4-byte value assigned by the resolver).

use super::binary_format::Serialize;
use super::errors::Error;
use super::opcode::*;
use super::tokens::Token;
use crate::util::{Offset, OffsetVec, Width};
use byteorder::WriteBytesExt;
use std::collections::HashMap;
use std::fmt;
use std::io;

/// Opaque marker for a not-yet-fixed position in the instruction stream
///
/// Any number of branches may reference a label, but exactly one `mark` fixes its position.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Label(pub(crate) usize);

impl fmt::Debug for Label {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_fmt(format_args!("L{}", self.0))
    }
}

/// Generates fresh labels
///
/// Cloning does not split the generator source - the cloned generator will produce the same
/// sequence of labels as the original.
#[derive(Clone)]
pub struct LabelGenerator(usize);

impl LabelGenerator {
    pub fn new() -> LabelGenerator {
        LabelGenerator(0)
    }

    pub fn fresh_label(&mut self) -> Label {
        let to_return = Label(self.0);
        self.0 += 1;
        to_return
    }
}

impl Default for LabelGenerator {
    fn default() -> Self {
        LabelGenerator::new()
    }
}

/// One symbolic CIL instruction
///
/// `R` is the representation of external metadata references (types, methods, fields, standalone
/// signatures, string literals).
#[derive(Clone, Debug, PartialEq)]
pub enum Instruction<R> {
    Nop,
    Break,
    LdArg(u16),
    LdArgA(u16),
    StArg(u16),
    LdLoc(u16),
    LdLocA(u16),
    StLoc(u16),
    LdNull,
    LdcI4(i32),
    LdcI8(i64),
    LdcR4(f32),
    LdcR8(f64),
    LdStr(R),
    Dup,
    Pop,
    Jmp(R),
    Call(R),
    CallVirt(R),
    CallI(R),
    Ret,
    Br(Label),
    BrFalse(Label),
    BrTrue(Label),
    BrCmp(Comparison, Label),
    Switch(Vec<Label>),
    Leave(Label),
    LdInd(LoadKind),
    StInd(StoreKind),
    Binary(BinaryOp),
    Unary(UnaryOp),
    Conv(ConvKind),
    Cmp(CompareOp),
    LdFld(R),
    LdFldA(R),
    StFld(R),
    LdsFld(R),
    LdsFldA(R),
    StsFld(R),
    NewObj(R),
    CastClass(R),
    IsInst(R),
    Box(R),
    UnboxAny(R),
    InitObj(R),
    LdToken(R),
    SizeOf(R),
    NewArr(R),
    LdLen,
    LdElemA(R),
    LdElem(LoadKind),
    LdElemAny(R),
    StElem(StoreKind),
    StElemAny(R),
    LdFtn(R),
    LdVirtFtn(R),
    Throw,
    Rethrow,
    EndFinally,
    EndFilter,
}

impl<R> Instruction<R> {
    /// Map the external reference representation, short-circuiting on the first failure
    pub fn map_refs<R2, E>(
        &self,
        map_ref: impl Fn(&R) -> Result<R2, E>,
    ) -> Result<Instruction<R2>, E> {
        use Instruction::*;
        Ok(match self {
            Nop => Nop,
            Break => Break,
            LdArg(idx) => LdArg(*idx),
            LdArgA(idx) => LdArgA(*idx),
            StArg(idx) => StArg(*idx),
            LdLoc(idx) => LdLoc(*idx),
            LdLocA(idx) => LdLocA(*idx),
            StLoc(idx) => StLoc(*idx),
            LdNull => LdNull,
            LdcI4(v) => LdcI4(*v),
            LdcI8(v) => LdcI8(*v),
            LdcR4(v) => LdcR4(*v),
            LdcR8(v) => LdcR8(*v),
            LdStr(r) => LdStr(map_ref(r)?),
            Dup => Dup,
            Pop => Pop,
            Jmp(r) => Jmp(map_ref(r)?),
            Call(r) => Call(map_ref(r)?),
            CallVirt(r) => CallVirt(map_ref(r)?),
            CallI(r) => CallI(map_ref(r)?),
            Ret => Ret,
            Br(lbl) => Br(*lbl),
            BrFalse(lbl) => BrFalse(*lbl),
            BrTrue(lbl) => BrTrue(*lbl),
            BrCmp(cmp, lbl) => BrCmp(*cmp, *lbl),
            Switch(lbls) => Switch(lbls.clone()),
            Leave(lbl) => Leave(*lbl),
            LdInd(kind) => LdInd(*kind),
            StInd(kind) => StInd(*kind),
            Binary(op) => Binary(*op),
            Unary(op) => Unary(*op),
            Conv(kind) => Conv(*kind),
            Cmp(op) => Cmp(*op),
            LdFld(r) => LdFld(map_ref(r)?),
            LdFldA(r) => LdFldA(map_ref(r)?),
            StFld(r) => StFld(map_ref(r)?),
            LdsFld(r) => LdsFld(map_ref(r)?),
            LdsFldA(r) => LdsFldA(map_ref(r)?),
            StsFld(r) => StsFld(map_ref(r)?),
            NewObj(r) => NewObj(map_ref(r)?),
            CastClass(r) => CastClass(map_ref(r)?),
            IsInst(r) => IsInst(map_ref(r)?),
            Box(r) => Box(map_ref(r)?),
            UnboxAny(r) => UnboxAny(map_ref(r)?),
            InitObj(r) => InitObj(map_ref(r)?),
            LdToken(r) => LdToken(map_ref(r)?),
            SizeOf(r) => SizeOf(map_ref(r)?),
            NewArr(r) => NewArr(map_ref(r)?),
            LdLen => LdLen,
            LdElemA(r) => LdElemA(map_ref(r)?),
            LdElem(kind) => LdElem(*kind),
            LdElemAny(r) => LdElemAny(map_ref(r)?),
            StElem(kind) => StElem(*kind),
            StElemAny(r) => StElemAny(map_ref(r)?),
            LdFtn(r) => LdFtn(map_ref(r)?),
            LdVirtFtn(r) => LdVirtFtn(map_ref(r)?),
            Throw => Throw,
            Rethrow => Rethrow,
            EndFinally => EndFinally,
            EndFilter => EndFilter,
        })
    }

    /// Labels this instruction may jump to (not counting fallthrough)
    pub fn jump_targets(&self) -> Vec<Label> {
        match self {
            Instruction::Br(lbl)
            | Instruction::BrFalse(lbl)
            | Instruction::BrTrue(lbl)
            | Instruction::BrCmp(_, lbl)
            | Instruction::Leave(lbl) => vec![*lbl],
            Instruction::Switch(lbls) => lbls.clone(),
            _ => vec![],
        }
    }

    /// Does execution never continue to the instruction after this one?
    pub fn is_unconditional_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Br(_)
                | Instruction::Leave(_)
                | Instruction::Ret
                | Instruction::Jmp(_)
                | Instruction::Throw
                | Instruction::Rethrow
                | Instruction::EndFinally
                | Instruction::EndFilter
        )
    }

    /// Is this one of the branch forms with a short and a standard encoding?
    pub(crate) fn is_sizeable_branch(&self) -> bool {
        matches!(
            self,
            Instruction::Br(_)
                | Instruction::BrFalse(_)
                | Instruction::BrTrue(_)
                | Instruction::BrCmp(_, _)
                | Instruction::Leave(_)
        )
    }

    /// Canonical mnemonic (the standard form for instructions with several encodings)
    pub fn mnemonic(&self) -> String {
        match self {
            Instruction::Nop => "nop".to_string(),
            Instruction::Break => "break".to_string(),
            Instruction::LdArg(_) => "ldarg".to_string(),
            Instruction::LdArgA(_) => "ldarga".to_string(),
            Instruction::StArg(_) => "starg".to_string(),
            Instruction::LdLoc(_) => "ldloc".to_string(),
            Instruction::LdLocA(_) => "ldloca".to_string(),
            Instruction::StLoc(_) => "stloc".to_string(),
            Instruction::LdNull => "ldnull".to_string(),
            Instruction::LdcI4(_) => "ldc.i4".to_string(),
            Instruction::LdcI8(_) => "ldc.i8".to_string(),
            Instruction::LdcR4(_) => "ldc.r4".to_string(),
            Instruction::LdcR8(_) => "ldc.r8".to_string(),
            Instruction::LdStr(_) => "ldstr".to_string(),
            Instruction::Dup => "dup".to_string(),
            Instruction::Pop => "pop".to_string(),
            Instruction::Jmp(_) => "jmp".to_string(),
            Instruction::Call(_) => "call".to_string(),
            Instruction::CallVirt(_) => "callvirt".to_string(),
            Instruction::CallI(_) => "calli".to_string(),
            Instruction::Ret => "ret".to_string(),
            Instruction::Br(_) => "br".to_string(),
            Instruction::BrFalse(_) => "brfalse".to_string(),
            Instruction::BrTrue(_) => "brtrue".to_string(),
            Instruction::BrCmp(cmp, _) => cmp.mnemonic().to_string(),
            Instruction::Switch(_) => "switch".to_string(),
            Instruction::Leave(_) => "leave".to_string(),
            Instruction::LdInd(kind) => format!("ldind.{}", kind.suffix()),
            Instruction::StInd(kind) => format!("stind.{}", kind.suffix()),
            Instruction::Binary(op) => op.mnemonic().to_string(),
            Instruction::Unary(op) => op.mnemonic().to_string(),
            Instruction::Conv(kind) => format!("conv.{}", kind.suffix()),
            Instruction::Cmp(op) => op.mnemonic().to_string(),
            Instruction::LdFld(_) => "ldfld".to_string(),
            Instruction::LdFldA(_) => "ldflda".to_string(),
            Instruction::StFld(_) => "stfld".to_string(),
            Instruction::LdsFld(_) => "ldsfld".to_string(),
            Instruction::LdsFldA(_) => "ldsflda".to_string(),
            Instruction::StsFld(_) => "stsfld".to_string(),
            Instruction::NewObj(_) => "newobj".to_string(),
            Instruction::CastClass(_) => "castclass".to_string(),
            Instruction::IsInst(_) => "isinst".to_string(),
            Instruction::Box(_) => "box".to_string(),
            Instruction::UnboxAny(_) => "unbox.any".to_string(),
            Instruction::InitObj(_) => "initobj".to_string(),
            Instruction::LdToken(_) => "ldtoken".to_string(),
            Instruction::SizeOf(_) => "sizeof".to_string(),
            Instruction::NewArr(_) => "newarr".to_string(),
            Instruction::LdLen => "ldlen".to_string(),
            Instruction::LdElemA(_) => "ldelema".to_string(),
            Instruction::LdElem(kind) => format!("ldelem.{}", kind.suffix()),
            Instruction::LdElemAny(_) => "ldelem".to_string(),
            Instruction::StElem(kind) => format!("stelem.{}", kind.suffix()),
            Instruction::StElemAny(_) => "stelem".to_string(),
            Instruction::LdFtn(_) => "ldftn".to_string(),
            Instruction::LdVirtFtn(_) => "ldvirtftn".to_string(),
            Instruction::Throw => "throw".to_string(),
            Instruction::Rethrow => "rethrow".to_string(),
            Instruction::EndFinally => "endfinally".to_string(),
            Instruction::EndFilter => "endfilter".to_string(),
        }
    }

    /// Encoded size in bytes, assuming the branch encoding indicated by `short_branch`
    ///
    /// Only the branch family is offset-dependent; everything else picks its most compact form
    /// from the operand value alone.
    pub(crate) fn encoded_width(&self, short_branch: bool) -> usize {
        match self {
            Instruction::Br(_)
            | Instruction::BrFalse(_)
            | Instruction::BrTrue(_)
            | Instruction::BrCmp(_, _)
            | Instruction::Leave(_) => {
                if short_branch {
                    2
                } else {
                    5
                }
            }

            Instruction::Nop
            | Instruction::Break
            | Instruction::LdNull
            | Instruction::Dup
            | Instruction::Pop
            | Instruction::Ret
            | Instruction::LdLen
            | Instruction::Throw
            | Instruction::EndFinally
            | Instruction::LdInd(_)
            | Instruction::StInd(_)
            | Instruction::Binary(_)
            | Instruction::Unary(_)
            | Instruction::Conv(_)
            | Instruction::LdElem(_)
            | Instruction::StElem(_) => 1,

            Instruction::Cmp(_) | Instruction::Rethrow | Instruction::EndFilter => 2,

            Instruction::LdArg(idx) | Instruction::LdLoc(idx) | Instruction::StLoc(idx) => {
                match idx {
                    0..=3 => 1,
                    4..=255 => 2,
                    _ => 4,
                }
            }
            Instruction::LdArgA(idx) | Instruction::StArg(idx) | Instruction::LdLocA(idx) => {
                if *idx <= 255 {
                    2
                } else {
                    4
                }
            }

            Instruction::LdcI4(v) => {
                if (-1..=8).contains(v) {
                    1
                } else if i8::try_from(*v).is_ok() {
                    2
                } else {
                    5
                }
            }
            Instruction::LdcI8(_) => 9,
            Instruction::LdcR4(_) => 5,
            Instruction::LdcR8(_) => 9,

            Instruction::Switch(targets) => 5 + 4 * targets.len(),

            Instruction::LdStr(_)
            | Instruction::Jmp(_)
            | Instruction::Call(_)
            | Instruction::CallVirt(_)
            | Instruction::CallI(_)
            | Instruction::LdFld(_)
            | Instruction::LdFldA(_)
            | Instruction::StFld(_)
            | Instruction::LdsFld(_)
            | Instruction::LdsFldA(_)
            | Instruction::StsFld(_)
            | Instruction::NewObj(_)
            | Instruction::CastClass(_)
            | Instruction::IsInst(_)
            | Instruction::Box(_)
            | Instruction::UnboxAny(_)
            | Instruction::LdToken(_)
            | Instruction::NewArr(_)
            | Instruction::LdElemA(_)
            | Instruction::LdElemAny(_)
            | Instruction::StElemAny(_) => 5,

            Instruction::LdFtn(_)
            | Instruction::LdVirtFtn(_)
            | Instruction::InitObj(_)
            | Instruction::SizeOf(_) => 6,
        }
    }
}

/// Offsets during symbolic construction are provisional: branches are assumed to need their
/// standard (4-byte displacement) forms until the encoder settles final sizes.
impl<R> Width for Instruction<R> {
    fn width(&self) -> usize {
        self.encoded_width(false)
    }
}

impl<R: fmt::Display> fmt::Display for Instruction<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::LdArg(idx)
            | Instruction::LdArgA(idx)
            | Instruction::StArg(idx)
            | Instruction::LdLoc(idx)
            | Instruction::LdLocA(idx)
            | Instruction::StLoc(idx) => write!(f, "{} {}", self.mnemonic(), idx),
            Instruction::LdcI4(v) => write!(f, "ldc.i4 {}", v),
            Instruction::LdcI8(v) => write!(f, "ldc.i8 {}", v),
            Instruction::LdcR4(v) => write!(f, "ldc.r4 {}", v),
            Instruction::LdcR8(v) => write!(f, "ldc.r8 {}", v),
            Instruction::Br(lbl)
            | Instruction::BrFalse(lbl)
            | Instruction::BrTrue(lbl)
            | Instruction::BrCmp(_, lbl)
            | Instruction::Leave(lbl) => write!(f, "{} {:?}", self.mnemonic(), lbl),
            Instruction::Switch(lbls) => {
                write!(f, "switch (")?;
                for (i, lbl) in lbls.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}", lbl)?;
                }
                write!(f, ")")
            }
            Instruction::LdStr(r)
            | Instruction::Jmp(r)
            | Instruction::Call(r)
            | Instruction::CallVirt(r)
            | Instruction::CallI(r)
            | Instruction::LdFld(r)
            | Instruction::LdFldA(r)
            | Instruction::StFld(r)
            | Instruction::LdsFld(r)
            | Instruction::LdsFldA(r)
            | Instruction::StsFld(r)
            | Instruction::NewObj(r)
            | Instruction::CastClass(r)
            | Instruction::IsInst(r)
            | Instruction::Box(r)
            | Instruction::UnboxAny(r)
            | Instruction::InitObj(r)
            | Instruction::LdToken(r)
            | Instruction::SizeOf(r)
            | Instruction::NewArr(r)
            | Instruction::LdElemA(r)
            | Instruction::LdElemAny(r)
            | Instruction::StElemAny(r)
            | Instruction::LdFtn(r)
            | Instruction::LdVirtFtn(r) => write!(f, "{} {}", self.mnemonic(), r),
            _ => write!(f, "{}", self.mnemonic()),
        }
    }
}

/// Branch displacement settled by the encoder for one jump target
#[derive(Copy, Clone, Debug)]
pub(crate) enum EncodedTarget {
    Short(i8),
    Long(i32),
}

impl EncodedTarget {
    fn long_value(self) -> i32 {
        match self {
            EncodedTarget::Short(disp) => disp as i32,
            EncodedTarget::Long(disp) => disp,
        }
    }
}

impl Instruction<Token> {
    /// Write the instruction, choosing the most compact encoding
    ///
    /// `targets` must line up with [`Instruction::jump_targets`]: one settled displacement per
    /// target (measured from the byte after the instruction for branches, and from the end of the
    /// whole instruction for switch tables).
    pub(crate) fn serialize_into<W: WriteBytesExt>(
        &self,
        writer: &mut W,
        targets: &[EncodedTarget],
    ) -> io::Result<()> {
        match self {
            Instruction::Nop => 0x00u8.serialize(writer)?,
            Instruction::Break => 0x01u8.serialize(writer)?,

            Instruction::LdArg(idx) => match idx {
                0..=3 => (0x02 + *idx as u8).serialize(writer)?,
                4..=255 => {
                    0x0Eu8.serialize(writer)?;
                    (*idx as u8).serialize(writer)?;
                }
                _ => {
                    FAT_PREFIX.serialize(writer)?;
                    0x09u8.serialize(writer)?;
                    idx.serialize(writer)?;
                }
            },
            Instruction::LdArgA(idx) => {
                if let Ok(byte) = u8::try_from(*idx) {
                    0x0Fu8.serialize(writer)?;
                    byte.serialize(writer)?;
                } else {
                    FAT_PREFIX.serialize(writer)?;
                    0x0Au8.serialize(writer)?;
                    idx.serialize(writer)?;
                }
            }
            Instruction::StArg(idx) => {
                if let Ok(byte) = u8::try_from(*idx) {
                    0x10u8.serialize(writer)?;
                    byte.serialize(writer)?;
                } else {
                    FAT_PREFIX.serialize(writer)?;
                    0x0Bu8.serialize(writer)?;
                    idx.serialize(writer)?;
                }
            }
            Instruction::LdLoc(idx) => match idx {
                0..=3 => (0x06 + *idx as u8).serialize(writer)?,
                4..=255 => {
                    0x11u8.serialize(writer)?;
                    (*idx as u8).serialize(writer)?;
                }
                _ => {
                    FAT_PREFIX.serialize(writer)?;
                    0x0Cu8.serialize(writer)?;
                    idx.serialize(writer)?;
                }
            },
            Instruction::LdLocA(idx) => {
                if let Ok(byte) = u8::try_from(*idx) {
                    0x12u8.serialize(writer)?;
                    byte.serialize(writer)?;
                } else {
                    FAT_PREFIX.serialize(writer)?;
                    0x0Du8.serialize(writer)?;
                    idx.serialize(writer)?;
                }
            }
            Instruction::StLoc(idx) => match idx {
                0..=3 => (0x0A + *idx as u8).serialize(writer)?,
                4..=255 => {
                    0x13u8.serialize(writer)?;
                    (*idx as u8).serialize(writer)?;
                }
                _ => {
                    FAT_PREFIX.serialize(writer)?;
                    0x0Eu8.serialize(writer)?;
                    idx.serialize(writer)?;
                }
            },

            Instruction::LdNull => 0x14u8.serialize(writer)?,
            Instruction::LdcI4(v) => match v {
                -1 => 0x15u8.serialize(writer)?,
                0..=8 => (0x16 + *v as u8).serialize(writer)?,
                _ => {
                    if let Ok(byte) = i8::try_from(*v) {
                        0x1Fu8.serialize(writer)?;
                        byte.serialize(writer)?;
                    } else {
                        0x20u8.serialize(writer)?;
                        v.serialize(writer)?;
                    }
                }
            },
            Instruction::LdcI8(v) => {
                0x21u8.serialize(writer)?;
                v.serialize(writer)?;
            }
            Instruction::LdcR4(v) => {
                0x22u8.serialize(writer)?;
                v.serialize(writer)?;
            }
            Instruction::LdcR8(v) => {
                0x23u8.serialize(writer)?;
                v.serialize(writer)?;
            }

            Instruction::Dup => 0x25u8.serialize(writer)?,
            Instruction::Pop => 0x26u8.serialize(writer)?,

            Instruction::Jmp(token) => {
                0x27u8.serialize(writer)?;
                token.serialize(writer)?;
            }
            Instruction::Call(token) => {
                0x28u8.serialize(writer)?;
                token.serialize(writer)?;
            }
            Instruction::CallI(token) => {
                0x29u8.serialize(writer)?;
                token.serialize(writer)?;
            }
            Instruction::Ret => 0x2Au8.serialize(writer)?,

            Instruction::Br(_) => match targets[0] {
                EncodedTarget::Short(disp) => {
                    0x2Bu8.serialize(writer)?;
                    disp.serialize(writer)?;
                }
                EncodedTarget::Long(disp) => {
                    0x38u8.serialize(writer)?;
                    disp.serialize(writer)?;
                }
            },
            Instruction::BrFalse(_) => match targets[0] {
                EncodedTarget::Short(disp) => {
                    0x2Cu8.serialize(writer)?;
                    disp.serialize(writer)?;
                }
                EncodedTarget::Long(disp) => {
                    0x39u8.serialize(writer)?;
                    disp.serialize(writer)?;
                }
            },
            Instruction::BrTrue(_) => match targets[0] {
                EncodedTarget::Short(disp) => {
                    0x2Du8.serialize(writer)?;
                    disp.serialize(writer)?;
                }
                EncodedTarget::Long(disp) => {
                    0x3Au8.serialize(writer)?;
                    disp.serialize(writer)?;
                }
            },
            Instruction::BrCmp(cmp, _) => match targets[0] {
                EncodedTarget::Short(disp) => {
                    cmp.short_byte().serialize(writer)?;
                    disp.serialize(writer)?;
                }
                EncodedTarget::Long(disp) => {
                    cmp.long_byte().serialize(writer)?;
                    disp.serialize(writer)?;
                }
            },
            Instruction::Leave(_) => match targets[0] {
                EncodedTarget::Short(disp) => {
                    0xDEu8.serialize(writer)?;
                    disp.serialize(writer)?;
                }
                EncodedTarget::Long(disp) => {
                    0xDDu8.serialize(writer)?;
                    disp.serialize(writer)?;
                }
            },
            Instruction::Switch(_) => {
                0x45u8.serialize(writer)?;
                (targets.len() as u32).serialize(writer)?;
                for target in targets {
                    target.long_value().serialize(writer)?;
                }
            }

            Instruction::LdInd(kind) => kind.ldind_byte().serialize(writer)?,
            Instruction::StInd(kind) => kind.stind_byte().serialize(writer)?,
            Instruction::Binary(op) => op.byte().serialize(writer)?,
            Instruction::Unary(op) => op.byte().serialize(writer)?,
            Instruction::Conv(kind) => kind.byte().serialize(writer)?,
            Instruction::Cmp(op) => {
                FAT_PREFIX.serialize(writer)?;
                op.fat_byte().serialize(writer)?;
            }

            Instruction::CallVirt(token) => {
                0x6Fu8.serialize(writer)?;
                token.serialize(writer)?;
            }
            Instruction::LdStr(token) => {
                0x72u8.serialize(writer)?;
                token.serialize(writer)?;
            }
            Instruction::NewObj(token) => {
                0x73u8.serialize(writer)?;
                token.serialize(writer)?;
            }
            Instruction::CastClass(token) => {
                0x74u8.serialize(writer)?;
                token.serialize(writer)?;
            }
            Instruction::IsInst(token) => {
                0x75u8.serialize(writer)?;
                token.serialize(writer)?;
            }
            Instruction::Throw => 0x7Au8.serialize(writer)?,

            Instruction::LdFld(token) => {
                0x7Bu8.serialize(writer)?;
                token.serialize(writer)?;
            }
            Instruction::LdFldA(token) => {
                0x7Cu8.serialize(writer)?;
                token.serialize(writer)?;
            }
            Instruction::StFld(token) => {
                0x7Du8.serialize(writer)?;
                token.serialize(writer)?;
            }
            Instruction::LdsFld(token) => {
                0x7Eu8.serialize(writer)?;
                token.serialize(writer)?;
            }
            Instruction::LdsFldA(token) => {
                0x7Fu8.serialize(writer)?;
                token.serialize(writer)?;
            }
            Instruction::StsFld(token) => {
                0x80u8.serialize(writer)?;
                token.serialize(writer)?;
            }

            Instruction::Box(token) => {
                0x8Cu8.serialize(writer)?;
                token.serialize(writer)?;
            }
            Instruction::NewArr(token) => {
                0x8Du8.serialize(writer)?;
                token.serialize(writer)?;
            }
            Instruction::LdLen => 0x8Eu8.serialize(writer)?,
            Instruction::LdElemA(token) => {
                0x8Fu8.serialize(writer)?;
                token.serialize(writer)?;
            }
            Instruction::LdElem(kind) => kind.ldelem_byte().serialize(writer)?,
            Instruction::LdElemAny(token) => {
                0xA3u8.serialize(writer)?;
                token.serialize(writer)?;
            }
            Instruction::StElem(kind) => kind.stelem_byte().serialize(writer)?,
            Instruction::StElemAny(token) => {
                0xA4u8.serialize(writer)?;
                token.serialize(writer)?;
            }
            Instruction::UnboxAny(token) => {
                0xA5u8.serialize(writer)?;
                token.serialize(writer)?;
            }

            Instruction::LdToken(token) => {
                0xD0u8.serialize(writer)?;
                token.serialize(writer)?;
            }
            Instruction::EndFinally => 0xDCu8.serialize(writer)?,

            Instruction::LdFtn(token) => {
                FAT_PREFIX.serialize(writer)?;
                0x06u8.serialize(writer)?;
                token.serialize(writer)?;
            }
            Instruction::LdVirtFtn(token) => {
                FAT_PREFIX.serialize(writer)?;
                0x07u8.serialize(writer)?;
                token.serialize(writer)?;
            }
            Instruction::EndFilter => {
                FAT_PREFIX.serialize(writer)?;
                0x11u8.serialize(writer)?;
            }
            Instruction::InitObj(token) => {
                FAT_PREFIX.serialize(writer)?;
                0x15u8.serialize(writer)?;
                token.serialize(writer)?;
            }
            Instruction::Rethrow => {
                FAT_PREFIX.serialize(writer)?;
                0x1Au8.serialize(writer)?;
            }
            Instruction::SizeOf(token) => {
                FAT_PREFIX.serialize(writer)?;
                0x1Cu8.serialize(writer)?;
                token.serialize(writer)?;
            }
        }
        Ok(())
    }
}

/// A linear instruction stream, plus the positions its labels have been fixed to
///
/// Offsets inside the stream are byte offsets into the (eventual) code section. While branches
/// are still unsized they are provisional; the encoder recomputes them once branch forms settle.
#[derive(Clone, Debug)]
pub struct CodeStream<R> {
    instructions: OffsetVec<Instruction<R>>,
    marks: HashMap<Label, usize>,
}

impl<R> CodeStream<R> {
    pub fn new() -> CodeStream<R> {
        CodeStream {
            instructions: OffsetVec::new(),
            marks: HashMap::new(),
        }
    }

    /// Number of instructions
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Provisional size of the encoded code section
    pub fn byte_len(&self) -> Offset {
        self.instructions.offset_len()
    }

    pub fn push(&mut self, insn: Instruction<R>) {
        self.instructions.push(insn);
    }

    pub fn get(&self, index: usize) -> Option<&Instruction<R>> {
        self.instructions.get_index(index).map(|(_, insn)| insn)
    }

    pub fn last(&self) -> Option<&Instruction<R>> {
        if self.instructions.is_empty() {
            None
        } else {
            self.get(self.instructions.len() - 1)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Offset, usize, &Instruction<R>)> {
        self.instructions.iter()
    }

    /// Fix `label` to the position of the next instruction to be pushed
    ///
    /// An index one past the last instruction is the end-of-stream sentinel position.
    pub fn mark(&mut self, label: Label) -> Result<(), Error> {
        self.mark_at(label, self.instructions.len())
    }

    pub(crate) fn mark_at(&mut self, label: Label, index: usize) -> Result<(), Error> {
        if self.marks.insert(label, index).is_some() {
            return Err(Error::DuplicateMark(label));
        }
        Ok(())
    }

    /// All label positions, as instruction indices
    pub fn marks(&self) -> &HashMap<Label, usize> {
        &self.marks
    }

    /// Instruction index a label is fixed to
    pub fn index_of_label(&self, label: Label) -> Option<usize> {
        self.marks.get(&label).copied()
    }

    /// Labels grouped by the instruction index they are fixed to
    pub(crate) fn marks_by_index(&self) -> HashMap<usize, Vec<Label>> {
        let mut by_index: HashMap<usize, Vec<Label>> = HashMap::new();
        for (label, index) in &self.marks {
            by_index.entry(*index).or_default().push(*label);
        }
        for labels in by_index.values_mut() {
            labels.sort();
        }
        by_index
    }
}

impl<R> Default for CodeStream<R> {
    fn default() -> Self {
        CodeStream::new()
    }
}

impl<R: fmt::Display> CodeStream<R> {
    /// Render the stream the way it shows up in error messages
    pub fn render_listing(&self) -> String {
        let by_index = self.marks_by_index();
        let mut listing = String::new();
        for (offset, index, insn) in self.instructions.iter() {
            if let Some(labels) = by_index.get(&index) {
                for label in labels {
                    listing.push_str(&format!("{:?}:\n", label));
                }
            }
            listing.push_str(&format!("  IL_{:04x}: {}\n", offset.0, insn));
        }
        if let Some(labels) = by_index.get(&self.instructions.len()) {
            for label in labels {
                listing.push_str(&format!("{:?}:\n", label));
            }
        }
        listing
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn compact_widths() {
        let nop: Instruction<Token> = Instruction::Nop;
        assert_eq!(nop.width(), 1);

        let short: Instruction<Token> = Instruction::LdArg(3);
        let mid: Instruction<Token> = Instruction::LdArg(200);
        let fat: Instruction<Token> = Instruction::LdArg(1000);
        assert_eq!(short.width(), 1);
        assert_eq!(mid.width(), 2);
        assert_eq!(fat.width(), 4);

        let inline: Instruction<Token> = Instruction::LdcI4(8);
        let short: Instruction<Token> = Instruction::LdcI4(100);
        let full: Instruction<Token> = Instruction::LdcI4(1000);
        assert_eq!(inline.width(), 1);
        assert_eq!(short.width(), 2);
        assert_eq!(full.width(), 5);
    }

    #[test]
    fn compact_encodings() {
        let mut bytes = vec![];
        Instruction::<Token>::LdArg(0)
            .serialize_into(&mut bytes, &[])
            .unwrap();
        Instruction::<Token>::LdcI4(-1)
            .serialize_into(&mut bytes, &[])
            .unwrap();
        Instruction::<Token>::LdcI4(42)
            .serialize_into(&mut bytes, &[])
            .unwrap();
        Instruction::<Token>::Binary(BinaryOp::Add)
            .serialize_into(&mut bytes, &[])
            .unwrap();
        Instruction::<Token>::Ret
            .serialize_into(&mut bytes, &[])
            .unwrap();
        assert_eq!(bytes, vec![0x02, 0x15, 0x1F, 42, 0x58, 0x2A]);
    }

    #[test]
    fn branch_encodings() {
        let branch: Instruction<Token> = Instruction::BrCmp(Comparison::LtUn, Label(0));

        let mut bytes = vec![];
        branch
            .serialize_into(&mut bytes, &[EncodedTarget::Short(-2)])
            .unwrap();
        assert_eq!(bytes, vec![0x37, 0xFE]);

        let mut bytes = vec![];
        branch
            .serialize_into(&mut bytes, &[EncodedTarget::Long(-2)])
            .unwrap();
        assert_eq!(bytes, vec![0x44, 0xFE, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn listing_includes_marks() {
        let mut code: CodeStream<Token> = CodeStream::new();
        let l0 = Label(0);
        code.push(Instruction::LdArg(0));
        code.mark(l0).unwrap();
        code.push(Instruction::Ret);

        let listing = code.render_listing();
        assert!(listing.contains("L0:"));
        assert!(listing.contains("IL_0000: ldarg 0"));
        assert!(listing.contains("IL_0001: ret"));
    }
}
