//! Declared types, call-site signatures, and the local-variable signature codec
//!
//! [`CilType`] is the language of declared types: what a local, argument, field, or parameter is
//! said to be. The verifier derives its coarse stack categories from it (see
//! [`CilType::category`]), and the local-variable signature blob referenced from a fat method
//! header is a length-prefixed sequence of exactly these types in their ECMA-335 §II.23.2.6
//! encoding.

use super::errors::Error;
use super::tokens::{tables, ExternalRef, Token, TokenResolver};
use super::type_graph::{SystemTypes, TypeId};
use std::fmt;

/// Coarse runtime-representation category of a value on the evaluation stack
///
/// Compatibility checks between categories are cheap; anything finer-grained (object subtyping,
/// struct identity) consults the actual types.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum StackCategory {
    Int32,
    Int64,
    NativeInt,
    Float,
    Object,
    Pointer,
    Struct,
    /// The literal `null`/zero value, assignable to every reference-like category
    Zero,
}

impl fmt::Display for StackCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StackCategory::Int32 => "int32",
            StackCategory::Int64 => "int64",
            StackCategory::NativeInt => "native int",
            StackCategory::Float => "float",
            StackCategory::Object => "object",
            StackCategory::Pointer => "managed pointer",
            StackCategory::Struct => "value type",
            StackCategory::Zero => "zero",
        };
        f.write_str(name)
    }
}

/// A declared CIL type
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum CilType<'g> {
    Bool,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    /// Native-width signed integer
    I,
    /// Native-width unsigned integer
    U,

    /// Object reference (class or interface)
    Object(TypeId<'g>),

    /// Value type (struct), by exact type
    ValueType(TypeId<'g>),

    /// Single-dimensional, zero-based array
    SzArray(Box<CilType<'g>>),

    /// Unmanaged pointer (native int on the evaluation stack)
    Ptr(Box<CilType<'g>>),

    /// Managed pointer
    ByRef(Box<CilType<'g>>),

    /// Pinned local (only meaningful in local-variable signatures)
    Pinned(Box<CilType<'g>>),

    /// Generic instantiation of a class or value type definition
    Generic {
        base: TypeId<'g>,
        args: Vec<CilType<'g>>,
    },
}

impl<'g> CilType<'g> {
    /// Coarse stack category of a value of this type
    pub fn category(&self) -> StackCategory {
        match self {
            CilType::Bool
            | CilType::Char
            | CilType::I1
            | CilType::U1
            | CilType::I2
            | CilType::U2
            | CilType::I4
            | CilType::U4 => StackCategory::Int32,
            CilType::I8 | CilType::U8 => StackCategory::Int64,
            CilType::I | CilType::U | CilType::Ptr(_) => StackCategory::NativeInt,
            CilType::R4 | CilType::R8 => StackCategory::Float,
            CilType::Object(_) | CilType::SzArray(_) => StackCategory::Object,
            CilType::ByRef(_) => StackCategory::Pointer,
            CilType::ValueType(_) => StackCategory::Struct,
            CilType::Pinned(inner) => inner.category(),
            CilType::Generic { base, .. } => {
                if base.is_value_type() {
                    StackCategory::Struct
                } else {
                    StackCategory::Object
                }
            }
        }
    }

    /// Strip a `pinned` wrapper, if any
    pub fn unpinned(&self) -> &CilType<'g> {
        match self {
            CilType::Pinned(inner) => inner.unpinned(),
            other => other,
        }
    }
}

impl<'g> fmt::Display for CilType<'g> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CilType::Bool => f.write_str("bool"),
            CilType::Char => f.write_str("char"),
            CilType::I1 => f.write_str("int8"),
            CilType::U1 => f.write_str("uint8"),
            CilType::I2 => f.write_str("int16"),
            CilType::U2 => f.write_str("uint16"),
            CilType::I4 => f.write_str("int32"),
            CilType::U4 => f.write_str("uint32"),
            CilType::I8 => f.write_str("int64"),
            CilType::U8 => f.write_str("uint64"),
            CilType::R4 => f.write_str("float32"),
            CilType::R8 => f.write_str("float64"),
            CilType::I => f.write_str("native int"),
            CilType::U => f.write_str("native uint"),
            CilType::Object(id) => write!(f, "class {}", id.name),
            CilType::ValueType(id) => write!(f, "valuetype {}", id.name),
            CilType::SzArray(elem) => write!(f, "{}[]", elem),
            CilType::Ptr(inner) => write!(f, "{}*", inner),
            CilType::ByRef(inner) => write!(f, "{}&", inner),
            CilType::Pinned(inner) => write!(f, "pinned {}", inner),
            CilType::Generic { base, args } => {
                write!(f, "{}<", base.name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ">")
            }
        }
    }
}

/// Call-site signature of a method, constructor, or `calli` target
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct MethodSig<'g> {
    /// Does the callee take a `this`?
    pub has_this: bool,

    /// Declared parameter types (not counting `this`)
    pub params: Vec<CilType<'g>>,

    /// Declared return type, `None` for void
    pub ret: Option<CilType<'g>>,
}

impl<'g> MethodSig<'g> {
    pub fn static_method(params: Vec<CilType<'g>>, ret: Option<CilType<'g>>) -> MethodSig<'g> {
        MethodSig {
            has_this: false,
            params,
            ret,
        }
    }

    pub fn instance_method(params: Vec<CilType<'g>>, ret: Option<CilType<'g>>) -> MethodSig<'g> {
        MethodSig {
            has_this: true,
            params,
            ret,
        }
    }

    /// Number of stack slots consumed at a call site (including `this`)
    pub fn arity(&self) -> usize {
        self.params.len() + usize::from(self.has_this)
    }
}

impl<'g> fmt::Display for MethodSig<'g> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_this {
            f.write_str("instance ")?;
        }
        f.write_str("(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", param)?;
        }
        f.write_str(")")?;
        match &self.ret {
            Some(ret) => write!(f, " -> {}", ret),
            None => write!(f, " -> void"),
        }
    }
}

/// Calling convention byte of a local-variable signature
pub const LOCAL_SIG: u8 = 0x07;

/// Element type constants from ECMA-335 §II.23.1.16
mod element {
    pub const BOOLEAN: u8 = 0x02;
    pub const CHAR: u8 = 0x03;
    pub const I1: u8 = 0x04;
    pub const U1: u8 = 0x05;
    pub const I2: u8 = 0x06;
    pub const U2: u8 = 0x07;
    pub const I4: u8 = 0x08;
    pub const U4: u8 = 0x09;
    pub const I8: u8 = 0x0A;
    pub const U8: u8 = 0x0B;
    pub const R4: u8 = 0x0C;
    pub const R8: u8 = 0x0D;
    pub const STRING: u8 = 0x0E;
    pub const PTR: u8 = 0x0F;
    pub const BYREF: u8 = 0x10;
    pub const VALUETYPE: u8 = 0x11;
    pub const CLASS: u8 = 0x12;
    pub const GENERICINST: u8 = 0x15;
    pub const I: u8 = 0x18;
    pub const U: u8 = 0x19;
    pub const OBJECT: u8 = 0x1C;
    pub const SZARRAY: u8 = 0x1D;
    pub const PINNED: u8 = 0x45;
}

/// Append a compressed unsigned integer (ECMA-335 §II.23.2)
pub(crate) fn write_compressed_u32(out: &mut Vec<u8>, value: u32) -> Result<(), Error> {
    if value <= 0x7F {
        out.push(value as u8);
    } else if value <= 0x3FFF {
        out.push(0x80 | (value >> 8) as u8);
        out.push(value as u8);
    } else if value <= 0x1FFF_FFFF {
        out.push(0xC0 | (value >> 24) as u8);
        out.push((value >> 16) as u8);
        out.push((value >> 8) as u8);
        out.push(value as u8);
    } else {
        return Err(Error::UnsupportedSignature(format!(
            "value {} too large for compressed encoding",
            value
        )));
    }
    Ok(())
}

/// Byte cursor over a signature blob
struct SigReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> SigReader<'a> {
    fn new(bytes: &'a [u8]) -> SigReader<'a> {
        SigReader { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, Error> {
        let byte = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| Error::UnsupportedSignature("truncated signature".to_string()))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_compressed_u32(&mut self) -> Result<u32, Error> {
        let first = self.read_u8()?;
        if first & 0x80 == 0 {
            Ok(first as u32)
        } else if first & 0xC0 == 0x80 {
            let second = self.read_u8()?;
            Ok(((first as u32 & 0x3F) << 8) | second as u32)
        } else if first & 0xE0 == 0xC0 {
            let b2 = self.read_u8()? as u32;
            let b3 = self.read_u8()? as u32;
            let b4 = self.read_u8()? as u32;
            Ok(((first as u32 & 0x1F) << 24) | (b2 << 16) | (b3 << 8) | b4)
        } else {
            Err(Error::UnsupportedSignature(
                "invalid compressed integer prefix".to_string(),
            ))
        }
    }

    fn at_end(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

/// Pack a metadata token into its TypeDefOrRef coded form (ECMA-335 §II.23.2.8)
fn encode_type_token(out: &mut Vec<u8>, token: Token) -> Result<(), Error> {
    let tag = match token.table() {
        0x02 => 0,
        tables::TYPE_REF => 1,
        tables::TYPE_SPEC => 2,
        other => {
            return Err(Error::UnsupportedSignature(format!(
                "token table {:#04x} cannot appear in a signature",
                other
            )))
        }
    };
    write_compressed_u32(out, (token.index() << 2) | tag)
}

fn decode_type_token(reader: &mut SigReader) -> Result<Token, Error> {
    let coded = reader.read_compressed_u32()?;
    let table = match coded & 0x3 {
        0 => 0x02,
        1 => tables::TYPE_REF,
        2 => tables::TYPE_SPEC,
        _ => {
            return Err(Error::UnsupportedSignature(
                "invalid TypeDefOrRef tag".to_string(),
            ))
        }
    };
    Ok(Token::new(table, coded >> 2))
}

fn encode_type<'g>(
    out: &mut Vec<u8>,
    ty: &CilType<'g>,
    system: &SystemTypes<'g>,
    resolver: &dyn TokenResolver<'g>,
) -> Result<(), Error> {
    match ty {
        CilType::Bool => out.push(element::BOOLEAN),
        CilType::Char => out.push(element::CHAR),
        CilType::I1 => out.push(element::I1),
        CilType::U1 => out.push(element::U1),
        CilType::I2 => out.push(element::I2),
        CilType::U2 => out.push(element::U2),
        CilType::I4 => out.push(element::I4),
        CilType::U4 => out.push(element::U4),
        CilType::I8 => out.push(element::I8),
        CilType::U8 => out.push(element::U8),
        CilType::R4 => out.push(element::R4),
        CilType::R8 => out.push(element::R8),
        CilType::I => out.push(element::I),
        CilType::U => out.push(element::U),
        CilType::Object(id) if *id == system.object => out.push(element::OBJECT),
        CilType::Object(id) if *id == system.string => out.push(element::STRING),
        CilType::Object(_) => {
            out.push(element::CLASS);
            let token = resolver.token_of(&ExternalRef::Type(ty.clone()))?;
            encode_type_token(out, token)?;
        }
        CilType::ValueType(_) => {
            out.push(element::VALUETYPE);
            let token = resolver.token_of(&ExternalRef::Type(ty.clone()))?;
            encode_type_token(out, token)?;
        }
        CilType::SzArray(elem) => {
            out.push(element::SZARRAY);
            encode_type(out, elem, system, resolver)?;
        }
        CilType::Ptr(inner) => {
            out.push(element::PTR);
            encode_type(out, inner, system, resolver)?;
        }
        CilType::ByRef(inner) => {
            out.push(element::BYREF);
            encode_type(out, inner, system, resolver)?;
        }
        CilType::Pinned(inner) => {
            out.push(element::PINNED);
            encode_type(out, inner, system, resolver)?;
        }
        CilType::Generic { base, args } => {
            out.push(element::GENERICINST);
            let (shape, base_ty) = if base.is_value_type() {
                (element::VALUETYPE, CilType::ValueType(*base))
            } else {
                (element::CLASS, CilType::Object(*base))
            };
            out.push(shape);
            let token = resolver.token_of(&ExternalRef::Type(base_ty))?;
            encode_type_token(out, token)?;
            write_compressed_u32(out, args.len() as u32)?;
            for arg in args {
                encode_type(out, arg, system, resolver)?;
            }
        }
    }
    Ok(())
}

fn resolve_named_type<'g>(
    token: Token,
    resolver: &dyn TokenResolver<'g>,
) -> Result<TypeId<'g>, Error> {
    match resolver.resolve(token)? {
        ExternalRef::Type(CilType::Object(id)) | ExternalRef::Type(CilType::ValueType(id)) => {
            Ok(id)
        }
        other => Err(Error::UnsupportedSignature(format!(
            "signature type token resolved to {}",
            other
        ))),
    }
}

fn decode_type<'g>(
    reader: &mut SigReader,
    system: &SystemTypes<'g>,
    resolver: &dyn TokenResolver<'g>,
) -> Result<CilType<'g>, Error> {
    let byte = reader.read_u8()?;
    Ok(match byte {
        element::BOOLEAN => CilType::Bool,
        element::CHAR => CilType::Char,
        element::I1 => CilType::I1,
        element::U1 => CilType::U1,
        element::I2 => CilType::I2,
        element::U2 => CilType::U2,
        element::I4 => CilType::I4,
        element::U4 => CilType::U4,
        element::I8 => CilType::I8,
        element::U8 => CilType::U8,
        element::R4 => CilType::R4,
        element::R8 => CilType::R8,
        element::I => CilType::I,
        element::U => CilType::U,
        element::OBJECT => CilType::Object(system.object),
        element::STRING => CilType::Object(system.string),
        element::CLASS => CilType::Object(resolve_named_type(decode_type_token(reader)?, resolver)?),
        element::VALUETYPE => {
            CilType::ValueType(resolve_named_type(decode_type_token(reader)?, resolver)?)
        }
        element::SZARRAY => CilType::SzArray(Box::new(decode_type(reader, system, resolver)?)),
        element::PTR => CilType::Ptr(Box::new(decode_type(reader, system, resolver)?)),
        element::BYREF => CilType::ByRef(Box::new(decode_type(reader, system, resolver)?)),
        element::PINNED => CilType::Pinned(Box::new(decode_type(reader, system, resolver)?)),
        element::GENERICINST => {
            let shape = reader.read_u8()?;
            if shape != element::CLASS && shape != element::VALUETYPE {
                return Err(Error::UnsupportedSignature(format!(
                    "invalid generic instantiation shape {:#04x}",
                    shape
                )));
            }
            let base = resolve_named_type(decode_type_token(reader)?, resolver)?;
            let count = reader.read_compressed_u32()?;
            let mut args = Vec::with_capacity(count as usize);
            for _ in 0..count {
                args.push(decode_type(reader, system, resolver)?);
            }
            CilType::Generic { base, args }
        }
        other => {
            return Err(Error::UnsupportedSignature(format!(
                "element type {:#04x}",
                other
            )))
        }
    })
}

/// Encode a local-variable signature blob
pub fn encode_locals<'g>(
    locals: &[CilType<'g>],
    system: &SystemTypes<'g>,
    resolver: &dyn TokenResolver<'g>,
) -> Result<Vec<u8>, Error> {
    let mut out = vec![LOCAL_SIG];
    write_compressed_u32(&mut out, locals.len() as u32)?;
    for local in locals {
        encode_type(&mut out, local, system, resolver)?;
    }
    Ok(out)
}

/// Decode a local-variable signature blob
pub fn decode_locals<'g>(
    blob: &[u8],
    system: &SystemTypes<'g>,
    resolver: &dyn TokenResolver<'g>,
) -> Result<Vec<CilType<'g>>, Error> {
    let mut reader = SigReader::new(blob);
    let convention = reader.read_u8()?;
    if convention != LOCAL_SIG {
        return Err(Error::UnsupportedSignature(format!(
            "calling convention {:#04x} is not a local signature",
            convention
        )));
    }
    let count = reader.read_compressed_u32()?;
    let mut locals = Vec::with_capacity(count as usize);
    for _ in 0..count {
        locals.push(decode_type(&mut reader, system, resolver)?);
    }
    if !reader.at_end() {
        return Err(Error::UnsupportedSignature(
            "trailing bytes after local signature".to_string(),
        ));
    }
    Ok(locals)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cil::tokens::InMemoryTokenTable;
    use crate::cil::type_graph::{TypeData, TypeGraph, TypeGraphArenas};

    #[test]
    fn compressed_integers_round_trip() {
        for value in [0u32, 0x7F, 0x80, 0x3FFF, 0x4000, 0x1FFF_FFFF] {
            let mut out = vec![];
            write_compressed_u32(&mut out, value).unwrap();
            let mut reader = SigReader::new(&out);
            assert_eq!(reader.read_compressed_u32().unwrap(), value);
            assert!(reader.at_end());
        }

        let mut out = vec![];
        assert!(write_compressed_u32(&mut out, 0x2000_0000).is_err());
    }

    #[test]
    fn compressed_integer_sizes() {
        let mut out = vec![];
        write_compressed_u32(&mut out, 0x7F).unwrap();
        assert_eq!(out.len(), 1);

        let mut out = vec![];
        write_compressed_u32(&mut out, 0x80).unwrap();
        assert_eq!(out, vec![0x80, 0x80]);

        let mut out = vec![];
        write_compressed_u32(&mut out, 0x4000).unwrap();
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn locals_round_trip() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();
        let resolver = InMemoryTokenTable::new();

        let widget = graph.add_type(TypeData::class("Widget", system.object));
        let point = graph.add_type(TypeData::value_type("Point", system.value_type));
        let list = graph.add_type(TypeData::class("System.Collections.Generic.List`1", system.object));

        let locals = vec![
            CilType::I4,
            CilType::Object(system.string),
            CilType::Object(system.object),
            CilType::Object(widget),
            CilType::ValueType(point),
            CilType::SzArray(Box::new(CilType::R8)),
            CilType::Ptr(Box::new(CilType::U1)),
            CilType::ByRef(Box::new(CilType::ValueType(point))),
            CilType::Pinned(Box::new(CilType::Object(widget))),
            CilType::Generic {
                base: list,
                args: vec![CilType::I4],
            },
        ];

        let blob = encode_locals(&locals, &system, &resolver).unwrap();
        assert_eq!(blob[0], LOCAL_SIG);
        let decoded = decode_locals(&blob, &system, &resolver).unwrap();
        assert_eq!(decoded, locals);
    }

    #[test]
    fn locals_reject_wrong_convention() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();
        let resolver = InMemoryTokenTable::new();

        let blob = vec![0x06, 0x00];
        assert!(matches!(
            decode_locals(&blob, &system, &resolver),
            Err(Error::UnsupportedSignature(_))
        ));
    }
}
