use super::{TypeData, TypeGraph, TypeId};
use crate::cil::signature::CilType;

/// Core runtime library types
///
/// Note: this isn't just a convenience - the verifier that runs while instructions are emitted
/// needs to reason about some core types (`ldstr` produces a `System.String`, `box` produces the
/// box of a primitive, `ldtoken` produces a runtime handle struct, and so on).
pub struct SystemTypes<'g> {
    pub object: TypeId<'g>,
    pub string: TypeId<'g>,
    pub array: TypeId<'g>,
    pub value_type: TypeId<'g>,
    pub exception: TypeId<'g>,

    pub boolean: TypeId<'g>,
    pub char: TypeId<'g>,
    pub sbyte: TypeId<'g>,
    pub byte: TypeId<'g>,
    pub int16: TypeId<'g>,
    pub uint16: TypeId<'g>,
    pub int32: TypeId<'g>,
    pub uint32: TypeId<'g>,
    pub int64: TypeId<'g>,
    pub uint64: TypeId<'g>,
    pub single: TypeId<'g>,
    pub double: TypeId<'g>,
    pub intptr: TypeId<'g>,
    pub uintptr: TypeId<'g>,

    pub type_handle: TypeId<'g>,
    pub method_handle: TypeId<'g>,
    pub field_handle: TypeId<'g>,
}

impl<'g> SystemTypes<'g> {
    pub fn add_to_graph(graph: &TypeGraph<'g>) -> SystemTypes<'g> {
        let object = graph.add_type(TypeData {
            name: "System.Object".to_string(),
            base: None,
            interfaces: elsa::FrozenVec::new(),
            kind: super::TypeKind::Class,
            methods: elsa::FrozenVec::new(),
            fields: elsa::FrozenVec::new(),
        });

        let string = graph.add_type(TypeData::class("System.String", object));
        let array = graph.add_type(TypeData::class("System.Array", object));
        let value_type = graph.add_type(TypeData::class("System.ValueType", object));
        let exception = graph.add_type(TypeData::class("System.Exception", object));

        let boolean = graph.add_type(TypeData::value_type("System.Boolean", value_type));
        let char = graph.add_type(TypeData::value_type("System.Char", value_type));
        let sbyte = graph.add_type(TypeData::value_type("System.SByte", value_type));
        let byte = graph.add_type(TypeData::value_type("System.Byte", value_type));
        let int16 = graph.add_type(TypeData::value_type("System.Int16", value_type));
        let uint16 = graph.add_type(TypeData::value_type("System.UInt16", value_type));
        let int32 = graph.add_type(TypeData::value_type("System.Int32", value_type));
        let uint32 = graph.add_type(TypeData::value_type("System.UInt32", value_type));
        let int64 = graph.add_type(TypeData::value_type("System.Int64", value_type));
        let uint64 = graph.add_type(TypeData::value_type("System.UInt64", value_type));
        let single = graph.add_type(TypeData::value_type("System.Single", value_type));
        let double = graph.add_type(TypeData::value_type("System.Double", value_type));
        let intptr = graph.add_type(TypeData::value_type("System.IntPtr", value_type));
        let uintptr = graph.add_type(TypeData::value_type("System.UIntPtr", value_type));

        let type_handle =
            graph.add_type(TypeData::value_type("System.RuntimeTypeHandle", value_type));
        let method_handle = graph.add_type(TypeData::value_type(
            "System.RuntimeMethodHandle",
            value_type,
        ));
        let field_handle =
            graph.add_type(TypeData::value_type("System.RuntimeFieldHandle", value_type));

        SystemTypes {
            object,
            string,
            array,
            value_type,
            exception,
            boolean,
            char,
            sbyte,
            byte,
            int16,
            uint16,
            int32,
            uint32,
            int64,
            uint64,
            single,
            double,
            intptr,
            uintptr,
            type_handle,
            method_handle,
            field_handle,
        }
    }

    /// Type a value gets boxed as, if boxing it makes sense
    ///
    /// Boxing a reference type is a no-op, so those return `None` along with the types that
    /// cannot be boxed at all.
    pub fn box_of(&self, ty: &CilType<'g>) -> Option<TypeId<'g>> {
        Some(match ty {
            CilType::Bool => self.boolean,
            CilType::Char => self.char,
            CilType::I1 => self.sbyte,
            CilType::U1 => self.byte,
            CilType::I2 => self.int16,
            CilType::U2 => self.uint16,
            CilType::I4 => self.int32,
            CilType::U4 => self.uint32,
            CilType::I8 => self.int64,
            CilType::U8 => self.uint64,
            CilType::R4 => self.single,
            CilType::R8 => self.double,
            CilType::I => self.intptr,
            CilType::U => self.uintptr,
            CilType::ValueType(id) => *id,
            _ => return None,
        })
    }
}
