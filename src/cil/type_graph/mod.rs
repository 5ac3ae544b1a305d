//! Tracks the relationships between the types a method body refers to
//!
//! The assembler does not own a metadata store, but the verifier still needs to answer subtype
//! questions ("is this object reference assignable to that parameter?") and the merge step needs
//! to find common supertypes. Callers describe the relevant slice of their type system in this
//! graph once, and every method built against it shares the same arena-allocated nodes. Node
//! identity is pointer identity ([`RefId`]), which keeps lookups cheap and makes two references
//! to the same type trivially equal.

use super::signature::{CilType, MethodSig};
use crate::util::RefId;
use elsa::map::FrozenMap;
use elsa::FrozenVec;
use std::fmt;
use std::fmt::Debug;
use typed_arena::Arena;

mod assignable;
mod system_types;

pub use assignable::*;
pub use system_types::*;

/// Identity of a type in the graph
pub type TypeId<'g> = RefId<'g, TypeData<'g>>;

/// Identity of a method in the graph
pub type MethodId<'g> = RefId<'g, MethodData<'g>>;

/// Identity of a field in the graph
pub type FieldId<'g> = RefId<'g, FieldData<'g>>;

pub struct TypeGraphArenas<'g> {
    type_arena: Arena<TypeData<'g>>,
    method_arena: Arena<MethodData<'g>>,
    field_arena: Arena<FieldData<'g>>,
}

impl<'g> TypeGraphArenas<'g> {
    pub fn new() -> Self {
        TypeGraphArenas {
            type_arena: Arena::new(),
            method_arena: Arena::new(),
            field_arena: Arena::new(),
        }
    }
}

impl<'g> Default for TypeGraphArenas<'g> {
    fn default() -> Self {
        TypeGraphArenas::new()
    }
}

pub struct TypeGraph<'g> {
    arenas: &'g TypeGraphArenas<'g>,
    types: FrozenMap<&'g str, &'g TypeData<'g>>,
}

impl<'g> TypeGraph<'g> {
    /// New empty graph
    pub fn new(arenas: &'g TypeGraphArenas<'g>) -> Self {
        TypeGraph {
            arenas,
            types: FrozenMap::new(),
        }
    }

    /// Add a new type to the graph
    pub fn add_type(&self, data: TypeData<'g>) -> TypeId<'g> {
        let data = &*self.arenas.type_arena.alloc(data);
        self.types.insert(data.name.as_str(), data);
        RefId(data)
    }

    /// Add a method to the graph and to its owning type
    pub fn add_method(&self, method: MethodData<'g>) -> MethodId<'g> {
        let data = &*self.arenas.method_arena.alloc(method);
        data.owner.methods.push(data);
        RefId(data)
    }

    /// Add a field to the graph and to its owning type
    pub fn add_field(&self, field: FieldData<'g>) -> FieldId<'g> {
        let data = &*self.arenas.field_arena.alloc(field);
        data.owner.fields.push(data);
        RefId(data)
    }

    pub fn lookup_type(&'g self, name: &str) -> Option<TypeId<'g>> {
        self.types.get(name).map(RefId)
    }

    /// Add the core runtime library types to the graph
    pub fn install_system_types(&self) -> SystemTypes<'g> {
        SystemTypes::add_to_graph(self)
    }
}

/// Coarse kind of a type declaration
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TypeKind {
    Class,
    Interface,
    ValueType,
}

pub struct TypeData<'g> {
    /// Namespace-qualified name of the type
    pub name: String,

    /// Base type is only ever missing for `System.Object` itself and for interfaces
    pub base: Option<TypeId<'g>>,

    /// Interfaces implemented (or extended, for interfaces)
    pub interfaces: FrozenVec<&'g TypeData<'g>>,

    pub kind: TypeKind,

    /// Methods
    pub methods: FrozenVec<&'g MethodData<'g>>,

    /// Fields
    pub fields: FrozenVec<&'g FieldData<'g>>,
}

impl<'g> TypeData<'g> {
    pub fn class(name: impl Into<String>, base: TypeId<'g>) -> TypeData<'g> {
        TypeData {
            name: name.into(),
            base: Some(base),
            interfaces: FrozenVec::new(),
            kind: TypeKind::Class,
            methods: FrozenVec::new(),
            fields: FrozenVec::new(),
        }
    }

    pub fn interface(name: impl Into<String>) -> TypeData<'g> {
        TypeData {
            name: name.into(),
            base: None,
            interfaces: FrozenVec::new(),
            kind: TypeKind::Interface,
            methods: FrozenVec::new(),
            fields: FrozenVec::new(),
        }
    }

    pub fn value_type(name: impl Into<String>, base: TypeId<'g>) -> TypeData<'g> {
        TypeData {
            name: name.into(),
            base: Some(base),
            interfaces: FrozenVec::new(),
            kind: TypeKind::ValueType,
            methods: FrozenVec::new(),
            fields: FrozenVec::new(),
        }
    }

    pub fn is_interface(&self) -> bool {
        self.kind == TypeKind::Interface
    }

    pub fn is_value_type(&self) -> bool {
        self.kind == TypeKind::ValueType
    }

    /// Record that this type implements (or extends) an interface
    pub fn implement(&self, interface: TypeId<'g>) {
        self.interfaces.push(interface.0);
    }
}

impl<'g> PartialEq for TypeData<'g> {
    fn eq(&self, other: &TypeData<'g>) -> bool {
        self.name == other.name
    }
}

impl<'g> Eq for TypeData<'g> {}

impl<'g> Debug for TypeData<'g> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

pub struct MethodData<'g> {
    /// Owning type
    pub owner: TypeId<'g>,

    /// Name of the method (constructors are named `.ctor`)
    pub name: String,

    /// Call-site signature of the method
    pub signature: MethodSig<'g>,
}

impl<'g> MethodData<'g> {
    pub const CTOR: &'static str = ".ctor";

    pub fn is_constructor(&self) -> bool {
        self.name == Self::CTOR
    }
}

impl<'g> Debug for MethodData<'g> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "{}::{}{}",
            self.owner.name, self.name, self.signature,
        ))
    }
}

pub struct FieldData<'g> {
    /// Owning type
    pub owner: TypeId<'g>,

    /// Name of the field
    pub name: String,

    /// Declared type of the field
    pub ty: CilType<'g>,

    /// Is this a static field?
    pub is_static: bool,
}

impl<'g> Debug for FieldData<'g> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{}::{}: {}", self.owner.name, self.name, self.ty))
    }
}
