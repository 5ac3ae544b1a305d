//! Evaluation-stack type descriptors and the assignability lattice

use crate::cil::signature::{CilType, StackCategory};
use crate::cil::type_graph::{
    common_supertype, transitive_interfaces, Assignable, SystemTypes, TypeId,
};
use std::fmt;

/// How much type checking the verifier performs
///
/// Some constructions deliberately defeat high-level type safety (hand-built dispatch stubs, for
/// example) and must still be checkable for low-level correctness, so the level is
/// caller-selectable.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum StrictnessLevel {
    /// Only stack depth is tracked; no type checks at all
    None,

    /// Stack categories are checked, but object subtyping, pointer pointees, and the
    /// native-int/managed-pointer distinction are not
    LowLevel,

    /// Everything is checked
    Full,
}

/// Type descriptor of one evaluation stack slot
///
/// `Complex` arises only when merging two object references that share no single concrete type
/// but do share one or more interfaces; it is never user-constructed.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum EsType<'g> {
    Simple(CilType<'g>),
    Complex {
        base: TypeId<'g>,
        interfaces: Vec<TypeId<'g>>,
    },
    /// The literal `null` pushed by `ldnull`
    Zero,
}

impl<'g> EsType<'g> {
    /// Stack descriptor for a value loaded from a slot of declared type `ty`
    ///
    /// Sub-int32 integers widen to `int32` on the stack; everything else keeps its declared type
    /// (minus any `pinned` wrapper).
    pub fn of(ty: &CilType<'g>) -> EsType<'g> {
        let ty = ty.unpinned();
        match ty.category() {
            StackCategory::Int32 => EsType::Simple(CilType::I4),
            StackCategory::Int64 => EsType::Simple(CilType::I8),
            _ => EsType::Simple(ty.clone()),
        }
    }

    pub fn category(&self) -> StackCategory {
        match self {
            EsType::Simple(ty) => ty.category(),
            EsType::Complex { .. } => StackCategory::Object,
            EsType::Zero => StackCategory::Zero,
        }
    }

    /// Can a value of this descriptor be used where `target` is expected?
    pub fn is_assignable_to(
        &self,
        target: &CilType<'g>,
        strictness: StrictnessLevel,
        system: &SystemTypes<'g>,
    ) -> bool {
        if strictness == StrictnessLevel::None {
            return true;
        }

        let target = target.unpinned();
        let target_category = target.category();
        match self {
            EsType::Zero => !matches!(target_category, StackCategory::Struct),

            EsType::Complex { base, interfaces } => match target {
                CilType::Object(super_type) => {
                    strictness == StrictnessLevel::LowLevel
                        || base.is_assignable(super_type)
                        || interfaces
                            .iter()
                            .any(|interface| interface.is_assignable(super_type))
                }
                _ => false,
            },

            EsType::Simple(found) => {
                let found_category = found.category();
                if !category_compatible(strictness, found_category, target_category) {
                    return false;
                }
                if strictness == StrictnessLevel::LowLevel {
                    return true;
                }

                match target_category {
                    // Structs require exact type identity
                    StackCategory::Struct => found == target,

                    // A managed pointer target accepts the identical pointer type, or another
                    // pointer whose pointee categories are both value-kind
                    StackCategory::Pointer => match (found, target) {
                        (CilType::ByRef(found_pointee), CilType::ByRef(target_pointee)) => {
                            found_pointee == target_pointee
                                || (is_value_kind(found_pointee.category())
                                    && is_value_kind(target_pointee.category()))
                        }
                        _ => false,
                    },

                    // Objects go through the type-hierarchy oracle
                    StackCategory::Object => found.is_assignable(target),

                    _ => true,
                }
            }
        }
    }

    /// Decompose an object-category descriptor into a base type and interface set
    fn object_parts(&self, system: &SystemTypes<'g>) -> Option<(TypeId<'g>, Vec<TypeId<'g>>)> {
        match self {
            EsType::Simple(CilType::Object(id)) => Some((*id, vec![])),
            EsType::Simple(CilType::SzArray(_)) => Some((system.array, vec![])),
            EsType::Simple(CilType::Generic { base, .. }) if !base.is_value_type() => {
                Some((*base, vec![]))
            }
            EsType::Complex { base, interfaces } => Some((*base, interfaces.clone())),
            _ => None,
        }
    }
}

/// Value-kind categories (everything a pointer may point at interchangeably)
fn is_value_kind(category: StackCategory) -> bool {
    !matches!(
        category,
        StackCategory::Object | StackCategory::Pointer | StackCategory::Zero
    )
}

/// Cheap category-level compatibility
///
/// `Zero` goes anywhere a reference or number goes, and `int32`/`native int` are mutually
/// assignable. At [`StrictnessLevel::LowLevel`] the native-int/managed-pointer distinction is
/// also waived.
pub fn category_compatible(
    strictness: StrictnessLevel,
    found: StackCategory,
    want: StackCategory,
) -> bool {
    if found == want {
        return true;
    }
    match (found, want) {
        (StackCategory::Zero, target) => !matches!(target, StackCategory::Struct),
        (StackCategory::Int32, StackCategory::NativeInt)
        | (StackCategory::NativeInt, StackCategory::Int32) => true,
        (StackCategory::NativeInt, StackCategory::Pointer)
        | (StackCategory::Pointer, StackCategory::NativeInt) => {
            strictness <= StrictnessLevel::LowLevel
        }
        _ => false,
    }
}

/// Why two descriptors could not be merged
pub struct MergeConflict {
    pub first: String,
    pub second: String,
}

/// Reconcile two descriptors meeting at the same label
///
/// Identical descriptors are a no-op; `Zero` defers to the other side; same-category numeric
/// slots canonicalize; object slots compute a common supertype (which is where [`EsType::Complex`]
/// comes from). A category mismatch is a hard conflict.
pub fn merge_types<'g>(
    first: &EsType<'g>,
    second: &EsType<'g>,
    strictness: StrictnessLevel,
    system: &SystemTypes<'g>,
) -> Result<EsType<'g>, MergeConflict> {
    if first == second {
        return Ok(first.clone());
    }
    if strictness == StrictnessLevel::None {
        return Ok(first.clone());
    }

    let conflict = || MergeConflict {
        first: first.to_string(),
        second: second.to_string(),
    };

    match (first.category(), second.category()) {
        (StackCategory::Zero, other) if other != StackCategory::Struct => Ok(second.clone()),
        (other, StackCategory::Zero) if other != StackCategory::Struct => Ok(first.clone()),

        (StackCategory::Int32, StackCategory::Int32) => Ok(EsType::Simple(CilType::I4)),
        (StackCategory::Int64, StackCategory::Int64) => Ok(EsType::Simple(CilType::I8)),
        (StackCategory::NativeInt, StackCategory::NativeInt)
        | (StackCategory::NativeInt, StackCategory::Int32)
        | (StackCategory::Int32, StackCategory::NativeInt) => Ok(EsType::Simple(CilType::I)),
        (StackCategory::Float, StackCategory::Float) => Ok(EsType::Simple(CilType::R8)),

        // Pointer and struct slots merge only when identical (checked above)
        (StackCategory::Pointer, StackCategory::Pointer)
        | (StackCategory::Struct, StackCategory::Struct) => {
            if strictness == StrictnessLevel::LowLevel {
                Ok(first.clone())
            } else {
                Err(conflict())
            }
        }

        (StackCategory::Object, StackCategory::Object) => {
            if strictness == StrictnessLevel::LowLevel {
                return Ok(first.clone());
            }
            let (first_base, first_interfaces) =
                first.object_parts(system).ok_or_else(conflict)?;
            let (second_base, second_interfaces) =
                second.object_parts(system).ok_or_else(conflict)?;
            Ok(merge_objects(
                (first_base, &first_interfaces),
                (second_base, &second_interfaces),
                system,
            ))
        }

        _ => Err(conflict()),
    }
}

/// Common supertype of two object-category slots
fn merge_objects<'g>(
    (first_base, first_interfaces): (TypeId<'g>, &[TypeId<'g>]),
    (second_base, second_interfaces): (TypeId<'g>, &[TypeId<'g>]),
    system: &SystemTypes<'g>,
) -> EsType<'g> {
    let (base, mut shared) = common_supertype(first_base, second_base, system.object);

    // Interfaces carried by a `Complex` side participate too: keep any of them implemented by
    // the other side as well.
    if !first_interfaces.is_empty() || !second_interfaces.is_empty() {
        let implements = |base: TypeId<'g>, extra: &[TypeId<'g>], interface: TypeId<'g>| {
            extra.contains(&interface)
                || base == interface
                || transitive_interfaces(base).contains(&interface)
                || extra
                    .iter()
                    .any(|e| transitive_interfaces(*e).contains(&interface))
        };
        for interface in first_interfaces.iter().chain(second_interfaces.iter()) {
            if shared.contains(interface) {
                continue;
            }
            if implements(first_base, first_interfaces, *interface)
                && implements(second_base, second_interfaces, *interface)
            {
                shared.push(*interface);
            }
        }
        shared.sort_by(|a, b| a.name.cmp(&b.name));
        shared.dedup();
    }

    if shared.is_empty() {
        EsType::Simple(CilType::Object(base))
    } else {
        EsType::Complex {
            base,
            interfaces: shared,
        }
    }
}

impl<'g> fmt::Display for EsType<'g> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EsType::Simple(ty) => write!(f, "{}", ty),
            EsType::Complex { base, interfaces } => {
                write!(f, "complex({}", base.name)?;
                for interface in interfaces {
                    write!(f, " + {}", interface.name)?;
                }
                write!(f, ")")
            }
            EsType::Zero => f.write_str("null"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cil::type_graph::{TypeData, TypeGraph, TypeGraphArenas};

    #[test]
    fn zero_is_widely_assignable() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();
        let point = graph.add_type(TypeData::value_type("Point", system.value_type));

        let zero = EsType::Zero;
        let strict = StrictnessLevel::Full;
        assert!(zero.is_assignable_to(&CilType::I4, strict, &system));
        assert!(zero.is_assignable_to(&CilType::I8, strict, &system));
        assert!(zero.is_assignable_to(&CilType::Object(system.string), strict, &system));
        assert!(zero.is_assignable_to(&CilType::ByRef(Box::new(CilType::I4)), strict, &system));
        assert!(!zero.is_assignable_to(&CilType::ValueType(point), strict, &system));
    }

    #[test]
    fn struct_targets_require_identity() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();
        let point = graph.add_type(TypeData::value_type("Point", system.value_type));
        let size = graph.add_type(TypeData::value_type("Size", system.value_type));

        let point_value = EsType::Simple(CilType::ValueType(point));
        let strict = StrictnessLevel::Full;
        assert!(point_value.is_assignable_to(&CilType::ValueType(point), strict, &system));
        assert!(!point_value.is_assignable_to(&CilType::ValueType(size), strict, &system));
    }

    #[test]
    fn pointer_targets_accept_value_kind_pointees() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();

        let int_ref = EsType::Simple(CilType::ByRef(Box::new(CilType::I4)));
        let strict = StrictnessLevel::Full;
        assert!(int_ref.is_assignable_to(&CilType::ByRef(Box::new(CilType::I4)), strict, &system));
        assert!(int_ref.is_assignable_to(&CilType::ByRef(Box::new(CilType::I8)), strict, &system));
        assert!(!int_ref.is_assignable_to(
            &CilType::ByRef(Box::new(CilType::Object(system.string))),
            strict,
            &system
        ));
        assert!(!int_ref.is_assignable_to(&CilType::I4, strict, &system));
    }

    #[test]
    fn low_level_waives_object_identity() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();
        let widget = graph.add_type(TypeData::class("Widget", system.object));

        let string_value = EsType::Simple(CilType::Object(system.string));
        assert!(!string_value.is_assignable_to(
            &CilType::Object(widget),
            StrictnessLevel::Full,
            &system
        ));
        assert!(string_value.is_assignable_to(
            &CilType::Object(widget),
            StrictnessLevel::LowLevel,
            &system
        ));
    }

    #[test]
    fn merging_siblings_finds_common_base() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();

        let animal = graph.add_type(TypeData::class("Animal", system.object));
        let cat = graph.add_type(TypeData::class("Cat", animal));
        let dog = graph.add_type(TypeData::class("Dog", animal));

        let merged = merge_types(
            &EsType::Simple(CilType::Object(cat)),
            &EsType::Simple(CilType::Object(dog)),
            StrictnessLevel::Full,
            &system,
        )
        .unwrap_or_else(|_| panic!("siblings should merge"));
        assert_eq!(merged, EsType::Simple(CilType::Object(animal)));
    }

    #[test]
    fn merging_interface_siblings_goes_complex() {
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

        let merged = merge_types(
            &EsType::Simple(CilType::Object(first)),
            &EsType::Simple(CilType::Object(second)),
            StrictnessLevel::Full,
            &system,
        )
        .unwrap_or_else(|_| panic!("interface siblings should merge"));
        assert_eq!(
            merged,
            EsType::Complex {
                base: system.object,
                interfaces: vec![x],
            }
        );
    }

    #[test]
    fn merge_is_commutative() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();

        let x = graph.add_type(TypeData::interface("IX"));
        let first = graph.add_type(TypeData::class("First", system.object));
        first.implement(x);
        let second = graph.add_type(TypeData::class("Second", system.object));
        second.implement(x);

        let a = EsType::Simple(CilType::Object(first));
        let b = EsType::Simple(CilType::Object(second));
        let ab = merge_types(&a, &b, StrictnessLevel::Full, &system)
            .unwrap_or_else(|_| panic!("merge should succeed"));
        let ba = merge_types(&b, &a, StrictnessLevel::Full, &system)
            .unwrap_or_else(|_| panic!("merge should succeed"));
        assert_eq!(ab, ba);
    }

    #[test]
    fn category_mismatch_is_a_conflict() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();

        assert!(merge_types(
            &EsType::Simple(CilType::I4),
            &EsType::Simple(CilType::R4),
            StrictnessLevel::Full,
            &system,
        )
        .is_err());
    }
}
