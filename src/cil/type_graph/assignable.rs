use super::TypeId;
use crate::cil::signature::{CilType, StackCategory};
use crate::util::RefId;
use std::collections::HashSet;

/// Subtyping relationship between types
pub trait Assignable {
    /// Is the first type assignable to the second?
    fn is_assignable(&self, super_type: &Self) -> bool;
}

/// This does a traversal of super types in the type graph to determine assignability
impl<'g> Assignable for TypeId<'g> {
    fn is_assignable(&self, super_type: &TypeId<'g>) -> bool {
        let mut supertypes_to_visit: Vec<TypeId<'g>> = vec![*self];
        let mut dont_revisit: HashSet<TypeId<'g>> = HashSet::new();
        dont_revisit.insert(*self);

        // Optimization: if the super type is a class, then skip visiting interfaces
        let super_is_class: bool = !super_type.is_interface();

        while let Some(type_data) = supertypes_to_visit.pop() {
            if type_data == *super_type {
                return true;
            }
            let type_data = type_data.0;

            // Enqueue next types to visit
            if let Some(base) = type_data.base {
                if dont_revisit.insert(base) {
                    supertypes_to_visit.push(base);
                }
            }
            if !super_is_class {
                for interface in &type_data.interfaces {
                    let interface = RefId(interface);
                    if dont_revisit.insert(interface) {
                        supertypes_to_visit.push(interface);
                    }
                }
            }
        }

        false
    }
}

/// Assignability between declared types
///
/// Primitives and value types require identity; object references follow super type edges;
/// single-dimensional arrays get the runtime's (unsound) element covariance.
impl<'g> Assignable for CilType<'g> {
    fn is_assignable(&self, super_type: &CilType<'g>) -> bool {
        match (self, super_type) {
            // Arrays have a small, finite set of special super types
            (CilType::SzArray(_), CilType::Object(object_type)) => {
                is_array_super_type(&object_type.name)
            }

            // Covariance of arrays over object-kind elements
            (CilType::SzArray(elem1), CilType::SzArray(elem2)) => {
                if elem1 == elem2 {
                    true
                } else {
                    elem1.category() == StackCategory::Object
                        && elem2.category() == StackCategory::Object
                        && elem1.is_assignable(elem2)
                }
            }

            // Object-to-object assignability holds if there is a path through super type edges
            (CilType::Object(sub), CilType::Object(sup)) => sub.is_assignable(sup),

            // Boxed value types are still objects
            (CilType::ValueType(_), CilType::Object(_)) => false,

            (CilType::Generic { base: b1, args: a1 }, CilType::Generic { base: b2, args: a2 }) => {
                b1 == b2 && a1 == a2
            }

            _ => self == super_type,
        }
    }
}

/// Check if arrays can be assigned to a super type
///
/// This bakes in knowledge of the small, finite set of super types arrays have.
fn is_array_super_type(super_type: &str) -> bool {
    super_type == "System.Object" || super_type == "System.Array"
}

/// All interfaces a type implements, directly or through its base chain
pub fn transitive_interfaces<'g>(ty: TypeId<'g>) -> HashSet<TypeId<'g>> {
    let mut found: HashSet<TypeId<'g>> = HashSet::new();
    let mut to_visit: Vec<TypeId<'g>> = vec![ty];
    let mut visited: HashSet<TypeId<'g>> = HashSet::new();

    while let Some(current) = to_visit.pop() {
        if !visited.insert(current) {
            continue;
        }
        if current.is_interface() && current != ty {
            found.insert(current);
        }
        let data = current.0;
        if let Some(base) = data.base {
            to_visit.push(base);
        }
        for interface in &data.interfaces {
            to_visit.push(RefId(interface));
        }
    }

    found
}

/// Nearest shared base class of two object types, plus their shared interface set
///
/// The interface set is reduced: interfaces already implied by the common base are dropped, and
/// so is any interface implied by another member of the set. What remains is sorted by name so
/// merge results are deterministic. The pair is a valid common supertype; callers should not
/// depend on the exact interface set beyond that.
pub fn common_supertype<'g>(
    left: TypeId<'g>,
    right: TypeId<'g>,
    object: TypeId<'g>,
) -> (TypeId<'g>, Vec<TypeId<'g>>) {
    // Nearest shared base: walk the right chain until it hits something on the left chain.
    // Interfaces have no base chain of their own and merge through `System.Object`.
    let mut left_chain: Vec<TypeId<'g>> = vec![];
    let mut next = if left.is_interface() { left.base } else { Some(left) };
    while let Some(current) = next {
        left_chain.push(current);
        next = current.base;
    }
    left_chain.push(object);
    let left_set: HashSet<TypeId<'g>> = left_chain.iter().copied().collect();

    let mut base = object;
    let mut next = if right.is_interface() { right.base } else { Some(right) };
    while let Some(current) = next {
        if left_set.contains(&current) {
            base = current;
            break;
        }
        next = current.base;
    }

    // Shared interfaces, minus whatever the common base already implies
    let implied_by_base = transitive_interfaces(base);
    let left_interfaces = transitive_interfaces(left);
    let right_interfaces = transitive_interfaces(right);
    let mut shared: Vec<TypeId<'g>> = left_interfaces
        .intersection(&right_interfaces)
        .filter(|interface| !implied_by_base.contains(*interface))
        .copied()
        .collect();

    // Iteratively remove interfaces implied by another member of the set
    let mut index = 0;
    while index < shared.len() {
        let candidate = shared[index];
        let implied_elsewhere = shared
            .iter()
            .any(|other| *other != candidate && transitive_interfaces(*other).contains(&candidate));
        if implied_elsewhere {
            shared.remove(index);
        } else {
            index += 1;
        }
    }

    shared.sort_by(|a, b| a.name.cmp(&b.name));
    (base, shared)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cil::type_graph::{TypeData, TypeGraph, TypeGraphArenas};

    #[test]
    fn simple_classes() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();

        let animal = graph.add_type(TypeData::class("Animal", system.object));
        let cat = graph.add_type(TypeData::class("Cat", animal));

        assert!(cat.is_assignable(&cat), "Cat <: Cat");
        assert!(cat.is_assignable(&animal), "Cat <: Animal");
        assert!(cat.is_assignable(&system.object), "Cat <: System.Object");
        assert!(!animal.is_assignable(&cat), "Animal </: Cat");
        assert!(
            !system.object.is_assignable(&animal),
            "System.Object </: Animal"
        );
    }

    #[test]
    fn interfaces() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();

        let walk = graph.add_type(TypeData::interface("IWalk"));
        let run = graph.add_type(TypeData::interface("IRun"));
        run.implement(walk);

        let runner = graph.add_type(TypeData::class("Runner", system.object));
        runner.implement(run);

        assert!(runner.is_assignable(&run), "Runner <: IRun");
        assert!(runner.is_assignable(&walk), "Runner <: IWalk (via IRun)");
        assert!(!walk.is_assignable(&runner), "IWalk </: Runner");
    }

    #[test]
    fn array_covariance() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();

        let animal = graph.add_type(TypeData::class("Animal", system.object));
        let cat = graph.add_type(TypeData::class("Cat", animal));

        let cats = CilType::SzArray(Box::new(CilType::Object(cat)));
        let animals = CilType::SzArray(Box::new(CilType::Object(animal)));
        let ints = CilType::SzArray(Box::new(CilType::I4));
        let longs = CilType::SzArray(Box::new(CilType::I8));
        let object = CilType::Object(system.object);

        assert!(cats.is_assignable(&animals), "Cat[] <: Animal[]");
        assert!(!animals.is_assignable(&cats), "Animal[] </: Cat[]");
        assert!(cats.is_assignable(&object), "Cat[] <: System.Object");
        assert!(ints.is_assignable(&ints), "int32[] <: int32[]");
        assert!(!ints.is_assignable(&longs), "int32[] </: int64[]");
    }

    #[test]
    fn common_supertype_of_siblings() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();

        let animal = graph.add_type(TypeData::class("Animal", system.object));
        let cat = graph.add_type(TypeData::class("Cat", animal));
        let dog = graph.add_type(TypeData::class("Dog", animal));

        let (base, interfaces) = common_supertype(cat, dog, system.object);
        assert_eq!(base, animal);
        assert!(interfaces.is_empty());
    }

    #[test]
    fn common_supertype_keeps_shared_interfaces() {
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

        let (base, interfaces) = common_supertype(first, second, system.object);
        assert_eq!(base, system.object);
        assert_eq!(interfaces, vec![x]);
    }

    #[test]
    fn common_supertype_drops_implied_interfaces() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.install_system_types();

        let walk = graph.add_type(TypeData::interface("IWalk"));
        let run = graph.add_type(TypeData::interface("IRun"));
        run.implement(walk);

        let first = graph.add_type(TypeData::class("First", system.object));
        first.implement(run);
        let second = graph.add_type(TypeData::class("Second", system.object));
        second.implement(run);

        // IWalk is implied by IRun, so only IRun survives the reduction
        let (base, interfaces) = common_supertype(first, second, system.object);
        assert_eq!(base, system.object);
        assert_eq!(interfaces, vec![run]);
    }
}
