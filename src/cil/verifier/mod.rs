//! Evaluation-stack verification
//!
//! For any specific instruction inside a method body, the operand stack should have the same
//! shape regardless of which control flow was used to reach that instruction: although the
//! values on the stack may obviously differ between runs, the types and their order cannot.
//! Tracking those shapes statically is what lets the assembler reject an unsound body at the
//! moment it is being built instead of at load time.
//!
//! Verifying straight-line code is simple (see [`mutate`]): every instruction family pops
//! operands of known categories and pushes a known result. Things get more interesting when an
//! instruction can be reached from multiple locations: the shapes from the different source
//! locations must be reconciled (see [`merge_types`]), which can produce descriptors naming a
//! base class plus a set of interfaces when no single concrete type covers both paths. Shape
//! reconciliation converges by fixed-point iteration over the whole body (see [`verify_body`]).

mod stack;
mod types;

pub use stack::*;
pub use types::*;
