//! Assemble, verify, and encode CIL method bodies
//!
//! ### Simple example
//!
//! Consider a static method adding its two `int32` arguments. Building its body, checking every
//! instruction against the evaluation stack as it is issued, and encoding the result into the
//! exact byte layout the runtime loads looks like this:
//!
//! ```
//! use cilbody::cil::*;
//!
//! # fn generate_body() -> Result<(), Error> {
//! // Set up the type graph with the core runtime library types
//! let arenas = TypeGraphArenas::new();
//! let graph = TypeGraph::new(&arenas);
//! let system = graph.install_system_types();
//!
//! // Tokens come from a metadata store; this in-memory table stands in for one
//! let resolver = InMemoryTokenTable::new();
//!
//! // int32 Add(int32, int32)
//! let signature = MethodSig::static_method(
//!     vec![CilType::I4, CilType::I4],
//!     Some(CilType::I4),
//! );
//!
//! let mut builder = BodyBuilder::new(&system, signature, None, StrictnessLevel::Full);
//! builder.push_instruction(Instruction::LdArg(0))?;
//! builder.push_instruction(Instruction::LdArg(1))?;
//! builder.push_instruction(Instruction::Binary(opcode::BinaryOp::Add))?;
//! builder.push_instruction(Instruction::Ret)?;
//!
//! // Seal the body (terminator and label checks, shape fixed point, max stack)
//! let body = builder.seal()?;
//! assert_eq!(body.max_stack, 2);
//!
//! // Encode to bytes, and parse the bytes right back
//! let bytes = bake(&body, &system, &resolver)?;
//! let decoded = read(&bytes, &system, &resolver)?;
//! assert_eq!(decoded.code.len(), body.code.len());
//! # Ok(())
//! # }
//! # generate_body().unwrap();
//! ```
//!
//! ### Where things live
//!
//!   - [`BodyBuilder`] is the construction surface: emit instructions, declare locals, mark
//!     labels, open and close exception regions, then [`BodyBuilder::seal`].
//!   - [`verifier`] holds the evaluation-stack model: the category lattice, per-instruction
//!     typing rules, and the label-merge fixed point.
//!   - [`bake`] and [`read`] are the binary codec, talking to an externally supplied
//!     [`TokenResolver`] for everything that lives outside the method body.
//!   - [`type_graph`] is the slice of the caller's type system the verifier consults for
//!     subtype questions.

mod baker;
mod binary_format;
mod body_builder;
mod errors;
mod exception;
mod instruction;
mod max_stack;
pub mod opcode;
mod reader;
pub mod signature;
mod tokens;
pub mod type_graph;
pub mod verifier;

pub use baker::bake;
pub use binary_format::{Deserialize, Serialize};
pub use body_builder::{BodyBuilder, BuiltBody, MethodBody};
pub use errors::{Error, VerifierErrorKind};
pub use exception::{ExceptionHandler, HandlerKind, SectionFlags};
pub use instruction::{CodeStream, Instruction, Label, LabelGenerator};
pub use max_stack::compute_max_stack;
pub use reader::{read, read_verified};
pub use signature::{decode_locals, encode_locals, CilType, MethodSig, StackCategory};
pub use tokens::{tables, CachingResolver, ExternalRef, InMemoryTokenTable, Token, TokenResolver};
pub use type_graph::*;
pub use verifier::{mutate, verify_body, EsType, EvalStack, MutateCx, StrictnessLevel};
