//! Assembler, verifier, and binary codec for CIL method bodies
//!
//! See [`cil`] for the interesting parts: building a method body instruction by instruction
//! with incremental evaluation-stack verification, and encoding/decoding the exact byte layout
//! a CLI runtime loads.

pub mod cil;
mod util;

pub use util::{Offset, OffsetVec, RefId, Width};
