use super::instruction::Label;
use std::fmt;
use std::io;

/// Errors surfaced while building, verifying, encoding, or decoding a method body
///
/// All of these are programmer or input errors: none are transient and none are retried. An error
/// aborts the in-progress assembly or parse as a whole; callers are expected to discard the
/// builder or the partially decoded body.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),

    /// An instruction violated the evaluation stack typing rules
    ///
    /// Carries a rendering of the instruction stream constructed so far, so the caller can see
    /// exactly where the violation happened.
    Verifier {
        instruction: String,
        listing: String,
        kind: VerifierErrorKind,
    },

    /// Two paths reach the same label with irreconcilable stack shapes
    InconsistentMerge {
        label: Label,
        first: String,
        second: String,
        listing: String,
    },

    /// Labels referenced by a branch but never marked before sealing
    UnmarkedLabels(Vec<Label>),

    /// A label was marked twice
    DuplicateMark(Label),

    /// The final instruction of a sealed body must be an unconditional terminator
    MissingTerminator,

    /// A try/handler region was opened, closed, or nested in a way that makes no sense
    MalformedRegion(&'static str),

    /// Decode-time error: truncated stream, unknown opcode, or an operand that violates the
    /// instruction's declared shape. Also raised on the encode side when a short-form branch
    /// displacement cannot represent its target.
    MalformedEncoding { offset: usize, message: String },

    /// The token resolver could not produce a token or a reference
    UnresolvedReference(String),

    /// A local-variable signature uses an element type this codec does not understand
    UnsupportedSignature(String),
}

/// The specific stack-typing rule an instruction violated
#[derive(Debug)]
pub enum VerifierErrorKind {
    /// Pop from an empty evaluation stack
    StackUnderflow,

    /// Operand category or assignability violation
    TypeMismatch { expected: String, found: String },

    /// Two operands whose categories cannot be compared or combined
    NotComparable { left: String, right: String },

    /// The evaluation stack must be empty at this instruction
    StackNotEmpty(usize),

    /// Argument or local index out of range
    InvalidVariable(u16),

    /// The operand reference does not fit the instruction (eg. `callvirt` on a static method)
    BadOperand(&'static str),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {}", err),
            Error::Verifier {
                instruction,
                listing,
                kind,
            } => {
                write!(f, "{} at `{}`", kind, instruction)?;
                if !listing.is_empty() {
                    write!(f, "\nmethod so far:\n{}", listing)?;
                }
                Ok(())
            }
            Error::InconsistentMerge {
                label,
                first,
                second,
                listing,
            } => {
                write!(
                    f,
                    "inconsistent stack shapes at {:?}: {} vs {}",
                    label, first, second
                )?;
                if !listing.is_empty() {
                    write!(f, "\nmethod so far:\n{}", listing)?;
                }
                Ok(())
            }
            Error::UnmarkedLabels(labels) => {
                write!(f, "labels referenced but never marked: {:?}", labels)
            }
            Error::DuplicateMark(label) => write!(f, "label {:?} marked twice", label),
            Error::MissingTerminator => {
                write!(f, "method body does not end in an unconditional terminator")
            }
            Error::MalformedRegion(what) => {
                write!(f, "malformed exception region: {}", what)
            }
            Error::MalformedEncoding { offset, message } => {
                write!(f, "malformed encoding at offset {}: {}", offset, message)
            }
            Error::UnresolvedReference(what) => write!(f, "unresolved reference: {}", what),
            Error::UnsupportedSignature(what) => write!(f, "unsupported signature: {}", what),
        }
    }
}

impl fmt::Display for VerifierErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifierErrorKind::StackUnderflow => write!(f, "evaluation stack underflow"),
            VerifierErrorKind::TypeMismatch { expected, found } => {
                write!(f, "type mismatch: expected {}, found {}", expected, found)
            }
            VerifierErrorKind::NotComparable { left, right } => {
                write!(f, "operands not comparable: {} vs {}", left, right)
            }
            VerifierErrorKind::StackNotEmpty(depth) => {
                write!(f, "evaluation stack should be empty but holds {} values", depth)
            }
            VerifierErrorKind::InvalidVariable(index) => {
                write!(f, "argument or local index {} out of range", index)
            }
            VerifierErrorKind::BadOperand(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {}
