//! Error types
//!
//! Every failure surfaces as one of four families:
//! - [`LinkError`]: library or symbol resolution failed
//! - [`TypeError`]: a type or signature is malformed
//! - [`MarshalError`]: a host value does not fit its declared native type
//! - [`RuntimeError`]: the call machinery itself refused or failed
//!
//! [`Error`] unifies them for APIs that can fail in more than one way.

use thiserror::Error;

/// Library and symbol resolution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Library not found: {0}")]
    LibraryNotFound(String),

    #[error("Failed to load library '{path}': {reason}")]
    LoadFailed { path: String, reason: String },

    #[error("Symbol '{symbol}' not found in '{library}'")]
    SymbolNotFound { library: String, symbol: String },

    #[error("No function named '{0}' is bound")]
    NotBound(String),
}

/// Type construction and signature validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("Unknown type '{0}'")]
    UnknownType(String),

    #[error("Field '{0}' has zero size")]
    ZeroSizedField(String),

    #[error("Duplicate field '{0}'")]
    DuplicateField(String),

    #[error("A {0} needs at least one field")]
    EmptyComposite(&'static str),

    #[error("Type '{0}' contains itself without indirection")]
    SelfReferential(String),

    #[error("Type '{0}' has no size")]
    Unsized(String),

    #[error("Type '{0}' cannot be passed by value")]
    NotPassable(String),

    #[error("Type '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("Layout of '{0}' overflows the address space")]
    LayoutOverflow(String),

    #[error("Wrong number of arguments for '{function}': expected {expected}, got {got}")]
    ArityMismatch {
        function: String,
        expected: usize,
        got: usize,
    },
}

/// Value conversion errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MarshalError {
    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("Number {value} out of range for {target}")]
    NumberOutOfRange { value: String, target: String },

    #[error("Number {value} has a fractional part and cannot become {target}")]
    FractionalNumber { value: f64, target: String },

    #[error("Null pointer")]
    NullPointer,

    #[error("Invalid string: {0}")]
    InvalidString(String),

    #[error("Array length mismatch: expected {expected}, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("Index {index} out of bounds for array of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("Array of {0} has no known length")]
    UnknownLength(String),

    #[error("No field named '{0}'")]
    UnknownField(String),

    #[error("Access of {size} bytes at offset {offset} exceeds buffer of {extent} bytes")]
    OutOfExtent {
        offset: isize,
        size: usize,
        extent: usize,
    },
}

/// Errors raised by the call machinery rather than by conversions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("Library '{0}' has been released")]
    Released(String),

    #[error("Library '{library}' still has {pending} call(s) in flight")]
    PendingCalls { library: String, pending: usize },

    #[error("Call to '{0}' ended without a result")]
    Aborted(String),

    #[error("Worker pool unavailable: {0}")]
    WorkerPool(String),

    #[error("Event loop unavailable: {0}")]
    EventLoop(String),

    #[error("Callback failed: {0}")]
    Callback(String),

    #[error("'{function}' reported failure (os error {code})")]
    Native { function: String, code: i32 },
}

/// Any failure produced by this crate
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Result type for fallible operations
pub type Result<T> = std::result::Result<T, Error>;
