//! Dynacall - call C functions in shared libraries at runtime
//!
//! This library provides:
//! - Type descriptions with C layout rules (primitives, arrays, structs, unions, pointers)
//! - Typed views over native memory
//! - Conversion between Rust-side values and native representations
//! - Library loading and signature binding
//! - Synchronous and worker-pool calls with single completion delivery
//! - Native-callable callbacks backed by Rust closures
//!
//! # Example
//!
//! ```no_run
//! use dynacall::{Library, LibraryOptions, SignatureMap, Value};
//!
//! let signatures = SignatureMap::new()
//!     .with("labs", "long", ["long"])
//!     .with("strlen", "size_t", ["char*"]);
//! let libc = Library::load("libc.so.6", &signatures, LibraryOptions::default()).unwrap();
//!
//! assert_eq!(libc.call("labs", &[Value::from(-7)]).unwrap(), 7);
//!
//! let strlen = libc.func("strlen").unwrap();
//! let len = strlen.call_promise(&[Value::from("hello")]).wait().unwrap();
//! assert_eq!(len, 5);
//!
//! libc.release().unwrap();
//! ```

/// Dynacall version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

mod abi;
mod marshal;

pub mod callback;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod library;
pub mod reference;
pub mod types;
pub mod value;

// Re-export commonly used types
pub use callback::Callback;
pub use config::{ConfigError, ConfigLoader, DynacallConfig};
pub use dispatch::{block_on, pending_completions, run_until_idle, CallFuture, ForeignFunction, Invocation, JobStatus};
pub use error::{Error, LinkError, MarshalError, Result, RuntimeError, TypeError};
pub use library::{
    DynamicLibrary, ErrorConvention, Library, LibraryOptions, NativeImage, ReleasePolicy, Signature, SignatureMap,
    SymbolTable,
};
pub use reference::{read_c_string, write_c_string, Reference};
pub use types::{Type, TypeRegistry, TypeSpec};
pub use value::{Pointer, Value};
