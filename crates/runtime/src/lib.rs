//! Etch runtime
//!
//! The register-based VM for compiled Etch bytecode:
//! - Value: the tagged runtime representation
//! - Heap: reference-counted cells with trial-deletion cycle collection
//! - Coroutine: cooperative state machines with register snapshots
//! - Vm: the fetch-decode-execute loop, defer machinery and FFI dispatch
//! - Context: the embedding API hosts program against

pub mod builtins;
pub mod context;
pub mod coroutine;
pub mod error;
pub mod ffi;
pub mod heap;
pub mod value;
pub mod vm;

pub use context::{Context, ContextOptions};
pub use coroutine::{CoroState, Coroutine};
pub use error::RuntimeError;
pub use heap::{GcStats, Heap};
pub use value::Value;
pub use vm::{Vm, VmOptions};

/// Name of the synthetic module initializer the compiler emits for
/// globals; executed before `main`
pub const INIT_FUNCTION: &str = "@init";
