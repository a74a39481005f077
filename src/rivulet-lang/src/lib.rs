//! Query language front end for Rivulet.
//!
//! The surface parser is out of scope; this crate consumes an [`ast::Program`]
//! and lowers it into a [`rivulet_core::QuerySpec`]. Top-level functions and
//! chaining methods are looked up in process-wide registries that are
//! populated once at startup.

#![forbid(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod ast;
mod arguments;
mod builtins;
mod eval;
mod registry;
mod value;

pub use arguments::Arguments;
pub use eval::{evaluate, EvalContext};
pub use registry::{ensure_builtins, register_function, register_method, CreateOperationSpec};
pub use value::{Array, CallChain, Map, Value, ValueKind};
