//! Process-wide function and method registries.
//!
//! Registries are populated at startup and treated as read-only during
//! evaluation. Registering the same name twice is a programming error and
//! panics.

use std::collections::HashMap;
use std::sync::{LazyLock, Once, RwLock};

use common_error::RivuletResult;
use rivulet_core::OperationSpec;

use crate::arguments::Arguments;
use crate::eval::EvalContext;

/// Constructor turning keyword arguments into an operation spec.
pub type CreateOperationSpec =
    fn(&mut Arguments, &mut EvalContext<'_>) -> RivuletResult<OperationSpec>;

static FUNCTIONS: LazyLock<RwLock<HashMap<&'static str, CreateOperationSpec>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

static METHODS: LazyLock<RwLock<HashMap<&'static str, CreateOperationSpec>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

static BUILTINS: Once = Once::new();

/// Register a new top-level function.
///
/// # Panics
///
/// Panics if `name` is already registered.
pub fn register_function(name: &'static str, ctor: CreateOperationSpec) {
    let mut map = FUNCTIONS.write().expect("function registry poisoned");
    if map.insert(name, ctor).is_some() {
        panic!("duplicate registration for function {name:?}");
    }
}

/// Register a new chaining method.
///
/// # Panics
///
/// Panics if `name` is already registered.
pub fn register_method(name: &'static str, ctor: CreateOperationSpec) {
    let mut map = METHODS.write().expect("method registry poisoned");
    if map.insert(name, ctor).is_some() {
        panic!("duplicate registration for method {name:?}");
    }
}

/// Look up a top-level function constructor.
pub fn lookup_function(name: &str) -> Option<CreateOperationSpec> {
    FUNCTIONS
        .read()
        .expect("function registry poisoned")
        .get(name)
        .copied()
}

/// Look up a chaining method constructor.
pub fn lookup_method(name: &str) -> Option<CreateOperationSpec> {
    METHODS
        .read()
        .expect("method registry poisoned")
        .get(name)
        .copied()
}

/// Register the builtin operation constructors exactly once.
pub fn ensure_builtins() {
    BUILTINS.call_once(crate::builtins::register_all);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_registered() {
        ensure_builtins();
        assert!(lookup_function("from").is_some());
        assert!(lookup_method("filter").is_some());
        assert!(lookup_method("last").is_some());
        assert!(lookup_function("nope").is_none());
        // Idempotent.
        ensure_builtins();
    }
}
