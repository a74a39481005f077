//! Core error types for Rivulet.

mod error;

pub use error::{GenericError, RivuletError, RivuletResult};
