//! Core types for Rivulet.
//!
//! This crate defines the vocabulary shared by every layer of the engine:
//! nanosecond time, runtime values and their kinds, predicate expression
//! trees, and the operation graph produced by query evaluation.

#![forbid(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod block;
pub mod expr;
pub mod query;
pub mod time;
pub mod types;

pub use block::{
    Block, BlockIterator, BlockKey, ColMeta, Row, RowReader, Tags, ValueIterator,
};
pub use expr::{Expression, Node, Operator};
pub use query::{Edge, Operation, OperationId, OperationSpec, QuerySpec};
pub use time::{Bounds, BoundsSpec, Duration, Time, TimeSpec};
pub use types::{DataType, Value, VALUE_DATA_TYPES};
