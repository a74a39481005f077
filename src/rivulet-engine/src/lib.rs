//! Streaming execution engine for Rivulet.
//!
//! The executor instantiates one dataset per procedure of a physical plan,
//! wires parents to children over bounded channels, and drives sources and
//! transformations on their own workers. Blocks flow forward through builder
//! caches; watermarks advance so downstream windows and aggregators know
//! when to finalize.

#![forbid(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

mod allocator;
pub mod block;
mod builder;
mod cache;
pub mod compile;
mod dataset;
mod exec;
mod source;
pub mod testing;
mod transformation;
pub mod transformations;

pub use allocator::Allocator;
pub use block::{materialize, Column, MemBlock, MemRowReader};
pub use builder::{add_block_cols, BlockBuilder};
pub use cache::BlockBuilderCache;
pub use compile::{
    compile, compile_per_kind, object_properties, CompiledExpression, ObjectProperty, Scope,
};
pub use dataset::{Dataset, DatasetId, Envelope, Message, SharedError};
pub use exec::{CancellationHandle, ExecutionContext, ExecutionResult, Executor, ResultSet};
pub use source::StorageSource;
pub use transformation::{build_transformation, Source, Transformation};
