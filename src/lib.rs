//! Rivulet - streaming time-series query engine.
//!
//! Rivulet accepts a functional, method-chained query language, compiles it
//! into a DAG of operations, optimizes the DAG by fusing selection-like
//! operations into the storage source, and executes it against a remote
//! columnar storage service, returning streams of time-windowed blocks.

#![forbid(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

// Re-export core crates
pub use common_config as config;
pub use common_error as error;
pub use rivulet_core as core;
pub use rivulet_engine as engine;
pub use rivulet_lang as lang;
pub use rivulet_plan as plan;
pub use rivulet_storage as storage;

use std::sync::Arc;

use common_config::RivuletConfig;
use common_error::RivuletResult;
use rivulet_core::Time;
use rivulet_engine::{ExecutionResult, Executor};
use rivulet_lang::ast::Program;
use rivulet_plan::{LogicalPlanner, PhysicalPlanner, PlanSpec};
use rivulet_storage::{RpcStorageReader, StorageReader};

/// Rivulet version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Register the builtin query functions. Called implicitly by evaluation;
/// embedders may call it eagerly at startup.
pub fn init() {
    rivulet_lang::ensure_builtins();
}

/// The full query pipeline: evaluate, plan, execute.
pub struct QueryEngine {
    config: RivuletConfig,
    logical: LogicalPlanner,
    physical: PhysicalPlanner,
    executor: Executor,
}

impl QueryEngine {
    /// Create an engine from configuration.
    pub fn new(config: RivuletConfig) -> Self {
        init();
        let executor = Executor::with_config(config.execution.clone());
        Self {
            config,
            logical: LogicalPlanner::new(),
            physical: PhysicalPlanner::new(),
            executor,
        }
    }

    /// A storage reader for the configured service address.
    pub fn storage_reader(&self) -> Arc<dyn StorageReader> {
        Arc::new(
            RpcStorageReader::new(self.config.storage.address.clone()).with_connect_timeout(
                std::time::Duration::from_millis(self.config.storage.connect_timeout_ms),
            ),
        )
    }

    /// Compile a program into a physical plan.
    pub fn plan(&self, program: &Program) -> RivuletResult<PlanSpec> {
        let query = rivulet_lang::evaluate(program)?;
        let logical = self.logical.plan(&query)?;
        self.physical.plan(&logical)
    }

    /// Plan and execute a program against a storage reader.
    pub async fn query(
        &self,
        program: &Program,
        reader: Arc<dyn StorageReader>,
        now: Time,
    ) -> RivuletResult<ExecutionResult> {
        let plan = self.plan(program)?;
        self.executor.execute(&plan, reader, now).await
    }

    /// Plan and execute a program synchronously.
    pub fn query_sync(
        &self,
        program: &Program,
        reader: Arc<dyn StorageReader>,
        now: Time,
    ) -> RivuletResult<ExecutionResult> {
        common_runtime::block_on(self.query(program, reader, now))?
    }
}

impl Default for QueryEngine {
    fn default() -> Self {
        Self::new(RivuletConfig::default())
    }
}
