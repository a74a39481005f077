//! The storage source.
//!
//! Drives a storage read and forwards each block to its dataset. The block
//! iterator's done handshake couples frame consumption to the downstream
//! processing rate, so the source never buffers the stream.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use common_error::{RivuletError, RivuletResult};
use rivulet_plan::FromProcedureSpec;
use rivulet_storage::{ReadSpec, StorageReader};

use crate::block::materialize;
use crate::dataset::Dataset;
use crate::exec::ExecutionContext;
use crate::transformation::Source;

/// Pulls framed columnar data from the storage service.
pub struct StorageSource {
    spec: FromProcedureSpec,
    reader: Arc<dyn StorageReader>,
    dataset: Dataset,
}

impl StorageSource {
    /// Create a storage source for a `from` procedure.
    pub fn new(spec: FromProcedureSpec, reader: Arc<dyn StorageReader>, dataset: Dataset) -> Self {
        Self {
            spec,
            reader,
            dataset,
        }
    }

    async fn run_inner(&mut self, ctx: &ExecutionContext) -> RivuletResult<()> {
        let bounds = if self.spec.bounds_set {
            self.spec.bounds.resolve(ctx.now)
        } else {
            ctx.bounds
        };
        let read_spec = ReadSpec {
            database: self.spec.database.clone(),
            predicate: self.spec.filter.clone(),
            limit: self.spec.limit_set.then_some(self.spec.points_limit),
            descending: self.spec.descending,
        };
        debug!(database = %read_spec.database, %bounds, "storage source starting");

        let mut iter = self.reader.read(read_spec, bounds.start, bounds.stop).await?;
        // A storage block admits one reader; with several subscribers the
        // block is materialized first so each gets its own copy.
        let fan_out = self.dataset.output_count() > 1;

        let mut cancel = ctx.cancel.clone();
        loop {
            let block = tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return Err(RivuletError::cancelled("query cancelled"));
                    }
                    continue;
                }
                block = iter.next_block() => block?,
            };
            let Some(block) = block else {
                break;
            };
            if fan_out {
                let copy = materialize(&*block, &ctx.allocator).await?;
                self.dataset.process_block(Arc::new(copy)).await?;
            } else {
                self.dataset.process_block(block).await?;
            }
        }

        let id = self.dataset.id();
        self.dataset.update_watermark(id, bounds.stop).await?;
        Ok(())
    }
}

#[async_trait]
impl Source for StorageSource {
    async fn run(&mut self, ctx: &ExecutionContext) {
        match self.run_inner(ctx).await {
            Ok(()) => self.dataset.finish(None).await,
            Err(e) => self.dataset.finish(Some(Arc::new(e))).await,
        }
    }
}
