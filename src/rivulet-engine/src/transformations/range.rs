//! The range transformation.
//!
//! Range normally fuses into the storage source; this fallback applies when
//! the push-down cannot reach one (e.g. a range after an aggregate). Rows
//! outside the bounds are dropped and the output block is clamped to the
//! intersection of the block and range bounds.

use std::sync::Arc;

use async_trait::async_trait;

use common_error::{RivuletError, RivuletResult};
use rivulet_core::block::{Block, BlockKey};
use rivulet_core::{Bounds, Time};

use crate::builder::add_block_cols;
use crate::dataset::{Dataset, DatasetId, SharedError};
use crate::transformation::Transformation;
use crate::transformations::FinishTracker;

/// Restricts rows to a time range.
pub struct RangeTransformation {
    d: Dataset,
    bounds: Bounds,
    tracker: FinishTracker,
}

impl RangeTransformation {
    /// Create a range transformation over resolved bounds.
    pub fn new(d: Dataset, bounds: Bounds) -> Self {
        Self {
            d,
            bounds,
            tracker: FinishTracker::default(),
        }
    }
}

#[async_trait]
impl Transformation for RangeTransformation {
    async fn process(&mut self, _parent: DatasetId, block: Arc<dyn Block>) -> RivuletResult<()> {
        let clamped = Bounds::new(
            self.bounds.start.max(block.bounds().start),
            self.bounds.stop.min(block.bounds().stop),
        );
        if clamped.is_empty() {
            return Ok(());
        }

        let bounds = self.bounds;
        let (builder, is_new) = self
            .d
            .cache()
            .builder_for(clamped, block.tags().clone());
        if is_new {
            add_block_cols(&*block, builder);
        }

        let mut append_err: Option<RivuletError> = None;
        {
            let mut times = block.times();
            times
                .do_time(&mut |ts, rr| {
                    for (i, t) in ts.iter().enumerate() {
                        if append_err.is_some() {
                            return;
                        }
                        if !bounds.contains(*t) {
                            continue;
                        }
                        if let Err(e) = builder.append_row(rr, i) {
                            append_err = Some(e);
                        }
                    }
                })
                .await?;
        }
        match append_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn retract_block(&mut self, _parent: DatasetId, key: BlockKey) -> RivuletResult<()> {
        self.d.retract_block(key).await
    }

    async fn update_watermark(&mut self, parent: DatasetId, t: Time) -> RivuletResult<()> {
        self.d.update_watermark(parent, t).await
    }

    async fn update_processing_time(&mut self, _parent: DatasetId, t: Time) -> RivuletResult<()> {
        self.d.update_processing_time(t).await
    }

    async fn finish(&mut self, parent: DatasetId, err: Option<SharedError>) {
        if err.is_some() || self.tracker.record(parent) {
            self.d.finish(err).await;
        }
    }

    fn set_parents(&mut self, parents: Vec<DatasetId>) {
        self.tracker.set_parents(parents);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{literal_block, run_transformation, rows_of};
    use rivulet_core::block::ColMeta;
    use rivulet_core::{DataType, Value};

    #[tokio::test]
    async fn test_range_drops_rows_outside_bounds() {
        let block = literal_block(
            Bounds::new(Time(0), Time(100)),
            vec![ColMeta::time(), ColMeta::value(DataType::Float)],
            vec![
                vec![Value::Time(Time(5)), Value::Float(1.0)],
                vec![Value::Time(Time(50)), Value::Float(2.0)],
                vec![Value::Time(Time(95)), Value::Float(3.0)],
            ],
        );
        let out = run_transformation(
            |d| {
                Box::new(RangeTransformation::new(
                    d,
                    Bounds::new(Time(10), Time(90)),
                ))
            },
            vec![block],
        )
        .await
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bounds(), Bounds::new(Time(10), Time(90)));
        assert_eq!(
            rows_of(&out[0]),
            vec![vec![Value::Time(Time(50)), Value::Float(2.0)]]
        );
    }

    #[tokio::test]
    async fn test_disjoint_bounds_emit_nothing() {
        let block = literal_block(
            Bounds::new(Time(0), Time(10)),
            vec![ColMeta::time(), ColMeta::value(DataType::Float)],
            vec![vec![Value::Time(Time(5)), Value::Float(1.0)]],
        );
        let out = run_transformation(
            |d| {
                Box::new(RangeTransformation::new(
                    d,
                    Bounds::new(Time(100), Time(200)),
                ))
            },
            vec![block],
        )
        .await
        .unwrap();
        assert!(out.is_empty());
    }
}
