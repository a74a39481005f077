//! The window transformation.
//!
//! Rows are assigned to aligned windows of `every` stride and `period`
//! length anchored at `start`. Output blocks are keyed by the window bounds
//! and the input block's common tags, so downstream aggregators fold per
//! window. The dataset flushes a window once the watermark passes its stop.

use std::sync::Arc;

use async_trait::async_trait;

use common_error::{RivuletError, RivuletResult};
use rivulet_core::block::{Block, BlockKey};
use rivulet_core::{Bounds, Duration, Time};

use crate::builder::add_block_cols;
use crate::dataset::{Dataset, DatasetId, SharedError};
use crate::transformation::Transformation;
use crate::transformations::FinishTracker;

/// Assigns rows to time windows.
pub struct WindowTransformation {
    d: Dataset,
    every: Duration,
    period: Duration,
    start: Time,
    tracker: FinishTracker,
}

impl WindowTransformation {
    /// Create a window transformation anchored at `start`.
    pub fn new(d: Dataset, every: Duration, period: Duration, start: Time) -> RivuletResult<Self> {
        if every.nanos() <= 0 {
            return Err(RivuletError::planning(format!(
                "window stride must be positive, got {every}"
            )));
        }
        let period = if period.nanos() <= 0 { every } else { period };
        Ok(Self {
            d,
            every,
            period,
            start,
            tracker: FinishTracker::default(),
        })
    }

    fn window_of(&self, t: Time) -> Bounds {
        let delta = (t - self.start).nanos();
        let n = delta.div_euclid(self.every.nanos());
        let ws = self.start + Duration::nanoseconds(n * self.every.nanos());
        Bounds::new(ws, ws + self.period)
    }
}

#[async_trait]
impl Transformation for WindowTransformation {
    async fn process(&mut self, _parent: DatasetId, block: Arc<dyn Block>) -> RivuletResult<()> {
        let tags = block.tags().clone();
        let every = self.every;
        let period = self.period;
        let start = self.start;
        let window_of = |t: Time| -> Bounds {
            let delta = (t - start).nanos();
            let n = delta.div_euclid(every.nanos());
            let ws = start + Duration::nanoseconds(n * every.nanos());
            Bounds::new(ws, ws + period)
        };

        let d = &mut self.d;
        let mut append_err: Option<RivuletError> = None;
        {
            let mut times = block.times();
            times
                .do_time(&mut |ts, rr| {
                    for (i, t) in ts.iter().enumerate() {
                        if append_err.is_some() {
                            return;
                        }
                        let bounds = window_of(*t);
                        let (builder, is_new) = d.cache().builder_for(bounds, tags.clone());
                        if is_new {
                            add_block_cols(&*block, builder);
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
        // Align the watermark to the last closed window boundary so a
        // window is never flushed while rows can still join it.
        let aligned = self.window_of(t).start;
        self.d.update_watermark(parent, aligned).await
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
