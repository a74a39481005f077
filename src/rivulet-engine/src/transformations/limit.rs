//! The limit transformation: at most `n` rows per block key, after
//! skipping `offset`. Counts persist across blocks sharing a key.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use common_error::{RivuletError, RivuletResult};
use rivulet_core::block::{block_key, Block, BlockKey};
use rivulet_core::Time;

use crate::builder::add_block_cols;
use crate::dataset::{Dataset, DatasetId, SharedError};
use crate::transformation::Transformation;
use crate::transformations::FinishTracker;

/// Caps rows per block key.
pub struct LimitTransformation {
    d: Dataset,
    n: usize,
    offset: usize,
    seen: HashMap<BlockKey, usize>,
    tracker: FinishTracker,
}

impl LimitTransformation {
    /// Create a limit transformation.
    pub fn new(d: Dataset, n: i64, offset: i64) -> RivuletResult<Self> {
        if n < 0 || offset < 0 {
            return Err(RivuletError::planning(format!(
                "limit requires non-negative n and offset, got n={n} offset={offset}"
            )));
        }
        Ok(Self {
            d,
            n: n as usize,
            offset: offset as usize,
            seen: HashMap::new(),
            tracker: FinishTracker::default(),
        })
    }
}

#[async_trait]
impl Transformation for LimitTransformation {
    async fn process(&mut self, _parent: DatasetId, block: Arc<dyn Block>) -> RivuletResult<()> {
        let key = block_key(&*block);
        let mut seen = self.seen.get(&key).copied().unwrap_or(0);
        let n = self.n;
        let offset = self.offset;

        let (builder, is_new) = self.d.cache().builder(&*block);
        if is_new {
            add_block_cols(&*block, builder);
        }

        let mut append_err: Option<RivuletError> = None;
        {
            let mut times = block.times();
            times
                .do_time(&mut |ts, rr| {
                    for i in 0..ts.len() {
                        if append_err.is_some() || seen >= offset + n {
                            return;
                        }
                        seen += 1;
                        if seen <= offset {
                            continue;
                        }
                        if let Err(e) = builder.append_row(rr, i) {
                            append_err = Some(e);
                        }
                    }
                })
                .await?;
        }
        self.seen.insert(key, seen);
        match append_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn retract_block(&mut self, _parent: DatasetId, key: BlockKey) -> RivuletResult<()> {
        self.seen.remove(&key);
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
