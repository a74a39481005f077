//! The join transformation.
//!
//! An inner merge-join on row time across exactly two parents, within
//! groups that agree on the `on` tag keys and block bounds. Rows are
//! buffered per parent; the join emits when the last parent finishes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use common_error::{RivuletError, RivuletResult};
use rivulet_core::block::{value_idx, Block, BlockKey, ColMeta, Tags};
use rivulet_core::{Bounds, DataType, Time, Value};

use crate::dataset::{Dataset, DatasetId, SharedError};
use crate::transformation::Transformation;
use crate::transformations::FinishTracker;

type GroupKey = (Bounds, Vec<(String, String)>);

#[derive(Default)]
struct SideBuffer {
    value_type: Option<DataType>,
    rows: HashMap<GroupKey, Vec<(Time, Value)>>,
}

/// Inner join on time and tag keys.
pub struct JoinTransformation {
    d: Dataset,
    on: Vec<String>,
    buffers: HashMap<DatasetId, SideBuffer>,
    tracker: FinishTracker,
}

impl JoinTransformation {
    /// Create a join transformation.
    pub fn new(d: Dataset, on: Vec<String>) -> Self {
        Self {
            d,
            on,
            buffers: HashMap::new(),
            tracker: FinishTracker::default(),
        }
    }

    fn emit(&mut self) -> RivuletResult<()> {
        let parents = self.tracker.parents().to_vec();
        if parents.len() != 2 {
            return Err(RivuletError::planning(format!(
                "join requires exactly two parents, got {}",
                parents.len()
            )));
        }
        let left = self.buffers.remove(&parents[0]).unwrap_or_default();
        let right = self.buffers.remove(&parents[1]).unwrap_or_default();
        let (Some(left_type), Some(right_type)) = (left.value_type, right.value_type) else {
            // One side produced no rows; an inner join emits nothing.
            return Ok(());
        };

        for (key, mut left_rows) in left.rows {
            let Some(right_rows) = right.rows.get(&key) else {
                continue;
            };
            let mut by_time: HashMap<Time, &Value> = HashMap::new();
            for (t, v) in right_rows {
                by_time.entry(*t).or_insert(v);
            }

            left_rows.sort_by_key(|(t, _)| *t);
            let (bounds, tag_pairs) = &key;
            let tags: Tags = tag_pairs.iter().cloned().collect();
            let (builder, is_new) = self.d.cache().builder_for(*bounds, tags);
            if is_new {
                builder.add_col(ColMeta::time());
                builder.add_col(ColMeta::value(left_type));
                builder.add_col(ColMeta {
                    label: "value_1".to_string(),
                    data_type: right_type,
                    is_tag: false,
                    is_common: false,
                });
                for (k, _) in tag_pairs {
                    builder.add_col(ColMeta::tag(k, true));
                }
            }
            for (t, v) in left_rows {
                let Some(rv) = by_time.get(&t) else {
                    continue;
                };
                builder.append_time(0, t)?;
                builder.append_value(1, v)?;
                builder.append_value(2, (*rv).clone())?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transformation for JoinTransformation {
    async fn process(&mut self, parent: DatasetId, block: Arc<dyn Block>) -> RivuletResult<()> {
        let cols = block.cols().to_vec();
        let value_j = value_idx(&cols)
            .ok_or_else(|| RivuletError::execution("block has no value column"))?;
        let value_type = cols[value_j].data_type;

        let on = self.on.clone();
        let block_tags = block.tags().clone();
        let bounds = block.bounds();
        let buffer = self.buffers.entry(parent).or_default();
        buffer.value_type.get_or_insert(value_type);

        let on_idx: Vec<Option<usize>> = on
            .iter()
            .map(|k| cols.iter().position(|c| c.label == *k))
            .collect();

        {
            let mut times = block.times();
            times
                .do_time(&mut |ts, rr| {
                    for (i, t) in ts.iter().enumerate() {
                        let mut tag_pairs = Vec::with_capacity(on.len());
                        for (k, idx) in on.iter().zip(&on_idx) {
                            let value = match idx {
                                Some(j) => rr.at_string(i, *j).to_string(),
                                None => block_tags.get(k).cloned().unwrap_or_default(),
                            };
                            tag_pairs.push((k.clone(), value));
                        }
                        buffer
                            .rows
                            .entry((bounds, tag_pairs))
                            .or_default()
                            .push((
                                *t,
                                rivulet_core::block::value_for_row(
                                    rr,
                                    i,
                                    value_j,
                                    &cols[value_j],
                                ),
                            ));
                    }
                })
                .await?;
        }
        Ok(())
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
        if let Some(err) = err {
            self.d.finish(Some(err)).await;
            return;
        }
        if self.tracker.record(parent) {
            match self.emit() {
                Ok(()) => self.d.finish(None).await,
                Err(e) => self.d.finish(Some(Arc::new(e))).await,
            }
        }
    }

    fn set_parents(&mut self, parents: Vec<DatasetId>) {
        self.tracker.set_parents(parents);
    }
}
