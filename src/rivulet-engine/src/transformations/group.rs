//! The group transformation.
//!
//! Rows are regrouped by a set of tag keys: output blocks are keyed by
//! `(bounds, grouped tag values)`. Grouped tags stay common; the remaining
//! tag columns are carried per row.

use std::sync::Arc;

use async_trait::async_trait;

use common_error::{RivuletError, RivuletResult};
use rivulet_core::block::{
    time_idx, value_idx, Block, BlockKey, ColMeta, Tags,
};
use rivulet_core::Time;

use crate::dataset::{Dataset, DatasetId, SharedError};
use crate::transformation::Transformation;
use crate::transformations::FinishTracker;

/// Regroups rows by tag keys.
pub struct GroupTransformation {
    d: Dataset,
    by: Vec<String>,
    tracker: FinishTracker,
}

impl GroupTransformation {
    /// Create a group transformation.
    pub fn new(d: Dataset, by: Vec<String>) -> Self {
        Self {
            d,
            by,
            tracker: FinishTracker::default(),
        }
    }
}

#[async_trait]
impl Transformation for GroupTransformation {
    async fn process(&mut self, _parent: DatasetId, block: Arc<dyn Block>) -> RivuletResult<()> {
        let cols = block.cols().to_vec();
        let value_j = value_idx(&cols)
            .ok_or_else(|| RivuletError::execution("block has no value column"))?;
        time_idx(&cols).ok_or_else(|| RivuletError::execution("block has no time column"))?;
        let value_type = cols[value_j].data_type;

        // Where each grouped key and each carried tag lives in the input.
        let key_idx: Vec<Option<usize>> = self
            .by
            .iter()
            .map(|k| cols.iter().position(|c| c.label == *k))
            .collect();
        let carried: Vec<(String, usize)> = cols
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_tag && !self.by.contains(&c.label))
            .map(|(j, c)| (c.label.clone(), j))
            .collect();

        let by = self.by.clone();
        let block_tags = block.tags().clone();
        let bounds = block.bounds();
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
                        let mut group_tags = Tags::new();
                        for (k, idx) in by.iter().zip(&key_idx) {
                            let value = match idx {
                                Some(j) => rr.at_string(i, *j).to_string(),
                                None => block_tags.get(k).cloned().unwrap_or_default(),
                            };
                            group_tags.insert(k.clone(), value);
                        }

                        let (builder, is_new) = d.cache().builder_for(bounds, group_tags);
                        if is_new {
                            builder.add_col(ColMeta::time());
                            builder.add_col(ColMeta::value(value_type));
                            for k in &by {
                                builder.add_col(ColMeta::tag(k, true));
                            }
                            for (label, _) in &carried {
                                builder.add_col(ColMeta::tag(label, false));
                            }
                        }

                        let result = (|| -> RivuletResult<()> {
                            builder.append_time(0, *t)?;
                            builder.append_value(
                                1,
                                rivulet_core::block::value_for_row(rr, i, value_j, &cols[value_j]),
                            )?;
                            for (n, (_, j)) in carried.iter().enumerate() {
                                builder
                                    .append_string(2 + by.len() + n, rr.at_string(i, *j))?;
                            }
                            Ok(())
                        })();
                        if let Err(e) = result {
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
    use rivulet_core::{Bounds, DataType, Value};

    #[tokio::test]
    async fn test_group_splits_by_tag() {
        let block = literal_block(
            Bounds::new(Time(0), Time(100)),
            vec![
                ColMeta::time(),
                ColMeta::value(DataType::Float),
                ColMeta::tag("host", false),
                ColMeta::tag("region", true),
            ],
            vec![
                vec![
                    Value::Time(Time(1)),
                    Value::Float(1.0),
                    Value::String("a".to_string()),
                    Value::String("us".to_string()),
                ],
                vec![
                    Value::Time(Time(2)),
                    Value::Float(2.0),
                    Value::String("b".to_string()),
                    Value::String("us".to_string()),
                ],
                vec![
                    Value::Time(Time(3)),
                    Value::Float(3.0),
                    Value::String("a".to_string()),
                    Value::String("us".to_string()),
                ],
            ],
        );
        let mut out = run_transformation(
            |d| Box::new(GroupTransformation::new(d, vec!["host".to_string()])),
            vec![block],
        )
        .await
        .unwrap();
        out.sort_by(|a, b| {
            a.tags()
                .get("host")
                .cloned()
                .cmp(&b.tags().get("host").cloned())
        });

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].tags().get("host").map(String::as_str), Some("a"));
        assert_eq!(rows_of(&out[0]).len(), 2);
        assert_eq!(out[1].tags().get("host").map(String::as_str), Some("b"));
        assert_eq!(
            rows_of(&out[1]),
            vec![vec![
                Value::Time(Time(2)),
                Value::Float(2.0),
                Value::String("b".to_string()),
                Value::String("us".to_string()),
            ]]
        );
    }

    #[tokio::test]
    async fn test_group_by_common_tag_merges_series() {
        // Two blocks that differ only in a non-grouped tag collapse into
        // one output block keyed by the grouped tag.
        let make = |host: &str, t: i64| {
            literal_block(
                Bounds::new(Time(0), Time(100)),
                vec![
                    ColMeta::time(),
                    ColMeta::value(DataType::Float),
                    ColMeta::tag("host", true),
                    ColMeta::tag("region", true),
                ],
                vec![vec![
                    Value::Time(Time(t)),
                    Value::Float(1.0),
                    Value::String(host.to_string()),
                    Value::String("us".to_string()),
                ]],
            )
        };
        let out = run_transformation(
            |d| Box::new(GroupTransformation::new(d, vec!["region".to_string()])),
            vec![make("a", 1), make("b", 2)],
        )
        .await
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].tags().get("region").map(String::as_str), Some("us"));
        assert_eq!(rows_of(&out[0]).len(), 2);
    }
}
