//! Aggregates: sum, count, mean.
//!
//! An aggregate folds the value column of each block and emits one row per
//! block at the block's stop time, carrying the common tags forward.

use std::sync::Arc;

use async_trait::async_trait;

use common_error::{RivuletError, RivuletResult};
use rivulet_core::block::{value_idx, Block, BlockKey, ColMeta};
use rivulet_core::{DataType, Time, Value};

use crate::dataset::{Dataset, DatasetId, SharedError};
use crate::transformation::Transformation;
use crate::transformations::FinishTracker;

/// The builtin aggregate kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    /// Sum of the value column, keeping its type.
    Sum,
    /// Row count, as an int.
    Count,
    /// Arithmetic mean, as a float.
    Mean,
}

impl AggregateKind {
    /// The output value type for an input type, or `None` when the input
    /// type is unsupported.
    fn output_type(self, input: DataType) -> Option<DataType> {
        match self {
            Self::Count => Some(DataType::Int),
            Self::Sum => match input {
                DataType::Int | DataType::UInt | DataType::Float => Some(input),
                _ => None,
            },
            Self::Mean => match input {
                DataType::Int | DataType::UInt | DataType::Float => Some(DataType::Float),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Default)]
struct Accumulator {
    n: i64,
    int_sum: i64,
    uint_sum: u64,
    float_sum: f64,
}

/// Folds blocks into one row per block.
pub struct AggregateTransformation {
    d: Dataset,
    kind: AggregateKind,
    tracker: FinishTracker,
}

impl AggregateTransformation {
    /// Create an aggregate transformation.
    pub fn new(d: Dataset, kind: AggregateKind) -> Self {
        Self {
            d,
            kind,
            tracker: FinishTracker::default(),
        }
    }
}

#[async_trait]
impl Transformation for AggregateTransformation {
    async fn process(&mut self, _parent: DatasetId, block: Arc<dyn Block>) -> RivuletResult<()> {
        let cols = block.cols().to_vec();
        let value_j = value_idx(&cols)
            .ok_or_else(|| RivuletError::execution("block has no value column"))?;
        let value_type = cols[value_j].data_type;
        let Some(out_type) = self.kind.output_type(value_type) else {
            return Err(RivuletError::execution(format!(
                "aggregate does not support type {value_type}"
            )));
        };

        let mut acc = Accumulator::default();
        {
            let acc = &mut acc;
            let mut values = block.values();
            match value_type {
                DataType::Bool => {
                    values
                        .do_bool(&mut |vs, _| acc.n += vs.len() as i64)
                        .await?;
                }
                DataType::Int => {
                    values
                        .do_int(&mut |vs, _| {
                            acc.n += vs.len() as i64;
                            for v in vs {
                                acc.int_sum = acc.int_sum.wrapping_add(*v);
                                acc.float_sum += *v as f64;
                            }
                        })
                        .await?;
                }
                DataType::UInt => {
                    values
                        .do_uint(&mut |vs, _| {
                            acc.n += vs.len() as i64;
                            for v in vs {
                                acc.uint_sum = acc.uint_sum.wrapping_add(*v);
                                acc.float_sum += *v as f64;
                            }
                        })
                        .await?;
                }
                DataType::Float => {
                    values
                        .do_float(&mut |vs, _| {
                            acc.n += vs.len() as i64;
                            for v in vs {
                                acc.float_sum += *v;
                            }
                        })
                        .await?;
                }
                DataType::String => {
                    values
                        .do_string(&mut |vs, _| acc.n += vs.len() as i64)
                        .await?;
                }
                DataType::Time => {
                    return Err(RivuletError::execution(
                        "value column cannot be of type time",
                    ));
                }
            }
        }

        let result = match self.kind {
            AggregateKind::Count => Value::Int(acc.n),
            AggregateKind::Sum => match value_type {
                DataType::Int => Value::Int(acc.int_sum),
                DataType::UInt => Value::UInt(acc.uint_sum),
                _ => Value::Float(acc.float_sum),
            },
            AggregateKind::Mean => {
                if acc.n == 0 {
                    Value::Float(f64::NAN)
                } else {
                    Value::Float(acc.float_sum / acc.n as f64)
                }
            }
        };

        let (builder, is_new) = self
            .d
            .cache()
            .builder_for(block.bounds(), block.tags().clone());
        if is_new {
            builder.add_col(ColMeta::time());
            builder.add_col(ColMeta::value(out_type));
            for col in &cols {
                if col.is_common {
                    builder.add_col(col.clone());
                }
            }
        }
        builder.append_time(0, block.bounds().stop)?;
        builder.append_value(1, result)?;
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
    use rivulet_core::{Bounds, Value};

    fn int_block(rows: Vec<(i64, i64)>) -> crate::MemBlock {
        literal_block(
            Bounds::new(Time(0), Time(100)),
            vec![
                ColMeta::time(),
                ColMeta::value(DataType::Int),
                ColMeta::tag("host", true),
            ],
            rows.into_iter()
                .map(|(t, v)| {
                    vec![
                        Value::Time(Time(t)),
                        Value::Int(v),
                        Value::String("a".to_string()),
                    ]
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_sum() {
        let out = run_transformation(
            |d| Box::new(AggregateTransformation::new(d, AggregateKind::Sum)),
            vec![int_block(vec![(1, 10), (2, 20), (3, 12)])],
        )
        .await
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(
            rows_of(&out[0]),
            vec![vec![
                Value::Time(Time(100)),
                Value::Int(42),
                Value::String("a".to_string()),
            ]]
        );
    }

    #[tokio::test]
    async fn test_count_outputs_int() {
        let out = run_transformation(
            |d| Box::new(AggregateTransformation::new(d, AggregateKind::Count)),
            vec![int_block(vec![(1, 10), (2, 20), (3, 12)])],
        )
        .await
        .unwrap();
        assert_eq!(out[0].cols()[1].data_type, DataType::Int);
        assert_eq!(rows_of(&out[0])[0][1], Value::Int(3));
    }

    #[tokio::test]
    async fn test_mean_outputs_float() {
        let out = run_transformation(
            |d| Box::new(AggregateTransformation::new(d, AggregateKind::Mean)),
            vec![int_block(vec![(1, 10), (2, 20), (3, 12)])],
        )
        .await
        .unwrap();
        assert_eq!(out[0].cols()[1].data_type, DataType::Float);
        assert_eq!(rows_of(&out[0])[0][1], Value::Float(14.0));
    }

    #[tokio::test]
    async fn test_sum_rejects_strings() {
        let block = literal_block(
            Bounds::new(Time(0), Time(10)),
            vec![ColMeta::time(), ColMeta::value(DataType::String)],
            vec![vec![Value::Time(Time(1)), Value::String("a".to_string())]],
        );
        let err = run_transformation(
            |d| Box::new(AggregateTransformation::new(d, AggregateKind::Sum)),
            vec![block],
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("does not support type string"));
    }
}
