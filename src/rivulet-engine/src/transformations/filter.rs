//! The filter transformation.
//!
//! The predicate is compiled once per value-column kind at construction;
//! each incoming block selects the compiled expression matching its value
//! column. Rows that fail evaluation are logged and skipped rather than
//! aborting the query.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use common_error::{RivuletError, RivuletResult};
use rivulet_core::block::{value_idx, Block, BlockKey, ColMeta};
use rivulet_core::{DataType, Expression, Time};

use crate::builder::add_block_cols;
use crate::compile::{compile_per_kind, CompiledExpression, ObjectProperty, Scope};
use crate::dataset::{Dataset, DatasetId, SharedError};
use crate::transformation::Transformation;
use crate::transformations::FinishTracker;

/// Filters rows by a compiled predicate.
pub struct FilterTransformation {
    d: Dataset,
    properties: Vec<ObjectProperty>,
    compiled: HashMap<DataType, Result<CompiledExpression, RivuletError>>,
    scope: Scope,
    tracker: FinishTracker,
}

impl FilterTransformation {
    /// Compile the predicate for every value kind.
    pub fn new(d: Dataset, expression: &Expression) -> RivuletResult<Self> {
        if expression.params.len() > 1 {
            return Err(RivuletError::compilation(format!(
                "filter functions should have a single parameter, got {:?}",
                expression.params
            )));
        }
        Ok(Self {
            d,
            properties: crate::compile::object_properties(expression),
            compiled: compile_per_kind(expression),
            scope: Scope::new(),
            tracker: FinishTracker::default(),
        })
    }

    /// Column index serving each referenced property, given a block's
    /// columns. The value property maps to the value column; everything
    /// else maps to the column with the matching label.
    fn scope_cols(&self, cols: &[ColMeta], value_j: usize) -> HashMap<ObjectProperty, usize> {
        let mut out = HashMap::with_capacity(self.properties.len());
        for prop in &self.properties {
            if prop.is_value() {
                out.insert(prop.clone(), value_j);
            } else if let Some(j) = cols.iter().position(|c| c.label == prop.property) {
                out.insert(prop.clone(), j);
            }
        }
        out
    }
}

#[async_trait]
impl Transformation for FilterTransformation {
    async fn process(&mut self, _parent: DatasetId, block: Arc<dyn Block>) -> RivuletResult<()> {
        let cols = block.cols().to_vec();
        let value_j = value_idx(&cols)
            .ok_or_else(|| RivuletError::execution("block has no value column"))?;
        let value_type = cols[value_j].data_type;

        let ce = match self.compiled.get(&value_type) {
            None => {
                return Err(RivuletError::compilation(format!(
                    "expression does not support type {value_type}"
                )));
            }
            Some(Err(e)) => {
                return Err(RivuletError::compilation(format!(
                    "expression does not support type {value_type}: {e}"
                )));
            }
            Some(Ok(ce)) => ce.clone(),
        };
        let scope_cols = self.scope_cols(&cols, value_j);

        let (builder, is_new) = self.d.cache().builder(&*block);
        if is_new {
            add_block_cols(&*block, builder);
        }

        let mut append_err: Option<RivuletError> = None;
        {
            let scope = &mut self.scope;
            let mut times = block.times();
            times
                .do_time(&mut |ts, rr| {
                    for i in 0..ts.len() {
                        if append_err.is_some() {
                            return;
                        }
                        for (prop, j) in &scope_cols {
                            scope.insert(
                                prop.clone(),
                                rivulet_core::block::value_for_row(rr, i, *j, &cols[*j]),
                            );
                        }
                        match ce.eval_bool(scope) {
                            Ok(true) => {
                                if let Err(e) = builder.append_row(rr, i) {
                                    append_err = Some(e);
                                }
                            }
                            Ok(false) => {}
                            Err(e) => {
                                // A row that fails evaluation is skipped,
                                // not fatal.
                                warn!(error = %e, "failed to evaluate filter expression");
                            }
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
    use rivulet_core::{Bounds, Node, Operator, Value};

    fn predicate_gt5() -> Expression {
        Expression::new(Node::binary(
            Operator::Gt,
            Node::reference("$"),
            Node::float(5.0),
        ))
    }

    fn float_block(start: i64, stop: i64, rows: Vec<(i64, f64)>) -> crate::MemBlock {
        literal_block(
            Bounds::new(Time(start), Time(stop)),
            vec![ColMeta::time(), ColMeta::value(DataType::Float)],
            rows.into_iter()
                .map(|(t, v)| vec![Value::Time(Time(t)), Value::Float(v)])
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_filter_selects_matching_rows() {
        let blocks = vec![float_block(1, 3, vec![(1, 1.0), (2, 6.0)])];
        let out = run_transformation(
            |d| Box::new(FilterTransformation::new(d, &predicate_gt5()).unwrap()),
            blocks,
        )
        .await
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(
            rows_of(&out[0]),
            vec![vec![Value::Time(Time(2)), Value::Float(6.0)]]
        );
    }

    #[tokio::test]
    async fn test_filter_multiple_blocks_keep_their_bounds() {
        let blocks = vec![
            float_block(1, 3, vec![(1, 3.0), (2, 6.0), (2, 1.0)]),
            float_block(3, 5, vec![(3, 3.0), (3, 2.0), (4, 8.0)]),
        ];
        let out = run_transformation(
            |d| Box::new(FilterTransformation::new(d, &predicate_gt5()).unwrap()),
            blocks,
        )
        .await
        .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(
            rows_of(&out[0]),
            vec![vec![Value::Time(Time(2)), Value::Float(6.0)]]
        );
        assert_eq!(
            rows_of(&out[1]),
            vec![vec![Value::Time(Time(4)), Value::Float(8.0)]]
        );
    }

    #[tokio::test]
    async fn test_compound_predicate_with_tags() {
        // $>5 and t1 == "a" and t2 == "y"
        let predicate = Expression::new(Node::binary(
            Operator::And,
            Node::binary(Operator::Gt, Node::reference("$"), Node::float(5.0)),
            Node::binary(
                Operator::And,
                Node::binary(Operator::Eq, Node::reference("t1"), Node::string("a")),
                Node::binary(Operator::Eq, Node::reference("t2"), Node::string("y")),
            ),
        ));
        let block = literal_block(
            Bounds::new(Time(1), Time(5)),
            vec![
                ColMeta::time(),
                ColMeta::value(DataType::Float),
                ColMeta::tag("t1", true),
                ColMeta::tag("t2", false),
            ],
            vec![
                vec![
                    Value::Time(Time(1)),
                    Value::Float(1.0),
                    Value::String("a".to_string()),
                    Value::String("x".to_string()),
                ],
                vec![
                    Value::Time(Time(2)),
                    Value::Float(6.0),
                    Value::String("a".to_string()),
                    Value::String("x".to_string()),
                ],
                vec![
                    Value::Time(Time(3)),
                    Value::Float(8.0),
                    Value::String("a".to_string()),
                    Value::String("y".to_string()),
                ],
            ],
        );
        let out = run_transformation(
            |d| Box::new(FilterTransformation::new(d, &predicate).unwrap()),
            vec![block],
        )
        .await
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(
            rows_of(&out[0]),
            vec![vec![
                Value::Time(Time(3)),
                Value::Float(8.0),
                Value::String("a".to_string()),
                Value::String("y".to_string()),
            ]]
        );
    }

    #[tokio::test]
    async fn test_unsupported_value_kind_is_fatal() {
        let block = literal_block(
            Bounds::new(Time(1), Time(5)),
            vec![ColMeta::time(), ColMeta::value(DataType::String)],
            vec![vec![
                Value::Time(Time(1)),
                Value::String("nope".to_string()),
            ]],
        );
        let err = run_transformation(
            |d| Box::new(FilterTransformation::new(d, &predicate_gt5()).unwrap()),
            vec![block],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RivuletError::CompilationError(_)));
        assert!(err.to_string().contains("does not support type string"));
    }
}
