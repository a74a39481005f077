//! Row selectors: first, last, min, max.
//!
//! A selector examines each frame of a block's value column and keeps the
//! candidate row. When the block completes, the framework emits a single
//! row copying every column, with the time column set to the selected row's
//! own time or the block stop, per `use_row_time`.

use std::sync::Arc;

use async_trait::async_trait;

use common_error::{RivuletError, RivuletResult};
use rivulet_core::block::{
    read_row, time_idx, value_idx, Block, BlockKey, Row, RowReader,
};
use rivulet_core::{DataType, Time};

use crate::builder::add_block_cols;
use crate::dataset::{Dataset, DatasetId, SharedError};
use crate::transformation::Transformation;
use crate::transformations::FinishTracker;

/// The builtin selector kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorKind {
    /// Earliest row.
    First,
    /// Latest row.
    Last,
    /// Minimum value; ties keep the earliest row.
    Min,
    /// Maximum value; ties keep the earliest row.
    Max,
}

impl SelectorKind {
    fn make(self) -> Box<dyn RowSelector> {
        match self {
            Self::First => Box::new(FirstSelector::default()),
            Self::Last => Box::new(LastSelector::default()),
            Self::Min => Box::new(MinSelector::default()),
            Self::Max => Box::new(MaxSelector::default()),
        }
    }
}

/// Per-block row selection. The framework resets the selector, feeds every
/// frame of the value column through the typed `do_*` hooks, then drains
/// the selected rows.
pub trait RowSelector: Send {
    /// Forget state from the previous block.
    fn reset(&mut self);
    /// Whether this selector supports a value kind.
    fn supports(&self, dt: DataType) -> bool;
    /// Examine a bool frame.
    fn do_bool(&mut self, _vs: &[bool], _rr: &dyn RowReader) {}
    /// Examine an int frame.
    fn do_int(&mut self, _vs: &[i64], _rr: &dyn RowReader) {}
    /// Examine a uint frame.
    fn do_uint(&mut self, _vs: &[u64], _rr: &dyn RowReader) {}
    /// Examine a float frame.
    fn do_float(&mut self, _vs: &[f64], _rr: &dyn RowReader) {}
    /// Examine a string frame.
    fn do_string(&mut self, _vs: &[String], _rr: &dyn RowReader) {}
    /// Drain the selected rows.
    fn rows(&mut self) -> Vec<Row>;
}

/// Keeps the first row seen.
#[derive(Default)]
pub struct FirstSelector {
    row: Option<Row>,
}

impl RowSelector for FirstSelector {
    fn reset(&mut self) {
        self.row = None;
    }

    fn supports(&self, _dt: DataType) -> bool {
        true
    }

    fn do_bool(&mut self, vs: &[bool], rr: &dyn RowReader) {
        if self.row.is_none() && !vs.is_empty() {
            self.row = Some(read_row(rr, 0));
        }
    }

    fn do_int(&mut self, vs: &[i64], rr: &dyn RowReader) {
        if self.row.is_none() && !vs.is_empty() {
            self.row = Some(read_row(rr, 0));
        }
    }

    fn do_uint(&mut self, vs: &[u64], rr: &dyn RowReader) {
        if self.row.is_none() && !vs.is_empty() {
            self.row = Some(read_row(rr, 0));
        }
    }

    fn do_float(&mut self, vs: &[f64], rr: &dyn RowReader) {
        if self.row.is_none() && !vs.is_empty() {
            self.row = Some(read_row(rr, 0));
        }
    }

    fn do_string(&mut self, vs: &[String], rr: &dyn RowReader) {
        if self.row.is_none() && !vs.is_empty() {
            self.row = Some(read_row(rr, 0));
        }
    }

    fn rows(&mut self) -> Vec<Row> {
        self.row.take().into_iter().collect()
    }
}

/// Keeps the last row seen.
#[derive(Default)]
pub struct LastSelector {
    row: Option<Row>,
}

impl RowSelector for LastSelector {
    fn reset(&mut self) {
        self.row = None;
    }

    fn supports(&self, _dt: DataType) -> bool {
        true
    }

    fn do_bool(&mut self, vs: &[bool], rr: &dyn RowReader) {
        if !vs.is_empty() {
            self.row = Some(read_row(rr, vs.len() - 1));
        }
    }

    fn do_int(&mut self, vs: &[i64], rr: &dyn RowReader) {
        if !vs.is_empty() {
            self.row = Some(read_row(rr, vs.len() - 1));
        }
    }

    fn do_uint(&mut self, vs: &[u64], rr: &dyn RowReader) {
        if !vs.is_empty() {
            self.row = Some(read_row(rr, vs.len() - 1));
        }
    }

    fn do_float(&mut self, vs: &[f64], rr: &dyn RowReader) {
        if !vs.is_empty() {
            self.row = Some(read_row(rr, vs.len() - 1));
        }
    }

    fn do_string(&mut self, vs: &[String], rr: &dyn RowReader) {
        if !vs.is_empty() {
            self.row = Some(read_row(rr, vs.len() - 1));
        }
    }

    fn rows(&mut self) -> Vec<Row> {
        self.row.take().into_iter().collect()
    }
}

/// Keeps the row with the minimum value.
#[derive(Default)]
pub struct MinSelector {
    set: bool,
    best_int: i64,
    best_uint: u64,
    best_float: f64,
    row: Option<Row>,
}

impl RowSelector for MinSelector {
    fn reset(&mut self) {
        self.set = false;
        self.row = None;
    }

    fn supports(&self, dt: DataType) -> bool {
        matches!(dt, DataType::Int | DataType::UInt | DataType::Float)
    }

    fn do_int(&mut self, vs: &[i64], rr: &dyn RowReader) {
        let mut idx = None;
        for (i, v) in vs.iter().enumerate() {
            if !self.set || *v < self.best_int {
                self.set = true;
                self.best_int = *v;
                idx = Some(i);
            }
        }
        if let Some(i) = idx {
            self.row = Some(read_row(rr, i));
        }
    }

    fn do_uint(&mut self, vs: &[u64], rr: &dyn RowReader) {
        let mut idx = None;
        for (i, v) in vs.iter().enumerate() {
            if !self.set || *v < self.best_uint {
                self.set = true;
                self.best_uint = *v;
                idx = Some(i);
            }
        }
        if let Some(i) = idx {
            self.row = Some(read_row(rr, i));
        }
    }

    fn do_float(&mut self, vs: &[f64], rr: &dyn RowReader) {
        let mut idx = None;
        for (i, v) in vs.iter().enumerate() {
            if !self.set || *v < self.best_float {
                self.set = true;
                self.best_float = *v;
                idx = Some(i);
            }
        }
        if let Some(i) = idx {
            self.row = Some(read_row(rr, i));
        }
    }

    fn rows(&mut self) -> Vec<Row> {
        self.row.take().into_iter().collect()
    }
}

/// Keeps the row with the maximum value.
#[derive(Default)]
pub struct MaxSelector {
    set: bool,
    best_int: i64,
    best_uint: u64,
    best_float: f64,
    row: Option<Row>,
}

impl RowSelector for MaxSelector {
    fn reset(&mut self) {
        self.set = false;
        self.row = None;
    }

    fn supports(&self, dt: DataType) -> bool {
        matches!(dt, DataType::Int | DataType::UInt | DataType::Float)
    }

    fn do_int(&mut self, vs: &[i64], rr: &dyn RowReader) {
        let mut idx = None;
        for (i, v) in vs.iter().enumerate() {
            if !self.set || *v > self.best_int {
                self.set = true;
                self.best_int = *v;
                idx = Some(i);
            }
        }
        if let Some(i) = idx {
            self.row = Some(read_row(rr, i));
        }
    }

    fn do_uint(&mut self, vs: &[u64], rr: &dyn RowReader) {
        let mut idx = None;
        for (i, v) in vs.iter().enumerate() {
            if !self.set || *v > self.best_uint {
                self.set = true;
                self.best_uint = *v;
                idx = Some(i);
            }
        }
        if let Some(i) = idx {
            self.row = Some(read_row(rr, i));
        }
    }

    fn do_float(&mut self, vs: &[f64], rr: &dyn RowReader) {
        let mut idx = None;
        for (i, v) in vs.iter().enumerate() {
            if !self.set || *v > self.best_float {
                self.set = true;
                self.best_float = *v;
                idx = Some(i);
            }
        }
        if let Some(i) = idx {
            self.row = Some(read_row(rr, i));
        }
    }

    fn rows(&mut self) -> Vec<Row> {
        self.row.take().into_iter().collect()
    }
}

/// Drives a [`RowSelector`] over each block and emits the selected rows.
pub struct RowSelectorTransformation {
    d: Dataset,
    selector: Box<dyn RowSelector>,
    use_row_time: bool,
    tracker: FinishTracker,
}

impl RowSelectorTransformation {
    /// Create a selector transformation.
    pub fn new(d: Dataset, kind: SelectorKind, use_row_time: bool) -> Self {
        Self {
            d,
            selector: kind.make(),
            use_row_time,
            tracker: FinishTracker::default(),
        }
    }
}

#[async_trait]
impl Transformation for RowSelectorTransformation {
    async fn process(&mut self, _parent: DatasetId, block: Arc<dyn Block>) -> RivuletResult<()> {
        let cols = block.cols().to_vec();
        let value_j = value_idx(&cols)
            .ok_or_else(|| RivuletError::execution("block has no value column"))?;
        let time_j = time_idx(&cols)
            .ok_or_else(|| RivuletError::execution("block has no time column"))?;
        let value_type = cols[value_j].data_type;
        if !self.selector.supports(value_type) {
            return Err(RivuletError::execution(format!(
                "selector does not support type {value_type}"
            )));
        }

        self.selector.reset();
        {
            let selector = &mut self.selector;
            let mut values = block.values();
            match value_type {
                DataType::Bool => {
                    values
                        .do_bool(&mut |vs, rr| selector.do_bool(vs, rr))
                        .await?;
                }
                DataType::Int => {
                    values.do_int(&mut |vs, rr| selector.do_int(vs, rr)).await?;
                }
                DataType::UInt => {
                    values
                        .do_uint(&mut |vs, rr| selector.do_uint(vs, rr))
                        .await?;
                }
                DataType::Float => {
                    values
                        .do_float(&mut |vs, rr| selector.do_float(vs, rr))
                        .await?;
                }
                DataType::String => {
                    values
                        .do_string(&mut |vs, rr| selector.do_string(vs, rr))
                        .await?;
                }
                DataType::Time => {
                    return Err(RivuletError::execution(
                        "value column cannot be of type time",
                    ));
                }
            }
        }

        let rows = self.selector.rows();
        let (builder, is_new) = self.d.cache().builder(&*block);
        if is_new {
            add_block_cols(&*block, builder);
        }
        for row in rows {
            for (j, col) in cols.iter().enumerate() {
                if col.is_common {
                    continue;
                }
                if j == time_j && !self.use_row_time {
                    builder.append_time(j, block.bounds().stop)?;
                } else {
                    builder.append_value(j, row.values[j].clone())?;
                }
            }
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
    use rivulet_core::{Bounds, Value};

    fn selector_block() -> crate::MemBlock {
        let values = [0.0, 5.0, 9.0, 4.0, 6.0, 8.0, 1.0, 2.0, 3.0, 7.0];
        literal_block(
            Bounds::new(Time(0), Time(100)),
            vec![
                ColMeta::time(),
                ColMeta::value(DataType::Float),
                ColMeta::tag("t1", true),
                ColMeta::tag("t2", false),
            ],
            values
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    vec![
                        Value::Time(Time(i as i64 * 10)),
                        Value::Float(*v),
                        Value::String("a".to_string()),
                        Value::String(if i % 2 == 0 { "y" } else { "x" }.to_string()),
                    ]
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_last_selects_latest_row() {
        let out = run_transformation(
            |d| Box::new(RowSelectorTransformation::new(d, SelectorKind::Last, true)),
            vec![selector_block()],
        )
        .await
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bounds(), Bounds::new(Time(0), Time(100)));
        assert_eq!(
            out[0].tags().get("t1").map(String::as_str),
            Some("a"),
            "common tags are carried"
        );
        assert_eq!(
            rows_of(&out[0]),
            vec![vec![
                Value::Time(Time(90)),
                Value::Float(7.0),
                Value::String("a".to_string()),
                Value::String("x".to_string()),
            ]]
        );
    }

    #[tokio::test]
    async fn test_first_selects_earliest_row() {
        let out = run_transformation(
            |d| Box::new(RowSelectorTransformation::new(d, SelectorKind::First, true)),
            vec![selector_block()],
        )
        .await
        .unwrap();
        let row = &rows_of(&out[0])[0];
        assert_eq!(row[0], Value::Time(Time(0)));
        assert_eq!(row[1], Value::Float(0.0));
    }

    #[tokio::test]
    async fn test_max_keeps_earliest_maximum() {
        let out = run_transformation(
            |d| Box::new(RowSelectorTransformation::new(d, SelectorKind::Max, true)),
            vec![selector_block()],
        )
        .await
        .unwrap();
        let row = &rows_of(&out[0])[0];
        assert_eq!(row[0], Value::Time(Time(20)));
        assert_eq!(row[1], Value::Float(9.0));
    }

    #[tokio::test]
    async fn test_min_keeps_earliest_minimum() {
        let out = run_transformation(
            |d| Box::new(RowSelectorTransformation::new(d, SelectorKind::Min, true)),
            vec![selector_block()],
        )
        .await
        .unwrap();
        let row = &rows_of(&out[0])[0];
        assert_eq!(row[0], Value::Time(Time(0)));
        assert_eq!(row[1], Value::Float(0.0));
    }

    #[tokio::test]
    async fn test_block_stop_time_when_not_using_row_time() {
        let out = run_transformation(
            |d| {
                Box::new(RowSelectorTransformation::new(
                    d,
                    SelectorKind::Last,
                    false,
                ))
            },
            vec![selector_block()],
        )
        .await
        .unwrap();
        let row = &rows_of(&out[0])[0];
        assert_eq!(row[0], Value::Time(Time(100)));
        assert_eq!(row[1], Value::Float(7.0));
    }

    #[tokio::test]
    async fn test_min_rejects_strings() {
        let block = literal_block(
            Bounds::new(Time(0), Time(10)),
            vec![ColMeta::time(), ColMeta::value(DataType::String)],
            vec![vec![Value::Time(Time(1)), Value::String("a".to_string())]],
        );
        let err = run_transformation(
            |d| Box::new(RowSelectorTransformation::new(d, SelectorKind::Min, true)),
            vec![block],
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("does not support type string"));
    }
}
