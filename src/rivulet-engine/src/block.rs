//! Materialized blocks.
//!
//! A [`MemBlock`] owns its column data outright. Common tag columns store
//! their single value once; every other column stores one cell per row.

use std::sync::Arc;

use async_trait::async_trait;

use common_error::{RivuletError, RivuletResult};
use rivulet_core::block::{
    value_idx, Block, ColMeta, RowReader, Tags, ValueIterator,
};
use rivulet_core::{Bounds, DataType, Time};

use crate::allocator::Allocator;
use crate::builder::{add_block_cols, BlockBuilder};

/// Owned data of one column.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    /// Bool cells.
    Bool(Vec<bool>),
    /// Int cells.
    Int(Vec<i64>),
    /// UInt cells.
    UInt(Vec<u64>),
    /// Float cells.
    Float(Vec<f64>),
    /// String cells.
    String(Vec<String>),
    /// Time cells.
    Time(Vec<Time>),
    /// A common tag column: one value for every row.
    Common(String),
}

impl Column {
    /// Number of stored cells. Common columns report `None`.
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::Bool(v) => Some(v.len()),
            Self::Int(v) => Some(v.len()),
            Self::UInt(v) => Some(v.len()),
            Self::Float(v) => Some(v.len()),
            Self::String(v) => Some(v.len()),
            Self::Time(v) => Some(v.len()),
            Self::Common(_) => None,
        }
    }

    /// Whether the column stores no cells.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

/// Accounting released when the block is dropped.
#[derive(Debug)]
pub(crate) struct Reservation {
    pub(crate) alloc: Arc<Allocator>,
    pub(crate) bytes: usize,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.alloc.free(self.bytes);
    }
}

/// A fully materialized block.
#[derive(Debug)]
pub struct MemBlock {
    pub(crate) bounds: Bounds,
    pub(crate) tags: Tags,
    pub(crate) cols: Vec<ColMeta>,
    pub(crate) data: Vec<Column>,
    pub(crate) reservation: Option<Reservation>,
}

impl MemBlock {
    /// Construct a block from parts. Intended for tests and helpers; the
    /// engine itself builds blocks through [`BlockBuilder`].
    pub fn new(bounds: Bounds, tags: Tags, cols: Vec<ColMeta>, data: Vec<Column>) -> Self {
        Self {
            bounds,
            tags,
            cols,
            data,
            reservation: None,
        }
    }

    /// Number of rows.
    pub fn n_rows(&self) -> usize {
        self.data
            .iter()
            .find_map(Column::len)
            .unwrap_or(0)
    }
}

impl Block for MemBlock {
    fn bounds(&self) -> Bounds {
        self.bounds
    }

    fn tags(&self) -> &Tags {
        &self.tags
    }

    fn cols(&self) -> &[ColMeta] {
        &self.cols
    }

    fn col(&self, j: usize) -> Box<dyn ValueIterator + Send + '_> {
        Box::new(MemValueIterator {
            block: self,
            col: j,
            consumed: false,
        })
    }
}

fn check_col_type(col: &ColMeta, want: DataType) {
    assert!(
        col.data_type == want,
        "column {:?} is of type {}, not {}",
        col.label,
        col.data_type,
        want
    );
}

/// Row reader over a materialized block.
pub struct MemRowReader<'a> {
    block: &'a MemBlock,
}

impl<'a> MemRowReader<'a> {
    /// Wrap a block.
    pub fn new(block: &'a MemBlock) -> Self {
        Self { block }
    }
}

impl RowReader for MemRowReader<'_> {
    fn cols(&self) -> &[ColMeta] {
        &self.block.cols
    }

    fn at_bool(&self, i: usize, j: usize) -> bool {
        check_col_type(&self.block.cols[j], DataType::Bool);
        match &self.block.data[j] {
            Column::Bool(v) => v[i],
            other => panic!("bool column backed by {other:?}"),
        }
    }

    fn at_int(&self, i: usize, j: usize) -> i64 {
        check_col_type(&self.block.cols[j], DataType::Int);
        match &self.block.data[j] {
            Column::Int(v) => v[i],
            other => panic!("int column backed by {other:?}"),
        }
    }

    fn at_uint(&self, i: usize, j: usize) -> u64 {
        check_col_type(&self.block.cols[j], DataType::UInt);
        match &self.block.data[j] {
            Column::UInt(v) => v[i],
            other => panic!("uint column backed by {other:?}"),
        }
    }

    fn at_float(&self, i: usize, j: usize) -> f64 {
        check_col_type(&self.block.cols[j], DataType::Float);
        match &self.block.data[j] {
            Column::Float(v) => v[i],
            other => panic!("float column backed by {other:?}"),
        }
    }

    fn at_string(&self, i: usize, j: usize) -> &str {
        check_col_type(&self.block.cols[j], DataType::String);
        match &self.block.data[j] {
            Column::String(v) => &v[i],
            Column::Common(value) => value,
            other => panic!("string column backed by {other:?}"),
        }
    }

    fn at_time(&self, i: usize, j: usize) -> Time {
        check_col_type(&self.block.cols[j], DataType::Time);
        match &self.block.data[j] {
            Column::Time(v) => v[i],
            other => panic!("time column backed by {other:?}"),
        }
    }
}

/// One-shot value iterator over a materialized column: the whole column is
/// delivered as a single frame.
struct MemValueIterator<'a> {
    block: &'a MemBlock,
    col: usize,
    consumed: bool,
}

impl MemValueIterator<'_> {
    fn take_frame(&mut self) -> bool {
        if self.consumed {
            return false;
        }
        self.consumed = true;
        true
    }
}

#[async_trait]
impl ValueIterator for MemValueIterator<'_> {
    async fn do_bool(
        &mut self,
        f: &mut (dyn for<'r> FnMut(&'r [bool], &'r dyn RowReader) + Send),
    ) -> RivuletResult<()> {
        check_col_type(&self.block.cols[self.col], DataType::Bool);
        if self.take_frame() {
            if let Column::Bool(v) = &self.block.data[self.col] {
                f(v, &MemRowReader::new(self.block));
            }
        }
        Ok(())
    }

    async fn do_int(
        &mut self,
        f: &mut (dyn for<'r> FnMut(&'r [i64], &'r dyn RowReader) + Send),
    ) -> RivuletResult<()> {
        check_col_type(&self.block.cols[self.col], DataType::Int);
        if self.take_frame() {
            if let Column::Int(v) = &self.block.data[self.col] {
                f(v, &MemRowReader::new(self.block));
            }
        }
        Ok(())
    }

    async fn do_uint(
        &mut self,
        f: &mut (dyn for<'r> FnMut(&'r [u64], &'r dyn RowReader) + Send),
    ) -> RivuletResult<()> {
        check_col_type(&self.block.cols[self.col], DataType::UInt);
        if self.take_frame() {
            if let Column::UInt(v) = &self.block.data[self.col] {
                f(v, &MemRowReader::new(self.block));
            }
        }
        Ok(())
    }

    async fn do_float(
        &mut self,
        f: &mut (dyn for<'r> FnMut(&'r [f64], &'r dyn RowReader) + Send),
    ) -> RivuletResult<()> {
        check_col_type(&self.block.cols[self.col], DataType::Float);
        if self.take_frame() {
            if let Column::Float(v) = &self.block.data[self.col] {
                f(v, &MemRowReader::new(self.block));
            }
        }
        Ok(())
    }

    async fn do_string(
        &mut self,
        f: &mut (dyn for<'r> FnMut(&'r [String], &'r dyn RowReader) + Send),
    ) -> RivuletResult<()> {
        check_col_type(&self.block.cols[self.col], DataType::String);
        if self.take_frame() {
            match &self.block.data[self.col] {
                Column::String(v) => f(v, &MemRowReader::new(self.block)),
                Column::Common(value) => {
                    let expanded = vec![value.clone(); self.block.n_rows()];
                    f(&expanded, &MemRowReader::new(self.block));
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn do_time(
        &mut self,
        f: &mut (dyn for<'r> FnMut(&'r [Time], &'r dyn RowReader) + Send),
    ) -> RivuletResult<()> {
        check_col_type(&self.block.cols[self.col], DataType::Time);
        if self.take_frame() {
            if let Column::Time(v) = &self.block.data[self.col] {
                f(v, &MemRowReader::new(self.block));
            }
        }
        Ok(())
    }
}

/// Copy every row of `block` into `builder`, skipping common columns.
pub async fn append_block(block: &dyn Block, builder: &mut BlockBuilder) -> RivuletResult<()> {
    let cols = block.cols().to_vec();
    let value_j = value_idx(&cols)
        .ok_or_else(|| RivuletError::execution("block has no value column"))?;

    let mut err: Option<RivuletError> = None;
    {
        let mut on_row = |n: usize, rr: &dyn RowReader| {
            for i in 0..n {
                if err.is_some() {
                    return;
                }
                if let Err(e) = builder.append_row(rr, i) {
                    err = Some(e);
                }
            }
        };
        let mut values = block.values();
        match cols[value_j].data_type {
            DataType::Bool => {
                values
                    .do_bool(&mut |vs, rr| on_row(vs.len(), rr))
                    .await?;
            }
            DataType::Int => {
                values.do_int(&mut |vs, rr| on_row(vs.len(), rr)).await?;
            }
            DataType::UInt => {
                values
                    .do_uint(&mut |vs, rr| on_row(vs.len(), rr))
                    .await?;
            }
            DataType::Float => {
                values
                    .do_float(&mut |vs, rr| on_row(vs.len(), rr))
                    .await?;
            }
            DataType::String => {
                values
                    .do_string(&mut |vs, rr| on_row(vs.len(), rr))
                    .await?;
            }
            DataType::Time => {
                return Err(RivuletError::execution(
                    "value column cannot be of type time",
                ));
            }
        }
    }
    match err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Materialize any block into a [`MemBlock`], driving its value iterator to
/// completion (which signals `done` on storage blocks).
pub async fn materialize(block: &dyn Block, alloc: &Arc<Allocator>) -> RivuletResult<MemBlock> {
    let mut builder = BlockBuilder::new(block.bounds(), block.tags().clone(), Arc::clone(alloc));
    add_block_cols(block, &mut builder);
    append_block(block, &mut builder).await?;
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::literal_block;
    use rivulet_core::Value;

    #[tokio::test]
    async fn test_mem_block_iteration() {
        let block = literal_block(
            Bounds::new(Time(0), Time(10)),
            vec![
                ColMeta::time(),
                ColMeta::value(DataType::Float),
                ColMeta::tag("t1", true),
            ],
            vec![
                vec![
                    Value::Time(Time(1)),
                    Value::Float(1.5),
                    Value::String("a".to_string()),
                ],
                vec![
                    Value::Time(Time(2)),
                    Value::Float(2.5),
                    Value::String("a".to_string()),
                ],
            ],
        );
        assert_eq!(block.n_rows(), 2);
        assert_eq!(block.tags().get("t1").map(String::as_str), Some("a"));

        let mut seen = Vec::new();
        block
            .values()
            .do_float(&mut |vs, rr| {
                for (i, v) in vs.iter().enumerate() {
                    seen.push((rr.at_time(i, 0), *v, rr.at_string(i, 2).to_string()));
                }
            })
            .await
            .unwrap();
        assert_eq!(
            seen,
            vec![
                (Time(1), 1.5, "a".to_string()),
                (Time(2), 2.5, "a".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_materialize_round_trip() {
        let block = literal_block(
            Bounds::new(Time(0), Time(10)),
            vec![ColMeta::time(), ColMeta::value(DataType::Int)],
            vec![
                vec![Value::Time(Time(1)), Value::Int(10)],
                vec![Value::Time(Time(2)), Value::Int(20)],
            ],
        );
        let alloc = Arc::new(Allocator::unlimited());
        let copy = materialize(&block, &alloc).await.unwrap();
        assert_eq!(copy.n_rows(), 2);
        assert_eq!(crate::testing::rows_of(&copy), crate::testing::rows_of(&block));
    }
}
