//! Block builders.
//!
//! Transformations append derived rows into builders; when their upstream
//! finishes (or the watermark passes their bounds) builders are sealed into
//! immutable blocks and emitted downstream. All appends account through the
//! query allocator.

use std::sync::Arc;

use common_error::{RivuletError, RivuletResult};
use rivulet_core::block::{Block, ColMeta, RowReader, Tags};
use rivulet_core::{Bounds, DataType, Time, Value};

use crate::allocator::Allocator;
use crate::block::{Column, MemBlock, Reservation};

enum ColumnBuilder {
    Bool(Vec<bool>),
    Int(Vec<i64>),
    UInt(Vec<u64>),
    Float(Vec<f64>),
    String(Vec<String>),
    Time(Vec<Time>),
    Common(String),
}

impl ColumnBuilder {
    fn for_col(col: &ColMeta) -> Self {
        if col.is_common {
            return Self::Common(String::new());
        }
        match col.data_type {
            DataType::Bool => Self::Bool(Vec::new()),
            DataType::Int => Self::Int(Vec::new()),
            DataType::UInt => Self::UInt(Vec::new()),
            DataType::Float => Self::Float(Vec::new()),
            DataType::String => Self::String(Vec::new()),
            DataType::Time => Self::Time(Vec::new()),
        }
    }

    fn build(self) -> Column {
        match self {
            Self::Bool(v) => Column::Bool(v),
            Self::Int(v) => Column::Int(v),
            Self::UInt(v) => Column::UInt(v),
            Self::Float(v) => Column::Float(v),
            Self::String(v) => Column::String(v),
            Self::Time(v) => Column::Time(v),
            Self::Common(v) => Column::Common(v),
        }
    }
}

/// Accumulates rows for one output block.
pub struct BlockBuilder {
    bounds: Bounds,
    tags: Tags,
    cols: Vec<ColMeta>,
    data: Vec<ColumnBuilder>,
    alloc: Arc<Allocator>,
    allocated: usize,
}

impl BlockBuilder {
    /// Create an empty builder for a block with the given bounds and common
    /// tags.
    pub fn new(bounds: Bounds, tags: Tags, alloc: Arc<Allocator>) -> Self {
        Self {
            bounds,
            tags,
            cols: Vec::new(),
            data: Vec::new(),
            alloc,
            allocated: 0,
        }
    }

    /// The builder's bounds.
    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Column metadata added so far.
    pub fn cols(&self) -> &[ColMeta] {
        &self.cols
    }

    /// Number of appended rows.
    pub fn n_rows(&self) -> usize {
        self.data
            .iter()
            .find_map(|c| match c {
                ColumnBuilder::Bool(v) => Some(v.len()),
                ColumnBuilder::Int(v) => Some(v.len()),
                ColumnBuilder::UInt(v) => Some(v.len()),
                ColumnBuilder::Float(v) => Some(v.len()),
                ColumnBuilder::String(v) => Some(v.len()),
                ColumnBuilder::Time(v) => Some(v.len()),
                ColumnBuilder::Common(_) => None,
            })
            .unwrap_or(0)
    }

    /// Add a column, returning its index. Common tag columns are seeded
    /// from the builder's tags.
    pub fn add_col(&mut self, col: ColMeta) -> usize {
        let mut column = ColumnBuilder::for_col(&col);
        if col.is_common {
            if let Some(value) = self.tags.get(&col.label) {
                column = ColumnBuilder::Common(value.clone());
            }
        }
        self.cols.push(col);
        self.data.push(column);
        self.cols.len() - 1
    }

    /// Index of a column by label.
    pub fn col_idx(&self, label: &str) -> Option<usize> {
        self.cols.iter().position(|c| c.label == label)
    }

    /// Set the single value of a common column.
    pub fn set_common_string(&mut self, j: usize, value: impl Into<String>) {
        if let ColumnBuilder::Common(v) = &mut self.data[j] {
            *v = value.into();
        }
    }

    fn account(&mut self, bytes: usize) -> RivuletResult<()> {
        self.alloc.account(bytes)?;
        self.allocated += bytes;
        Ok(())
    }

    /// Append a bool cell.
    pub fn append_bool(&mut self, j: usize, value: bool) -> RivuletResult<()> {
        self.account(1)?;
        match &mut self.data[j] {
            ColumnBuilder::Bool(v) => v.push(value),
            _ => return Err(type_mismatch(&self.cols[j], DataType::Bool)),
        }
        Ok(())
    }

    /// Append an int cell.
    pub fn append_int(&mut self, j: usize, value: i64) -> RivuletResult<()> {
        self.account(8)?;
        match &mut self.data[j] {
            ColumnBuilder::Int(v) => v.push(value),
            _ => return Err(type_mismatch(&self.cols[j], DataType::Int)),
        }
        Ok(())
    }

    /// Append a uint cell.
    pub fn append_uint(&mut self, j: usize, value: u64) -> RivuletResult<()> {
        self.account(8)?;
        match &mut self.data[j] {
            ColumnBuilder::UInt(v) => v.push(value),
            _ => return Err(type_mismatch(&self.cols[j], DataType::UInt)),
        }
        Ok(())
    }

    /// Append a float cell.
    pub fn append_float(&mut self, j: usize, value: f64) -> RivuletResult<()> {
        self.account(8)?;
        match &mut self.data[j] {
            ColumnBuilder::Float(v) => v.push(value),
            _ => return Err(type_mismatch(&self.cols[j], DataType::Float)),
        }
        Ok(())
    }

    /// Append a string cell.
    pub fn append_string(&mut self, j: usize, value: impl Into<String>) -> RivuletResult<()> {
        let value = value.into();
        self.account(value.len() + 24)?;
        match &mut self.data[j] {
            ColumnBuilder::String(v) => v.push(value),
            _ => return Err(type_mismatch(&self.cols[j], DataType::String)),
        }
        Ok(())
    }

    /// Append a time cell.
    pub fn append_time(&mut self, j: usize, value: Time) -> RivuletResult<()> {
        self.account(8)?;
        match &mut self.data[j] {
            ColumnBuilder::Time(v) => v.push(value),
            _ => return Err(type_mismatch(&self.cols[j], DataType::Time)),
        }
        Ok(())
    }

    /// Append a cell, dispatching on the value.
    pub fn append_value(&mut self, j: usize, value: Value) -> RivuletResult<()> {
        match value {
            Value::Bool(v) => self.append_bool(j, v),
            Value::Int(v) => self.append_int(j, v),
            Value::UInt(v) => self.append_uint(j, v),
            Value::Float(v) => self.append_float(j, v),
            Value::String(v) => self.append_string(j, v),
            Value::Time(v) => self.append_time(j, v),
            Value::Duration(_) => Err(RivuletError::type_error(
                "durations cannot be stored in a block column",
            )),
        }
    }

    /// Append a full row read through `rr`, skipping common columns (they
    /// are materialized once on the builder).
    pub fn append_row(&mut self, rr: &dyn RowReader, i: usize) -> RivuletResult<()> {
        for (j, col) in rr.cols().iter().enumerate() {
            if col.is_common {
                continue;
            }
            match col.data_type {
                DataType::Bool => self.append_bool(j, rr.at_bool(i, j))?,
                DataType::Int => self.append_int(j, rr.at_int(i, j))?,
                DataType::UInt => self.append_uint(j, rr.at_uint(i, j))?,
                DataType::Float => self.append_float(j, rr.at_float(i, j))?,
                DataType::String => self.append_string(j, rr.at_string(i, j))?,
                DataType::Time => self.append_time(j, rr.at_time(i, j))?,
            }
        }
        Ok(())
    }

    /// Seal the builder into an immutable block. The block keeps the
    /// allocator reservation until it is dropped.
    pub fn build(self) -> MemBlock {
        MemBlock {
            bounds: self.bounds,
            tags: self.tags,
            cols: self.cols,
            data: self.data.into_iter().map(ColumnBuilder::build).collect(),
            reservation: Some(Reservation {
                alloc: self.alloc,
                bytes: self.allocated,
            }),
        }
    }
}

fn type_mismatch(col: &ColMeta, got: DataType) -> RivuletError {
    RivuletError::type_error(format!(
        "column {:?} is of type {}, cannot append {}",
        col.label, col.data_type, got
    ))
}

/// Copy a block's column layout onto a builder, seeding common tag columns
/// from the block's tag map.
pub fn add_block_cols(block: &dyn Block, builder: &mut BlockBuilder) {
    for col in block.cols() {
        let j = builder.add_col(col.clone());
        if col.is_common {
            if let Some(value) = block.tags().get(&col.label) {
                builder.set_common_string(j, value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float_builder() -> BlockBuilder {
        let mut tags = Tags::new();
        tags.insert("t1".to_string(), "a".to_string());
        let mut builder = BlockBuilder::new(
            Bounds::new(Time(0), Time(10)),
            tags,
            Arc::new(Allocator::unlimited()),
        );
        builder.add_col(ColMeta::time());
        builder.add_col(ColMeta::value(DataType::Float));
        builder.add_col(ColMeta::tag("t1", true));
        builder
    }

    #[test]
    fn test_build_block() {
        let mut builder = float_builder();
        builder.append_time(0, Time(1)).unwrap();
        builder.append_float(1, 0.5).unwrap();
        builder.append_time(0, Time(2)).unwrap();
        builder.append_float(1, 1.5).unwrap();
        assert_eq!(builder.n_rows(), 2);

        let block = builder.build();
        assert_eq!(block.n_rows(), 2);
        assert_eq!(block.data[2], Column::Common("a".to_string()));
    }

    #[test]
    fn test_append_type_mismatch() {
        let mut builder = float_builder();
        let err = builder.append_int(1, 3).unwrap_err();
        assert!(err.to_string().contains("cannot append int"));
    }

    #[test]
    fn test_allocator_reservation_released_on_drop() {
        let alloc = Arc::new(Allocator::unlimited());
        let mut builder = BlockBuilder::new(
            Bounds::new(Time(0), Time(10)),
            Tags::new(),
            Arc::clone(&alloc),
        );
        builder.add_col(ColMeta::time());
        builder.append_time(0, Time(1)).unwrap();
        assert!(alloc.used() > 0);

        let block = builder.build();
        assert!(alloc.used() > 0);
        drop(block);
        assert_eq!(alloc.used(), 0);
    }
}
