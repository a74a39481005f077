//! The block and column model.
//!
//! A block is a rectangular batch of rows sharing bounds and common tags.
//! Exactly one column is the time column; tag columns marked common hold one
//! value for every row of the block and are stored once. Blocks flow between
//! transformations behind the [`Block`] trait: materialized blocks hand out
//! their columns wholesale, storage blocks stream them frame by frame from
//! the RPC connection.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use common_error::RivuletResult;

use crate::time::{Bounds, Time};
use crate::types::{DataType, Value};

/// Label of the mandatory time column.
pub const TIME_COL_LABEL: &str = "time";
/// Label of the value column.
pub const VALUE_COL_LABEL: &str = "value";

/// Tags of a block: common tag values keyed by tag name. Ordered so block
/// keys are stable.
pub type Tags = BTreeMap<String, String>;

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColMeta {
    /// Column label.
    pub label: String,
    /// Column data type.
    pub data_type: DataType,
    /// Whether this is a tag column.
    pub is_tag: bool,
    /// Whether this tag column holds the same value for every row of the
    /// block and is stored once.
    pub is_common: bool,
}

impl ColMeta {
    /// The mandatory time column.
    pub fn time() -> Self {
        Self {
            label: TIME_COL_LABEL.to_string(),
            data_type: DataType::Time,
            is_tag: false,
            is_common: false,
        }
    }

    /// A value column of the given type.
    pub fn value(data_type: DataType) -> Self {
        Self {
            label: VALUE_COL_LABEL.to_string(),
            data_type,
            is_tag: false,
            is_common: false,
        }
    }

    /// A tag column.
    pub fn tag(label: impl Into<String>, is_common: bool) -> Self {
        Self {
            label: label.into(),
            data_type: DataType::String,
            is_tag: true,
            is_common,
        }
    }
}

/// Index of the time column.
pub fn time_idx(cols: &[ColMeta]) -> Option<usize> {
    cols.iter().position(|c| c.label == TIME_COL_LABEL)
}

/// Index of the value column.
pub fn value_idx(cols: &[ColMeta]) -> Option<usize> {
    cols.iter().position(|c| c.label == VALUE_COL_LABEL)
}

/// The identity under which blocks share a builder: bounds plus the sorted
/// common tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    /// Block bounds.
    pub bounds: Bounds,
    /// Sorted `(key, value)` common tag pairs.
    pub tags: Vec<(String, String)>,
}

impl BlockKey {
    /// Build a key from bounds and tags.
    pub fn new(bounds: Bounds, tags: &Tags) -> Self {
        Self {
            bounds,
            tags: tags
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// The key of a block.
pub fn block_key(block: &dyn Block) -> BlockKey {
    BlockKey::new(block.bounds(), block.tags())
}

/// Typed random access to the rows of the current frame.
///
/// Indices are `(row, column)`. Accessing a column with the wrong typed
/// accessor is a programming error and panics.
pub trait RowReader {
    /// Column metadata of the rows served by this reader.
    fn cols(&self) -> &[ColMeta];
    /// Read a bool cell.
    fn at_bool(&self, i: usize, j: usize) -> bool;
    /// Read an int cell.
    fn at_int(&self, i: usize, j: usize) -> i64;
    /// Read a uint cell.
    fn at_uint(&self, i: usize, j: usize) -> u64;
    /// Read a float cell.
    fn at_float(&self, i: usize, j: usize) -> f64;
    /// Read a string cell.
    fn at_string(&self, i: usize, j: usize) -> &str;
    /// Read a time cell.
    fn at_time(&self, i: usize, j: usize) -> Time;
}

/// Read one cell as a [`Value`], dispatching on the column type.
pub fn value_for_row(rr: &dyn RowReader, i: usize, j: usize, col: &ColMeta) -> Value {
    match col.data_type {
        DataType::Bool => Value::Bool(rr.at_bool(i, j)),
        DataType::Int => Value::Int(rr.at_int(i, j)),
        DataType::UInt => Value::UInt(rr.at_uint(i, j)),
        DataType::Float => Value::Float(rr.at_float(i, j)),
        DataType::String => Value::String(rr.at_string(i, j).to_string()),
        DataType::Time => Value::Time(rr.at_time(i, j)),
    }
}

/// A captured row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Cell values, one per column.
    pub values: Vec<Value>,
}

/// Capture a full row through a row reader.
pub fn read_row(rr: &dyn RowReader, i: usize) -> Row {
    Row {
        values: rr
            .cols()
            .iter()
            .enumerate()
            .map(|(j, col)| value_for_row(rr, i, j, col))
            .collect(),
    }
}

/// Iteration over one column of a block, one frame at a time.
///
/// The typed `do_*` drivers assert the column type and invoke the callback
/// once per frame with the frame's values and a [`RowReader`] positioned on
/// that frame. A storage-backed iterator holds the RPC stream exclusively
/// until it completes, then signals the block's `done` latch.
#[async_trait]
pub trait ValueIterator: Send {
    /// Drive a bool column.
    async fn do_bool(
        &mut self,
        f: &mut (dyn for<'r> FnMut(&'r [bool], &'r dyn RowReader) + Send),
    ) -> RivuletResult<()>;
    /// Drive an int column.
    async fn do_int(
        &mut self,
        f: &mut (dyn for<'r> FnMut(&'r [i64], &'r dyn RowReader) + Send),
    ) -> RivuletResult<()>;
    /// Drive a uint column.
    async fn do_uint(
        &mut self,
        f: &mut (dyn for<'r> FnMut(&'r [u64], &'r dyn RowReader) + Send),
    ) -> RivuletResult<()>;
    /// Drive a float column.
    async fn do_float(
        &mut self,
        f: &mut (dyn for<'r> FnMut(&'r [f64], &'r dyn RowReader) + Send),
    ) -> RivuletResult<()>;
    /// Drive a string column.
    async fn do_string(
        &mut self,
        f: &mut (dyn for<'r> FnMut(&'r [String], &'r dyn RowReader) + Send),
    ) -> RivuletResult<()>;
    /// Drive the time column.
    async fn do_time(
        &mut self,
        f: &mut (dyn for<'r> FnMut(&'r [Time], &'r dyn RowReader) + Send),
    ) -> RivuletResult<()>;
}

/// A rectangular batch of rows flowing on an edge of the execution DAG.
pub trait Block: Send + Sync {
    /// Block bounds.
    fn bounds(&self) -> Bounds;
    /// Common tag values.
    fn tags(&self) -> &Tags;
    /// Column metadata, in stable order.
    fn cols(&self) -> &[ColMeta];
    /// Iterate one column.
    fn col(&self, j: usize) -> Box<dyn ValueIterator + Send + '_>;

    /// Iterate the time column.
    fn times(&self) -> Box<dyn ValueIterator + Send + '_> {
        let j = time_idx(self.cols()).expect("block has no time column");
        self.col(j)
    }

    /// Iterate the value column.
    fn values(&self) -> Box<dyn ValueIterator + Send + '_> {
        let j = value_idx(self.cols()).expect("block has no value column");
        self.col(j)
    }
}

/// Pull-based iteration over the blocks of a storage read.
///
/// `next_block` never advances past a block whose `done` latch has not been
/// signalled; unread point frames of a skipped block are discarded when the
/// iterator moves to the next series frame.
#[async_trait]
pub trait BlockIterator: Send {
    /// The next block, or `None` on clean end of stream.
    async fn next_block(&mut self) -> RivuletResult<Option<Arc<dyn Block>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_col_meta_constructors() {
        let time = ColMeta::time();
        assert_eq!(time.label, "time");
        assert_eq!(time.data_type, DataType::Time);
        assert!(!time.is_tag);

        let value = ColMeta::value(DataType::Float);
        assert_eq!(value.label, "value");

        let tag = ColMeta::tag("host", true);
        assert!(tag.is_tag && tag.is_common);
        assert_eq!(tag.data_type, DataType::String);
    }

    #[test]
    fn test_block_key_equality() {
        let mut tags = Tags::new();
        tags.insert("t1".to_string(), "a".to_string());
        tags.insert("t0".to_string(), "b".to_string());
        let key = BlockKey::new(Bounds::new(Time(0), Time(10)), &tags);
        // BTreeMap iteration sorts tag keys.
        assert_eq!(
            key.tags,
            vec![
                ("t0".to_string(), "b".to_string()),
                ("t1".to_string(), "a".to_string())
            ]
        );

        let same = BlockKey::new(Bounds::new(Time(0), Time(10)), &tags);
        assert_eq!(key, same);

        let other = BlockKey::new(Bounds::new(Time(0), Time(11)), &tags);
        assert_ne!(key, other);
    }
}
