//! Test helpers: literal-row block construction and transformation drivers.
//!
//! Kept in the library (not behind `cfg(test)`) so integration tests and
//! downstream crates can exercise transformations with literal data.

use std::sync::Arc;

use tokio::sync::mpsc;

use common_error::{RivuletError, RivuletResult};
use rivulet_core::block::{Block, ColMeta, Tags};
use rivulet_core::{Bounds, OperationId, Value};

use crate::allocator::Allocator;
use crate::block::{materialize, Column, MemBlock};
use crate::cache::BlockBuilderCache;
use crate::dataset::{Dataset, DatasetId, Envelope, Message};
use crate::exec::clone_error;
use crate::transformation::Transformation;

/// Build a block from literal rows. Common tag columns take their value
/// from the first row and populate the block's tag map.
///
/// # Panics
///
/// Panics when a cell does not match its column type. Test input only.
pub fn literal_block(bounds: Bounds, cols: Vec<ColMeta>, rows: Vec<Vec<Value>>) -> MemBlock {
    let mut tags = Tags::new();
    let mut data = Vec::with_capacity(cols.len());

    for (j, col) in cols.iter().enumerate() {
        if col.is_common {
            let value = rows
                .first()
                .and_then(|row| row.get(j))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            tags.insert(col.label.clone(), value.clone());
            data.push(Column::Common(value));
            continue;
        }
        let column = match col.data_type {
            rivulet_core::DataType::Bool => Column::Bool(
                rows.iter()
                    .map(|row| row[j].as_bool().expect("bool cell"))
                    .collect(),
            ),
            rivulet_core::DataType::Int => Column::Int(
                rows.iter()
                    .map(|row| row[j].as_int().expect("int cell"))
                    .collect(),
            ),
            rivulet_core::DataType::UInt => Column::UInt(
                rows.iter()
                    .map(|row| row[j].as_uint().expect("uint cell"))
                    .collect(),
            ),
            rivulet_core::DataType::Float => Column::Float(
                rows.iter()
                    .map(|row| row[j].as_float().expect("float cell"))
                    .collect(),
            ),
            rivulet_core::DataType::String => Column::String(
                rows.iter()
                    .map(|row| row[j].as_str().expect("string cell").to_string())
                    .collect(),
            ),
            rivulet_core::DataType::Time => Column::Time(
                rows.iter()
                    .map(|row| row[j].as_time().expect("time cell"))
                    .collect(),
            ),
        };
        data.push(column);
    }

    MemBlock::new(bounds, tags, cols, data)
}

/// Extract every row of a materialized block as values. Common columns
/// yield their single value in every row.
pub fn rows_of(block: &MemBlock) -> Vec<Vec<Value>> {
    let n = block.n_rows();
    (0..n)
        .map(|i| {
            block
                .data
                .iter()
                .map(|col| match col {
                    Column::Bool(v) => Value::Bool(v[i]),
                    Column::Int(v) => Value::Int(v[i]),
                    Column::UInt(v) => Value::UInt(v[i]),
                    Column::Float(v) => Value::Float(v[i]),
                    Column::String(v) => Value::String(v[i].clone()),
                    Column::Time(v) => Value::Time(v[i]),
                    Column::Common(v) => Value::String(v.clone()),
                })
                .collect()
        })
        .collect()
}

/// Drain a dataset output channel, materializing emitted blocks. Returns
/// the error carried by a finish message, if any.
pub async fn collect_outputs(mut rx: mpsc::Receiver<Envelope>) -> RivuletResult<Vec<MemBlock>> {
    let alloc = Arc::new(Allocator::unlimited());
    let mut out = Vec::new();
    while let Some(env) = rx.recv().await {
        match env.message {
            Message::Process(block) => out.push(materialize(&*block, &alloc).await?),
            Message::Finish(Some(err)) => return Err(clone_error(&err)),
            _ => {}
        }
    }
    Ok(out)
}

/// Drive a transformation over literal blocks and collect what it emits.
pub async fn run_transformation(
    build: impl FnOnce(Dataset) -> Box<dyn Transformation>,
    blocks: Vec<MemBlock>,
) -> RivuletResult<Vec<MemBlock>> {
    let (tx, rx) = mpsc::channel(64);
    let id = DatasetId::from_operation(&OperationId::new("under-test"));
    let parent = DatasetId::from_operation(&OperationId::new("parent"));

    let cache = BlockBuilderCache::new(Arc::new(Allocator::unlimited()));
    let dataset = Dataset::new(id, cache, vec![tx]);
    let mut transformation = build(dataset);
    transformation.set_parents(vec![parent]);

    let mut process_err: Option<RivuletError> = None;
    for block in blocks {
        if let Err(e) = transformation.process(parent, Arc::new(block)).await {
            process_err = Some(e);
            break;
        }
    }
    match process_err {
        Some(e) => Err(e),
        None => {
            transformation.finish(parent, None).await;
            drop(transformation);
            collect_outputs(rx).await
        }
    }
}

/// A literal block exposed as a `dyn Block` for iterator-facing tests.
pub fn as_block(block: MemBlock) -> Arc<dyn Block> {
    Arc::new(block)
}

/// A storage reader serving canned blocks, recording every read spec.
pub struct MockStorageReader {
    blocks: Vec<Arc<dyn Block>>,
    requests: std::sync::Mutex<Vec<rivulet_storage::ReadSpec>>,
    /// When set, reads never produce a block until the query is cancelled.
    hang: bool,
}

impl MockStorageReader {
    /// Serve the given blocks on every read.
    pub fn new(blocks: Vec<MemBlock>) -> Self {
        Self {
            blocks: blocks
                .into_iter()
                .map(|b| Arc::new(b) as Arc<dyn Block>)
                .collect(),
            requests: std::sync::Mutex::new(Vec::new()),
            hang: false,
        }
    }

    /// A reader whose block iterator never yields.
    pub fn hanging() -> Self {
        Self {
            blocks: Vec::new(),
            requests: std::sync::Mutex::new(Vec::new()),
            hang: true,
        }
    }

    /// The read specs observed so far.
    pub fn requests(&self) -> Vec<rivulet_storage::ReadSpec> {
        self.requests.lock().expect("requests poisoned").clone()
    }
}

#[async_trait::async_trait]
impl rivulet_storage::StorageReader for MockStorageReader {
    async fn read(
        &self,
        spec: rivulet_storage::ReadSpec,
        _start: rivulet_core::Time,
        _stop: rivulet_core::Time,
    ) -> RivuletResult<Box<dyn rivulet_core::block::BlockIterator>> {
        self.requests.lock().expect("requests poisoned").push(spec);
        Ok(Box::new(MockBlockIterator {
            blocks: self.blocks.clone().into(),
            hang: self.hang,
        }))
    }

    fn close(&self) {}
}

struct MockBlockIterator {
    blocks: std::collections::VecDeque<Arc<dyn Block>>,
    hang: bool,
}

#[async_trait::async_trait]
impl rivulet_core::block::BlockIterator for MockBlockIterator {
    async fn next_block(&mut self) -> RivuletResult<Option<Arc<dyn Block>>> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        Ok(self.blocks.pop_front())
    }
}
