//! Transformation and source contracts.

use std::sync::Arc;

use async_trait::async_trait;

use common_error::{RivuletError, RivuletResult};
use rivulet_core::block::{Block, BlockKey};
use rivulet_core::Time;
use rivulet_plan::{Procedure, ProcedureSpec};

use crate::dataset::{Dataset, DatasetId, SharedError};
use crate::exec::ExecutionContext;
use crate::transformations::{
    AggregateKind, AggregateTransformation, FilterTransformation, GroupTransformation,
    JoinTransformation, LimitTransformation, RangeTransformation, RowSelectorTransformation,
    SelectorKind, WindowTransformation,
};

/// A runtime node consuming parent blocks and emitting derived blocks
/// through its dataset.
///
/// For a given parent, `finish` is delivered strictly after every other
/// call from that parent. On the last parent's finish the implementation
/// must finish its dataset, flushing pending builders downstream.
#[async_trait]
pub trait Transformation: Send {
    /// Consume one block.
    async fn process(&mut self, parent: DatasetId, block: Arc<dyn Block>) -> RivuletResult<()>;

    /// Invalidate a previously emitted block with this key.
    async fn retract_block(&mut self, parent: DatasetId, key: BlockKey) -> RivuletResult<()>;

    /// All data with time < t has been delivered on this input.
    async fn update_watermark(&mut self, parent: DatasetId, t: Time) -> RivuletResult<()>;

    /// Wall-clock advance hint for windowed triggers.
    async fn update_processing_time(&mut self, parent: DatasetId, t: Time) -> RivuletResult<()>;

    /// This parent is done. Called once per parent; the transformation
    /// finishes its dataset when the last parent (or an error) arrives.
    async fn finish(&mut self, parent: DatasetId, err: Option<SharedError>);

    /// Wire the parent identities before execution starts.
    fn set_parents(&mut self, parents: Vec<DatasetId>);
}

/// A runtime node producing blocks from outside the graph.
#[async_trait]
pub trait Source: Send {
    /// Pull data and forward it to the dataset, then finish with success or
    /// error. Must observe the context's cancellation signal.
    async fn run(&mut self, ctx: &ExecutionContext);
}

/// Instantiate the transformation for a non-source procedure.
pub fn build_transformation(
    procedure: &Procedure,
    dataset: Dataset,
    ctx: &ExecutionContext,
) -> RivuletResult<Box<dyn Transformation>> {
    Ok(match &procedure.spec {
        ProcedureSpec::Filter(spec) => {
            Box::new(FilterTransformation::new(dataset, &spec.expression)?)
        }
        ProcedureSpec::Range(spec) => Box::new(RangeTransformation::new(
            dataset,
            spec.bounds.resolve(ctx.now),
        )),
        ProcedureSpec::Limit(spec) => {
            Box::new(LimitTransformation::new(dataset, spec.n, spec.offset)?)
        }
        ProcedureSpec::Group(spec) => Box::new(GroupTransformation::new(dataset, spec.by.clone())),
        ProcedureSpec::Window(spec) => Box::new(WindowTransformation::new(
            dataset,
            spec.every,
            spec.period,
            spec.start.map_or(ctx.bounds.start, |s| s.resolve(ctx.now)),
        )?),
        ProcedureSpec::First(spec) => Box::new(RowSelectorTransformation::new(
            dataset,
            SelectorKind::First,
            spec.use_row_time,
        )),
        ProcedureSpec::Last(spec) => Box::new(RowSelectorTransformation::new(
            dataset,
            SelectorKind::Last,
            spec.use_row_time,
        )),
        ProcedureSpec::Min(spec) => Box::new(RowSelectorTransformation::new(
            dataset,
            SelectorKind::Min,
            spec.use_row_time,
        )),
        ProcedureSpec::Max(spec) => Box::new(RowSelectorTransformation::new(
            dataset,
            SelectorKind::Max,
            spec.use_row_time,
        )),
        ProcedureSpec::Sum {} => Box::new(AggregateTransformation::new(
            dataset,
            AggregateKind::Sum,
        )),
        ProcedureSpec::Count {} => Box::new(AggregateTransformation::new(
            dataset,
            AggregateKind::Count,
        )),
        ProcedureSpec::Mean {} => Box::new(AggregateTransformation::new(
            dataset,
            AggregateKind::Mean,
        )),
        ProcedureSpec::Join(spec) => Box::new(JoinTransformation::new(dataset, spec.on.clone())),
        ProcedureSpec::From(_) => {
            return Err(RivuletError::planning(format!(
                "procedure {} is a source, not a transformation",
                procedure.id
            )));
        }
    })
}
