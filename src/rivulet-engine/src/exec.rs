//! The execution scheduler.
//!
//! One worker per procedure: sources pull from storage, transformations
//! consume their input channel. Edges are bounded mpsc channels, so a slow
//! consumer backpressures its producers. Result procedures additionally
//! feed a collector that materializes their output blocks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use common_config::ExecutionConfig;
use common_error::{RivuletError, RivuletResult};
use rivulet_core::{Bounds, Time};
use rivulet_plan::{PlanSpec, ProcedureId, ProcedureSpec};
use rivulet_storage::StorageReader;

use crate::allocator::Allocator;
use crate::block::{materialize, MemBlock};
use crate::cache::BlockBuilderCache;
use crate::dataset::{Dataset, DatasetId, Envelope, Message, SharedError};
use crate::source::StorageSource;
use crate::transformation::{build_transformation, Source, Transformation};

/// Shared state handed to every worker.
#[derive(Clone)]
pub struct ExecutionContext {
    /// The resolved query-wide window.
    pub bounds: Bounds,
    /// The query's `now`.
    pub now: Time,
    /// The query allocator.
    pub allocator: Arc<Allocator>,
    /// Cooperative cancellation signal.
    pub cancel: watch::Receiver<bool>,
}

/// Handle for cancelling a running query.
#[derive(Clone)]
pub struct CancellationHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancellationHandle {
    /// Create a handle and the receiver to pass to the executor.
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Cancel the query.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Whether the query was cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// The ordered output blocks of one result procedure.
#[derive(Debug)]
pub struct ResultSet {
    /// The result procedure.
    pub id: ProcedureId,
    /// Its blocks, in arrival order.
    pub blocks: Vec<MemBlock>,
}

/// The outcome of executing a plan.
#[derive(Debug)]
pub struct ExecutionResult {
    /// One result set per result procedure, in plan order.
    pub results: Vec<ResultSet>,
}

impl ExecutionResult {
    /// Total number of result blocks.
    pub fn total_blocks(&self) -> usize {
        self.results.iter().map(|r| r.blocks.len()).sum()
    }

    /// The result set of one procedure.
    pub fn result_of(&self, id: ProcedureId) -> Option<&ResultSet> {
        self.results.iter().find(|r| r.id == id)
    }
}

/// Executes physical plans.
pub struct Executor {
    config: ExecutionConfig,
}

impl Executor {
    /// Create an executor with default configuration.
    pub fn new() -> Self {
        Self {
            config: ExecutionConfig::default(),
        }
    }

    /// Create an executor with custom configuration.
    pub fn with_config(config: ExecutionConfig) -> Self {
        Self { config }
    }

    /// The executor configuration.
    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Execute a plan against a storage reader.
    pub async fn execute(
        &self,
        plan: &PlanSpec,
        reader: Arc<dyn StorageReader>,
        now: Time,
    ) -> RivuletResult<ExecutionResult> {
        self.execute_with_cancellation(plan, reader, now, None)
            .await
    }

    /// Execute a plan, observing an external cancellation signal.
    pub async fn execute_with_cancellation(
        &self,
        plan: &PlanSpec,
        reader: Arc<dyn StorageReader>,
        now: Time,
        external_cancel: Option<watch::Receiver<bool>>,
    ) -> RivuletResult<ExecutionResult> {
        let bounds = plan.bounds.resolve(now);
        let allocator = Arc::new(Allocator::new(self.config.memory_limit));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);

        let ctx = ExecutionContext {
            bounds,
            now,
            allocator: Arc::clone(&allocator),
            cancel: cancel_rx,
        };

        let queue = self.config.queue_size.max(1);
        let mut senders: HashMap<ProcedureId, mpsc::Sender<Envelope>> = HashMap::new();
        let mut receivers: HashMap<ProcedureId, mpsc::Receiver<Envelope>> = HashMap::new();
        for id in &plan.order {
            let proc = plan
                .procedures
                .get(id)
                .ok_or_else(|| RivuletError::internal(format!("plan order names unknown procedure {id}")))?;
            if !proc.spec.is_source() {
                let (tx, rx) = mpsc::channel(queue);
                senders.insert(*id, tx);
                receivers.insert(*id, rx);
            }
        }
        let (result_tx, result_rx) = mpsc::channel(queue);

        let mut tasks = common_runtime::JoinSet::new();
        for id in &plan.order {
            let proc = plan.procedures[id].clone();
            let mut outputs = Vec::with_capacity(proc.children.len() + 1);
            for child in &proc.children {
                let tx = senders.get(child).ok_or_else(|| {
                    RivuletError::internal(format!("procedure {child} has no input channel"))
                })?;
                outputs.push(tx.clone());
            }
            if plan.results.contains(id) {
                outputs.push(result_tx.clone());
            }
            let dataset = Dataset::new(
                *id,
                BlockBuilderCache::new(Arc::clone(&allocator)),
                outputs,
            );

            if let ProcedureSpec::From(spec) = &proc.spec {
                let mut source =
                    StorageSource::new(spec.clone(), Arc::clone(&reader), dataset);
                let ctx = ctx.clone();
                tasks.spawn(async move {
                    source.run(&ctx).await;
                });
            } else {
                let mut transformation = build_transformation(&proc, dataset, &ctx)?;
                transformation.set_parents(proc.parents.clone());
                let rx = receivers.remove(id).ok_or_else(|| {
                    RivuletError::internal(format!("procedure {id} has no input channel"))
                })?;
                let ctx = ctx.clone();
                let n_parents = proc.parents.len();
                let id = *id;
                tasks.spawn(async move {
                    run_worker(id, transformation, rx, n_parents, ctx).await;
                });
            }
        }
        drop(result_tx);
        drop(senders);

        // Forward an external cancellation onto the query's own signal.
        if let Some(mut external) = external_cancel {
            let tx = Arc::clone(&cancel_tx);
            tokio::spawn(async move {
                let already_cancelled = *external.borrow();
                if already_cancelled || external.changed().await.is_ok() {
                    let _ = tx.send(true);
                }
            });
        }

        // Collect result blocks, optionally bounded by the query timeout.
        let collect = collect_results(result_rx, &plan.results, Arc::clone(&allocator));
        let mut timed_out = false;
        let (collected, first_err) = if self.config.timeout_ms > 0 {
            let limit = std::time::Duration::from_millis(self.config.timeout_ms);
            match tokio::time::timeout(limit, collect).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    timed_out = true;
                    let _ = cancel_tx.send(true);
                    (HashMap::new(), None)
                }
            }
        } else {
            collect.await
        };

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                return Err(RivuletError::internal(format!("worker panicked: {e}")));
            }
        }
        debug!(live_bytes = allocator.used(), "execution complete");

        if timed_out {
            return Err(RivuletError::cancelled("query timed out"));
        }
        if let Some(err) = first_err {
            return Err(clone_error(&err));
        }

        let mut collected = collected;
        let results = plan
            .results
            .iter()
            .map(|id| ResultSet {
                id: *id,
                blocks: collected.remove(id).unwrap_or_default(),
            })
            .collect();
        Ok(ExecutionResult { results })
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_worker(
    id: DatasetId,
    mut t: Box<dyn Transformation>,
    mut rx: mpsc::Receiver<Envelope>,
    n_parents: usize,
    ctx: ExecutionContext,
) {
    let mut cancel = ctx.cancel.clone();
    let mut finished_parents = 0usize;

    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_ok() && *cancel.borrow() {
                    t.finish(id, Some(Arc::new(RivuletError::cancelled("query cancelled"))))
                        .await;
                    return;
                }
                if changed.is_err() {
                    // The cancel source is gone; fall back to draining the
                    // input channel.
                    while let Some(env) = rx.recv().await {
                        if dispatch(id, &mut t, env, &mut finished_parents, n_parents).await {
                            return;
                        }
                    }
                    t.finish(id, None).await;
                    return;
                }
            }
            env = rx.recv() => {
                match env {
                    None => {
                        // All parents hung up without a finish; treat as done.
                        t.finish(id, None).await;
                        return;
                    }
                    Some(env) => {
                        if dispatch(id, &mut t, env, &mut finished_parents, n_parents).await {
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Apply one message; true when the worker is done.
async fn dispatch(
    id: DatasetId,
    t: &mut Box<dyn Transformation>,
    env: Envelope,
    finished_parents: &mut usize,
    n_parents: usize,
) -> bool {
    let from = env.from;
    let result = match env.message {
        Message::Process(block) => t.process(from, block).await,
        Message::Retract(key) => t.retract_block(from, key).await,
        Message::Watermark(w) => t.update_watermark(from, w).await,
        Message::ProcessingTime(p) => t.update_processing_time(from, p).await,
        Message::Finish(err) => {
            let fatal = err.is_some();
            t.finish(from, err).await;
            if fatal {
                return true;
            }
            *finished_parents += 1;
            return *finished_parents >= n_parents;
        }
    };
    if let Err(e) = result {
        debug!(worker = %id, error = %e, "transformation failed");
        t.finish(from, Some(Arc::new(e))).await;
        return true;
    }
    false
}

async fn collect_results(
    mut rx: mpsc::Receiver<Envelope>,
    result_ids: &[ProcedureId],
    alloc: Arc<Allocator>,
) -> (HashMap<ProcedureId, Vec<MemBlock>>, Option<SharedError>) {
    let mut pending: HashSet<ProcedureId> = result_ids.iter().copied().collect();
    let mut out: HashMap<ProcedureId, Vec<MemBlock>> = HashMap::new();
    let mut first_err: Option<SharedError> = None;

    while !pending.is_empty() {
        let Some(env) = rx.recv().await else {
            break;
        };
        match env.message {
            Message::Process(block) => match materialize(&*block, &alloc).await {
                Ok(mb) => out.entry(env.from).or_default().push(mb),
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(Arc::new(e));
                    }
                }
            },
            Message::Finish(err) => {
                if let Some(e) = err {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                pending.remove(&env.from);
            }
            _ => {}
        }
    }
    (out, first_err)
}

/// Rebuild an owned error from a shared one, preserving the variant for the
/// kinds callers distinguish.
pub(crate) fn clone_error(err: &RivuletError) -> RivuletError {
    match err {
        RivuletError::TypeError(m) => RivuletError::TypeError(m.clone()),
        RivuletError::ValueError(m) => RivuletError::ValueError(m.clone()),
        RivuletError::EvaluationError(m) => RivuletError::EvaluationError(m.clone()),
        RivuletError::PlanningError(m) => RivuletError::PlanningError(m.clone()),
        RivuletError::CompilationError(m) => RivuletError::CompilationError(m.clone()),
        RivuletError::StorageError(m) => RivuletError::StorageError(m.clone()),
        RivuletError::ExecutionError(m) => RivuletError::ExecutionError(m.clone()),
        RivuletError::ResourceExhausted(m) => RivuletError::ResourceExhausted(m.clone()),
        RivuletError::Cancelled(m) => RivuletError::Cancelled(m.clone()),
        RivuletError::InternalError(m) => RivuletError::InternalError(m.clone()),
        other => RivuletError::execution(other.to_string()),
    }
}
