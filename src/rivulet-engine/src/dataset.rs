//! Datasets: per-procedure runtime state.
//!
//! A dataset owns its builder cache and the channels to its downstream
//! subscribers. It tracks the watermark of every input, forwards the
//! minimum, flushes completed builders as the watermark passes them, and
//! guarantees exactly one `finish` regardless of how execution ends.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use common_error::{RivuletError, RivuletResult};
use rivulet_core::block::{Block, BlockKey};
use rivulet_core::Time;
use rivulet_plan::ProcedureId;

use crate::cache::BlockBuilderCache;

/// Identity of a dataset. Datasets are one-to-one with procedures.
pub type DatasetId = ProcedureId;

/// Errors shared across fan-out edges.
pub type SharedError = Arc<RivuletError>;

/// A message on a parent → child edge.
#[derive(Clone)]
pub enum Message {
    /// A block to consume.
    Process(Arc<dyn Block>),
    /// Invalidate a previously emitted block with this key.
    Retract(BlockKey),
    /// All data with time < t has been delivered on this edge.
    Watermark(Time),
    /// Wall-clock advance hint.
    ProcessingTime(Time),
    /// This parent is done; an error aborts the downstream subtree.
    Finish(Option<SharedError>),
}

/// A message tagged with the sending dataset.
#[derive(Clone)]
pub struct Envelope {
    /// The sending dataset.
    pub from: DatasetId,
    /// The message.
    pub message: Message,
}

/// Per-procedure runtime state.
pub struct Dataset {
    id: DatasetId,
    cache: BlockBuilderCache,
    outputs: Vec<mpsc::Sender<Envelope>>,
    input_watermarks: HashMap<DatasetId, Time>,
    output_watermark: Option<Time>,
    finished: bool,
}

impl Dataset {
    /// Create a dataset with its downstream senders.
    pub fn new(
        id: DatasetId,
        cache: BlockBuilderCache,
        outputs: Vec<mpsc::Sender<Envelope>>,
    ) -> Self {
        Self {
            id,
            cache,
            outputs,
            input_watermarks: HashMap::new(),
            output_watermark: None,
            finished: false,
        }
    }

    /// The dataset id.
    pub fn id(&self) -> DatasetId {
        self.id
    }

    /// The builder cache.
    pub fn cache(&mut self) -> &mut BlockBuilderCache {
        &mut self.cache
    }

    /// Number of downstream subscribers.
    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    async fn send(&self, message: Message) {
        for tx in &self.outputs {
            // A closed receiver means the child already finished (e.g. on
            // cancellation); ownership of the block simply ends here.
            let _ = tx
                .send(Envelope {
                    from: self.id,
                    message: message.clone(),
                })
                .await;
        }
    }

    /// Forward a block downstream, transferring ownership.
    pub async fn process_block(&mut self, block: Arc<dyn Block>) -> RivuletResult<()> {
        self.send(Message::Process(block)).await;
        Ok(())
    }

    /// Record an input watermark and forward the new minimum if it
    /// advanced. Builders whose bounds close at or before the output
    /// watermark are sealed and emitted.
    pub async fn update_watermark(&mut self, parent: DatasetId, t: Time) -> RivuletResult<()> {
        let entry = self.input_watermarks.entry(parent).or_insert(Time::MIN);
        if t > *entry {
            *entry = t;
        }
        let min = self
            .input_watermarks
            .values()
            .copied()
            .min()
            .unwrap_or(Time::MIN);
        if self.output_watermark.is_some_and(|w| min <= w) {
            return Ok(());
        }
        self.output_watermark = Some(min);

        for block in self.cache.flush_up_to(min) {
            self.send(Message::Process(Arc::new(block))).await;
        }
        self.send(Message::Watermark(min)).await;
        Ok(())
    }

    /// Forward a processing-time advance.
    pub async fn update_processing_time(&mut self, t: Time) -> RivuletResult<()> {
        self.send(Message::ProcessingTime(t)).await;
        Ok(())
    }

    /// Drop the builder for a key and propagate the retraction.
    pub async fn retract_block(&mut self, key: BlockKey) -> RivuletResult<()> {
        self.cache.retract(&key);
        self.send(Message::Retract(key)).await;
        Ok(())
    }

    /// Finish this dataset exactly once. On success all remaining builders
    /// are sealed and emitted before the finish propagates; on error or
    /// cancellation they are dropped.
    pub async fn finish(&mut self, err: Option<SharedError>) {
        if self.finished {
            return;
        }
        self.finished = true;
        debug!(dataset = %self.id, error = err.as_deref().map(tracing::field::display), "dataset finished");

        if err.is_none() {
            for block in self.cache.flush_all() {
                self.send(Message::Process(Arc::new(block))).await;
            }
        }
        self.send(Message::Finish(err)).await;
    }

    /// Whether `finish` has run.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Allocator;
    use crate::testing::literal_block;
    use rivulet_core::block::ColMeta;
    use rivulet_core::{Bounds, DataType, Value};

    fn test_dataset() -> (Dataset, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(16);
        let id = DatasetId::from_operation(&rivulet_core::OperationId::new("from0"));
        let cache = BlockBuilderCache::new(Arc::new(Allocator::unlimited()));
        (Dataset::new(id, cache, vec![tx]), rx)
    }

    fn parent() -> DatasetId {
        DatasetId::from_operation(&rivulet_core::OperationId::new("parent0"))
    }

    #[tokio::test]
    async fn test_watermarks_are_monotonic() {
        let (mut dataset, mut rx) = test_dataset();
        dataset.update_watermark(parent(), Time(10)).await.unwrap();
        dataset.update_watermark(parent(), Time(5)).await.unwrap();
        dataset.update_watermark(parent(), Time(20)).await.unwrap();
        dataset.finish(None).await;
        drop(dataset);

        let mut marks = Vec::new();
        while let Some(env) = rx.recv().await {
            if let Message::Watermark(t) = env.message {
                marks.push(t);
            }
        }
        assert_eq!(marks, vec![Time(10), Time(20)]);
    }

    #[tokio::test]
    async fn test_watermark_is_min_across_parents() {
        let (mut dataset, mut rx) = test_dataset();
        let p1 = parent();
        let p2 = DatasetId::from_operation(&rivulet_core::OperationId::new("parent1"));

        dataset.update_watermark(p1, Time(10)).await.unwrap();
        dataset.update_watermark(p2, Time(4)).await.unwrap();
        dataset.update_watermark(p2, Time(30)).await.unwrap();
        dataset.finish(None).await;
        drop(dataset);

        let mut marks = Vec::new();
        while let Some(env) = rx.recv().await {
            if let Message::Watermark(t) = env.message {
                marks.push(t);
            }
        }
        // p1 alone: min 10. p2 joins at 4: min 4, no advance past 10 seen
        // yet, so still 10 is the only forwarded mark until p2 reaches 30,
        // then min(10, 30) = 10 brings no advance either.
        assert_eq!(marks, vec![Time(10)]);
    }

    #[tokio::test]
    async fn test_finish_is_latched() {
        let (mut dataset, mut rx) = test_dataset();
        dataset.finish(None).await;
        dataset.finish(None).await;
        drop(dataset);

        let mut finishes = 0;
        while let Some(env) = rx.recv().await {
            if matches!(env.message, Message::Finish(_)) {
                finishes += 1;
            }
        }
        assert_eq!(finishes, 1);
    }

    #[tokio::test]
    async fn test_finish_flushes_builders() {
        let (mut dataset, mut rx) = test_dataset();
        let block = literal_block(
            Bounds::new(Time(0), Time(10)),
            vec![ColMeta::time(), ColMeta::value(DataType::Int)],
            vec![vec![Value::Time(Time(1)), Value::Int(5)]],
        );
        {
            let (builder, new) = dataset.cache().builder(&block);
            assert!(new);
            builder.add_col(ColMeta::time());
            builder.add_col(ColMeta::value(DataType::Int));
            builder.append_time(0, Time(1)).unwrap();
            builder.append_int(1, 5).unwrap();
        }
        dataset.finish(None).await;
        drop(dataset);

        let mut blocks = 0;
        let mut finishes = 0;
        while let Some(env) = rx.recv().await {
            match env.message {
                Message::Process(_) => blocks += 1,
                Message::Finish(_) => finishes += 1,
                _ => {}
            }
        }
        assert_eq!((blocks, finishes), (1, 1));
    }
}
