//! The builder cache.
//!
//! Each dataset owns one cache mapping block keys to builders, so that
//! transformations append to the same output block for rows sharing
//! `(bounds, common tags)`.

use std::collections::HashMap;
use std::sync::Arc;

use rivulet_core::block::{block_key, Block, BlockKey, Tags};
use rivulet_core::{Bounds, Time};

use crate::allocator::Allocator;
use crate::block::MemBlock;
use crate::builder::BlockBuilder;

/// Builder cache keyed by [`BlockKey`].
pub struct BlockBuilderCache {
    builders: HashMap<BlockKey, BlockBuilder>,
    alloc: Arc<Allocator>,
}

impl BlockBuilderCache {
    /// Create an empty cache allocating through `alloc`.
    pub fn new(alloc: Arc<Allocator>) -> Self {
        Self {
            builders: HashMap::new(),
            alloc,
        }
    }

    /// The query allocator.
    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.alloc
    }

    /// The builder for a block's key. `true` means the builder is new and
    /// the caller must add its columns.
    pub fn builder(&mut self, block: &dyn Block) -> (&mut BlockBuilder, bool) {
        self.builder_for(block.bounds(), block.tags().clone())
    }

    /// The builder for explicit bounds and common tags.
    pub fn builder_for(&mut self, bounds: Bounds, tags: Tags) -> (&mut BlockBuilder, bool) {
        let key = BlockKey::new(bounds, &tags);
        let mut new = false;
        let builder = self.builders.entry(key).or_insert_with(|| {
            new = true;
            BlockBuilder::new(bounds, tags, Arc::clone(&self.alloc))
        });
        (builder, new)
    }

    /// Discard the builder for a key. Returns whether one existed.
    pub fn retract(&mut self, key: &BlockKey) -> bool {
        self.builders.remove(key).is_some()
    }

    /// Seal and drain the builders whose bounds close at or before the
    /// watermark, in deterministic key order.
    pub fn flush_up_to(&mut self, watermark: Time) -> Vec<MemBlock> {
        let mut keys: Vec<BlockKey> = self
            .builders
            .keys()
            .filter(|k| k.bounds.stop <= watermark)
            .cloned()
            .collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|k| self.builders.remove(&k))
            .map(BlockBuilder::build)
            .collect()
    }

    /// Seal and drain every builder, in deterministic key order.
    pub fn flush_all(&mut self) -> Vec<MemBlock> {
        let mut keys: Vec<BlockKey> = self.builders.keys().cloned().collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|k| self.builders.remove(&k))
            .map(BlockBuilder::build)
            .collect()
    }

    /// Whether the cache holds no builders.
    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }
}

/// The key of a block, re-exported next to the cache that uses it.
pub fn key_of(block: &dyn Block) -> BlockKey {
    block_key(block)
}
