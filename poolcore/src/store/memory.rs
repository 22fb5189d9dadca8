use parking_lot::RwLock;

use crate::helpe::*;
use super::{matches_filter, swap_status};

/// Keeps every block in memory, in insertion order. Good for tests and for
/// embedding the allocator into a single long-lived process.
#[derive(Default)]
pub struct MemoryStore {
    blocks: RwLock<IndexMap<BlockId, Block>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a store with existing records, e.g. a snapshot taken elsewhere.
    pub fn with_blocks<I>(blocks: I) -> Self
    where I: IntoIterator<Item = Block> {
        Self {
            blocks: RwLock::new(blocks
                .into_iter()
                .map(|b| (b.id.clone(), b))
                .collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

impl BlockStore for MemoryStore {
    fn list_blocks(&self, filter: &[BlockStatus]) -> PoolResult<Vec<Block>> {
        Ok(self.blocks
            .read()
            .values()
            .filter(|b| matches_filter(b, filter))
            .cloned()
            .collect())
    }

    fn get_block(&self, id: &BlockId) -> PoolResult<Option<Block>> {
        Ok(self.blocks.read().get(id).cloned())
    }

    fn insert_block(&self, block: Block) -> PoolResult<Block> {
        let mut blocks = self.blocks.write();
        if blocks.contains_key(&block.id) {
            return Err(PoolError::StoreUnavailable(format!("block {} already stored", block.id)));
        }
        blocks.insert(block.id.clone(), block.clone());

        Ok(block)
    }

    fn update_block_status(
        &self,
        id:         &BlockId,
        expected:   BlockStatus,
        new:        BlockStatus,
        at:         DateTime<Utc>,
    ) -> PoolResult<bool> {
        Ok(self.blocks
            .write()
            .get_mut(id)
            .is_some_and(|b| swap_status(b, expected, new, at)))
    }
}
