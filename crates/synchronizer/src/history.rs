//! Synchronized history: blocks, batches, L1 user txs and rollup variables

use std::collections::BTreeMap;

use parking_lot::RwLock;
use sybil_core::{Batch, Block, BlockData, L1Tx, RollupVariables};

use crate::error::Result;

/// Store of everything the synchronizer derived from L1
pub trait HistoryStore: Send + Sync {
    /// Latest synchronized block
    fn last_block(&self) -> Result<Option<Block>>;

    /// Synchronized block `num`
    fn get_block(&self, num: u64) -> Result<Option<Block>>;

    /// Persist a block and the rollup data derived from it
    fn add_block_data(&self, data: &BlockData) -> Result<()>;

    /// Delete every block above `last_valid_block` and the data derived from
    /// them
    fn reorg(&self, last_valid_block: u64) -> Result<()>;

    /// Latest synchronized batch
    fn last_batch(&self) -> Result<Option<Batch>>;

    /// Block of the latest batch that forged L1 user txs
    fn last_l1_batch_block_num(&self) -> Result<Option<u64>>;

    /// Latest forged L1 user tx queue
    fn last_l1_txs_num(&self) -> Result<Option<u64>>;

    /// L1 user txs of queue `to_forge_l1_txs_num` not forged yet, by position
    fn unforged_l1_user_txs(&self, to_forge_l1_txs_num: u64) -> Result<Vec<L1Tx>>;

    /// Current rollup variables
    fn sc_vars(&self) -> Result<Option<RollupVariables>>;

    /// Store the variables in force at deployment, once
    fn set_initial_sc_vars(&self, vars: &RollupVariables) -> Result<()>;
}

#[derive(Debug, Default)]
struct History {
    blocks: BTreeMap<u64, BlockData>,
    initial_vars: Option<RollupVariables>,
}

impl History {
    fn batches(&self) -> impl DoubleEndedIterator<Item = &Batch> {
        self.blocks.values().flat_map(|b| b.rollup.batches.iter().map(|bd| &bd.batch))
    }

    fn forged_queue(&self, num: u64) -> bool {
        self.batches().any(|b| b.forge_l1_txs_num == Some(num))
    }
}

/// In-memory [`HistoryStore`]
#[derive(Debug, Default)]
pub struct MemoryHistoryDb {
    inner: RwLock<History>,
}

impl MemoryHistoryDb {
    /// Empty history
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored data of a block
    pub fn block_data(&self, num: u64) -> Option<BlockData> {
        self.inner.read().blocks.get(&num).cloned()
    }
}

impl HistoryStore for MemoryHistoryDb {
    fn last_block(&self) -> Result<Option<Block>> {
        Ok(self.inner.read().blocks.values().next_back().map(|b| b.block.clone()))
    }

    fn get_block(&self, num: u64) -> Result<Option<Block>> {
        Ok(self.inner.read().blocks.get(&num).map(|b| b.block.clone()))
    }

    fn add_block_data(&self, data: &BlockData) -> Result<()> {
        self.inner.write().blocks.insert(data.block.num, data.clone());
        Ok(())
    }

    fn reorg(&self, last_valid_block: u64) -> Result<()> {
        self.inner.write().blocks.retain(|num, _| *num <= last_valid_block);
        Ok(())
    }

    fn last_batch(&self) -> Result<Option<Batch>> {
        Ok(self.inner.read().batches().next_back().cloned())
    }

    fn last_l1_batch_block_num(&self) -> Result<Option<u64>> {
        let h = self.inner.read();
        let block =
            h.batches().rev().find(|b| b.forge_l1_txs_num.is_some()).map(|b| b.eth_block_num);
        Ok(block)
    }

    fn last_l1_txs_num(&self) -> Result<Option<u64>> {
        Ok(self.inner.read().batches().rev().find_map(|b| b.forge_l1_txs_num))
    }

    fn unforged_l1_user_txs(&self, to_forge_l1_txs_num: u64) -> Result<Vec<L1Tx>> {
        let h = self.inner.read();
        if h.forged_queue(to_forge_l1_txs_num) {
            return Ok(Vec::new());
        }
        let mut txs: Vec<L1Tx> = h
            .blocks
            .values()
            .flat_map(|b| b.rollup.l1_user_txs.iter())
            .filter(|tx| tx.to_forge_l1_txs_num == Some(to_forge_l1_txs_num))
            .cloned()
            .collect();
        txs.sort_by_key(|tx| tx.position);
        Ok(txs)
    }

    fn sc_vars(&self) -> Result<Option<RollupVariables>> {
        let h = self.inner.read();
        let updated = h.blocks.values().rev().find_map(|b| b.rollup.vars.clone());
        Ok(updated.or_else(|| h.initial_vars.clone()))
    }

    fn set_initial_sc_vars(&self, vars: &RollupVariables) -> Result<()> {
        let mut h = self.inner.write();
        if h.initial_vars.is_none() {
            h.initial_vars = Some(vars.clone());
        }
        Ok(())
    }
}
