//! Synchronization progress, shared with the coordinator and the API

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::Serialize;
use sybil_core::{Batch, Block};

use crate::error::Result;
use crate::eth::EthClient;

/// View of the L1 chain
#[derive(Clone, Debug, Default, Serialize)]
pub struct EthStats {
    /// Unix seconds of the last refresh
    pub updated: u64,
    /// Block the rollup was deployed at
    pub first_block_num: u64,
    /// Head of the chain
    pub last_block: Block,
    /// Last batch forged on-chain
    pub last_batch_num: u32,
}

/// View of what has been synchronized
#[derive(Clone, Debug, Default, Serialize)]
pub struct SyncStats {
    /// Unix seconds of the last synchronized block
    pub updated: u64,
    /// Last synchronized block
    pub last_block: Block,
    /// Last synchronized batch
    pub last_batch: Batch,
    /// Block of the latest L1 batch
    pub last_l1_batch_block: u64,
    /// Latest forged L1 user tx queue
    pub last_forge_l1_txs_num: Option<u64>,
}

/// Snapshot of the synchronizer progress
#[derive(Clone, Debug, Default, Serialize)]
pub struct Stats {
    /// L1 side
    pub eth: EthStats,
    /// Local side
    pub sync: SyncStats,
}

impl Stats {
    /// Whether the last L1 block has been synchronized
    pub fn synced(&self) -> bool {
        self.eth.last_block.num == self.sync.last_block.num
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}

/// [`Stats`] behind a lock
#[derive(Debug)]
pub struct StatsHolder {
    stats: RwLock<Stats>,
    /// Refresh the eth stats when less than this many blocks behind
    pub update_block_num_diff_threshold: u16,
    /// Otherwise refresh them every this many blocks
    pub update_frequency_divider: u16,
}

impl StatsHolder {
    /// Stats starting at the deployment block
    pub fn new(
        first_block_num: u64,
        update_block_num_diff_threshold: u16,
        update_frequency_divider: u16,
    ) -> Self {
        let stats = Stats {
            eth: EthStats { first_block_num, ..Default::default() },
            ..Default::default()
        };
        Self {
            stats: RwLock::new(stats),
            update_block_num_diff_threshold,
            update_frequency_divider: update_frequency_divider.max(1),
        }
    }

    /// Record a synchronized block. `last_batch` and `last_l1_batch` are only
    /// given when the block changed them: the latter as
    /// `(block, forge_l1_txs_num)`.
    pub fn update_sync(
        &self,
        last_block: &Block,
        last_batch: Option<&Batch>,
        last_l1_batch: Option<(u64, Option<u64>)>,
    ) {
        let mut s = self.stats.write();
        s.sync.updated = now_secs();
        s.sync.last_block = last_block.clone();
        if let Some(batch) = last_batch {
            s.sync.last_batch = batch.clone();
        }
        if let Some((block, num)) = last_l1_batch {
            s.sync.last_l1_batch_block = block;
            s.sync.last_forge_l1_txs_num = num;
        }
    }

    /// Refresh the view of L1
    pub async fn update_eth(&self, client: &dyn EthClient) -> Result<()> {
        let last_block = client.eth_block_by_number(None).await?;
        let last_batch = client.rollup_last_forged_batch().await?;
        let mut s = self.stats.write();
        s.eth.updated = now_secs();
        if let Some(block) = last_block {
            s.eth.last_block = block;
        }
        s.eth.last_batch_num = last_batch.0;
        Ok(())
    }

    /// Whether the eth stats are due for a refresh when processing `next_block`
    pub fn eth_refresh_due(&self, next_block: u64) -> bool {
        let last = self.stats.read().eth.last_block.num;
        next_block + u64::from(self.update_block_num_diff_threshold) >= last
            || next_block % u64::from(self.update_frequency_divider) == 0
    }

    /// Snapshot of the stats
    pub fn copy_stats(&self) -> Stats {
        self.stats.read().clone()
    }

    /// See [`Stats::synced`]
    pub fn synced(&self) -> bool {
        self.stats.read().synced()
    }

    /// Percentage of the L1 blocks since the first one that are synchronized
    pub fn blocks_perc(&self) -> f64 {
        let s = self.stats.read();
        let total = s.eth.last_block.num.saturating_sub(s.eth.first_block_num);
        if total == 0 {
            return 100.0;
        }
        let done = s.sync.last_block.num.saturating_sub(s.eth.first_block_num);
        done as f64 * 100.0 / total as f64
    }

    /// Percentage of the forged batches that are synchronized
    pub fn batches_perc(&self) -> f64 {
        let s = self.stats.read();
        if s.eth.last_batch_num == 0 {
            return 100.0;
        }
        f64::from(s.sync.last_batch.batch_num.0) * 100.0 / f64::from(s.eth.last_batch_num)
    }
}
