//! Messages exchanged between the synchronizer loop, the coordinator, the
//! pipeline and the tx manager. Each task only holds senders to its peers.

use sybil_core::{BatchData, BatchNum, RollupVariables};
use sybil_synchronizer::Stats;
use tokio::sync::mpsc;

use crate::batch::BatchInfo;
use crate::error::{CoordError, Result};

/// Messages handled by the coordinator
#[derive(Clone, Debug)]
pub enum CoordinatorMsg {
    /// A block was synchronized
    SyncBlock {
        /// Progress after the block
        stats: Stats,
        /// Batches forged in the block
        batches: Vec<BatchData>,
        /// Rollup variables, when the block changed them
        vars: Option<RollupVariables>,
    },
    /// The synchronizer discarded blocks
    SyncReorg {
        /// Progress after the rewind
        stats: Stats,
        /// Rollup variables as of the new head
        vars: Option<RollupVariables>,
    },
    /// Forging must stop. With a failed batch, the next pipeline restarts
    /// right before it.
    StopPipeline {
        /// Why, for the logs
        reason: String,
        /// Batch that could not be forged or sent
        failed_batch_num: Option<BatchNum>,
    },
}

/// Messages handled by the tx manager
#[derive(Debug)]
pub enum TxManagerMsg {
    /// A proved batch ready to be sent
    AddBatch(Box<BatchInfo>),
    /// Synchronizer progress
    SyncStatsVars {
        /// Latest stats
        stats: Stats,
        /// Rollup variables, when they changed
        vars: Option<RollupVariables>,
    },
    /// Drop the batches of pipeline runs up to this one that are not sent yet
    DiscardPipeline(usize),
}

/// Sender side of the coordinator queue
#[derive(Clone, Debug)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoordinatorMsg>,
}

impl CoordinatorHandle {
    pub(crate) const fn new(tx: mpsc::Sender<CoordinatorMsg>) -> Self {
        Self { tx }
    }

    /// Queue a message, failing once the coordinator is gone
    pub async fn send(&self, msg: CoordinatorMsg) -> Result<()> {
        self.tx.send(msg).await.map_err(|_| CoordError::ChannelClosed("coordinator"))
    }
}

/// Sender side of the tx manager queue
#[derive(Clone, Debug)]
pub struct TxManagerHandle {
    tx: mpsc::Sender<TxManagerMsg>,
}

impl TxManagerHandle {
    pub(crate) const fn new(tx: mpsc::Sender<TxManagerMsg>) -> Self {
        Self { tx }
    }

    /// Hand over a proved batch
    pub async fn add_batch(&self, info: BatchInfo) -> Result<()> {
        self.send(TxManagerMsg::AddBatch(Box::new(info))).await
    }

    /// Forward synchronizer progress
    pub async fn set_sync_stats_vars(
        &self,
        stats: Stats,
        vars: Option<RollupVariables>,
    ) -> Result<()> {
        self.send(TxManagerMsg::SyncStatsVars { stats, vars }).await
    }

    /// Drop the unsent batches of runs up to `pipeline_num`
    pub async fn discard_pipeline(&self, pipeline_num: usize) -> Result<()> {
        self.send(TxManagerMsg::DiscardPipeline(pipeline_num)).await
    }

    async fn send(&self, msg: TxManagerMsg) -> Result<()> {
        self.tx.send(msg).await.map_err(|_| CoordError::ChannelClosed("tx manager"))
    }
}
