//! Coordinator: decides when to forge and drives the pipeline and the tx
//! manager from the synchronizer progress

use std::sync::Arc;

use parking_lot::Mutex;
use sybil_core::{Batch, BatchData, BatchNum, RollupVariables};
use sybil_db::{StateDbConfig, StateDbMode};
use sybil_synchronizer::{EthClient, Stats, Synchronizer};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::batchbuilder::BatchBuilder;
use crate::config::CoordinatorConfig;
use crate::error::Result;
use crate::l2db::L2Db;
use crate::messages::{CoordinatorHandle, CoordinatorMsg};
use crate::pipeline::{Pipeline, PipelineContext};
use crate::prover::ProverClient;
use crate::proverspool::ProversPool;
use crate::purger::Purger;
use crate::txmanager::TxManager;
use crate::txselector::TxSelector;

const QUEUE_LEN: usize = 64;

fn fork_config(base: &StateDbConfig, dir: &str, mode: StateDbMode) -> StateDbConfig {
    let mut cfg = base.clone();
    cfg.kvdb.path = base.kvdb.path.join(dir);
    cfg.mode = mode;
    cfg
}

/// Owner of the forging pipeline
pub struct Coordinator {
    cfg: CoordinatorConfig,
    ctx: PipelineContext,
    rx: mpsc::Receiver<CoordinatorMsg>,
    tx_manager: Option<TxManager>,
    pipeline: Option<Pipeline>,
    pipeline_num: usize,
    /// Last synced batch when the current pipeline started
    pipeline_from_batch: Batch,
    last_non_failed_batch_num: BatchNum,
    stats: Stats,
    vars: RollupVariables,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("pipeline_num", &self.pipeline_num)
            .field("forging", &self.pipeline.is_some())
            .field("last_non_failed_batch_num", &self.last_non_failed_batch_num)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Coordinator forking the state of `sync` into `state_cfg.kvdb.path`.
    /// Returns the handle the synchronizer loop reports to.
    pub async fn new(
        cfg: CoordinatorConfig,
        client: Arc<dyn EthClient>,
        sync: &Synchronizer,
        state_cfg: &StateDbConfig,
        l2db: Arc<L2Db>,
        provers: Vec<Arc<dyn ProverClient>>,
    ) -> Result<(Self, CoordinatorHandle)> {
        let (tx, rx) = mpsc::channel(QUEUE_LEN);
        let handle = CoordinatorHandle::new(tx);

        let checkpoints = sync.checkpoints();
        let tx_selector = TxSelector::new(
            fork_config(state_cfg, "txselector", StateDbMode::TxSelector),
            checkpoints.clone(),
            Arc::clone(&l2db),
        )?;
        let batch_builder = BatchBuilder::new(
            fork_config(state_cfg, "batchbuilder", StateDbMode::BatchBuilder),
            checkpoints,
        )?;

        let pool = ProversPool::new(provers.len());
        for prover in provers {
            pool.add(prover);
        }

        let vars = sync.sc_vars().clone();
        let (tx_manager, tx_manager_handle) = TxManager::new(
            cfg.clone(),
            client,
            Arc::clone(&l2db),
            handle.clone(),
            vars.clone(),
        )
        .await?;

        let ctx = PipelineContext {
            cfg: cfg.clone(),
            consts: sync.rollup_constants().clone(),
            history: sync.history(),
            l2db,
            tx_selector: Arc::new(Mutex::new(tx_selector)),
            batch_builder: Arc::new(Mutex::new(batch_builder)),
            l2db_update_lock: Arc::new(Mutex::new(())),
            purger: Arc::new(Mutex::new(Purger::new(cfg.purger.clone()))),
            provers: Arc::new(pool),
            coord: handle.clone(),
            tx_manager: tx_manager_handle,
        };
        // fail early on an unknown verifier
        ctx.tx_processor_config()?;

        let coord = Self {
            cfg,
            ctx,
            rx,
            tx_manager: Some(tx_manager),
            pipeline: None,
            pipeline_num: 0,
            pipeline_from_batch: Batch::default(),
            last_non_failed_batch_num: BatchNum(0),
            stats: sync.copy_stats(),
            vars,
        };
        Ok((coord, handle))
    }

    /// Whether a pipeline is running
    pub const fn forging(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Handle messages until `cancel` fires, then stop the pipeline and the
    /// tx manager
    pub async fn run(mut self, cancel: watch::Receiver<bool>) -> anyhow::Result<()> {
        let tx_manager = self.tx_manager.take().map(|txm| tokio::spawn(txm.run(cancel.clone())));
        let mut cancel = cancel;
        loop {
            tokio::select! {
                _ = cancel.changed() => break,
                msg = self.rx.recv() => {
                    let Some(msg) = msg else { break };
                    if let Err(e) = self.handle_msg(msg).await {
                        if e.is_done() {
                            break;
                        }
                        error!("coordinator: {e}");
                        tokio::time::sleep(self.cfg.sync_retry_interval()).await;
                    }
                }
            }
        }

        info!("coordinator: stopping");
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.stop().await;
        }
        if let Some(task) = tx_manager {
            task.await?;
        }
        Ok(())
    }

    async fn handle_msg(&mut self, msg: CoordinatorMsg) -> Result<()> {
        match msg {
            CoordinatorMsg::SyncBlock { stats, batches, vars } => {
                self.handle_sync_block(stats, &batches, vars).await
            }
            CoordinatorMsg::SyncReorg { stats, vars } => self.handle_reorg(stats, vars).await,
            CoordinatorMsg::StopPipeline { reason, failed_batch_num } => {
                self.handle_stop_pipeline(&reason, failed_batch_num).await
            }
        }
    }

    async fn update_stats(&mut self, stats: Stats, vars: Option<RollupVariables>) -> Result<()> {
        if let Some(vars) = &vars {
            self.vars = vars.clone();
        }
        self.ctx.tx_manager.set_sync_stats_vars(stats.clone(), vars.clone()).await?;
        if let Some(pipeline) = &self.pipeline {
            pipeline.set_sync_stats_vars(stats.clone(), vars).await;
        }
        self.stats = stats;
        Ok(())
    }

    async fn handle_sync_block(
        &mut self,
        stats: Stats,
        batches: &[BatchData],
        vars: Option<RollupVariables>,
    ) -> Result<()> {
        self.update_stats(stats, vars).await?;
        if !self.stats.synced() {
            return Ok(());
        }

        let forger = self.cfg.forger_address;
        let external: Vec<&BatchData> =
            batches.iter().filter(|b| b.batch.forger_addr != forger).collect();
        for batch in &external {
            let ids: Vec<_> = batch.l2_txs.iter().map(|tx| tx.tx_id).collect();
            self.ctx.l2db.done_forging(&ids, batch.batch.batch_num);
        }
        if let Some(batch) = external.first() {
            if self.pipeline.is_some() {
                let reason = format!(
                    "batch {} forged by {}",
                    batch.batch.batch_num, batch.batch.forger_addr
                );
                self.handle_stop_pipeline(&reason, None).await?;
            }
        }
        self.sync_stats().await
    }

    async fn handle_reorg(&mut self, stats: Stats, vars: Option<RollupVariables>) -> Result<()> {
        self.update_stats(stats, vars).await?;
        let last = &self.stats.sync.last_batch;
        if self.pipeline.is_some()
            && last.forger_addr != self.cfg.forger_address
            && last.state_root != self.pipeline_from_batch.state_root
        {
            // The batch the pipeline started from may never come back
            self.handle_stop_pipeline("reorg", None).await?;
        }
        Ok(())
    }

    /// Stop the pipeline and rewind the pool. With `failed_batch_num`, the
    /// next pipeline starts right before it, otherwise from the last synced
    /// batch.
    async fn handle_stop_pipeline(
        &mut self,
        reason: &str,
        failed_batch_num: Option<BatchNum>,
    ) -> Result<()> {
        let batch_num = match failed_batch_num {
            Some(failed) => BatchNum(failed.0.saturating_sub(1)),
            None => self.stats.sync.last_batch.batch_num,
        };
        if let Some(pipeline) = self.pipeline.take() {
            warn!("coordinator: stopping pipeline {}: {reason}", pipeline.num());
            pipeline.stop().await;
            self.ctx.tx_manager.discard_pipeline(self.pipeline_num).await?;
        } else {
            debug!("coordinator: stop requested with no pipeline running: {reason}");
        }
        self.ctx.l2db.reorg(batch_num);
        self.last_non_failed_batch_num = batch_num;
        Ok(())
    }

    /// Our batch was the last one, nothing was forged yet, or forging is
    /// forced
    fn can_forge(&self) -> bool {
        if self.vars.safe_mode {
            return false;
        }
        let last = &self.stats.sync.last_batch;
        self.cfg.must_forge_at_slot_deadline
            || last.batch_num == BatchNum(0)
            || last.forger_addr == self.cfg.forger_address
    }

    async fn sync_stats(&mut self) -> Result<()> {
        let can_forge = self.can_forge();
        if self.pipeline.is_none() && can_forge {
            let batch_num =
                self.stats.sync.last_batch.batch_num.max(self.last_non_failed_batch_num);
            self.pipeline_num += 1;
            info!("coordinator: starting pipeline {} from batch {batch_num}", self.pipeline_num);
            let pipeline = Pipeline::start(
                self.pipeline_num,
                self.ctx.clone(),
                batch_num,
                &self.stats,
                &self.vars,
            )?;
            self.pipeline_from_batch = self.stats.sync.last_batch.clone();
            self.pipeline = Some(pipeline);
        } else if self.pipeline.is_some() && !can_forge {
            self.handle_stop_pipeline("forging not allowed", None).await?;
        }

        if self.pipeline.is_none() {
            self.purge_idle()?;
        }
        Ok(())
    }

    /// Keep the pool clean while not forging
    fn purge_idle(&self) -> Result<()> {
        let block = self.stats.sync.last_block.num;
        let batch = self.stats.sync.last_batch.batch_num;
        let _l2db_guard = self.ctx.l2db_update_lock.lock();
        let mut purger = self.ctx.purger.lock();
        if purger.can_invalidate(block, batch) {
            let mut sel = self.ctx.tx_selector.lock();
            sel.reset(batch, true)?;
            purger.invalidate_maybe(&self.ctx.l2db, sel.local_state(), block, batch);
        }
        purger.purge_maybe(&self.ctx.l2db, block, batch);
        Ok(())
    }
}
