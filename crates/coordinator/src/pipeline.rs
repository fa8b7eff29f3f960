//! Forging pipeline
//!
//! A pipeline run owns two tasks. The forge task selects the txs of the
//! next batch, builds its witness and hands it to an idle prover. The proof
//! task waits for the proofs in batch order and passes the proved batches
//! to the tx manager. A failure at some batch blocks further forging and
//! asks the coordinator to restart the pipeline right before it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use sybil_core::{BatchNum, RollupConstants, RollupVariables};
use sybil_synchronizer::{HistoryStore, Stats};
use sybil_txprocessor::TxProcessorConfig;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::batch::{BatchInfo, BatchStatus};
use crate::batchbuilder::BatchBuilder;
use crate::config::CoordinatorConfig;
use crate::error::{CoordError, Result};
use crate::l2db::L2Db;
use crate::messages::{CoordinatorHandle, CoordinatorMsg, TxManagerHandle};
use crate::proverspool::ProversPool;
use crate::purger::Purger;
use crate::txselector::TxSelector;

const STATS_QUEUE_LEN: usize = 16;

/// Everything a pipeline run shares with the coordinator
#[derive(Clone)]
pub struct PipelineContext {
    /// Coordinator configuration
    pub cfg: CoordinatorConfig,
    /// Constants of the rollup contract
    pub consts: RollupConstants,
    /// Synchronized history
    pub history: Arc<dyn HistoryStore>,
    /// Pool of L2 txs
    pub l2db: Arc<L2Db>,
    /// Selector fork of the state
    pub tx_selector: Arc<Mutex<TxSelector>>,
    /// Witness fork of the state
    pub batch_builder: Arc<Mutex<BatchBuilder>>,
    /// Held while txs are selected and marked forging, so the purger does
    /// not touch them in between
    pub l2db_update_lock: Arc<Mutex<()>>,
    /// Pool cleanup schedule
    pub purger: Arc<Mutex<Purger>>,
    /// Idle provers
    pub provers: Arc<ProversPool>,
    /// Back channel to the coordinator
    pub coord: CoordinatorHandle,
    /// Where proved batches go
    pub tx_manager: TxManagerHandle,
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext").field("cfg", &self.cfg).finish_non_exhaustive()
    }
}

impl PipelineContext {
    /// Processor parameters of the configured verifier
    pub fn tx_processor_config(&self) -> Result<TxProcessorConfig> {
        let idx = self.cfg.verifier_idx;
        let verifier = self.consts.verifiers.get(usize::from(idx)).ok_or(CoordError::Batch {
            batch: BatchNum(0),
            reason: format!("verifier {idx} not in the rollup constants"),
        })?;
        let overflow = || CoordError::Batch {
            batch: BatchNum(0),
            reason: format!("verifier {idx} too large"),
        };
        Ok(TxProcessorConfig {
            n_levels: usize::try_from(verifier.n_levels).map_err(|_| overflow())?,
            max_tx: usize::try_from(verifier.max_tx).map_err(|_| overflow())?,
            ..self.cfg.tx_processor.clone()
        })
    }
}

/// Rewind the selector and builder states to `batch_num`, from their own
/// checkpoint when there is one and it agrees with the synchronizer
fn reset_states(ctx: &PipelineContext, batch_num: BatchNum, stats: &Stats) -> Result<()> {
    let mut sel = ctx.tx_selector.lock();
    let mut bb = ctx.batch_builder.lock();
    let local = sel.local_state().checkpoint_exists(batch_num)
        && bb.local_state().checkpoint_exists(batch_num);
    sel.reset(batch_num, !local)?;
    bb.reset(batch_num, !local)?;

    let synced = &stats.sync.last_batch;
    if local
        && synced.batch_num == batch_num
        && bb.local_state().account_root() != synced.account_root
    {
        warn!(
            "pipeline: local state at batch {batch_num} differs from the synchronizer, \
             resetting from it"
        );
        sel.reset(batch_num, true)?;
        bb.reset(batch_num, true)?;
    }
    Ok(())
}

/// Forging progress of a pipeline run
#[derive(Debug)]
struct PipelineState {
    batch_num: BatchNum,
    last_scheduled_l1_batch_block_num: u64,
    last_forge_l1_txs_num: Option<u64>,
}

struct Forger {
    num: usize,
    ctx: PipelineContext,
    tp_config: TxProcessorConfig,
    state: PipelineState,
    stats: Stats,
    vars: RollupVariables,
    started: Instant,
    last_forge_time: Option<Instant>,
    err_at_batch_num: Arc<AtomicU32>,
}

impl Forger {
    async fn run(
        mut self,
        mut cancel: watch::Receiver<bool>,
        mut stats_rx: mpsc::Receiver<(Stats, Option<RollupVariables>)>,
        batch_tx: mpsc::Sender<BatchInfo>,
    ) {
        let mut next = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    info!("pipeline {}: forge loop done", self.num);
                    return;
                }
                Some((stats, vars)) = stats_rx.recv() => {
                    self.stats = stats;
                    if let Some(vars) = vars {
                        self.vars = vars;
                    }
                }
                () = tokio::time::sleep_until(next) => {
                    next = tokio::time::Instant::now() + self.ctx.cfg.forge_retry_interval();
                    if self.err_at_batch_num.load(Ordering::Acquire) != 0 {
                        continue;
                    }
                    let batch_num = match self.state.batch_num.next() {
                        Ok(b) => b,
                        Err(e) => {
                            error!("pipeline {}: {e}", self.num);
                            return;
                        }
                    };
                    match self.handle_forge_batch(batch_num, &mut cancel).await {
                        Ok(info) => {
                            self.state.batch_num = batch_num;
                            self.last_forge_time = Some(Instant::now());
                            let permit = tokio::select! {
                                p = batch_tx.reserve() => p.ok(),
                                _ = cancel.changed() => None,
                            };
                            match permit {
                                Some(permit) => permit.send(info),
                                None => {
                                    release_prover(&self.ctx, info).await;
                                    return;
                                }
                            }
                            next = tokio::time::Instant::now();
                        }
                        Err(e) if e.is_done() => {}
                        Err(CoordError::SkipBatch(reason)) => {
                            debug!("pipeline {}: skip batch {batch_num}: {reason}", self.num);
                        }
                        Err(e) => {
                            error!("pipeline {}: forging batch {batch_num}: {e}", self.num);
                            self.err_at_batch_num.store(batch_num.0, Ordering::Release);
                            let msg = CoordinatorMsg::StopPipeline {
                                reason: format!("forge batch {batch_num}: {e}"),
                                failed_batch_num: Some(batch_num),
                            };
                            if let Err(e) = self.ctx.coord.send(msg).await {
                                warn!("pipeline {}: {e}", self.num);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Forge `batch_num` and start its proof on an idle prover
    async fn handle_forge_batch(
        &mut self,
        batch_num: BatchNum,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<BatchInfo> {
        self.skip_if_too_early()?;
        let prover = self.ctx.provers.get(cancel).await?;
        let mut info = match self.forge_batch(batch_num) {
            Ok(info) => info,
            Err(e) => {
                self.ctx.provers.add(prover);
                return Err(e);
            }
        };
        if let Err(e) = prover.calculate_proof(&info.zk_inputs).await {
            self.ctx.provers.add(prover);
            return Err(e);
        }
        info.prover = Some(prover);
        info.proof_start = Some(Instant::now());
        Ok(info)
    }

    fn skip_if_too_early(&self) -> Result<()> {
        match self.last_forge_time {
            Some(t) if t.elapsed() < self.ctx.cfg.forge_delay() => {
                Err(CoordError::SkipBatch("forge delay"))
            }
            _ => Ok(()),
        }
    }

    /// Whether the next batch must forge the L1 queue: at the start of the
    /// run, once the timeout deadline is close, or when the queue has txs
    fn should_l1_batch(&self, queued: usize) -> bool {
        if self.state.last_scheduled_l1_batch_block_num == 0 || queued > 0 {
            return true;
        }
        let last_l1 = self
            .state
            .last_scheduled_l1_batch_block_num
            .max(self.stats.sync.last_l1_batch_block);
        let next_block = self.stats.eth.last_block.num + 1;
        let deadline = self.vars.forge_l1_l2_batch_timeout.saturating_sub(1) as f64
            * self.ctx.cfg.l1_batch_timeout_perc;
        (next_block.saturating_sub(last_l1)) as f64 >= deadline
    }

    fn forge_batch(&mut self, batch_num: BatchNum) -> Result<BatchInfo> {
        let _l2db_guard = self.ctx.l2db_update_lock.lock();
        let mut sel = self.ctx.tx_selector.lock();
        {
            let block = self.stats.sync.last_block.num;
            let mut purger = self.ctx.purger.lock();
            purger.invalidate_maybe(&self.ctx.l2db, sel.local_state(), block, batch_num);
            purger.purge_maybe(&self.ctx.l2db, block, batch_num);
        }

        let next_queue = self.state.last_forge_l1_txs_num.map_or(0, |n| n + 1);
        let queued = self.ctx.history.unforged_l1_user_txs(next_queue)?;
        let l1_batch = self.should_l1_batch(queued.len());
        let selection = if l1_batch {
            sel.get_l1_l2_tx_selection(&self.tp_config, queued)?
        } else {
            sel.get_l2_tx_selection(&self.tp_config)?
        };

        if !l1_batch && selection.l2_txs.is_empty() {
            let since = self.last_forge_time.unwrap_or(self.started);
            if since.elapsed() < self.ctx.cfg.forge_no_txs_delay() {
                sel.reset(self.state.batch_num, false)?;
                return Err(CoordError::SkipBatch("no txs"));
            }
        }
        drop(sel);

        if l1_batch {
            self.state.last_scheduled_l1_batch_block_num = self.stats.eth.last_block.num + 1;
            self.state.last_forge_l1_txs_num = Some(next_queue);
        }
        let ids: Vec<_> = selection.l2_txs.iter().map(|tx| tx.tx_id).collect();
        self.ctx.l2db.start_forging(&ids, batch_num);
        self.ctx.l2db.update_txs_info(&selection.discarded);

        let mut l1_user_txs = selection.l1_user_txs;
        let mut l2_txs = selection.l2_txs;
        let zki = self.ctx.batch_builder.lock().build_batch(
            &self.tp_config,
            &[],
            &mut l1_user_txs,
            &mut [],
            &mut l2_txs,
        )?;
        if zki.current_num_batch != batch_num.0 {
            return Err(CoordError::Batch {
                batch: batch_num,
                reason: format!("batch builder is at batch {}", zki.current_num_batch),
            });
        }

        info!(
            "pipeline {}: forged batch {batch_num} (l1 batch: {l1_batch}, {} l1 txs, {} l2 txs)",
            self.num,
            l1_user_txs.len(),
            l2_txs.len()
        );
        let mut info = BatchInfo::new(self.num, batch_num, zki);
        info.l1_batch = l1_batch;
        info.verifier_idx = self.ctx.cfg.verifier_idx;
        info.l1_user_txs = l1_user_txs;
        info.set_l2_txs(&l2_txs);
        Ok(info)
    }
}

/// Put the prover of an unfinished batch back in the pool
async fn release_prover(ctx: &PipelineContext, mut info: BatchInfo) {
    if let Some(prover) = info.prover.take() {
        if let Err(e) = prover.cancel().await {
            warn!("pipeline: cancelling proof of batch {}: {e}", info.batch_num);
        }
        ctx.provers.add(prover);
    }
}

async fn wait_server_proof(
    ctx: &PipelineContext,
    mut info: BatchInfo,
    cancel: &mut watch::Receiver<bool>,
) -> Result<BatchInfo> {
    let prover = info.prover.take().ok_or(CoordError::Batch {
        batch: info.batch_num,
        reason: "no prover assigned".to_string(),
    })?;
    let res = tokio::select! {
        r = prover.get_proof() => r,
        _ = cancel.changed() => Err(CoordError::Done),
    };
    if res.is_err() {
        if let Err(e) = prover.cancel().await {
            warn!("pipeline: cancelling proof of batch {}: {e}", info.batch_num);
        }
    }
    ctx.provers.add(prover);
    let (proof, public_inputs) = res?;

    info.proof = Some(proof);
    info.public_inputs = public_inputs;
    info.status = BatchStatus::Proof;
    info.forge_batch_args = info.prepare_forge_batch_args();
    if let Some(start) = info.proof_start {
        info!(
            "pipeline {}: proof of batch {} ready in {:?}",
            info.pipeline_num,
            info.batch_num,
            start.elapsed()
        );
    }
    Ok(info)
}

async fn wait_proofs(
    ctx: PipelineContext,
    err_at_batch_num: Arc<AtomicU32>,
    mut cancel: watch::Receiver<bool>,
    mut batch_rx: mpsc::Receiver<BatchInfo>,
) {
    loop {
        let info = tokio::select! {
            _ = cancel.changed() => break,
            info = batch_rx.recv() => match info {
                Some(info) => info,
                None => break,
            },
        };
        let batch_num = info.batch_num;
        match wait_server_proof(&ctx, info, &mut cancel).await {
            Ok(info) => {
                if let Err(e) = ctx.tx_manager.add_batch(info).await {
                    warn!("pipeline: {e}");
                    break;
                }
            }
            Err(e) if e.is_done() => break,
            Err(e) => {
                error!("pipeline: proof of batch {batch_num}: {e}");
                err_at_batch_num.store(batch_num.0, Ordering::Release);
                let msg = CoordinatorMsg::StopPipeline {
                    reason: format!("proof of batch {batch_num}: {e}"),
                    failed_batch_num: Some(batch_num),
                };
                if let Err(e) = ctx.coord.send(msg).await {
                    warn!("pipeline: {e}");
                }
            }
        }
    }
    batch_rx.close();
    while let Ok(info) = batch_rx.try_recv() {
        release_prover(&ctx, info).await;
    }
    info!("pipeline: proof loop done");
}

/// A running pipeline
#[derive(Debug)]
pub struct Pipeline {
    num: usize,
    err_at_batch_num: Arc<AtomicU32>,
    stats_tx: mpsc::Sender<(Stats, Option<RollupVariables>)>,
    cancel: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Reset the local states to `batch_num` and start forging after it
    pub fn start(
        num: usize,
        ctx: PipelineContext,
        batch_num: BatchNum,
        stats: &Stats,
        vars: &RollupVariables,
    ) -> Result<Self> {
        let tp_config = ctx.tx_processor_config()?;
        reset_states(&ctx, batch_num, stats)?;

        let err_at_batch_num = Arc::new(AtomicU32::new(0));
        let (cancel, cancel_rx) = watch::channel(false);
        let (stats_tx, stats_rx) = mpsc::channel(STATS_QUEUE_LEN);
        let (batch_tx, batch_rx) = mpsc::channel(1);
        let forger = Forger {
            num,
            ctx: ctx.clone(),
            tp_config,
            state: PipelineState {
                batch_num,
                last_scheduled_l1_batch_block_num: 0,
                last_forge_l1_txs_num: stats.sync.last_forge_l1_txs_num,
            },
            stats: stats.clone(),
            vars: vars.clone(),
            started: Instant::now(),
            last_forge_time: None,
            err_at_batch_num: Arc::clone(&err_at_batch_num),
        };
        let tasks = vec![
            tokio::spawn(forger.run(cancel_rx.clone(), stats_rx, batch_tx)),
            tokio::spawn(wait_proofs(ctx, Arc::clone(&err_at_batch_num), cancel_rx, batch_rx)),
        ];
        info!("pipeline {num}: started after batch {batch_num}");
        Ok(Self { num, err_at_batch_num, stats_tx, cancel, tasks })
    }

    /// Run number, increasing per coordinator
    pub const fn num(&self) -> usize {
        self.num
    }

    /// Batch at which the pipeline failed, if it did
    pub fn err_at_batch_num(&self) -> Option<BatchNum> {
        match self.err_at_batch_num.load(Ordering::Acquire) {
            0 => None,
            n => Some(BatchNum(n)),
        }
    }

    /// Forward fresh sync progress to the forge task
    pub async fn set_sync_stats_vars(&self, stats: Stats, vars: Option<RollupVariables>) {
        if self.stats_tx.send((stats, vars)).await.is_err() {
            debug!("pipeline {}: forge task gone", self.num);
        }
    }

    /// Cancel both tasks and wait for them
    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("pipeline {}: task panicked: {e}", self.num);
            }
        }
        info!("pipeline {}: stopped", self.num);
    }
}
