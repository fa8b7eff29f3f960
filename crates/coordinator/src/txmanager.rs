//! Sends proved batches to L1 and follows them until they are confirmed.
//!
//! Batches are sent in the order they arrive, each with the next account
//! nonce. Receipts are polled every check interval: a reverted forge tx
//! stops the pipeline, a mined one marks its pool txs as forged, and one
//! that is neither after the resend timeout is sent again with a higher
//! gas price.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use sybil_core::{BatchNum, RollupVariables};
use sybil_synchronizer::{EthClient, Stats, TxReceipt};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::batch::{BatchInfo, BatchStatus};
use crate::config::CoordinatorConfig;
use crate::error::{CoordError, Result};
use crate::l2db::L2Db;
use crate::messages::{CoordinatorHandle, CoordinatorMsg, TxManagerHandle, TxManagerMsg};

const QUEUE_LEN: usize = 64;

/// Owner of the forge txs
pub struct TxManager {
    cfg: CoordinatorConfig,
    client: Arc<dyn EthClient>,
    l2db: Arc<L2Db>,
    coord: CoordinatorHandle,
    rx: mpsc::Receiver<TxManagerMsg>,
    queue: VecDeque<BatchInfo>,
    /// Nonce of the next forge tx expected to be mined
    acc_nonce: u64,
    /// Nonce the next new forge tx is sent with
    acc_next_nonce: u64,
    stats: Stats,
    vars: RollupVariables,
    /// Batches of pipeline runs below this are discarded
    min_pipeline_num: usize,
    last_success_batch: BatchNum,
}

impl std::fmt::Debug for TxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxManager")
            .field("queue", &self.queue.len())
            .field("acc_nonce", &self.acc_nonce)
            .field("acc_next_nonce", &self.acc_next_nonce)
            .field("min_pipeline_num", &self.min_pipeline_num)
            .field("last_success_batch", &self.last_success_batch)
            .finish_non_exhaustive()
    }
}

impl TxManager {
    /// Tx manager starting from the pending nonce of the forger account
    pub async fn new(
        cfg: CoordinatorConfig,
        client: Arc<dyn EthClient>,
        l2db: Arc<L2Db>,
        coord: CoordinatorHandle,
        vars: RollupVariables,
    ) -> Result<(Self, TxManagerHandle)> {
        let nonce = client.eth_pending_nonce().await?;
        info!("tx manager: account {} at nonce {nonce}", client.address());
        let (tx, rx) = mpsc::channel(QUEUE_LEN);
        let txm = Self {
            cfg,
            client,
            l2db,
            coord,
            rx,
            queue: VecDeque::new(),
            acc_nonce: nonce,
            acc_next_nonce: nonce,
            stats: Stats::default(),
            vars,
            min_pipeline_num: 0,
            last_success_batch: BatchNum(0),
        };
        Ok((txm, TxManagerHandle::new(tx)))
    }

    /// Last batch whose forge tx got enough confirmations
    pub const fn last_success_batch(&self) -> BatchNum {
        self.last_success_batch
    }

    /// Process messages and poll receipts until `cancel` fires
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) {
        let mut check = tokio::time::interval(self.cfg.tx_manager_check_interval());
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    info!("tx manager: done");
                    return;
                }
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle_msg(msg).await,
                    None => {
                        info!("tx manager: all handles dropped");
                        return;
                    }
                },
                _ = check.tick() => {
                    if let Err(e) = self.check_queue().await {
                        warn!("tx manager: check queue: {e}");
                    }
                }
            }
        }
    }

    async fn handle_msg(&mut self, msg: TxManagerMsg) {
        match msg {
            TxManagerMsg::AddBatch(info) => {
                if info.pipeline_num < self.min_pipeline_num {
                    debug!(
                        "tx manager: discarding batch {} of old pipeline {}",
                        info.batch_num, info.pipeline_num
                    );
                    return;
                }
                let batch_num = info.batch_num;
                if let Err(e) = self.send_batch(*info).await {
                    error!("tx manager: sending batch {batch_num}: {e}");
                    let reason = format!("forge tx of batch {batch_num}: {e}");
                    self.stop_pipeline(reason, batch_num).await;
                }
            }
            TxManagerMsg::SyncStatsVars { stats, vars } => {
                self.stats = stats;
                if let Some(vars) = vars {
                    self.vars = vars;
                }
            }
            TxManagerMsg::DiscardPipeline(num) => {
                // Batches already sent stay tracked, they may still be mined
                self.min_pipeline_num = self.min_pipeline_num.max(num + 1);
                info!("tx manager: discarding unsent batches of pipeline {num}");
            }
        }
    }

    async fn stop_pipeline(&mut self, reason: String, failed: BatchNum) {
        // Later batches build on the failed one
        self.queue.retain(|b| b.batch_num < failed);
        match self.client.eth_pending_nonce().await {
            Ok(nonce) => self.acc_next_nonce = nonce,
            Err(e) => warn!("tx manager: reading pending nonce: {e}"),
        }
        let msg = CoordinatorMsg::StopPipeline { reason, failed_batch_num: Some(failed) };
        if let Err(e) = self.coord.send(msg).await {
            warn!("tx manager: {e}");
        }
    }

    async fn send_batch(&mut self, mut info: BatchInfo) -> Result<()> {
        let args = info.forge_batch_args.clone().ok_or(CoordError::Batch {
            batch: info.batch_num,
            reason: "no forge args".to_string(),
        })?;
        if self.vars.safe_mode {
            return Err(CoordError::Batch {
                batch: info.batch_num,
                reason: "rollup in safe mode".to_string(),
            });
        }
        let gas_price = self.cfg.bump_gas_price(self.client.eth_suggest_gas_price().await?);
        let nonce = self.acc_next_nonce;
        let hash = self.client.rollup_forge_batch(&args, nonce, gas_price).await?;
        self.acc_next_nonce = nonce + 1;
        info!(
            "tx manager: batch {} sent in tx {hash} (nonce {nonce}, gas price {gas_price})",
            info.batch_num
        );

        info.eth_txs.push(hash);
        info.nonce = Some(nonce);
        info.gas_price = gas_price;
        info.send_time = Some(Instant::now());
        info.status = BatchStatus::Sent;
        self.queue.push_back(info);
        Ok(())
    }

    /// Receipt of any of the txs sent for a batch, newest first
    async fn receipt(&self, info: &BatchInfo) -> Result<Option<TxReceipt>> {
        for hash in info.eth_txs.iter().rev() {
            if let Some(r) = self.client.eth_transaction_receipt(*hash).await? {
                return Ok(Some(r));
            }
        }
        Ok(None)
    }

    async fn check_queue(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let last_block = self.client.eth_last_block().await?;
        let mut i = 0;
        while i < self.queue.len() {
            match self.receipt(&self.queue[i]).await? {
                Some(r) if !r.status => {
                    let batch_num = self.queue[i].batch_num;
                    self.queue[i].status = BatchStatus::Failed;
                    error!("tx manager: forge tx {} of batch {batch_num} reverted", r.tx_hash);
                    let reason = format!("forge tx of batch {batch_num} reverted");
                    self.stop_pipeline(reason, batch_num).await;
                    return Ok(());
                }
                Some(r) => {
                    let info = &mut self.queue[i];
                    if info.mined_block.is_none() {
                        info.mined_block = Some(r.block_num);
                        info.status = BatchStatus::Mined;
                        self.l2db.done_forging(&info.pool_l2_tx_ids, info.batch_num);
                        if let Some(nonce) = info.nonce {
                            self.acc_nonce = self.acc_nonce.max(nonce + 1);
                        }
                        info!(
                            "tx manager: batch {} mined in block {}",
                            info.batch_num, r.block_num
                        );
                    }
                    if last_block >= r.block_num + self.cfg.confirm_blocks {
                        let batch_num = info.batch_num;
                        debug!(
                            "tx manager: batch {batch_num} confirmed (synced batch {})",
                            self.stats.sync.last_batch.batch_num
                        );
                        self.last_success_batch = self.last_success_batch.max(batch_num);
                        self.queue.remove(i);
                        continue;
                    }
                }
                None => {
                    let timeout = self.cfg.eth_tx_resend_timeout();
                    let timed_out =
                        self.queue[i].send_time.map_or(true, |t| t.elapsed() >= timeout);
                    if timed_out {
                        if let Err(e) = self.resend(i).await {
                            warn!("tx manager: resending batch {}: {e}", self.queue[i].batch_num);
                        }
                    }
                }
            }
            i += 1;
        }
        Ok(())
    }

    async fn resend(&mut self, i: usize) -> Result<()> {
        let reuse = !self.cfg.eth_no_reuse_nonce;
        let info = &self.queue[i];
        let args = info.forge_batch_args.clone().ok_or(CoordError::Batch {
            batch: info.batch_num,
            reason: "no forge args".to_string(),
        })?;
        let nonce = match info.nonce {
            Some(n) if reuse => n,
            _ => self.acc_next_nonce,
        };
        let gas_price = self.cfg.bump_gas_price(info.gas_price);
        let hash = self.client.rollup_forge_batch(&args, nonce, gas_price).await?;
        if nonce >= self.acc_next_nonce {
            self.acc_next_nonce = nonce + 1;
        }

        let info = &mut self.queue[i];
        info.eth_txs.push(hash);
        info.nonce = Some(nonce);
        info.gas_price = gas_price;
        info.send_time = Some(Instant::now());
        info.resend_num += 1;
        info!(
            "tx manager: batch {} resent in tx {hash} (attempt {})",
            info.batch_num, info.resend_num
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;
    use sybil_core::{
        AccountIdx, EthAddr, Nonce, PoolL2Tx, PoolL2TxState, RollupConstants, RollupEventInitialize,
        RollupForgeBatchArgs, TxId, ZKInputs,
    };
    use sybil_synchronizer::TestEthClient;

    fn client() -> Arc<TestEthClient> {
        Arc::new(TestEthClient::new(
            RollupConstants::default(),
            RollupEventInitialize { forge_l1_l2_batch_timeout: 10, ..Default::default() },
            5,
            EthAddr::repeat_byte(0xf0),
        ))
    }

    fn proved_batch(pipeline_num: usize, batch: u32, tx_ids: Vec<TxId>) -> BatchInfo {
        let mut info = BatchInfo::new(pipeline_num, BatchNum(batch), ZKInputs::default());
        info.pool_l2_tx_ids = tx_ids;
        info.forge_batch_args = Some(RollupForgeBatchArgs::default());
        info
    }

    async fn manager(
        client: Arc<TestEthClient>,
        l2db: Arc<L2Db>,
    ) -> (TxManager, mpsc::Receiver<CoordinatorMsg>) {
        let (coord_tx, coord_rx) = mpsc::channel(8);
        let cfg = CoordinatorConfig { confirm_blocks: 2, ..Default::default() };
        let (txm, _) = TxManager::new(
            cfg,
            client,
            l2db,
            CoordinatorHandle::new(coord_tx),
            RollupVariables::default(),
        )
        .await
        .unwrap();
        (txm, coord_rx)
    }

    #[tokio::test]
    async fn test_send_mine_and_confirm() {
        let client = client();
        let l2db = Arc::new(L2Db::new());
        let id = l2db
            .add_tx(PoolL2Tx {
                from_idx: AccountIdx(256),
                to_idx: AccountIdx(257),
                amount: U256::from(1u64),
                nonce: Nonce(0),
                ..Default::default()
            })
            .unwrap();
        l2db.start_forging(&[id], BatchNum(1));
        let (mut txm, _rx) = manager(client.clone(), l2db.clone()).await;

        txm.handle_msg(TxManagerMsg::AddBatch(Box::new(proved_batch(1, 1, vec![id])))).await;
        assert_eq!(txm.queue.len(), 1);
        assert_eq!(txm.queue[0].status, BatchStatus::Sent);
        assert_eq!(txm.queue[0].nonce, Some(0));
        assert_eq!(txm.acc_next_nonce, 1);

        // pending: nothing changes before the resend timeout
        txm.check_queue().await.unwrap();
        assert_eq!(txm.queue[0].status, BatchStatus::Sent);

        client.mine_block();
        txm.check_queue().await.unwrap();
        assert_eq!(txm.queue[0].status, BatchStatus::Mined);
        assert_eq!(txm.queue[0].mined_block, Some(1));
        assert_eq!(l2db.get_tx(&id).unwrap().state, PoolL2TxState::Forged);
        assert_eq!(txm.acc_nonce, 1);

        client.mine_blocks(2);
        txm.check_queue().await.unwrap();
        assert!(txm.queue.is_empty());
        assert_eq!(txm.last_success_batch(), BatchNum(1));
    }

    #[tokio::test]
    async fn test_discarded_pipeline_is_not_sent() {
        let client = client();
        let (mut txm, _rx) = manager(client.clone(), Arc::new(L2Db::new())).await;

        txm.handle_msg(TxManagerMsg::AddBatch(Box::new(proved_batch(1, 1, Vec::new())))).await;
        txm.handle_msg(TxManagerMsg::DiscardPipeline(1)).await;
        assert_eq!(txm.queue.len(), 1);

        txm.handle_msg(TxManagerMsg::AddBatch(Box::new(proved_batch(1, 2, Vec::new())))).await;
        assert_eq!(txm.queue.len(), 1);
        txm.handle_msg(TxManagerMsg::AddBatch(Box::new(proved_batch(2, 2, Vec::new())))).await;
        assert_eq!(txm.queue.len(), 2);
        assert_eq!(txm.queue[1].nonce, Some(1));
    }

    #[tokio::test]
    async fn test_send_failure_stops_pipeline() {
        let client = client();
        let (mut txm, mut rx) = manager(client.clone(), Arc::new(L2Db::new())).await;
        // another sender takes nonce 0 behind the manager's back
        client
            .rollup_forge_batch(&RollupForgeBatchArgs::default(), 0, U256::from(1u64))
            .await
            .unwrap();

        txm.handle_msg(TxManagerMsg::AddBatch(Box::new(proved_batch(1, 4, Vec::new())))).await;
        assert!(txm.queue.is_empty());
        match rx.recv().await.unwrap() {
            CoordinatorMsg::StopPipeline { failed_batch_num, .. } => {
                assert_eq!(failed_batch_num, Some(BatchNum(4)));
            }
            msg => panic!("unexpected {msg:?}"),
        }
        // the nonce was refreshed, the next batch goes through
        assert_eq!(txm.acc_next_nonce, 1);
        txm.handle_msg(TxManagerMsg::AddBatch(Box::new(proved_batch(2, 4, Vec::new())))).await;
        assert_eq!(txm.queue.len(), 1);
    }
}
