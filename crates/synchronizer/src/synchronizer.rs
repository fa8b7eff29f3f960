//! Block-by-block synchronization of the rollup
//!
//! [`Synchronizer::sync`] takes the next L1 block, detects reorgs by its
//! parent hash, replays the forged batches on the Synchronizer-mode
//! [`StateDb`] and stores the derived [`BlockData`] in the history.

use std::env;
use std::sync::Arc;

use sybil_core::constants::MAX_L1_TX;
use sybil_core::{
    AccountUpdate, Batch, BatchData, BatchNum, Block, BlockData, BucketUpdate, L1Tx, L2Tx,
    PoolL2Tx, RollupConstants, RollupData, RollupEventForgeBatch, RollupEvents, RollupVariables,
    TxId, WithdrawInfo,
};
use sybil_db::{Checkpoints, LastDb, StateDb, StateDbMode};
use sybil_txprocessor::{TxProcessor, TxProcessorConfig};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};
use crate::eth::EthClient;
use crate::history::HistoryStore;
use crate::stats::{Stats, StatsHolder};

/// Synchronizer configuration
#[derive(Clone, Debug)]
pub struct SynchronizerConfig {
    /// Chain id mixed into the compressed txs of replayed batches
    pub chain_id: u16,
    /// Refresh the L1 stats when fewer blocks than this remain to sync
    pub stats_update_block_num_diff_threshold: u16,
    /// Otherwise refresh them every this many blocks
    pub stats_update_frequency_divider: u16,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            chain_id: 0,
            stats_update_block_num_diff_threshold: 100,
            stats_update_frequency_divider: 100,
        }
    }
}

impl SynchronizerConfig {
    /// Load from environment variables
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            chain_id: env::var("SYBIL_CHAIN_ID")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(d.chain_id),
            stats_update_block_num_diff_threshold: env::var("SYBIL_SYNC_STATS_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(d.stats_update_block_num_diff_threshold),
            stats_update_frequency_divider: env::var("SYBIL_SYNC_STATS_DIVIDER")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(d.stats_update_frequency_divider),
        }
    }
}

/// Result of one [`Synchronizer::sync`] step
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Block synchronized
    Block(Box<BlockData>),
    /// A reorg discarded this many blocks
    Reorg(u64),
    /// The next block is not mined yet
    Idle,
}

/// Rebuilds the rollup state from L1
pub struct Synchronizer {
    client: Arc<dyn EthClient>,
    history: Arc<dyn HistoryStore>,
    state: StateDb,
    config: SynchronizerConfig,
    consts: RollupConstants,
    vars: RollupVariables,
    init_vars: RollupVariables,
    start_block_num: u64,
    stats: Arc<StatsHolder>,
    reset_state_failed: bool,
}

impl Synchronizer {
    /// Load the rollup constants and initial variables, then rewind `state`
    /// to the last batch in `history`
    pub async fn new(
        client: Arc<dyn EthClient>,
        history: Arc<dyn HistoryStore>,
        state: StateDb,
        config: SynchronizerConfig,
    ) -> Result<Self> {
        if state.mode() != StateDbMode::Synchronizer {
            return Err(SyncError::Inconsistent(format!("statedb in {:?} mode", state.mode())));
        }
        let consts = client.rollup_constants().await?;
        let (init_evt, start_block_num) = client.rollup_event_init(consts.genesis_block_num).await?;
        let init_vars = init_evt.rollup_variables(start_block_num);
        let stats = Arc::new(StatsHolder::new(
            start_block_num,
            config.stats_update_block_num_diff_threshold,
            config.stats_update_frequency_divider,
        ));

        let mut s = Self {
            client,
            history,
            state,
            config,
            consts,
            vars: init_vars.clone(),
            init_vars,
            start_block_num,
            stats,
            reset_state_failed: false,
        };
        s.init().await?;
        Ok(s)
    }

    async fn init(&mut self) -> Result<()> {
        self.stats.update_eth(self.client.as_ref()).await?;
        let last_block = self.history.last_block()?.unwrap_or_default();
        self.reset_state(&last_block)?;

        let stats = self.stats.copy_stats();
        info!(
            "sync init: last synced block {}, eth last block {}, batch {} of {} \
             ({:.2}% blocks, {:.2}% batches)",
            stats.sync.last_block.num,
            stats.eth.last_block.num,
            stats.sync.last_batch.batch_num,
            stats.eth.last_batch_num,
            self.stats.blocks_perc(),
            self.stats.batches_perc(),
        );
        Ok(())
    }

    /// Synchronize the block after `last_saved_block`, the history's last
    /// block when `None`
    pub async fn sync(&mut self, last_saved_block: Option<Block>) -> Result<SyncOutcome> {
        if self.reset_state_failed {
            let last = self.history.last_block()?.unwrap_or_default();
            self.reset_state(&last).map_err(|e| SyncError::ResetStateFailed(e.to_string()))?;
            self.reset_state_failed = false;
        }

        let result = self.sync_next(last_saved_block).await;
        if let Err(e) = &result {
            if !e.is_done() {
                self.reset_intermediate_state();
            }
        }
        result
    }

    async fn sync_next(&mut self, last_saved_block: Option<Block>) -> Result<SyncOutcome> {
        let last_saved = match last_saved_block {
            Some(b) => Some(b),
            None => self.history.last_block()?,
        };
        let next = last_saved.as_ref().map_or(self.start_block_num, |b| b.num + 1);

        let Some(eth_block) = self.client.eth_block_by_number(Some(next)).await? else {
            return Ok(SyncOutcome::Idle);
        };
        if self.stats.eth_refresh_due(next) {
            self.stats.update_eth(self.client.as_ref()).await?;
        }

        if let Some(last) = &last_saved {
            if eth_block.parent_hash != last.hash {
                info!(
                    "reorg detected at block {}: parent {} != {}",
                    eth_block.num, eth_block.parent_hash, last.hash
                );
                let valid = self.reorg(last).await?;
                let discarded = last.num - valid;
                info!("reorg: {discarded} blocks discarded, back to block {valid}");
                return Ok(SyncOutcome::Reorg(discarded));
            }
        }

        debug!("syncing block {}", eth_block.num);
        let rollup = self.rollup_sync(&eth_block).await?;
        let data = BlockData { block: eth_block, rollup };
        self.history.add_block_data(&data)?;

        let last_batch = data.rollup.batches.last().map(|b| &b.batch);
        let last_l1_batch = data
            .rollup
            .batches
            .iter()
            .rev()
            .find(|b| b.l1_batch)
            .map(|b| (data.block.num, b.batch.forge_l1_txs_num));
        self.stats.update_sync(&data.block, last_batch, last_l1_batch);
        if !data.rollup.batches.is_empty() {
            info!(
                "synced block {}: {} batches, last batch {}",
                data.block.num,
                data.rollup.batches.len(),
                self.state.current_batch()
            );
        }
        Ok(SyncOutcome::Block(Box::new(data)))
    }

    /// Roll back to the history's last block after a failed step
    fn reset_intermediate_state(&mut self) {
        let last = match self.history.last_block() {
            Ok(b) => b.unwrap_or_default(),
            Err(e) => {
                error!("reset intermediate state: {e}");
                self.reset_state_failed = true;
                return;
            }
        };
        if let Err(e) = self.reset_state(&last) {
            error!("reset intermediate state to block {}: {e}", last.num);
            self.reset_state_failed = true;
        }
    }

    /// Walk back from `uncle` to the newest block that is still canonical,
    /// drop everything above it and rewind the state. Returns the number of
    /// the valid block.
    async fn reorg(&mut self, uncle: &Block) -> Result<u64> {
        let mut num = uncle.num;
        let block = loop {
            let local = self
                .history
                .get_block(num)?
                .ok_or_else(|| {
                    SyncError::Inconsistent(format!("block {num} missing from history"))
                })?;
            let eth = self
                .client
                .eth_block_by_number(Some(num))
                .await?
                .ok_or(SyncError::UnknownBlock)?;
            if local.hash == eth.hash {
                debug!("reorg: block {num} is canonical");
                break local;
            }
            if num <= self.start_block_num {
                return Err(SyncError::Inconsistent("no common block with L1".to_string()));
            }
            num -= 1;
        };

        self.history.reorg(block.num)?;
        self.reset_state(&block)?;
        Ok(block.num)
    }

    /// Reload the variables and rewind the state to the last batch of the
    /// history, which ends at `block`
    fn reset_state(&mut self, block: &Block) -> Result<()> {
        self.vars = match self.history.sc_vars()? {
            Some(vars) => vars,
            None => {
                self.history.set_initial_sc_vars(&self.init_vars)?;
                self.init_vars.clone()
            }
        };

        let last_batch = self.history.last_batch()?;
        let batch_num = last_batch.as_ref().map_or(BatchNum(0), |b| b.batch_num);
        let last_l1_batch_block = self.history.last_l1_batch_block_num()?.unwrap_or_default();
        let last_forge_l1_txs_num = self.history.last_l1_txs_num()?;

        info!("reset state to batch {batch_num} (block {})", block.num);
        self.state.reset(batch_num)?;
        self.stats.update_sync(
            block,
            Some(&last_batch.unwrap_or_default()),
            Some((last_l1_batch_block, last_forge_l1_txs_num)),
        );
        Ok(())
    }

    /// Derive the rollup data of `block`, replaying its batches
    async fn rollup_sync(&mut self, block: &Block) -> Result<RollupData> {
        let Some(events) = self.client.rollup_events_by_block(block.num, block.hash).await? else {
            return Ok(RollupData::default());
        };
        let mut data = RollupData::default();
        let mut next_forge_l1_txs_num = self.history.last_l1_txs_num()?.map_or(0, |n| n + 1);

        for evt in &events.l1_user_tx {
            let mut tx = evt.l1_user_tx.clone();
            tx.eth_block_num = block.num;
            data.l1_user_txs.push(L1Tx::new(tx)?);
        }

        for evt in &events.forge_batch {
            let batch =
                self.forge_batch(block, evt, &data.l1_user_txs, next_forge_l1_txs_num).await?;
            if batch.l1_batch {
                next_forge_l1_txs_num += 1;
            }
            data.batches.push(batch);
        }

        data.update_bucket_withdraw = events
            .update_bucket_withdraw
            .iter()
            .map(|evt| BucketUpdate {
                eth_block_num: block.num,
                num_bucket: evt.num_bucket,
                block_stamp: evt.block_stamp,
                withdrawals: evt.withdrawals,
            })
            .collect();
        data.withdrawals = events
            .withdraw
            .iter()
            .map(|evt| WithdrawInfo {
                idx: evt.idx,
                num_exit_root: evt.num_exit_root,
                instant_withdraw: evt.instant_withdraw,
                tx_hash: evt.tx_hash,
            })
            .collect();

        if self.update_vars(&events) {
            self.vars.eth_block_num = block.num;
            data.vars = Some(self.vars.clone());
        }
        Ok(data)
    }

    /// Apply governance events to the variables, returning whether any changed
    fn update_vars(&mut self, events: &RollupEvents) -> bool {
        let mut updated = false;
        for evt in &events.update_forge_l1_l2_batch_timeout {
            self.vars.forge_l1_l2_batch_timeout = evt.new_forge_l1_l2_batch_timeout;
            updated = true;
        }
        for evt in &events.update_buckets_parameters {
            self.vars.buckets.clone_from(&evt.array_buckets);
            self.vars.safe_mode = false;
            updated = true;
        }
        if !events.safe_mode.is_empty() {
            self.vars.safe_mode = true;
            updated = true;
        }
        updated
    }

    /// Replay one forged batch
    async fn forge_batch(
        &mut self,
        block: &Block,
        evt: &RollupEventForgeBatch,
        block_l1_user_txs: &[L1Tx],
        next_forge_l1_txs_num: u64,
    ) -> Result<BatchData> {
        let batch_num = evt.batch_num;
        let (args, sender) =
            self.client.rollup_forge_batch_args(evt.eth_tx_hash, evt.l1_user_txs_len).await?;

        let mut l1_user_txs = Vec::new();
        if args.l1_batch {
            l1_user_txs = self.history.unforged_l1_user_txs(next_forge_l1_txs_num)?;
            // a queue may be closed and forged in the block that filled it
            l1_user_txs.extend(
                block_l1_user_txs
                    .iter()
                    .filter(|tx| tx.to_forge_l1_txs_num == Some(next_forge_l1_txs_num))
                    .cloned(),
            );
            if l1_user_txs.len() != usize::from(evt.l1_user_txs_len) {
                return Err(SyncError::Inconsistent(format!(
                    "batch {batch_num} forges {} L1 user txs of queue \
                     {next_forge_l1_txs_num}, {} known",
                    evt.l1_user_txs_len,
                    l1_user_txs.len()
                )));
            }
        }
        let mut position = l1_user_txs.len();

        let mut l1_coordinator_txs = Vec::with_capacity(args.l1_coordinator_txs.len());
        for tx in &args.l1_coordinator_txs {
            let tx = L1Tx {
                tx_id: TxId::default(),
                position: u16::try_from(position)
                    .map_err(|_| SyncError::Inconsistent("too many L1 txs in batch".to_string()))?,
                user_origin: false,
                eth_block_num: block.num,
                eth_tx_hash: evt.eth_tx_hash,
                batch_num: Some(batch_num),
                ..tx.clone()
            };
            l1_coordinator_txs.push(L1Tx::new(tx)?);
            position += 1;
        }

        let mut pool_l2_txs: Vec<PoolL2Tx> =
            args.l2_txs_data.iter().map(L2Tx::to_pool_l2_tx).collect();

        let verifier = self.consts.verifiers.get(usize::from(args.verifier_idx)).ok_or_else(|| {
            SyncError::Inconsistent(format!(
                "verifier_idx ({}) >= verifiers ({})",
                args.verifier_idx,
                self.consts.verifiers.len()
            ))
        })?;
        let tp_config = TxProcessorConfig {
            n_levels: usize::try_from(verifier.n_levels)
                .map_err(|_| SyncError::Inconsistent("verifier n_levels overflow".to_string()))?,
            max_tx: usize::try_from(verifier.max_tx)
                .map_err(|_| SyncError::Inconsistent("verifier max_tx overflow".to_string()))?,
            max_l1_tx: MAX_L1_TX,
            chain_id: self.config.chain_id,
        };

        let out = TxProcessor::new(&mut self.state, tp_config).process_txs(
            &args.fee_idx_coordinator,
            &mut l1_user_txs,
            &mut l1_coordinator_txs,
            &mut pool_l2_txs,
        )?;
        if self.state.current_batch() != batch_num {
            return Err(SyncError::Inconsistent(format!(
                "statedb batch ({}) != forged batch ({batch_num})",
                self.state.current_batch()
            )));
        }
        if self.state.account_root() != args.new_st_root {
            warn!(
                "batch {batch_num}: account root {} != committed {}",
                self.state.account_root(),
                args.new_st_root
            );
        }
        if out.exit_root != args.new_exit_root {
            warn!(
                "batch {batch_num}: exit root {} != committed {}",
                out.exit_root, args.new_exit_root
            );
        }

        let mut l2_txs = Vec::with_capacity(pool_l2_txs.len());
        for tx in &pool_l2_txs {
            let l2 = L2Tx {
                tx_id: TxId::default(),
                eth_block_num: block.num,
                batch_num,
                position: u32::try_from(position)
                    .map_err(|_| SyncError::Inconsistent("too many txs in batch".to_string()))?,
                ..tx.to_l2_tx()
            };
            l2_txs.push(L2Tx::new(l2)?);
            position += 1;
        }

        for tx in &mut l1_user_txs {
            tx.batch_num = Some(batch_num);
        }

        let created_accounts = out.created_accounts.unwrap_or_default();
        let updated_accounts = out
            .updated_accounts
            .unwrap_or_default()
            .into_values()
            .map(|acc| AccountUpdate {
                eth_block_num: block.num,
                batch_num,
                idx: acc.idx,
                nonce: acc.nonce,
                balance: acc.balance,
            })
            .collect();

        let forge_l1_txs_num = args.l1_batch.then_some(next_forge_l1_txs_num);
        let batch = Batch {
            batch_num,
            eth_tx_hash: evt.eth_tx_hash,
            eth_block_num: block.num,
            forger_addr: sender,
            state_root: args.new_st_root,
            account_root: self.state.account_root(),
            vouch_root: self.state.vouch_root(),
            score_root: self.state.score_root(),
            exit_root: args.new_exit_root,
            num_accounts: created_accounts.len(),
            last_idx: args.new_last_idx,
            forge_l1_txs_num,
            gas_used: evt.gas_used,
            gas_price: evt.gas_price,
        };
        debug!(
            "replayed batch {batch_num}: {} L1 user, {} L1 coordinator, {} L2 txs",
            l1_user_txs.len(),
            l1_coordinator_txs.len(),
            l2_txs.len()
        );

        Ok(BatchData {
            l1_batch: args.l1_batch,
            l1_user_txs,
            l1_coordinator_txs,
            l2_txs,
            created_accounts,
            updated_accounts,
            exit_tree: out.exit_infos.unwrap_or_default(),
            batch,
        })
    }

    /// Immutable parameters of the rollup contract
    pub const fn rollup_constants(&self) -> &RollupConstants {
        &self.consts
    }

    /// Rollup variables as of the last synchronized block
    pub const fn sc_vars(&self) -> &RollupVariables {
        &self.vars
    }

    /// Shared progress
    pub fn stats(&self) -> Arc<StatsHolder> {
        Arc::clone(&self.stats)
    }

    /// Snapshot of the progress
    pub fn copy_stats(&self) -> Stats {
        self.stats.copy_stats()
    }

    /// Synchronized state
    pub const fn state_db(&self) -> &StateDb {
        &self.state
    }

    /// Handle on the state checkpoints, for the coordinator forks
    pub fn checkpoints(&self) -> Checkpoints {
        self.state.checkpoints()
    }

    /// Read view on the newest state checkpoint
    pub fn last_db(&self) -> Option<Arc<LastDb>> {
        self.state.kvdb().last()
    }

    /// Shared history store
    pub fn history(&self) -> Arc<dyn HistoryStore> {
        Arc::clone(&self.history)
    }

    /// First block of the rollup
    pub const fn start_block_num(&self) -> u64 {
        self.start_block_num
    }

    /// Configuration in use
    pub const fn config(&self) -> &SynchronizerConfig {
        &self.config
    }
}
