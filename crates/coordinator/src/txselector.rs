//! Selection of the txs of the next batch
//!
//! L1 user txs are mandatory and go first. Pending pool txs are then tried
//! in `(from_idx, nonce)` order against a TxSelector-mode copy of the state,
//! so that each selected tx sees the effects of the previous ones. Txs that
//! fail are retried in later rounds, since a tx selected after them may
//! have made them valid, until a round selects nothing.

use std::sync::Arc;

use sybil_core::{BatchNum, L1Tx, PoolL2Tx, TxId};
use sybil_db::{Checkpoints, LocalStateDb, StateDbConfig, StateDbMode};
use sybil_txprocessor::{TxProcessor, TxProcessorConfig};
use tracing::debug;

use crate::error::Result;
use crate::l2db::L2Db;

/// Outcome of a selection
#[derive(Clone, Debug, Default)]
pub struct Selection {
    /// L1 user txs with their effective values filled
    pub l1_user_txs: Vec<L1Tx>,
    /// Accepted pool txs, in processing order
    pub l2_txs: Vec<PoolL2Tx>,
    /// Pool txs left out, with the reason
    pub discarded: Vec<(TxId, String)>,
}

/// Chooses the txs of the next batch from the pool
#[derive(Debug)]
pub struct TxSelector {
    local: LocalStateDb,
    l2db: Arc<L2Db>,
}

impl TxSelector {
    /// Selector keeping its state in `cfg.kvdb.path`, forked from the
    /// synchronizer `checkpoints`
    pub fn new(mut cfg: StateDbConfig, checkpoints: Checkpoints, l2db: Arc<L2Db>) -> Result<Self> {
        cfg.mode = StateDbMode::TxSelector;
        Ok(Self { local: LocalStateDb::new(cfg, checkpoints)?, l2db })
    }

    /// State the selection runs on
    pub const fn local_state(&self) -> &LocalStateDb {
        &self.local
    }

    /// Rewind the local state to `batch_num`
    pub fn reset(&mut self, batch_num: BatchNum, from_synchronizer: bool) -> Result<()> {
        self.local.reset(batch_num, from_synchronizer)?;
        Ok(())
    }

    /// Select only L2 txs
    pub fn get_l2_tx_selection(&mut self, config: &TxProcessorConfig) -> Result<Selection> {
        self.get_l1_l2_tx_selection(config, Vec::new())
    }

    /// Apply `l1_user_txs`, then select as many pending pool txs as fit.
    /// The local state is checkpointed at the next batch.
    pub fn get_l1_l2_tx_selection(
        &mut self,
        config: &TxProcessorConfig,
        mut l1_user_txs: Vec<L1Tx>,
    ) -> Result<Selection> {
        let room = config.max_tx.saturating_sub(l1_user_txs.len());
        let mut tp = TxProcessor::new(&mut self.local, config.clone());
        for tx in &mut l1_user_txs {
            tp.apply_l1_tx(tx)?;
        }

        let mut candidates = self.l2db.pending_txs();
        let mut selected = Vec::new();
        let mut rejected: Vec<(PoolL2Tx, String)> = Vec::new();
        loop {
            let mut progress = false;
            rejected.clear();
            for mut tx in candidates.drain(..) {
                if selected.len() >= room {
                    rejected.push((tx, "batch full".to_string()));
                    continue;
                }
                match tp.apply_l2_tx(&mut tx) {
                    Ok(()) => {
                        selected.push(tx);
                        progress = true;
                    }
                    Err(e) => rejected.push((tx, e.to_string())),
                }
            }
            if !progress || rejected.is_empty() || selected.len() >= room {
                break;
            }
            candidates = rejected.drain(..).map(|(tx, _)| tx).collect();
        }
        drop(tp);
        self.local.make_checkpoint()?;

        debug!(
            batch = %self.local.current_batch(),
            l1 = l1_user_txs.len(),
            l2 = selected.len(),
            discarded = rejected.len(),
            "tx selection"
        );
        Ok(Selection {
            l1_user_txs,
            l2_txs: selected,
            discarded: rejected.into_iter().map(|(tx, reason)| (tx.tx_id, reason)).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;
    use sybil_core::{AccountIdx, EthAddr, Nonce};
    use sybil_db::{KvdbConfig, StateDb};
    use tempfile::TempDir;

    fn state_cfg(dir: &TempDir, mode: StateDbMode) -> StateDbConfig {
        StateDbConfig {
            kvdb: KvdbConfig { path: dir.path().to_path_buf(), keep: 0, ..KvdbConfig::default() },
            mode,
            n_levels: 24,
        }
    }

    fn deposit(addr: u8, position: u16) -> L1Tx {
        L1Tx::new(L1Tx {
            to_forge_l1_txs_num: Some(0),
            position,
            user_origin: true,
            from_eth_addr: EthAddr::repeat_byte(addr),
            from_bjj: [addr; 32],
            deposit_amount: U256::from(100u64),
            ..Default::default()
        })
        .unwrap()
    }

    fn vouch(from: u64, to: u64, nonce: u64) -> PoolL2Tx {
        PoolL2Tx {
            from_idx: AccountIdx(from),
            to_idx: AccountIdx(to),
            amount: U256::from(1u64),
            nonce: Nonce(nonce),
            ..Default::default()
        }
    }

    #[test]
    fn test_selection_order_and_rejections() {
        let sync_dir = tempfile::tempdir().unwrap();
        let local_dir = tempfile::tempdir().unwrap();
        let sync = StateDb::new(state_cfg(&sync_dir, StateDbMode::Synchronizer)).unwrap();
        let l2db = Arc::new(L2Db::new());
        let mut sel = TxSelector::new(
            state_cfg(&local_dir, StateDbMode::TxSelector),
            sync.checkpoints(),
            l2db.clone(),
        )
        .unwrap();
        sel.reset(BatchNum(0), true).unwrap();

        // nonce 1 is submitted before nonce 0, both end up selected in order
        let second = l2db.add_tx(vouch(256, 258, 1)).unwrap();
        let first = l2db.add_tx(vouch(256, 257, 0)).unwrap();
        let gap = l2db.add_tx(vouch(257, 256, 5)).unwrap();
        let missing = l2db.add_tx(vouch(300, 256, 0)).unwrap();

        let config = TxProcessorConfig { max_tx: 8, max_l1_tx: 4, ..Default::default() };
        let deposits = vec![deposit(0xaa, 0), deposit(0xbb, 1), deposit(0xcc, 2)];
        let s = sel.get_l1_l2_tx_selection(&config, deposits).unwrap();
        assert_eq!(s.l1_user_txs.len(), 3);
        assert_eq!(s.l1_user_txs[2].effective_from_idx, AccountIdx(258));
        assert_eq!(s.l2_txs.iter().map(|t| t.tx_id).collect::<Vec<_>>(), vec![first, second]);
        let discarded: Vec<TxId> = s.discarded.iter().map(|(id, _)| *id).collect();
        assert!(discarded.contains(&gap));
        assert!(discarded.contains(&missing));
        assert_eq!(sel.local_state().current_batch(), BatchNum(1));
        assert_eq!(sel.local_state().get_account(AccountIdx(256)).unwrap().nonce, Nonce(2));

        // a full batch leaves the rest for later
        sel.reset(BatchNum(0), false).unwrap();
        let config = TxProcessorConfig { max_tx: 4, max_l1_tx: 4, ..Default::default() };
        let deposits = vec![deposit(0xaa, 0), deposit(0xbb, 1), deposit(0xcc, 2)];
        let s = sel.get_l1_l2_tx_selection(&config, deposits).unwrap();
        assert_eq!(s.l2_txs.len(), 1);
        assert!(s.discarded.iter().any(|(id, reason)| *id == second && reason == "batch full"));
    }
}
