//! Periodic cleanup of the L2 pool

use sybil_core::BatchNum;
use sybil_db::StateDb;
use tracing::debug;

use crate::config::PurgerConfig;
use crate::l2db::L2Db;

/// Runs pool purges and invalidations once enough blocks or batches have
/// passed since the previous one
#[derive(Debug)]
pub struct Purger {
    cfg: PurgerConfig,
    last_purge_block: u64,
    last_purge_batch: u32,
    last_invalidate_block: u64,
    last_invalidate_batch: u32,
}

impl Purger {
    /// Purger that has never run
    pub const fn new(cfg: PurgerConfig) -> Self {
        Self {
            cfg,
            last_purge_block: 0,
            last_purge_batch: 0,
            last_invalidate_block: 0,
            last_invalidate_batch: 0,
        }
    }

    fn due(
        last_block: u64,
        block_delay: u64,
        block: u64,
        last_batch: u32,
        batch_delay: u64,
        batch: u32,
    ) -> bool {
        block >= last_block + block_delay || u64::from(batch) >= u64::from(last_batch) + batch_delay
    }

    /// Whether a purge would run at `block_num` / `batch_num`
    pub fn can_purge(&self, block_num: u64, batch_num: BatchNum) -> bool {
        Self::due(
            self.last_purge_block,
            self.cfg.purge_block_delay,
            block_num,
            self.last_purge_batch,
            self.cfg.purge_batch_delay,
            batch_num.0,
        )
    }

    /// Whether an invalidation would run at `block_num` / `batch_num`
    pub fn can_invalidate(&self, block_num: u64, batch_num: BatchNum) -> bool {
        Self::due(
            self.last_invalidate_block,
            self.cfg.invalidate_block_delay,
            block_num,
            self.last_invalidate_batch,
            self.cfg.invalidate_batch_delay,
            batch_num.0,
        )
    }

    /// Delete old forged and invalid txs if due. Returns whether it ran.
    pub fn purge_maybe(&mut self, l2db: &L2Db, block_num: u64, batch_num: BatchNum) -> bool {
        if !self.can_purge(block_num, batch_num) {
            return false;
        }
        self.last_purge_block = block_num;
        self.last_purge_batch = batch_num.0;
        let n = l2db.purge(batch_num, self.cfg.safety_period);
        debug!("purger: deleted {n} txs at block {block_num} batch {batch_num}");
        true
    }

    /// Invalidate pool txs whose nonce is already behind their account in
    /// `state`, if due. Returns whether it ran.
    pub fn invalidate_maybe(
        &mut self,
        l2db: &L2Db,
        state: &StateDb,
        block_num: u64,
        batch_num: BatchNum,
    ) -> bool {
        if !self.can_invalidate(block_num, batch_num) {
            return false;
        }
        self.last_invalidate_block = block_num;
        self.last_invalidate_batch = batch_num.0;
        let n = l2db
            .invalidate_old_nonces(|idx| state.get_account(idx).ok().map(|a| a.nonce), batch_num);
        debug!("purger: invalidated {n} txs at block {block_num} batch {batch_num}");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;
    use sybil_core::{Account, AccountIdx, Nonce, PoolL2Tx, PoolL2TxState};
    use sybil_db::{KvdbConfig, StateDbConfig, StateDbMode};

    #[test]
    fn test_delays() {
        let cfg = PurgerConfig {
            purge_block_delay: 10,
            purge_batch_delay: 3,
            invalidate_block_delay: 5,
            invalidate_batch_delay: 100,
            safety_period: 1,
        };
        let mut purger = Purger::new(cfg);
        let l2db = L2Db::new();
        assert!(purger.purge_maybe(&l2db, 10, BatchNum(0)));
        assert!(!purger.purge_maybe(&l2db, 19, BatchNum(2)));
        assert!(purger.purge_maybe(&l2db, 19, BatchNum(3)));
        assert!(!purger.can_purge(28, BatchNum(5)));
        assert!(purger.can_purge(29, BatchNum(5)));
    }

    #[test]
    fn test_invalidate_from_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = StateDb::new(StateDbConfig {
            kvdb: KvdbConfig { path: dir.path().to_path_buf(), keep: 0, ..KvdbConfig::default() },
            mode: StateDbMode::TxSelector,
            n_levels: 24,
        })
        .unwrap();
        state
            .create_account(AccountIdx(256), &Account { nonce: Nonce(3), ..Account::default() })
            .unwrap();

        let l2db = L2Db::new();
        let tx = |nonce| PoolL2Tx {
            from_idx: AccountIdx(256),
            to_idx: AccountIdx(257),
            amount: U256::from(1u64),
            nonce: Nonce(nonce),
            ..Default::default()
        };
        let stale = l2db.add_tx(tx(2)).unwrap();
        let fresh = l2db.add_tx(tx(3)).unwrap();

        let mut purger = Purger::new(PurgerConfig::default());
        assert!(purger.invalidate_maybe(&l2db, &state, 4, BatchNum(1)));
        assert_eq!(l2db.get_tx(&stale).unwrap().state, PoolL2TxState::Invalid);
        assert_eq!(l2db.get_tx(&fresh).unwrap().state, PoolL2TxState::Pending);
        assert!(!purger.invalidate_maybe(&l2db, &state, 5, BatchNum(2)));
    }
}
