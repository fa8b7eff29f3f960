//! Witness construction for the batches the coordinator forges

use sybil_core::{AccountIdx, BatchNum, L1Tx, PoolL2Tx, ZKInputs};
use sybil_db::{Checkpoints, LocalStateDb, StateDbConfig, StateDbMode};
use sybil_txprocessor::{TxProcessor, TxProcessorConfig};

use crate::error::{CoordError, Result};

/// Applies selected txs to a BatchBuilder-mode copy of the state and
/// returns the proof inputs
#[derive(Debug)]
pub struct BatchBuilder {
    local: LocalStateDb,
}

impl BatchBuilder {
    /// Builder keeping its state in `cfg.kvdb.path`
    pub fn new(mut cfg: StateDbConfig, checkpoints: Checkpoints) -> Result<Self> {
        cfg.mode = StateDbMode::BatchBuilder;
        Ok(Self { local: LocalStateDb::new(cfg, checkpoints)? })
    }

    /// State the witnesses are built on
    pub const fn local_state(&self) -> &LocalStateDb {
        &self.local
    }

    /// Rewind to `batch_num`, from the synchronizer checkpoints if asked
    pub fn reset(&mut self, batch_num: BatchNum, from_synchronizer: bool) -> Result<()> {
        self.local.reset(batch_num, from_synchronizer)?;
        Ok(())
    }

    /// Process the batch and checkpoint it
    pub fn build_batch(
        &mut self,
        config: &TxProcessorConfig,
        coord_idxs: &[AccountIdx],
        l1_user_txs: &mut [L1Tx],
        l1_coordinator_txs: &mut [L1Tx],
        l2_txs: &mut [PoolL2Tx],
    ) -> Result<ZKInputs> {
        let batch = self.local.current_batch().next()?;
        let mut tp = TxProcessor::new(&mut self.local, config.clone());
        let out = tp.process_txs(coord_idxs, l1_user_txs, l1_coordinator_txs, l2_txs)?;
        out.zk_inputs.ok_or(CoordError::Batch { batch, reason: "no witness produced".to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;
    use sybil_core::EthAddr;
    use sybil_db::{KvdbConfig, StateDb};

    fn state_cfg(dir: &std::path::Path, mode: StateDbMode) -> StateDbConfig {
        StateDbConfig {
            kvdb: KvdbConfig { path: dir.to_path_buf(), keep: 0, ..KvdbConfig::default() },
            mode,
            n_levels: 24,
        }
    }

    #[test]
    fn test_build_batch_matches_synchronizer() {
        let sync_dir = tempfile::tempdir().unwrap();
        let bb_dir = tempfile::tempdir().unwrap();
        let mut sync = StateDb::new(state_cfg(sync_dir.path(), StateDbMode::Synchronizer)).unwrap();
        let mut bb = BatchBuilder::new(
            state_cfg(bb_dir.path(), StateDbMode::Synchronizer),
            sync.checkpoints(),
        )
        .unwrap();
        assert_eq!(bb.local_state().mode(), StateDbMode::BatchBuilder);
        bb.reset(BatchNum(0), true).unwrap();

        let deposit = L1Tx::new(L1Tx {
            to_forge_l1_txs_num: Some(0),
            user_origin: true,
            from_eth_addr: EthAddr::repeat_byte(0xaa),
            deposit_amount: U256::from(10u64),
            ..Default::default()
        })
        .unwrap();
        let config = TxProcessorConfig { max_tx: 4, max_l1_tx: 2, ..Default::default() };

        let zki = bb.build_batch(&config, &[], &mut [deposit.clone()], &mut [], &mut []).unwrap();
        assert_eq!(zki.current_num_batch, 1);
        assert_eq!(zki.metadata.new_last_idx_raw, 256);
        assert_eq!(bb.local_state().current_batch(), BatchNum(1));

        TxProcessor::new(&mut sync, config)
            .process_txs(&[], &mut [deposit], &mut [], &mut [])
            .unwrap();
        assert_eq!(zki.metadata.new_state_root_raw, sync.account_root());
    }
}
