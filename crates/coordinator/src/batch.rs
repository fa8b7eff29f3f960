//! Batch being forged, as it moves through the pipeline

use std::sync::Arc;
use std::time::Instant;

use alloy_primitives::{B256, U256};
use serde::Serialize;
use sybil_core::{BatchNum, L1Tx, L2Tx, PoolL2Tx, RollupForgeBatchArgs, TxId, ZKInputs};

use crate::prover::{Proof, ProverClient};

/// Stage reached by a batch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum BatchStatus {
    /// Txs selected and witness built
    #[default]
    Forged,
    /// Proof received
    Proof,
    /// Forge tx sent to L1
    Sent,
    /// Forge tx included in a block
    Mined,
    /// Forge tx reverted, or a previous batch failed
    Failed,
}

/// Everything known about a batch from selection to confirmation
#[derive(Clone, Debug)]
pub struct BatchInfo {
    /// Pipeline run that built the batch
    pub pipeline_num: usize,
    /// Number the batch is forged as
    pub batch_num: BatchNum,
    /// Stage reached
    pub status: BatchStatus,
    /// Witness
    pub zk_inputs: ZKInputs,
    /// Prover computing the proof, until it is returned
    pub prover: Option<Arc<dyn ProverClient>>,
    /// When the proof was requested
    pub proof_start: Option<Instant>,
    /// Proof, once ready
    pub proof: Option<Proof>,
    /// Public inputs returned with the proof
    pub public_inputs: Vec<U256>,
    /// Whether the batch forges an L1 user tx queue
    pub l1_batch: bool,
    /// Verifier the proof is for
    pub verifier_idx: u8,
    /// Forged L1 user txs
    pub l1_user_txs: Vec<L1Tx>,
    /// L1 txs added by the coordinator
    pub l1_coordinator_txs: Vec<L1Tx>,
    /// Signatures of the coordinator txs
    pub l1_coordinator_txs_auths: Vec<Vec<u8>>,
    /// L2 txs of the batch
    pub l2_txs: Vec<L2Tx>,
    /// Pool txs in the batch, to mark them forged once mined
    pub pool_l2_tx_ids: Vec<TxId>,
    /// Calldata of the forge tx
    pub forge_batch_args: Option<RollupForgeBatchArgs>,
    /// Every forge tx sent for the batch, the last one is current
    pub eth_txs: Vec<B256>,
    /// Nonce of the current forge tx
    pub nonce: Option<u64>,
    /// Gas price of the current forge tx
    pub gas_price: U256,
    /// When the current forge tx was sent
    pub send_time: Option<Instant>,
    /// Resends so far
    pub resend_num: usize,
    /// Block the forge tx was mined in
    pub mined_block: Option<u64>,
}

impl BatchInfo {
    /// Batch built by pipeline `pipeline_num`
    pub fn new(pipeline_num: usize, batch_num: BatchNum, zk_inputs: ZKInputs) -> Self {
        Self {
            pipeline_num,
            batch_num,
            status: BatchStatus::Forged,
            zk_inputs,
            prover: None,
            proof_start: None,
            proof: None,
            public_inputs: Vec::new(),
            l1_batch: false,
            verifier_idx: 0,
            l1_user_txs: Vec::new(),
            l1_coordinator_txs: Vec::new(),
            l1_coordinator_txs_auths: Vec::new(),
            l2_txs: Vec::new(),
            pool_l2_tx_ids: Vec::new(),
            forge_batch_args: None,
            eth_txs: Vec::new(),
            nonce: None,
            gas_price: U256::ZERO,
            send_time: None,
            resend_num: 0,
            mined_block: None,
        }
    }

    /// Set the L2 txs from the selected pool txs
    pub fn set_l2_txs(&mut self, txs: &[PoolL2Tx]) {
        self.pool_l2_tx_ids = txs.iter().map(|tx| tx.tx_id).collect();
        self.l2_txs = txs
            .iter()
            .map(|tx| {
                let mut l2 = tx.to_l2_tx();
                l2.batch_num = self.batch_num;
                l2
            })
            .collect();
    }

    /// Last forge tx sent
    pub fn eth_tx(&self) -> Option<B256> {
        self.eth_txs.last().copied()
    }

    /// Arguments of the `forgeBatch` call, once the proof is in.
    ///
    /// The `b` coordinates of the proof are swapped to the order the
    /// verifier contract expects.
    pub fn prepare_forge_batch_args(&self) -> Option<RollupForgeBatchArgs> {
        let proof = self.proof.as_ref()?;
        let meta = &self.zk_inputs.metadata;
        Some(RollupForgeBatchArgs {
            new_last_idx: meta.new_last_idx_raw,
            new_st_root: meta.new_state_root_raw,
            new_exit_root: meta.new_exit_root_raw,
            l1_user_txs: self.l1_user_txs.clone(),
            l1_coordinator_txs: self.l1_coordinator_txs.clone(),
            l1_coordinator_txs_auths: self.l1_coordinator_txs_auths.clone(),
            l2_txs_data: self.l2_txs.clone(),
            fee_idx_coordinator: Vec::new(),
            verifier_idx: self.verifier_idx,
            l1_batch: self.l1_batch,
            proof_a: [proof.pi_a[0], proof.pi_a[1]],
            proof_b: [[proof.pi_b[0][1], proof.pi_b[0][0]], [proof.pi_b[1][1], proof.pi_b[1][0]]],
            proof_c: [proof.pi_c[0], proof.pi_c[1]],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sybil_core::{AccountIdx, Nonce};

    #[test]
    fn test_forge_batch_args_from_proof() {
        let mut zki = ZKInputs::default();
        zki.metadata.new_last_idx_raw = 257;
        zki.metadata.new_state_root_raw = U256::from(7u64);
        let mut info = BatchInfo::new(1, BatchNum(3), zki);
        info.l1_batch = true;
        info.verifier_idx = 2;
        info.set_l2_txs(&[PoolL2Tx {
            tx_id: TxId::l2(AccountIdx(256), Nonce(0)).unwrap(),
            from_idx: AccountIdx(256),
            to_idx: AccountIdx(257),
            amount: U256::from(1u64),
            ..Default::default()
        }]);
        assert!(info.prepare_forge_batch_args().is_none());

        let n = |v: u64| U256::from(v);
        info.proof = Some(Proof {
            pi_a: [n(1), n(2), n(1)],
            pi_b: [[n(3), n(4)], [n(5), n(6)], [n(1), n(0)]],
            pi_c: [n(7), n(8), n(1)],
            protocol: "groth16".to_string(),
        });
        let args = info.prepare_forge_batch_args().unwrap();
        assert_eq!(args.new_last_idx, 257);
        assert_eq!(args.new_st_root, n(7));
        assert_eq!(args.verifier_idx, 2);
        assert!(args.l1_batch);
        assert_eq!(args.l2_txs_data[0].batch_num, BatchNum(3));
        assert_eq!(args.proof_a, [n(1), n(2)]);
        assert_eq!(args.proof_b, [[n(4), n(3)], [n(6), n(5)]]);
        assert_eq!(args.proof_c, [n(7), n(8)]);
        assert_eq!(info.pool_l2_tx_ids.len(), 1);
    }
}
