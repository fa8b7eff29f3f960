//! Ethereum blocks, rollup contract events and rollup parameters

use alloy_primitives::{B256, U256};
use serde::{Deserialize, Serialize};

use crate::batch::BatchData;
use crate::l1tx::L1Tx;
use crate::l2tx::L2Tx;
use crate::types::{AccountIdx, BatchNum, EthAddr};

/// Ethereum block header data the sequencer tracks
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block number
    pub num: u64,
    /// Block hash
    pub hash: B256,
    /// Hash of the parent block
    pub parent_hash: B256,
    /// Unix seconds
    pub timestamp: u64,
}

/// Withdrawal observed on L1
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawInfo {
    /// Withdrawing account
    pub idx: AccountIdx,
    /// Batch of the exit root the withdrawal is proved against
    pub num_exit_root: BatchNum,
    /// Instant rather than delayed
    pub instant_withdraw: bool,
    /// Ethereum tx of the withdrawal
    pub tx_hash: B256,
}

/// Parameters of a withdrawal bucket
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketParams {
    /// Upper bound of the bucket, in USD
    pub ceil_usd: U256,
    /// Block of the last refill
    pub block_stamp: U256,
    /// Withdrawals available
    pub withdrawals: U256,
    /// Blocks per refill
    pub rate_blocks: U256,
    /// Withdrawals added per refill
    pub rate_withdrawals: U256,
    /// Cap on available withdrawals
    pub max_withdrawals: U256,
}

/// Change of the withdrawals held by a bucket
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketUpdate {
    /// Block of the change
    pub eth_block_num: u64,
    /// Bucket index
    pub num_bucket: u32,
    /// Block of the last refill
    pub block_stamp: u64,
    /// Withdrawals now available
    pub withdrawals: U256,
}

/// Mutable variables of the rollup contract
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupVariables {
    /// Block where these values became current
    pub eth_block_num: u64,
    /// Blocks after which an L1 batch must be forged
    pub forge_l1_l2_batch_timeout: u64,
    /// Withdrawal buckets
    pub buckets: Vec<BucketParams>,
    /// Set once the contract entered safe mode
    pub safe_mode: bool,
}

/// Verifier supported by the rollup contract
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupVerifierStruct {
    /// Txs per batch
    pub max_tx: u64,
    /// Account tree depth
    pub n_levels: u64,
}

/// Immutable parameters of the rollup contract
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupConstants {
    /// Upper bound of the L1 batch timeout, in blocks
    pub absolute_max_l1_l2_batch_timeout: u64,
    /// Supported verifiers, by index
    pub verifiers: Vec<RollupVerifierStruct>,
    /// Governance account
    pub governance_address: EthAddr,
    /// First block of the rollup
    pub genesis_block_num: u64,
}

impl RollupConstants {
    /// Index of the verifier matching `(max_tx, n_levels)`
    pub fn find_verifier_idx(&self, max_tx: u64, n_levels: u64) -> Option<usize> {
        self.verifiers.iter().position(|v| v.max_tx == max_tx && v.n_levels == n_levels)
    }
}

/// `L1UserTxEvent(uint32 toForgeL1TxsNum, uint8 position, bytes txData)`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupEventL1UserTx {
    /// Decoded tx, with its queue, position and id set
    pub l1_user_tx: L1Tx,
}

/// `ForgeBatch(uint32 batchNum, uint16 l1UserTxsLen)`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupEventForgeBatch {
    /// Forged batch
    pub batch_num: BatchNum,
    /// Ethereum tx of the forge
    pub eth_tx_hash: B256,
    /// L1 user txs forged by the batch
    pub l1_user_txs_len: u16,
    /// Gas used by the forge tx
    pub gas_used: u64,
    /// Gas price of the forge tx
    pub gas_price: U256,
}

/// `UpdateForgeL1L2BatchTimeout(uint8)`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupEventUpdateForgeL1L2BatchTimeout {
    /// New timeout, in blocks
    pub new_forge_l1_l2_batch_timeout: u64,
}

/// `WithdrawEvent(uint48 idx, uint32 numExitRoot, bool instantWithdraw)`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupEventWithdraw {
    /// Withdrawing account
    pub idx: AccountIdx,
    /// Batch of the exit root
    pub num_exit_root: BatchNum,
    /// Instant rather than delayed
    pub instant_withdraw: bool,
    /// Ethereum tx of the withdrawal
    pub tx_hash: B256,
}

/// `UpdateBucketWithdraw(uint8 numBucket, uint256 blockStamp, uint256 withdrawals)`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupEventUpdateBucketWithdraw {
    /// Bucket index
    pub num_bucket: u32,
    /// Block of the last refill
    pub block_stamp: u64,
    /// Withdrawals now available
    pub withdrawals: U256,
}

/// `UpdateBucketsParameters(uint256[])`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupEventUpdateBucketsParameters {
    /// New parameters of every bucket
    pub array_buckets: Vec<BucketParams>,
}

/// `SafeMode()`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupEventSafeMode;

/// `Initialize(uint8 forgeL1L2BatchTimeout)`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupEventInitialize {
    /// Initial L1 batch timeout, in blocks
    pub forge_l1_l2_batch_timeout: u64,
}

impl RollupEventInitialize {
    /// Variables in force right after deployment
    pub fn rollup_variables(&self, eth_block_num: u64) -> RollupVariables {
        RollupVariables {
            eth_block_num,
            forge_l1_l2_batch_timeout: self.forge_l1_l2_batch_timeout,
            buckets: Vec::new(),
            safe_mode: false,
        }
    }
}

/// Rollup events of one block, in log order per kind
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupEvents {
    /// Queued L1 user txs
    pub l1_user_tx: Vec<RollupEventL1UserTx>,
    /// Forged batches
    pub forge_batch: Vec<RollupEventForgeBatch>,
    /// Timeout changes
    pub update_forge_l1_l2_batch_timeout: Vec<RollupEventUpdateForgeL1L2BatchTimeout>,
    /// Withdrawals
    pub withdraw: Vec<RollupEventWithdraw>,
    /// Bucket refills and drains
    pub update_bucket_withdraw: Vec<RollupEventUpdateBucketWithdraw>,
    /// Bucket parameter changes
    pub update_buckets_parameters: Vec<RollupEventUpdateBucketsParameters>,
    /// Safe mode switches
    pub safe_mode: Vec<RollupEventSafeMode>,
}

/// Decoded `forgeBatch` calldata
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupForgeBatchArgs {
    /// Last account idx after the batch
    pub new_last_idx: u64,
    /// State root after the batch
    pub new_st_root: U256,
    /// Exit root of the batch
    pub new_exit_root: U256,
    /// L1 user txs as carried in the data-availability section, with only
    /// indices and effective amount
    pub l1_user_txs: Vec<L1Tx>,
    /// L1 txs added by the coordinator
    pub l1_coordinator_txs: Vec<L1Tx>,
    /// Raw `v ‖ s ‖ r` of each coordinator tx
    pub l1_coordinator_txs_auths: Vec<Vec<u8>>,
    /// L2 txs, from their data-availability bytes
    pub l2_txs_data: Vec<L2Tx>,
    /// Fee accounts of the coordinator
    pub fee_idx_coordinator: Vec<AccountIdx>,
    /// Verifier the proof is for
    pub verifier_idx: u8,
    /// Whether the batch forges an L1 user tx queue
    pub l1_batch: bool,
    /// Groth16 `A`
    pub proof_a: [U256; 2],
    /// Groth16 `B`
    pub proof_b: [[U256; 2]; 2],
    /// Groth16 `C`
    pub proof_c: [U256; 2],
}

/// Rollup data derived from one block
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupData {
    /// L1 user txs queued in the block
    pub l1_user_txs: Vec<L1Tx>,
    /// Batches forged in the block
    pub batches: Vec<BatchData>,
    /// Withdrawals made in the block
    pub withdrawals: Vec<WithdrawInfo>,
    /// Bucket updates made in the block
    pub update_bucket_withdraw: Vec<BucketUpdate>,
    /// Set when a governance event changed the variables
    pub vars: Option<RollupVariables>,
}

/// Block plus the rollup data derived from it
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockData {
    /// Block header
    pub block: Block,
    /// Rollup data of the block
    pub rollup: RollupData,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_verifier_idx() {
        let constants = RollupConstants {
            verifiers: vec![
                RollupVerifierStruct { max_tx: 344, n_levels: 24 },
                RollupVerifierStruct { max_tx: 2048, n_levels: 24 },
            ],
            ..Default::default()
        };
        assert_eq!(constants.find_verifier_idx(2048, 24), Some(1));
        assert_eq!(constants.find_verifier_idx(2048, 32), None);
    }
}
