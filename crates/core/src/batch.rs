//! Forged batches and what they changed

use alloy_primitives::{B256, U256};
use serde::{Deserialize, Serialize};
use sybil_smt::CircomVerifierProof;

use crate::account::{Account, AccountUpdate};
use crate::l1tx::L1Tx;
use crate::l2tx::L2Tx;
use crate::types::{AccountIdx, BatchNum, EthAddr};

/// Batch committed on L1
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Number of the batch
    pub batch_num: BatchNum,
    /// Ethereum tx of the forge
    pub eth_tx_hash: B256,
    /// Ethereum block in which the batch is forged
    pub eth_block_num: u64,
    /// Coordinator that forged it
    pub forger_addr: EthAddr,
    /// `newStRoot` committed by the forger
    pub state_root: U256,
    /// Account tree root after the batch
    pub account_root: U256,
    /// Vouch tree root after the batch
    pub vouch_root: U256,
    /// Score tree root after the batch
    pub score_root: U256,
    /// Root of the exit tree built by the batch
    pub exit_root: U256,
    /// Accounts created by the batch
    pub num_accounts: usize,
    /// Last account idx after the batch
    pub last_idx: u64,
    /// Only set when the batch forges an L1 user tx queue
    pub forge_l1_txs_num: Option<u64>,
    /// Gas used by the forge tx
    pub gas_used: u64,
    /// Gas price of the forge tx
    pub gas_price: U256,
}

/// Exit leaf created or updated by a batch
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Batch whose exit tree holds the leaf
    pub batch_num: BatchNum,
    /// Exiting account
    pub account_idx: AccountIdx,
    /// Proof of the leaf against the batch exit root
    pub merkle_proof: CircomVerifierProof,
    /// Total exited in the batch
    pub balance: U256,
    /// Block where an instant withdrawal was made
    pub instant_withdrawn: Option<u64>,
    /// Block where a delayed withdrawal was requested
    pub delayed_withdraw_request: Option<u64>,
}

/// Everything a forged batch carries
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchData {
    /// Whether the batch forged an L1 user tx queue
    pub l1_batch: bool,
    /// Forged L1 user txs
    pub l1_user_txs: Vec<L1Tx>,
    /// L1 txs added by the coordinator
    pub l1_coordinator_txs: Vec<L1Tx>,
    /// L2 txs of the batch
    pub l2_txs: Vec<L2Tx>,
    /// Accounts created by the batch
    pub created_accounts: Vec<Account>,
    /// Accounts changed by the batch
    pub updated_accounts: Vec<AccountUpdate>,
    /// Exit leaves written by the batch
    pub exit_tree: Vec<ExitInfo>,
    /// Batch header
    pub batch: Batch,
}
