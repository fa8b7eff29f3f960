//! Access to the L1 chain and the rollup contract

use alloy_primitives::{B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sybil_core::{
    BatchNum, Block, EthAddr, RollupConstants, RollupEventInitialize, RollupEvents,
    RollupForgeBatchArgs,
};

use crate::error::Result;

/// Outcome of a mined Ethereum tx
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    /// Hash of the tx
    pub tx_hash: B256,
    /// Block it was mined in
    pub block_num: u64,
    /// `true` when the tx succeeded
    pub status: bool,
    /// Gas it used
    pub gas_used: u64,
}

/// Read and write access to L1.
///
/// Missing blocks, logs and receipts are reported as `Ok(None)` so callers
/// can tell "not there yet" apart from a failing node.
#[async_trait]
pub trait EthClient: Send + Sync {
    /// Number of the latest block
    async fn eth_last_block(&self) -> Result<u64>;

    /// Block by number, the latest one for `None`
    async fn eth_block_by_number(&self, num: Option<u64>) -> Result<Option<Block>>;

    /// Chain id of L1
    async fn eth_chain_id(&self) -> Result<u64>;

    /// Immutable parameters of the rollup contract
    async fn rollup_constants(&self) -> Result<RollupConstants>;

    /// Rollup events of the block `num`, which must have hash `hash`.
    /// `None` when the block has none.
    async fn rollup_events_by_block(&self, num: u64, hash: B256) -> Result<Option<RollupEvents>>;

    /// Calldata of a `forgeBatch` tx and its sender
    async fn rollup_forge_batch_args(
        &self,
        tx_hash: B256,
        l1_user_txs_len: u16,
    ) -> Result<(RollupForgeBatchArgs, EthAddr)>;

    /// `Initialize` event of the rollup and its block, searched from `genesis`
    async fn rollup_event_init(&self, genesis: u64) -> Result<(RollupEventInitialize, u64)>;

    /// Last batch accepted by the contract
    async fn rollup_last_forged_batch(&self) -> Result<BatchNum>;

    /// Send a `forgeBatch` tx from the coordinator account
    async fn rollup_forge_batch(
        &self,
        args: &RollupForgeBatchArgs,
        nonce: u64,
        gas_price: U256,
    ) -> Result<B256>;

    /// Receipt of a mined tx, `None` while pending
    async fn eth_transaction_receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>>;

    /// Next nonce of the coordinator account, counting pending txs
    async fn eth_pending_nonce(&self) -> Result<u64>;

    /// Gas price suggested by the node
    async fn eth_suggest_gas_price(&self) -> Result<U256>;

    /// Account that signs the forge txs
    fn address(&self) -> EthAddr;
}
