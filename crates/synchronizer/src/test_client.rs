//! In-memory L1 chain for tests and dev mode
//!
//! Emulates the rollup contract closely enough for the synchronizer and the
//! coordinator: the L1 user tx queues, `forgeBatch` calls, receipts and
//! reorgs. Blocks are only produced by [`TestEthClient::mine_block`].

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use alloy_primitives::{B256, U256};
use async_trait::async_trait;
use parking_lot::Mutex;
use sybil_core::constants::MAX_L1_USER_TX;
use sybil_core::{
    keccak256, BatchNum, Block, EthAddr, L1Tx, RollupConstants, RollupEventForgeBatch,
    RollupEventInitialize, RollupEventL1UserTx, RollupEventSafeMode,
    RollupEventUpdateForgeL1L2BatchTimeout, RollupEventWithdraw, RollupEvents,
    RollupForgeBatchArgs,
};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::eth::{EthClient, TxReceipt};

/// Gas reported for every forge
const FORGE_GAS_USED: u64 = 300_000;

/// Contract storage that reorgs must roll back
#[derive(Clone, Debug, Default)]
struct ContractState {
    last_forged_batch: u32,
    /// Queue forged by the next L1 batch
    next_to_forge: u64,
    /// Queue receiving new L1 user txs
    filling: u64,
    /// Length of each open queue
    queues: BTreeMap<u64, u16>,
    forge_l1_l2_batch_timeout: u64,
}

#[derive(Clone, Debug)]
struct TestBlock {
    block: Block,
    events: RollupEvents,
    /// Forge txs mined in the block
    txs: Vec<B256>,
    /// Contract storage after the block
    state: ContractState,
}

#[derive(Debug)]
struct Chain {
    blocks: Vec<TestBlock>,
    /// Storage including the pending block
    pending_state: ContractState,
    pending_events: RollupEvents,
    pending_txs: Vec<B256>,
    forge_txs: HashMap<B256, (RollupForgeBatchArgs, EthAddr, U256)>,
    /// Bumped on every mined block so replaced blocks get new hashes
    salt: u64,
    nonce: u64,
    tx_counter: u64,
}

impl Chain {
    fn tip(&self) -> &TestBlock {
        // Non-empty from construction on: block 0 is never removed
        &self.blocks[self.blocks.len() - 1]
    }
}

/// In-memory [`EthClient`]
#[derive(Debug)]
pub struct TestEthClient {
    chain: Mutex<Chain>,
    constants: RollupConstants,
    init: RollupEventInitialize,
    chain_id: u64,
    address: EthAddr,
    gas_price: U256,
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}

fn block_hash(num: u64, parent: &B256, salt: u64) -> B256 {
    let mut b = Vec::with_capacity(48);
    b.extend_from_slice(&num.to_be_bytes());
    b.extend_from_slice(parent.as_slice());
    b.extend_from_slice(&salt.to_be_bytes());
    B256::from(keccak256(&b))
}

impl TestEthClient {
    /// Chain whose genesis block 0 holds the rollup `Initialize` event.
    /// `address` is the account forge txs are sent from.
    pub fn new(
        constants: RollupConstants,
        init: RollupEventInitialize,
        chain_id: u64,
        address: EthAddr,
    ) -> Self {
        let state = ContractState {
            forge_l1_l2_batch_timeout: init.forge_l1_l2_batch_timeout,
            ..Default::default()
        };
        let genesis = TestBlock {
            block: Block {
                num: 0,
                hash: block_hash(0, &B256::ZERO, 0),
                parent_hash: B256::ZERO,
                timestamp: now_secs(),
            },
            events: RollupEvents::default(),
            txs: Vec::new(),
            state: state.clone(),
        };
        let chain = Chain {
            blocks: vec![genesis],
            pending_state: state,
            pending_events: RollupEvents::default(),
            pending_txs: Vec::new(),
            forge_txs: HashMap::new(),
            salt: 1,
            nonce: 0,
            tx_counter: 0,
        };
        Self {
            chain: Mutex::new(chain),
            constants,
            init,
            chain_id,
            address,
            gas_price: U256::from(1_000_000_000u64),
        }
    }

    /// Queue an L1 user tx in the filling queue of the pending block.
    /// Returns the tx as the contract logs it.
    pub fn add_l1_user_tx(&self, mut tx: L1Tx) -> Result<L1Tx> {
        let mut chain = self.chain.lock();
        let state = &mut chain.pending_state;
        let filled = state.queues.get(&state.filling).copied().unwrap_or_default();
        if filled as usize >= MAX_L1_USER_TX {
            state.filling += 1;
        }
        let queue = state.filling;
        let len = state.queues.entry(queue).or_default();
        tx.to_forge_l1_txs_num = Some(queue);
        tx.position = *len;
        tx.user_origin = true;
        *len += 1;

        chain.tx_counter += 1;
        let seed = [b"l1tx".as_slice(), &chain.tx_counter.to_be_bytes()].concat();
        tx.eth_tx_hash = B256::from(keccak256(&seed));
        let tx = L1Tx::new(tx)?;
        chain.pending_events.l1_user_tx.push(RollupEventL1UserTx { l1_user_tx: tx.clone() });
        Ok(tx)
    }

    /// Forge a batch from `forger` in the pending block
    pub fn forge(&self, args: RollupForgeBatchArgs, forger: EthAddr) -> Result<B256> {
        let mut chain = self.chain.lock();
        let state = &mut chain.pending_state;
        let mut l1_user_txs_len = 0;
        if args.l1_batch {
            let queue = state.next_to_forge;
            l1_user_txs_len = state.queues.remove(&queue).unwrap_or_default();
            state.next_to_forge += 1;
            if state.filling < state.next_to_forge {
                state.filling = state.next_to_forge;
            }
        }
        state.last_forged_batch += 1;
        let batch_num = BatchNum(state.last_forged_batch);

        chain.tx_counter += 1;
        let seed = [b"forge".as_slice(), &chain.tx_counter.to_be_bytes()].concat();
        let tx_hash = B256::from(keccak256(&seed));
        chain.pending_events.forge_batch.push(RollupEventForgeBatch {
            batch_num,
            eth_tx_hash: tx_hash,
            l1_user_txs_len,
            gas_used: FORGE_GAS_USED,
            gas_price: self.gas_price,
        });
        chain.pending_txs.push(tx_hash);
        chain.forge_txs.insert(tx_hash, (args, forger, self.gas_price));
        debug!("test chain: forge batch {batch_num} in tx {tx_hash}");
        Ok(tx_hash)
    }

    /// Log a withdrawal in the pending block
    pub fn withdraw(&self, evt: RollupEventWithdraw) {
        self.chain.lock().pending_events.withdraw.push(evt);
    }

    /// Change the L1 batch timeout in the pending block
    pub fn update_forge_l1_l2_batch_timeout(&self, timeout: u64) {
        let mut chain = self.chain.lock();
        chain.pending_state.forge_l1_l2_batch_timeout = timeout;
        chain
            .pending_events
            .update_forge_l1_l2_batch_timeout
            .push(RollupEventUpdateForgeL1L2BatchTimeout {
                new_forge_l1_l2_batch_timeout: timeout,
            });
    }

    /// Enter safe mode in the pending block
    pub fn safe_mode(&self) {
        self.chain.lock().pending_events.safe_mode.push(RollupEventSafeMode);
    }

    /// Seal the pending block
    pub fn mine_block(&self) -> Block {
        let mut chain = self.chain.lock();
        let parent = chain.tip().block.clone();
        let num = parent.num + 1;
        let salt = chain.salt;
        chain.salt += 1;
        let block = Block {
            num,
            hash: block_hash(num, &parent.hash, salt),
            parent_hash: parent.hash,
            timestamp: parent.timestamp.max(now_secs()) + 1,
        };
        let events = std::mem::take(&mut chain.pending_events);
        let txs = std::mem::take(&mut chain.pending_txs);
        let state = chain.pending_state.clone();
        chain.blocks.push(TestBlock { block: block.clone(), events, txs, state });
        block
    }

    /// Mine `n` blocks, returning the last one
    pub fn mine_blocks(&self, n: u64) -> Option<Block> {
        (0..n).map(|_| self.mine_block()).last()
    }

    /// Drop every block above `num` together with the pending block.
    /// Blocks mined afterwards get hashes different from the dropped ones.
    pub fn reorg(&self, num: u64) {
        let mut chain = self.chain.lock();
        let keep = usize::try_from(num).map_or(usize::MAX, |n| n.saturating_add(1)).max(1);
        chain.blocks.truncate(keep);
        chain.pending_state = chain.tip().state.clone();
        chain.pending_events = RollupEvents::default();
        chain.pending_txs.clear();
        debug!("test chain: reorg to block {}", chain.tip().block.num);
    }

    /// Number of the latest block
    pub fn last_block_num(&self) -> u64 {
        self.chain.lock().tip().block.num
    }
}

#[async_trait]
impl EthClient for TestEthClient {
    async fn eth_last_block(&self) -> Result<u64> {
        Ok(self.last_block_num())
    }

    async fn eth_block_by_number(&self, num: Option<u64>) -> Result<Option<Block>> {
        let chain = self.chain.lock();
        let block = match num {
            None => Some(chain.tip()),
            Some(n) => usize::try_from(n).ok().and_then(|i| chain.blocks.get(i)),
        };
        Ok(block.map(|b| b.block.clone()))
    }

    async fn eth_chain_id(&self) -> Result<u64> {
        Ok(self.chain_id)
    }

    async fn rollup_constants(&self) -> Result<RollupConstants> {
        Ok(self.constants.clone())
    }

    async fn rollup_events_by_block(&self, num: u64, hash: B256) -> Result<Option<RollupEvents>> {
        let chain = self.chain.lock();
        let block = usize::try_from(num)
            .ok()
            .and_then(|i| chain.blocks.get(i))
            .ok_or(SyncError::UnknownBlock)?;
        if block.block.hash != hash {
            return Err(SyncError::BlockHashMismatch { num });
        }
        if block.events == RollupEvents::default() {
            return Ok(None);
        }
        Ok(Some(block.events.clone()))
    }

    async fn rollup_forge_batch_args(
        &self,
        tx_hash: B256,
        _l1_user_txs_len: u16,
    ) -> Result<(RollupForgeBatchArgs, EthAddr)> {
        let chain = self.chain.lock();
        let (args, sender, _) = chain
            .forge_txs
            .get(&tx_hash)
            .ok_or_else(|| SyncError::Rpc(format!("tx {tx_hash} not found")))?;
        Ok((args.clone(), *sender))
    }

    async fn rollup_event_init(&self, _genesis: u64) -> Result<(RollupEventInitialize, u64)> {
        Ok((self.init.clone(), 0))
    }

    async fn rollup_last_forged_batch(&self) -> Result<BatchNum> {
        Ok(BatchNum(self.chain.lock().tip().state.last_forged_batch))
    }

    async fn rollup_forge_batch(
        &self,
        args: &RollupForgeBatchArgs,
        nonce: u64,
        gas_price: U256,
    ) -> Result<B256> {
        {
            let mut chain = self.chain.lock();
            if nonce < chain.nonce {
                return Err(SyncError::Rpc(format!("nonce too low: {nonce} < {}", chain.nonce)));
            }
            chain.nonce = nonce + 1;
        }
        let tx_hash = self.forge(args.clone(), self.address)?;
        if let Some(entry) = self.chain.lock().forge_txs.get_mut(&tx_hash) {
            entry.2 = gas_price;
        }
        Ok(tx_hash)
    }

    async fn eth_transaction_receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>> {
        let chain = self.chain.lock();
        let receipt = chain.blocks.iter().find(|b| b.txs.contains(&tx_hash)).map(|b| TxReceipt {
            tx_hash,
            block_num: b.block.num,
            status: true,
            gas_used: FORGE_GAS_USED,
        });
        Ok(receipt)
    }

    async fn eth_pending_nonce(&self) -> Result<u64> {
        Ok(self.chain.lock().nonce)
    }

    async fn eth_suggest_gas_price(&self) -> Result<U256> {
        Ok(self.gas_price)
    }

    fn address(&self) -> EthAddr {
        self.address
    }
}
