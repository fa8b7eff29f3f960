//! In-memory pool of L2 txs

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use sybil_core::{AccountIdx, BatchNum, Nonce, PoolL2Tx, PoolL2TxState, TxId};
use tracing::debug;

use crate::error::{CoordError, Result};

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or_default()
}

/// Pool of L2 txs waiting to be forged.
///
/// Forging and forged txs carry the batch that took them, invalid ones the
/// batch at which they were rejected, which is what purging measures the
/// safety period against.
#[derive(Debug, Default)]
pub struct L2Db {
    txs: RwLock<BTreeMap<TxId, PoolL2Tx>>,
}

impl L2Db {
    /// Empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tx in the `Pending` state, filling its type and id
    pub fn add_tx(&self, tx: PoolL2Tx) -> Result<TxId> {
        let mut tx = PoolL2Tx::new(tx)?;
        tx.state = PoolL2TxState::Pending;
        tx.batch_num = None;
        tx.info = None;
        if tx.timestamp == 0 {
            tx.timestamp = now_millis();
        }
        let id = tx.tx_id;
        let mut txs = self.txs.write();
        if txs.contains_key(&id) {
            return Err(CoordError::DuplicateTx(id));
        }
        txs.insert(id, tx);
        Ok(id)
    }

    /// Tx `id`, in any state
    pub fn get_tx(&self, id: &TxId) -> Option<PoolL2Tx> {
        self.txs.read().get(id).cloned()
    }

    /// Txs in the pool
    pub fn len(&self) -> usize {
        self.txs.read().len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.txs.read().is_empty()
    }

    /// Pending txs ordered by sender, then nonce
    pub fn pending_txs(&self) -> Vec<PoolL2Tx> {
        let mut txs: Vec<PoolL2Tx> = self
            .txs
            .read()
            .values()
            .filter(|tx| tx.state == PoolL2TxState::Pending)
            .cloned()
            .collect();
        txs.sort_by_key(|tx| (tx.from_idx, tx.nonce, tx.timestamp));
        txs
    }

    fn set_state(&self, ids: &[TxId], state: PoolL2TxState, batch_num: Option<BatchNum>) {
        let mut txs = self.txs.write();
        for id in ids {
            if let Some(tx) = txs.get_mut(id) {
                tx.state = state;
                tx.batch_num = batch_num;
            }
        }
    }

    /// Mark txs selected for `batch_num`
    pub fn start_forging(&self, ids: &[TxId], batch_num: BatchNum) {
        self.set_state(ids, PoolL2TxState::Forging, Some(batch_num));
    }

    /// Mark txs included in the mined batch `batch_num`
    pub fn done_forging(&self, ids: &[TxId], batch_num: BatchNum) {
        self.set_state(ids, PoolL2TxState::Forged, Some(batch_num));
    }

    /// Mark txs invalid as of `batch_num`
    pub fn invalidate_txs(&self, ids: &[TxId], batch_num: BatchNum) {
        self.set_state(ids, PoolL2TxState::Invalid, Some(batch_num));
    }

    /// Record why txs were left out of a selection
    pub fn update_txs_info(&self, infos: &[(TxId, String)]) {
        let mut txs = self.txs.write();
        for (id, info) in infos {
            if let Some(tx) = txs.get_mut(id) {
                tx.info = Some(info.clone());
            }
        }
    }

    /// Invalidate the pending txs whose nonce is below the current nonce of
    /// their sender. `nonce_of` returns `None` for unknown accounts, whose
    /// txs are left alone. Returns the number of txs invalidated.
    pub fn invalidate_old_nonces(
        &self,
        mut nonce_of: impl FnMut(AccountIdx) -> Option<Nonce>,
        batch_num: BatchNum,
    ) -> usize {
        let mut txs = self.txs.write();
        let mut n = 0;
        for tx in txs.values_mut().filter(|tx| tx.state == PoolL2TxState::Pending) {
            if nonce_of(tx.from_idx).is_some_and(|nonce| tx.nonce < nonce) {
                tx.state = PoolL2TxState::Invalid;
                tx.batch_num = Some(batch_num);
                tx.info = Some("nonce already used".to_string());
                n += 1;
            }
        }
        n
    }

    /// Return to `Pending` every tx taken by a batch after
    /// `last_valid_batch`
    pub fn reorg(&self, last_valid_batch: BatchNum) {
        let mut txs = self.txs.write();
        let mut n = 0;
        for tx in txs.values_mut() {
            let taken = matches!(tx.state, PoolL2TxState::Forging | PoolL2TxState::Forged);
            if taken && tx.batch_num.is_some_and(|b| b > last_valid_batch) {
                tx.state = PoolL2TxState::Pending;
                tx.batch_num = None;
                n += 1;
            }
        }
        debug!("l2db reorg to batch {last_valid_batch}: {n} txs back to pending");
    }

    /// Delete forged and invalid txs older than `safety_period` batches, and
    /// pending txs whose `max_num_batch` has passed. Returns the number of
    /// txs deleted.
    pub fn purge(&self, current_batch: BatchNum, safety_period: u32) -> usize {
        let mut txs = self.txs.write();
        let before = txs.len();
        txs.retain(|_, tx| match tx.state {
            PoolL2TxState::Forged | PoolL2TxState::Invalid => {
                tx.batch_num.map_or(true, |b| b.0.saturating_add(safety_period) > current_batch.0)
            }
            PoolL2TxState::Pending => tx.max_num_batch == 0 || tx.max_num_batch > current_batch.0,
            PoolL2TxState::Forging => true,
        });
        before - txs.len()
    }
}
