//! Batch processor
//!
//! Applies L1 user txs, then L1 coordinator txs, then L2 txs to a
//! [`StateDb`]. What is produced besides the state change depends on the
//! mode of the database:
//!
//! | Mode | Exit tree | Witness | Exit infos and account changes |
//! |---|---|---|---|
//! | Synchronizer | yes | no | yes |
//! | BatchBuilder | yes | yes | no |
//! | TxSelector | no | no | no |

use std::collections::BTreeMap;
use std::env;

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use sybil_core::constants::{MAX_L1_TX, NLEVELS, VOUCH_NLEVELS};
use sybil_core::types::bjj_sign_ay;
use sybil_core::zk::bits_le;
use sybil_core::{
    Account, AccountIdx, BatchNum, EthAddr, ExitInfo, Float40, L1Tx, Nonce, PoolL2Tx, Score,
    TxType, Vouch, VouchIdx, ZKInputs, EMPTY_BJJ,
};
use sybil_db::{DbError, StateDb, StateDbMode};
use sybil_smt::{CircomProcessorProof, MerkleTree, SledStorage};
use tracing::debug;

use crate::error::{ProcessError, Result};

/// Processor configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxProcessorConfig {
    /// Levels of the Account, Score and Exit trees
    pub n_levels: usize,
    /// Tx slots of a batch
    pub max_tx: usize,
    /// L1 tx slots of a batch
    pub max_l1_tx: usize,
    /// Chain id mixed into every compressed tx
    pub chain_id: u16,
}

impl Default for TxProcessorConfig {
    fn default() -> Self {
        Self { n_levels: NLEVELS as usize, max_tx: 512, max_l1_tx: MAX_L1_TX, chain_id: 0 }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl TxProcessorConfig {
    /// Load from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            n_levels: env_or("SYBIL_NLEVELS", default.n_levels),
            max_tx: env_or("SYBIL_MAX_TX", default.max_tx),
            max_l1_tx: env_or("SYBIL_MAX_L1_TX", default.max_l1_tx),
            chain_id: env_or("SYBIL_CHAIN_ID", default.chain_id),
        }
    }
}

/// Result of [`TxProcessor::process_txs`]
#[derive(Clone, Debug, Default)]
pub struct ProcessTxOutput {
    /// Witness of the batch, BatchBuilder mode only
    pub zk_inputs: Option<ZKInputs>,
    /// One entry per exit leaf touched by the batch, in first-touch order.
    /// Synchronizer mode only.
    pub exit_infos: Option<Vec<ExitInfo>>,
    /// Accounts created by the batch. Synchronizer mode only.
    pub created_accounts: Option<Vec<Account>>,
    /// Final value of every pre-existing account the batch changed.
    /// Synchronizer mode only.
    pub updated_accounts: Option<BTreeMap<AccountIdx, Account>>,
    /// Root of the batch exit tree, zero without one
    pub exit_root: U256,
}

/// Exit leaves of the batch being processed
struct ExitTree {
    tree: MerkleTree<SledStorage>,
    /// Current leaves, in first-touch order
    leaves: Vec<Account>,
}

impl ExitTree {
    fn new(n_levels: usize) -> Result<Self> {
        Ok(Self { tree: MerkleTree::new(SledStorage::temporary()?, n_levels)?, leaves: Vec::new() })
    }

    fn root(&self) -> U256 {
        self.tree.root()
    }

    /// Add `amount` to the exit leaf of `account`, creating it if needed.
    /// Returns the leaf before the change, the tree proof and whether the
    /// leaf is new.
    fn credit(
        &mut self,
        account: &Account,
        amount: U256,
    ) -> Result<(Account, CircomProcessorProof, bool)> {
        let key = account.idx.to_u256();
        match self.leaves.iter_mut().find(|l| l.idx == account.idx) {
            Some(leaf) => {
                let pre = leaf.clone();
                leaf.balance = leaf
                    .balance
                    .checked_add(amount)
                    .ok_or(sybil_core::Error::NumOverflow("exit balance"))?;
                let proof = self.tree.update(key, leaf.hash_value()?)?;
                Ok((pre, proof, false))
            }
            None => {
                let leaf = Account {
                    idx: account.idx,
                    eth_addr: account.eth_addr,
                    bjj: account.bjj,
                    nonce: Nonce(0),
                    balance: amount,
                    batch_num: BatchNum::default(),
                };
                let proof = self.tree.add(key, leaf.hash_value()?)?;
                let pre = Account { balance: U256::ZERO, ..leaf.clone() };
                self.leaves.push(leaf);
                Ok((pre, proof, true))
            }
        }
    }

    fn exit_infos(&self, batch_num: BatchNum) -> Result<Vec<ExitInfo>> {
        self.leaves
            .iter()
            .map(|leaf| {
                Ok(ExitInfo {
                    batch_num,
                    account_idx: leaf.idx,
                    merkle_proof: self.tree.generate_circom_verifier_proof(leaf.idx.to_u256())?,
                    balance: leaf.balance,
                    ..Default::default()
                })
            })
            .collect()
    }
}

fn addr_to_u256(addr: &EthAddr) -> U256 {
    U256::from_be_slice(addr.as_slice())
}

/// Packed Float40 of `amount` as a field element
fn float40_field(amount: U256) -> Result<U256> {
    Ok(U256::from(Float40::from_u256(amount)?.0))
}

fn is_account_not_found(e: &DbError) -> bool {
    matches!(e.core(), Some(sybil_core::Error::AccountNotFound(_)))
}

fn set_state1(zki: &mut ZKInputs, i: usize, account: &Account) {
    let (sign, ay) = bjj_sign_ay(&account.bjj);
    zki.nonce1[i] = account.nonce.0;
    zki.sign1[i] = sign;
    zki.ay1[i] = ay;
    zki.balance1[i] = account.balance;
    zki.eth_addr1[i] = addr_to_u256(&account.eth_addr);
}

fn set_proof1(zki: &mut ZKInputs, i: usize, p: &CircomProcessorProof) {
    zki.siblings1[i].clone_from(&p.siblings);
    zki.is_old0_1[i] = p.is_old0;
    zki.old_key1[i] = p.old_key;
    zki.old_value1[i] = p.old_value;
}

fn set_state2(zki: &mut ZKInputs, i: usize, account: &Account) {
    let (sign, ay) = bjj_sign_ay(&account.bjj);
    zki.nonce2[i] = account.nonce.0;
    zki.sign2[i] = sign;
    zki.ay2[i] = ay;
    zki.balance2[i] = account.balance;
    zki.eth_addr2[i] = addr_to_u256(&account.eth_addr);
}

fn set_proof2(zki: &mut ZKInputs, i: usize, p: &CircomProcessorProof) {
    zki.siblings2[i].clone_from(&p.siblings);
    zki.is_old0_2[i] = p.is_old0;
    zki.old_key2[i] = p.old_key;
    zki.old_value2[i] = p.old_value;
}

/// Applies txs to a state database
pub struct TxProcessor<'a> {
    state: &'a mut StateDb,
    config: TxProcessorConfig,
    zki: Option<ZKInputs>,
    /// Slot of the tx being processed
    i: usize,
    created: Vec<Account>,
    updated: BTreeMap<AccountIdx, Account>,
}

impl<'a> TxProcessor<'a> {
    /// Processor writing to `state`
    pub fn new(state: &'a mut StateDb, config: TxProcessorConfig) -> Self {
        Self { state, config, zki: None, i: 0, created: Vec::new(), updated: BTreeMap::new() }
    }

    /// Configuration in use
    pub const fn config(&self) -> &TxProcessorConfig {
        &self.config
    }

    /// Apply a whole batch and checkpoint the state.
    ///
    /// `coord_idxs` are the accounts of the coordinator; they must exist once
    /// the L1 txs are applied. Effective amounts and resolved indices are
    /// written back into the L1 txs, and Synchronizer mode fills the nonce of
    /// the L2 txs, which the data-availability encoding does not carry.
    ///
    /// Nothing is checkpointed when an error is returned; the caller is
    /// expected to reset the state to its last batch.
    pub fn process_txs(
        &mut self,
        coord_idxs: &[AccountIdx],
        l1_user_txs: &mut [L1Tx],
        l1_coordinator_txs: &mut [L1Tx],
        l2_txs: &mut [PoolL2Tx],
    ) -> Result<ProcessTxOutput> {
        let n_l1 = l1_user_txs.len() + l1_coordinator_txs.len();
        if n_l1 > self.config.max_l1_tx {
            return Err(ProcessError::MaxL1TxExceeded { got: n_l1, max: self.config.max_l1_tx });
        }
        let total = n_l1 + l2_txs.len();
        if total > self.config.max_tx {
            return Err(ProcessError::MaxTxExceeded { got: total, max: self.config.max_tx });
        }

        let mode = self.state.mode();
        let batch_num = self.state.current_batch().next()?;
        self.i = 0;
        self.created.clear();
        self.updated.clear();
        self.zki = None;

        if mode == StateDbMode::BatchBuilder {
            let mut zki = ZKInputs::new(
                self.config.chain_id,
                self.config.max_tx,
                self.config.max_l1_tx,
                self.config.n_levels,
                VOUCH_NLEVELS as usize,
                batch_num,
            );
            zki.old_last_idx = self.state.current_account_idx().0;
            zki.old_account_root = self.state.account_root();
            zki.old_vouch_root = self.state.vouch_root();
            zki.old_score_root = self.state.score_root();
            self.zki = Some(zki);
        }
        let mut exits =
            if mode.has_trees() { Some(ExitTree::new(self.config.n_levels)?) } else { None };

        for tx in l1_user_txs.iter_mut().chain(l1_coordinator_txs.iter_mut()) {
            self.process_l1_tx(exits.as_mut(), tx)?;
            self.i += 1;
        }

        if mode.has_trees() {
            for idx in coord_idxs {
                self.state.get_account(*idx)?;
            }
        }

        for tx in l2_txs.iter_mut() {
            self.process_l2_tx(exits.as_mut(), tx)?;
            self.i += 1;
        }

        let exit_root = exits.as_ref().map_or(U256::ZERO, ExitTree::root);
        let exit_infos = match (&exits, mode) {
            (Some(e), StateDbMode::Synchronizer) => Some(e.exit_infos(batch_num)?),
            _ => None,
        };
        drop(exits);

        self.state.make_checkpoint()?;
        debug!(batch_num = %batch_num, txs = total, mode = ?mode, "processed batch");

        let mut zk_inputs = self.zki.take();
        if let Some(zki) = zk_inputs.as_mut() {
            zki.metadata.new_last_idx_raw = self.state.current_account_idx().0;
            zki.metadata.new_state_root_raw = self.state.account_root();
            zki.metadata.new_exit_root_raw = exit_root;
            zki.metadata.l1_txs_data_availability = l1_user_txs
                .iter()
                .chain(l1_coordinator_txs.iter())
                .map(|tx| tx.bytes_data_availability().map(|b| b.to_vec()))
                .collect::<sybil_core::Result<_>>()?;
            zki.metadata.l2_txs_data = l2_txs
                .iter()
                .map(|tx| tx.to_l2_tx().bytes_data_availability().map(|b| b.to_vec()))
                .collect::<sybil_core::Result<_>>()?;
        }

        let (created_accounts, updated_accounts) = if mode == StateDbMode::Synchronizer {
            (Some(std::mem::take(&mut self.created)), Some(std::mem::take(&mut self.updated)))
        } else {
            (None, None)
        };
        Ok(ProcessTxOutput { zk_inputs, exit_infos, created_accounts, updated_accounts, exit_root })
    }

    /// Apply a single L1 tx without witness nor exit tree, leaving the
    /// checkpoint to the caller
    pub fn apply_l1_tx(&mut self, tx: &mut L1Tx) -> Result<()> {
        self.zki = None;
        self.process_l1_tx(None, tx)
    }

    /// Apply a single L2 tx without witness nor exit tree, leaving the
    /// checkpoint to the caller. A rejected tx leaves the state untouched.
    pub fn apply_l2_tx(&mut self, tx: &mut PoolL2Tx) -> Result<()> {
        self.zki = None;
        self.process_l2_tx(None, tx)
    }

    fn process_l1_tx(&mut self, mut exits: Option<&mut ExitTree>, tx: &mut L1Tx) -> Result<()> {
        let kind = tx.kind()?;
        if let Some(zki) = self.zki.as_mut() {
            let i = self.i;
            zki.tx_compressed_data[i] = tx.tx_compressed_data(self.config.chain_id)?;
            zki.from_idx[i] = tx.from_idx.0;
            zki.to_idx[i] = tx.to_idx.0;
            zki.on_chain[i] = !kind.is_vouch();
            zki.deposit_amount_f[i] = float40_field(tx.deposit_amount)?;
            zki.from_eth_addr[i] = addr_to_u256(&tx.from_eth_addr);
            if tx.from_bjj != EMPTY_BJJ {
                zki.from_bjj_compressed[i] = bits_le(&tx.from_bjj);
            }
            if kind == TxType::ForceExit || kind.is_vouch() {
                zki.amount_f[i] = float40_field(tx.amount)?;
            }
        }

        match kind {
            TxType::CreateAccountDeposit => {
                tx.effective_amount = tx.amount;
                tx.effective_deposit_amount = tx.deposit_amount;
                tx.effective_from_idx = self.apply_create_account(tx)?;
            }
            TxType::Deposit => {
                tx.effective_from_idx = tx.from_idx;
                if let Some(account) = self.compute_effective_amounts(tx)? {
                    self.apply_deposit(tx, account)?;
                }
            }
            TxType::ForceExit => {
                tx.effective_from_idx = tx.from_idx;
                if self.compute_effective_amounts(tx)?.is_some() {
                    let amounts = (tx.effective_amount, tx.amount);
                    self.apply_exit(exits.as_deref_mut(), tx.from_idx, amounts, true)?;
                }
            }
            TxType::CreateVouch | TxType::DeleteVouch => {
                tx.effective_amount = tx.amount;
                tx.effective_deposit_amount = tx.deposit_amount;
                tx.effective_from_idx = tx.from_idx;
                self.apply_vouch(tx.from_idx, tx.to_idx, kind)?;
            }
            TxType::Exit | TxType::Transfer | TxType::TransferToEthAddr => {
                let reason = format!("{kind} is not an L1 type");
                return Err(sybil_core::Error::InvalidTxType(reason).into());
            }
        }
        self.record_intermediate(exits.as_deref(), true);
        Ok(())
    }

    fn process_l2_tx(&mut self, mut exits: Option<&mut ExitTree>, tx: &mut PoolL2Tx) -> Result<()> {
        let kind = tx.to_l2_tx().kind()?;
        if kind != TxType::Exit && !kind.is_vouch() {
            return Err(sybil_core::Error::InvalidTxType(format!("{kind} is not supported")).into());
        }

        let account = self.state.get_account(tx.from_idx)?;
        if self.state.mode() == StateDbMode::Synchronizer {
            tx.nonce = account.nonce;
        } else if tx.nonce != account.nonce {
            return Err(sybil_core::Error::InvalidNonce {
                idx: tx.from_idx.0,
                tx_nonce: tx.nonce.0,
                account_nonce: account.nonce.0,
            }
            .into());
        }

        if let Some(zki) = self.zki.as_mut() {
            let i = self.i;
            zki.tx_compressed_data[i] = tx.to_l2_tx().tx_compressed_data(self.config.chain_id)?;
            zki.from_idx[i] = tx.from_idx.0;
            zki.to_idx[i] = tx.to_idx.0;
            zki.amount_f[i] = float40_field(tx.amount)?;
            zki.max_num_batch[i] = tx.max_num_batch;
            zki.to_eth_addr[i] = addr_to_u256(&tx.to_eth_addr);
            if tx.to_bjj != EMPTY_BJJ {
                zki.to_bjj_ay[i] = bjj_sign_ay(&tx.to_bjj).1;
            }
            let (s, r8y) = tx.signature.components();
            zki.s[i] = s;
            zki.r8y[i] = r8y;
        }

        match kind {
            TxType::Exit => {
                self.apply_exit(exits.as_deref_mut(), tx.from_idx, (tx.amount, tx.amount), false)?;
            }
            _ => self.apply_vouch(tx.from_idx, tx.to_idx, kind)?,
        }
        self.record_intermediate(exits.as_deref(), false);
        Ok(())
    }

    /// Fill the effective amounts of a Deposit or ForceExit and return the
    /// sender, `None` when it does not exist
    fn compute_effective_amounts(&self, tx: &mut L1Tx) -> Result<Option<Account>> {
        tx.effective_amount = tx.amount;
        tx.effective_deposit_amount = tx.deposit_amount;
        let account = match self.state.get_account(tx.from_idx) {
            Ok(a) => a,
            Err(e) if is_account_not_found(&e) => {
                debug!("L1 tx from missing account {}, amounts set to 0", tx.from_idx);
                tx.effective_amount = U256::ZERO;
                tx.effective_deposit_amount = U256::ZERO;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if account.balance.saturating_add(tx.effective_deposit_amount) < tx.amount {
            debug!("L1 tx from {}: not enough balance, amount set to 0", tx.from_idx);
            tx.effective_amount = U256::ZERO;
        } else if account.eth_addr != tx.from_eth_addr {
            debug!("L1 tx from {}: sender is not the owner, amount set to 0", tx.from_idx);
            tx.effective_amount = U256::ZERO;
        }
        Ok(Some(account))
    }

    /// Store an updated sender, filling the state-1 proof and the account
    /// changes
    fn store_sender(&mut self, account: &Account) -> Result<()> {
        let proof = self.state.update_account(account.idx, account)?;
        if let (Some(zki), Some(p)) = (self.zki.as_mut(), proof.as_ref()) {
            set_proof1(zki, self.i, p);
        }
        if self.state.mode() == StateDbMode::Synchronizer {
            self.updated.insert(account.idx, account.clone());
        }
        Ok(())
    }

    fn apply_create_account(&mut self, tx: &L1Tx) -> Result<AccountIdx> {
        let idx = self.state.current_account_idx().next()?;
        let account = Account {
            idx,
            eth_addr: tx.from_eth_addr,
            bjj: tx.from_bjj,
            nonce: Nonce(0),
            balance: tx.effective_deposit_amount,
            batch_num: self.state.current_batch().next()?,
        };
        let proof = self.state.create_account(idx, &account)?;
        if let Some(zki) = self.zki.as_mut() {
            let i = self.i;
            zki.aux_from_idx[i] = idx.0;
            zki.new_account[i] = true;
            set_state1(zki, i, &account);
            if let Some(p) = proof.as_ref() {
                set_proof1(zki, i, p);
            }
        }
        self.state.set_idx_by_eth_addr_bjj(idx, &account.eth_addr, &account.bjj)?;
        self.state.set_current_account_idx(idx)?;
        if self.state.mode() == StateDbMode::Synchronizer {
            self.created.push(account);
        }
        Ok(idx)
    }

    fn apply_deposit(&mut self, tx: &L1Tx, mut account: Account) -> Result<()> {
        if let Some(zki) = self.zki.as_mut() {
            set_state1(zki, self.i, &account);
        }
        let credited = account
            .balance
            .checked_add(tx.effective_deposit_amount)
            .ok_or(sybil_core::Error::NumOverflow("balance"))?;
        account.balance = credited
            .checked_sub(tx.effective_amount)
            .ok_or(sybil_core::Error::NotEnoughBalance { idx: account.idx.0 })?;
        self.store_sender(&account)
    }

    /// Debit `amount` from the sender and credit it to its exit leaf.
    /// `requested` is the tx amount before balance checks: a leaf is
    /// written whenever it is nonzero, even when nothing is credited.
    fn apply_exit(
        &mut self,
        exits: Option<&mut ExitTree>,
        from: AccountIdx,
        (amount, requested): (U256, U256),
        l1: bool,
    ) -> Result<()> {
        let mut account = self.state.get_account(from)?;
        if let Some(zki) = self.zki.as_mut() {
            set_state1(zki, self.i, &account);
        }
        if !l1 {
            account.nonce = account.nonce.checked_inc()?;
        }
        account.balance = account
            .balance
            .checked_sub(amount)
            .ok_or(sybil_core::Error::NotEnoughBalance { idx: from.0 })?;
        self.store_sender(&account)?;

        let Some(exits) = exits else { return Ok(()) };
        if requested.is_zero() {
            return Ok(());
        }
        let (pre, proof, new_exit) = exits.credit(&account, amount)?;
        if let Some(zki) = self.zki.as_mut() {
            set_state2(zki, self.i, &pre);
            set_proof2(zki, self.i, &proof);
        }
        debug!("exit of {amount} from {from}, new leaf: {new_exit}");
        Ok(())
    }

    fn apply_vouch(&mut self, from: AccountIdx, to: AccountIdx, kind: TxType) -> Result<()> {
        let mut sender = self.state.get_account(from)?;
        let receiver = self.state.get_account(to)?;
        let idx = VouchIdx::new(from, to);
        let previous = match self.state.get_vouch(idx) {
            Ok(v) => Some(v),
            Err(e) if matches!(e.core(), Some(sybil_core::Error::VouchNotFound(_))) => None,
            Err(e) => return Err(e.into()),
        };
        let was_active = previous.is_some_and(|v| v.value);
        let value = kind == TxType::CreateVouch;
        let batch_num = self.state.current_batch().next()?;

        if let Some(zki) = self.zki.as_mut() {
            set_state1(zki, self.i, &sender);
            set_state2(zki, self.i, &receiver);
            zki.vouch_exists[self.i] = was_active;
        }
        sender.nonce = sender.nonce.checked_inc()?;
        self.store_sender(&sender)?;
        if self.zki.is_some() {
            let membership = self.state.account_membership_proof(to)?;
            if let Some(zki) = self.zki.as_mut() {
                zki.siblings2[self.i] = membership.siblings;
            }
        }

        let proof = self.state.insert_or_update_vouch(&Vouch { idx, value, batch_num })?;
        if previous.is_none() {
            self.state.set_current_vouch_idx(idx)?;
        }
        if let (Some(zki), Some(p)) = (self.zki.as_mut(), proof) {
            zki.vouch_siblings[self.i] = p.siblings;
        }

        // the sender leaf exists after its first vouch, even at 0
        let sender_score = self.state.score_or_zero(from)?;
        let proof = self.state.insert_or_update_score(&Score {
            idx: from,
            value: sender_score,
            batch_num,
        })?;
        if let Some(zki) = self.zki.as_mut() {
            zki.score1[self.i] = sender_score;
            if let Some(p) = proof {
                zki.score_siblings1[self.i] = p.siblings;
            }
        }

        // receiver moves only when the vouch flips
        let receiver_score = self.state.score_or_zero(to)?;
        let new_score = match (value, was_active) {
            (true, false) => receiver_score.checked_add(1).ok_or(sybil_core::Error::ScoreOverflow)?,
            (false, true) => receiver_score.saturating_sub(1),
            _ => receiver_score,
        };
        let proof =
            self.state.insert_or_update_score(&Score { idx: to, value: new_score, batch_num })?;
        if let Some(zki) = self.zki.as_mut() {
            zki.score2[self.i] = receiver_score;
            if let Some(p) = proof {
                zki.score_siblings2[self.i] = p.siblings;
            }
        }
        Ok(())
    }

    fn record_intermediate(&mut self, exits: Option<&ExitTree>, on_chain: bool) {
        let Some(len) = self.zki.as_ref().map(|z| z.is_on_chain.len()) else { return };
        let i = self.i;
        if i >= len {
            return;
        }
        let out_idx = self.state.current_account_idx().0;
        let account_root = self.state.account_root();
        let vouch_root = self.state.vouch_root();
        let score_root = self.state.score_root();
        let exit_root = exits.map_or(U256::ZERO, ExitTree::root);
        if let Some(zki) = self.zki.as_mut() {
            zki.is_on_chain[i] = on_chain;
            zki.is_out_idx[i] = out_idx;
            zki.is_state_root_account[i] = account_root;
            zki.is_state_root_vouch[i] = vouch_root;
            zki.is_state_root_score[i] = score_root;
            zki.is_exit_root[i] = exit_root;
        }
    }
}
