//! Merkle-indexed state: accounts, vouches and scores
//!
//! Leaf payloads live under plain prefixes of the KVDB `current` database,
//! while the Account, Vouch and Score trees keep their nodes under their own
//! prefixes. A [`StateDbMode::TxSelector`] database keeps only the payloads.

use std::env;
use std::path::PathBuf;

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use sybil_core::account::ACCOUNT_LEAF_BYTES;
use sybil_core::constants::{NLEVELS, VOUCH_NLEVELS};
use sybil_core::{
    Account, AccountIdx, BatchNum, BjjComp, EthAddr, Error, Score, ScoreValue, Vouch, VouchIdx,
    EMPTY_BJJ,
};
use sybil_smt::{CircomProcessorProof, CircomVerifierProof, MerkleTree, SledStorage};
use tracing::debug;

use crate::error::{DbError, Result};
use crate::kvdb::{Checkpoints, IdxKind, Kvdb, KvdbConfig, LastDb, DEFAULT_KEEP};

/// Node prefix of the Account tree
pub const PREFIX_MT_ACCOUNT: &[u8] = b"ma:";
/// Node prefix of the Vouch tree
pub const PREFIX_MT_VOUCH: &[u8] = b"mv:";
/// Node prefix of the Score tree
pub const PREFIX_MT_SCORE: &[u8] = b"ms:";
/// Account leaf hash to leaf bytes
pub const PREFIX_ACCOUNT_HASH: &[u8] = b"h:";
/// Account idx to leaf hash and creation batch
pub const PREFIX_ACCOUNT_IDX: &[u8] = b"i:";
/// EthAddr to smallest idx
pub const PREFIX_ETH_ADDR: &[u8] = b"a:";
/// (EthAddr, BJJ) to smallest idx
pub const PREFIX_ETH_ADDR_BJJ: &[u8] = b"ab:";
/// Vouch idx to vouch value
pub const PREFIX_VOUCH: &[u8] = b"v:";
/// Account idx to score
pub const PREFIX_SCORE: &[u8] = b"s:";

/// Role of a StateDB
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateDbMode {
    /// Full trees, exit tree computed while processing
    #[default]
    Synchronizer,
    /// Leaves only, used to pre-screen pool txs
    TxSelector,
    /// Full trees plus witness generation
    BatchBuilder,
}

impl StateDbMode {
    /// Whether the mode maintains Merkle trees
    pub const fn has_trees(self) -> bool {
        !matches!(self, Self::TxSelector)
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Synchronizer => "synchronizer",
            Self::TxSelector => "txselector",
            Self::BatchBuilder => "batchbuilder",
        }
    }
}

/// StateDB configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateDbConfig {
    /// Underlying store
    pub kvdb: KvdbConfig,
    /// Role
    pub mode: StateDbMode,
    /// Levels of the Account and Score trees
    pub n_levels: usize,
}

impl Default for StateDbConfig {
    fn default() -> Self {
        Self {
            kvdb: KvdbConfig::default(),
            mode: StateDbMode::Synchronizer,
            n_levels: NLEVELS as usize,
        }
    }
}

impl StateDbConfig {
    /// Load from environment variables
    pub fn from_env() -> Self {
        let kvdb = KvdbConfig {
            path: env::var("SYBIL_STATEDB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/statedb")),
            keep: env::var("SYBIL_STATEDB_KEEP")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_KEEP),
            ..KvdbConfig::default()
        };
        Self { kvdb, ..Self::default() }
    }
}

#[derive(Debug)]
struct Trees {
    account: MerkleTree<SledStorage>,
    vouch: MerkleTree<SledStorage>,
    score: MerkleTree<SledStorage>,
}

fn prefixed(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(prefix.len() + suffix.len());
    k.extend_from_slice(prefix);
    k.extend_from_slice(suffix);
    k
}

fn idx_from_stored(v: &[u8]) -> Result<AccountIdx> {
    Ok(AccountIdx::from_bytes(v)?)
}

/// Read an account from a database holding StateDB payloads
fn get_account_in(db: &sled::Db, idx: AccountIdx) -> Result<Account> {
    let entry = db
        .get(prefixed(PREFIX_ACCOUNT_IDX, &idx.to_bytes()?))?
        .ok_or(Error::AccountNotFound(idx.0))?;
    if entry.len() != 32 + 4 {
        return Err(DbError::InvalidValue("account idx entry"));
    }
    let leaf = db
        .get(prefixed(PREFIX_ACCOUNT_HASH, &entry[..32]))?
        .ok_or(DbError::InvalidValue("account payload"))?;
    if leaf.len() != ACCOUNT_LEAF_BYTES {
        return Err(DbError::InvalidValue("account payload"));
    }
    let mut account = Account::from_bytes(&leaf)?;
    account.idx = idx;
    account.batch_num = BatchNum::from_bytes(&entry[32..])?;
    Ok(account)
}

/// State database over a [`Kvdb`]
#[derive(Debug)]
pub struct StateDb {
    cfg: StateDbConfig,
    db: Kvdb,
    trees: Option<Trees>,
}

impl StateDb {
    /// Open the database, rewound to its last sealed batch
    pub fn new(cfg: StateDbConfig) -> Result<Self> {
        let db = Kvdb::new(cfg.kvdb.clone())?;
        let mut state = Self { cfg, db, trees: None };
        state.open_trees()?;
        Ok(state)
    }

    fn open_trees(&mut self) -> Result<()> {
        self.trees = if self.cfg.mode.has_trees() {
            let n_levels = self.cfg.n_levels;
            Some(Trees {
                account: MerkleTree::new(
                    self.db.storage_with_prefix(PREFIX_MT_ACCOUNT)?,
                    n_levels,
                )?,
                vouch: MerkleTree::new(
                    self.db.storage_with_prefix(PREFIX_MT_VOUCH)?,
                    VOUCH_NLEVELS as usize,
                )?,
                score: MerkleTree::new(self.db.storage_with_prefix(PREFIX_MT_SCORE)?, n_levels)?,
            })
        } else {
            None
        };
        Ok(())
    }

    fn trees(&self) -> Result<&Trees> {
        self.trees.as_ref().ok_or(DbError::WithoutTrees(self.cfg.mode.name()))
    }

    fn sled(&self) -> Result<&sled::Db> {
        self.db.db()
    }

    /// Role of the database
    pub const fn mode(&self) -> StateDbMode {
        self.cfg.mode
    }

    /// Configuration
    pub const fn config(&self) -> &StateDbConfig {
        &self.cfg
    }

    /// Underlying store
    pub const fn kvdb(&self) -> &Kvdb {
        &self.db
    }

    /// Shareable handle on the checkpoints
    pub fn checkpoints(&self) -> Checkpoints {
        self.db.checkpoints()
    }

    /// In-memory current batch
    pub const fn current_batch(&self) -> BatchNum {
        self.db.current_batch()
    }

    /// Last allocated account index
    pub const fn current_account_idx(&self) -> AccountIdx {
        self.db.current_account_idx()
    }

    /// Persist the last allocated account index
    pub fn set_current_account_idx(&mut self, idx: AccountIdx) -> Result<()> {
        self.db.set_current_idx(IdxKind::Account, idx.0)
    }

    /// Last allocated vouch index
    pub const fn current_vouch_idx(&self) -> VouchIdx {
        self.db.current_vouch_idx()
    }

    /// Persist the last allocated vouch index
    pub fn set_current_vouch_idx(&mut self, idx: VouchIdx) -> Result<()> {
        self.db.set_current_idx(IdxKind::Vouch, idx.0)
    }

    /// Root of the Account tree, zero without trees
    pub fn account_root(&self) -> U256 {
        self.trees.as_ref().map_or(U256::ZERO, |t| t.account.root())
    }

    /// Root of the Vouch tree, zero without trees
    pub fn vouch_root(&self) -> U256 {
        self.trees.as_ref().map_or(U256::ZERO, |t| t.vouch.root())
    }

    /// Root of the Score tree, zero without trees
    pub fn score_root(&self) -> U256 {
        self.trees.as_ref().map_or(U256::ZERO, |t| t.score.root())
    }

    /// Seal the current state as the next batch
    pub fn make_checkpoint(&mut self) -> Result<()> {
        debug!(
            batch = self.current_batch().0,
            mode = self.cfg.mode.name(),
            "making statedb checkpoint after batch"
        );
        self.db.make_checkpoint()
    }

    /// Rewind to checkpoint `batch_num` and reopen the trees on it
    pub fn reset(&mut self, batch_num: BatchNum) -> Result<()> {
        debug!(batch = batch_num.0, mode = self.cfg.mode.name(), "statedb reset");
        self.trees = None;
        self.db.reset(batch_num)?;
        self.open_trees()
    }

    pub(crate) fn reset_from_synchronizer(
        &mut self,
        batch_num: BatchNum,
        src: &Checkpoints,
    ) -> Result<()> {
        debug!(batch = batch_num.0, mode = self.cfg.mode.name(), "statedb reset from synchronizer");
        self.trees = None;
        self.db.reset_from_synchronizer(batch_num, src)?;
        self.open_trees()
    }

    /// Remove checkpoints outside the `keep` window
    pub fn delete_old_checkpoints(&self) -> Result<()> {
        self.db.delete_old_checkpoints()
    }

    /// Release the store
    pub fn close(&mut self) {
        self.trees = None;
        self.db.close();
    }

    // Accounts

    fn put_account_payload(&self, account: &Account) -> Result<U256> {
        let bytes = account.to_bytes()?;
        let value = account.hash_value()?;
        let hash: [u8; 32] = value.to_be_bytes();
        // identical leaves share the hash entry, the batch stays per idx
        let mut entry = hash.to_vec();
        entry.extend_from_slice(&account.batch_num.to_bytes());

        let mut batch = sled::Batch::default();
        batch.insert(prefixed(PREFIX_ACCOUNT_HASH, &hash), bytes.to_vec());
        batch.insert(prefixed(PREFIX_ACCOUNT_IDX, &account.idx.to_bytes()?), entry);
        self.sled()?.apply_batch(batch)?;
        Ok(value)
    }

    fn account_exists(&self, idx: AccountIdx) -> Result<bool> {
        Ok(self.sled()?.contains_key(prefixed(PREFIX_ACCOUNT_IDX, &idx.to_bytes()?))?)
    }

    /// Store a new account at `idx`, returning the insert proof when the
    /// database has trees
    pub fn create_account(
        &mut self,
        idx: AccountIdx,
        account: &Account,
    ) -> Result<Option<CircomProcessorProof>> {
        if self.account_exists(idx)? {
            return Err(Error::AccountAlreadyExists(idx.0).into());
        }
        let account = Account { idx, ..account.clone() };
        let value = self.put_account_payload(&account)?;
        match self.trees.as_mut() {
            Some(t) => Ok(Some(t.account.add(idx.to_u256(), value)?)),
            None => Ok(None),
        }
    }

    /// Replace the account at `idx`, returning the update proof when the
    /// database has trees
    pub fn update_account(
        &mut self,
        idx: AccountIdx,
        account: &Account,
    ) -> Result<Option<CircomProcessorProof>> {
        if !self.account_exists(idx)? {
            return Err(Error::AccountNotFound(idx.0).into());
        }
        let account = Account { idx, ..account.clone() };
        let value = self.put_account_payload(&account)?;
        match self.trees.as_mut() {
            Some(t) => Ok(Some(t.account.update(idx.to_u256(), value)?)),
            None => Ok(None),
        }
    }

    /// Account at `idx`
    pub fn get_account(&self, idx: AccountIdx) -> Result<Account> {
        get_account_in(self.sled()?, idx)
    }

    /// Every stored account, ordered by idx
    pub fn get_accounts(&self) -> Result<Vec<Account>> {
        let mut accounts = Vec::new();
        for kv in self.sled()?.scan_prefix(PREFIX_ACCOUNT_IDX) {
            let (k, _) = kv?;
            let idx = idx_from_stored(&k[PREFIX_ACCOUNT_IDX.len()..])?;
            accounts.push(self.get_account(idx)?);
        }
        Ok(accounts)
    }

    /// Account at `idx` as of the newest checkpoint, readable while the
    /// database is being written
    pub fn last_get_account(last: &LastDb, idx: AccountIdx) -> Result<Account> {
        last.read(|db| get_account_in(db, idx))
    }

    /// Membership proof of `idx` against the Account root
    pub fn account_membership_proof(&self, idx: AccountIdx) -> Result<CircomVerifierProof> {
        Ok(self.trees()?.account.generate_circom_verifier_proof(idx.to_u256())?)
    }

    // Vouches

    fn vouch_key(idx: VouchIdx) -> Vec<u8> {
        prefixed(PREFIX_VOUCH, &idx.to_bytes())
    }

    fn put_vouch(&self, vouch: &Vouch) -> Result<()> {
        let mut payload = vec![vouch.to_byte()];
        payload.extend_from_slice(&vouch.batch_num.to_bytes());
        self.sled()?.insert(Self::vouch_key(vouch.idx), payload)?;
        Ok(())
    }

    /// Store a new vouch
    pub fn create_vouch(&mut self, vouch: &Vouch) -> Result<Option<CircomProcessorProof>> {
        if self.sled()?.contains_key(Self::vouch_key(vouch.idx))? {
            return Err(Error::AlreadyVouched(vouch.idx.0).into());
        }
        self.put_vouch(vouch)?;
        match self.trees.as_mut() {
            Some(t) => Ok(Some(t.vouch.add(vouch.idx.to_u256(), vouch.leaf_value())?)),
            None => Ok(None),
        }
    }

    /// Replace an existing vouch
    pub fn update_vouch(&mut self, vouch: &Vouch) -> Result<Option<CircomProcessorProof>> {
        if !self.sled()?.contains_key(Self::vouch_key(vouch.idx))? {
            return Err(Error::VouchNotFound(vouch.idx.0).into());
        }
        self.put_vouch(vouch)?;
        match self.trees.as_mut() {
            Some(t) => Ok(Some(t.vouch.update(vouch.idx.to_u256(), vouch.leaf_value())?)),
            None => Ok(None),
        }
    }

    /// Vouch at `idx`
    pub fn get_vouch(&self, idx: VouchIdx) -> Result<Vouch> {
        let payload = self.sled()?.get(Self::vouch_key(idx))?.ok_or(Error::VouchNotFound(idx.0))?;
        if payload.len() != 5 {
            return Err(DbError::InvalidValue("vouch"));
        }
        Ok(Vouch { idx, value: payload[0] == 1, batch_num: BatchNum::from_bytes(&payload[1..])? })
    }

    /// Create the vouch, or update it when it already exists
    pub fn insert_or_update_vouch(
        &mut self,
        vouch: &Vouch,
    ) -> Result<Option<CircomProcessorProof>> {
        match self.create_vouch(vouch) {
            Err(DbError::Core(Error::AlreadyVouched(_))) => self.update_vouch(vouch),
            r => r,
        }
    }

    /// Membership proof of `idx` against the Vouch root
    pub fn vouch_membership_proof(&self, idx: VouchIdx) -> Result<CircomVerifierProof> {
        Ok(self.trees()?.vouch.generate_circom_verifier_proof(idx.to_u256())?)
    }

    // Scores

    fn score_key(idx: AccountIdx) -> Result<Vec<u8>> {
        Ok(prefixed(PREFIX_SCORE, &idx.to_bytes()?))
    }

    fn put_score(&self, score: &Score) -> Result<()> {
        let mut payload = score.to_bytes().to_vec();
        payload.extend_from_slice(&score.batch_num.to_bytes());
        self.sled()?.insert(Self::score_key(score.idx)?, payload)?;
        Ok(())
    }

    /// Store a new score
    pub fn create_score(&mut self, score: &Score) -> Result<Option<CircomProcessorProof>> {
        if self.sled()?.contains_key(Self::score_key(score.idx)?)? {
            return Err(Error::ScoreAlreadyExists(score.idx.0).into());
        }
        self.put_score(score)?;
        match self.trees.as_mut() {
            Some(t) => Ok(Some(t.score.add(score.idx.to_u256(), score.leaf_value())?)),
            None => Ok(None),
        }
    }

    /// Replace an existing score
    pub fn update_score(&mut self, score: &Score) -> Result<Option<CircomProcessorProof>> {
        if !self.sled()?.contains_key(Self::score_key(score.idx)?)? {
            return Err(Error::ScoreNotFound(score.idx.0).into());
        }
        self.put_score(score)?;
        match self.trees.as_mut() {
            Some(t) => Ok(Some(t.score.update(score.idx.to_u256(), score.leaf_value())?)),
            None => Ok(None),
        }
    }

    /// Score of `idx`
    pub fn get_score(&self, idx: AccountIdx) -> Result<Score> {
        let payload = self.sled()?.get(Self::score_key(idx)?)?.ok_or(Error::ScoreNotFound(idx.0))?;
        if payload.len() != 8 {
            return Err(DbError::InvalidValue("score"));
        }
        let mut value = [0u8; 4];
        value.copy_from_slice(&payload[..4]);
        let mut score = Score::from_bytes(idx, value);
        score.batch_num = BatchNum::from_bytes(&payload[4..])?;
        Ok(score)
    }

    /// Score value of `idx`, zero when it has none
    pub fn score_or_zero(&self, idx: AccountIdx) -> Result<ScoreValue> {
        match self.get_score(idx) {
            Ok(s) => Ok(s.value),
            Err(DbError::Core(Error::ScoreNotFound(_))) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Create the score, or update it when it already exists
    pub fn insert_or_update_score(
        &mut self,
        score: &Score,
    ) -> Result<Option<CircomProcessorProof>> {
        match self.create_score(score) {
            Err(DbError::Core(Error::ScoreAlreadyExists(_))) => self.update_score(score),
            r => r,
        }
    }

    /// Membership proof of `idx` against the Score root
    pub fn score_membership_proof(&self, idx: AccountIdx) -> Result<CircomVerifierProof> {
        Ok(self.trees()?.score.generate_circom_verifier_proof(idx.to_u256())?)
    }

    // Idx resolution

    fn eth_addr_bjj_key(addr: &EthAddr, bjj: &BjjComp) -> Vec<u8> {
        let mut k = prefixed(PREFIX_ETH_ADDR_BJJ, addr.as_slice());
        k.extend_from_slice(bjj);
        k
    }

    fn keep_smaller(&self, key: Vec<u8>, idx: AccountIdx) -> Result<()> {
        let db = self.sled()?;
        if let Some(old) = db.get(&key)? {
            if idx_from_stored(&old)? <= idx {
                return Ok(());
            }
        }
        db.insert(key, idx.to_bytes()?.to_vec())?;
        Ok(())
    }

    /// Index `idx` under its address and under its (address, key) pair,
    /// keeping an already indexed smaller idx
    pub fn set_idx_by_eth_addr_bjj(
        &mut self,
        idx: AccountIdx,
        addr: &EthAddr,
        bjj: &BjjComp,
    ) -> Result<()> {
        self.keep_smaller(prefixed(PREFIX_ETH_ADDR, addr.as_slice()), idx)?;
        self.keep_smaller(Self::eth_addr_bjj_key(addr, bjj), idx)
    }

    /// Smallest idx owned by `addr`
    pub fn get_idx_by_eth_addr(&self, addr: &EthAddr) -> Result<AccountIdx> {
        let v = self
            .sled()?
            .get(prefixed(PREFIX_ETH_ADDR, addr.as_slice()))?
            .ok_or_else(|| Error::IdxNotFound(addr.to_string()))?;
        idx_from_stored(&v)
    }

    /// Resolve an idx from an address alone, or from an address and a key
    pub fn get_idx_by_eth_addr_bjj(&self, addr: &EthAddr, bjj: &BjjComp) -> Result<AccountIdx> {
        if addr.is_zero() {
            return Err(Error::IdxResolutionCase {
                eth_addr: addr.to_string(),
                bjj_empty: *bjj == EMPTY_BJJ,
            }
            .into());
        }
        if *bjj == EMPTY_BJJ {
            return self.get_idx_by_eth_addr(addr);
        }
        let v = self
            .sled()?
            .get(Self::eth_addr_bjj_key(addr, bjj))?
            .ok_or_else(|| Error::IdxNotFound(format!("{addr}:{}", hex_bjj(bjj))))?;
        idx_from_stored(&v)
    }
}

fn hex_bjj(bjj: &BjjComp) -> String {
    bjj.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;
    use sybil_core::Nonce;

    fn open(dir: &std::path::Path, mode: StateDbMode) -> StateDb {
        let cfg = StateDbConfig {
            kvdb: KvdbConfig { path: dir.to_path_buf(), keep: 0, ..KvdbConfig::default() },
            mode,
            n_levels: 24,
        };
        StateDb::new(cfg).unwrap()
    }

    fn account(i: u8, balance: u64) -> Account {
        Account {
            idx: AccountIdx(0),
            eth_addr: Address::repeat_byte(i),
            bjj: [i; 32],
            nonce: Nonce(0),
            balance: U256::from(balance),
            batch_num: BatchNum(1),
        }
    }

    #[test]
    fn test_create_get_update_account() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = open(dir.path(), StateDbMode::Synchronizer);
        let proof = s.create_account(AccountIdx(256), &account(1, 10)).unwrap().unwrap();
        assert!(proof.is_old0);
        assert_eq!(proof.new_root, s.account_root());

        let got = s.get_account(AccountIdx(256)).unwrap();
        assert_eq!(got.idx, AccountIdx(256));
        assert_eq!(got.balance, U256::from(10u64));
        assert_eq!(got.batch_num, BatchNum(1));

        let err = s.create_account(AccountIdx(256), &account(1, 10)).unwrap_err();
        assert_eq!(err.core(), Some(&Error::AccountAlreadyExists(256)));

        let root = s.account_root();
        let mut updated = got;
        updated.balance = U256::from(20u64);
        updated.nonce = Nonce(1);
        let proof = s.update_account(AccountIdx(256), &updated).unwrap().unwrap();
        assert_eq!(proof.old_root, root);
        assert_ne!(s.account_root(), root);
        assert_eq!(s.get_account(AccountIdx(256)).unwrap().nonce, Nonce(1));

        let err = s.update_account(AccountIdx(300), &updated).unwrap_err();
        assert_eq!(err.core(), Some(&Error::AccountNotFound(300)));
        assert!(s.account_membership_proof(AccountIdx(256)).unwrap().verify());
    }

    #[test]
    fn test_identical_accounts_keep_their_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = open(dir.path(), StateDbMode::Synchronizer);
        s.create_account(AccountIdx(256), &account(1, 10)).unwrap();
        let twin = Account { batch_num: BatchNum(2), ..account(1, 10) };
        s.create_account(AccountIdx(257), &twin).unwrap();

        assert_eq!(s.get_account(AccountIdx(256)).unwrap().batch_num, BatchNum(1));
        assert_eq!(s.get_account(AccountIdx(257)).unwrap().batch_num, BatchNum(2));

        // updating one twin leaves the other readable
        let mut moved = s.get_account(AccountIdx(257)).unwrap();
        moved.balance = U256::from(3u64);
        s.update_account(AccountIdx(257), &moved).unwrap();
        let first = s.get_account(AccountIdx(256)).unwrap();
        assert_eq!(first.balance, U256::from(10u64));
        assert_eq!(first.batch_num, BatchNum(1));
        assert_eq!(s.get_account(AccountIdx(257)).unwrap().batch_num, BatchNum(2));
    }

    #[test]
    fn test_txselector_has_no_trees() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = open(dir.path(), StateDbMode::TxSelector);
        assert!(s.create_account(AccountIdx(256), &account(1, 10)).unwrap().is_none());
        assert_eq!(s.account_root(), U256::ZERO);
        assert_eq!(s.get_account(AccountIdx(256)).unwrap().balance, U256::from(10u64));
        assert!(matches!(
            s.account_membership_proof(AccountIdx(256)),
            Err(DbError::WithoutTrees(_))
        ));
    }

    #[test]
    fn test_vouches_and_scores() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = open(dir.path(), StateDbMode::Synchronizer);
        let idx = VouchIdx::new(AccountIdx(256), AccountIdx(257));
        let vouch = Vouch { idx, value: true, batch_num: BatchNum(1) };
        assert_eq!(s.create_vouch(&vouch).unwrap().unwrap().fnc, 2);
        assert_eq!(s.create_vouch(&vouch).unwrap_err().core(), Some(&Error::AlreadyVouched(idx.0)));
        let off = Vouch { value: false, ..vouch };
        assert_eq!(s.insert_or_update_vouch(&off).unwrap().unwrap().fnc, 1);
        assert!(!s.get_vouch(idx).unwrap().value);
        let other = VouchIdx::new(AccountIdx(257), AccountIdx(256));
        assert_eq!(s.get_vouch(other).unwrap_err().core(), Some(&Error::VouchNotFound(other.0)));
        assert!(s.vouch_membership_proof(idx).unwrap().verify());

        let score = Score { idx: AccountIdx(257), value: 1, batch_num: BatchNum(1) };
        s.insert_or_update_score(&score).unwrap();
        s.insert_or_update_score(&Score { value: 2, ..score }).unwrap();
        assert_eq!(s.get_score(AccountIdx(257)).unwrap().value, 2);
        assert_eq!(s.score_or_zero(AccountIdx(300)).unwrap(), 0);
        assert_eq!(
            s.update_score(&Score { idx: AccountIdx(300), ..score }).unwrap_err().core(),
            Some(&Error::ScoreNotFound(300))
        );
        assert_ne!(s.score_root(), U256::ZERO);
    }

    #[test]
    fn test_idx_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = open(dir.path(), StateDbMode::TxSelector);
        let addr = Address::repeat_byte(0xaa);
        let bjj_a = [1u8; 32];
        let bjj_b = [2u8; 32];
        s.set_idx_by_eth_addr_bjj(AccountIdx(300), &addr, &bjj_a).unwrap();
        s.set_idx_by_eth_addr_bjj(AccountIdx(258), &addr, &bjj_b).unwrap();
        s.set_idx_by_eth_addr_bjj(AccountIdx(400), &addr, &bjj_a).unwrap();

        assert_eq!(s.get_idx_by_eth_addr(&addr).unwrap(), AccountIdx(258));
        assert_eq!(s.get_idx_by_eth_addr_bjj(&addr, &EMPTY_BJJ).unwrap(), AccountIdx(258));
        assert_eq!(s.get_idx_by_eth_addr_bjj(&addr, &bjj_a).unwrap(), AccountIdx(300));
        assert!(matches!(
            s.get_idx_by_eth_addr_bjj(&Address::ZERO, &bjj_a).unwrap_err().core(),
            Some(Error::IdxResolutionCase { .. })
        ));
        assert!(matches!(
            s.get_idx_by_eth_addr(&Address::repeat_byte(1)).unwrap_err().core(),
            Some(Error::IdxNotFound(_))
        ));
    }

    #[test]
    fn test_reset_restores_roots() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = open(dir.path(), StateDbMode::Synchronizer);
        s.create_account(AccountIdx(256), &account(1, 10)).unwrap();
        s.set_current_account_idx(AccountIdx(256)).unwrap();
        s.make_checkpoint().unwrap();
        let root1 = s.account_root();

        s.create_account(AccountIdx(257), &account(2, 5)).unwrap();
        s.set_current_account_idx(AccountIdx(257)).unwrap();
        s.make_checkpoint().unwrap();
        assert_ne!(s.account_root(), root1);

        s.reset(BatchNum(1)).unwrap();
        assert_eq!(s.current_batch(), BatchNum(1));
        assert_eq!(s.account_root(), root1);
        assert_eq!(s.current_account_idx(), AccountIdx(256));
        assert!(s.get_account(AccountIdx(257)).is_err());

        let last = s.kvdb().last().unwrap();
        let acc = StateDb::last_get_account(&last, AccountIdx(256)).unwrap();
        assert_eq!(acc.balance, U256::from(10u64));

        s.reset(BatchNum(0)).unwrap();
        assert_eq!(s.account_root(), U256::ZERO);
    }

    #[test]
    fn test_accounts_listing() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = open(dir.path(), StateDbMode::BatchBuilder);
        s.create_account(AccountIdx(257), &account(2, 5)).unwrap();
        s.create_account(AccountIdx(256), &account(1, 10)).unwrap();
        let idxs: Vec<_> = s.get_accounts().unwrap().iter().map(|a| a.idx).collect();
        assert_eq!(idxs, vec![AccountIdx(256), AccountIdx(257)]);
    }
}
