//! Checkpointed key-value store
//!
//! `current` is a mutable sled database. Every sealed batch `N` is copied to
//! `BatchNum<N>`, and `reset(N)` rewinds `current` to that copy. An optional
//! `last` database mirrors the newest checkpoint for readers that must not
//! contend with the writer of `current`.
//!
//! ```text
//! <path>/current
//! <path>/BatchNum1 .. BatchNumN
//! <path>/last
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sybil_core::constants::RESERVED_IDX;
use sybil_core::{AccountIdx, BatchNum, VouchIdx};
use sybil_smt::SledStorage;
use tracing::{debug, error};

use crate::error::{DbError, Result};

/// Prefix of the checkpoint directories
pub const PATH_BATCH_NUM: &str = "BatchNum";
/// Directory of the mutable database
pub const PATH_CURRENT: &str = "current";
/// Directory of the read view on the last checkpoint
pub const PATH_LAST: &str = "last";
/// Checkpoints kept by default
pub const DEFAULT_KEEP: usize = 128;

const KEY_CURRENT_BATCH: &[u8] = b"k:currentbatch";
const KEY_CURRENT_IDX_ACCOUNT: &[u8] = b"k:idxAccount";
const KEY_CURRENT_IDX_VOUCH: &[u8] = b"k:idxVouch";

/// Index counter persisted by the KVDB
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdxKind {
    /// Last allocated account index
    Account,
    /// Last allocated vouch index
    Vouch,
}

impl IdxKind {
    const fn key(self) -> &'static [u8] {
        match self {
            Self::Account => KEY_CURRENT_IDX_ACCOUNT,
            Self::Vouch => KEY_CURRENT_IDX_VOUCH,
        }
    }
}

/// KVDB configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KvdbConfig {
    /// Root directory
    pub path: PathBuf,
    /// Number of checkpoints to keep, 0 keeps all of them
    pub keep: usize,
    /// Skip the contiguity check when listing checkpoints
    pub no_gaps_check: bool,
    /// Do not maintain the `last` view
    pub no_last: bool,
}

impl Default for KvdbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/statedb"),
            keep: DEFAULT_KEEP,
            no_gaps_check: false,
            no_last: false,
        }
    }
}

fn open_db(path: &Path) -> Result<sled::Db> {
    Ok(sled::Config::new().path(path).flush_every_ms(None).open()?)
}

fn remove_dir(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Replace `dest` with a database holding every entry of `src`
fn copy_db(src: &sled::Db, dest: &Path) -> Result<()> {
    remove_dir(dest)?;
    let out = open_db(dest)?;
    let mut batch = sled::Batch::default();
    for kv in src.iter() {
        let (k, v) = kv?;
        batch.insert(k, v);
    }
    out.apply_batch(batch)?;
    out.flush()?;
    Ok(())
}

fn read_u64(db: &sled::Db, key: &[u8], default: u64) -> Result<u64> {
    match db.get(key)? {
        None => Ok(default),
        Some(v) => {
            let b: [u8; 8] = v.as_ref().try_into().map_err(|_| DbError::InvalidValue("counter"))?;
            Ok(u64::from_be_bytes(b))
        }
    }
}

fn read_batch(db: &sled::Db) -> Result<BatchNum> {
    match db.get(KEY_CURRENT_BATCH)? {
        None => Ok(BatchNum(0)),
        Some(v) => Ok(BatchNum::from_bytes(&v)?),
    }
}

/// Handle on the checkpoint directories of a KVDB
///
/// Cloning is cheap. Clones share the checkpoint and deletion mutexes, so a
/// handle given to another component copies checkpoints safely while the
/// owner keeps sealing batches.
#[derive(Clone, Debug)]
pub struct Checkpoints {
    path: PathBuf,
    keep: usize,
    no_gaps_check: bool,
    mutex_checkpoint: Arc<Mutex<()>>,
    mutex_delete: Arc<Mutex<()>>,
}

impl Checkpoints {
    /// Directory of checkpoint `batch_num`
    pub fn path_of(&self, batch_num: BatchNum) -> PathBuf {
        self.path.join(format!("{PATH_BATCH_NUM}{batch_num}"))
    }

    /// Whether checkpoint `batch_num` exists
    pub fn exists(&self, batch_num: BatchNum) -> bool {
        self.path_of(batch_num).is_dir()
    }

    fn list_unchecked(&self) -> Result<Vec<u32>> {
        let mut nums = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let num = name
                .to_str()
                .and_then(|s| s.strip_prefix(PATH_BATCH_NUM))
                .and_then(|s| s.parse::<u32>().ok());
            if let Some(n) = num {
                nums.push(n);
            }
        }
        nums.sort_unstable();
        Ok(nums)
    }

    /// Sorted checkpoint numbers, failing on a gap unless configured otherwise
    pub fn list(&self) -> Result<Vec<u32>> {
        let nums = self.list_unchecked()?;
        if !self.no_gaps_check {
            if let Some(w) = nums.windows(2).find(|w| w[1] != w[0] + 1) {
                return Err(DbError::CheckpointGap { prev: w[0], next: w[1] });
            }
        }
        Ok(nums)
    }

    /// Remove checkpoint `batch_num`
    pub fn delete(&self, batch_num: BatchNum) -> Result<()> {
        let _guard = self.mutex_checkpoint.lock();
        let path = self.path_of(batch_num);
        if !path.is_dir() {
            return Err(DbError::CheckpointNotFound(batch_num));
        }
        fs::remove_dir_all(path)?;
        Ok(())
    }

    /// Remove the checkpoints older than the `keep` newest ones
    pub fn delete_old(&self) -> Result<()> {
        let _guard = self.mutex_delete.lock();
        if self.keep == 0 {
            return Ok(());
        }
        let nums = self.list()?;
        if nums.len() > self.keep {
            for n in &nums[..nums.len() - self.keep] {
                self.delete(BatchNum(*n))?;
            }
        }
        Ok(())
    }

    /// Copy checkpoint `batch_num` to `dest`, replacing whatever is there
    pub fn copy_to(&self, batch_num: BatchNum, dest: &Path) -> Result<()> {
        let _guard = self.mutex_checkpoint.lock();
        let source = self.path_of(batch_num);
        if !source.is_dir() {
            return Err(DbError::CheckpointNotFound(batch_num));
        }
        let src = open_db(&source)?;
        copy_db(&src, dest)
    }
}

/// Read view on the newest checkpoint
#[derive(Debug)]
pub struct LastDb {
    path: PathBuf,
    db: RwLock<Option<sled::Db>>,
}

impl LastDb {
    fn new(path: PathBuf) -> Self {
        Self { path, db: RwLock::new(None) }
    }

    fn set(&self, src: &sled::Db) -> Result<()> {
        let mut db = self.db.write();
        db.take();
        copy_db(src, &self.path)?;
        *db = Some(open_db(&self.path)?);
        Ok(())
    }

    fn set_new(&self) -> Result<()> {
        let mut db = self.db.write();
        db.take();
        remove_dir(&self.path)?;
        *db = Some(open_db(&self.path)?);
        Ok(())
    }

    fn close(&self) {
        self.db.write().take();
    }

    /// Run `f` on the view under the reader lock
    pub fn read<T>(&self, f: impl FnOnce(&sled::Db) -> Result<T>) -> Result<T> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(DbError::Closed)?;
        f(db)
    }
}

/// Checkpointed sled store
#[derive(Debug)]
pub struct Kvdb {
    cfg: KvdbConfig,
    db: Option<sled::Db>,
    current_account_idx: AccountIdx,
    current_vouch_idx: VouchIdx,
    current_batch: BatchNum,
    checkpoints: Checkpoints,
    deletions: Vec<JoinHandle<()>>,
    last: Option<Arc<LastDb>>,
}

impl Kvdb {
    /// Open the store at `cfg.path` and rewind `current` to the last sealed
    /// batch it records
    pub fn new(cfg: KvdbConfig) -> Result<Self> {
        fs::create_dir_all(&cfg.path)?;
        let db = open_db(&cfg.path.join(PATH_CURRENT))?;
        let current_batch = read_batch(&db)?;
        let checkpoints = Checkpoints {
            path: cfg.path.clone(),
            keep: cfg.keep,
            no_gaps_check: cfg.no_gaps_check,
            mutex_checkpoint: Arc::new(Mutex::new(())),
            mutex_delete: Arc::new(Mutex::new(())),
        };
        let last = (!cfg.no_last).then(|| Arc::new(LastDb::new(cfg.path.join(PATH_LAST))));
        let mut kvdb = Self {
            cfg,
            db: Some(db),
            current_account_idx: AccountIdx(RESERVED_IDX),
            current_vouch_idx: VouchIdx(RESERVED_IDX),
            current_batch,
            checkpoints,
            deletions: Vec::new(),
            last,
        };
        kvdb.reset(current_batch)?;
        Ok(kvdb)
    }

    /// Configuration the store was opened with
    pub const fn config(&self) -> &KvdbConfig {
        &self.cfg
    }

    /// Handle on the `current` database
    pub fn db(&self) -> Result<&sled::Db> {
        self.db.as_ref().ok_or(DbError::Closed)
    }

    /// Tree storage under `prefix` in `current`
    pub fn storage_with_prefix(&self, prefix: &[u8]) -> Result<SledStorage> {
        Ok(SledStorage::new(self.db()?.clone(), prefix))
    }

    /// Shareable handle on the checkpoint directories
    pub fn checkpoints(&self) -> Checkpoints {
        self.checkpoints.clone()
    }

    /// Shareable handle on the `last` view, if enabled
    pub fn last(&self) -> Option<Arc<LastDb>> {
        self.last.clone()
    }

    /// In-memory current batch
    pub const fn current_batch(&self) -> BatchNum {
        self.current_batch
    }

    /// In-memory last allocated account index
    pub const fn current_account_idx(&self) -> AccountIdx {
        self.current_account_idx
    }

    /// In-memory last allocated vouch index
    pub const fn current_vouch_idx(&self) -> VouchIdx {
        self.current_vouch_idx
    }

    /// Stored counter, 255 when absent
    pub fn get_current_idx(&self, kind: IdxKind) -> Result<u64> {
        read_u64(self.db()?, kind.key(), RESERVED_IDX)
    }

    /// Persist a counter and mirror it in memory
    pub fn set_current_idx(&mut self, kind: IdxKind, idx: u64) -> Result<()> {
        self.db()?.insert(kind.key(), idx.to_be_bytes().to_vec())?;
        match kind {
            IdxKind::Account => self.current_account_idx = AccountIdx(idx),
            IdxKind::Vouch => self.current_vouch_idx = VouchIdx(idx),
        }
        Ok(())
    }

    /// Stored current batch
    pub fn get_current_batch(&self) -> Result<BatchNum> {
        read_batch(self.db()?)
    }

    /// Persist the current batch and mirror it in memory
    pub fn set_current_batch(&mut self, batch_num: BatchNum) -> Result<()> {
        self.db()?.insert(KEY_CURRENT_BATCH, batch_num.to_bytes().to_vec())?;
        self.current_batch = batch_num;
        Ok(())
    }

    /// Seal the next batch: advance the current batch and copy `current` to
    /// its checkpoint directory
    pub fn make_checkpoint(&mut self) -> Result<()> {
        let batch_num = self.current_batch.next()?;
        self.set_current_batch(batch_num)?;
        {
            let _guard = self.checkpoints.mutex_checkpoint.lock();
            let db = self.db()?;
            db.flush()?;
            copy_db(db, &self.checkpoints.path_of(batch_num))?;
        }
        if let Some(last) = &self.last {
            last.set(self.db()?)?;
        }

        self.deletions.retain(|h| !h.is_finished());
        let checkpoints = self.checkpoints.clone();
        self.deletions.push(std::thread::spawn(move || {
            if let Err(e) = checkpoints.delete_old() {
                error!("failed to delete old checkpoints: {e}");
            }
        }));
        debug!(batch = batch_num.0, "checkpoint created");
        Ok(())
    }

    /// Block until the background deletions have finished
    pub fn wait_deletions(&mut self) {
        for handle in self.deletions.drain(..) {
            if handle.join().is_err() {
                error!("checkpoint deletion thread panicked");
            }
        }
    }

    fn drop_current(&mut self) -> Result<PathBuf> {
        self.wait_deletions();
        if let Some(db) = self.db.take() {
            db.flush()?;
        }
        let current = self.cfg.path.join(PATH_CURRENT);
        remove_dir(&current)?;
        Ok(current)
    }

    fn open_empty(&mut self, current: &Path) -> Result<()> {
        self.db = Some(open_db(current)?);
        self.current_account_idx = AccountIdx(RESERVED_IDX);
        self.current_vouch_idx = VouchIdx(RESERVED_IDX);
        self.current_batch = BatchNum(0);
        if let Some(last) = &self.last {
            last.set_new()?;
        }
        Ok(())
    }

    fn open_from_checkpoint(&mut self, batch_num: BatchNum, current: &Path) -> Result<()> {
        self.checkpoints.copy_to(batch_num, current)?;
        let db = open_db(current)?;
        if let Some(last) = &self.last {
            last.set(&db)?;
        }
        self.current_batch = read_batch(&db)?;
        self.current_account_idx =
            AccountIdx(read_u64(&db, KEY_CURRENT_IDX_ACCOUNT, RESERVED_IDX)?);
        self.current_vouch_idx = VouchIdx(read_u64(&db, KEY_CURRENT_IDX_VOUCH, RESERVED_IDX)?);
        self.db = Some(db);
        Ok(())
    }

    /// Rewind `current` to checkpoint `batch_num`, deleting every newer
    /// checkpoint. Batch 0 is the empty state.
    pub fn reset(&mut self, batch_num: BatchNum) -> Result<()> {
        let current = self.drop_current()?;
        for n in self.checkpoints.list_unchecked()? {
            if n > batch_num.0 {
                self.checkpoints.delete(BatchNum(n))?;
            }
        }
        if batch_num.0 == 0 {
            return self.open_empty(&current);
        }
        self.open_from_checkpoint(batch_num, &current)
    }

    /// Drop every local checkpoint and rebuild `current` from checkpoint
    /// `batch_num` of another store
    pub fn reset_from_synchronizer(
        &mut self,
        batch_num: BatchNum,
        src: &Checkpoints,
    ) -> Result<()> {
        let current = self.drop_current()?;
        for n in self.checkpoints.list_unchecked()? {
            self.checkpoints.delete(BatchNum(n))?;
        }
        if batch_num.0 == 0 {
            return self.open_empty(&current);
        }
        src.copy_to(batch_num, &self.checkpoints.path_of(batch_num))?;
        self.open_from_checkpoint(batch_num, &current)
    }

    /// Sorted checkpoint numbers
    pub fn list_checkpoints(&self) -> Result<Vec<u32>> {
        self.checkpoints.list()
    }

    /// Remove checkpoint `batch_num`, failing if it does not exist
    pub fn delete_checkpoint(&self, batch_num: BatchNum) -> Result<()> {
        self.checkpoints.delete(batch_num)
    }

    /// Remove the checkpoints outside the `keep` window
    pub fn delete_old_checkpoints(&self) -> Result<()> {
        self.checkpoints.delete_old()
    }

    /// Whether checkpoint `batch_num` exists
    pub fn checkpoint_exists(&self, batch_num: BatchNum) -> bool {
        self.checkpoints.exists(batch_num)
    }

    /// Copy checkpoint `batch_num` to `dest`
    pub fn checkpoint_from_to(&self, batch_num: BatchNum, dest: &Path) -> Result<()> {
        self.checkpoints.copy_to(batch_num, dest)
    }

    /// Run `f` on the `last` view under the reader lock
    pub fn last_read<T>(&self, f: impl FnOnce(&sled::Db) -> Result<T>) -> Result<T> {
        self.last.as_ref().ok_or(DbError::NoLast)?.read(f)
    }

    /// Current batch as recorded in the `last` view
    pub fn last_get_current_batch(&self) -> Result<BatchNum> {
        self.last_read(read_batch)
    }

    /// Release every handle and wait for pending deletions
    pub fn close(&mut self) {
        if let Some(db) = self.db.take() {
            if let Err(e) = db.flush() {
                error!("failed to flush kvdb: {e}");
            }
        }
        if let Some(last) = &self.last {
            last.close();
        }
        self.wait_deletions();
    }
}

impl Drop for Kvdb {
    fn drop(&mut self) {
        self.wait_deletions();
    }
}
