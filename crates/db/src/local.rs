//! StateDB fork used by the coordinator pipeline
//!
//! Keeps its own checkpoints and rebuilds itself from the synchronizer's
//! checkpoints whenever it has none for the requested batch.

use std::ops::{Deref, DerefMut};

use sybil_core::BatchNum;

use crate::error::Result;
use crate::kvdb::Checkpoints;
use crate::statedb::{StateDb, StateDbConfig};

/// Local copy of the synchronizer state
#[derive(Debug)]
pub struct LocalStateDb {
    state: StateDb,
    synchronizer: Checkpoints,
}

impl LocalStateDb {
    /// Open a fork reading from the synchronizer checkpoints behind
    /// `synchronizer`
    pub fn new(mut cfg: StateDbConfig, synchronizer: Checkpoints) -> Result<Self> {
        cfg.kvdb.no_gaps_check = true;
        cfg.kvdb.no_last = true;
        Ok(Self { state: StateDb::new(cfg)?, synchronizer })
    }

    /// Whether the fork holds its own checkpoint `batch_num`
    pub fn checkpoint_exists(&self, batch_num: BatchNum) -> bool {
        self.state.kvdb().checkpoint_exists(batch_num)
    }

    /// Rewind to `batch_num`, copying the synchronizer checkpoint when
    /// `from_synchronizer` is set
    pub fn reset(&mut self, batch_num: BatchNum, from_synchronizer: bool) -> Result<()> {
        if from_synchronizer {
            return self.state.reset_from_synchronizer(batch_num, &self.synchronizer);
        }
        self.state.reset(batch_num)
    }
}

impl Deref for LocalStateDb {
    type Target = StateDb;

    fn deref(&self) -> &StateDb {
        &self.state
    }
}

impl DerefMut for LocalStateDb {
    fn deref_mut(&mut self) -> &mut StateDb {
        &mut self.state
    }
}
