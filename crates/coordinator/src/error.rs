//! Coordinator errors

use sybil_core::{BatchNum, TxId};
use sybil_db::DbError;
use sybil_synchronizer::SyncError;
use sybil_txprocessor::ProcessError;
use thiserror::Error;

/// Result alias using [`CoordError`]
pub type Result<T> = std::result::Result<T, CoordError>;

/// Errors returned by the forging pipeline and its helpers
#[derive(Debug, Error)]
pub enum CoordError {
    /// Cancelled
    #[error("done")]
    Done,
    /// Nothing left to pop
    #[error("queue empty")]
    QueueEmpty,
    /// The forging policy decided not to forge this batch
    #[error("skip batch: {0}")]
    SkipBatch(&'static str),
    /// The prover rejected a request or returned garbage
    #[error("prover: {0}")]
    Prover(String),
    /// Proof server transport failure
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    /// The tx is already in the pool
    #[error("tx {0} already in the pool")]
    DuplicateTx(TxId),
    /// A peer task is gone
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
    /// A batch built locally does not match what is expected
    #[error("batch {batch}: {reason}")]
    Batch {
        /// batch being built
        batch: BatchNum,
        /// what went wrong
        reason: String,
    },
    /// Ethereum client or history failure
    #[error(transparent)]
    Sync(#[from] SyncError),
    /// Building or selecting a batch failed
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// State or checkpoint failure
    #[error(transparent)]
    Db(#[from] DbError),
    /// Data model failure
    #[error(transparent)]
    Core(#[from] sybil_core::Error),
}

impl CoordError {
    /// Whether the error is a cancellation
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done | Self::Sync(SyncError::Done))
    }
}
