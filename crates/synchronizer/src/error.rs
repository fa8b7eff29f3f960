//! Synchronizer errors

use sybil_db::DbError;
use sybil_txprocessor::ProcessError;
use thiserror::Error;

/// Result alias using [`SyncError`]
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors returned by the synchronizer and the Ethereum clients
#[derive(Debug, Error)]
pub enum SyncError {
    /// The node has no block with the requested number or hash
    #[error("unknown block")]
    UnknownBlock,
    /// Logs were requested for a block that is no longer canonical
    #[error("block {num} hash mismatch")]
    BlockHashMismatch {
        /// requested block
        num: u64,
    },
    /// A previous reset left the intermediate state unusable
    #[error("reset state failed: {0}")]
    ResetStateFailed(String),
    /// Cancelled
    #[error("done")]
    Done,
    /// JSON-RPC error object or malformed response
    #[error("rpc: {0}")]
    Rpc(String),
    /// Transport failure
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    /// Malformed log or calldata
    #[error("decode: {0}")]
    Decode(String),
    /// Chain data disagrees with the local state
    #[error("inconsistent: {0}")]
    Inconsistent(String),
    /// Replaying a batch failed
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// State or checkpoint failure
    #[error(transparent)]
    Db(#[from] DbError),
    /// Data model failure
    #[error(transparent)]
    Core(#[from] sybil_core::Error),
}

impl SyncError {
    /// Whether the error is a cancellation
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}
