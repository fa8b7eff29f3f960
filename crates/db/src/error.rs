//! Storage errors

use sybil_core::BatchNum;
use sybil_smt::SmtError;
use thiserror::Error;

/// Result alias using [`DbError`]
pub type Result<T> = std::result::Result<T, DbError>;

/// Errors returned by the KVDB and the StateDB
#[derive(Debug, Error)]
pub enum DbError {
    /// Data model or state error
    #[error(transparent)]
    Core(#[from] sybil_core::Error),
    /// Merkle tree failure
    #[error("merkle tree: {0}")]
    Smt(SmtError),
    /// Backend failure
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),
    /// Filesystem failure while handling checkpoint directories
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Requested checkpoint directory is absent
    #[error("checkpoint {0} does not exist")]
    CheckpointNotFound(BatchNum),
    /// Checkpoints do not form a contiguous run
    #[error("checkpoint gap between {prev} and {next}")]
    CheckpointGap {
        /// last checkpoint before the gap
        prev: u32,
        /// first checkpoint after the gap
        next: u32,
    },
    /// `last` view requested on a KVDB configured without it
    #[error("last view is disabled")]
    NoLast,
    /// The `current` handle was closed
    #[error("kvdb is closed")]
    Closed,
    /// Stored bytes could not be decoded
    #[error("invalid stored value for {0}")]
    InvalidValue(&'static str),
    /// Merkle operation on a StateDB without trees
    #[error("cannot use merkle trees in a {0} state db")]
    WithoutTrees(&'static str),
}

impl From<SmtError> for DbError {
    fn from(e: SmtError) -> Self {
        match e {
            SmtError::Storage(e) => Self::Sled(e),
            e => Self::Smt(e),
        }
    }
}

impl DbError {
    /// Inner state or data model error, if any
    pub const fn core(&self) -> Option<&sybil_core::Error> {
        match self {
            Self::Core(e) => Some(e),
            _ => None,
        }
    }
}
