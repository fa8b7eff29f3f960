//! Processing errors

use sybil_db::DbError;
use sybil_smt::SmtError;
use thiserror::Error;

/// Result alias using [`ProcessError`]
pub type Result<T> = std::result::Result<T, ProcessError>;

/// Errors returned while applying a batch
#[derive(Debug, Error)]
pub enum ProcessError {
    /// More L1 txs than a batch can carry
    #[error("L1 txs ({got}) exceed max_l1_tx ({max})")]
    MaxL1TxExceeded {
        /// L1 user plus coordinator txs
        got: usize,
        /// configured limit
        max: usize,
    },
    /// More txs than a batch can carry
    #[error("txs ({got}) exceed max_tx ({max})")]
    MaxTxExceeded {
        /// all txs of the batch
        got: usize,
        /// configured limit
        max: usize,
    },
    /// State, tree or data model failure
    #[error(transparent)]
    State(#[from] DbError),
}

impl From<sybil_core::Error> for ProcessError {
    fn from(e: sybil_core::Error) -> Self {
        Self::State(DbError::Core(e))
    }
}

impl From<SmtError> for ProcessError {
    fn from(e: SmtError) -> Self {
        Self::State(e.into())
    }
}

impl ProcessError {
    /// Inner data model error, if any
    pub const fn core(&self) -> Option<&sybil_core::Error> {
        match self {
            Self::State(e) => e.core(),
            _ => None,
        }
    }
}
