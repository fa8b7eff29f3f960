//! Tree errors

use thiserror::Error;

/// Result alias using [`SmtError`]
pub type Result<T> = std::result::Result<T, SmtError>;

/// Errors returned by the Merkle tree
#[derive(Debug, Error)]
pub enum SmtError {
    /// `add` on a key that already has a leaf
    #[error("key already exists")]
    KeyAlreadyExists,
    /// Lookup or `update` on a key without a leaf
    #[error("key not found")]
    KeyNotFound,
    /// Two keys share every bit the tree can distinguish
    #[error("reached maximum level of the merkle tree")]
    ReachedMaxLevel,
    /// Stored node bytes could not be parsed
    #[error("invalid node: {0}")]
    InvalidNode(String),
    /// Backend failure
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
}
