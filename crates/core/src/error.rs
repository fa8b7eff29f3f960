//! Error taxonomy shared by every layer of the sequencer

use thiserror::Error;

/// Result alias using the core [`enum@Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the data model, the encoders and the state layer
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    // Overflow errors
    /// Account index does not fit in 24 bits
    #[error("idx overflow, max value: 2**24 - 1, got {0}")]
    IdxOverflow(u64),
    /// Nonce does not fit in 40 bits
    #[error("nonce overflow, max value: 2**40 - 1")]
    NonceOverflow,
    /// Score increment went past u32::MAX
    #[error("score overflow, max value: 2**32 - 1")]
    ScoreOverflow,
    /// Generic numeric overflow while serializing a field
    #[error("num overflow: {0}")]
    NumOverflow(&'static str),
    /// Float40 value does not fit in 40 bits
    #[error("float40 overflow, max value: 2**40 - 1")]
    Float40Overflow,
    /// Float40 exponent is larger than 31
    #[error("float40 error, e > 31")]
    Float40ExponentTooLarge,
    /// Float40 mantissa does not fit in 35 bits
    #[error("float40 error, not enough precision")]
    Float40NotEnoughPrecision,

    // State errors
    /// Account leaf already present
    #[error("account already exists: {0}")]
    AccountAlreadyExists(u64),
    /// Score leaf already present
    #[error("score already exists: {0}")]
    ScoreAlreadyExists(u64),
    /// Vouch leaf already present
    #[error("already vouched: {0}")]
    AlreadyVouched(u64),
    /// Account leaf absent
    #[error("account not found: {0}")]
    AccountNotFound(u64),
    /// Vouch leaf absent
    #[error("vouch not found: {0}")]
    VouchNotFound(u64),
    /// Score leaf absent
    #[error("score not found: {0}")]
    ScoreNotFound(u64),
    /// No idx registered for the given address or key
    #[error("idx not found for {0}")]
    IdxNotFound(String),
    /// Unsupported EthAddr/BJJ combination in idx resolution
    #[error("idx resolution case not supported: eth_addr={eth_addr}, bjj_empty={bjj_empty}")]
    IdxResolutionCase {
        /// address used for the lookup
        eth_addr: String,
        /// whether the BJJ key was empty
        bjj_empty: bool,
    },

    // Transaction errors
    /// Balance would become negative
    #[error("not enough balance in account {idx}")]
    NotEnoughBalance {
        /// offending account
        idx: u64,
    },
    /// Type cannot be inferred or is not supported here
    #[error("invalid tx type: {0}")]
    InvalidTxType(String),
    /// Declared TxID differs from the computed one
    #[error("tx id mismatch: got {got}, expected {expected}")]
    TxIdMismatch {
        /// declared id
        got: String,
        /// computed id
        expected: String,
    },
    /// L1 tx lacks the queue number (user) or batch number (coordinator) needed for its id
    #[error("invalid L1 batch link: {0}")]
    InvalidL1BatchLink(&'static str),
    /// L2 nonce does not match the account nonce
    #[error("invalid nonce for account {idx}: tx {tx_nonce}, account {account_nonce}")]
    InvalidNonce {
        /// sender
        idx: u64,
        /// nonce carried by the tx
        tx_nonce: u64,
        /// nonce stored in the account
        account_nonce: u64,
    },
    /// Byte slice has an unexpected length
    #[error("invalid length: expected {expected}, got {got}")]
    InvalidLength {
        /// expected length
        expected: usize,
        /// actual length
        got: usize,
    },
}
