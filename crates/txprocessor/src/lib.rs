//! Deterministic batch processing
//!
//! [`TxProcessor`] applies the txs of a batch to a [`sybil_db::StateDb`],
//! keeps the exit tree of the batch, and depending on the database mode
//! fills the proof witness or records the account changes and exits.

mod error;
mod processor;

pub use error::{ProcessError, Result};
pub use processor::{ProcessTxOutput, TxProcessor, TxProcessorConfig};
