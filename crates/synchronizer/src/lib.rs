//! L1 synchronizer of the rollup
//!
//! Follows the rollup contract block by block through an [`EthClient`],
//! replays every forged batch on a Synchronizer-mode `StateDb`, keeps the
//! derived history in a [`HistoryStore`] and rewinds both on reorgs.

pub mod abi;
mod error;
mod eth;
mod history;
mod rpc;
mod stats;
mod synchronizer;
mod test_client;

pub use error::{Result, SyncError};
pub use eth::{EthClient, TxReceipt};
pub use history::{HistoryStore, MemoryHistoryDb};
pub use rpc::{RpcConfig, RpcEthClient};
pub use stats::{EthStats, Stats, StatsHolder, SyncStats};
pub use synchronizer::{SyncOutcome, Synchronizer, SynchronizerConfig};
pub use test_client::TestEthClient;
