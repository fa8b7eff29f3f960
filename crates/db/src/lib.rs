//! Persistent state of the sequencer
//!
//! - [`Kvdb`]: sled store with numbered checkpoints and rewind
//! - [`StateDb`]: accounts, vouches and scores indexed by Merkle trees
//! - [`LocalStateDb`]: fork of the synchronizer state for the pipeline

mod error;
pub mod kvdb;
mod local;
pub mod statedb;

pub use error::{DbError, Result};
pub use kvdb::{Checkpoints, IdxKind, Kvdb, KvdbConfig, LastDb};
pub use local::LocalStateDb;
pub use statedb::{StateDb, StateDbConfig, StateDbMode};
