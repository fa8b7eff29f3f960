//! Batch forging for the rollup
//!
//! The [`Coordinator`] listens to the synchronizer and, when it may forge,
//! runs a [`Pipeline`]: txs are picked from the [`L2Db`] pool by the
//! [`TxSelector`], turned into proof inputs by the [`BatchBuilder`], proved
//! by a prover from the [`ProversPool`] and handed to the [`TxManager`],
//! which sends them to L1 and follows them until they are confirmed.

mod batch;
mod batchbuilder;
mod config;
mod coordinator;
mod error;
mod l2db;
mod messages;
mod pipeline;
mod prover;
mod proverspool;
mod purger;
mod txmanager;
mod txselector;

pub use batch::{BatchInfo, BatchStatus};
pub use batchbuilder::BatchBuilder;
pub use config::{CoordinatorConfig, PurgerConfig};
pub use coordinator::Coordinator;
pub use error::{CoordError, Result};
pub use l2db::L2Db;
pub use messages::{CoordinatorHandle, CoordinatorMsg, TxManagerHandle, TxManagerMsg};
pub use pipeline::{Pipeline, PipelineContext};
pub use prover::{parse_proof, MockProver, ProofServerClient, Proof, ProverClient, ProverStatus};
pub use proverspool::ProversPool;
pub use purger::Purger;
pub use txmanager::TxManager;
pub use txselector::{Selection, TxSelector};
