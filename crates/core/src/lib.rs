//! Data model of the Sybil-resistance rollup sequencer
//!
//! Fixed-width integer types, the Float40 amount encoding, transaction ids and
//! wire codecs, batch and block records, witness inputs and the error
//! taxonomy shared by the state, processing and sync layers.

pub mod account;
pub mod batch;
pub mod block;
pub mod constants;
pub mod error;
pub mod float40;
pub mod l1tx;
pub mod l2tx;
pub mod tx;
pub mod types;
pub mod vouch;
pub mod zk;

pub use account::{Account, AccountUpdate};
pub use batch::{Batch, BatchData, ExitInfo};
pub use block::{
    Block, BlockData, BucketParams, BucketUpdate, RollupConstants, RollupData,
    RollupEventForgeBatch, RollupEventInitialize, RollupEventL1UserTx, RollupEventSafeMode,
    RollupEventUpdateBucketWithdraw, RollupEventUpdateBucketsParameters,
    RollupEventUpdateForgeL1L2BatchTimeout, RollupEventWithdraw, RollupEvents,
    RollupForgeBatchArgs, RollupVariables, RollupVerifierStruct, WithdrawInfo,
};
pub use error::{Error, Result};
pub use float40::Float40;
pub use l1tx::L1Tx;
pub use l2tx::{L2Tx, PoolL2Tx, PoolL2TxState, Signature};
pub use tx::{TxId, TxType};
pub use types::{
    keccak256, AccountIdx, BatchNum, BjjComp, EthAddr, Hash, Nonce, Score as ScoreValue, VouchIdx,
    EMPTY_BJJ,
};
pub use vouch::{Score, Vouch};
pub use zk::{ZKInputs, ZKMetadata};
