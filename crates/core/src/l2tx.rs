//! L2 transactions: forged ones and those waiting in the pool

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::constants::{IDX_BYTES_DA, L1L2_TX_DA_BYTES};
use crate::error::{Error, Result};
use crate::float40::{Float40, FLOAT40_BYTES};
use crate::tx::{tx_compressed_data, TxId, TxType};
use crate::types::{bjj_sign_ay, AccountIdx, BatchNum, BjjComp, EthAddr, Nonce};

/// Check an L2 type against the receiver index and return the effective one.
/// Vouches are recovered from the amount, as only it survives in the
/// data-availability encoding: 1 creates, 0 deletes.
fn l2_type(declared: Option<TxType>, to_idx: AccountIdx, amount: U256) -> Result<TxType> {
    if to_idx == AccountIdx::EXIT {
        return match declared {
            None | Some(TxType::Exit) => Ok(TxType::Exit),
            Some(t) => Err(Error::InvalidTxType(format!("L2Tx.tx_type: {t}, should be: Exit"))),
        };
    }
    if !to_idx.is_user() {
        return Err(Error::InvalidTxType(format!(
            "cannot determine type of L2Tx, invalid to_idx value: {to_idx}"
        )));
    }
    let vouch = if amount == U256::from(1u64) {
        Some(TxType::CreateVouch)
    } else if amount.is_zero() {
        Some(TxType::DeleteVouch)
    } else {
        None
    };
    match (declared, vouch) {
        (Some(t @ (TxType::Transfer | TxType::TransferToEthAddr)), _) => Ok(t),
        (Some(t @ (TxType::CreateVouch | TxType::DeleteVouch)), Some(v)) if t == v => Ok(t),
        (Some(t @ (TxType::CreateVouch | TxType::DeleteVouch)), _) => {
            Err(Error::InvalidTxType(format!(
                "{t} L2Tx must carry amount {}, got {amount}",
                u8::from(t == TxType::CreateVouch)
            )))
        }
        (Some(t), _) => Err(Error::InvalidTxType(format!("{t} is not an L2 type"))),
        (None, Some(v)) => Ok(v),
        (None, None) => Err(Error::InvalidTxType(format!(
            "vouch L2Tx must carry amount 0 or 1, got {amount}"
        ))),
    }
}

/// Forged L2 transaction
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct L2Tx {
    /// `keccak(from_idx ‖ nonce)` with prefix 2
    pub tx_id: TxId,
    /// Batch that forged the tx
    pub batch_num: BatchNum,
    /// Position inside the batch
    pub position: u32,
    /// Sender
    pub from_idx: AccountIdx,
    /// Receiver, or the exit idx
    pub to_idx: AccountIdx,
    /// Amount
    pub amount: U256,
    /// Sender nonce at the time of the tx
    pub nonce: Nonce,
    /// Type. `None` until set by [`L2Tx::new`].
    pub tx_type: Option<TxType>,
    /// Block of the forge
    pub eth_block_num: u64,
}

impl L2Tx {
    /// Fill the type and id, checking any declared values
    pub fn new(mut tx: Self) -> Result<Self> {
        tx.tx_type = Some(l2_type(tx.tx_type, tx.to_idx, tx.amount)?);
        let declared = tx.tx_id;
        tx.tx_id = tx.calculate_tx_id()?;
        if !declared.is_zero() && declared != tx.tx_id {
            return Err(Error::TxIdMismatch {
                got: declared.to_string(),
                expected: tx.tx_id.to_string(),
            });
        }
        Ok(tx)
    }

    /// Effective type
    pub fn kind(&self) -> Result<TxType> {
        l2_type(self.tx_type, self.to_idx, self.amount)
    }

    /// Id derived from `(from_idx, nonce)`
    pub fn calculate_tx_id(&self) -> Result<TxId> {
        TxId::l2(self.from_idx, self.nonce)
    }

    /// Data-availability encoding: `from_idx(3) ‖ to_idx(3) ‖ amount_f40(5) ‖ fee(1)`
    pub fn bytes_data_availability(&self) -> Result<[u8; L1L2_TX_DA_BYTES]> {
        let mut b = [0u8; L1L2_TX_DA_BYTES];
        b[..IDX_BYTES_DA].copy_from_slice(&self.from_idx.to_bytes3()?);
        b[IDX_BYTES_DA..IDX_BYTES_DA * 2].copy_from_slice(&self.to_idx.to_bytes3()?);
        let amount = Float40::from_u256(self.amount)?;
        b[IDX_BYTES_DA * 2..IDX_BYTES_DA * 2 + FLOAT40_BYTES].copy_from_slice(&amount.to_bytes()?);
        Ok(b)
    }

    /// Parse the data-availability encoding. Type, nonce and id are not part
    /// of it.
    pub fn from_bytes_data_availability(b: &[u8]) -> Result<Self> {
        if b.len() != L1L2_TX_DA_BYTES {
            return Err(Error::InvalidLength { expected: L1L2_TX_DA_BYTES, got: b.len() });
        }
        let amount = Float40::from_slice(&b[IDX_BYTES_DA * 2..IDX_BYTES_DA * 2 + FLOAT40_BYTES])?
            .to_u256()?;
        Ok(Self {
            from_idx: AccountIdx::from_bytes(&b[..IDX_BYTES_DA])?,
            to_idx: AccountIdx::from_bytes(&b[IDX_BYTES_DA..IDX_BYTES_DA * 2])?,
            amount,
            ..Default::default()
        })
    }

    /// Compressed fingerprint for the witness, keyed by the nonce
    pub fn tx_compressed_data(&self, chain_id: u16) -> Result<U256> {
        tx_compressed_data(
            self.kind()?,
            self.nonce.0,
            Float40::from_u256(self.amount)?,
            self.to_idx,
            self.from_idx,
            chain_id,
        )
    }

    /// Pool representation, in the `Pending` state
    pub fn to_pool_l2_tx(&self) -> PoolL2Tx {
        PoolL2Tx {
            tx_id: self.tx_id,
            from_idx: self.from_idx,
            to_idx: self.to_idx,
            amount: self.amount,
            nonce: self.nonce,
            tx_type: self.tx_type,
            ..Default::default()
        }
    }
}

/// Lifecycle of a pool tx
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolL2TxState {
    /// Valid, not selected yet
    #[default]
    Pending,
    /// Selected by a batch being forged
    Forging,
    /// Included in a mined batch
    Forged,
    /// Rejected
    Invalid,
}

/// Compressed EdDSA signature over Baby-Jubjub: `R8 ‖ S`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Compressed `R8` point
    pub r8: BjjComp,
    /// Scalar `S`, little-endian
    pub s: [u8; 32],
}

impl Signature {
    /// `(S, R8y)` as field elements
    pub fn components(&self) -> (U256, U256) {
        let (_, r8y) = bjj_sign_ay(&self.r8);
        (U256::from_le_bytes(self.s), r8y)
    }
}

/// L2 transaction in the coordinator pool
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolL2Tx {
    /// `keccak(from_idx ‖ nonce)` with prefix 2
    pub tx_id: TxId,
    /// Sender
    pub from_idx: AccountIdx,
    /// Receiver, or the exit idx
    pub to_idx: AccountIdx,
    /// Receiver address for address-based transfers
    pub to_eth_addr: EthAddr,
    /// Receiver key for key-based transfers
    pub to_bjj: BjjComp,
    /// Amount
    pub amount: U256,
    /// Fee selector, always zero
    pub fee: u8,
    /// Sender nonce
    pub nonce: Nonce,
    /// Pool state
    pub state: PoolL2TxState,
    /// Last batch that may include the tx, 0 for no limit
    pub max_num_batch: u32,
    /// Reason of the last rejection
    pub info: Option<String>,
    /// Sender signature
    pub signature: Signature,
    /// Unix time in milliseconds when the tx entered the pool
    pub timestamp: u64,
    /// Batch that forged the tx
    pub batch_num: Option<BatchNum>,
    /// Atomic group the tx belongs to
    pub atomic_group_id: Option<[u8; 32]>,
    /// Requested tx: sender
    pub rq_from_idx: AccountIdx,
    /// Requested tx: receiver
    pub rq_to_idx: AccountIdx,
    /// Requested tx: receiver address
    pub rq_to_eth_addr: EthAddr,
    /// Requested tx: receiver key
    pub rq_to_bjj: BjjComp,
    /// Requested tx: amount
    pub rq_amount: U256,
    /// Requested tx: fee
    pub rq_fee: u8,
    /// Requested tx: nonce
    pub rq_nonce: Nonce,
    /// Requested tx: relative position in the group
    pub rq_offset: u8,
    /// Type. `None` until set by [`PoolL2Tx::new`].
    pub tx_type: Option<TxType>,
}

impl PoolL2Tx {
    /// Fill the type and id, checking any declared values
    pub fn new(mut tx: Self) -> Result<Self> {
        let l2 = L2Tx::new(tx.to_l2_tx())?;
        tx.tx_id = l2.tx_id;
        tx.tx_type = l2.tx_type;
        Ok(tx)
    }

    /// Forged representation
    pub fn to_l2_tx(&self) -> L2Tx {
        L2Tx {
            tx_id: self.tx_id,
            batch_num: self.batch_num.unwrap_or_default(),
            position: 0,
            from_idx: self.from_idx,
            to_idx: self.to_idx,
            amount: self.amount,
            nonce: self.nonce,
            tx_type: self.tx_type,
            eth_block_num: 0,
        }
    }
}
