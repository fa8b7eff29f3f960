//! L1 transactions: queued user txs and inline coordinator txs
//!
//! User txs are emitted by `L1UserTxEvent` in a 78-byte encoding and wait in a
//! numbered queue (`to_forge_l1_txs_num`) until a batch forges them.
//! Coordinator txs travel in the `forgeBatch` calldata, 101 bytes each.

use alloy_primitives::{B256, U256};
use serde::{Deserialize, Serialize};

use crate::constants::{
    ETH_ADDR_INTERNAL_ONLY, EXIT_IDX, IDX_BYTES_DA, IDX_USER_THRESHOLD, L1L2_TX_DA_BYTES,
    L1_COORDINATOR_TOTAL_BYTES, L1_USER_TOTAL_BYTES,
};
use crate::error::{Error, Result};
use crate::float40::{Float40, FLOAT40_BYTES};
use crate::tx::{tx_compressed_data, TxId, TxType};
use crate::types::{AccountIdx, BatchNum, BjjComp, EthAddr};

/// Bytes of the compressed signature of an L1 coordinator tx (`v ‖ s ‖ r`)
pub const L1_COORDINATOR_SIG_BYTES: usize = 65;

/// L1 transaction
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct L1Tx {
    /// Type-prefixed id
    pub tx_id: TxId,
    /// Queue of the tx. Only user txs have one.
    pub to_forge_l1_txs_num: Option<u64>,
    /// Position inside the queue (user) or the batch (coordinator)
    pub position: u16,
    /// Originated by a user rather than by the coordinator
    pub user_origin: bool,
    /// Sender, or deposit receiver for `Deposit`
    pub from_idx: AccountIdx,
    /// Sender once resolved by the processor
    pub effective_from_idx: AccountIdx,
    /// Sender address
    pub from_eth_addr: EthAddr,
    /// Sender key
    pub from_bjj: BjjComp,
    /// Receiver
    pub to_idx: AccountIdx,
    /// Transfer leg
    pub amount: U256,
    /// Transfer leg actually applied
    pub effective_amount: U256,
    /// Deposit leg
    pub deposit_amount: U256,
    /// Deposit leg actually applied
    pub effective_deposit_amount: U256,
    /// Block that queued the tx
    pub eth_block_num: u64,
    /// Ethereum tx that queued the tx
    pub eth_tx_hash: B256,
    /// Fee paid on L1
    pub l1_fee: U256,
    /// Explicit type. When absent it is inferred from the indices.
    pub tx_type: Option<TxType>,
    /// Batch that forged the tx
    pub batch_num: Option<BatchNum>,
}

impl L1Tx {
    /// Validate a tx, fill its type and id, and check any declared values
    /// against the computed ones
    pub fn new(mut tx: Self) -> Result<Self> {
        let inferred = tx.infer_type()?;
        if let Some(declared) = tx.tx_type {
            if declared != inferred {
                return Err(Error::InvalidTxType(format!(
                    "L1Tx.tx_type: {declared}, should be: {inferred}"
                )));
            }
        }
        tx.tx_type = Some(inferred);

        let declared = tx.tx_id;
        tx.set_id()?;
        if !declared.is_zero() && declared != tx.tx_id {
            return Err(Error::TxIdMismatch {
                got: declared.to_string(),
                expected: tx.tx_id.to_string(),
            });
        }
        Ok(tx)
    }

    /// Type implied by `(from_idx, to_idx, amount)`
    pub fn infer_type(&self) -> Result<TxType> {
        let from = self.from_idx;
        let to = self.to_idx;
        if from.0 == 0 {
            if to.0 == 0 {
                return Ok(TxType::CreateAccountDeposit);
            }
            return Err(Error::InvalidTxType(format!(
                "can not determine type of L1Tx, invalid to_idx value: {to}"
            )));
        }
        if !from.is_user() {
            return Err(Error::InvalidTxType(format!(
                "can not determine type of L1Tx, invalid from_idx value: {from}"
            )));
        }
        match to.0 {
            0 => Ok(TxType::Deposit),
            EXIT_IDX => Ok(TxType::ForceExit),
            t if t >= IDX_USER_THRESHOLD => {
                if self.amount == U256::from(1u64) {
                    Ok(TxType::CreateVouch)
                } else if self.amount.is_zero() {
                    Ok(TxType::DeleteVouch)
                } else {
                    Err(Error::InvalidTxType(format!(
                        "vouch L1Tx must carry amount 0 or 1, got {}",
                        self.amount
                    )))
                }
            }
            _ => Err(Error::InvalidTxType(format!(
                "can not determine type of L1Tx, invalid to_idx value: {to}"
            ))),
        }
    }

    /// Declared type, or the inferred one
    pub fn kind(&self) -> Result<TxType> {
        match self.tx_type {
            Some(t) => Ok(t),
            None => self.infer_type(),
        }
    }

    /// Id derived from `(to_forge_l1_txs_num, position)` for user txs and
    /// from `(batch_num, position)` for coordinator txs
    pub fn calculate_tx_id(&self) -> Result<TxId> {
        if self.user_origin {
            let num = self
                .to_forge_l1_txs_num
                .ok_or(Error::InvalidL1BatchLink("user tx without to_forge_l1_txs_num"))?;
            Ok(TxId::l1_user(num, self.position))
        } else {
            let batch = self
                .batch_num
                .ok_or(Error::InvalidL1BatchLink("coordinator tx without batch_num"))?;
            Ok(TxId::l1_coordinator(u64::from(batch.0), self.position))
        }
    }

    /// Recompute and store the id
    pub fn set_id(&mut self) -> Result<()> {
        self.tx_id = self.calculate_tx_id()?;
        Ok(())
    }

    /// 78-byte user encoding:
    /// `from_eth_addr(20) ‖ from_bjj(32) ‖ from_idx(6) ‖ deposit_amount_f40(5) ‖
    /// amount_f40(5) ‖ token_id(4) ‖ to_idx(6)`
    pub fn bytes_user(&self) -> Result<[u8; L1_USER_TOTAL_BYTES]> {
        let mut b = [0u8; L1_USER_TOTAL_BYTES];
        b[0..20].copy_from_slice(self.from_eth_addr.as_slice());
        b[20..52].copy_from_slice(&self.from_bjj);
        b[52..58].copy_from_slice(&self.from_idx.to_bytes()?);
        b[58..63].copy_from_slice(&Float40::from_u256(self.deposit_amount)?.to_bytes()?);
        b[63..68].copy_from_slice(&Float40::from_u256(self.amount)?.to_bytes()?);
        // token id, always zero: bytes [68..72)
        b[72..78].copy_from_slice(&self.to_idx.to_bytes()?);
        Ok(b)
    }

    /// Parse the 78-byte user encoding
    pub fn from_bytes_user(b: &[u8]) -> Result<Self> {
        if b.len() != L1_USER_TOTAL_BYTES {
            return Err(Error::InvalidLength { expected: L1_USER_TOTAL_BYTES, got: b.len() });
        }
        let mut from_bjj = [0u8; 32];
        from_bjj.copy_from_slice(&b[20..52]);
        Ok(Self {
            user_origin: true,
            from_eth_addr: EthAddr::from_slice(&b[0..20]),
            from_bjj,
            from_idx: AccountIdx::from_bytes(&b[52..58])?,
            deposit_amount: Float40::from_slice(&b[58..63])?.to_u256()?,
            amount: Float40::from_slice(&b[63..68])?.to_u256()?,
            to_idx: AccountIdx::from_bytes(&b[72..78])?,
            ..Default::default()
        })
    }

    /// 101-byte coordinator encoding: `token_id(4) ‖ bjj(32) ‖ v(1) ‖ s(32) ‖ r(32)`
    pub fn bytes_coordinator(
        &self,
        signature: &[u8; L1_COORDINATOR_SIG_BYTES],
    ) -> [u8; L1_COORDINATOR_TOTAL_BYTES] {
        let mut b = [0u8; L1_COORDINATOR_TOTAL_BYTES];
        b[4..36].copy_from_slice(&self.from_bjj);
        b[36..].copy_from_slice(signature);
        b
    }

    /// Parse the 101-byte coordinator encoding. Only the shape of the
    /// signature is checked: an empty signature or `v` in {27, 28}. The owner
    /// is the internal-only address.
    pub fn from_bytes_coordinator(
        b: &[u8],
        batch_num: BatchNum,
        position: u16,
    ) -> Result<Self> {
        if b.len() != L1_COORDINATOR_TOTAL_BYTES {
            return Err(Error::InvalidLength { expected: L1_COORDINATOR_TOTAL_BYTES, got: b.len() });
        }
        let sig = &b[36..];
        let empty = sig.iter().all(|x| *x == 0);
        if !empty && !matches!(sig[0], 27 | 28) {
            return Err(Error::InvalidTxType(format!(
                "coordinator tx signature with invalid v: {}",
                sig[0]
            )));
        }
        let mut from_bjj = [0u8; 32];
        from_bjj.copy_from_slice(&b[4..36]);
        let mut tx = Self {
            user_origin: false,
            from_bjj,
            from_eth_addr: ETH_ADDR_INTERNAL_ONLY,
            position,
            batch_num: Some(batch_num),
            tx_type: Some(TxType::CreateAccountDeposit),
            ..Default::default()
        };
        tx.set_id()?;
        Ok(tx)
    }

    /// Data-availability encoding: `from_idx(3) ‖ to_idx(3) ‖ amount_f40(5) ‖ fee(1)`,
    /// with the effective amount rounded down to Float40
    pub fn bytes_data_availability(&self) -> Result<[u8; L1L2_TX_DA_BYTES]> {
        let mut b = [0u8; L1L2_TX_DA_BYTES];
        b[..IDX_BYTES_DA].copy_from_slice(&self.from_idx.to_bytes3()?);
        b[IDX_BYTES_DA..IDX_BYTES_DA * 2].copy_from_slice(&self.to_idx.to_bytes3()?);
        let amount = Float40::from_u256_floor(self.effective_amount)?;
        b[IDX_BYTES_DA * 2..IDX_BYTES_DA * 2 + FLOAT40_BYTES].copy_from_slice(&amount.to_bytes()?);
        Ok(b)
    }

    /// Parse the data-availability encoding
    pub fn from_data_availability(b: &[u8]) -> Result<Self> {
        if b.len() != L1L2_TX_DA_BYTES {
            return Err(Error::InvalidLength { expected: L1L2_TX_DA_BYTES, got: b.len() });
        }
        let amount = Float40::from_slice(&b[IDX_BYTES_DA * 2..IDX_BYTES_DA * 2 + FLOAT40_BYTES])?
            .to_u256()?;
        Ok(Self {
            from_idx: AccountIdx::from_bytes(&b[..IDX_BYTES_DA])?,
            to_idx: AccountIdx::from_bytes(&b[IDX_BYTES_DA..IDX_BYTES_DA * 2])?,
            effective_amount: amount,
            ..Default::default()
        })
    }

    /// Compressed fingerprint for the witness, keyed by the queue number
    pub fn tx_compressed_data(&self, chain_id: u16) -> Result<U256> {
        tx_compressed_data(
            self.kind()?,
            self.to_forge_l1_txs_num.unwrap_or_default(),
            Float40::from_u256_floor(self.amount)?,
            self.to_idx,
            self.from_idx,
            chain_id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_tx() -> L1Tx {
        let mut bjj = [0u8; 32];
        bjj[0] = 0x42;
        bjj[31] = 0x80;
        L1Tx {
            user_origin: true,
            to_forge_l1_txs_num: Some(3),
            position: 1,
            from_eth_addr: EthAddr::repeat_byte(0xaa),
            from_bjj: bjj,
            from_idx: AccountIdx(0),
            to_idx: AccountIdx(0),
            deposit_amount: U256::from(1000u64),
            ..Default::default()
        }
    }

    #[test]
    fn test_new_l1_tx() {
        let tx = L1Tx::new(user_tx()).unwrap();
        assert_eq!(tx.tx_type, Some(TxType::CreateAccountDeposit));
        assert_eq!(tx.tx_id, TxId::l1_user(3, 1));

        let mut wrong = user_tx();
        wrong.tx_type = Some(TxType::Deposit);
        assert!(matches!(L1Tx::new(wrong), Err(Error::InvalidTxType(_))));

        let mut wrong_id = user_tx();
        wrong_id.tx_id = TxId::l1_user(4, 1);
        assert!(matches!(L1Tx::new(wrong_id), Err(Error::TxIdMismatch { .. })));
    }

    #[test]
    fn test_infer_type() {
        let mut tx = user_tx();
        tx.from_idx = AccountIdx(256);
        assert_eq!(tx.infer_type().unwrap(), TxType::Deposit);
        tx.to_idx = AccountIdx(1);
        assert_eq!(tx.infer_type().unwrap(), TxType::ForceExit);
        tx.to_idx = AccountIdx(257);
        tx.amount = U256::from(1u64);
        assert_eq!(tx.infer_type().unwrap(), TxType::CreateVouch);
        tx.amount = U256::ZERO;
        assert_eq!(tx.infer_type().unwrap(), TxType::DeleteVouch);
        tx.amount = U256::from(5u64);
        assert!(tx.infer_type().is_err());
        tx.from_idx = AccountIdx(100);
        assert!(tx.infer_type().is_err());
    }

    #[test]
    fn test_missing_batch_link() {
        let mut tx = user_tx();
        tx.to_forge_l1_txs_num = None;
        assert!(matches!(tx.calculate_tx_id(), Err(Error::InvalidL1BatchLink(_))));
        tx.user_origin = false;
        assert!(matches!(tx.calculate_tx_id(), Err(Error::InvalidL1BatchLink(_))));
        tx.batch_num = Some(BatchNum(2));
        assert_eq!(tx.calculate_tx_id().unwrap(), TxId::l1_coordinator(2, 1));
    }

    #[test]
    fn test_user_bytes() {
        let mut tx = user_tx();
        tx.from_idx = AccountIdx(300);
        tx.to_idx = AccountIdx(1);
        tx.amount = U256::from(400u64);
        let b = tx.bytes_user().unwrap();
        assert_eq!(&b[0..20], &[0xaa; 20]);
        assert_eq!(&b[52..58], &[0, 0, 0, 0, 0x01, 0x2c]);
        assert_eq!(&b[68..72], &[0; 4]);

        let parsed = L1Tx::from_bytes_user(&b).unwrap();
        assert_eq!(parsed.from_eth_addr, tx.from_eth_addr);
        assert_eq!(parsed.from_bjj, tx.from_bjj);
        assert_eq!(parsed.from_idx, tx.from_idx);
        assert_eq!(parsed.to_idx, tx.to_idx);
        assert_eq!(parsed.amount, tx.amount);
        assert_eq!(parsed.deposit_amount, tx.deposit_amount);
        assert!(parsed.user_origin);

        assert!(L1Tx::from_bytes_user(&b[1..]).is_err());
    }

    #[test]
    fn test_coordinator_bytes() {
        let tx = user_tx();
        let mut sig = [0u8; L1_COORDINATOR_SIG_BYTES];
        let b = tx.bytes_coordinator(&sig);
        let parsed = L1Tx::from_bytes_coordinator(&b, BatchNum(9), 0).unwrap();
        assert_eq!(parsed.from_bjj, tx.from_bjj);
        assert_eq!(parsed.from_eth_addr, ETH_ADDR_INTERNAL_ONLY);
        assert_eq!(parsed.tx_id, TxId::l1_coordinator(9, 0));

        sig[0] = 27;
        sig[1] = 1;
        assert!(L1Tx::from_bytes_coordinator(&tx.bytes_coordinator(&sig), BatchNum(9), 0).is_ok());
        sig[0] = 3;
        assert!(L1Tx::from_bytes_coordinator(&tx.bytes_coordinator(&sig), BatchNum(9), 0).is_err());
    }

    #[test]
    fn test_data_availability() {
        let mut tx = user_tx();
        tx.from_idx = AccountIdx(256);
        tx.to_idx = AccountIdx(1);
        tx.effective_amount = U256::from(400u64);
        let b = tx.bytes_data_availability().unwrap();
        assert_eq!(&b[..6], &[0, 1, 0, 0, 0, 1]);
        assert_eq!(b[11], 0);
        let parsed = L1Tx::from_data_availability(&b).unwrap();
        assert_eq!(parsed.from_idx, tx.from_idx);
        assert_eq!(parsed.to_idx, tx.to_idx);
        assert_eq!(parsed.effective_amount, tx.effective_amount);
    }
}
