//! Transaction type tags, transaction ids and the compressed tx fingerprint

use std::fmt;
use std::str::FromStr;

use alloy_primitives::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::SIGNATURE_CONSTANT;
use crate::error::{Error, Result};
use crate::float40::Float40;
use crate::types::{keccak256, AccountIdx, Nonce};

/// Length of a [`TxId`]
pub const TX_ID_LEN: usize = 33;

/// Prefix of L1 user tx ids
pub const TX_ID_PREFIX_L1_USER: u8 = 0;
/// Prefix of L1 coordinator tx ids
pub const TX_ID_PREFIX_L1_COORD: u8 = 1;
/// Prefix of L2 tx ids
pub const TX_ID_PREFIX_L2: u8 = 2;

/// Bytes of the compressed tx fingerprint
pub const TX_COMPRESSED_DATA_BYTES: usize = 29;

/// Transaction type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxType {
    /// Creates a new account and credits its deposit
    CreateAccountDeposit,
    /// Credits an existing account
    Deposit,
    /// L1-originated exit
    ForceExit,
    /// L2-originated exit
    Exit,
    /// Activates a vouch
    CreateVouch,
    /// Deactivates a vouch
    DeleteVouch,
    /// L2 transfer, decoded but not processed
    Transfer,
    /// L2 transfer to an address, decoded but not processed
    TransferToEthAddr,
}

impl TxType {
    /// Numeric tag used inside the compressed tx fingerprint
    pub const fn code(self) -> u8 {
        match self {
            Self::CreateAccountDeposit => 0,
            Self::Deposit => 1,
            Self::ForceExit => 2,
            Self::Exit => 3,
            Self::CreateVouch => 4,
            Self::DeleteVouch => 5,
            Self::Transfer => 6,
            Self::TransferToEthAddr => 7,
        }
    }

    /// Inverse of [`TxType::code`]
    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => Self::CreateAccountDeposit,
            1 => Self::Deposit,
            2 => Self::ForceExit,
            3 => Self::Exit,
            4 => Self::CreateVouch,
            5 => Self::DeleteVouch,
            6 => Self::Transfer,
            7 => Self::TransferToEthAddr,
            _ => return Err(Error::InvalidTxType(format!("code {code}"))),
        })
    }

    /// Whether the type touches the exit tree
    pub const fn is_exit(self) -> bool {
        matches!(self, Self::ForceExit | Self::Exit)
    }

    /// Whether the type touches the vouch tree
    pub const fn is_vouch(self) -> bool {
        matches!(self, Self::CreateVouch | Self::DeleteVouch)
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Transaction id: a one-byte origin prefix followed by a keccak256 digest
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxId(pub [u8; TX_ID_LEN]);

impl Default for TxId {
    fn default() -> Self {
        Self([0u8; TX_ID_LEN])
    }
}

impl TxId {
    fn with_prefix(prefix: u8, preimage: &[u8]) -> Self {
        let mut id = [0u8; TX_ID_LEN];
        id[0] = prefix;
        id[1..].copy_from_slice(&keccak256(preimage));
        Self(id)
    }

    /// Id of an L1 user tx: `keccak(to_forge_l1_txs_num_be8 ‖ position_be2)`
    pub fn l1_user(to_forge_l1_txs_num: u64, position: u16) -> Self {
        let mut b = [0u8; 10];
        b[..8].copy_from_slice(&to_forge_l1_txs_num.to_be_bytes());
        b[8..].copy_from_slice(&position.to_be_bytes());
        Self::with_prefix(TX_ID_PREFIX_L1_USER, &b)
    }

    /// Id of an L1 coordinator tx: `keccak(batch_num_be8 ‖ position_be2)`
    pub fn l1_coordinator(batch_num: u64, position: u16) -> Self {
        let mut b = [0u8; 10];
        b[..8].copy_from_slice(&batch_num.to_be_bytes());
        b[8..].copy_from_slice(&position.to_be_bytes());
        Self::with_prefix(TX_ID_PREFIX_L1_COORD, &b)
    }

    /// Id of an L2 tx: `keccak(from_idx_be3 ‖ nonce_be5)`
    pub fn l2(from_idx: AccountIdx, nonce: Nonce) -> Result<Self> {
        let mut b = [0u8; 8];
        b[..3].copy_from_slice(&from_idx.to_bytes3()?);
        b[3..].copy_from_slice(&nonce.to_bytes()?);
        Ok(Self::with_prefix(TX_ID_PREFIX_L2, &b))
    }

    /// Whether the id is all zeroes
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for TxId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw)
            .map_err(|_| Error::InvalidLength { expected: TX_ID_LEN, got: 0 })?;
        let arr: [u8; TX_ID_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidLength { expected: TX_ID_LEN, got: bytes.len() })?;
        Ok(Self(arr))
    }
}

impl Serialize for TxId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TxId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Compressed tx fingerprint written into the witness:
///
/// ```text
/// type(1) ‖ nonce_or_to_forge(5) ‖ amount_f40(5) ‖ to_idx(6) ‖ from_idx(6)
///     ‖ chain_id(2) ‖ signature_constant(4)
/// ```
pub fn tx_compressed_data(
    tx_type: TxType,
    nonce_or_to_forge: u64,
    amount: Float40,
    to_idx: AccountIdx,
    from_idx: AccountIdx,
    chain_id: u16,
) -> Result<U256> {
    let mut b = [0u8; TX_COMPRESSED_DATA_BYTES];
    b[0] = tx_type.code();
    b[1..6].copy_from_slice(&Nonce(nonce_or_to_forge).to_bytes()?);
    b[6..11].copy_from_slice(&amount.to_bytes()?);
    b[11..17].copy_from_slice(&to_idx.to_bytes()?);
    b[17..23].copy_from_slice(&from_idx.to_bytes()?);
    b[23..25].copy_from_slice(&chain_id.to_be_bytes());
    b[25..29].copy_from_slice(&SIGNATURE_CONSTANT.to_be_bytes());
    Ok(U256::from_be_slice(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_id_prefixes() {
        assert_eq!(TxId::l1_user(0, 0).0[0], TX_ID_PREFIX_L1_USER);
        assert_eq!(TxId::l1_coordinator(3, 1).0[0], TX_ID_PREFIX_L1_COORD);
        assert_eq!(TxId::l2(AccountIdx(256), Nonce(0)).unwrap().0[0], TX_ID_PREFIX_L2);
        assert_ne!(TxId::l1_user(1, 0), TxId::l1_user(0, 1));
    }

    #[test]
    fn test_tx_id_preimage() {
        let mut pre = [0u8; 10];
        pre[7] = 5;
        pre[9] = 2;
        let id = TxId::l1_user(5, 2);
        assert_eq!(&id.0[1..], &keccak256(&pre));
    }

    #[test]
    fn test_tx_id_serde() {
        let id = TxId::l2(AccountIdx(300), Nonce(9)).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert!(json.starts_with("\"0x02"));
        let back: TxId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!("0x00".parse::<TxId>().is_err());
    }

    #[test]
    fn test_tx_type_codes() {
        for t in [
            TxType::CreateAccountDeposit,
            TxType::Deposit,
            TxType::ForceExit,
            TxType::Exit,
            TxType::CreateVouch,
            TxType::DeleteVouch,
            TxType::Transfer,
            TxType::TransferToEthAddr,
        ] {
            assert_eq!(TxType::from_code(t.code()).unwrap(), t);
        }
        assert!(TxType::from_code(42).is_err());
    }

    #[test]
    fn test_tx_compressed_data_layout() {
        let v = tx_compressed_data(
            TxType::Deposit,
            3,
            Float40(10),
            AccountIdx(0),
            AccountIdx(256),
            5,
        )
        .unwrap();
        assert!(v.bit_len() <= TX_COMPRESSED_DATA_BYTES * 8);
        let b: [u8; 32] = v.to_be_bytes();
        let b = &b[32 - TX_COMPRESSED_DATA_BYTES..];
        assert_eq!(b[0], TxType::Deposit.code());
        assert_eq!(b[5], 3);
        assert_eq!(b[10], 10);
        assert_eq!(&b[21..23], &[1, 0]);
        assert_eq!(&b[23..25], &[0, 5]);
        assert_eq!(&b[25..29], &SIGNATURE_CONSTANT.to_be_bytes());
    }
}
