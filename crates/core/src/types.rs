//! Fixed-width integer types of the rollup data model

use std::fmt;

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use tiny_keccak::{Hasher, Keccak};

use crate::constants::{IDX_USER_THRESHOLD, MAX_ACCOUNT_IDX};
use crate::error::{Error, Result};

/// 32-byte hash type
pub type Hash = [u8; 32];

/// Ethereum address
pub type EthAddr = alloy_primitives::Address;

/// Compressed Baby-Jubjub public key: little-endian `Y` with the sign of `X`
/// in the most significant bit of the last byte
pub type BjjComp = [u8; 32];

/// Empty compressed key
pub const EMPTY_BJJ: BjjComp = [0u8; 32];

/// Account score
pub type Score = u32;

/// Compute keccak256 hash
pub fn keccak256(data: &[u8]) -> Hash {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Split a compressed key into its sign bit and `Y` coordinate
pub fn bjj_sign_ay(comp: &BjjComp) -> (bool, U256) {
    let mut le = *comp;
    let sign = le[31] & 0x80 != 0;
    le[31] &= 0x7f;
    (sign, U256::from_le_bytes(le))
}

/// Pack a sign bit and `Y` coordinate back into a compressed key
pub fn bjj_pack(sign: bool, ay: U256) -> BjjComp {
    let mut le: [u8; 32] = ay.to_le_bytes();
    if sign {
        le[31] |= 0x80;
    }
    le
}

/// Account index, 24 bits
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountIdx(pub u64);

impl AccountIdx {
    /// Index used by exits
    pub const EXIT: Self = Self(crate::constants::EXIT_IDX);

    /// Create an index, checking it fits in 24 bits
    pub fn new(value: u64) -> Result<Self> {
        if value > MAX_ACCOUNT_IDX {
            return Err(Error::IdxOverflow(value));
        }
        Ok(Self(value))
    }

    /// Whether the index belongs to a user account
    pub const fn is_user(self) -> bool {
        self.0 >= IDX_USER_THRESHOLD
    }

    /// 6-byte big-endian form used in the L1 wire encoding
    pub fn to_bytes(self) -> Result<[u8; 6]> {
        let idx = Self::new(self.0)?;
        let be = idx.0.to_be_bytes();
        let mut b = [0u8; 6];
        b.copy_from_slice(&be[2..]);
        Ok(b)
    }

    /// 3-byte big-endian form used by TxIDs and data availability
    pub fn to_bytes3(self) -> Result<[u8; 3]> {
        let idx = Self::new(self.0)?;
        let be = idx.0.to_be_bytes();
        let mut b = [0u8; 3];
        b.copy_from_slice(&be[5..]);
        Ok(b)
    }

    /// Parse a big-endian index of up to 8 bytes
    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        if b.len() > 8 {
            return Err(Error::InvalidLength { expected: 8, got: b.len() });
        }
        let mut be = [0u8; 8];
        be[8 - b.len()..].copy_from_slice(b);
        Self::new(u64::from_be_bytes(be))
    }

    /// Key of the index in the 32-byte tree key space
    pub fn to_u256(self) -> U256 {
        U256::from(self.0)
    }

    /// Next index, failing when the 24-bit space is exhausted
    pub fn next(self) -> Result<Self> {
        Self::new(self.0.checked_add(1).ok_or(Error::NumOverflow("account idx"))?)
    }
}

impl fmt::Display for AccountIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Vouch index: `from_idx ‖ to_idx`, 48 bits
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VouchIdx(pub u64);

impl VouchIdx {
    /// Compose the directed pair `(from, to)`
    pub const fn new(from: AccountIdx, to: AccountIdx) -> Self {
        Self((from.0 << 24) | to.0)
    }

    /// Voucher
    pub const fn from_idx(self) -> AccountIdx {
        AccountIdx(self.0 >> 24)
    }

    /// Vouchee
    pub const fn to_idx(self) -> AccountIdx {
        AccountIdx(self.0 & MAX_ACCOUNT_IDX)
    }

    /// 6-byte big-endian form
    pub fn to_bytes(self) -> [u8; 6] {
        let be = self.0.to_be_bytes();
        let mut b = [0u8; 6];
        b.copy_from_slice(&be[2..]);
        b
    }

    /// Parse the 6-byte big-endian form
    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        if b.len() != 6 {
            return Err(Error::InvalidLength { expected: 6, got: b.len() });
        }
        let mut be = [0u8; 8];
        be[2..].copy_from_slice(b);
        Ok(Self(u64::from_be_bytes(be)))
    }

    /// Key of the index in the tree key space
    pub fn to_u256(self) -> U256 {
        U256::from(self.0)
    }
}

impl fmt::Display for VouchIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.from_idx(), self.to_idx())
    }
}

/// Account nonce, 40 bits
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Nonce(pub u64);

impl Nonce {
    /// Maximum nonce value (2^40 - 1)
    pub const MAX: u64 = 0xff_ffff_ffff;

    /// 5-byte big-endian form
    pub fn to_bytes(self) -> Result<[u8; 5]> {
        if self.0 > Self::MAX {
            return Err(Error::NonceOverflow);
        }
        let be = self.0.to_be_bytes();
        let mut b = [0u8; 5];
        b.copy_from_slice(&be[3..]);
        Ok(b)
    }

    /// Parse the 5-byte big-endian form
    pub fn from_bytes(b: [u8; 5]) -> Self {
        let mut be = [0u8; 8];
        be[3..].copy_from_slice(&b);
        Self(u64::from_be_bytes(be))
    }

    /// Nonce after one more accepted tx
    pub fn checked_inc(self) -> Result<Self> {
        if self.0 >= Self::MAX {
            return Err(Error::NonceOverflow);
        }
        Ok(Self(self.0 + 1))
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Batch number
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchNum(pub u32);

impl BatchNum {
    /// 4-byte big-endian form
    pub const fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Parse a big-endian batch number of up to 8 bytes
    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        if b.len() > 8 {
            return Err(Error::InvalidLength { expected: 8, got: b.len() });
        }
        let mut be = [0u8; 8];
        be[8 - b.len()..].copy_from_slice(b);
        let n = u64::from_be_bytes(be);
        u32::try_from(n).map(Self).map_err(|_| Error::NumOverflow("batch num"))
    }

    /// Following batch number
    pub fn next(self) -> Result<Self> {
        self.0.checked_add(1).map(Self).ok_or(Error::NumOverflow("batch num"))
    }
}

impl fmt::Display for BatchNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
