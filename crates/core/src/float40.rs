//! Float40: 40-bit packed decimal floating point used for on-chain amounts
//!
//! A value is encoded as `e * 2^35 + m` and represents `m * 10^e`, with
//! `m < 2^35` and `e <= 31`.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Bytes of a packed Float40
pub const FLOAT40_BYTES: usize = 5;

/// Mantissa threshold (2^35)
const THRES: u64 = 0x08_0000_0000;

/// Largest exponent
const MAX_EXPONENT: u64 = 31;

/// Packed Float40
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Float40(pub u64);

impl Float40 {
    /// Maximum packed value (2^40 - 1)
    pub const MAX: u64 = 0xff_ffff_ffff;

    /// 5-byte big-endian form
    pub fn to_bytes(self) -> Result<[u8; FLOAT40_BYTES]> {
        if self.0 > Self::MAX {
            return Err(Error::Float40Overflow);
        }
        let be = self.0.to_be_bytes();
        let mut b = [0u8; FLOAT40_BYTES];
        b.copy_from_slice(&be[3..]);
        Ok(b)
    }

    /// Parse the 5-byte big-endian form
    pub fn from_bytes(b: [u8; FLOAT40_BYTES]) -> Self {
        let mut be = [0u8; 8];
        be[3..].copy_from_slice(&b);
        Self(u64::from_be_bytes(be))
    }

    /// Parse from a slice, checking its length
    pub fn from_slice(b: &[u8]) -> Result<Self> {
        let arr: [u8; FLOAT40_BYTES] = b
            .try_into()
            .map_err(|_| Error::InvalidLength { expected: FLOAT40_BYTES, got: b.len() })?;
        Ok(Self::from_bytes(arr))
    }

    /// Decoded amount `m * 10^e`
    pub fn to_u256(self) -> Result<U256> {
        if self.0 > Self::MAX {
            return Err(Error::Float40Overflow);
        }
        let m = self.0 % THRES;
        let e = self.0 / THRES;
        Ok(U256::from(m) * U256::from(10u64).pow(U256::from(e)))
    }

    /// Lossless encoding of an amount
    pub fn from_u256(value: U256) -> Result<Self> {
        let thres = U256::from(THRES);
        let ten = U256::from(10u64);
        let mut m = value;
        let mut e = 0u64;
        while m % ten == U256::ZERO && m >= thres {
            m /= ten;
            e += 1;
        }
        if e > MAX_EXPONENT {
            return Err(Error::Float40ExponentTooLarge);
        }
        if m >= thres {
            return Err(Error::Float40NotEnoughPrecision);
        }
        Ok(Self(m.as_limbs()[0] + e * THRES))
    }

    /// Largest representable amount that is `<= value`
    pub fn from_u256_floor(value: U256) -> Result<Self> {
        let thres = U256::from(THRES);
        let ten = U256::from(10u64);
        let mut m = value;
        let mut e = 0u64;
        while m >= thres {
            m /= ten;
            e += 1;
        }
        if e > MAX_EXPONENT {
            return Err(Error::Float40ExponentTooLarge);
        }
        Ok(Self(m.as_limbs()[0] + e * THRES))
    }

    /// Round an amount down to something representable
    pub fn round_u256(value: U256) -> Result<U256> {
        Self::from_u256_floor(value)?.to_u256()
    }
}
