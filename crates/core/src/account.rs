//! Rollup accounts and their Merkle leaf encoding

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_BALANCE_BYTES, N_ACCOUNT_LEAF_ELEMS};
use crate::error::{Error, Result};
use crate::types::{bjj_pack, bjj_sign_ay, keccak256, AccountIdx, BatchNum, BjjComp, EthAddr, Nonce};

/// Bytes of a serialized account leaf
pub const ACCOUNT_LEAF_BYTES: usize = 32 * N_ACCOUNT_LEAF_ELEMS;

/// Account stored in the Account tree at key `idx`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Index of the leaf
    pub idx: AccountIdx,
    /// Owner address
    pub eth_addr: EthAddr,
    /// Owner Baby-Jubjub key
    pub bjj: BjjComp,
    /// Number of accepted txs sent from the account
    pub nonce: Nonce,
    /// Balance, at most 192 bits
    pub balance: U256,
    /// Batch in which the account was created
    pub batch_num: BatchNum,
}

impl Account {
    /// Leaf layout:
    ///
    /// ```text
    /// [0..22)    zero
    /// [22]       bjj sign
    /// [23..28)   nonce
    /// [28..32)   zero
    /// [32..64)   balance, big-endian, top 8 bytes zero
    /// [64..96)   ay, big-endian
    /// [96..108)  zero
    /// [108..128) eth address
    /// ```
    pub fn to_bytes(&self) -> Result<[u8; ACCOUNT_LEAF_BYTES]> {
        let mut b = [0u8; ACCOUNT_LEAF_BYTES];
        let (sign, ay) = bjj_sign_ay(&self.bjj);
        if sign {
            b[22] = 1;
        }
        b[23..28].copy_from_slice(&self.nonce.to_bytes()?);

        if self.balance.bit_len() > MAX_BALANCE_BYTES * 8 {
            return Err(Error::NumOverflow("balance"));
        }
        let balance: [u8; 32] = self.balance.to_be_bytes();
        b[32..64].copy_from_slice(&balance);

        let ay: [u8; 32] = ay.to_be_bytes();
        b[64..96].copy_from_slice(&ay);
        b[108..128].copy_from_slice(self.eth_addr.as_slice());
        Ok(b)
    }

    /// Parse a leaf. `idx` and `batch_num` are not part of the leaf and are
    /// left at their defaults.
    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        if b.len() != ACCOUNT_LEAF_BYTES {
            return Err(Error::InvalidLength { expected: ACCOUNT_LEAF_BYTES, got: b.len() });
        }
        let sign = b[22] == 1;
        let mut nonce = [0u8; 5];
        nonce.copy_from_slice(&b[23..28]);
        if b[32..32 + (32 - MAX_BALANCE_BYTES)].iter().any(|x| *x != 0) {
            return Err(Error::NumOverflow("balance"));
        }
        let balance = U256::from_be_slice(&b[32..64]);
        let ay = U256::from_be_slice(&b[64..96]);
        let eth_addr = EthAddr::from_slice(&b[108..128]);
        Ok(Self {
            idx: AccountIdx::default(),
            eth_addr,
            bjj: bjj_pack(sign, ay),
            nonce: Nonce::from_bytes(nonce),
            balance,
            batch_num: BatchNum::default(),
        })
    }

    /// Value stored in the Account tree: keccak256 of the leaf bytes
    pub fn hash_value(&self) -> Result<U256> {
        let b = self.to_bytes()?;
        Ok(U256::from_be_bytes(keccak256(&b)))
    }
}

/// Account change produced by a batch, handed to the history store
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountUpdate {
    /// L1 block of the forge
    pub eth_block_num: u64,
    /// Batch that produced the change
    pub batch_num: BatchNum,
    /// Changed account
    pub idx: AccountIdx,
    /// Nonce after the batch
    pub nonce: Nonce,
    /// Balance after the batch
    pub balance: U256,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Account {
        let mut bjj = [0x11u8; 32];
        bjj[31] = 0x91;
        Account {
            idx: AccountIdx(256),
            eth_addr: EthAddr::repeat_byte(0xaa),
            bjj,
            nonce: Nonce(7),
            balance: U256::from(1000u64),
            batch_num: BatchNum(1),
        }
    }

    #[test]
    fn test_account_bytes() {
        let account = sample();
        let b = account.to_bytes().unwrap();
        assert_eq!(b[22], 1);
        assert_eq!(&b[23..28], &[0, 0, 0, 0, 7]);
        assert_eq!(&b[62..64], &[0x03, 0xe8]);
        assert_eq!(&b[108..128], &[0xaa; 20]);

        let parsed = Account::from_bytes(&b).unwrap();
        assert_eq!(parsed.eth_addr, account.eth_addr);
        assert_eq!(parsed.bjj, account.bjj);
        assert_eq!(parsed.nonce, account.nonce);
        assert_eq!(parsed.balance, account.balance);
    }

    #[test]
    fn test_balance_overflow() {
        let mut account = sample();
        account.balance = U256::from(1u64) << 192;
        assert_eq!(account.to_bytes(), Err(Error::NumOverflow("balance")));
        account.balance = (U256::from(1u64) << 192) - U256::from(1u64);
        assert!(account.to_bytes().is_ok());
    }

    #[test]
    fn test_hash_value_changes_with_balance() {
        let a = sample();
        let mut b = sample();
        b.balance += U256::from(1u64);
        assert_ne!(a.hash_value().unwrap(), b.hash_value().unwrap());
        // idx and batch_num are not part of the leaf
        let mut c = sample();
        c.batch_num = BatchNum(9);
        assert_eq!(a.hash_value().unwrap(), c.hash_value().unwrap());
    }
}
