//! Keccak256 hasher for SMT nodes

use alloy_primitives::U256;
use tiny_keccak::{Hasher, Keccak};

use crate::NodeHash;

/// Domain byte mixed into leaf hashes
const LEAF_PREFIX: u8 = 0x01;

/// Keccak256 hasher
#[derive(Debug)]
pub struct Keccak256Hasher;

impl Keccak256Hasher {
    /// Hash of a middle node
    pub fn hash_pair(left: &NodeHash, right: &NodeHash) -> NodeHash {
        let mut hasher = Keccak::v256();
        hasher.update(left);
        hasher.update(right);
        let mut output = [0u8; 32];
        hasher.finalize(&mut output);
        output
    }

    /// Hash of a leaf node
    pub fn hash_leaf(key: &U256, value: &U256) -> NodeHash {
        let k: [u8; 32] = key.to_be_bytes();
        let v: [u8; 32] = value.to_be_bytes();
        let mut hasher = Keccak::v256();
        hasher.update(&[LEAF_PREFIX]);
        hasher.update(&k);
        hasher.update(&v);
        let mut output = [0u8; 32];
        hasher.finalize(&mut output);
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_pair() {
        let left = [1u8; 32];
        let right = [2u8; 32];
        let hash = Keccak256Hasher::hash_pair(&left, &right);
        assert_ne!(hash, [0u8; 32]);
        assert_ne!(hash, Keccak256Hasher::hash_pair(&right, &left));
    }

    #[test]
    fn test_leaf_domain() {
        // a leaf never collides with a middle node over the same 64 bytes
        let k = U256::from(5u64);
        let v = U256::from(7u64);
        let middle = Keccak256Hasher::hash_pair(&k.to_be_bytes(), &v.to_be_bytes());
        assert_ne!(Keccak256Hasher::hash_leaf(&k, &v), middle);
    }
}
