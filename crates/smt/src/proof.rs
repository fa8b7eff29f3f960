//! Merkle proofs in the shapes the circuit expects

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::hasher::Keccak256Hasher;
use crate::{hash_to_u256, u256_to_hash, EMPTY_NODE};

/// Membership or non-membership proof
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Whether the key has a leaf
    pub existence: bool,
    /// Siblings from the root down to the leaf position
    pub siblings: Vec<U256>,
    /// Leaf found at the key's position when it belongs to another key
    pub node_aux: Option<(U256, U256)>,
}

impl Proof {
    /// Root implied by the proof for `(key, value)`
    pub fn compute_root(&self, key: &U256, value: &U256) -> U256 {
        let mut current = if self.existence {
            Keccak256Hasher::hash_leaf(key, value)
        } else if let Some((k, v)) = &self.node_aux {
            Keccak256Hasher::hash_leaf(k, v)
        } else {
            EMPTY_NODE
        };
        for (lvl, sibling) in self.siblings.iter().enumerate().rev() {
            let sibling = u256_to_hash(sibling);
            current = if key.bit(lvl) {
                Keccak256Hasher::hash_pair(&sibling, &current)
            } else {
                Keccak256Hasher::hash_pair(&current, &sibling)
            };
        }
        hash_to_u256(&current)
    }
}

/// Check a proof against a root
pub fn verify_proof(root: U256, proof: &Proof, key: U256, value: U256) -> bool {
    if let Some((aux_key, _)) = &proof.node_aux {
        if proof.existence || *aux_key == key {
            return false;
        }
    }
    proof.compute_root(&key, &value) == root
}

/// Pad siblings with zeroes to `max_levels + 1` entries
pub fn circom_siblings(siblings: &[U256], max_levels: usize) -> Vec<U256> {
    let mut out = siblings.to_vec();
    out.resize(max_levels + 1, U256::ZERO);
    out
}

/// Proof of an insertion (`fnc = 2`) or an update (`fnc = 1`)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircomProcessorProof {
    /// Root before the write
    pub old_root: U256,
    /// Root after the write
    pub new_root: U256,
    /// Padded to `max_levels + 1`
    pub siblings: Vec<U256>,
    /// Leaf met by an insert, or the updated key
    pub old_key: U256,
    /// Value of that leaf before the write
    pub old_value: U256,
    /// Written key
    pub new_key: U256,
    /// Written value
    pub new_value: U256,
    /// No leaf sat at the insertion point
    pub is_old0: bool,
    /// 2 for an insert, 1 for an update
    pub fnc: u8,
}

/// Proof of inclusion (`fnc = 0`) or exclusion (`fnc = 1`)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircomVerifierProof {
    /// Root the proof is against
    pub root: U256,
    /// Padded to `max_levels + 1`
    pub siblings: Vec<U256>,
    /// Leaf met instead of `key` in a non-membership proof
    pub old_key: U256,
    /// Value of that leaf
    pub old_value: U256,
    /// The path ends on an empty node
    pub is_old0: bool,
    /// Proved key
    pub key: U256,
    /// Value at `key`, zero when absent
    pub value: U256,
    /// 0 for membership, 1 for non-membership
    pub fnc: u8,
}

impl CircomVerifierProof {
    /// Recompute the root from the proof
    pub fn verify(&self) -> bool {
        let siblings: Vec<U256> = {
            let used = self.siblings.iter().rposition(|s| !s.is_zero()).map_or(0, |i| i + 1);
            self.siblings[..used].to_vec()
        };
        let proof = Proof {
            existence: self.fnc == 0,
            siblings,
            node_aux: (self.fnc == 1 && !self.is_old0).then_some((self.old_key, self.old_value)),
        };
        verify_proof(self.root, &proof, self.key, self.value)
    }
}
