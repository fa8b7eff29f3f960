//! Sparse Merkle Tree (SMT) implementation for the rollup state
//!
//! Compressed binary tree keyed by integers, with Keccak256 node hashing.
//! Key features:
//! - Pluggable storage: sled under a key prefix, or memory
//! - Persistent root: reopening a tree on a rewound store restores its root
//! - Circuit friendly proofs: insert/update processor proofs and verifier
//!   proofs with siblings padded to `max_levels + 1`

mod error;
mod hasher;
mod proof;
mod storage;
mod tree;

use alloy_primitives::U256;

pub use error::{Result, SmtError};
pub use hasher::Keccak256Hasher;
pub use proof::{circom_siblings, verify_proof, CircomProcessorProof, CircomVerifierProof, Proof};
pub use storage::{MemoryStorage, SledStorage, Storage};
pub use tree::{MerkleTree, ROOT_KEY};

/// Hash of a tree node
pub type NodeHash = [u8; 32];

/// Hash of the empty node
pub const EMPTY_NODE: NodeHash = [0u8; 32];

/// Node hash as an integer
pub fn hash_to_u256(h: &NodeHash) -> U256 {
    U256::from_be_bytes(*h)
}

/// Integer as a node hash
pub fn u256_to_hash(v: &U256) -> NodeHash {
    v.to_be_bytes()
}
