//! Compressed sparse Merkle tree
//!
//! A leaf sits at the shortest prefix of its key bits (least significant bit
//! first) that no other key shares, so a tree of `n` leaves has depth
//! `O(log n)` rather than `max_levels`.

use alloy_primitives::U256;

use crate::error::{Result, SmtError};
use crate::hasher::Keccak256Hasher;
use crate::proof::{circom_siblings, CircomProcessorProof, CircomVerifierProof, Proof};
use crate::storage::Storage;
use crate::{hash_to_u256, NodeHash, EMPTY_NODE};

/// Storage key of the current root
pub const ROOT_KEY: &[u8] = b"currentroot";

const NODE_MIDDLE: u8 = 0;
const NODE_LEAF: u8 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Node {
    Empty,
    Leaf(U256, U256),
    Middle(NodeHash, NodeHash),
}

impl Node {
    fn hash(&self) -> NodeHash {
        match self {
            Self::Empty => EMPTY_NODE,
            Self::Leaf(k, v) => Keccak256Hasher::hash_leaf(k, v),
            Self::Middle(l, r) => Keccak256Hasher::hash_pair(l, r),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(65);
        match self {
            Self::Empty => {}
            Self::Leaf(k, v) => {
                b.push(NODE_LEAF);
                b.extend_from_slice(&k.to_be_bytes::<32>());
                b.extend_from_slice(&v.to_be_bytes::<32>());
            }
            Self::Middle(l, r) => {
                b.push(NODE_MIDDLE);
                b.extend_from_slice(l);
                b.extend_from_slice(r);
            }
        }
        b
    }

    fn from_bytes(b: &[u8]) -> Result<Self> {
        if b.len() != 65 {
            return Err(SmtError::InvalidNode(format!("length {}", b.len())));
        }
        match b[0] {
            NODE_LEAF => {
                Ok(Self::Leaf(U256::from_be_slice(&b[1..33]), U256::from_be_slice(&b[33..])))
            }
            NODE_MIDDLE => {
                let mut l = [0u8; 32];
                let mut r = [0u8; 32];
                l.copy_from_slice(&b[1..33]);
                r.copy_from_slice(&b[33..]);
                Ok(Self::Middle(l, r))
            }
            t => Err(SmtError::InvalidNode(format!("type {t}"))),
        }
    }
}

/// Where the path of a key ends
#[derive(Debug)]
struct Walk {
    /// Siblings from the root down, one per traversed middle node
    siblings: Vec<NodeHash>,
    /// Leaf found at the end of the path, if any
    leaf: Option<(U256, U256)>,
}

/// Sparse Merkle tree over a [`Storage`]
#[derive(Debug)]
pub struct MerkleTree<S> {
    storage: S,
    root: NodeHash,
    max_levels: usize,
}

impl<S: Storage> MerkleTree<S> {
    /// Open a tree, restoring the root persisted in `storage`
    pub fn new(storage: S, max_levels: usize) -> Result<Self> {
        let root = match storage.get(ROOT_KEY)? {
            Some(b) if b.len() == 32 => {
                let mut r = [0u8; 32];
                r.copy_from_slice(&b);
                r
            }
            Some(b) => return Err(SmtError::InvalidNode(format!("root length {}", b.len()))),
            None => EMPTY_NODE,
        };
        Ok(Self { storage, root, max_levels })
    }

    /// Current root
    pub fn root(&self) -> U256 {
        hash_to_u256(&self.root)
    }

    /// Number of key bits the tree distinguishes
    pub const fn max_levels(&self) -> usize {
        self.max_levels
    }

    /// Backing storage
    pub const fn storage(&self) -> &S {
        &self.storage
    }

    fn node(&self, hash: &NodeHash) -> Result<Node> {
        if *hash == EMPTY_NODE {
            return Ok(Node::Empty);
        }
        match self.storage.get(hash)? {
            Some(b) => Node::from_bytes(&b),
            None => Err(SmtError::InvalidNode(format!("missing node {}", hex::encode(hash)))),
        }
    }

    fn walk(&self, key: &U256) -> Result<Walk> {
        let mut siblings = Vec::new();
        let mut current = self.root;
        for lvl in 0..=self.max_levels {
            match self.node(&current)? {
                Node::Empty => return Ok(Walk { siblings, leaf: None }),
                Node::Leaf(k, v) => return Ok(Walk { siblings, leaf: Some((k, v)) }),
                Node::Middle(l, r) => {
                    if key.bit(lvl) {
                        siblings.push(l);
                        current = r;
                    } else {
                        siblings.push(r);
                        current = l;
                    }
                }
            }
        }
        Err(SmtError::ReachedMaxLevel)
    }

    /// Hash `node` at depth `siblings.len()` up to a new root, collecting
    /// the middle nodes to persist
    fn climb(
        key: &U256,
        mut node: NodeHash,
        siblings: &[NodeHash],
        writes: &mut Vec<(Vec<u8>, Vec<u8>)>,
    ) -> NodeHash {
        for (lvl, sibling) in siblings.iter().enumerate().rev() {
            let middle = if key.bit(lvl) {
                Node::Middle(*sibling, node)
            } else {
                Node::Middle(node, *sibling)
            };
            node = middle.hash();
            writes.push((node.to_vec(), middle.to_bytes()));
        }
        node
    }

    fn commit(&mut self, root: NodeHash, mut writes: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        writes.push((ROOT_KEY.to_vec(), root.to_vec()));
        self.storage.put_batch(writes)?;
        self.root = root;
        Ok(())
    }

    /// Insert a new leaf and return the insertion proof
    pub fn add(&mut self, key: U256, value: U256) -> Result<CircomProcessorProof> {
        let walk = self.walk(&key)?;
        let old_root = self.root();
        let siblings: Vec<U256> = walk.siblings.iter().map(hash_to_u256).collect();
        let depth = walk.siblings.len();

        let mut writes = Vec::new();
        let new_leaf = Node::Leaf(key, value);
        writes.push((new_leaf.hash().to_vec(), new_leaf.to_bytes()));

        let (bottom, path) = match walk.leaf {
            Some((old_key, _)) if old_key == key => return Err(SmtError::KeyAlreadyExists),
            Some((old_key, old_value)) => {
                // push both leaves down until their paths split
                let split = (depth..self.max_levels)
                    .find(|lvl| key.bit(*lvl) != old_key.bit(*lvl))
                    .ok_or(SmtError::ReachedMaxLevel)?;
                let old_hash = Node::Leaf(old_key, old_value).hash();
                let middle = if key.bit(split) {
                    Node::Middle(old_hash, new_leaf.hash())
                } else {
                    Node::Middle(new_leaf.hash(), old_hash)
                };
                let mut path = walk.siblings.clone();
                path.resize(split, EMPTY_NODE);
                let hash = middle.hash();
                writes.push((hash.to_vec(), middle.to_bytes()));
                (hash, path)
            }
            None => (new_leaf.hash(), walk.siblings.clone()),
        };

        let new_root = Self::climb(&key, bottom, &path, &mut writes);
        self.commit(new_root, writes)?;

        let (old_key, old_value) = walk.leaf.unwrap_or_default();
        Ok(CircomProcessorProof {
            old_root,
            new_root: self.root(),
            siblings: circom_siblings(&siblings, self.max_levels),
            old_key,
            old_value,
            new_key: key,
            new_value: value,
            is_old0: walk.leaf.is_none(),
            fnc: 2,
        })
    }

    /// Replace the value of an existing leaf and return the update proof
    pub fn update(&mut self, key: U256, value: U256) -> Result<CircomProcessorProof> {
        let walk = self.walk(&key)?;
        let old_value = match walk.leaf {
            Some((k, v)) if k == key => v,
            _ => return Err(SmtError::KeyNotFound),
        };
        let old_root = self.root();

        let mut writes = Vec::new();
        let leaf = Node::Leaf(key, value);
        writes.push((leaf.hash().to_vec(), leaf.to_bytes()));
        let new_root = Self::climb(&key, leaf.hash(), &walk.siblings, &mut writes);
        self.commit(new_root, writes)?;

        let siblings: Vec<U256> = walk.siblings.iter().map(hash_to_u256).collect();
        Ok(CircomProcessorProof {
            old_root,
            new_root: self.root(),
            siblings: circom_siblings(&siblings, self.max_levels),
            old_key: key,
            old_value,
            new_key: key,
            new_value: value,
            is_old0: false,
            fnc: 1,
        })
    }

    /// Value and siblings of a key
    pub fn get(&self, key: U256) -> Result<(U256, U256, Vec<U256>)> {
        let walk = self.walk(&key)?;
        match walk.leaf {
            Some((k, v)) if k == key => {
                Ok((k, v, walk.siblings.iter().map(hash_to_u256).collect()))
            }
            _ => Err(SmtError::KeyNotFound),
        }
    }

    /// Membership or non-membership proof of `key` against the current root,
    /// with the value found
    pub fn generate_proof(&self, key: U256) -> Result<(Proof, U256)> {
        let walk = self.walk(&key)?;
        let siblings = walk.siblings.iter().map(hash_to_u256).collect();
        Ok(match walk.leaf {
            Some((k, v)) if k == key => (Proof { existence: true, siblings, node_aux: None }, v),
            Some(aux) => (Proof { existence: false, siblings, node_aux: Some(aux) }, U256::ZERO),
            None => (Proof { existence: false, siblings, node_aux: None }, U256::ZERO),
        })
    }

    /// Proof of `key` with siblings padded to `max_levels + 1`
    pub fn generate_circom_verifier_proof(&self, key: U256) -> Result<CircomVerifierProof> {
        let (proof, value) = self.generate_proof(key)?;
        let (old_key, old_value) = proof.node_aux.unwrap_or_default();
        Ok(CircomVerifierProof {
            root: self.root(),
            siblings: circom_siblings(&proof.siblings, self.max_levels),
            old_key,
            old_value,
            is_old0: !proof.existence && proof.node_aux.is_none(),
            key,
            value,
            fnc: if proof.existence { 0 } else { 1 },
        })
    }
}
