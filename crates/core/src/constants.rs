//! Rollup protocol constants

/// Number of levels of the account, score and exit trees
pub const NLEVELS: u32 = 24;

/// Number of levels of the vouch tree, keyed by a 48-bit `(from ‖ to)` index
pub const VOUCH_NLEVELS: u32 = 48;

/// Maximum value of an account index (2^24 - 1)
pub const MAX_ACCOUNT_IDX: u64 = (1 << NLEVELS) - 1;

/// First index that can be assigned to a user account
pub const IDX_USER_THRESHOLD: u64 = 256;

/// Last reserved index, the initial value of the idx counters
pub const RESERVED_IDX: u64 = 255;

/// Index used as `to_idx` by exits
pub const EXIT_IDX: u64 = 1;

/// Maximum number of L1 user txs queued for a single batch
pub const MAX_L1_USER_TX: usize = 128;

/// Maximum number of L1 txs (user + coordinator) in a batch
pub const MAX_L1_TX: usize = 256;

/// Bytes of an L1 user tx as emitted by `L1UserTxEvent`
pub const L1_USER_TOTAL_BYTES: usize = 78;

/// Bytes of an L1 coordinator tx in `forgeBatch` calldata
pub const L1_COORDINATOR_TOTAL_BYTES: usize = 101;

/// Maximum withdrawal delay in seconds (2 weeks)
pub const MAX_WITHDRAWAL_DELAY: u64 = 2 * 7 * 24 * 60 * 60;

/// Bytes of an account index in data-availability encodings
pub const IDX_BYTES_DA: usize = (NLEVELS / 8) as usize;

/// Bytes of an L1 or L2 tx in the `forgeBatch` data-availability section
pub const L1L2_TX_DA_BYTES: usize = IDX_BYTES_DA * 2 + crate::float40::FLOAT40_BYTES + 1;

/// Constant mixed into every compressed tx
pub const SIGNATURE_CONSTANT: u32 = 3_322_668_559;

/// Number of 32-byte words in an account leaf
pub const N_ACCOUNT_LEAF_ELEMS: usize = 4;

/// Maximum number of bytes of a balance (192 bits)
pub const MAX_BALANCE_BYTES: usize = 24;

/// Address given to accounts created by a coordinator without an Ethereum
/// owner
pub const ETH_ADDR_INTERNAL_ONLY: crate::types::EthAddr =
    alloy_primitives::Address::new([0xff; 20]);
