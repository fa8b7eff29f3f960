//! Witness inputs for the batch proof
//!
//! Every per-tx array is sized for `max_tx` slots and every intermediate-state
//! array for `max_tx - 1`: the output of the last tx is never fed to another.
//! Slots that a batch does not use keep their zero values.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::types::BatchNum;

/// Sizes and raw outputs that travel next to the inputs but are not part of
/// them
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZKMetadata {
    /// Account tree depth
    pub n_levels: usize,
    /// `n_levels + 1`, the length of every sibling array
    pub max_levels: usize,
    /// Tx slots
    pub max_tx: usize,
    /// L1 tx slots
    pub max_l1_tx: usize,
    /// Chain the txs are signed for
    pub chain_id: u16,
    /// Data-availability bytes of each L1 tx
    pub l1_txs_data_availability: Vec<Vec<u8>>,
    /// Data-availability bytes of each L2 tx
    pub l2_txs_data: Vec<Vec<u8>>,
    /// Last account idx after the batch
    pub new_last_idx_raw: u64,
    /// Account root after the batch
    pub new_state_root_raw: U256,
    /// Exit root of the batch
    pub new_exit_root_raw: U256,
}

/// Inputs of the batch proof
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZKInputs {
    /// Sizes and raw outputs
    #[serde(skip)]
    pub metadata: ZKMetadata,

    /// Batch being proved
    pub current_num_batch: u32,
    /// Last account idx before the batch
    pub old_last_idx: u64,
    /// Account root before the batch
    pub old_account_root: U256,
    /// Vouch root before the batch
    pub old_vouch_root: U256,
    /// Score root before the batch
    pub old_score_root: U256,
    /// Chain id
    #[serde(rename = "globalChainID")]
    pub global_chain_id: u16,

    // Txs
    /// Packed tx fields
    pub tx_compressed_data: Vec<U256>,
    /// Last batch an L2 tx may be forged in
    pub max_num_batch: Vec<u32>,
    /// Sender idx
    pub from_idx: Vec<u64>,
    /// Idx allocated by account-creating txs
    pub aux_from_idx: Vec<u64>,
    /// Receiver idx
    pub to_idx: Vec<u64>,
    /// Receiver resolved from an address
    pub aux_to_idx: Vec<u64>,
    /// Receiver key `y`
    pub to_bjj_ay: Vec<U256>,
    /// Receiver address
    pub to_eth_addr: Vec<U256>,
    /// Amount as Float40
    pub amount_f: Vec<U256>,
    /// Slot is an L1 tx the circuit treats as on-chain
    pub on_chain: Vec<bool>,

    // L1 txs
    /// Slot creates an account
    pub new_account: Vec<bool>,
    /// Deposit as Float40
    #[serde(rename = "loadAmountF")]
    pub deposit_amount_f: Vec<U256>,
    /// Sender address of an L1 tx
    pub from_eth_addr: Vec<U256>,
    /// 256 little-endian bits of the sender key
    pub from_bjj_compressed: Vec<Vec<u8>>,

    // L2 txs
    /// Signature `S`
    pub s: Vec<U256>,
    /// Signature `R8.x`
    pub r8x: Vec<U256>,
    /// Signature `R8.y`
    pub r8y: Vec<U256>,

    // State 1: sender leaf before the update
    /// Sender nonce
    pub nonce1: Vec<u64>,
    /// Sender key sign
    pub sign1: Vec<bool>,
    /// Sender key `y`
    pub ay1: Vec<U256>,
    /// Sender balance
    pub balance1: Vec<U256>,
    /// Sender address
    pub eth_addr1: Vec<U256>,
    /// Sender path
    pub siblings1: Vec<Vec<U256>>,
    /// Sender insert hit an empty node
    #[serde(rename = "isOld0_1")]
    pub is_old0_1: Vec<bool>,
    /// Leaf met by the sender insert
    pub old_key1: Vec<U256>,
    /// Value of that leaf
    pub old_value1: Vec<U256>,

    // State 2: receiver leaf, or exit leaf for exits
    /// Receiver or exit leaf nonce
    pub nonce2: Vec<u64>,
    /// Receiver or exit leaf key sign
    pub sign2: Vec<bool>,
    /// Receiver or exit leaf key `y`
    pub ay2: Vec<U256>,
    /// Receiver or exit leaf balance before the tx
    pub balance2: Vec<U256>,
    /// Receiver or exit leaf address
    pub eth_addr2: Vec<U256>,
    /// Receiver or exit leaf path
    pub siblings2: Vec<Vec<U256>>,
    /// Exit insert hit an empty node
    #[serde(rename = "isOld0_2")]
    pub is_old0_2: Vec<bool>,
    /// Leaf met by the exit insert
    pub old_key2: Vec<U256>,
    /// Value of that leaf
    pub old_value2: Vec<U256>,

    // Vouch
    /// Vouch was active before the tx
    pub vouch_exists: Vec<bool>,
    /// Vouch path
    pub vouch_siblings: Vec<Vec<U256>>,

    // Scores: 1 sender, 2 receiver
    /// Sender score
    pub score1: Vec<u32>,
    /// Sender score path
    pub score_siblings1: Vec<Vec<U256>>,
    /// Receiver score
    pub score2: Vec<u32>,
    /// Receiver score path
    pub score_siblings2: Vec<Vec<U256>>,

    // Intermediate states
    /// Slot was an L1 tx
    #[serde(rename = "imOnChain")]
    pub is_on_chain: Vec<bool>,
    /// Last account idx after the slot
    #[serde(rename = "imOutIdx")]
    pub is_out_idx: Vec<u64>,
    /// Account root after the slot
    #[serde(rename = "imAccountRoot")]
    pub is_state_root_account: Vec<U256>,
    /// Vouch root after the slot
    #[serde(rename = "imVouchRoot")]
    pub is_state_root_vouch: Vec<U256>,
    /// Score root after the slot
    #[serde(rename = "imScoreRoot")]
    pub is_state_root_score: Vec<U256>,
    /// Exit root after the slot
    #[serde(rename = "imExitRoot")]
    pub is_exit_root: Vec<U256>,
}

impl ZKInputs {
    /// Zero-filled inputs for a batch of up to `max_tx` txs over trees of
    /// `n_levels` (and `vouch_n_levels` for the vouch tree)
    pub fn new(
        chain_id: u16,
        max_tx: usize,
        max_l1_tx: usize,
        n_levels: usize,
        vouch_n_levels: usize,
        current_num_batch: BatchNum,
    ) -> Self {
        let zeros = |n: usize| vec![U256::ZERO; n];
        let siblings = |n: usize| vec![vec![U256::ZERO; n + 1]; max_tx];
        let is_len = max_tx.saturating_sub(1);
        Self {
            metadata: ZKMetadata {
                n_levels,
                max_levels: n_levels + 1,
                max_tx,
                max_l1_tx,
                chain_id,
                ..Default::default()
            },
            current_num_batch: current_num_batch.0,
            global_chain_id: chain_id,
            old_last_idx: 0,
            old_account_root: U256::ZERO,
            old_vouch_root: U256::ZERO,
            old_score_root: U256::ZERO,

            tx_compressed_data: zeros(max_tx),
            max_num_batch: vec![0; max_tx],
            from_idx: vec![0; max_tx],
            aux_from_idx: vec![0; max_tx],
            to_idx: vec![0; max_tx],
            aux_to_idx: vec![0; max_tx],
            to_bjj_ay: zeros(max_tx),
            to_eth_addr: zeros(max_tx),
            amount_f: zeros(max_tx),
            on_chain: vec![false; max_tx],

            new_account: vec![false; max_tx],
            deposit_amount_f: zeros(max_tx),
            from_eth_addr: zeros(max_tx),
            from_bjj_compressed: vec![vec![0u8; 256]; max_tx],

            s: zeros(max_tx),
            r8x: zeros(max_tx),
            r8y: zeros(max_tx),

            nonce1: vec![0; max_tx],
            sign1: vec![false; max_tx],
            ay1: zeros(max_tx),
            balance1: zeros(max_tx),
            eth_addr1: zeros(max_tx),
            siblings1: siblings(n_levels),
            is_old0_1: vec![false; max_tx],
            old_key1: zeros(max_tx),
            old_value1: zeros(max_tx),

            nonce2: vec![0; max_tx],
            sign2: vec![false; max_tx],
            ay2: zeros(max_tx),
            balance2: zeros(max_tx),
            eth_addr2: zeros(max_tx),
            siblings2: siblings(n_levels),
            is_old0_2: vec![false; max_tx],
            old_key2: zeros(max_tx),
            old_value2: zeros(max_tx),

            vouch_exists: vec![false; max_tx],
            vouch_siblings: siblings(vouch_n_levels),

            score1: vec![0; max_tx],
            score_siblings1: siblings(n_levels),
            score2: vec![0; max_tx],
            score_siblings2: siblings(n_levels),

            is_on_chain: vec![false; is_len],
            is_out_idx: vec![0; is_len],
            is_state_root_account: zeros(is_len),
            is_state_root_vouch: zeros(is_len),
            is_state_root_score: zeros(is_len),
            is_exit_root: zeros(is_len),
        }
    }
}

/// Bits of a 32-byte value, least significant first
pub fn bits_le(b: &[u8; 32]) -> Vec<u8> {
    (0..256).map(|i| (b[i / 8] >> (i % 8)) & 1).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zk_inputs_sizes() {
        let zki = ZKInputs::new(5, 8, 4, 24, 48, BatchNum(3));
        assert_eq!(zki.current_num_batch, 3);
        assert_eq!(zki.tx_compressed_data.len(), 8);
        assert_eq!(zki.siblings1[0].len(), 25);
        assert_eq!(zki.vouch_siblings[7].len(), 49);
        assert_eq!(zki.is_state_root_account.len(), 7);
        assert_eq!(zki.from_bjj_compressed[0].len(), 256);
        assert!(zki.balance2.iter().all(|v| v.is_zero()));
    }

    #[test]
    fn test_zk_inputs_json_names() {
        let zki = ZKInputs::new(0, 2, 1, 24, 48, BatchNum(1));
        let json = serde_json::to_value(&zki).unwrap();
        assert!(json.get("imAccountRoot").is_some());
        assert!(json.get("loadAmountF").is_some());
        assert!(json.get("isOld0_1").is_some());
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn test_bits_le() {
        let mut b = [0u8; 32];
        b[0] = 0b101;
        b[31] = 0x80;
        let bits = bits_le(&b);
        assert_eq!(&bits[..3], &[1, 0, 1]);
        assert_eq!(bits[255], 1);
    }
}
