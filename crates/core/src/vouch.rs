//! Vouches between accounts and the scores they produce

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::types::{AccountIdx, BatchNum, Score as ScoreValue, VouchIdx};

/// Directed vouch `from -> to`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vouch {
    /// `(from ‖ to)` pair
    pub idx: VouchIdx,
    /// Whether the vouch is active
    pub value: bool,
    /// Batch of the last change
    pub batch_num: BatchNum,
}

impl Vouch {
    /// Leaf byte: 1 when active
    pub const fn to_byte(&self) -> u8 {
        self.value as u8
    }

    /// Value stored in the Vouch tree
    pub fn leaf_value(&self) -> U256 {
        U256::from(self.to_byte())
    }
}

/// Score of an account
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    /// Scored account
    pub idx: AccountIdx,
    /// Current value
    pub value: ScoreValue,
    /// Batch of the last change
    pub batch_num: BatchNum,
}

impl Score {
    /// 4-byte big-endian form
    pub const fn to_bytes(&self) -> [u8; 4] {
        self.value.to_be_bytes()
    }

    /// Parse the 4-byte big-endian form
    pub const fn from_bytes(idx: AccountIdx, b: [u8; 4]) -> Self {
        Self { idx, value: u32::from_be_bytes(b), batch_num: BatchNum(0) }
    }

    /// Value stored in the Score tree
    pub fn leaf_value(&self) -> U256 {
        U256::from(self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vouch_leaf() {
        let idx = VouchIdx::new(AccountIdx(256), AccountIdx(257));
        let on = Vouch { idx, value: true, batch_num: BatchNum(1) };
        let off = Vouch { value: false, ..on };
        assert_eq!(on.leaf_value(), U256::from(1u64));
        assert_eq!(off.leaf_value(), U256::ZERO);
    }

    #[test]
    fn test_score_bytes() {
        let s = Score { idx: AccountIdx(300), value: 0x01020304, batch_num: BatchNum(2) };
        assert_eq!(s.to_bytes(), [1, 2, 3, 4]);
        let parsed = Score::from_bytes(AccountIdx(300), s.to_bytes());
        assert_eq!(parsed.value, s.value);
    }
}
