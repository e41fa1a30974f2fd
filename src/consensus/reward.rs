// Mining-reward ledger: a flat append-only list of payouts, one per mined
// block, tracked alongside the chain so reorganizations can discard and
// replace entries in lockstep with the blocks they paid for.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiningReward {
    pub miner_id: String,
    pub block_index: usize,
    pub reward: f64,
    pub timestamp: i64,
    pub difficulty: u8,
}

/// `reward = 10.0 + 2.5 * difficulty`.
pub fn reward_for_difficulty(difficulty: u8) -> f64 {
    10.0 + 2.5 * difficulty as f64
}

/// Non-empty, <= 256 bytes, every code point printable and non-control.
pub fn validate_miner_id(miner_id: &str) -> bool {
    if miner_id.is_empty() || miner_id.len() > 256 {
        return false;
    }
    miner_id.chars().all(|c| !c.is_control() && c != '\u{7f}')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reward_formula() {
        assert_eq!(reward_for_difficulty(3), 17.5);
        assert_eq!(reward_for_difficulty(0), 10.0);
    }

    #[test]
    fn test_validate_miner_id() {
        assert!(validate_miner_id("alice"));
        assert!(!validate_miner_id(""));
        assert!(!validate_miner_id(&"a".repeat(257)));
        assert!(!validate_miner_id("bad\u{0}id"));
    }
}
