// The genesis block: index 0, empty previous hash, fixed payload, unmined.

use crate::config::GENESIS_DATA;
use crate::primitives::block::Block;

pub fn create_genesis_block(timestamp: i64) -> Block {
    Block::new(timestamp, GENESIS_DATA.as_bytes().to_vec(), Vec::new(), 0, 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_shape() {
        let genesis = create_genesis_block(1_700_000_000);
        assert!(genesis.prev_hash.is_empty());
        assert_eq!(genesis.data, GENESIS_DATA.as_bytes());
        assert_eq!(genesis.nonce, 0);
        assert!(genesis.hash_is_valid());
        assert!(genesis.proof_of_work_is_valid());
    }
}
