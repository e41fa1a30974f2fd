// Data structures: Block. A block is created once and never mutated; every
// field that participates in hashing is set at construction time.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::crypto::hash::compute_block_hash;
use crate::crypto::pow::{clamp_difficulty, verify as pow_verify};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub timestamp: i64,
    pub data: Vec<u8>,
    pub prev_hash: Vec<u8>,
    /// Lowercase hex digest of the block-hash preimage (64 ASCII bytes).
    pub hash: String,
    pub nonce: u32,
    pub difficulty: u8,
}

impl Block {
    /// Construct and hash a block. `nonce`/`difficulty` are whatever the
    /// caller already decided (0/whatever for an unmined append, the mined
    /// values for `append_mined`) — hashing never depends on them, only on
    /// `timestamp`, `data`, `prev_hash`.
    pub fn new(timestamp: i64, data: Vec<u8>, prev_hash: Vec<u8>, nonce: u32, difficulty: u8) -> Self {
        let hash = compute_block_hash(timestamp, &data, &prev_hash);
        Block {
            timestamp,
            data,
            prev_hash,
            hash,
            nonce,
            difficulty: clamp_difficulty(difficulty),
        }
    }

    pub fn recompute_hash(&self) -> String {
        compute_block_hash(self.timestamp, &self.data, &self.prev_hash)
    }

    /// `hash == H(canonical(block))`.
    pub fn hash_is_valid(&self) -> bool {
        self.hash == self.recompute_hash()
    }

    /// If mined (`nonce > 0`), the PoW preimage must hash below the
    /// difficulty target. An unmined block (`nonce == 0`, e.g. genesis)
    /// trivially satisfies this.
    pub fn proof_of_work_is_valid(&self) -> bool {
        if self.nonce == 0 {
            return true;
        }
        pow_verify(&self.prev_hash, &self.data, self.timestamp, self.difficulty, self.nonce)
    }
}

/// Wire/disk JSON encoding: byte fields are base64, numbers stay numbers.
#[derive(Debug, Serialize, Deserialize)]
struct BlockJson {
    timestamp: i64,
    data: String,
    prev_hash: String,
    hash: String,
    nonce: u32,
    difficulty: u8,
}

impl Block {
    pub fn to_json(&self) -> serde_json::Value {
        let wire = BlockJson {
            timestamp: self.timestamp,
            data: BASE64.encode(&self.data),
            prev_hash: BASE64.encode(&self.prev_hash),
            hash: BASE64.encode(self.hash.as_bytes()),
            nonce: self.nonce,
            difficulty: self.difficulty,
        };
        serde_json::to_value(wire).expect("BlockJson is always serializable")
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, BlockCodecError> {
        let wire: BlockJson = serde_json::from_value(value.clone())?;
        let data = BASE64.decode(&wire.data).map_err(|_| BlockCodecError::BadBase64("data"))?;
        let prev_hash = BASE64
            .decode(&wire.prev_hash)
            .map_err(|_| BlockCodecError::BadBase64("prev_hash"))?;
        let hash_bytes = BASE64.decode(&wire.hash).map_err(|_| BlockCodecError::BadBase64("hash"))?;
        let hash = String::from_utf8(hash_bytes).map_err(|_| BlockCodecError::BadBase64("hash"))?;
        Ok(Block {
            timestamp: wire.timestamp,
            data,
            prev_hash,
            hash,
            nonce: wire.nonce,
            difficulty: wire.difficulty,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BlockCodecError {
    #[error("malformed block JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid base64 in field {0}")]
    BadBase64(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip() {
        let block = Block::new(1_700_000_000, b"payload".to_vec(), b"prev".to_vec(), 7, 4);
        let json = block.to_json();
        let decoded = Block::from_json(&json).unwrap();
        assert_eq!(block, decoded);
    }

    #[test]
    fn test_hash_changes_with_data() {
        let a = Block::new(1, b"a".to_vec(), vec![], 0, 1);
        let b = Block::new(1, b"b".to_vec(), vec![], 0, 1);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn test_hash_is_valid() {
        let block = Block::new(1, b"a".to_vec(), vec![], 0, 1);
        assert!(block.hash_is_valid());
    }
}
