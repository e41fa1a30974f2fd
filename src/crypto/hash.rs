// Cryptographic hashing wrappers and the two canonical preimages the rest of
// the crate must reproduce byte-for-byte (see spec section 6): the block-hash
// preimage and the proof-of-work preimage are NOT the same encoding.

use sha2::{Digest, Sha256};

/// SHA-256: used for both block hashing and proof-of-work.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Block-hash preimage: `sprintf("%d %s%s", timestamp, data, prev_hash)`.
/// Decimal ASCII timestamp, a literal space, then raw `data` and `prev_hash`.
pub fn block_hash_preimage(timestamp: i64, data: &[u8], prev_hash: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24 + data.len() + prev_hash.len());
    buf.extend_from_slice(timestamp.to_string().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(data);
    buf.extend_from_slice(prev_hash);
    buf
}

/// The block's `hash` field is the lowercase hex digest of `block_hash_preimage`,
/// i.e. 64 ASCII bytes, not 32 raw bytes.
pub fn compute_block_hash(timestamp: i64, data: &[u8], prev_hash: &[u8]) -> String {
    sha256_hex(&block_hash_preimage(timestamp, data, prev_hash))
}

/// Proof-of-work preimage: `prev_hash || data || dec(timestamp) || dec(difficulty) || dec(nonce)`.
/// Note the field order and composition differ from `block_hash_preimage` —
/// this is intentional per the external interface contract, not a typo.
pub fn pow_preimage(prev_hash: &[u8], data: &[u8], timestamp: i64, difficulty: u8, nonce: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(prev_hash.len() + data.len() + 32);
    buf.extend_from_slice(prev_hash);
    buf.extend_from_slice(data);
    buf.extend_from_slice(timestamp.to_string().as_bytes());
    buf.extend_from_slice(difficulty.to_string().as_bytes());
    buf.extend_from_slice(nonce.to_string().as_bytes());
    buf
}
