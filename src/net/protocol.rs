// Wire codec: a fixed 10-byte header (version, type, payload length, CRC32
// checksum) followed by variable-length signature, node id, and payload.
// All multi-byte integers are big-endian. Messages over the fragment
// threshold are split by `fragment::split` and rejoined by `Reassembler`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::{MAX_MESSAGE_SIZE, MAX_NODE_ID_LEN, MAX_SIGNATURE_LEN, FRAGMENT_THRESHOLD};

const HEADER_LEN: usize = 10;
const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Ping,
    Pong,
    GetBlocks,
    Blocks,
    NewBlock,
    GetPeers,
    Peers,
    Transaction,
    GetBlockchain,
    Blockchain,
    /// Never transmitted; produced internally when decode can't identify a type.
    Unknown,
}

impl MessageType {
    fn to_ordinal(self) -> u8 {
        match self {
            MessageType::Ping => 0,
            MessageType::Pong => 1,
            MessageType::GetBlocks => 2,
            MessageType::Blocks => 3,
            MessageType::NewBlock => 4,
            MessageType::GetPeers => 5,
            MessageType::Peers => 6,
            MessageType::Transaction => 7,
            MessageType::GetBlockchain => 8,
            MessageType::Blockchain => 9,
            MessageType::Unknown => 10,
        }
    }

    fn from_ordinal(ordinal: u8) -> MessageType {
        match ordinal {
            0 => MessageType::Ping,
            1 => MessageType::Pong,
            2 => MessageType::GetBlocks,
            3 => MessageType::Blocks,
            4 => MessageType::NewBlock,
            5 => MessageType::GetPeers,
            6 => MessageType::Peers,
            7 => MessageType::Transaction,
            8 => MessageType::GetBlockchain,
            9 => MessageType::Blockchain,
            _ => MessageType::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub version: u8,
    pub message_type: MessageType,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
    pub node_id: String,
    pub is_fragment: bool,
    pub fragment_id: u32,
    pub fragment_index: u16,
    pub total_fragments: u16,
}

impl Message {
    pub fn new(message_type: MessageType, payload: Vec<u8>) -> Self {
        Message {
            version: PROTOCOL_VERSION,
            message_type,
            payload,
            signature: Vec::new(),
            node_id: String::new(),
            is_fragment: false,
            fragment_id: 0,
            fragment_index: 0,
            total_fragments: 1,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame too short")]
    ShortFrame,
    #[error("unsupported protocol version")]
    UnsupportedVersion,
    #[error("payload exceeds maximum message size")]
    OversizeMessage,
    #[error("signature length exceeds maximum")]
    BadSignatureLength,
    #[error("node id length exceeds maximum")]
    BadNodeIdLength,
    #[error("checksum does not match payload")]
    ChecksumMismatch,
    #[error("node id is not valid utf-8")]
    BadNodeId,
}

/// Encode a non-fragment frame. Fragmentation is layered on top by
/// `fragment::split`, which calls this once per fragment.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    if message.payload.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::OversizeMessage);
    }
    if message.signature.len() > MAX_SIGNATURE_LEN {
        return Err(CodecError::BadSignatureLength);
    }
    if message.node_id.len() > MAX_NODE_ID_LEN {
        return Err(CodecError::BadNodeIdLength);
    }

    let checksum = crc32fast::hash(&message.payload);
    let mut out = Vec::with_capacity(HEADER_LEN + message.signature.len() + message.node_id.len() + message.payload.len());

    out.push(message.version);
    out.push(message.message_type.to_ordinal());
    out.extend_from_slice(&(message.payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&checksum.to_be_bytes());
    out.extend_from_slice(&(message.signature.len() as u16).to_be_bytes());
    out.extend_from_slice(&message.signature);
    out.extend_from_slice(&(message.node_id.len() as u16).to_be_bytes());
    out.extend_from_slice(message.node_id.as_bytes());
    out.extend_from_slice(&message.payload);
    Ok(out)
}

/// Decode a single frame. Validates every length and the checksum before
/// returning anything — a partially-trusted `Message` is never produced.
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::ShortFrame);
    }
    let version = bytes[0];
    if version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion);
    }
    let message_type = MessageType::from_ordinal(bytes[1]);
    let payload_length = u32::from_be_bytes(bytes[2..6].try_into().unwrap()) as usize;
    if payload_length > MAX_MESSAGE_SIZE {
        return Err(CodecError::OversizeMessage);
    }
    let checksum = u32::from_be_bytes(bytes[6..10].try_into().unwrap());

    let mut offset = HEADER_LEN;
    if bytes.len() < offset + 2 {
        return Err(CodecError::ShortFrame);
    }
    let signature_length = u16::from_be_bytes(bytes[offset..offset + 2].try_into().unwrap()) as usize;
    if signature_length > MAX_SIGNATURE_LEN {
        return Err(CodecError::BadSignatureLength);
    }
    offset += 2;

    if bytes.len() < offset + signature_length {
        return Err(CodecError::ShortFrame);
    }
    let signature = bytes[offset..offset + signature_length].to_vec();
    offset += signature_length;

    if bytes.len() < offset + 2 {
        return Err(CodecError::ShortFrame);
    }
    let node_id_length = u16::from_be_bytes(bytes[offset..offset + 2].try_into().unwrap()) as usize;
    if node_id_length > MAX_NODE_ID_LEN {
        return Err(CodecError::BadNodeIdLength);
    }
    offset += 2;

    if bytes.len() < offset + node_id_length {
        return Err(CodecError::ShortFrame);
    }
    let node_id = String::from_utf8(bytes[offset..offset + node_id_length].to_vec()).map_err(|_| CodecError::BadNodeId)?;
    offset += node_id_length;

    if bytes.len() < offset + payload_length {
        return Err(CodecError::ShortFrame);
    }
    let payload = bytes[offset..offset + payload_length].to_vec();

    if crc32fast::hash(&payload) != checksum {
        return Err(CodecError::ChecksumMismatch);
    }

    Ok(Message {
        version,
        message_type,
        payload,
        signature,
        node_id,
        is_fragment: false,
        fragment_id: 0,
        fragment_index: 0,
        total_fragments: 1,
    })
}

/// Placeholder signing hook. Wire format carries `signature`/`node_id`
/// fields so a real scheme can be dropped in later without a format change;
/// peer authentication itself is out of scope here.
pub trait SignatureProvider: Send + Sync {
    fn sign(&self, payload: &[u8]) -> Vec<u8>;
    fn verify(&self, payload: &[u8], signature: &[u8]) -> bool;
}

pub struct NullSigner;

impl SignatureProvider for NullSigner {
    fn sign(&self, _payload: &[u8]) -> Vec<u8> {
        Vec::new()
    }

    fn verify(&self, _payload: &[u8], _signature: &[u8]) -> bool {
        true
    }
}

pub mod fragment {
    use super::*;

    /// Split `message` into ordered fragments if its payload exceeds the
    /// threshold; otherwise returns it unchanged as the sole element.
    pub fn split(message: &Message, fragment_id: u32) -> Vec<Message> {
        if message.payload.len() <= FRAGMENT_THRESHOLD {
            return vec![message.clone()];
        }
        let chunks: Vec<&[u8]> = message.payload.chunks(FRAGMENT_THRESHOLD).collect();
        let total = chunks.len() as u16;
        chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| Message {
                version: message.version,
                message_type: message.message_type,
                payload: chunk.to_vec(),
                signature: message.signature.clone(),
                node_id: message.node_id.clone(),
                is_fragment: true,
                fragment_id,
                fragment_index: index as u16,
                total_fragments: total,
            })
            .collect()
    }

    struct PendingReassembly {
        parts: HashMap<u16, Vec<u8>>,
        total_fragments: u16,
        message_type: MessageType,
        signature: Vec<u8>,
        node_id: String,
        last_seen: Instant,
    }

    /// Accumulates fragments keyed by `fragment_id` until every index has
    /// arrived, then concatenates them back into the original message.
    pub struct Reassembler {
        pending: HashMap<u32, PendingReassembly>,
        max_age: Duration,
    }

    impl Reassembler {
        pub fn new(max_age: Duration) -> Self {
            Reassembler {
                pending: HashMap::new(),
                max_age,
            }
        }

        /// Feed one fragment in. Returns the reassembled message once every
        /// fragment for its `fragment_id` has arrived, else `None`.
        pub fn accept(&mut self, fragment: Message) -> Option<Message> {
            if !fragment.is_fragment {
                return Some(fragment);
            }

            let entry = self.pending.entry(fragment.fragment_id).or_insert_with(|| PendingReassembly {
                parts: HashMap::new(),
                total_fragments: fragment.total_fragments,
                message_type: fragment.message_type,
                signature: fragment.signature.clone(),
                node_id: fragment.node_id.clone(),
                last_seen: Instant::now(),
            });
            entry.parts.insert(fragment.fragment_index, fragment.payload);
            entry.last_seen = Instant::now();

            if entry.parts.len() as u16 != entry.total_fragments {
                return None;
            }

            let pending = self.pending.remove(&fragment.fragment_id)?;
            let mut payload = Vec::new();
            for index in 0..pending.total_fragments {
                payload.extend_from_slice(pending.parts.get(&index)?);
            }

            Some(Message {
                version: PROTOCOL_VERSION,
                message_type: pending.message_type,
                payload,
                signature: pending.signature,
                node_id: pending.node_id,
                is_fragment: false,
                fragment_id: 0,
                fragment_index: 0,
                total_fragments: 1,
            })
        }

        /// Drop reassembly state older than `max_age`; returns the count evicted.
        pub fn evict_stale(&mut self) -> usize {
            let max_age = self.max_age;
            let before = self.pending.len();
            self.pending.retain(|_, entry| entry.last_seen.elapsed() < max_age);
            before - self.pending.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let message = Message::new(MessageType::Ping, b"hi".to_vec());
        let bytes = encode(&message).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.message_type, MessageType::Ping);
        assert_eq!(decoded.payload, b"hi");
    }

    #[test]
    fn test_tamper_detected() {
        let message = Message::new(MessageType::Ping, b"hi".to_vec());
        let mut bytes = encode(&message).unwrap();
        bytes[6] ^= 0xFF;
        assert_eq!(decode(&bytes), Err(CodecError::ChecksumMismatch));
    }

    #[test]
    fn test_oversize_payload_rejected_on_encode() {
        let message = Message::new(MessageType::Blocks, vec![0u8; MAX_MESSAGE_SIZE + 1]);
        assert_eq!(encode(&message), Err(CodecError::OversizeMessage));
    }

    #[test]
    fn test_short_frame_rejected() {
        assert_eq!(decode(&[1, 2, 3]), Err(CodecError::ShortFrame));
    }

    #[test]
    fn test_fragmentation_round_trip() {
        let payload = vec![7u8; FRAGMENT_THRESHOLD * 3 + 17];
        let message = Message::new(MessageType::Blocks, payload.clone());
        let fragments = fragment::split(&message, 42);
        assert!(fragments.len() > 1);

        let mut reassembler = fragment::Reassembler::new(Duration::from_secs(60));
        let mut result = None;
        for fragment in fragments {
            result = reassembler.accept(fragment);
        }
        let reassembled = result.expect("all fragments delivered");
        assert_eq!(reassembled.payload, payload);
    }

    #[test]
    fn test_non_fragment_message_passes_through_reassembler() {
        let mut reassembler = fragment::Reassembler::new(Duration::from_secs(60));
        let message = Message::new(MessageType::Ping, Vec::new());
        assert!(reassembler.accept(message).is_some());
    }
}
