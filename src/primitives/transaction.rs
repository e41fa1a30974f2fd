// Stub transaction schema. The transaction/UTXO subsystem is out of scope —
// blocks store opaque bytes — but consensus::rules::validate_block makes a
// best-effort attempt to interpret `block.data` as one of these, purely to
// run a cursory sanity check. Not wired into balances, signatures, or a
// mempool; see the open question in consensus::rules.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: String,
    pub recipient: String,
    pub amount: u64,
    pub nonce: u64,
}

impl Transaction {
    /// Parse `data` as JSON if it looks like one of these; callers treat a
    /// parse failure as "not a transaction payload", not an error.
    pub fn try_parse(data: &[u8]) -> Option<Transaction> {
        serde_json::from_slice(data).ok()
    }

    pub fn basic_validate(&self) -> bool {
        self.amount > 0 && !self.sender.is_empty() && !self.recipient.is_empty() && self.sender != self.recipient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_transaction_payload_does_not_parse() {
        assert!(Transaction::try_parse(b"not json").is_none());
    }

    #[test]
    fn test_valid_transaction_parses_and_validates() {
        let data = serde_json::to_vec(&Transaction {
            sender: "alice".into(),
            recipient: "bob".into(),
            amount: 10,
            nonce: 1,
        })
        .unwrap();
        let tx = Transaction::try_parse(&data).unwrap();
        assert!(tx.basic_validate());
    }

    #[test]
    fn test_self_send_rejected() {
        let tx = Transaction {
            sender: "alice".into(),
            recipient: "alice".into(),
            amount: 10,
            nonce: 1,
        };
        assert!(!tx.basic_validate());
    }
}
