//! Transaction log records.
//!
//! Every successful call or transfer appends one record to the contract's
//! `transactions` list, in call order.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::types::{Address, ContractId, Timestamp};

/// A successful method call
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    /// When the call was committed
    pub timestamp: Timestamp,
    /// Caller
    pub sender: Address,
    /// Method invoked
    pub method: String,
    /// Parameters passed
    pub params: Json,
    /// Value attached
    pub value: u64,
}

/// Marker serialized as `"type": "transfer"`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// Outgoing transfer
    #[default]
    Transfer,
}

/// An outgoing transfer of contract funds
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// When the transfer was committed
    pub timestamp: Timestamp,
    /// Paying contract
    pub sender: ContractId,
    /// Recipient
    pub receiver: Address,
    /// Amount moved
    pub amount: u64,
    /// Always `transfer`
    #[serde(rename = "type")]
    pub kind: RecordKind,
}

/// One entry of a contract's transaction log
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransactionRecord {
    /// Outgoing transfer
    Transfer(TransferRecord),
    /// Method call
    Call(CallRecord),
}

impl TransactionRecord {
    /// Commit time of the record
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Self::Transfer(t) => t.timestamp,
            Self::Call(c) => c.timestamp,
        }
    }

    /// Who the record is attributed to
    #[must_use]
    pub fn sender(&self) -> &Address {
        match self {
            Self::Transfer(t) => &t.sender,
            Self::Call(c) => &c.sender,
        }
    }

    /// Parse a logged entry
    ///
    /// # Errors
    /// Returns error if the entry matches neither record shape
    pub fn from_json(entry: &Json) -> Result<Self, serde_json::Error> {
        Self::deserialize(entry)
    }
}

impl From<CallRecord> for TransactionRecord {
    fn from(record: CallRecord) -> Self {
        Self::Call(record)
    }
}

impl From<TransferRecord> for TransactionRecord {
    fn from(record: TransferRecord) -> Self {
        Self::Transfer(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transfer_wire_shape() {
        let record = TransactionRecord::from(TransferRecord {
            timestamp: 7,
            sender: Address::new("0xC0"),
            receiver: Address::new("0xB"),
            amount: 100,
            kind: RecordKind::Transfer,
        });
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({"timestamp": 7, "sender": "0xC0", "receiver": "0xB", "amount": 100, "type": "transfer"})
        );
    }

    #[test]
    fn test_call_wire_shape_and_parse() {
        let entry = json!({
            "timestamp": 9, "sender": "0xA", "method": "greet",
            "params": {"name": "Bob"}, "value": 0
        });
        let record = TransactionRecord::from_json(&entry).unwrap();
        assert!(matches!(&record, TransactionRecord::Call(c) if c.method == "greet"));
        assert_eq!(record.timestamp(), 9);
        assert_eq!(record.sender().as_str(), "0xA");
        assert_eq!(serde_json::to_value(&record).unwrap(), entry);
    }

    #[test]
    fn test_unknown_shape_is_rejected() {
        assert!(TransactionRecord::from_json(&json!({"timestamp": 1})).is_err());
    }
}
