//! The on-wire document shape for one collection (one category). The
//! category itself is not stored in the document -- it is implied by which
//! collection the document lives in.

use std::collections::HashMap;

use cadence::{Category, StreamId, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredTransaction {
    pub stream_id: String,
    pub revision: i32,
    pub timestamp: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub events: Vec<Value>,
}

impl StoredTransaction {
    pub(crate) fn from_transaction(transaction: &Transaction) -> Self {
        StoredTransaction {
            stream_id: transaction.stream_id.to_string(),
            revision: transaction.revision,
            timestamp: transaction.timestamp,
            metadata: transaction.metadata.clone(),
            events: transaction.events.clone(),
        }
    }

    pub(crate) fn into_transaction(self, category: Category) -> Transaction {
        Transaction::new(
            self.timestamp,
            category,
            StreamId::new(self.stream_id),
            self.revision,
            self.events,
        )
        .with_metadata(self.metadata)
    }
}

/// MongoDB's duplicate-key write error code, returned when an insert
/// collides with the unique `(stream_id, revision)` index.
const DUPLICATE_KEY_ERROR_CODE: i32 = 11000;

pub(crate) fn is_duplicate_key_error(err: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;

    match err.kind.as_ref() {
        ErrorKind::Write(mongodb::error::WriteFailure::WriteError(write_error)) => {
            write_error.code == DUPLICATE_KEY_ERROR_CODE
        }
        ErrorKind::BulkWrite(bulk) => bulk
            .write_errors
            .as_ref()
            .map(|errors| errors.iter().any(|e| e.code == DUPLICATE_KEY_ERROR_CODE))
            .unwrap_or(false),
        // Driver error shapes shift across versions; fall back to matching
        // the well-known Mongo error string rather than missing a
        // collision outright.
        _ => err.to_string().contains("E11000"),
    }
}
