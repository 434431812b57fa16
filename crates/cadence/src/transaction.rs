use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{Category, StreamId};

/// Event payload, opaque to the core. Backings that need a narrower codec
/// (e.g. a fixed schema registry) impose that above this type.
pub type TransactionData = Value;

/// A committed write to a single stream at a specific revision.
///
/// Identity is `(stream_id, revision)`, globally unique. Within a stream,
/// revisions are dense starting at zero with no gaps in the canonical
/// journal -- it is the unreliable pub/sub feed sitting in front of the
/// journal that may reorder or duplicate them before they reach a consumer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Wall-clock commit time in milliseconds, used to pick replay/bridge
    /// start points. Not an ordering key within a stream -- `revision` is.
    pub timestamp: i64,
    pub category: Category,
    pub stream_id: StreamId,
    pub revision: i32,
    pub metadata: HashMap<String, String>,
    pub events: Vec<TransactionData>,
}

impl Transaction {
    pub fn new(
        timestamp: i64,
        category: Category,
        stream_id: StreamId,
        revision: i32,
        events: Vec<TransactionData>,
    ) -> Self {
        Transaction {
            timestamp,
            category,
            stream_id,
            revision,
            metadata: HashMap::new(),
            events,
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}
