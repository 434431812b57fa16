use std::error::Error as StdError;

use async_trait::async_trait;
use futures::Stream;

use crate::error::AppendStreamError;
use crate::ids::{Category, StreamId};
use crate::transaction::TransactionData;

/// A single write to append to a stream. Unlike [`Transaction`](crate::Transaction),
/// it carries no revision or timestamp -- those are assigned by the store.
#[derive(Clone, Debug, PartialEq)]
pub struct NewTransaction {
    pub events: Vec<TransactionData>,
}

impl NewTransaction {
    pub fn new(events: Vec<TransactionData>) -> Self {
        NewTransaction { events }
    }
}

/// Journal abstraction: append-only per-stream storage with dense,
/// zero-based revisions. This is the "canonical journal" the ordered
/// delivery pipeline's [`EventSource`](crate::EventSource) contract reads
/// from; see `cadence-inmemory` and `cadence-mongodb` for concrete backings.
#[async_trait]
pub trait EventStore: Send + Sync {
    type TransactionStream: Stream<Item = Result<crate::Transaction, Self::Error>> + Send;
    type Error: StdError + Send + Sync + 'static;

    /// Append one transaction's worth of events to a stream.
    ///
    /// `expected_revision` is `None` to append unconditionally to a brand
    /// new stream, or `Some(r)` to require the stream's current head
    /// revision to be `r - 1` (i.e. this call is appending revision `r`).
    async fn append_to_stream(
        &self,
        category: &Category,
        stream_id: &StreamId,
        transaction: NewTransaction,
        expected_revision: Option<i32>,
    ) -> Result<crate::Transaction, AppendStreamError<Self::Error>>;

    /// Iterate transactions within a single stream, starting at `from`
    /// (inclusive), in revision order.
    async fn iter_stream(
        &self,
        stream_id: &StreamId,
        from: i32,
    ) -> Result<Self::TransactionStream, Self::Error>;
}
