use std::collections::HashSet;
use std::error::Error as StdError;
use std::ops::Range;

use async_trait::async_trait;
use futures::Stream;

use crate::ids::{Category, StreamId};
use crate::Transaction;

/// A live subscription handle. Dropping it does not necessarily stop
/// delivery -- callers that want to stop receiving events must call
/// [`cancel`](Subscription::cancel) explicitly, an explicit stop rather than
/// relying on `Drop`.
pub trait Subscription: Send {
    /// Terminate the live subscription. In-flight transactions already
    /// dispatched to the handler chain are allowed to complete.
    fn cancel(&self);

    /// Whether `cancel` has been called (or the subscription has otherwise
    /// terminated, e.g. the upstream feed closed).
    fn is_cancelled(&self) -> bool;
}

/// The minimal interface the ordered delivery pipeline requires from a
/// journal plus its unreliable publish/subscribe feed. Implemented by
/// `cadence-inmemory` and `cadence-mongodb`; the pipeline in `cadence-runtime`
/// is generic over it.
#[async_trait]
pub trait EventSource: Send + Sync {
    type Error: StdError + Send + Sync + 'static;
    type TransactionStream: Stream<Item = Result<Transaction, Self::Error>> + Send;

    /// Subscribe to newly committed transactions matching `filter` (empty
    /// filter means all categories). The sink is invoked for each
    /// transaction as it arrives; this may run on a different task than the
    /// caller.
    async fn subscribe(
        &self,
        filter: HashSet<Category>,
    ) -> Result<(Self::TransactionStream, Box<dyn Subscription>), Self::Error>;

    /// Full replay over the given category filter, in
    /// `(timestamp, stream_id, revision)` order.
    async fn replay(&self, filter: HashSet<Category>) -> Result<Self::TransactionStream, Self::Error>;

    /// Replay restricted to transactions committed at or after
    /// `since_timestamp_ms`.
    async fn replay_from(
        &self,
        since_timestamp_ms: i64,
        filter: HashSet<Category>,
    ) -> Result<Self::TransactionStream, Self::Error>;

    /// Replay a half-open revision range of a single stream, in revision
    /// order. Used to fill gaps detected during live delivery.
    async fn replay_stream_range(
        &self,
        stream_id: &StreamId,
        revisions: Range<i32>,
    ) -> Result<Self::TransactionStream, Self::Error>;
}
