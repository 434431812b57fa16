use std::collections::HashSet;

use async_trait::async_trait;

use crate::ids::{Category, StreamId};
use crate::Transaction;

/// Seeds the per-stream sequencer when a stream is first seen.
///
/// Distinguished from a plain `i32` (the source system's `-1` sentinel for
/// "only new events") so that "track from revision 0" and "ignore all
/// history" cannot be confused at the call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpectedRevision {
    /// Deliver starting at this revision; anything below is a duplicate.
    Track(i32),
    /// This stream has no tracked position; accept whatever arrives next as
    /// in-sequence and do not buffer or gap-detect for it.
    IgnoreHistory,
}

/// Implemented by a caller that wants to consume transactions during the
/// cold replay phase of [`EventStream::resume`](../cadence_runtime/struct.EventStream.html#method.resume).
#[async_trait]
pub trait DurableConsumer: Send + Sync {
    /// Deliberately looser than `std::error::Error` so a consumer can use
    /// `anyhow::Error` here, matching how application code typically wraps
    /// its own callback failures.
    type Error: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static;
    type Live: LiveConsumer<Error = Self::Error>;

    /// The last transaction timestamp this consumer has durably recorded
    /// processing, or `None` if it has never run before.
    fn last_timestamp(&self) -> Option<i64>;

    /// Categories this consumer cares about; empty means all.
    fn category_filter(&self) -> HashSet<Category>;

    /// Called serially per stream during replay.
    async fn consume_replay(&self, transaction: &Transaction) -> Result<(), Self::Error>;

    /// Returns the live-mode interface, invoked once cutover begins.
    fn on_live(&self) -> Self::Live;
}

/// The live-mode half of a [`DurableConsumer`], active once
/// [`EventStream::resume`](../cadence_runtime/struct.EventStream.html#method.resume)
/// has bridged replay into the live feed.
#[async_trait]
pub trait LiveConsumer: Send + Sync {
    type Error: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static;

    /// Seeds the sequencer for a stream the first time it is seen live.
    fn expected_revision(&self, stream_id: &StreamId) -> ExpectedRevision;

    /// Called with ordered, deduplicated live transactions for one stream
    /// at a time; never called concurrently for the same stream.
    async fn consume_live(&self, transaction: &Transaction) -> Result<(), Self::Error>;
}
