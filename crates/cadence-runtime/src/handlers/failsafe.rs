//! Failed-stream suppression (spec component C3).
//!
//! A stream whose consumer callback errors is marked failed and every
//! subsequent live transaction for it is dropped before it reaches the
//! sequencer, so one broken stream can't pile up an unbounded replay
//! buffer behind it. Uses the same `DashMap`-as-concurrent-set idiom as
//! the per-stream sequencer map.

use std::sync::Arc;

use async_trait::async_trait;
use cadence::{StreamId, Transaction};
use dashmap::DashMap;
use tracing::{error, warn};

use super::TransactionHandler;

/// The set of streams currently excluded from live delivery because their
/// consumer callback previously errored.
#[derive(Clone, Default)]
pub struct FailedStreamTable {
    failed: Arc<DashMap<StreamId, ()>>,
}

impl FailedStreamTable {
    pub fn new() -> Self {
        FailedStreamTable::default()
    }

    pub fn is_failed(&self, stream_id: &StreamId) -> bool {
        self.failed.contains_key(stream_id)
    }

    pub fn mark_failed(&self, stream_id: &StreamId) {
        self.failed.insert(stream_id.clone(), ());
    }

    /// Clears a stream's failed status, e.g. after an operator-triggered
    /// re-replay. Returns whether it had been marked failed.
    pub fn clear(&self, stream_id: &StreamId) -> bool {
        self.failed.remove(stream_id).is_some()
    }

    pub fn failed_streams(&self) -> Vec<StreamId> {
        self.failed.iter().map(|entry| entry.key().clone()).collect()
    }
}

/// Consults a [`FailedStreamTable`] before forwarding to `inner`, and marks
/// the stream failed if `inner` errors. Never returns an error itself --
/// by design, failure here is terminal for the stream, not for the pipeline.
pub struct FailSafeTransactionHandler<H: TransactionHandler> {
    inner: Arc<H>,
    failed: FailedStreamTable,
}

impl<H: TransactionHandler> FailSafeTransactionHandler<H> {
    pub fn new(inner: Arc<H>, failed: FailedStreamTable) -> Self {
        FailSafeTransactionHandler { inner, failed }
    }

    pub fn failed_streams(&self) -> FailedStreamTable {
        self.failed.clone()
    }
}

#[async_trait]
impl<H> TransactionHandler for FailSafeTransactionHandler<H>
where
    H: TransactionHandler + 'static,
{
    type Error = std::convert::Infallible;

    async fn handle(&self, transaction: Transaction) -> Result<(), Self::Error> {
        if self.failed.is_failed(&transaction.stream_id) {
            warn!(
                stream_id = %transaction.stream_id,
                revision = transaction.revision,
                "dropping transaction for previously failed stream"
            );
            return Ok(());
        }

        let stream_id = transaction.stream_id.clone();
        let revision = transaction.revision;
        if let Err(err) = self.inner.handle(transaction).await {
            error!(%stream_id, revision, error = %err, "consumer failed, marking stream failed");
            self.failed.mark_failed(&stream_id);
        }

        Ok(())
    }
}
