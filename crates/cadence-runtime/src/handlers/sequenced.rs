//! Per-stream sequencer map (spec component C2).
//!
//! A lazy-insert `DashMap<StreamId, Arc<Mutex<_>>>` keyed per stream, with a
//! full [`MonotonicSequencer`] behind each entry rather than a bare
//! mutual-exclusion lock.

use std::sync::Arc;

use async_trait::async_trait;
use cadence::{Category, LiveConsumer, StreamId, Transaction};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;

use super::TransactionHandler;
use crate::sequencer::{DuplicateHandler, DuplicateKind, GapHandler, MonotonicSequencer, SequencerError};

/// Notified of gap open/close transitions, keyed by stream. `EventStream`
/// implements this to schedule and cancel range-replay for the gap.
pub trait GapObserver: Send + Sync {
    fn gap_detected(&self, stream_id: &StreamId, category: &Category, expected: i32, actual: i32);
    fn gap_closed(&self, stream_id: &StreamId);
}

/// Notified of duplicate/stale arrivals, keyed by stream. Implementations
/// typically just log at trace level.
pub trait DuplicateObserver: Send + Sync {
    fn on_duplicate(&self, stream_id: &StreamId, revision: i32, kind: DuplicateKind);
}

#[derive(Debug, Error)]
pub enum SequencedError<E> {
    /// Forwards `Display` only -- `E` is usually `anyhow::Error`, which does
    /// not implement `std::error::Error`.
    #[error("{0}")]
    Inner(E),
    #[error("{0}")]
    Sequencer(String),
}

struct GapAdapter<'a> {
    stream_id: &'a StreamId,
    category: &'a Category,
    observer: &'a dyn GapObserver,
}

impl<'a> GapHandler<i32> for GapAdapter<'a> {
    fn gap_detected(&mut self, expected: i32, actual: i32) {
        self.observer
            .gap_detected(self.stream_id, self.category, expected, actual);
    }

    fn gap_closed(&mut self) {
        self.observer.gap_closed(self.stream_id);
    }
}

struct DupAdapter<'a> {
    stream_id: &'a StreamId,
    observer: &'a dyn DuplicateObserver,
}

impl<'a> DuplicateHandler<i32, Transaction> for DupAdapter<'a> {
    fn on_duplicate(&mut self, _key: i32, _value: Transaction, kind: DuplicateKind) {
        self.observer.on_duplicate(self.stream_id, _key, kind);
    }
}

/// A stream is either tracked (buffered and reordered by revision) or, for
/// streams an [`ExpectedRevision::IgnoreHistory`](cadence::ExpectedRevision)
/// consumer never seeded, passed straight through.
enum StreamState {
    Tracked(MonotonicSequencer<Transaction>),
    Passthrough,
}

/// Maintains one [`MonotonicSequencer`] per live stream and routes each
/// incoming transaction through it before forwarding in-order, deduplicated
/// transactions to `inner`.
pub struct SequencedTransactionHandler<H, L>
where
    H: TransactionHandler,
    L: LiveConsumer,
{
    inner: Arc<H>,
    live: Arc<L>,
    sequencers: DashMap<StreamId, Arc<Mutex<StreamState>>>,
    buffer_limit: Option<usize>,
    gap_observer: Arc<dyn GapObserver>,
    dup_observer: Arc<dyn DuplicateObserver>,
}

impl<H, L> SequencedTransactionHandler<H, L>
where
    H: TransactionHandler + 'static,
    L: LiveConsumer + 'static,
{
    pub fn new(
        inner: Arc<H>,
        live: Arc<L>,
        buffer_limit: Option<usize>,
        gap_observer: Arc<dyn GapObserver>,
        dup_observer: Arc<dyn DuplicateObserver>,
    ) -> Self {
        SequencedTransactionHandler {
            inner,
            live,
            sequencers: DashMap::new(),
            buffer_limit,
            gap_observer,
            dup_observer,
        }
    }

    /// Drops the sequencer for a stream, e.g. once its failed-stream
    /// status is cleared and it should restart from scratch next time it
    /// is seen.
    pub fn forget_stream(&self, stream_id: &StreamId) {
        self.sequencers.remove(stream_id);
    }

    fn state_for(&self, stream_id: &StreamId) -> Arc<Mutex<StreamState>> {
        self.sequencers
            .entry(stream_id.clone())
            .or_insert_with(|| {
                let state = match self.live.expected_revision(stream_id) {
                    cadence::ExpectedRevision::Track(revision) => {
                        StreamState::Tracked(MonotonicSequencer::new(revision, self.buffer_limit))
                    }
                    cadence::ExpectedRevision::IgnoreHistory => StreamState::Passthrough,
                };
                Arc::new(Mutex::new(state))
            })
            .clone()
    }
}

#[async_trait]
impl<H, L> TransactionHandler for SequencedTransactionHandler<H, L>
where
    H: TransactionHandler + 'static,
    L: LiveConsumer + 'static,
{
    type Error = SequencedError<H::Error>;

    async fn handle(&self, transaction: Transaction) -> Result<(), Self::Error> {
        let state_lock = self.state_for(&transaction.stream_id);
        let mut state = state_lock.lock().await;

        match &mut *state {
            StreamState::Passthrough => {
                drop(state);
                self.inner
                    .handle(transaction)
                    .await
                    .map_err(SequencedError::Inner)
            }
            StreamState::Tracked(sequencer) => {
                let stream_id = transaction.stream_id.clone();
                let category = transaction.category.clone();
                let revision = transaction.revision;
                let inner = Arc::clone(&self.inner);
                let mut gap_adapter = GapAdapter {
                    stream_id: &stream_id,
                    category: &category,
                    observer: self.gap_observer.as_ref(),
                };
                let mut dup_adapter = DupAdapter {
                    stream_id: &stream_id,
                    observer: self.dup_observer.as_ref(),
                };

                sequencer
                    .offer(
                        revision,
                        transaction,
                        &mut gap_adapter,
                        &mut dup_adapter,
                        |_revision, tx| {
                            let inner = Arc::clone(&inner);
                            async move { inner.handle(tx).await }
                        },
                    )
                    .await
                    .map_err(|err| match err {
                        SequencerError::BufferOverflow { limit } => {
                            SequencedError::Sequencer(format!(
                                "stream {stream_id} exceeded replay buffer limit of {limit}"
                            ))
                        }
                        SequencerError::Delivery(inner_err) => SequencedError::Inner(inner_err),
                    })
            }
        }
    }
}
