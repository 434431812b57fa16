//! Consumer lifecycle: cold replay followed by race-safe live cutover
//! (spec components C5/C6).
//!
//! Subscribes to the live feed *before* running the bridging replay, so no
//! transaction committed in the gap between "replay finished" and
//! "subscription active" is ever missed -- any transaction seen twice (once
//! via the bridge, once via the live feed) is caught by the sequencer's
//! `revision < expected` branch.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use cadence::{
    Category, DurableConsumer, Error as CadenceError, EventSource, LiveConsumer, StreamId, Subscription,
    Transaction,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::EventStreamConfig;
use crate::handlers::{
    AsyncTransactionHandler, DuplicateObserver, FailSafeTransactionHandler, FailedStreamTable,
    GapObserver, SequencedTransactionHandler, TransactionHandler,
};
use crate::replay::{run_replay, ReplaySource};
use crate::sequencer::DuplicateKind;

/// Adapts [`LiveConsumer::consume_live`] to [`TransactionHandler`], the
/// innermost link of the live chain `FailSafe ∘ Sequenced ∘ Async`.
struct LiveConsumerHandler<L> {
    live: Arc<L>,
}

#[async_trait]
impl<L> TransactionHandler for LiveConsumerHandler<L>
where
    L: LiveConsumer + 'static,
{
    type Error = L::Error;

    async fn handle(&self, transaction: Transaction) -> Result<(), Self::Error> {
        self.live.consume_live(&transaction).await
    }
}

type LiveChain = dyn TransactionHandler<Error = std::convert::Infallible> + Send + Sync;

/// Schedules and tracks the durability fallback for live gaps (spec
/// component C6's `PendingReplayTable`): a task per pending gap, delayed by
/// `gap_replay_delay`, that fetches the missing revision range and feeds it
/// back into the live handler chain.
struct GapReplayScheduler<S> {
    event_source: Arc<S>,
    pending: DashMap<StreamId, JoinHandle<()>>,
    gap_replay_delay: Duration,
    chain: OnceLock<Arc<LiveChain>>,
}

impl<S> GapReplayScheduler<S>
where
    S: EventSource + Send + Sync + 'static,
{
    fn new(event_source: Arc<S>, gap_replay_delay: Duration) -> Self {
        GapReplayScheduler {
            event_source,
            pending: DashMap::new(),
            gap_replay_delay,
            chain: OnceLock::new(),
        }
    }

    fn set_chain(&self, chain: Arc<LiveChain>) {
        let _ = self.chain.set(chain);
    }

    fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl<S> GapObserver for GapReplayScheduler<S>
where
    S: EventSource + Send + Sync + 'static,
{
    fn gap_detected(&self, stream_id: &StreamId, _category: &Category, expected: i32, actual: i32) {
        let entry = match self.pending.entry(stream_id.clone()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(entry) => entry,
        };

        let event_source = Arc::clone(&self.event_source);
        let chain = self.chain.get().cloned();
        let delay = self.gap_replay_delay;
        let stream_id = stream_id.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(chain) = chain else {
                warn!(%stream_id, "gap replay fired before the live chain was installed");
                return;
            };

            debug!(%stream_id, expected, actual, "running scheduled gap replay");
            match event_source.replay_stream_range(&stream_id, expected..actual).await {
                Ok(stream) => {
                    tokio::pin!(stream);
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(transaction) => {
                                let _ = chain.handle(transaction).await;
                            }
                            Err(err) => {
                                warn!(%stream_id, error = %err, "gap replay stream errored");
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(%stream_id, error = %err, "failed to fetch scheduled gap replay range");
                }
            }
        });

        entry.insert(handle);
    }

    fn gap_closed(&self, stream_id: &StreamId) {
        if let Some((_, handle)) = self.pending.remove(stream_id) {
            handle.abort();
        }
    }
}

impl<S> DuplicateObserver for GapReplayScheduler<S>
where
    S: Send + Sync,
{
    fn on_duplicate(&self, stream_id: &StreamId, revision: i32, kind: DuplicateKind) {
        match kind {
            DuplicateKind::BelowExpected => {
                trace!(%stream_id, revision, "dropping duplicate below expected revision")
            }
            DuplicateKind::AlreadyBuffered => {
                trace!(%stream_id, revision, "dropping duplicate already sitting in the gap buffer")
            }
        }
    }
}

impl<S> Drop for GapReplayScheduler<S> {
    fn drop(&mut self) {
        for entry in self.pending.iter() {
            entry.value().abort();
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Drives a [`DurableConsumer`] through cold replay and into a live
/// subscription without losing or duplicating events, on top of a single
/// [`EventSource`].
pub struct EventStream<S> {
    event_source: Arc<S>,
    config: EventStreamConfig,
    failed: FailedStreamTable,
    scheduler: OnceLock<Arc<GapReplayScheduler<S>>>,
}

impl<S> EventStream<S>
where
    S: EventSource + Send + Sync + 'static,
{
    pub fn new(event_source: S, config: EventStreamConfig) -> Self {
        EventStream {
            event_source: Arc::new(event_source),
            config,
            failed: FailedStreamTable::new(),
            scheduler: OnceLock::new(),
        }
    }

    /// Streams marked failed during replay or live delivery. Populated for
    /// the lifetime of this `EventStream` -- never auto-evicted.
    pub fn failed_streams(&self) -> Vec<StreamId> {
        self.failed.failed_streams()
    }

    /// Number of streams currently awaiting a scheduled gap replay. Zero
    /// whenever every live stream is in sequence.
    pub fn pending_replay_count(&self) -> usize {
        self.scheduler.get().map(|s| s.pending_count()).unwrap_or(0)
    }

    /// Runs the replay -> live cutover protocol (§4.6) for `consumer`.
    ///
    /// Returns the live subscription handle. `cancel()` on it terminates
    /// live delivery; in-flight transactions complete.
    pub async fn resume<C>(&self, consumer: Arc<C>) -> Result<Box<dyn Subscription>, CadenceError>
    where
        C: DurableConsumer + 'static,
        C::Live: 'static,
        S::TransactionStream: 'static,
    {
        let starting_ms = now_ms();
        let max_clock_skew_ms = self.config.max_clock_skew().as_millis() as i64;

        let filter = consumer.category_filter();
        let replay_source = match consumer.last_timestamp() {
            None => ReplaySource::Full,
            Some(ts) => ReplaySource::Since(ts - max_clock_skew_ms),
        };

        let last_replay_ts = run_replay(
            self.event_source.as_ref(),
            &consumer,
            filter.clone(),
            replay_source,
            &self.config,
            &self.failed,
        )
        .await?;

        // §4.6 step 4: a replay-failed stream bars cutover outright.
        // `run_replay` now marks failures directly into `self.failed` (the
        // process-wide, never-auto-evicted table from §3) rather than a
        // throwaway local set, so this also catches streams failed by a
        // *previous* `resume` call on the same `EventStream`.
        let already_failed = self.failed.failed_streams();
        if !already_failed.is_empty() {
            return Err(CadenceError::StreamsReplayFailure {
                streams: already_failed,
            });
        }

        // Steps 5: build the live handler chain, FailSafe(Sequenced(Async(consume_live))).
        let live = Arc::new(consumer.on_live());
        let scheduler = Arc::new(GapReplayScheduler::new(
            Arc::clone(&self.event_source),
            self.config.gap_replay_delay(),
        ));

        let async_handler = Arc::new(AsyncTransactionHandler::new(
            Arc::new(LiveConsumerHandler {
                live: Arc::clone(&live),
            }),
            self.config.partitions,
        ));
        let sequenced = Arc::new(SequencedTransactionHandler::new(
            async_handler,
            Arc::clone(&live),
            self.config.buffer_limit,
            Arc::clone(&scheduler) as Arc<dyn GapObserver>,
            Arc::clone(&scheduler) as Arc<dyn DuplicateObserver>,
        ));
        let chain: Arc<LiveChain> = Arc::new(FailSafeTransactionHandler::new(
            sequenced,
            self.failed.clone(),
        ));
        scheduler.set_chain(Arc::clone(&chain));
        let _ = self.scheduler.set(Arc::clone(&scheduler));

        // Step 6: subscribe before bridging replay, closing the race window.
        let (live_stream, subscription) = self
            .event_source
            .subscribe(filter.clone())
            .await
            .map_err(|err| CadenceError::Source(anyhow::Error::new(err)))?;

        let live_chain_task = Arc::clone(&chain);
        tokio::spawn(async move {
            tokio::pin!(live_stream);
            while let Some(item) = live_stream.next().await {
                match item {
                    Ok(transaction) => {
                        let _ = live_chain_task.handle(transaction).await;
                    }
                    Err(err) => {
                        warn!(error = %err, "live subscription stream errored, ending delivery loop");
                        break;
                    }
                }
            }
        });

        // Step 7: bridge the replay/live gap through the same chain.
        let bridge_since = last_replay_ts.unwrap_or(starting_ms) - max_clock_skew_ms;
        let bridge_stream = self
            .event_source
            .replay_from(bridge_since, filter)
            .await
            .map_err(|err| CadenceError::Source(anyhow::Error::new(err)))?;
        tokio::pin!(bridge_stream);
        while let Some(item) = bridge_stream.next().await {
            let transaction = item.map_err(|err| CadenceError::Source(anyhow::Error::new(err)))?;
            let _ = chain.handle(transaction).await;
        }

        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;
    use std::collections::HashSet as StdHashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Mutex as StdMutex, RwLock as StdRwLock};

    use async_trait::async_trait;
    use cadence::{Category, ExpectedRevision, StreamId, Transaction};
    use futures::stream;

    use super::*;

    /// Journal storage shared between a `ScriptedSource` and the test that
    /// drives it, so a test can append entries (simulating the durable
    /// journal catching up) after `resume()` has already returned and gone
    /// live.
    type SharedJournal = Arc<StdRwLock<Vec<Transaction>>>;

    fn push_journal(journal: &SharedJournal, transaction: Transaction) {
        journal.write().unwrap().push(transaction);
    }

    /// A tiny in-memory `EventSource` good enough to drive `resume` end to
    /// end: journal entries are seeded at construction (and may grow later
    /// through the shared handle returned by `ScriptedSource::new`), live
    /// entries are fed in by the test through a broadcast channel.
    struct ScriptedSource {
        journal: SharedJournal,
        live: tokio::sync::broadcast::Sender<Transaction>,
    }

    impl ScriptedSource {
        fn new(journal: Vec<Transaction>, live: tokio::sync::broadcast::Sender<Transaction>) -> (Self, SharedJournal) {
            let journal = Arc::new(StdRwLock::new(journal));
            (
                ScriptedSource {
                    journal: Arc::clone(&journal),
                    live,
                },
                journal,
            )
        }

        fn snapshot(&self) -> Vec<Transaction> {
            self.journal.read().unwrap().clone()
        }
    }

    struct ScriptedSubscription {
        cancelled: AtomicBool,
    }

    impl Subscription for ScriptedSubscription {
        fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }

        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        type Error = std::convert::Infallible;
        type TransactionStream =
            std::pin::Pin<Box<dyn futures::Stream<Item = Result<Transaction, Self::Error>> + Send>>;

        async fn subscribe(
            &self,
            _filter: StdHashSet<Category>,
        ) -> Result<(Self::TransactionStream, Box<dyn Subscription>), Self::Error> {
            let rx = self.live.subscribe();
            let stream = tokio_stream::wrappers::BroadcastStream::new(rx)
                .filter_map(|item| async move { item.ok().map(Ok) });
            Ok((
                Box::pin(stream),
                Box::new(ScriptedSubscription {
                    cancelled: AtomicBool::new(false),
                }),
            ))
        }

        async fn replay(&self, _filter: StdHashSet<Category>) -> Result<Self::TransactionStream, Self::Error> {
            Ok(Box::pin(stream::iter(self.snapshot().into_iter().map(Ok))))
        }

        async fn replay_from(
            &self,
            since_timestamp_ms: i64,
            _filter: StdHashSet<Category>,
        ) -> Result<Self::TransactionStream, Self::Error> {
            Ok(Box::pin(stream::iter(
                self.snapshot()
                    .into_iter()
                    .filter(move |t| t.timestamp >= since_timestamp_ms)
                    .map(Ok),
            )))
        }

        async fn replay_stream_range(
            &self,
            stream_id: &StreamId,
            revisions: std::ops::Range<i32>,
        ) -> Result<Self::TransactionStream, Self::Error> {
            let stream_id = stream_id.clone();
            Ok(Box::pin(stream::iter(
                self.snapshot()
                    .into_iter()
                    .filter(move |t| t.stream_id == stream_id && revisions.contains(&t.revision))
                    .map(Ok),
            )))
        }
    }

    /// Shared between `TestConsumer` and the `TestLive` it hands out on
    /// cutover, mirroring how a real durable consumer tracks its own
    /// per-stream cursor across replay so `expected_revision` reflects
    /// what replay already delivered, rather than restarting from zero.
    struct TestState {
        delivered: StdMutex<Vec<(String, i32)>>,
        next_expected: StdMutex<StdHashMap<String, i32>>,
    }

    struct TestLive {
        state: Arc<TestState>,
    }

    #[async_trait]
    impl LiveConsumer for TestLive {
        type Error = anyhow::Error;

        fn expected_revision(&self, stream_id: &StreamId) -> ExpectedRevision {
            let next = self
                .state
                .next_expected
                .lock()
                .unwrap()
                .get(stream_id.as_str())
                .copied()
                .unwrap_or(0);
            ExpectedRevision::Track(next)
        }

        async fn consume_live(&self, transaction: &Transaction) -> Result<(), Self::Error> {
            self.state
                .delivered
                .lock()
                .unwrap()
                .push((transaction.stream_id.to_string(), transaction.revision));
            Ok(())
        }
    }

    struct TestConsumer {
        state: Arc<TestState>,
    }

    #[async_trait]
    impl DurableConsumer for TestConsumer {
        type Error = anyhow::Error;
        type Live = TestLive;

        fn last_timestamp(&self) -> Option<i64> {
            None
        }

        fn category_filter(&self) -> StdHashSet<Category> {
            StdHashSet::new()
        }

        async fn consume_replay(&self, transaction: &Transaction) -> Result<(), Self::Error> {
            self.state
                .delivered
                .lock()
                .unwrap()
                .push((transaction.stream_id.to_string(), transaction.revision));
            self.state
                .next_expected
                .lock()
                .unwrap()
                .insert(transaction.stream_id.to_string(), transaction.revision + 1);
            Ok(())
        }

        fn on_live(&self) -> Self::Live {
            TestLive {
                state: Arc::clone(&self.state),
            }
        }
    }

    fn tx(ts: i64, stream: &str, revision: i32) -> Transaction {
        Transaction::new(ts, Category::new("orders"), StreamId::new(stream), revision, vec![])
    }

    #[tokio::test]
    async fn s5_cutover_race_sees_each_transaction_once() {
        // Journal holds revisions 0..=11 of stream "s". Cold replay already
        // delivers all of them; the bridging replay (whose `since` is
        // derived from the tail of replay minus clock skew) reads the same
        // tail again, and the live feed re-announces the last two -- none
        // of that may produce a second delivery.
        let journal: Vec<Transaction> = (0..=11).map(|r| tx(r as i64, "s", r)).collect();

        let (live_tx, _live_rx) = tokio::sync::broadcast::channel(16);
        let (source, _journal) = ScriptedSource::new(journal, live_tx.clone());
        let state = Arc::new(TestState {
            delivered: StdMutex::new(Vec::new()),
            next_expected: StdMutex::new(StdHashMap::new()),
        });
        let consumer = Arc::new(TestConsumer {
            state: Arc::clone(&state),
        });

        let config = EventStreamConfig::new(8);
        let event_stream = EventStream::new(source, config);

        let subscription = event_stream.resume(consumer).await.unwrap();

        // The subscription is live now; re-announce the tail as the
        // unreliable feed would on redelivery.
        let _ = live_tx.send(tx(10, "s", 10));
        let _ = live_tx.send(tx(11, "s", 11));
        tokio::time::sleep(Duration::from_millis(50)).await;
        subscription.cancel();

        let revisions: Vec<i32> = state
            .delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == "s")
            .map(|(_, r)| *r)
            .collect();

        assert_eq!(revisions, (0..=11).collect::<Vec<i32>>());
    }

    #[tokio::test]
    async fn s6_consumer_failure_during_replay_blocks_cutover() {
        struct FailingOnceConsumer {
            state: Arc<TestState>,
        }

        #[async_trait]
        impl DurableConsumer for FailingOnceConsumer {
            type Error = anyhow::Error;
            type Live = TestLive;

            fn last_timestamp(&self) -> Option<i64> {
                None
            }

            fn category_filter(&self) -> StdHashSet<Category> {
                StdHashSet::new()
            }

            async fn consume_replay(&self, transaction: &Transaction) -> Result<(), Self::Error> {
                if transaction.stream_id.as_str() == "s1" && transaction.revision == 1 {
                    return Err(anyhow::anyhow!("boom"));
                }
                self.state
                    .delivered
                    .lock()
                    .unwrap()
                    .push((transaction.stream_id.to_string(), transaction.revision));
                Ok(())
            }

            fn on_live(&self) -> Self::Live {
                TestLive {
                    state: Arc::clone(&self.state),
                }
            }
        }

        let journal: Vec<Transaction> = (0..3)
            .flat_map(|r| vec![tx(r as i64, "s1", r), tx(r as i64, "s2", r)])
            .collect();
        let (live_tx, _live_rx) = tokio::sync::broadcast::channel(16);
        let (source, _journal) = ScriptedSource::new(journal, live_tx);
        let state = Arc::new(TestState {
            delivered: StdMutex::new(Vec::new()),
            next_expected: StdMutex::new(StdHashMap::new()),
        });
        let consumer = Arc::new(FailingOnceConsumer {
            state: Arc::clone(&state),
        });

        let config = EventStreamConfig::new(8);
        let event_stream = EventStream::new(source, config);

        let err = event_stream.resume(consumer).await.unwrap_err();
        match err {
            CadenceError::StreamsReplayFailure { streams } => {
                assert_eq!(streams, vec![StreamId::new("s1")]);
            }
            other => panic!("expected StreamsReplayFailure, got {other:?}"),
        }
        assert_eq!(event_stream.failed_streams(), vec![StreamId::new("s1")]);
    }

    #[tokio::test]
    async fn s4_scheduled_range_replay_fills_live_gap_and_closes() {
        // Journal starts empty, so cold replay and the bridging replay both
        // see nothing -- every delivery below comes from either the live
        // feed or the scheduled gap replay.
        let (live_tx, _live_rx) = tokio::sync::broadcast::channel(16);
        let (source, journal) = ScriptedSource::new(Vec::new(), live_tx.clone());
        let state = Arc::new(TestState {
            delivered: StdMutex::new(Vec::new()),
            next_expected: StdMutex::new(StdHashMap::new()),
        });
        let consumer = Arc::new(TestConsumer {
            state: Arc::clone(&state),
        });

        let config = EventStreamConfig::new(8).gap_replay_delay_ms(50);
        let event_stream = EventStream::new(source, config);

        let _subscription = event_stream.resume(consumer).await.unwrap();

        let _ = live_tx.send(tx(0, "s", 0));
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Revision 2 never arrives live; this opens a gap on [1, 3).
        let _ = live_tx.send(tx(3, "s", 3));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            event_stream.pending_replay_count(),
            1,
            "gap_detected should have scheduled exactly one range replay"
        );

        // The journal catches up with the missing revisions before the
        // scheduled replay fires.
        push_journal(&journal, tx(1, "s", 1));
        push_journal(&journal, tx(2, "s", 2));

        tokio::time::sleep(Duration::from_millis(80)).await;

        let revisions: Vec<i32> = state
            .delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == "s")
            .map(|(_, r)| *r)
            .collect();
        assert_eq!(revisions, vec![0, 1, 2, 3]);
        assert_eq!(
            event_stream.pending_replay_count(),
            0,
            "PendingReplayTable should be empty once the gap closes"
        );
    }

    #[tokio::test]
    async fn s4_extended_gap_reopens_and_replays_again_after_closing() {
        // Same shape as s4 above, but the stream opens a *second* gap after
        // the first one closes, proving the scheduler doesn't leave a stale
        // `PendingReplayTable` entry behind that would block a later
        // `gap_detected` for the same stream from scheduling a fresh replay.
        let (live_tx, _live_rx) = tokio::sync::broadcast::channel(16);
        let (source, journal) = ScriptedSource::new(Vec::new(), live_tx.clone());
        let state = Arc::new(TestState {
            delivered: StdMutex::new(Vec::new()),
            next_expected: StdMutex::new(StdHashMap::new()),
        });
        let consumer = Arc::new(TestConsumer {
            state: Arc::clone(&state),
        });

        let config = EventStreamConfig::new(8).gap_replay_delay_ms(50);
        let event_stream = EventStream::new(source, config);

        let _subscription = event_stream.resume(consumer).await.unwrap();

        // First gap: [1, 3), closed by a scheduled range replay.
        let _ = live_tx.send(tx(0, "s", 0));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _ = live_tx.send(tx(3, "s", 3));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(event_stream.pending_replay_count(), 1);

        push_journal(&journal, tx(1, "s", 1));
        push_journal(&journal, tx(2, "s", 2));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(event_stream.pending_replay_count(), 0);

        // Second gap on the same stream: [4, 6). If the first gap's entry
        // were never removed from `PendingReplayTable`, this would be
        // silently dropped and no replay would ever be scheduled.
        let _ = live_tx.send(tx(6, "s", 6));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            event_stream.pending_replay_count(),
            1,
            "a closed gap must not block scheduling a later one for the same stream"
        );

        push_journal(&journal, tx(4, "s", 4));
        push_journal(&journal, tx(5, "s", 5));
        tokio::time::sleep(Duration::from_millis(80)).await;

        let revisions: Vec<i32> = state
            .delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == "s")
            .map(|(_, r)| *r)
            .collect();
        assert_eq!(revisions, vec![0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(event_stream.pending_replay_count(), 0);
    }
}
