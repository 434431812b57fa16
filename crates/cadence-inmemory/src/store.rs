//! `Arc<RwLock<HashMap<...>>>`-backed journal keyed on the category/stream/
//! revision model of `cadence::Transaction`. Live subscription is a
//! `tokio::sync::broadcast` channel fed by `append_to_stream`, exactly the
//! "unreliable, at-least-once" feed the ordered delivery pipeline is built
//! to tolerate -- a slow subscriber that lags past the channel's capacity
//! sees `Lagged` entries silently dropped from its stream here, same as a
//! real pub/sub transport.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use cadence::{
    AppendStreamError, Category, EventSource, EventStore, NewTransaction, StreamId, Subscription,
    Transaction,
};
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::Error;

const DEFAULT_LIVE_BUFFER: usize = 1024;

#[derive(Default)]
struct Inner {
    streams: HashMap<StreamId, Vec<Transaction>>,
    journal: Vec<Transaction>,
}

/// An `EventStore` and `EventSource` backed entirely by process memory.
///
/// Cheap to clone -- every clone shares the same underlying journal and live
/// feed. Useful for tests and for embedders that don't need durability
/// across restarts.
#[derive(Clone)]
pub struct InMemoryEventStore {
    inner: Arc<RwLock<Inner>>,
    live: broadcast::Sender<Transaction>,
    // Keeping a receiver alive means `live.send` never fails with "no
    // receivers" before any real subscriber has shown up.
    _live_rx: Arc<broadcast::Receiver<Transaction>>,
}

impl InMemoryEventStore {
    pub fn new(live_buffer: usize) -> Self {
        let (live, rx) = broadcast::channel(live_buffer.max(1));
        InMemoryEventStore {
            inner: Arc::new(RwLock::new(Inner::default())),
            live,
            _live_rx: Arc::new(rx),
        }
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        InMemoryEventStore::new(DEFAULT_LIVE_BUFFER)
    }
}

struct InMemorySubscription {
    cancelled: Arc<AtomicBool>,
}

impl Subscription for InMemorySubscription {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

type BoxedStream = Pin<Box<dyn Stream<Item = Result<Transaction, Error>> + Send>>;

fn boxed(items: Vec<Transaction>) -> BoxedStream {
    Box::pin(stream::iter(items.into_iter().map(Ok)))
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    type TransactionStream = BoxedStream;
    type Error = Error;

    async fn append_to_stream(
        &self,
        category: &Category,
        stream_id: &StreamId,
        transaction: NewTransaction,
        expected_revision: Option<i32>,
    ) -> Result<Transaction, AppendStreamError<Error>> {
        let committed = {
            let mut inner = self
                .inner
                .write()
                .map_err(|_| AppendStreamError::Error(Error::LockPoisoned))?;

            let current_revision = inner.streams.get(stream_id).map_or(0, Vec::len) as i32;
            if let Some(expected) = expected_revision {
                if expected != current_revision {
                    return Err(AppendStreamError::DuplicateRevision {
                        stream_id: stream_id.clone(),
                    });
                }
            }

            let committed = Transaction::new(
                now_ms(),
                category.clone(),
                stream_id.clone(),
                current_revision,
                transaction.events,
            );
            inner
                .streams
                .entry(stream_id.clone())
                .or_default()
                .push(committed.clone());
            inner.journal.push(committed.clone());
            committed
        };

        // A send failing just means no one is currently subscribed; the
        // journal write above already succeeded and is what matters.
        let _ = self.live.send(committed.clone());
        Ok(committed)
    }

    async fn iter_stream(&self, stream_id: &StreamId, from: i32) -> Result<Self::TransactionStream, Error> {
        let inner = self.inner.read().map_err(|_| Error::LockPoisoned)?;
        let items = inner
            .streams
            .get(stream_id)
            .into_iter()
            .flatten()
            .filter(|t| t.revision >= from)
            .cloned()
            .collect();
        Ok(boxed(items))
    }
}

#[async_trait]
impl EventSource for InMemoryEventStore {
    type Error = Error;
    type TransactionStream = BoxedStream;

    async fn subscribe(
        &self,
        filter: HashSet<Category>,
    ) -> Result<(Self::TransactionStream, Box<dyn Subscription>), Error> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let guard = Arc::clone(&cancelled);
        let rx = self.live.subscribe();

        let stream = BroadcastStream::new(rx)
            .filter_map(|item| async move { item.ok() })
            .take_while(move |_| {
                let guard = Arc::clone(&guard);
                async move { !guard.load(Ordering::SeqCst) }
            })
            .filter(move |transaction| {
                let keep = transaction.category.matches(&filter);
                async move { keep }
            })
            .map(Ok);

        Ok((
            Box::pin(stream),
            Box::new(InMemorySubscription { cancelled }),
        ))
    }

    async fn replay(&self, filter: HashSet<Category>) -> Result<Self::TransactionStream, Error> {
        let inner = self.inner.read().map_err(|_| Error::LockPoisoned)?;
        let items = inner
            .journal
            .iter()
            .filter(|t| t.category.matches(&filter))
            .cloned()
            .collect();
        Ok(boxed(items))
    }

    async fn replay_from(
        &self,
        since_timestamp_ms: i64,
        filter: HashSet<Category>,
    ) -> Result<Self::TransactionStream, Error> {
        let inner = self.inner.read().map_err(|_| Error::LockPoisoned)?;
        let items = inner
            .journal
            .iter()
            .filter(|t| t.timestamp >= since_timestamp_ms && t.category.matches(&filter))
            .cloned()
            .collect();
        Ok(boxed(items))
    }

    async fn replay_stream_range(
        &self,
        stream_id: &StreamId,
        revisions: Range<i32>,
    ) -> Result<Self::TransactionStream, Error> {
        let inner = self.inner.read().map_err(|_| Error::LockPoisoned)?;
        let items = inner
            .streams
            .get(stream_id)
            .into_iter()
            .flatten()
            .filter(|t| revisions.contains(&t.revision))
            .cloned()
            .collect();
        Ok(boxed(items))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt as _;

    use super::*;

    fn events(n: usize) -> Vec<serde_json::Value> {
        (0..n).map(|i| serde_json::json!({ "seq": i })).collect()
    }

    #[tokio::test]
    async fn append_assigns_dense_zero_based_revisions() {
        let store = InMemoryEventStore::default();
        let category = Category::new("orders");
        let stream_id = StreamId::new("order-1");

        let first = store
            .append_to_stream(&category, &stream_id, NewTransaction::new(events(1)), Some(0))
            .await
            .unwrap();
        let second = store
            .append_to_stream(&category, &stream_id, NewTransaction::new(events(1)), Some(1))
            .await
            .unwrap();

        assert_eq!(first.revision, 0);
        assert_eq!(second.revision, 1);
    }

    #[tokio::test]
    async fn append_rejects_mismatched_expected_revision() {
        let store = InMemoryEventStore::default();
        let category = Category::new("orders");
        let stream_id = StreamId::new("order-1");

        store
            .append_to_stream(&category, &stream_id, NewTransaction::new(events(1)), Some(0))
            .await
            .unwrap();

        let err = store
            .append_to_stream(&category, &stream_id, NewTransaction::new(events(1)), Some(0))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AppendStreamError::DuplicateRevision { stream_id: s } if s == StreamId::new("order-1")
        ));
    }

    #[tokio::test]
    async fn iter_stream_returns_revision_order_from_a_floor() {
        let store = InMemoryEventStore::default();
        let category = Category::new("orders");
        let stream_id = StreamId::new("order-1");

        for _ in 0..5 {
            store
                .append_to_stream(&category, &stream_id, NewTransaction::new(events(1)), None)
                .await
                .unwrap();
        }

        let revisions: Vec<i32> = store
            .iter_stream(&stream_id, 2)
            .await
            .unwrap()
            .map(|t| t.unwrap().revision)
            .collect()
            .await;

        assert_eq!(revisions, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn subscribe_sees_appends_made_after_it_started() {
        let store = InMemoryEventStore::default();
        let category = Category::new("orders");
        let stream_id = StreamId::new("order-1");

        let (mut live_stream, subscription) = store.subscribe(HashSet::new()).await.unwrap();

        store
            .append_to_stream(&category, &stream_id, NewTransaction::new(events(1)), None)
            .await
            .unwrap();

        let delivered = tokio::time::timeout(Duration::from_millis(100), live_stream.next())
            .await
            .expect("live append should arrive")
            .unwrap()
            .unwrap();
        assert_eq!(delivered.revision, 0);

        subscription.cancel();
        assert!(subscription.is_cancelled());
    }

    #[tokio::test]
    async fn replay_from_filters_by_timestamp_and_category() {
        let store = InMemoryEventStore::default();
        let orders = Category::new("orders");
        let shipments = Category::new("shipments");

        store
            .append_to_stream(&orders, &StreamId::new("o-1"), NewTransaction::new(events(1)), None)
            .await
            .unwrap();
        let cutoff = now_ms();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store
            .append_to_stream(&orders, &StreamId::new("o-2"), NewTransaction::new(events(1)), None)
            .await
            .unwrap();
        store
            .append_to_stream(&shipments, &StreamId::new("s-1"), NewTransaction::new(events(1)), None)
            .await
            .unwrap();

        let mut filter = HashSet::new();
        filter.insert(orders.clone());

        let stream_ids: Vec<StreamId> = store
            .replay_from(cutoff, filter)
            .await
            .unwrap()
            .map(|t| t.unwrap().stream_id)
            .collect()
            .await;

        assert_eq!(stream_ids, vec![StreamId::new("o-2")]);
    }
}
