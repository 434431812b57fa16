//! Bounded hand-off replay pipeline.
//!
//! A producer task drains the source's replay stream, submits each
//! transaction onto the hash-partitioned executor, and sends the
//! resulting completion handle on a bounded channel -- the hand-off queue --
//! so a slow consumer can fall behind the fetch without the whole pipeline
//! buffering unboundedly in memory. A dedicated awaiter polls that channel
//! and applies a per-transaction timeout.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use cadence::{Category, DurableConsumer, EventSource, StreamId, Transaction};
use futures::StreamExt;
use tokio::sync::oneshot;
use tracing::warn;

use crate::config::EventStreamConfig;
use crate::handlers::{AsyncTransactionHandler, FailedStreamTable, TransactionHandler};

/// Where a cold replay should start reading from.
pub enum ReplaySource {
    /// Full replay over the category filter, for a consumer with no
    /// persisted position.
    Full,
    /// Replay from this timestamp (inclusive), already adjusted for clock
    /// skew by the caller.
    Since(i64),
}

/// Adapts [`DurableConsumer::consume_replay`] to [`TransactionHandler`] so it
/// can sit behind the same hash-partitioned executor the live path uses.
struct ReplayConsumerHandler<C> {
    consumer: Arc<C>,
}

#[async_trait]
impl<C> TransactionHandler for ReplayConsumerHandler<C>
where
    C: DurableConsumer + 'static,
{
    type Error = C::Error;

    async fn handle(&self, transaction: Transaction) -> Result<(), Self::Error> {
        self.consumer.consume_replay(&transaction).await
    }
}

struct InFlight<E> {
    stream_id: StreamId,
    revision: i32,
    timestamp: i64,
    handle: oneshot::Receiver<Result<(), E>>,
}

/// Drives a cold replay from `source` through the hash-partitioned executor
/// (C4) to `consumer.consume_replay`, bounded by `config.replay_buffer`
/// transactions in flight.
///
/// Returns the maximum transaction timestamp observed, or `None` if the
/// replay source was empty. A consumer failure excludes that stream from
/// the rest of replay (the same isolation `FailSafeTransactionHandler` gives
/// the live path) rather than aborting outright, but the overall call still
/// fails with [`cadence::Error::StreamsReplayFailure`] once replay
/// completes, since §4.6 forbids going live if *any* replay stream failed.
///
/// `failed` is the `EventStream`'s process-wide `FailedStreamTable` (§3: "…
/// never auto-evicted"), not a throwaway set scoped to this call -- a stream
/// marked failed here stays failed for the lifetime of the `EventStream`,
/// the same as one marked failed by `FailSafeTransactionHandler` during live
/// delivery.
pub async fn run_replay<S, C>(
    event_source: &S,
    consumer: &Arc<C>,
    filter: HashSet<Category>,
    source: ReplaySource,
    config: &EventStreamConfig,
    failed: &FailedStreamTable,
) -> Result<Option<i64>, cadence::Error>
where
    S: EventSource,
    C: DurableConsumer + 'static,
{
    let stream = match source {
        ReplaySource::Full => event_source.replay(filter).await,
        ReplaySource::Since(since) => event_source.replay_from(since, filter).await,
    }
    .map_err(|err| cadence::Error::Source(anyhow::Error::new(err)))?;

    let executor = Arc::new(AsyncTransactionHandler::new(
        Arc::new(ReplayConsumerHandler {
            consumer: Arc::clone(consumer),
        }),
        config.partitions,
    ));

    let (tx, mut rx) = tokio::sync::mpsc::channel(config.replay_buffer.max(1));

    let producer = tokio::spawn({
        let executor = Arc::clone(&executor);
        let failed = failed.clone();
        async move {
            tokio::pin!(stream);
            while let Some(item) = stream.next().await {
                let transaction = match item {
                    Ok(transaction) => transaction,
                    Err(err) => return Err(cadence::Error::Source(anyhow::Error::new(err))),
                };

                if failed.is_failed(&transaction.stream_id) {
                    continue;
                }

                let stream_id = transaction.stream_id.clone();
                let revision = transaction.revision;
                let timestamp = transaction.timestamp;
                let handle = executor
                    .submit(transaction)
                    .await
                    .map_err(|err| cadence::Error::Source(anyhow::Error::new(err)))?;

                let in_flight = InFlight {
                    stream_id,
                    revision,
                    timestamp,
                    handle,
                };
                if tx.send(in_flight).await.is_err() {
                    break;
                }
            }
            Ok(())
        }
    });

    let mut last_timestamp: Option<i64> = None;
    let mut failed_streams: Vec<StreamId> = Vec::new();
    let timeout = config.consumer_timeout();

    let awaiter = async {
        while let Some(item) = rx.recv().await {
            last_timestamp = Some(last_timestamp.map_or(item.timestamp, |ts| ts.max(item.timestamp)));

            match tokio::time::timeout(timeout, item.handle).await {
                Err(_elapsed) => {
                    return Err(cadence::Error::ConsumerHangDetected {
                        stream_id: item.stream_id,
                        revision: item.revision,
                    });
                }
                Ok(Err(_recv_error)) => {
                    return Err(cadence::Error::Source(anyhow::anyhow!(
                        "replay worker for stream {} dropped its completion handle",
                        item.stream_id
                    )));
                }
                Ok(Ok(Err(err))) => {
                    warn!(
                        stream_id = %item.stream_id,
                        revision = item.revision,
                        error = %err,
                        "replay consumption failed, excluding stream from the rest of replay"
                    );
                    if !failed.is_failed(&item.stream_id) {
                        failed.mark_failed(&item.stream_id);
                        failed_streams.push(item.stream_id);
                    }
                }
                Ok(Ok(Ok(()))) => {}
            }
        }
        Ok(())
    };

    let awaiter_result = if let Some(max_wait) = config.max_replay_consumption_wait() {
        match tokio::time::timeout(max_wait, awaiter).await {
            Ok(result) => result,
            Err(_elapsed) => {
                producer.abort();
                return Err(cadence::Error::ReplayTimeout);
            }
        }
    } else {
        awaiter.await
    };

    let producer_result = producer
        .await
        .map_err(|err| cadence::Error::Source(anyhow::anyhow!("replay producer task panicked: {err}")))?;

    awaiter_result?;
    producer_result?;

    if !failed_streams.is_empty() {
        return Err(cadence::Error::StreamsReplayFailure {
            streams: failed_streams,
        });
    }

    Ok(last_timestamp)
}
