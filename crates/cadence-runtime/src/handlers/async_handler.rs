//! Hash-partitioned serial executor (spec component C4).
//!
//! Caps concurrent work while never letting two transactions from the same
//! stream run at once. The cap and the per-stream ordering come from the
//! same mechanism -- a fixed pool of serial worker tasks, chosen by
//! `hash(stream_id) % partitions` -- rather than a semaphore plus a lock
//! map, since the handler has no long-lived state to additionally guard.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use cadence::{StreamId, Transaction};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::TransactionHandler;

#[derive(Debug, Error)]
pub enum AsyncHandlerError<E> {
    /// Forwards `Display` only -- `E` is usually `anyhow::Error`, which does
    /// not implement `std::error::Error`.
    #[error("{0}")]
    Inner(E),
    #[error("worker for this transaction's partition has shut down")]
    WorkerGone,
}

struct WorkItem<E> {
    transaction: Transaction,
    respond_to: oneshot::Sender<Result<(), E>>,
}

/// Routes each transaction to one of a fixed number of serial worker
/// tasks by `hash(stream_id) % partitions`. A given stream always lands on
/// the same worker, so as long as callers submit in revision order (which
/// [`SequencedTransactionHandler`](super::SequencedTransactionHandler)
/// guarantees upstream), per-stream order survives the hop through this
/// layer. Different streams spread across the worker pool and run
/// concurrently.
pub struct AsyncTransactionHandler<H: TransactionHandler> {
    senders: Vec<mpsc::Sender<WorkItem<H::Error>>>,
}

impl<H> AsyncTransactionHandler<H>
where
    H: TransactionHandler + 'static,
{
    pub fn new(inner: Arc<H>, partitions: usize) -> Self {
        let partitions = partitions.max(1);
        let mut senders = Vec::with_capacity(partitions);
        for _ in 0..partitions {
            let (tx, rx) = mpsc::channel(64);
            senders.push(tx);
            tokio::spawn(run_worker(Arc::clone(&inner), rx));
        }

        AsyncTransactionHandler { senders }
    }

    fn partition_for(&self, stream_id: &StreamId) -> usize {
        let mut hasher = DefaultHasher::new();
        stream_id.as_str().hash(&mut hasher);
        (hasher.finish() as usize) % self.senders.len()
    }

    /// Enqueues `transaction` onto its partition and returns a completion
    /// handle immediately, without waiting for the worker to process it.
    /// Used by the replay pipeline (C5), which needs to hold a handle per
    /// in-flight transaction rather than await each one inline.
    pub async fn submit(
        &self,
        transaction: Transaction,
    ) -> Result<oneshot::Receiver<Result<(), H::Error>>, AsyncHandlerError<H::Error>> {
        let partition = self.partition_for(&transaction.stream_id);
        let (respond_to, response) = oneshot::channel();
        self.senders[partition]
            .send(WorkItem {
                transaction,
                respond_to,
            })
            .await
            .map_err(|_| AsyncHandlerError::WorkerGone)?;
        Ok(response)
    }
}

async fn run_worker<H>(inner: Arc<H>, mut rx: mpsc::Receiver<WorkItem<H::Error>>)
where
    H: TransactionHandler,
{
    while let Some(item) = rx.recv().await {
        let result = inner.handle(item.transaction).await;
        let _ = item.respond_to.send(result);
    }
}

#[async_trait]
impl<H> TransactionHandler for AsyncTransactionHandler<H>
where
    H: TransactionHandler + 'static,
{
    type Error = AsyncHandlerError<H::Error>;

    async fn handle(&self, transaction: Transaction) -> Result<(), Self::Error> {
        let partition = self.partition_for(&transaction.stream_id);
        let (respond_to, response) = oneshot::channel();
        self.senders[partition]
            .send(WorkItem {
                transaction,
                respond_to,
            })
            .await
            .map_err(|_| AsyncHandlerError::WorkerGone)?;

        response.await.map_err(|_| AsyncHandlerError::WorkerGone)?.map_err(AsyncHandlerError::Inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use cadence::{Category, StreamId};

    use super::*;

    struct RecordingHandler {
        order: Mutex<Vec<(String, i32)>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TransactionHandler for RecordingHandler {
        type Error = std::convert::Infallible;

        async fn handle(&self, transaction: Transaction) -> Result<(), Self::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.order
                .lock()
                .unwrap()
                .push((transaction.stream_id.to_string(), transaction.revision));
            Ok(())
        }
    }

    fn tx(stream: &str, revision: i32) -> Transaction {
        Transaction::new(
            0,
            Category::new("orders"),
            StreamId::new(stream),
            revision,
            vec![],
        )
    }

    #[tokio::test]
    async fn same_stream_preserves_submission_order() {
        let inner = Arc::new(RecordingHandler {
            order: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        });
        let handler = AsyncTransactionHandler::new(Arc::clone(&inner), 4);

        for revision in 0..5 {
            handler.handle(tx("order-1", revision)).await.unwrap();
        }

        assert_eq!(inner.calls.load(Ordering::SeqCst), 5);
        let order = inner.order.lock().unwrap();
        let revisions: Vec<i32> = order.iter().map(|(_, r)| *r).collect();
        assert_eq!(revisions, vec![0, 1, 2, 3, 4]);
    }
}
