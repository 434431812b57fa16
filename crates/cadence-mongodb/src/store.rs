//! One MongoDB collection per category, with a unique `(stream_id, revision)`
//! index enforcing the identity invariant from the data model. Live
//! subscription wraps `Collection::watch` -- a MongoDB change stream -- whose
//! driver-level resume-on-disconnect can redeliver an already-seen document,
//! exactly the "unreliable pub/sub" shape the ordered delivery pipeline is
//! built to tolerate.

use std::collections::HashSet;
use std::ops::Range;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use cadence::{AppendStreamError, Category, EventSource, EventStore, NewTransaction, StreamId, Subscription, Transaction};
use dashmap::{DashMap, DashSet};
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use mongodb::bson::doc;
use mongodb::change_stream::options::{ChangeStreamOptions, FullDocumentType};
use mongodb::options::{FindOptions, IndexOptions};
use mongodb::{Client, Collection, Database, IndexModel};
use tracing::debug;

use crate::document::{is_duplicate_key_error, StoredTransaction};
use crate::Error;

type BoxedStream = Pin<Box<dyn Stream<Item = Result<Transaction, Error>> + Send>>;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn sort_key(transaction: &Transaction) -> (i64, String, i32) {
    (transaction.timestamp, transaction.stream_id.to_string(), transaction.revision)
}

/// An `EventStore` and `EventSource` backed by MongoDB, one collection per
/// category.
#[derive(Clone)]
pub struct MongoEventStore {
    database: Database,
    categories: Arc<DashSet<Category>>,
    stream_categories: Arc<DashMap<StreamId, Category>>,
}

impl MongoEventStore {
    pub fn new(database: Database) -> Self {
        MongoEventStore {
            database,
            categories: Arc::new(DashSet::new()),
            stream_categories: Arc::new(DashMap::new()),
        }
    }

    pub async fn connect(uri: &str, database_name: &str) -> Result<Self, Error> {
        let client = Client::with_uri_str(uri).await.map_err(Error::Connect)?;
        Ok(MongoEventStore::new(client.database(database_name)))
    }

    /// Builds the unique `(stream_id, revision)` index for `category`'s
    /// collection and registers it for cross-category replay/subscribe.
    /// Must be called once per category before it is appended to -- this
    /// store does not infer categories it has never been told about.
    pub async fn ensure_category(&self, category: &Category) -> Result<(), Error> {
        let collection: Collection<StoredTransaction> = self.collection(category);
        let index = IndexModel::builder()
            .keys(doc! { "stream_id": 1, "revision": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        collection.create_index(index, None).await.map_err(Error::IndexBuild)?;
        self.categories.insert(category.clone());
        Ok(())
    }

    fn collection(&self, category: &Category) -> Collection<StoredTransaction> {
        self.database.collection(category.as_str())
    }

    fn target_categories(&self, filter: &HashSet<Category>) -> Vec<Category> {
        if filter.is_empty() {
            self.categories.iter().map(|c| c.clone()).collect()
        } else {
            filter.iter().cloned().collect()
        }
    }

    async fn category_for_stream(&self, stream_id: &StreamId) -> Result<Category, Error> {
        if let Some(category) = self.stream_categories.get(stream_id) {
            return Ok(category.clone());
        }

        for category in self.categories.iter().map(|c| c.clone()).collect::<Vec<_>>() {
            let collection = self.collection(&category);
            let found = collection
                .find_one(doc! { "stream_id": stream_id.as_str() }, None)
                .await
                .map_err(Error::Read)?
                .is_some();
            if found {
                self.stream_categories.insert(stream_id.clone(), category.clone());
                return Ok(category);
            }
        }

        Err(Error::UnknownStream {
            stream_id: stream_id.clone(),
        })
    }

    async fn current_revision(&self, collection: &Collection<StoredTransaction>, stream_id: &StreamId) -> Result<i32, Error> {
        let options = FindOptions::builder().sort(doc! { "revision": -1 }).limit(1).build();
        let mut cursor = collection
            .find(doc! { "stream_id": stream_id.as_str() }, options)
            .await
            .map_err(Error::Read)?;
        match cursor.try_next().await.map_err(Error::Read)? {
            Some(latest) => Ok(latest.revision + 1),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl EventStore for MongoEventStore {
    type TransactionStream = BoxedStream;
    type Error = Error;

    async fn append_to_stream(
        &self,
        category: &Category,
        stream_id: &StreamId,
        transaction: NewTransaction,
        expected_revision: Option<i32>,
    ) -> Result<Transaction, AppendStreamError<Error>> {
        let collection = self.collection(category);
        let current_revision = self
            .current_revision(&collection, stream_id)
            .await
            .map_err(AppendStreamError::Error)?;

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

        match collection
            .insert_one(StoredTransaction::from_transaction(&committed), None)
            .await
        {
            Ok(_) => {}
            Err(err) if is_duplicate_key_error(&err) => {
                return Err(AppendStreamError::DuplicateRevision {
                    stream_id: stream_id.clone(),
                });
            }
            Err(err) => return Err(AppendStreamError::Error(Error::Write(err))),
        }

        self.categories.insert(category.clone());
        self.stream_categories.insert(stream_id.clone(), category.clone());
        Ok(committed)
    }

    async fn iter_stream(&self, stream_id: &StreamId, from: i32) -> Result<Self::TransactionStream, Error> {
        let category = self.category_for_stream(stream_id).await?;
        let collection = self.collection(&category);
        let options = FindOptions::builder().sort(doc! { "revision": 1 }).build();
        let cursor = collection
            .find(doc! { "stream_id": stream_id.as_str(), "revision": { "$gte": from } }, options)
            .await
            .map_err(Error::Read)?;

        Ok(Box::pin(cursor.map(move |item| {
            item.map(|doc| doc.into_transaction(category.clone())).map_err(Error::Read)
        })))
    }
}

#[async_trait]
impl EventSource for MongoEventStore {
    type Error = Error;
    type TransactionStream = BoxedStream;

    async fn subscribe(
        &self,
        filter: HashSet<Category>,
    ) -> Result<(Self::TransactionStream, Box<dyn Subscription>), Error> {
        let categories = self.target_categories(&filter);
        let watch_options = ChangeStreamOptions::builder()
            .full_document(Some(FullDocumentType::UpdateLookup))
            .build();

        let mut watches: Vec<BoxedStream> = Vec::with_capacity(categories.len());
        for category in categories {
            let collection = self.collection(&category);
            let change_stream = collection
                .watch(Vec::<mongodb::bson::Document>::new(), watch_options.clone())
                .await
                .map_err(Error::Watch)?;
            let category_for_map = category.clone();
            let mapped = change_stream.map(move |event| {
                let event = event.map_err(Error::Watch)?;
                let doc = event.full_document.ok_or(Error::MissingFullDocument)?;
                Ok(doc.into_transaction(category_for_map.clone()))
            });
            watches.push(Box::pin(mapped));
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let guard = Arc::clone(&cancelled);
        let merged = stream::select_all(watches).take_while(move |_| {
            let guard = Arc::clone(&guard);
            async move { !guard.load(Ordering::SeqCst) }
        });

        Ok((Box::pin(merged), Box::new(MongoSubscription { cancelled })))
    }

    async fn replay(&self, filter: HashSet<Category>) -> Result<Self::TransactionStream, Error> {
        self.replay_filtered(filter, None).await
    }

    async fn replay_from(
        &self,
        since_timestamp_ms: i64,
        filter: HashSet<Category>,
    ) -> Result<Self::TransactionStream, Error> {
        self.replay_filtered(filter, Some(since_timestamp_ms)).await
    }

    async fn replay_stream_range(
        &self,
        stream_id: &StreamId,
        revisions: Range<i32>,
    ) -> Result<Self::TransactionStream, Error> {
        let category = self.category_for_stream(stream_id).await?;
        let collection = self.collection(&category);
        let options = FindOptions::builder().sort(doc! { "revision": 1 }).build();
        let cursor = collection
            .find(
                doc! {
                    "stream_id": stream_id.as_str(),
                    "revision": { "$gte": revisions.start, "$lt": revisions.end },
                },
                options,
            )
            .await
            .map_err(Error::Read)?;

        Ok(Box::pin(cursor.map(move |item| {
            item.map(|doc| doc.into_transaction(category.clone())).map_err(Error::Read)
        })))
    }
}

impl MongoEventStore {
    /// Reads every matching category's collection in full and merge-sorts
    /// the results by `(timestamp, stream_id, revision)` in memory.
    ///
    /// Adequate for the bounded replay windows this pipeline issues (full
    /// replay for a new consumer, or a short tail bridge during cutover);
    /// a category holding an unbounded amount of history would want a true
    /// streaming k-way merge instead of materializing every document first.
    async fn replay_filtered(&self, filter: HashSet<Category>, since_ms: Option<i64>) -> Result<BoxedStream, Error> {
        let categories = self.target_categories(&filter);
        debug!(count = categories.len(), since_ms, "replaying across categories");

        let mut merged: Vec<Transaction> = Vec::new();
        for category in categories {
            let collection = self.collection(&category);
            let filter_doc = match since_ms {
                Some(since) => doc! { "timestamp": { "$gte": since } },
                None => doc! {},
            };
            let mut cursor = collection.find(filter_doc, None).await.map_err(Error::Read)?;
            while let Some(stored) = cursor.try_next().await.map_err(Error::Read)? {
                merged.push(stored.into_transaction(category.clone()));
            }
        }

        merged.sort_by_key(sort_key);
        Ok(Box::pin(stream::iter(merged.into_iter().map(Ok))))
    }
}

struct MongoSubscription {
    cancelled: Arc<AtomicBool>,
}

impl Subscription for MongoSubscription {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
