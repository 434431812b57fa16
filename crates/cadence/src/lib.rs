#![doc = include_str!("../README.md")]

mod consumer;
mod error;
mod event_source;
mod event_store;
mod ids;
mod transaction;

pub use consumer::{DurableConsumer, ExpectedRevision, LiveConsumer};
pub use error::{AppendStreamError, Error};
pub use event_source::{EventSource, Subscription};
pub use event_store::{EventStore, NewTransaction};
pub use ids::{Category, StreamId};
pub use transaction::{Transaction, TransactionData};
