//! The live-mode handler chain: `FailSafe` wraps `Sequenced` wraps `Async`,
//! with the `LiveConsumer` at the bottom. Each layer implements
//! [`TransactionHandler`] and is generic over the layer it wraps, so the
//! chain composes without any layer knowing about the others' internals.

mod async_handler;
mod failsafe;
mod sequenced;

pub use async_handler::{AsyncHandlerError, AsyncTransactionHandler};
pub use failsafe::{FailSafeTransactionHandler, FailedStreamTable};
pub use sequenced::{DuplicateObserver, GapObserver, SequencedError, SequencedTransactionHandler};

use async_trait::async_trait;
use cadence::Transaction;

/// One link in the live delivery chain.
#[async_trait]
pub trait TransactionHandler: Send + Sync {
    type Error: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static;

    async fn handle(&self, transaction: Transaction) -> Result<(), Self::Error>;
}
