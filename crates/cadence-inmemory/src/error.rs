use thiserror::Error;

/// Error enum for [`InMemoryEventStore`](crate::InMemoryEventStore).
#[derive(Debug, Error)]
pub enum Error {
    /// The store's internal lock was poisoned by a panicking holder.
    #[error("in-memory event store lock was poisoned")]
    LockPoisoned,
}
