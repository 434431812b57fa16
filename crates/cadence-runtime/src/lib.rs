//! Ordered, at-least-once delivery pipeline on top of [`cadence::EventSource`].
//!
//! An [`EventStream`] drives a [`cadence::DurableConsumer`] through cold
//! replay and into a live subscription, guaranteeing each stream is
//! delivered gapless and duplicate-free despite sitting on an unreliable
//! at-least-once feed. See [`EventStream::resume`] for the full protocol.

mod config;
mod event_stream;
mod handlers;
mod replay;
mod sequencer;

pub use config::EventStreamConfig;
pub use event_stream::EventStream;
pub use handlers::{
    AsyncHandlerError, AsyncTransactionHandler, DuplicateObserver, FailSafeTransactionHandler,
    FailedStreamTable, GapObserver, SequencedError, SequencedTransactionHandler, TransactionHandler,
};
pub use replay::{run_replay, ReplaySource};
pub use sequencer::{
    DuplicateHandler, DuplicateKind, GapHandler, MonotonicSequencer, NoopHandlers, SequencerError,
};
