use thiserror::Error;

use crate::ids::StreamId;

/// Errors surfaced while appending to, or reading from, an [`EventStore`](crate::EventStore).
#[derive(Debug, Error)]
pub enum AppendStreamError<E> {
    #[error(transparent)]
    Error(E),
    /// Another writer inserted at this revision first. The caller should
    /// reread the stream and retry with the next expected revision.
    #[error("duplicate revision for stream {stream_id}: another writer committed first")]
    DuplicateRevision { stream_id: StreamId },
}

/// Errors surfaced by the ordered delivery pipeline itself.
#[derive(Debug, Error)]
pub enum Error {
    #[error("consumer failed on stream {stream_id} revision {revision}: {cause}")]
    ConsumerFailure {
        stream_id: StreamId,
        revision: i32,
        #[source]
        cause: anyhow::Error,
    },

    #[error("replay failed: streams {streams:?} failed during replay and were marked dead")]
    StreamsReplayFailure { streams: Vec<StreamId> },

    #[error("replay exceeded max_replay_consumption_wait")]
    ReplayTimeout,

    #[error("consumer did not acknowledge stream {stream_id} revision {revision} within the timeout")]
    ConsumerHangDetected { stream_id: StreamId, revision: i32 },

    #[error("sequencer buffer for stream {stream_id} exceeded its configured limit of {limit}")]
    BufferOverflow { stream_id: StreamId, limit: usize },

    #[error(transparent)]
    Source(#[from] anyhow::Error),
}
