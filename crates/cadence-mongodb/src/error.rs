use cadence::StreamId;
use thiserror::Error;

/// Errors surfaced by [`MongoEventStore`](crate::MongoEventStore).
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to connect to mongodb: {0}")]
    Connect(mongodb::error::Error),
    #[error("mongodb write failed: {0}")]
    Write(mongodb::error::Error),
    #[error("mongodb read failed: {0}")]
    Read(mongodb::error::Error),
    #[error("failed to open change stream: {0}")]
    Watch(mongodb::error::Error),
    #[error("failed to build unique index on ({{stream_id, revision}}): {0}")]
    IndexBuild(mongodb::error::Error),
    #[error("change stream event carried no full document")]
    MissingFullDocument,
    #[error("stream {stream_id} is not known to any registered category")]
    UnknownStream { stream_id: StreamId },
}
