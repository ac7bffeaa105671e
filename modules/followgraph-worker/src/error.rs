use thiserror::Error;

use followgraph_common::{CommonError, EntityId, Relation};
use followgraph_graph::GraphWriteError;
use twitter_client::TwitterError;

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Dedup backend error: {0}")]
    Backend(String),
}

/// Tagged outcome of a failed remote fetch. Callers branch on the variant.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{relation} {entity}: still rate limited after {attempts} attempts")]
    RateLimitExhausted {
        relation: Relation,
        entity: EntityId,
        attempts: u32,
    },

    #[error("{relation} {entity}: not found: {message}")]
    NotFound {
        relation: Relation,
        entity: EntityId,
        message: String,
    },

    #[error("{relation} {entity}: {source}")]
    Remote {
        relation: Relation,
        entity: EntityId,
        source: TwitterError,
    },

    #[error("no API client configured")]
    NotConfigured,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Queue closed: {0}")]
    Closed(String),
}

/// Why a work message could not be completed. Every variant ends in a
/// reject-with-requeue.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Dedup store error: {0}")]
    Dedup(#[from] DedupError),

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Graph write failed: {0}")]
    Graph(#[from] GraphWriteError),
}

impl TaskError {
    /// Whether the entity's dedup record is removed so a redelivery can
    /// expand it from scratch. Only failures after the record was inserted
    /// qualify; rate-limit exhaustion is treated like any other fetch failure.
    pub fn releases_dedup_record(&self) -> bool {
        matches!(self, TaskError::Fetch(_) | TaskError::Graph(_))
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Bad credentials payload: {0}")]
    Credentials(#[from] CommonError),
}
