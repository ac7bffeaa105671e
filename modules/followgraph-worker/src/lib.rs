pub mod control;
pub mod dedup;
pub mod error;
pub mod fetcher;
pub mod queue;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod worker;

pub use control::{Command, ControlChannel, ControlCommand, BROADCAST_TARGET};
pub use dedup::{DedupStore, RedisDedupStore};
pub use error::{ControlError, DedupError, FetchError, QueueError, TaskError};
pub use fetcher::{ApiConnector, FollowGraphApi, RateLimitedFetcher, TwitterConnector};
pub use queue::{
    AmqpQueue, Disposition, QueueTopology, ReplyPublisher, Subscription, TaskHandler, TaskSource,
};
pub use worker::{TaskOutcome, TaskProcessor, Worker};
