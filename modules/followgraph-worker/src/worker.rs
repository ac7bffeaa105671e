use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use followgraph_common::{Credentials, EntityId, Relation, TaskPayload, WorkerStatus};
use followgraph_graph::{expansion_statements, BatchReport, GraphBatchWriter};

use crate::dedup::DedupStore;
use crate::error::{QueueError, TaskError};
use crate::fetcher::{ApiConnector, RateLimitedFetcher};
use crate::queue::{Disposition, Subscription, TaskHandler, TaskSource};

/// What happened to a task that completed without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Private account, skipped.
    Protected,
    /// Already expanded by this or another worker.
    Duplicate,
    Written(BatchReport),
}

/// Expands one entity per work message: dedup gate, fetch both relationship
/// listings, write the graph batch.
pub struct TaskProcessor {
    dedup: Arc<dyn DedupStore>,
    fetcher: RateLimitedFetcher,
    writer: GraphBatchWriter,
}

impl TaskProcessor {
    pub fn new(dedup: Arc<dyn DedupStore>, writer: GraphBatchWriter) -> Self {
        Self {
            dedup,
            fetcher: RateLimitedFetcher::new(),
            writer,
        }
    }

    pub fn fetcher(&self) -> &RateLimitedFetcher {
        &self.fetcher
    }

    pub async fn process(&self, payload: &[u8]) -> Result<TaskOutcome, TaskError> {
        let entity = TaskPayload::decode(payload)?.user;

        if entity.protected {
            debug!(entity_id = %entity.id, "Protected user, skipping");
            return Ok(TaskOutcome::Protected);
        }

        if !self.dedup.add(entity.id).await? {
            debug!(entity_id = %entity.id, "Duplicate user, skipping");
            return Ok(TaskOutcome::Duplicate);
        }

        match self.expand(entity.id).await {
            Ok(report) => Ok(TaskOutcome::Written(report)),
            Err(e) => {
                if e.releases_dedup_record() {
                    if let Err(remove_err) = self.dedup.remove(entity.id).await {
                        warn!(
                            entity_id = %entity.id,
                            error = %remove_err,
                            "Failed to remove dedup record"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    async fn expand(&self, id: EntityId) -> Result<BatchReport, TaskError> {
        let followers = self.fetcher.fetch(Relation::Followers, id).await?;
        let friends = self.fetcher.fetch(Relation::Friends, id).await?;
        info!(
            entity_id = %id,
            followers = followers.len(),
            friends = friends.len(),
            "Fetched relationships"
        );

        let statements = expansion_statements(id, &followers, &friends);
        Ok(self.writer.execute_batch(&statements).await?)
    }
}

#[async_trait]
impl TaskHandler for TaskProcessor {
    async fn handle(&self, payload: &[u8]) -> Disposition {
        match self.process(payload).await {
            Ok(TaskOutcome::Written(report)) => {
                info!(
                    statements = report.statements,
                    chunks = report.chunks,
                    "User expanded"
                );
                Disposition::Ack
            }
            Ok(_) => Disposition::Ack,
            Err(e) => {
                warn!(error = %e, "Task failed, requeueing");
                Disposition::Requeue
            }
        }
    }
}

/// Owns the worker lifecycle: the work subscription, the running flag and
/// the active API client.
///
/// Lifecycle operations are serialized on one lock, and at most one consume
/// loop is ever handling a message: a subscription that was stopped must
/// drain before another is opened. [`Worker::status`] reads the live
/// subscription's liveness flag and never waits on the lock, so a consume
/// loop that dies on its own reports as stopped.
pub struct Worker {
    name: String,
    source: Arc<dyn TaskSource>,
    processor: Arc<TaskProcessor>,
    connector: Arc<dyn ApiConnector>,
    running: ArcSwapOption<AtomicBool>,
    lifecycle: Mutex<Lifecycle>,
}

#[derive(Default)]
struct Lifecycle {
    active: Option<Subscription>,
    /// Cancelled, possibly still finishing its in-flight message.
    draining: Option<Subscription>,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn TaskSource>,
        processor: Arc<TaskProcessor>,
        connector: Arc<dyn ApiConnector>,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            processor,
            connector,
            running: ArcSwapOption::empty(),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe to the work queue. Returns false without doing anything if
    /// already running or if no API client is configured.
    ///
    /// Waits for a previously stopped subscription to finish its in-flight
    /// message first.
    pub async fn start(&self) -> Result<bool, QueueError> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.start_locked(&mut lifecycle).await
    }

    /// Stop taking new work. A message already being handled still
    /// completes in the background. Returns false if not running.
    pub async fn stop(&self) -> Result<bool, QueueError> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.stop_locked(&mut lifecycle).await
    }

    /// Replace the active credentials.
    ///
    /// When running, the subscription is cancelled and its in-flight message
    /// allowed to finish before the new client is installed and the worker
    /// resubscribes. Incomplete credentials clear the client and leave the
    /// worker stopped.
    pub async fn set_credentials(&self, credentials: Credentials) -> Result<(), QueueError> {
        let mut lifecycle = self.lifecycle.lock().await;

        let was_running = self.stop_locked(&mut lifecycle).await?;
        Self::drain(&mut lifecycle).await;

        if credentials.is_complete() {
            self.processor
                .fetcher()
                .configure(Some(self.connector.connect(&credentials)));
            info!(
                worker = self.name.as_str(),
                consumer_key = credentials.consumer_key.as_str(),
                "Credentials updated"
            );
        } else {
            self.processor.fetcher().configure(None);
            warn!(
                worker = self.name.as_str(),
                "Incomplete credentials, API client cleared"
            );
        }

        if was_running {
            self.start_locked(&mut lifecycle).await?;
        }
        Ok(())
    }

    pub fn status(&self) -> WorkerStatus {
        let running = self.running.load();
        WorkerStatus {
            name: self.name.clone(),
            running: (*running)
                .as_ref()
                .is_some_and(|alive| alive.load(Ordering::SeqCst)),
        }
    }

    async fn start_locked(&self, lifecycle: &mut Lifecycle) -> Result<bool, QueueError> {
        if let Some(active) = &lifecycle.active {
            if active.is_alive() {
                debug!(worker = self.name.as_str(), "Already running");
                return Ok(false);
            }
            warn!(
                worker = self.name.as_str(),
                consumer_tag = active.consumer_tag.as_str(),
                "Consume loop had ended, resubscribing"
            );
            lifecycle.active = None;
        }
        if !self.processor.fetcher().is_configured() {
            info!(
                worker = self.name.as_str(),
                "No valid credentials configured, not starting"
            );
            return Ok(false);
        }

        Self::drain(lifecycle).await;

        let handler: Arc<dyn TaskHandler> = self.processor.clone();
        let subscription = self.source.subscribe(handler).await?;
        self.running.store(Some(subscription.liveness()));
        lifecycle.active = Some(subscription);
        info!(worker = self.name.as_str(), "Worker started");
        Ok(true)
    }

    /// Cancel the live subscription and park it as draining. Returns false if
    /// there was none or its loop had already ended.
    async fn stop_locked(&self, lifecycle: &mut Lifecycle) -> Result<bool, QueueError> {
        self.running.store(None);
        let Some(subscription) = lifecycle.active.take() else {
            return Ok(false);
        };
        if !subscription.is_alive() {
            warn!(
                worker = self.name.as_str(),
                consumer_tag = subscription.consumer_tag.as_str(),
                "Consume loop had already ended"
            );
            return Ok(false);
        }

        self.source.unsubscribe(&subscription).await?;
        lifecycle.draining = Some(subscription);
        info!(worker = self.name.as_str(), "Worker stopped");
        Ok(true)
    }

    async fn drain(lifecycle: &mut Lifecycle) {
        if let Some(previous) = lifecycle.draining.take() {
            previous.drained().await;
        }
    }
}
