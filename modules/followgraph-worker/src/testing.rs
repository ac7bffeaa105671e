//! In-memory doubles for the worker's collaborators.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Notify};

use followgraph_common::{Credentials, EntityId, Relation, WorkerStatus};
use followgraph_graph::{ChunkExecutor, GraphStatement, GraphStoreError};
use twitter_client::{IdsPage, TwitterError};

use crate::dedup::DedupStore;
use crate::error::{DedupError, QueueError};
use crate::fetcher::{ApiConnector, FollowGraphApi};
use crate::queue::{Disposition, ReplyPublisher, Subscription, TaskHandler, TaskSource};

// --- Dedup ---

#[derive(Default)]
pub struct MemoryDedupStore {
    members: Mutex<HashSet<EntityId>>,
    failing: AtomicBool,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_members(ids: impl IntoIterator<Item = EntityId>) -> Self {
        Self {
            members: Mutex::new(ids.into_iter().collect()),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail with a backend error.
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.members.lock().unwrap().contains(&id)
    }

    fn check(&self) -> Result<(), DedupError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DedupError::Backend("dedup store unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn add(&self, id: EntityId) -> Result<bool, DedupError> {
        self.check()?;
        Ok(self.members.lock().unwrap().insert(id))
    }

    async fn remove(&self, id: EntityId) -> Result<(), DedupError> {
        self.check()?;
        self.members.lock().unwrap().remove(&id);
        Ok(())
    }
}

// --- Remote API ---

/// One scripted response from [`MockApi`].
#[derive(Debug, Clone)]
pub enum Scripted {
    /// A page of ids and its `next_cursor`.
    Page(Vec<i64>, i64),
    RateLimited(Duration),
    NotFound,
    ApiError(u16),
    /// Park the request until the gate opens, then answer with the next
    /// scripted response.
    Wait(Arc<Gate>),
}

/// Holds a scripted request in flight until the test releases it.
#[derive(Debug, Default)]
pub struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Resolves once a request is parked at this gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn open(&self) {
        self.release.notify_one();
    }
}

/// Answers `ids_page` from per-(relation, id) scripts. An exhausted script
/// yields an empty final page.
#[derive(Default)]
pub struct MockApi {
    scripts: Mutex<HashMap<(Relation, EntityId), VecDeque<Scripted>>>,
    requests: Mutex<Vec<(Relation, EntityId, i64)>>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, relation: Relation, id: EntityId, response: Scripted) {
        self.scripts
            .lock()
            .unwrap()
            .entry((relation, id))
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self, relation: Relation, id: EntityId) -> usize {
        self.cursors(relation, id).len()
    }

    pub fn total_calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Cursors requested for (relation, id), in order.
    pub fn cursors(&self, relation: Relation, id: EntityId) -> Vec<i64> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, i, _)| *r == relation && *i == id)
            .map(|(_, _, cursor)| *cursor)
            .collect()
    }
}

#[async_trait]
impl FollowGraphApi for MockApi {
    async fn ids_page(
        &self,
        relation: Relation,
        id: EntityId,
        cursor: i64,
    ) -> Result<IdsPage, TwitterError> {
        self.requests.lock().unwrap().push((relation, id, cursor));
        let next = loop {
            let next = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&(relation, id))
                .and_then(|q| q.pop_front());
            match next {
                Some(Scripted::Wait(gate)) => {
                    gate.entered.notify_one();
                    gate.release.notified().await;
                }
                other => break other,
            }
        };

        match next {
            None => Ok(IdsPage {
                ids: Vec::new(),
                next_cursor: 0,
            }),
            Some(Scripted::Page(ids, next_cursor)) => Ok(IdsPage { ids, next_cursor }),
            Some(Scripted::RateLimited(reset_in)) => Err(TwitterError::RateLimited { reset_in }),
            Some(Scripted::NotFound) => Err(TwitterError::NotFound(
                "Sorry, that page does not exist.".into(),
            )),
            Some(Scripted::ApiError(status)) => Err(TwitterError::Api {
                status,
                code: None,
                message: format!("scripted {status}"),
                remaining: None,
            }),
            Some(Scripted::Wait(_)) => unreachable!("gates are consumed above"),
        }
    }
}

/// Hands out a registered [`MockApi`] per `oauth_token`.
#[derive(Default)]
pub struct MockConnector {
    apis: Mutex<HashMap<String, Arc<MockApi>>>,
    connected: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, oauth_token: &str, api: Arc<MockApi>) {
        self.apis
            .lock()
            .unwrap()
            .insert(oauth_token.to_string(), api);
    }

    /// Tokens passed to `connect`, in order.
    pub fn connected(&self) -> Vec<String> {
        self.connected.lock().unwrap().clone()
    }
}

impl ApiConnector for MockConnector {
    fn connect(&self, credentials: &Credentials) -> Box<dyn FollowGraphApi> {
        self.connected
            .lock()
            .unwrap()
            .push(credentials.oauth_token.clone());
        let api = self
            .apis
            .lock()
            .unwrap()
            .entry(credentials.oauth_token.clone())
            .or_default()
            .clone();
        Box::new(api)
    }
}

/// Complete credentials whose `oauth_token` is `token`.
pub fn credentials(token: &str) -> Credentials {
    Credentials {
        consumer_key: "ck".into(),
        consumer_secret: "cs".into(),
        oauth_token: token.into(),
        oauth_token_secret: "ts".into(),
    }
}

// --- Graph ---

/// Records executed chunks. Fails the chunk at `fail_at` (1-based).
#[derive(Default)]
pub struct RecordingExecutor {
    chunks: Mutex<Vec<Vec<GraphStatement>>>,
    attempts: AtomicUsize,
    fail_at: Option<usize>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(chunk: usize) -> Self {
        Self {
            fail_at: Some(chunk),
            ..Self::default()
        }
    }

    /// Statements from every committed chunk, in order.
    pub fn statements(&self) -> Vec<GraphStatement> {
        self.chunks.lock().unwrap().concat()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }
}

#[async_trait]
impl ChunkExecutor for RecordingExecutor {
    async fn execute_chunk(&self, chunk: &[GraphStatement]) -> Result<(), GraphStoreError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_at == Some(attempt) {
            return Err(GraphStoreError {
                code: Some("Neo.DatabaseError.General.UnknownError".into()),
                message: "scripted failure".into(),
            });
        }
        self.chunks.lock().unwrap().push(chunk.to_vec());
        Ok(())
    }
}

// --- Queue ---

/// Work queue with one shared backlog. Each subscription handles one message
/// at a time. Requeued messages are recorded, not redelivered.
pub struct MemoryQueue {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    settled: Arc<Mutex<Vec<(Vec<u8>, Disposition)>>>,
    settled_notify: Arc<Notify>,
    cancels: Mutex<HashMap<String, watch::Sender<bool>>>,
    events: Mutex<Vec<String>>,
    next_tag: AtomicUsize,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            settled: Arc::default(),
            settled_notify: Arc::default(),
            cancels: Mutex::default(),
            events: Mutex::default(),
            next_tag: AtomicUsize::new(0),
        }
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, payload: &[u8]) {
        let _ = self.tx.send(payload.to_vec());
    }

    /// Enqueue `{"user": {"id": id, "protected": protected}}`.
    pub fn push_user(&self, id: i64, protected: bool) {
        let body = serde_json::json!({ "user": { "id": id, "protected": protected } });
        self.push(body.to_string().as_bytes());
    }

    pub fn settled(&self) -> Vec<(Vec<u8>, Disposition)> {
        self.settled.lock().unwrap().clone()
    }

    pub fn dispositions(&self) -> Vec<Disposition> {
        self.settled().into_iter().map(|(_, d)| d).collect()
    }

    /// "subscribe" / "unsubscribe", in call order.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// End every consume loop as a lost consumer would, without an unsubscribe.
    pub fn disconnect(&self) {
        for (_, cancel) in self.cancels.lock().unwrap().drain() {
            let _ = cancel.send(true);
        }
    }

    /// Wait until at least `n` messages have been settled.
    pub async fn wait_settled(&self, n: usize) {
        loop {
            let notified = self.settled_notify.notified();
            if self.settled.lock().unwrap().len() >= n {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl TaskSource for MemoryQueue {
    async fn subscribe(&self, handler: Arc<dyn TaskHandler>) -> Result<Subscription, QueueError> {
        let tag = format!("memory-{}", self.next_tag.fetch_add(1, Ordering::SeqCst));
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        self.cancels.lock().unwrap().insert(tag.clone(), cancel_tx);
        self.events.lock().unwrap().push("subscribe".into());

        let rx = self.rx.clone();
        let settled = self.settled.clone();
        let notify = self.settled_notify.clone();
        let subscription = Subscription::spawn(tag, async move {
            loop {
                let payload = {
                    let mut rx = rx.lock().await;
                    tokio::select! {
                        biased;
                        _ = cancel_rx.changed() => break,
                        msg = rx.recv() => match msg {
                            Some(payload) => payload,
                            None => break,
                        },
                    }
                };
                let disposition = handler.handle(&payload).await;
                settled.lock().unwrap().push((payload, disposition));
                notify.notify_waiters();
            }
        });

        Ok(subscription)
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), QueueError> {
        self.events.lock().unwrap().push("unsubscribe".into());
        let cancel = self
            .cancels
            .lock()
            .unwrap()
            .remove(&subscription.consumer_tag)
            .ok_or_else(|| QueueError::Closed(subscription.consumer_tag.clone()))?;
        let _ = cancel.send(true);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingReplies {
    published: Mutex<Vec<WorkerStatus>>,
}

impl RecordingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<WorkerStatus> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplyPublisher for RecordingReplies {
    async fn publish_status(&self, status: &WorkerStatus) -> Result<(), QueueError> {
        self.published.lock().unwrap().push(status.clone());
        Ok(())
    }
}
