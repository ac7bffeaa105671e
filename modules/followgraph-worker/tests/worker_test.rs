//! Worker lifecycle and message handling against in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use followgraph_common::{EntityId, Relation};
use followgraph_graph::GraphBatchWriter;
use followgraph_worker::testing::{
    credentials, Gate, MemoryDedupStore, MemoryQueue, MockApi, MockConnector,
    RecordingExecutor, Scripted,
};
use followgraph_worker::{Disposition, TaskProcessor, Worker};

struct Harness {
    queue: Arc<MemoryQueue>,
    dedup: Arc<MemoryDedupStore>,
    graph: Arc<RecordingExecutor>,
    connector: Arc<MockConnector>,
    worker: Arc<Worker>,
}

fn harness_with(graph: RecordingExecutor) -> Harness {
    let queue = Arc::new(MemoryQueue::new());
    let dedup = Arc::new(MemoryDedupStore::new());
    let graph = Arc::new(graph);
    let connector = Arc::new(MockConnector::new());
    let processor = Arc::new(TaskProcessor::new(
        dedup.clone(),
        GraphBatchWriter::new(graph.clone()),
    ));
    let worker = Arc::new(Worker::new(
        "follower-fetcher",
        queue.clone(),
        processor,
        connector.clone(),
    ));
    Harness {
        queue,
        dedup,
        graph,
        connector,
        worker,
    }
}

fn harness() -> Harness {
    harness_with(RecordingExecutor::new())
}

/// Registers a fresh API under `token`, installs it and starts the worker.
async fn running(h: &Harness, token: &str) -> Arc<MockApi> {
    let api = Arc::new(MockApi::new());
    h.connector.register(token, api.clone());
    h.worker.set_credentials(credentials(token)).await.unwrap();
    assert!(h.worker.start().await.unwrap());
    api
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached within 1s");
}

/// Parks the followers fetch for `id` until the returned gate opens.
fn hold_followers(api: &MockApi, id: i64, ids: Vec<i64>) -> Arc<Gate> {
    let gate = Gate::new();
    api.script(Relation::Followers, EntityId(id), Scripted::Wait(gate.clone()));
    api.script(Relation::Followers, EntityId(id), Scripted::Page(ids, 0));
    gate
}

#[tokio::test]
async fn start_without_credentials_is_a_noop() {
    let h = harness();

    assert!(!h.worker.start().await.unwrap());
    assert!(!h.worker.status().running);
    assert!(h.queue.events().is_empty());
}

#[tokio::test]
async fn start_twice_subscribes_once() {
    let h = harness();
    running(&h, "a").await;

    assert!(!h.worker.start().await.unwrap());
    assert_eq!(h.queue.events(), vec!["subscribe"]);
}

#[tokio::test]
async fn protected_user_is_acked_without_fetching() {
    let h = harness();
    let api = running(&h, "a").await;

    h.queue.push_user(10, true);
    h.queue.wait_settled(1).await;

    assert_eq!(h.queue.dispositions(), vec![Disposition::Ack]);
    assert_eq!(api.total_calls(), 0);
    assert_eq!(h.graph.chunk_count(), 0);
}

#[tokio::test]
async fn repeated_delivery_does_no_work() {
    let h = harness();
    let api = running(&h, "a").await;
    api.script(Relation::Followers, EntityId(1), Scripted::Page(vec![2], 0));

    h.queue.push_user(1, false);
    h.queue.wait_settled(1).await;
    let calls = api.total_calls();
    h.queue.push_user(1, false);
    h.queue.wait_settled(2).await;

    assert_eq!(h.queue.dispositions(), vec![Disposition::Ack, Disposition::Ack]);
    assert_eq!(api.total_calls(), calls);
    assert_eq!(h.graph.chunk_count(), 1);
}

#[tokio::test]
async fn not_found_requeues_and_releases_dedup_record() {
    let h = harness();
    let api = running(&h, "a").await;
    api.script(Relation::Followers, EntityId(3), Scripted::NotFound);

    h.queue.push_user(3, false);
    h.queue.wait_settled(1).await;

    assert_eq!(h.queue.dispositions(), vec![Disposition::Requeue]);
    assert!(!h.dedup.contains(EntityId(3)));
}

#[tokio::test]
async fn graph_failure_requeues_and_releases_dedup_record() {
    let h = harness_with(RecordingExecutor::failing_at(1));
    running(&h, "a").await;

    h.queue.push_user(4, false);
    h.queue.wait_settled(1).await;

    assert_eq!(h.queue.dispositions(), vec![Disposition::Requeue]);
    assert!(!h.dedup.contains(EntityId(4)));
}

#[tokio::test(start_paused = true)]
async fn rate_limit_exhaustion_requeues_and_releases_dedup_record() {
    let h = harness();
    let api = running(&h, "a").await;
    for _ in 0..6 {
        api.script(
            Relation::Followers,
            EntityId(5),
            Scripted::RateLimited(Duration::from_secs(900)),
        );
    }

    h.queue.push_user(5, false);
    h.queue.wait_settled(1).await;

    assert_eq!(h.queue.dispositions(), vec![Disposition::Requeue]);
    assert_eq!(api.calls(Relation::Followers, EntityId(5)), 6);
    assert!(!h.dedup.contains(EntityId(5)));
}

#[tokio::test]
async fn malformed_message_is_requeued_and_dedup_untouched() {
    let h = harness();
    let api = running(&h, "a").await;

    h.queue.push(b"{\"user\":");
    h.queue.wait_settled(1).await;

    assert_eq!(h.queue.dispositions(), vec![Disposition::Requeue]);
    assert_eq!(api.total_calls(), 0);
}

#[tokio::test]
async fn stop_halts_intake() {
    let h = harness();
    running(&h, "a").await;

    assert!(h.worker.stop().await.unwrap());
    assert!(!h.worker.status().running);
    assert!(!h.worker.stop().await.unwrap());

    h.queue.push_user(1, false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.queue.settled().is_empty());
    assert_eq!(h.queue.events(), vec!["subscribe", "unsubscribe"]);
}

#[tokio::test]
async fn credential_rotation_resubscribes_with_new_client() {
    let h = harness();
    let old_api = running(&h, "a").await;
    let new_api = Arc::new(MockApi::new());
    h.connector.register("b", new_api.clone());

    h.queue.push_user(1, false);
    h.queue.wait_settled(1).await;

    h.worker.set_credentials(credentials("b")).await.unwrap();
    assert!(h.worker.status().running);

    h.queue.push_user(2, false);
    h.queue.wait_settled(2).await;

    assert_eq!(h.queue.events(), vec!["subscribe", "unsubscribe", "subscribe"]);
    assert_eq!(h.connector.connected(), vec!["a", "b"]);
    assert!(old_api.calls(Relation::Followers, EntityId(1)) > 0);
    assert_eq!(old_api.calls(Relation::Followers, EntityId(2)), 0);
    assert!(new_api.calls(Relation::Followers, EntityId(2)) > 0);
}

#[tokio::test]
async fn credential_rotation_while_stopped_stays_stopped() {
    let h = harness();

    h.worker.set_credentials(credentials("a")).await.unwrap();

    assert!(!h.worker.status().running);
    assert!(h.queue.events().is_empty());
    assert!(h.worker.start().await.unwrap());
}

#[tokio::test]
async fn incomplete_credentials_stop_the_worker() {
    let h = harness();
    running(&h, "a").await;

    let mut partial = credentials("b");
    partial.oauth_token_secret.clear();
    h.worker.set_credentials(partial).await.unwrap();

    assert!(!h.worker.status().running);
    assert!(!h.worker.start().await.unwrap());
    assert_eq!(h.connector.connected(), vec!["a"]);
}

#[tokio::test]
async fn lost_consumer_is_reported_stopped_and_restartable() {
    let h = harness();
    running(&h, "a").await;

    h.queue.disconnect();
    eventually(|| !h.worker.status().running).await;

    assert!(h.worker.start().await.unwrap());
    assert!(h.worker.status().running);
    assert_eq!(h.queue.events(), vec!["subscribe", "subscribe"]);

    h.queue.push_user(1, true);
    h.queue.wait_settled(1).await;
    assert_eq!(h.queue.dispositions(), vec![Disposition::Ack]);
}

#[tokio::test]
async fn stop_of_lost_consumer_reports_not_running() {
    let h = harness();
    running(&h, "a").await;

    h.queue.disconnect();
    eventually(|| !h.worker.status().running).await;

    assert!(!h.worker.stop().await.unwrap());
    assert_eq!(h.queue.events(), vec!["subscribe"]);
}

#[tokio::test]
async fn stop_lets_in_flight_message_finish() {
    let h = harness();
    let api = running(&h, "a").await;
    let gate = hold_followers(&api, 1, vec![2]);

    h.queue.push_user(1, false);
    gate.entered().await;

    assert!(h.worker.stop().await.unwrap());
    assert!(!h.worker.status().running);
    assert!(h.queue.settled().is_empty());

    gate.open();
    h.queue.wait_settled(1).await;

    assert_eq!(h.queue.dispositions(), vec![Disposition::Ack]);
    assert_eq!(h.graph.chunk_count(), 1);
    assert!(h.dedup.contains(EntityId(1)));
}

#[tokio::test]
async fn rotation_waits_for_in_flight_message_then_uses_new_client() {
    let h = harness();
    let old_api = running(&h, "a").await;
    let new_api = Arc::new(MockApi::new());
    h.connector.register("b", new_api.clone());
    let gate = hold_followers(&old_api, 1, vec![2]);

    h.queue.push_user(1, false);
    gate.entered().await;

    let worker = h.worker.clone();
    let rotation = tokio::spawn(async move { worker.set_credentials(credentials("b")).await });

    eventually(|| !h.worker.status().running).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!rotation.is_finished());
    assert!(!h.worker.status().running);
    assert!(h.queue.settled().is_empty());
    assert_eq!(h.connector.connected(), vec!["a"]);

    gate.open();
    rotation.await.unwrap().unwrap();

    assert!(h.worker.status().running);
    assert_eq!(h.queue.dispositions(), vec![Disposition::Ack]);
    assert_eq!(h.connector.connected(), vec!["a", "b"]);
    assert_eq!(old_api.calls(Relation::Followers, EntityId(1)), 1);
    assert_eq!(old_api.calls(Relation::Friends, EntityId(1)), 1);
    assert_eq!(new_api.total_calls(), 0);

    h.queue.push_user(2, false);
    h.queue.wait_settled(2).await;

    assert_eq!(new_api.calls(Relation::Followers, EntityId(2)), 1);
    assert_eq!(old_api.calls(Relation::Followers, EntityId(2)), 0);
    assert_eq!(h.queue.events(), vec!["subscribe", "unsubscribe", "subscribe"]);
}

#[tokio::test]
async fn start_after_stop_waits_for_previous_consumer() {
    let h = harness();
    let api = running(&h, "a").await;
    let gate = hold_followers(&api, 1, vec![2]);

    h.queue.push_user(1, false);
    gate.entered().await;
    assert!(h.worker.stop().await.unwrap());

    let worker = h.worker.clone();
    let restart = tokio::spawn(async move { worker.start().await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!restart.is_finished());
    assert_eq!(h.queue.events(), vec!["subscribe", "unsubscribe"]);

    gate.open();
    assert!(restart.await.unwrap().unwrap());

    assert_eq!(h.queue.dispositions(), vec![Disposition::Ack]);
    assert_eq!(h.queue.events(), vec!["subscribe", "unsubscribe", "subscribe"]);
    assert!(h.worker.status().running);
}

#[tokio::test]
async fn aborted_rotation_does_not_block_stop() {
    let h = harness();
    let api = running(&h, "a").await;
    let new_api = Arc::new(MockApi::new());
    h.connector.register("b", new_api.clone());
    let gate = hold_followers(&api, 1, vec![2]);

    h.queue.push_user(1, false);
    gate.entered().await;

    let worker = h.worker.clone();
    let rotation = tokio::spawn(async move { worker.set_credentials(credentials("b")).await });
    eventually(|| !h.worker.status().running).await;

    rotation.abort();
    assert!(rotation.await.unwrap_err().is_cancelled());

    let stopped = tokio::time::timeout(Duration::from_millis(100), h.worker.stop())
        .await
        .expect("stop waited on the aborted rotation");
    assert!(!stopped.unwrap());
    assert_eq!(h.connector.connected(), vec!["a"]);

    gate.open();
    h.queue.wait_settled(1).await;
    assert_eq!(h.queue.dispositions(), vec![Disposition::Ack]);
}
